//! The sequence queue: allocation, dependency tracking, and the processed
//! window that feeds signature chains.
//!
//! Every record passes through the queue:
//!
//!   push → [has_processing_dependencies → wait] → [dependencies] → persist → pull
//!                                                                        ↘ abort
//!
//! Two locks guard the shared state, always taken in this order:
//!
//! 1. the **push lock**: the sequence counter, the in-flight set, and the
//!    waiter registrations between in-flight units;
//! 2. the **pull lock**: the processed window and the last signing time.
//!
//! A unit's own record sits behind a third, per-unit lock, taken after
//! either of the above. Persisting a unit holds only that lock, so a
//! concurrent `abort` can never renumber a record halfway through its write.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    record::AuditRecord,
};

use crate::{
    canonical::canonical_bytes,
    latch::Latch,
    traits::{RecordStore, TimeSource},
};

// ── In-flight units ───────────────────────────────────────────────────────────

struct UnitState {
    record: AuditRecord,
    persisted: bool,
}

/// One record's passage through allocation, signing, and persistence.
struct InFlightUnit {
    /// Allocation order. Unlike the sequence number, never renumbered.
    ticket: u64,
    id: Uuid,
    state: Mutex<UnitState>,
    /// Counts the earlier in-flight units this one is waiting for.
    dependencies: Latch,
}

impl InFlightUnit {
    fn sequence_number(&self) -> u64 {
        self.state.lock().record.sequence_number
    }
}

/// The caller's handle on a pushed record.
///
/// Returned by `SequenceQueue::push` and consumed by exactly one of
/// `pull` or `abort`.
pub struct QueueHandle {
    unit: Arc<InFlightUnit>,
}

impl QueueHandle {
    /// The current sequence number. May drop by one for each `abort` of an
    /// earlier unit until this handle's record is signed or pulled.
    pub fn sequence_number(&self) -> u64 {
        self.unit.sequence_number()
    }

    /// A snapshot of the record as it stands now.
    pub fn record(&self) -> AuditRecord {
        self.unit.state.lock().record.clone()
    }

    pub fn set_signature(&self, signature: String) {
        self.unit.state.lock().record.signature = Some(signature);
    }

    /// Number of earlier units this handle is still waiting for.
    pub fn pending_dependencies(&self) -> usize {
        self.unit.dependencies.count()
    }

    /// Block until every dependency registered by
    /// `SequenceQueue::has_processing_dependencies` has been pulled or aborted.
    pub fn wait_for_dependencies(&self) {
        self.unit.dependencies.wait();
    }
}

// ── Shared state ──────────────────────────────────────────────────────────────

struct Drain {
    latch: Arc<Latch>,
    /// Only units allocated up to this ticket count towards the drain.
    upto_ticket: u64,
}

struct PushState {
    last_sequence: u64,
    next_ticket: u64,
    /// In allocation order.
    in_flight: Vec<Arc<InFlightUnit>>,
    /// Unit id → units that wait for it to complete.
    waiters: HashMap<Uuid, Vec<Arc<InFlightUnit>>>,
    drains: Vec<Drain>,
}

impl PushState {
    fn take(&mut self, unit: &Arc<InFlightUnit>) -> bool {
        let before = self.in_flight.len();
        self.in_flight.retain(|other| !Arc::ptr_eq(other, unit));
        self.in_flight.len() != before
    }

    /// Release every unit waiting on `unit`, and every drain that counts it.
    fn complete(&mut self, unit: &Arc<InFlightUnit>) {
        if let Some(waiters) = self.waiters.remove(&unit.id) {
            for waiter in waiters {
                waiter.dependencies.count_down();
            }
        }
        for list in self.waiters.values_mut() {
            list.retain(|waiter| !Arc::ptr_eq(waiter, unit));
        }
        for drain in &self.drains {
            if unit.ticket <= drain.upto_ticket {
                drain.latch.count_down();
            }
        }
        self.drains.retain(|drain| drain.latch.count() > 0);
    }
}

#[derive(Default)]
struct ProcessedWindow {
    /// Persisted records not yet rolled into a later signature.
    records: BTreeMap<u64, AuditRecord>,
    last_signed_at: Option<DateTime<Utc>>,
}

// ── Queue ─────────────────────────────────────────────────────────────────────

/// Per-node allocator of contiguous sequence numbers and builder of
/// signature chains.
///
/// Construct one per node with `SequenceQueue::initialize`, which seeds the
/// counter and the processed window from the store.
pub struct SequenceQueue {
    node_id: String,
    store: Arc<dyn RecordStore>,
    push: Mutex<PushState>,
    pull: Mutex<ProcessedWindow>,
}

impl SequenceQueue {
    /// Build the queue from what the store already holds.
    ///
    /// The counter resumes after the last stored record. The processed
    /// window is seeded with the most recent signed record (the anchor the
    /// next signature chains from) and every unsigned record after it.
    pub fn initialize(
        node_id: impl Into<String>,
        store: Arc<dyn RecordStore>,
        clock: &dyn TimeSource,
    ) -> TesseraResult<Self> {
        let node_id = node_id.into();
        let now = clock.now().at;

        let anchor = store.find_last_signed(&node_id, now)?;
        let anchor_sequence = anchor.as_ref().map(|r| r.sequence_number).unwrap_or(0);
        let tail = store.find_unsigned_after(&node_id, anchor_sequence)?;

        let last_sequence = tail
            .last()
            .map(|r| r.sequence_number)
            .unwrap_or(anchor_sequence);

        let mut window = ProcessedWindow {
            last_signed_at: anchor.as_ref().map(|r| r.timestamp),
            ..ProcessedWindow::default()
        };
        for record in anchor.into_iter().chain(tail) {
            window.records.insert(record.sequence_number, record);
        }

        info!(
            node_id = %node_id,
            last_sequence,
            window = window.records.len(),
            "sequence queue initialized"
        );

        Ok(Self {
            node_id,
            store,
            push: Mutex::new(PushState {
                last_sequence,
                next_ticket: 1,
                in_flight: Vec::new(),
                waiters: HashMap::new(),
                drains: Vec::new(),
            }),
            pull: Mutex::new(window),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// The most recently allocated sequence number.
    pub fn last_sequence_number(&self) -> u64 {
        self.push.lock().last_sequence
    }

    pub fn in_flight_count(&self) -> usize {
        self.push.lock().in_flight.len()
    }

    /// Sequence numbers currently held in the processed window.
    pub fn window_sequence_numbers(&self) -> Vec<u64> {
        self.pull.lock().records.keys().copied().collect()
    }

    /// Allocate the next sequence number for `record` and stamp it.
    ///
    /// Sequence numbers are strictly increasing in push-lock acquisition
    /// order; timestamps are taken under the same lock so they never run
    /// backwards relative to sequence numbers.
    pub fn push(&self, clock: &dyn TimeSource, mut record: AuditRecord) -> QueueHandle {
        let mut state = self.push.lock();

        state.last_sequence += 1;
        let ticket = state.next_ticket;
        state.next_ticket += 1;

        let timestamp = clock.now();
        record.node_id = self.node_id.clone();
        record.sequence_number = state.last_sequence;
        record.timestamp = timestamp.at;

        if !timestamp.synchronized {
            debug!(
                node_id = %self.node_id,
                sequence_number = record.sequence_number,
                "record stamped by an unsynchronized clock"
            );
        }

        let unit = Arc::new(InFlightUnit {
            ticket,
            id: record.id,
            state: Mutex::new(UnitState {
                record,
                persisted: false,
            }),
            dependencies: Latch::new(0),
        });
        state.in_flight.push(Arc::clone(&unit));

        debug!(
            node_id = %self.node_id,
            sequence_number = state.last_sequence,
            in_flight = state.in_flight.len(),
            "sequence number allocated"
        );

        QueueHandle { unit }
    }

    /// Register `handle` as a waiter on every earlier in-flight unit.
    ///
    /// Returns true if any were found; the caller must then call
    /// `QueueHandle::wait_for_dependencies` before building its chain.
    pub fn has_processing_dependencies(&self, handle: &QueueHandle) -> bool {
        let mut guard = self.push.lock();
        let state = &mut *guard;
        let sequence_number = handle.unit.sequence_number();

        let mut found = 0;
        for unit in &state.in_flight {
            if Arc::ptr_eq(unit, &handle.unit) || unit.sequence_number() >= sequence_number {
                continue;
            }
            let waiters = state.waiters.entry(unit.id).or_default();
            if waiters.iter().any(|waiter| Arc::ptr_eq(waiter, &handle.unit)) {
                continue;
            }
            waiters.push(Arc::clone(&handle.unit));
            found += 1;
        }

        if found > 0 {
            handle.unit.dependencies.add(found);
            debug!(
                node_id = %self.node_id,
                sequence_number,
                dependencies = found,
                "record waits for earlier in-flight records"
            );
        }
        found > 0
    }

    /// Take every processed record below `handle`'s sequence number out of
    /// the window, ascending.
    ///
    /// Each record is handed out at most once, so no two signatures cover
    /// the same predecessor.
    pub fn dependencies(&self, handle: &QueueHandle) -> Vec<AuditRecord> {
        let sequence_number = handle.sequence_number();
        let mut window = self.pull.lock();
        let rest = window.records.split_off(&sequence_number);
        let consumed = std::mem::replace(&mut window.records, rest);
        consumed.into_values().collect()
    }

    /// Put records taken by `dependencies` back into the window, for a signer
    /// that failed before it could persist.
    ///
    /// Safe only while the signer is still in flight: no earlier unit is
    /// left to abort, so the returned records cannot have been renumbered.
    pub fn requeue(&self, records: Vec<AuditRecord>) {
        let mut window = self.pull.lock();
        for record in records {
            window.records.insert(record.sequence_number, record);
        }
    }

    /// Like `dependencies`, but returns the concatenated canonical bytes
    /// ready to be prepended to the record's own bytes.
    pub fn dependency_data(&self, handle: &QueueHandle) -> Vec<u8> {
        self.dependencies(handle)
            .iter()
            .flat_map(|record| canonical_bytes(record, true))
            .collect()
    }

    /// Whether `handle`'s timestamp is at least `frequency_ms` after the last
    /// signed record. True when nothing has been signed yet; never true for a
    /// frequency beyond `i64::MAX` once something has been signed.
    pub fn crosses_signing_boundary(&self, handle: &QueueHandle, frequency_ms: u64) -> bool {
        let timestamp = handle.record().timestamp;
        match self.pull.lock().last_signed_at {
            Some(last) => i64::try_from(frequency_ms)
                .is_ok_and(|frequency| (timestamp - last).num_milliseconds() >= frequency),
            None => true,
        }
    }

    /// Run `write` against the handle's record while holding its lock, and
    /// mark the record persisted if it succeeds.
    pub fn persist<F>(&self, handle: &QueueHandle, write: F) -> TesseraResult<()>
    where
        F: FnOnce(&AuditRecord) -> TesseraResult<()>,
    {
        let mut state = handle.unit.state.lock();
        write(&state.record)?;
        state.persisted = true;
        Ok(())
    }

    /// Complete a persisted record: move it into the processed window and
    /// release every unit waiting on it.
    pub fn pull(&self, handle: QueueHandle) {
        let mut state = self.push.lock();
        let mut window = self.pull.lock();

        if !state.take(&handle.unit) {
            warn!(node_id = %self.node_id, "pull of a unit that is not in flight");
            return;
        }

        let record = handle.record();
        if record.is_signed() {
            window.last_signed_at = Some(match window.last_signed_at {
                Some(last) if last > record.timestamp => last,
                _ => record.timestamp,
            });
        }
        debug!(
            node_id = %self.node_id,
            sequence_number = record.sequence_number,
            signed = record.is_signed(),
            "record pulled"
        );
        window.records.insert(record.sequence_number, record);

        state.complete(&handle.unit);
    }

    /// Give back a sequence number whose write failed before commit.
    ///
    /// The counter drops by one and every later record is shifted down by
    /// one so the chain stays gap-free: in-flight units (whether or not they
    /// registered a dependency on this one) and processed records that are
    /// still unsigned. Shifts of already-persisted records are written to
    /// the store in ascending order.
    ///
    /// # Errors
    ///
    /// `Storage`, naming the renumbered range and wrapping the first store
    /// error hit while persisting a shift. The in-memory renumbering is
    /// always completed, so the store keeps a gap the validator will report
    /// inside that range.
    pub fn abort(&self, handle: QueueHandle) -> TesseraResult<()> {
        let mut guard = self.push.lock();
        let state = &mut *guard;
        let mut window = self.pull.lock();

        if !state.take(&handle.unit) {
            warn!(node_id = %self.node_id, "abort of a unit that is not in flight");
            return Ok(());
        }

        let aborted = handle.sequence_number();
        state.last_sequence -= 1;

        let shifted_window: Vec<u64> = window
            .records
            .range(aborted + 1..)
            .filter(|(_, record)| !record.is_signed())
            .map(|(sequence_number, _)| *sequence_number)
            .collect();

        enum Target<'a> {
            Window(u64),
            Unit(&'a Arc<InFlightUnit>),
        }
        let mut targets: Vec<(u64, Target<'_>)> = shifted_window
            .iter()
            .map(|seq| (*seq, Target::Window(*seq)))
            .collect();
        for unit in &state.in_flight {
            let sequence_number = unit.sequence_number();
            if sequence_number > aborted {
                targets.push((sequence_number, Target::Unit(unit)));
            }
        }
        targets.sort_by_key(|(sequence_number, _)| *sequence_number);

        let mut first_error = None;
        let mut remember = |result: TesseraResult<()>| {
            if let Err(e) = result {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        };

        for (sequence_number, target) in &targets {
            let to = sequence_number - 1;
            match target {
                Target::Window(from) => {
                    remember(self.store.renumber(&self.node_id, *from, to));
                    if let Some(mut record) = window.records.remove(from) {
                        record.sequence_number = to;
                        window.records.insert(to, record);
                    }
                }
                Target::Unit(unit) => {
                    let mut unit_state = unit.state.lock();
                    if unit_state.persisted {
                        remember(self.store.renumber(&self.node_id, *sequence_number, to));
                    }
                    unit_state.record.sequence_number = to;
                }
            }
        }

        warn!(
            node_id = %self.node_id,
            sequence_number = aborted,
            renumbered = targets.len(),
            "write aborted, later records renumbered"
        );

        let renumbered = targets
            .first()
            .zip(targets.last())
            .map(|((first, _), (last, _))| (*first, *last));
        drop(targets);
        state.complete(&handle.unit);

        match (first_error, renumbered) {
            (Some(e), Some((first, last))) => Err(TesseraError::Storage {
                reason: format!(
                    "records {}..={} on node '{}' not renumbered after aborting {}: {}",
                    first, last, self.node_id, aborted, e
                ),
            }),
            (Some(e), None) => Err(e),
            (None, _) => Ok(()),
        }
    }

    /// A latch that reaches zero once every currently in-flight unit has
    /// been pulled or aborted.
    pub fn drain_latch(&self) -> Arc<Latch> {
        let mut state = self.push.lock();
        let latch = Arc::new(Latch::new(state.in_flight.len()));
        if !state.in_flight.is_empty() {
            let upto_ticket = state.next_ticket - 1;
            state.drains.push(Drain {
                latch: Arc::clone(&latch),
                upto_ticket,
            });
        }
        latch
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
