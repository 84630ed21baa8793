//! The audit logger: the write path from an `AuditEvent` to a persisted,
//! possibly signed, `AuditRecord`.
//!
//! Every call to `log` runs the same pipeline:
//!
//!   Config → Push → [Wait → Chain → Sign] → Persist → Pull
//!                                                   ↘ Abort
//!
//! The config read lock is held only across the first two steps, so a
//! config swap can never land between choosing a config and allocating a
//! sequence number under it. Waiting, signing, and persisting run without
//! it.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use tessera_config::{ActiveConfig, ConfigurationManager};
use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    record::{event_types, AuditEvent, AuditRecord},
    signing::SigningConfig,
};
use tessera_core::{
    canonical::chain_input,
    traits::{RecordStore, TimeSource},
    QueueHandle, SequenceQueue,
};

use crate::chain::sign_segment;

/// Auth token, service, and module stamped on scheduler-forced signatures.
pub const SYSTEM_AUTH_TOKEN: &str = "system";
pub const SYSTEM_SERVICE: &str = "tessera";
pub const SCHEDULER_MODULE: &str = "scheduler";

/// Writes audit events for one node.
///
/// The sequence queue is built lazily from the store on the first write and
/// rebuilt after `discard_queue`.
pub struct AuditLogger {
    node_id: String,
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn TimeSource>,
    config: Arc<ConfigurationManager>,
    queue: RwLock<Option<Arc<SequenceQueue>>>,
}

impl AuditLogger {
    pub fn new(
        node_id: impl Into<String>,
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn TimeSource>,
        config: Arc<ConfigurationManager>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            store,
            clock,
            config,
            queue: RwLock::new(None),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Record `event` and return the record as persisted.
    ///
    /// # Errors
    ///
    /// `SystemDisabled` while a reset is in progress. Signing and storage
    /// errors abort the write: its sequence number is given back and the
    /// error is returned.
    pub fn log(&self, event: AuditEvent) -> TesseraResult<AuditRecord> {
        // ── Steps 1-2: pick the config and allocate under it ────────────────
        let (queue, handle, active) = self.config.with_current(|active| {
            let queue = self.queue()?;
            let record = AuditRecord::new(self.node_id.clone(), event, Some(active.id()));
            let handle = queue.push(self.clock.as_ref(), record);
            Ok::<_, TesseraError>((queue, handle, Arc::clone(active)))
        })??;

        // ── Steps 3-6: sign if needed, persist, release ──────────────────────
        match self.sign_and_persist(&queue, &handle, &active) {
            Ok(()) => {
                let record = handle.record();
                queue.pull(handle);
                debug!(
                    node_id = %self.node_id,
                    sequence_number = record.sequence_number,
                    event_type = %record.event_type,
                    signed = record.is_signed(),
                    "audit record written"
                );
                Ok(record)
            }
            Err(e) => {
                let sequence_number = handle.sequence_number();
                warn!(
                    node_id = %self.node_id,
                    sequence_number,
                    error = %e,
                    "audit write failed, aborting"
                );
                if let Err(abort_error) = queue.abort(handle) {
                    // The store now has a gap the validator will report.
                    warn!(
                        node_id = %self.node_id,
                        sequence_number,
                        error = %abort_error,
                        "renumbering after abort failed"
                    );
                }
                Err(e)
            }
        }
    }

    /// Force a signature now by logging a `LOG_SIGN` record.
    ///
    /// Called by the periodic scheduler; also safe to call by hand.
    pub fn sign_now(&self) -> TesseraResult<AuditRecord> {
        let record = self.log(AuditEvent::new(
            event_types::LOG_SIGN,
            SYSTEM_AUTH_TOKEN,
            SYSTEM_SERVICE,
            SCHEDULER_MODULE,
        ))?;
        info!(
            node_id = %self.node_id,
            sequence_number = record.sequence_number,
            "forced signature written"
        );
        Ok(record)
    }

    /// The node's sequence queue, initialized from the store on first use.
    pub fn queue(&self) -> TesseraResult<Arc<SequenceQueue>> {
        if let Some(queue) = self.queue.read().as_ref() {
            return Ok(Arc::clone(queue));
        }

        let mut slot = self.queue.write();
        if let Some(queue) = slot.as_ref() {
            return Ok(Arc::clone(queue));
        }
        let queue = Arc::new(SequenceQueue::initialize(
            self.node_id.clone(),
            Arc::clone(&self.store),
            self.clock.as_ref(),
        )?);
        *slot = Some(Arc::clone(&queue));
        Ok(queue)
    }

    /// Block until every write currently in flight has completed or aborted.
    pub fn drain(&self) {
        let queue = self.queue.read().as_ref().map(Arc::clone);
        if let Some(queue) = queue {
            let latch = queue.drain_latch();
            if latch.count() > 0 {
                info!(node_id = %self.node_id, in_flight = latch.count(), "draining in-flight writes");
            }
            latch.wait();
        }
    }

    /// Forget the sequence queue. The next write rebuilds it from the store.
    pub fn discard_queue(&self) {
        if self.queue.write().take().is_some() {
            debug!(node_id = %self.node_id, "sequence queue discarded");
        }
    }

    fn sign_and_persist(
        &self,
        queue: &SequenceQueue,
        handle: &QueueHandle,
        active: &ActiveConfig,
    ) -> TesseraResult<()> {
        if !will_be_signed(queue, handle, &active.config) {
            return queue.persist(handle, |record| self.store.insert(record));
        }

        // ── Step 3: wait for every earlier in-flight record ──────────────────
        if queue.has_processing_dependencies(handle) {
            handle.wait_for_dependencies();
        }

        // ── Steps 4-5: chain the window and sign ─────────────────────────────
        let predecessors = queue.dependencies(handle);
        let result = sign_segment(&active.token, &chain_input(&predecessors, &handle.record()))
            .and_then(|signature| {
                handle.set_signature(signature);
                queue.persist(handle, |record| self.store.insert(record))
            });

        if result.is_err() {
            queue.requeue(predecessors);
        } else {
            debug!(
                node_id = %self.node_id,
                sequence_number = handle.sequence_number(),
                chained = predecessors.len(),
                config_id = active.id(),
                "record signed"
            );
        }
        result
    }
}

/// A record is signed if it is a meta event, if every record is signed, or
/// if the signing period has elapsed since the last signature.
fn will_be_signed(queue: &SequenceQueue, handle: &QueueHandle, config: &SigningConfig) -> bool {
    if config.signs_every_record() {
        return true;
    }
    let record = handle.record();
    record.is_meta_event() || queue.crosses_signing_boundary(handle, config.frequency_ms)
}
