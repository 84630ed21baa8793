//! The chain validator: re-derives every stored signature and checks that
//! sequence numbers are contiguous.
//!
//! Records are read per node, in ascending sequence order, in batches of
//! `batch_size`. For each record:
//!
//! 1. **Sequence**: anything other than `last + 1` is a `SequenceGap`.
//! 2. **Window**: unsigned records accumulate in the window.
//! 3. **Signature**: a signed record is checked against the window using
//!    the config named by its own `config_id`, then starts the next window.
//!
//! A mismatch in the first segment of a node is only a warning: after a
//! delete or a fresh start the predecessors it was signed over are gone.
//!
//! When a batch read fails its checksum, the batch is re-read one row at a
//! time so the corrupt rows can be reported individually.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use tessera_audit::verify_record;
use tessera_config::CryptoToken;
use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    record::AuditRecord,
    report::{IntegrityIssue, IntegrityReport, IssueKind},
};
use tessera_core::traits::{ConfigStore, RecordFilter, RecordStore};

/// Called for every record the validator visits, in visiting order.
pub type RecordVisitor<'a> = dyn FnMut(&AuditRecord) -> TesseraResult<()> + 'a;

/// Walks the stored chain and reports every defect it finds.
pub struct ChainValidator {
    records: Arc<dyn RecordStore>,
    configs: Arc<dyn ConfigStore>,
    batch_size: usize,
}

impl ChainValidator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        configs: Arc<dyn ConfigStore>,
        batch_size: usize,
    ) -> Self {
        Self {
            records,
            configs,
            batch_size: batch_size.max(1),
        }
    }

    /// Verify every record with `timestamp <= upto`.
    ///
    /// # Errors
    ///
    /// Only unrecoverable store errors. Integrity defects are report items.
    pub fn verify(&self, upto: DateTime<Utc>) -> TesseraResult<IntegrityReport> {
        self.walk(upto, &mut |_| Ok(()))
    }

    /// Verify like `verify`, handing each visited record to `visit` as it
    /// goes. An error from `visit` stops the walk and is returned.
    pub fn walk(
        &self,
        upto: DateTime<Utc>,
        visit: &mut RecordVisitor<'_>,
    ) -> TesseraResult<IntegrityReport> {
        let mut pass = Pass {
            upto,
            tokens: TokenCache::new(Arc::clone(&self.configs)),
            report: IntegrityReport::default(),
            visit,
        };

        for node_id in self.records.node_ids()? {
            let mut walk = NodeWalk::new(&node_id);
            self.walk_node(&mut walk, &mut pass)?;
            debug!(node_id = %node_id, visited = walk.visited, "node chain walked");
        }

        let report = pass.report;
        info!(
            verified = report.verified_count,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "integrity verification finished"
        );
        Ok(report)
    }

    fn walk_node(&self, walk: &mut NodeWalk, pass: &mut Pass<'_, '_>) -> TesseraResult<()> {
        let mut next = 0u64;
        loop {
            let filter = RecordFilter::for_node(walk.node_id.clone())
                .from_sequence(next)
                .upto(pass.upto)
                .limit(self.batch_size);

            match self.records.find_ordered(&filter) {
                Ok(batch) => {
                    let Some(last) = batch.last().map(|r| r.sequence_number) else {
                        return Ok(());
                    };
                    for record in &batch {
                        walk.visit(record, pass)?;
                    }
                    next = last + 1;
                }
                Err(TesseraError::IntegrityCheckFailed { .. }) => {
                    let end = next.saturating_add(self.batch_size as u64);
                    if self.walk_rows(walk, next, end, pass)? {
                        return Ok(());
                    }
                    next = end;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Read `from..to` one row at a time. Returns true once a record past
    /// `upto` is reached.
    fn walk_rows(
        &self,
        walk: &mut NodeWalk,
        from: u64,
        to: u64,
        pass: &mut Pass<'_, '_>,
    ) -> TesseraResult<bool> {
        debug!(node_id = %walk.node_id, from, to, "re-reading batch row by row");
        for sequence_number in from..to {
            match self.records.find_by_sequence(&walk.node_id, sequence_number) {
                Ok(Some(record)) if record.timestamp > pass.upto => return Ok(true),
                Ok(Some(record)) => walk.visit(&record, pass)?,
                Ok(None) => {}
                Err(TesseraError::IntegrityCheckFailed { .. }) => {
                    walk.corrupt(sequence_number, &mut pass.report);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }
}

// ── Walk state ────────────────────────────────────────────────────────────────

/// State shared by every node of one walk.
struct Pass<'w, 'v> {
    upto: DateTime<Utc>,
    tokens: TokenCache,
    report: IntegrityReport,
    visit: &'w mut RecordVisitor<'v>,
}

// ── Per-node state ────────────────────────────────────────────────────────────

struct NodeWalk {
    node_id: String,
    last: Option<u64>,
    /// Records since the previous signed record, starting with that record.
    window: Vec<AuditRecord>,
    first_segment: bool,
    /// The current window contains a row that could not be read.
    window_broken: bool,
    visited: usize,
}

impl NodeWalk {
    fn new(node_id: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            last: None,
            window: Vec::new(),
            first_segment: true,
            window_broken: false,
            visited: 0,
        }
    }

    fn visit(&mut self, record: &AuditRecord, pass: &mut Pass<'_, '_>) -> TesseraResult<()> {
        self.check_sequence(record.sequence_number, &mut pass.report);
        self.visited += 1;
        pass.report.verified_count += 1;
        (pass.visit)(record)?;

        if record.is_signed() {
            self.check_signature(record, &mut pass.tokens, &mut pass.report);
            self.window = vec![record.clone()];
            self.first_segment = false;
            self.window_broken = false;
        } else {
            self.window.push(record.clone());
        }
        Ok(())
    }

    fn corrupt(&mut self, sequence_number: u64, report: &mut IntegrityReport) {
        self.check_sequence(sequence_number, report);
        self.window_broken = true;
        push_error(
            report,
            self.issue(
                sequence_number,
                sequence_number,
                IssueKind::CorruptRow,
                "row checksum does not match its content".to_string(),
            ),
        );
    }

    fn check_sequence(&mut self, sequence_number: u64, report: &mut IntegrityReport) {
        if let Some(last) = self.last {
            if sequence_number != last + 1 {
                let reason = if sequence_number <= last {
                    format!("sequence number {} repeated or out of order", sequence_number)
                } else {
                    format!("{} missing record(s)", sequence_number - last - 1)
                };
                push_error(
                    report,
                    self.issue(last, sequence_number, IssueKind::SequenceGap, reason),
                );
            }
        }
        self.last = Some(self.last.map_or(sequence_number, |last| last.max(sequence_number)));
    }

    fn check_signature(
        &self,
        record: &AuditRecord,
        tokens: &mut TokenCache,
        report: &mut IntegrityReport,
    ) {
        let start = self
            .window
            .first()
            .map(|r| r.sequence_number)
            .unwrap_or(record.sequence_number);
        let end = record.sequence_number;

        let Some(config_id) = record.config_id else {
            push_error(
                report,
                self.issue(start, end, IssueKind::UnknownConfig, "signed record has no config id".to_string()),
            );
            return;
        };
        let token = match tokens.get(config_id) {
            Ok(token) => token,
            Err(reason) => {
                push_error(report, self.issue(start, end, IssueKind::UnknownConfig, reason));
                return;
            }
        };

        match verify_record(token, &self.window, record) {
            Ok(true) => {}
            Ok(false) if self.window_broken => push_warning(
                report,
                self.issue(
                    start,
                    end,
                    IssueKind::UnverifiableBoundary,
                    "segment contains a corrupt row".to_string(),
                ),
            ),
            Ok(false) if self.first_segment => push_warning(
                report,
                self.issue(
                    start,
                    end,
                    IssueKind::UnverifiableBoundary,
                    "predecessors of the first signed record are not in the store".to_string(),
                ),
            ),
            Ok(false) => push_error(
                report,
                self.issue(
                    start,
                    end,
                    IssueKind::SignatureMismatch,
                    format!("signature does not match config {}", config_id),
                ),
            ),
            Err(e) => push_error(
                report,
                self.issue(start, end, IssueKind::SignatureMismatch, e.to_string()),
            ),
        }
    }

    fn issue(&self, first: u64, last: u64, kind: IssueKind, reason: String) -> IntegrityIssue {
        IntegrityIssue {
            node_id: self.node_id.clone(),
            first_sequence: first,
            last_sequence: last,
            kind,
            reason,
        }
    }
}

fn push_error(report: &mut IntegrityReport, issue: IntegrityIssue) {
    warn!(
        node_id = %issue.node_id,
        first_sequence = issue.first_sequence,
        last_sequence = issue.last_sequence,
        kind = ?issue.kind,
        reason = %issue.reason,
        "integrity error"
    );
    report.errors.push(issue);
}

fn push_warning(report: &mut IntegrityReport, issue: IntegrityIssue) {
    warn!(
        node_id = %issue.node_id,
        first_sequence = issue.first_sequence,
        last_sequence = issue.last_sequence,
        kind = ?issue.kind,
        reason = %issue.reason,
        "integrity warning"
    );
    report.warnings.push(issue);
}

// ── Historical configs ────────────────────────────────────────────────────────

/// Tokens for historical configs, opened once per walk.
struct TokenCache {
    configs: Arc<dyn ConfigStore>,
    tokens: HashMap<u64, Result<CryptoToken, String>>,
}

impl TokenCache {
    fn new(configs: Arc<dyn ConfigStore>) -> Self {
        Self {
            configs,
            tokens: HashMap::new(),
        }
    }

    fn get(&mut self, config_id: u64) -> Result<&CryptoToken, String> {
        let configs = &self.configs;
        self.tokens
            .entry(config_id)
            .or_insert_with(|| match configs.find_config(config_id) {
                Ok(Some(config)) => CryptoToken::open(&config).map_err(|e| e.to_string()),
                Ok(None) => Err(format!("signing config {} not found", config_id)),
                Err(e) => Err(e.to_string()),
            })
            .as_ref()
            .map_err(Clone::clone)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use parking_lot::Mutex;

    use tessera_audit::{AuditLogger, InMemoryStore};
    use tessera_config::{
        token::generate_ed25519, ConfigurationManager, InitialMode, InitialSigning,
    };
    use tessera_contracts::{
        error::TesseraError,
        record::AuditEvent,
        report::IssueKind,
        signing::SigningConfig,
    };
    use tessera_core::traits::{
        ConfigStore, RecordFilter, RecordStore, Scheduler, TimeSource, Timestamp,
    };

    use super::ChainValidator;

    // ── Helpers ───────────────────────────────────────────────────────────────

    struct TestClock {
        now_ms: Mutex<i64>,
    }

    impl TestClock {
        fn advance(&self, ms: i64) {
            *self.now_ms.lock() += ms;
        }
    }

    impl TimeSource for TestClock {
        fn now(&self) -> Timestamp {
            let mut now = self.now_ms.lock();
            *now += 10;
            Timestamp {
                at: Utc.timestamp_millis_opt(*now).unwrap(),
                synchronized: true,
            }
        }
    }

    struct NoopScheduler;

    impl Scheduler for NoopScheduler {
        fn schedule(&self, _interval: Duration) {}
        fn cancel(&self) {}
    }

    struct Fixture {
        store: Arc<InMemoryStore>,
        clock: Arc<TestClock>,
        manager: Arc<ConfigurationManager>,
    }

    impl Fixture {
        fn new(frequency_ms: u64) -> Self {
            let store = Arc::new(InMemoryStore::new());
            let clock = Arc::new(TestClock {
                now_ms: Mutex::new(1_700_000_000_000),
            });
            let manager = Arc::new(ConfigurationManager::new(
                Arc::clone(&store) as Arc<dyn ConfigStore>,
                Arc::new(NoopScheduler),
                Arc::clone(&clock) as Arc<dyn TimeSource>,
                InitialSigning {
                    mode: InitialMode::Hmac,
                    key_label: "verify-key".to_string(),
                    frequency_ms,
                },
            ));
            Self {
                store,
                clock,
                manager,
            }
        }

        fn logger(&self, node_id: &str) -> AuditLogger {
            AuditLogger::new(
                node_id,
                Arc::clone(&self.store) as Arc<dyn RecordStore>,
                Arc::clone(&self.clock) as Arc<dyn TimeSource>,
                Arc::clone(&self.manager),
            )
        }

        fn write(&self, logger: &AuditLogger, count: usize) {
            for i in 0..count {
                logger
                    .log(AuditEvent::new(format!("EVENT_{}", i), "alice", "svc", "mod"))
                    .unwrap();
            }
        }

        fn validator(&self, batch_size: usize) -> ChainValidator {
            ChainValidator::new(
                Arc::clone(&self.store) as Arc<dyn RecordStore>,
                Arc::clone(&self.store) as Arc<dyn ConfigStore>,
                batch_size,
            )
        }
    }

    fn far_future() -> DateTime<Utc> {
        Utc.timestamp_opt(4_000_000_000, 0).unwrap()
    }

    // ── Clean chains ──────────────────────────────────────────────────────────

    /// Every record signed: no errors and no warnings.
    #[test]
    fn test_clean_chain_sign_every_record() {
        let fx = Fixture::new(0);
        fx.write(&fx.logger("node-a"), 20);

        let report = fx.validator(1000).verify(far_future()).unwrap();
        assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
        assert_eq!(report.verified_count, 20);
    }

    /// Unsigned runs closed by periodic signatures verify across small batches.
    #[test]
    fn test_clean_periodic_chain_small_batches() {
        let fx = Fixture::new(1000);
        let logger = fx.logger("node-a");
        for _ in 0..4 {
            fx.write(&logger, 5);
            fx.clock.advance(1500);
        }
        fx.write(&logger, 1);

        let report = fx.validator(3).verify(far_future()).unwrap();
        assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
        assert!(report.warnings.is_empty());
        assert_eq!(report.verified_count, 21);
    }

    // ── Concurrent aborts ─────────────────────────────────────────────────────

    /// Shared-logger writers with injected storage failures in periodic
    /// mode: aborts renumber persisted rows and window records, and the
    /// resulting chain is gap-free and verifies cleanly.
    #[test]
    fn test_concurrent_aborts_keep_chain_valid() {
        for frequency_ms in [3000, 100] {
            let fx = Arc::new(Fixture::new(frequency_ms));
            let logger = Arc::new(fx.logger("node-a"));
            let written = Arc::new(AtomicUsize::new(0));

            let threads: Vec<_> = (0..16)
                .map(|t| {
                    let fx = Arc::clone(&fx);
                    let logger = Arc::clone(&logger);
                    let written = Arc::clone(&written);
                    thread::spawn(move || {
                        for i in 0..40 {
                            if (t * 40 + i) % 7 == 0 {
                                fx.store.fail_next_inserts(1);
                            }
                            let event = AuditEvent::new("WRITE", format!("user-{}", t), "svc", "mod");
                            match logger.log(event) {
                                Ok(_) => {
                                    written.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(TesseraError::Storage { .. }) => {}
                                Err(e) => panic!("unexpected write error: {}", e),
                            }
                        }
                    })
                })
                .collect();
            for handle in threads {
                handle.join().unwrap();
            }

            let records = fx
                .store
                .find_ordered(&RecordFilter::for_node("node-a"))
                .unwrap();
            let numbers: Vec<u64> = records.iter().map(|r| r.sequence_number).collect();
            let expected: Vec<u64> = (1..=records.len() as u64).collect();
            assert_eq!(numbers, expected, "frequency {}", frequency_ms);
            assert_eq!(records.len(), written.load(Ordering::SeqCst));
            assert!(records.len() < 16 * 40, "no write failed at frequency {}", frequency_ms);
            assert!(records.iter().any(|r| r.is_signed()));

            let report = fx.validator(64).verify(far_future()).unwrap();
            assert!(
                report.is_clean(),
                "frequency {}: unexpected errors: {:?}",
                frequency_ms,
                report.errors
            );
            assert!(report.warnings.is_empty(), "{:?}", report.warnings);
            assert_eq!(report.verified_count, records.len());
        }
    }

    /// Records keep verifying against the config they were signed with.
    #[test]
    fn test_historical_configs_resolved_by_record() {
        let fx = Fixture::new(0);
        let logger = fx.logger("node-a");
        fx.write(&logger, 3);
        fx.manager
            .update_configuration(SigningConfig::new(generate_ed25519("rotated"), 0))
            .unwrap();
        fx.write(&logger, 3);

        let records = fx.store.find_ordered(&RecordFilter::for_node("node-a")).unwrap();
        assert_eq!(records[0].config_id, Some(1));
        assert_eq!(records[5].config_id, Some(2));

        let report = fx.validator(1000).verify(far_future()).unwrap();
        assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
    }

    /// Each node's chain is numbered and verified on its own.
    #[test]
    fn test_nodes_verified_independently() {
        let fx = Fixture::new(0);
        let a = fx.logger("node-a");
        let b = fx.logger("node-b");
        fx.write(&a, 4);
        fx.write(&b, 2);
        fx.write(&a, 1);

        let report = fx.validator(1000).verify(far_future()).unwrap();
        assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
        assert_eq!(report.verified_count, 7);
    }

    #[test]
    fn test_verification_is_idempotent() {
        let fx = Fixture::new(1000);
        let logger = fx.logger("node-a");
        fx.write(&logger, 4);
        fx.store
            .rewrite_row("node-a", 2, |r| r.module = "forged".to_string())
            .unwrap();
        fx.clock.advance(2000);
        fx.write(&logger, 1);

        let validator = fx.validator(2);
        let first = validator.verify(far_future()).unwrap();
        let second = validator.verify(far_future()).unwrap();
        assert_eq!(first, second);
        assert!(!first.is_clean());
    }

    /// Records stamped after `upto` are not visited.
    #[test]
    fn test_upto_bounds_the_walk() {
        let fx = Fixture::new(0);
        let logger = fx.logger("node-a");
        fx.write(&logger, 3);
        let cutoff = fx.clock.now().at;
        fx.write(&logger, 3);

        let report = fx.validator(1000).verify(cutoff).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.verified_count, 3);
    }

    // ── Defects ───────────────────────────────────────────────────────────────

    /// A rewritten unsigned record breaks the signature that covers it.
    #[test]
    fn test_rewritten_record_is_signature_mismatch() {
        let fx = Fixture::new(1000);
        let logger = fx.logger("node-a");
        fx.write(&logger, 4);
        fx.clock.advance(2000);
        fx.write(&logger, 1);

        fx.store
            .rewrite_row("node-a", 3, |r| r.auth_token = "mallory".to_string())
            .unwrap();

        let report = fx.validator(1000).verify(far_future()).unwrap();
        assert_eq!(report.errors.len(), 1);
        let issue = &report.errors[0];
        assert_eq!(issue.kind, IssueKind::SignatureMismatch);
        assert_eq!((issue.first_sequence, issue.last_sequence), (1, 5));
    }

    /// A record missing from the middle of the chain is a gap.
    #[test]
    fn test_missing_record_is_gap() {
        let fx = Fixture::new(0);
        fx.write(&fx.logger("node-a"), 6);
        let removed = fx
            .store
            .delete_where(&RecordFilter::for_node("node-a").from_sequence(4).below_sequence(5))
            .unwrap();
        assert_eq!(removed, 1);

        let report = fx.validator(1000).verify(far_future()).unwrap();
        assert!(report.has_errors_of(&IssueKind::SequenceGap));
        let gap = report
            .errors
            .iter()
            .find(|issue| issue.kind == IssueKind::SequenceGap)
            .unwrap();
        assert_eq!((gap.first_sequence, gap.last_sequence), (3, 5));
    }

    /// A checksum failure is localized to its row; the rest is still read.
    #[test]
    fn test_corrupt_row_localized() {
        let fx = Fixture::new(0);
        fx.write(&fx.logger("node-a"), 8);
        assert!(fx.store.corrupt_row("node-a", 3, |r| r.service = "bitrot".to_string()));

        let report = fx.validator(4).verify(far_future()).unwrap();
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].kind, IssueKind::CorruptRow);
        assert_eq!(report.errors[0].first_sequence, 3);
        assert_eq!(report.verified_count, 7);
        // Record 4 was signed over the unreadable row.
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].kind, IssueKind::UnverifiableBoundary);
    }

    /// After older records are deleted the first signature cannot be
    /// re-derived; that is a warning, not an error.
    #[test]
    fn test_first_segment_downgraded_to_warning() {
        let fx = Fixture::new(0);
        fx.write(&fx.logger("node-a"), 10);
        fx.store
            .delete_where(&RecordFilter::for_node("node-a").below_sequence(5))
            .unwrap();

        let report = fx.validator(1000).verify(far_future()).unwrap();
        assert!(report.is_clean(), "unexpected errors: {:?}", report.errors);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].last_sequence, 5);
        assert_eq!(report.verified_count, 6);
    }

    #[test]
    fn test_unknown_config_reported() {
        let fx = Fixture::new(0);
        fx.write(&fx.logger("node-a"), 3);
        fx.store
            .rewrite_row("node-a", 2, |r| r.config_id = Some(99))
            .unwrap();

        let report = fx.validator(1000).verify(far_future()).unwrap();
        assert!(report.has_errors_of(&IssueKind::UnknownConfig));
    }

    /// The visitor sees every record in order and can stop the walk.
    #[test]
    fn test_walk_visits_in_order() {
        let fx = Fixture::new(0);
        fx.write(&fx.logger("node-a"), 5);

        let mut seen = Vec::new();
        fx.validator(2)
            .walk(far_future(), &mut |record| {
                seen.push(record.sequence_number);
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec![1, 2, 3, 4, 5]);

        let result = fx.validator(2).walk(far_future(), &mut |_| {
            Err(tessera_contracts::error::TesseraError::Export {
                reason: "sink closed".to_string(),
            })
        });
        assert!(result.is_err());
    }
}
