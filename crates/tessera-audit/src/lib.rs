//! # tessera-audit
//!
//! The write path of the tessera audit log and its reference store.
//!
//! ## Overview
//!
//! `AuditLogger::log` allocates a sequence number under the current signing
//! config, and either persists the record as-is or signs it over every
//! record written since the previous signature. Signed records carry the
//! signature of their predecessor segment, so rewriting any record, or
//! dropping one, breaks a signature that the validator re-derives later.
//!
//! `InMemoryStore` implements both `RecordStore` and `ConfigStore` with
//! per-row SHA-256 checksums.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tessera_audit::{AuditLogger, InMemoryStore};
//! use tessera_contracts::record::AuditEvent;
//!
//! let logger = AuditLogger::new("node-a", store, clock, config_manager);
//! let record = logger.log(AuditEvent::new("LOGIN", "alice", "auth", "web"))?;
//! assert_eq!(record.sequence_number, 1);
//! ```

pub mod chain;
pub mod logger;
pub mod memory;

pub use chain::{sign_segment, verify_record, verify_segment};
pub use logger::AuditLogger;
pub use memory::InMemoryStore;

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;

    use tessera_config::{token::generate_hmac, ConfigurationManager, InitialMode, InitialSigning};
    use tessera_contracts::{
        error::TesseraError,
        record::{event_types, AuditEvent, AuditRecord},
        signing::SigningConfig,
    };
    use tessera_core::traits::{
        ConfigStore, RecordFilter, RecordStore, Scheduler, TimeSource, Timestamp,
    };

    use super::{verify_record, AuditLogger, InMemoryStore};

    // ── Helpers ───────────────────────────────────────────────────────────────

    /// A clock that moves forward `step_ms` on every read, plus manual jumps.
    struct TestClock {
        now_ms: Mutex<i64>,
        step_ms: i64,
    }

    impl TestClock {
        fn new(step_ms: i64) -> Self {
            Self {
                now_ms: Mutex::new(1_700_000_000_000),
                step_ms,
            }
        }

        fn advance(&self, ms: i64) {
            *self.now_ms.lock() += ms;
        }
    }

    impl TimeSource for TestClock {
        fn now(&self) -> Timestamp {
            let mut now = self.now_ms.lock();
            let at = Utc.timestamp_millis_opt(*now).unwrap();
            *now += self.step_ms;
            Timestamp {
                at,
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
        logger: AuditLogger,
    }

    impl Fixture {
        fn new(frequency_ms: u64) -> Self {
            let store = Arc::new(InMemoryStore::new());
            let clock = Arc::new(TestClock::new(10));
            let manager = Arc::new(ConfigurationManager::new(
                Arc::clone(&store) as Arc<dyn ConfigStore>,
                Arc::new(NoopScheduler),
                Arc::clone(&clock) as Arc<dyn TimeSource>,
                InitialSigning {
                    mode: InitialMode::Hmac,
                    key_label: "test-key".to_string(),
                    frequency_ms,
                },
            ));
            let logger = new_logger(&store, &clock, &manager);
            Self {
                store,
                clock,
                manager,
                logger,
            }
        }

        fn stored(&self) -> Vec<AuditRecord> {
            self.store
                .find_ordered(&RecordFilter::for_node("node-a"))
                .unwrap()
        }
    }

    fn new_logger(
        store: &Arc<InMemoryStore>,
        clock: &Arc<TestClock>,
        manager: &Arc<ConfigurationManager>,
    ) -> AuditLogger {
        AuditLogger::new(
            "node-a",
            Arc::clone(store) as Arc<dyn RecordStore>,
            Arc::clone(clock) as Arc<dyn TimeSource>,
            Arc::clone(manager),
        )
    }

    fn event(name: &str) -> AuditEvent {
        AuditEvent::new(name, "alice", "billing", "invoices")
    }

    // ── Write path ────────────────────────────────────────────────────────────

    /// With frequency 0 every record is signed over its single predecessor.
    #[test]
    fn test_sign_every_record() {
        let fx = Fixture::new(0);
        let r1 = fx.logger.log(event("A")).unwrap();
        let r2 = fx.logger.log(event("B")).unwrap();
        let r3 = fx.logger.log(event("C")).unwrap();

        assert_eq!(
            [r1.sequence_number, r2.sequence_number, r3.sequence_number],
            [1, 2, 3]
        );
        assert!(r1.is_signed() && r2.is_signed() && r3.is_signed());
        assert_eq!(r1.config_id, Some(1));

        let active = fx.manager.current_configuration().unwrap();
        assert!(verify_record(&active.token, &[], &r1).unwrap());
        assert!(verify_record(&active.token, &[r1.clone()], &r2).unwrap());
        assert!(verify_record(&active.token, &[r2.clone()], &r3).unwrap());
        assert!(!verify_record(&active.token, &[r1], &r3).unwrap());
        assert_eq!(fx.stored().len(), 3);
    }

    /// In periodic mode only the first record and the first one past the
    /// period are signed; the latter covers every record in between.
    #[test]
    fn test_periodic_signing_covers_window() {
        let fx = Fixture::new(1000);
        let r1 = fx.logger.log(event("A")).unwrap();
        let r2 = fx.logger.log(event("B")).unwrap();
        let r3 = fx.logger.log(event("C")).unwrap();
        assert!(r1.is_signed());
        assert!(!r2.is_signed());
        assert!(!r3.is_signed());

        fx.clock.advance(2000);
        let r4 = fx.logger.log(event("D")).unwrap();
        assert!(r4.is_signed());

        let active = fx.manager.current_configuration().unwrap();
        assert!(verify_record(&active.token, &[r1, r2, r3], &r4).unwrap());
    }

    /// Meta events are signed even inside the signing period.
    #[test]
    fn test_meta_events_always_signed() {
        let fx = Fixture::new(60_000);
        fx.logger.log(event("A")).unwrap();
        let plain = fx.logger.log(event("B")).unwrap();
        let meta = fx
            .logger
            .log(AuditEvent::new(event_types::LOG_MANAGEMENT_CHANGE, "admin", "svc", "mod"))
            .unwrap();

        assert!(!plain.is_signed());
        assert!(meta.is_signed());
    }

    /// `sign_now` writes a system `LOG_SIGN` record that closes the window.
    #[test]
    fn test_sign_now_closes_window() {
        let fx = Fixture::new(60_000);
        let r1 = fx.logger.log(event("A")).unwrap();
        let r2 = fx.logger.log(event("B")).unwrap();

        let forced = fx.logger.sign_now().unwrap();
        assert_eq!(forced.sequence_number, 3);
        assert_eq!(forced.event_type, event_types::LOG_SIGN);
        assert_eq!(forced.auth_token, "system");

        let active = fx.manager.current_configuration().unwrap();
        assert!(verify_record(&active.token, &[r1, r2], &forced).unwrap());
    }

    /// Fifty threads writing concurrently produce 1..=400 with an intact chain.
    #[test]
    fn test_concurrent_writers_contiguous_and_chained() {
        let fx = Arc::new(Fixture::new(0));

        let threads: Vec<_> = (0..50)
            .map(|t| {
                let fx = Arc::clone(&fx);
                thread::spawn(move || {
                    for i in 0..8 {
                        fx.logger.log(event(&format!("T{}-{}", t, i))).unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let records = fx.stored();
        let numbers: Vec<u64> = records.iter().map(|r| r.sequence_number).collect();
        assert_eq!(numbers, (1..=400).collect::<Vec<u64>>());

        let active = fx.manager.current_configuration().unwrap();
        let mut window: Vec<AuditRecord> = Vec::new();
        for record in &records {
            assert!(
                verify_record(&active.token, &window, record).unwrap(),
                "record {} must verify",
                record.sequence_number
            );
            window = vec![record.clone()];
        }
        for pair in records.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    // ── Failures ──────────────────────────────────────────────────────────────

    /// A failed insert gives its number back and leaves the chain intact.
    #[test]
    fn test_storage_failure_reuses_number() {
        let fx = Fixture::new(0);
        let r1 = fx.logger.log(event("A")).unwrap();

        fx.store.fail_next_inserts(1);
        let err = fx.logger.log(event("lost")).unwrap_err();
        assert!(matches!(err, TesseraError::Storage { .. }));

        let r2 = fx.logger.log(event("B")).unwrap();
        assert_eq!(r2.sequence_number, 2);

        let active = fx.manager.current_configuration().unwrap();
        assert!(verify_record(&active.token, &[r1], &r2).unwrap());
        assert_eq!(fx.stored().len(), 2);
    }

    /// A signing failure aborts the write; the next config picks up the
    /// window the failed signer had taken.
    #[test]
    fn test_signing_failure_restores_window() {
        let fx = Fixture::new(0);
        let r1 = fx.logger.log(event("A")).unwrap();

        fx.manager.current_configuration().unwrap().token.close();
        let err = fx.logger.log(event("lost")).unwrap_err();
        assert!(matches!(err, TesseraError::Signing { .. }));
        assert_eq!(fx.stored().len(), 1);

        let next = fx
            .manager
            .update_configuration(SigningConfig::new(generate_hmac("next-key"), 0))
            .unwrap();
        let r2 = fx.logger.log(event("B")).unwrap();
        assert_eq!(r2.sequence_number, 2);
        assert_eq!(r2.config_id, Some(next.id()));
        assert!(verify_record(&next.token, &[r1], &r2).unwrap());
    }

    #[test]
    fn test_disabled_manager_rejects_writes() {
        let fx = Fixture::new(0);
        fx.manager.disable();
        let err = fx.logger.log(event("A")).unwrap_err();
        assert!(matches!(err, TesseraError::SystemDisabled));
        assert!(fx.stored().is_empty());
    }

    // ── Restart ───────────────────────────────────────────────────────────────

    /// A fresh logger over the same store resumes numbering and chains from
    /// the stored anchor and its unsigned tail.
    #[test]
    fn test_restart_resumes_chain() {
        let fx = Fixture::new(1000);
        let r1 = fx.logger.log(event("A")).unwrap();
        let r2 = fx.logger.log(event("B")).unwrap();
        let r3 = fx.logger.log(event("C")).unwrap();

        let restarted = new_logger(&fx.store, &fx.clock, &fx.manager);
        fx.clock.advance(5000);
        let r4 = restarted.log(event("D")).unwrap();
        assert_eq!(r4.sequence_number, 4);
        assert!(r4.is_signed());

        let active = fx.manager.current_configuration().unwrap();
        assert!(verify_record(&active.token, &[r1, r2, r3], &r4).unwrap());

        restarted.discard_queue();
        let r5 = restarted.log(event("E")).unwrap();
        assert_eq!(r5.sequence_number, 5);
    }

    #[test]
    fn test_drain_returns_when_idle() {
        let fx = Fixture::new(0);
        fx.logger.drain();
        fx.logger.log(event("A")).unwrap();
        fx.logger.drain();
        assert_eq!(fx.logger.queue().unwrap().in_flight_count(), 0);
    }

    // ── In-memory store ───────────────────────────────────────────────────────

    fn stored_record(node: &str, sequence_number: u64) -> AuditRecord {
        let mut record = AuditRecord::new(node, event("X"), Some(1));
        record.sequence_number = sequence_number;
        record.timestamp = Utc.timestamp_opt(1_700_000_000 + sequence_number as i64, 0).unwrap();
        record
    }

    /// Editing a row behind the checksum's back fails every read of it.
    #[test]
    fn test_store_detects_corrupt_row() {
        let store = InMemoryStore::new();
        for seq in 1..=3 {
            store.insert(&stored_record("node-a", seq)).unwrap();
        }

        assert!(store.corrupt_row("node-a", 2, |r| r.auth_token = "mallory".to_string()));

        let err = store
            .find_ordered(&RecordFilter::for_node("node-a"))
            .unwrap_err();
        assert!(matches!(
            err,
            TesseraError::IntegrityCheckFailed { sequence_number: 2, .. }
        ));
        assert!(store.find_by_sequence("node-a", 1).unwrap().is_some());
        assert!(store.find_by_sequence("node-a", 2).is_err());
    }

    /// A rewrite that updates the checksum reads back cleanly.
    #[test]
    fn test_store_rewrite_passes_checksum() {
        let store = InMemoryStore::new();
        store.insert(&stored_record("node-a", 1)).unwrap();
        assert!(store
            .rewrite_row("node-a", 1, |r| r.auth_token = "mallory".to_string())
            .unwrap());
        let record = store.find_by_sequence("node-a", 1).unwrap().unwrap();
        assert_eq!(record.auth_token, "mallory");
    }

    #[test]
    fn test_store_rejects_duplicates_and_bad_renumber() {
        let store = InMemoryStore::new();
        store.insert(&stored_record("node-a", 1)).unwrap();
        store.insert(&stored_record("node-a", 2)).unwrap();

        assert!(store.insert(&stored_record("node-a", 1)).is_err());
        assert!(store.renumber("node-a", 2, 1).is_err());
        assert!(store.renumber("node-a", 7, 3).is_err());

        store.renumber("node-a", 2, 3).unwrap();
        let record = store.find_by_sequence("node-a", 3).unwrap().unwrap();
        assert_eq!(record.sequence_number, 3);
        assert!(store.find_by_sequence("node-a", 2).unwrap().is_none());
    }

    #[test]
    fn test_store_queries() {
        let store = InMemoryStore::new();
        for seq in 1..=5 {
            let mut record = stored_record("node-a", seq);
            if seq == 2 || seq == 4 {
                record.signature = Some("sig".to_string());
            }
            store.insert(&record).unwrap();
        }
        store.insert(&stored_record("node-b", 1)).unwrap();

        assert_eq!(store.node_ids().unwrap(), vec!["node-a", "node-b"]);

        let anchor = store
            .find_last_signed("node-a", Utc.timestamp_opt(1_700_000_003, 0).unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(anchor.sequence_number, 2);

        let tail: Vec<u64> = store
            .find_unsigned_after("node-a", 2)
            .unwrap()
            .iter()
            .map(|r| r.sequence_number)
            .collect();
        assert_eq!(tail, vec![3, 5]);

        let page = store
            .find_ordered(&RecordFilter::for_node("node-a").from_sequence(2).limit(2))
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].sequence_number, 2);

        let deleted = store
            .delete_where(&RecordFilter::for_node("node-a").below_sequence(4))
            .unwrap();
        assert_eq!(deleted, 3);
        assert_eq!(store.len(), 3);
    }

    /// Paging one node by cursor starts at the cursor and stays on the node.
    #[test]
    fn test_store_pages_one_node_by_cursor() {
        let store = InMemoryStore::new();
        for node in ["node-0", "node-a", "node-b"] {
            for seq in 1..=7 {
                store.insert(&stored_record(node, seq)).unwrap();
            }
        }
        assert!(store.corrupt_row("node-a", 1, |r| r.module = "edited".to_string()));

        let mut seen = Vec::new();
        let mut cursor = 2;
        loop {
            let page = store
                .find_ordered(&RecordFilter::for_node("node-a").from_sequence(cursor).limit(3))
                .unwrap();
            let Some(last) = page.last() else { break };
            cursor = last.sequence_number + 1;
            assert!(page.iter().all(|r| r.node_id == "node-a"));
            seen.extend(page.iter().map(|r| r.sequence_number));
        }
        assert_eq!(seen, vec![2, 3, 4, 5, 6, 7]);

        assert!(store
            .find_ordered(&RecordFilter::for_node("node-a").from_sequence(8))
            .unwrap()
            .is_empty());
        assert!(store
            .find_ordered(&RecordFilter::for_node("node-c"))
            .unwrap()
            .is_empty());
        let everything = store.find_ordered(&RecordFilter::default().upto(Utc::now()));
        assert!(matches!(everything, Err(TesseraError::IntegrityCheckFailed { .. })));
    }

    #[test]
    fn test_config_store_versions() {
        let store = InMemoryStore::new();
        assert!(store.find_latest_config().unwrap().is_none());

        for id in 1..=2 {
            let mut config = SigningConfig::new(generate_hmac("k"), 0);
            config.id = id;
            store.insert_config(&config).unwrap();
        }
        let mut duplicate = SigningConfig::new(generate_hmac("k"), 0);
        duplicate.id = 2;
        assert!(store.insert_config(&duplicate).is_err());

        assert_eq!(store.find_latest_config().unwrap().unwrap().id, 2);
        assert_eq!(store.list_configs().unwrap().len(), 2);
        assert!(store.find_config(1).unwrap().is_some());
        assert!(store.find_config(9).unwrap().is_none());
    }
}
