//! Collaborator traits for the audit log.
//!
//! These define everything the log needs from the outside world:
//!
//! - `RecordStore`: ordered persistent storage of records
//! - `ConfigStore`: versioned storage of signing configurations
//! - `TimeSource`: wall-clock or trusted time
//! - `Scheduler`: periodic "sign now" trigger
//!
//! The sequence queue, configuration manager, validator, and exporter only
//! ever talk to these traits, never to a concrete backend.

use std::time::Duration;

use chrono::{DateTime, Utc};

use tessera_contracts::{error::TesseraResult, record::AuditRecord, signing::SigningConfig};

/// Criteria for querying or deleting records.
///
/// Unset fields do not constrain the result. Results are always ordered by
/// `(node_id, sequence_number)` ascending.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub node_id: Option<String>,
    /// Inclusive lower bound.
    pub from_sequence: Option<u64>,
    /// Exclusive upper bound.
    pub below_sequence: Option<u64>,
    /// Only records with `timestamp <= upto`.
    pub upto: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl RecordFilter {
    pub fn for_node(node_id: impl Into<String>) -> Self {
        Self {
            node_id: Some(node_id.into()),
            ..Self::default()
        }
    }

    pub fn from_sequence(mut self, sequence_number: u64) -> Self {
        self.from_sequence = Some(sequence_number);
        self
    }

    pub fn below_sequence(mut self, sequence_number: u64) -> Self {
        self.below_sequence = Some(sequence_number);
        self
    }

    pub fn upto(mut self, timestamp: DateTime<Utc>) -> Self {
        self.upto = Some(timestamp);
        self
    }

    pub fn limit(mut self, max_results: usize) -> Self {
        self.limit = Some(max_results);
        self
    }

    /// Return true if `record` satisfies every set criterion.
    pub fn matches(&self, record: &AuditRecord) -> bool {
        if let Some(node_id) = &self.node_id {
            if &record.node_id != node_id {
                return false;
            }
        }
        if let Some(from) = self.from_sequence {
            if record.sequence_number < from {
                return false;
            }
        }
        if let Some(below) = self.below_sequence {
            if record.sequence_number >= below {
                return false;
            }
        }
        if let Some(upto) = self.upto {
            if record.timestamp > upto {
                return false;
            }
        }
        true
    }
}

/// Ordered persistent storage of audit records, keyed by
/// `(node_id, sequence_number)`.
///
/// Implementations provide their own transactional isolation for single
/// writes. Reads must fail with `IntegrityCheckFailed` when a row's
/// storage-level checksum does not match its content.
pub trait RecordStore: Send + Sync {
    /// Persist a fully allocated record.
    fn insert(&self, record: &AuditRecord) -> TesseraResult<()>;

    /// Records matching `filter`, ascending by `(node_id, sequence_number)`.
    fn find_ordered(&self, filter: &RecordFilter) -> TesseraResult<Vec<AuditRecord>>;

    /// A single record, read on its own so a corrupt neighbor cannot mask it.
    fn find_by_sequence(&self, node_id: &str, sequence_number: u64)
        -> TesseraResult<Option<AuditRecord>>;

    /// The most recent signed record with `timestamp <= before`.
    fn find_last_signed(
        &self,
        node_id: &str,
        before: DateTime<Utc>,
    ) -> TesseraResult<Option<AuditRecord>>;

    /// Unsigned records with a sequence number above `sequence_number`, ascending.
    fn find_unsigned_after(&self, node_id: &str, sequence_number: u64)
        -> TesseraResult<Vec<AuditRecord>>;

    /// Move the record at `from` to sequence number `to`.
    fn renumber(&self, node_id: &str, from: u64, to: u64) -> TesseraResult<()>;

    /// Delete every record matching `filter`; returns how many were removed.
    fn delete_where(&self, filter: &RecordFilter) -> TesseraResult<usize>;

    /// Every node that has written at least one record, sorted.
    fn node_ids(&self) -> TesseraResult<Vec<String>>;
}

/// Versioned storage of signing configurations. Configs are never deleted.
pub trait ConfigStore: Send + Sync {
    fn insert_config(&self, config: &SigningConfig) -> TesseraResult<()>;

    fn find_config(&self, id: u64) -> TesseraResult<Option<SigningConfig>>;

    /// The config with the highest id, i.e. the current one.
    fn find_latest_config(&self) -> TesseraResult<Option<SigningConfig>>;

    /// Every config version, ascending by id.
    fn list_configs(&self) -> TesseraResult<Vec<SigningConfig>>;
}

/// A timestamp plus whether the clock that produced it is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timestamp {
    pub at: DateTime<Utc>,
    pub synchronized: bool,
}

/// Source of record timestamps.
///
/// Sequence numbers, not timestamps, anchor integrity; an unsynchronized
/// clock is tolerated as long as it does not run backwards.
pub trait TimeSource: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Periodic trigger for forced signing boundaries.
pub trait Scheduler: Send + Sync {
    /// Cancel any running timer and start a new one firing every `interval`.
    fn schedule(&self, interval: Duration);

    /// Stop the running timer, if any.
    fn cancel(&self);
}
