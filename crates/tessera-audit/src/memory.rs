//! In-memory implementation of `RecordStore` and `ConfigStore`.
//!
//! `InMemoryStore` is the reference store. Rows live in a `BTreeMap` keyed
//! by `(node_id, sequence_number)` behind a `RwLock`, so ordered range
//! queries come for free.
//!
//! Each row carries a SHA-256 checksum of its serialized record, checked on
//! every read. A row whose content no longer matches its checksum fails the
//! read with `IntegrityCheckFailed`, the way a database with per-row
//! checksums would.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};

use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    record::AuditRecord,
    signing::SigningConfig,
};
use tessera_core::traits::{ConfigStore, RecordFilter, RecordStore};

type RowKey = (String, u64);

struct StoredRow {
    record: AuditRecord,
    checksum: String,
}

impl StoredRow {
    fn new(record: AuditRecord) -> TesseraResult<Self> {
        let checksum = checksum(&record)?;
        Ok(Self { record, checksum })
    }

    fn checked(&self) -> TesseraResult<AuditRecord> {
        if checksum(&self.record)? != self.checksum {
            return Err(TesseraError::IntegrityCheckFailed {
                node_id: self.record.node_id.clone(),
                sequence_number: self.record.sequence_number,
            });
        }
        Ok(self.record.clone())
    }
}

fn checksum(record: &AuditRecord) -> TesseraResult<String> {
    let bytes = serde_json::to_vec(record).map_err(|e| TesseraError::Storage {
        reason: format!("failed to serialize record {}: {}", record.sequence_number, e),
    })?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// A volatile store for records and signing configs.
///
/// Suitable for tests, demos, and embedding; all data is lost on drop.
#[derive(Default)]
pub struct InMemoryStore {
    rows: RwLock<BTreeMap<RowKey, StoredRow>>,
    configs: RwLock<BTreeMap<u64, SigningConfig>>,
    failing_inserts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of stored records across all nodes.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Make the next `n` inserts fail with a storage error.
    pub fn fail_next_inserts(&self, n: usize) {
        self.failing_inserts.store(n, Ordering::SeqCst);
    }

    /// Modify a stored record without updating its checksum, as disk
    /// corruption would. Returns false if there is no such record.
    pub fn corrupt_row(
        &self,
        node_id: &str,
        sequence_number: u64,
        edit: impl FnOnce(&mut AuditRecord),
    ) -> bool {
        match self.rows.write().get_mut(&(node_id.to_string(), sequence_number)) {
            Some(row) => {
                edit(&mut row.record);
                true
            }
            None => false,
        }
    }

    /// Modify a stored record and recompute its checksum, as someone with
    /// write access to the database would. Only the chain signatures can
    /// reveal this.
    pub fn rewrite_row(
        &self,
        node_id: &str,
        sequence_number: u64,
        edit: impl FnOnce(&mut AuditRecord),
    ) -> TesseraResult<bool> {
        let mut rows = self.rows.write();
        match rows.get_mut(&(node_id.to_string(), sequence_number)) {
            Some(row) => {
                edit(&mut row.record);
                row.checksum = checksum(&row.record)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn take_insert_failure(&self) -> bool {
        self.failing_inserts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RecordStore for InMemoryStore {
    fn insert(&self, record: &AuditRecord) -> TesseraResult<()> {
        if self.take_insert_failure() {
            return Err(TesseraError::Storage {
                reason: format!("injected failure inserting record {}", record.sequence_number),
            });
        }

        let key = (record.node_id.clone(), record.sequence_number);
        let mut rows = self.rows.write();
        if rows.contains_key(&key) {
            return Err(TesseraError::Storage {
                reason: format!(
                    "record {} already exists on node '{}'",
                    record.sequence_number, record.node_id
                ),
            });
        }
        rows.insert(key, StoredRow::new(record.clone())?);
        Ok(())
    }

    fn find_ordered(&self, filter: &RecordFilter) -> TesseraResult<Vec<AuditRecord>> {
        let rows = self.rows.read();
        let candidates: Box<dyn Iterator<Item = &StoredRow>> = match &filter.node_id {
            Some(node_id) => {
                let from = filter.from_sequence.unwrap_or(0);
                let range = (node_id.clone(), from)..=(node_id.clone(), u64::MAX);
                Box::new(rows.range(range).map(|(_, row)| row))
            }
            None => Box::new(rows.values()),
        };

        let mut out = Vec::new();
        for row in candidates {
            if filter.limit.is_some_and(|limit| out.len() >= limit) {
                break;
            }
            if filter.matches(&row.record) {
                out.push(row.checked()?);
            }
        }
        Ok(out)
    }

    fn find_by_sequence(
        &self,
        node_id: &str,
        sequence_number: u64,
    ) -> TesseraResult<Option<AuditRecord>> {
        self.rows
            .read()
            .get(&(node_id.to_string(), sequence_number))
            .map(StoredRow::checked)
            .transpose()
    }

    fn find_last_signed(
        &self,
        node_id: &str,
        before: DateTime<Utc>,
    ) -> TesseraResult<Option<AuditRecord>> {
        let rows = self.rows.read();
        let range = (node_id.to_string(), 0)..=(node_id.to_string(), u64::MAX);
        rows.range(range)
            .rev()
            .map(|(_, row)| row)
            .find(|row| row.record.is_signed() && row.record.timestamp <= before)
            .map(StoredRow::checked)
            .transpose()
    }

    fn find_unsigned_after(
        &self,
        node_id: &str,
        sequence_number: u64,
    ) -> TesseraResult<Vec<AuditRecord>> {
        let rows = self.rows.read();
        let start = sequence_number.saturating_add(1);
        let range = (node_id.to_string(), start)..=(node_id.to_string(), u64::MAX);
        rows.range(range)
            .map(|(_, row)| row)
            .filter(|row| !row.record.is_signed())
            .map(StoredRow::checked)
            .collect()
    }

    fn renumber(&self, node_id: &str, from: u64, to: u64) -> TesseraResult<()> {
        let mut rows = self.rows.write();
        let target = (node_id.to_string(), to);
        if rows.contains_key(&target) {
            return Err(TesseraError::Storage {
                reason: format!("cannot renumber {} to {}: target exists", from, to),
            });
        }
        let row = rows
            .remove(&(node_id.to_string(), from))
            .ok_or_else(|| TesseraError::Storage {
                reason: format!("cannot renumber {}: no such record on node '{}'", from, node_id),
            })?;
        let mut record = row.checked()?;
        record.sequence_number = to;
        rows.insert(target, StoredRow::new(record)?);
        Ok(())
    }

    fn delete_where(&self, filter: &RecordFilter) -> TesseraResult<usize> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|_, row| !filter.matches(&row.record));
        Ok(before - rows.len())
    }

    fn node_ids(&self) -> TesseraResult<Vec<String>> {
        let rows = self.rows.read();
        let mut nodes: Vec<String> = rows.keys().map(|(node, _)| node.clone()).collect();
        nodes.dedup();
        Ok(nodes)
    }
}

impl ConfigStore for InMemoryStore {
    fn insert_config(&self, config: &SigningConfig) -> TesseraResult<()> {
        let mut configs = self.configs.write();
        if configs.contains_key(&config.id) {
            return Err(TesseraError::Storage {
                reason: format!("signing config {} already exists", config.id),
            });
        }
        configs.insert(config.id, config.clone());
        Ok(())
    }

    fn find_config(&self, id: u64) -> TesseraResult<Option<SigningConfig>> {
        Ok(self.configs.read().get(&id).cloned())
    }

    fn find_latest_config(&self) -> TesseraResult<Option<SigningConfig>> {
        Ok(self.configs.read().values().next_back().cloned())
    }

    fn list_configs(&self) -> TesseraResult<Vec<SigningConfig>> {
        Ok(self.configs.read().values().cloned().collect())
    }
}
