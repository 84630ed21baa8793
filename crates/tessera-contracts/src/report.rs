//! Integrity-verification and export results.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What kind of chain defect an issue describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// `first_sequence` was followed by `last_sequence` with numbers missing.
    SequenceGap,
    /// The stored signature does not match the re-derived one.
    SignatureMismatch,
    /// A signature could not be checked because its predecessors are not in
    /// the store (first segment after a reset or a delete).
    UnverifiableBoundary,
    /// The storage-level checksum of the row does not match its content.
    CorruptRow,
    /// The record references a signing config that cannot be resolved.
    UnknownConfig,
}

/// One defect, spanning `first_sequence..=last_sequence` on `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub node_id: String,
    pub first_sequence: u64,
    pub last_sequence: u64,
    pub kind: IssueKind,
    pub reason: String,
}

/// The outcome of walking the chain.
///
/// Errors are integrity violations; warnings are boundaries that could not
/// be verified but are not evidence of tampering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub errors: Vec<IntegrityIssue>,
    pub warnings: Vec<IntegrityIssue>,
    /// Number of records visited.
    pub verified_count: usize,
}

impl IntegrityReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn has_errors_of(&self, kind: &IssueKind) -> bool {
        self.errors.iter().any(|issue| &issue.kind == kind)
    }
}

/// The outcome of `export_audit_logs`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportSummary {
    pub exported_file: PathBuf,
    /// Detached signature over `exported_file`.
    pub signature_file: PathBuf,
    pub exported_count: usize,
    pub deleted_count: usize,
    /// Problems found while re-validating the exported records.
    pub report: IntegrityReport,
}
