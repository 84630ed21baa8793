//! Error types for the tessera audit log.
//!
//! Every fallible operation in the workspace returns `TesseraResult<T>`.
//! Integrity problems found while verifying a chain are *not* errors: they
//! are collected into an `IntegrityReport` (see `report.rs`).

use thiserror::Error;

/// The unified error type for the tessera workspace.
#[derive(Debug, Error)]
pub enum TesseraError {
    /// A signing configuration is missing a required field or is otherwise
    /// unusable. Rejected before any state changes.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// The signing frequency is neither 0 nor between 100 ms and `i64::MAX` ms.
    #[error("invalid frequency: {frequency_ms} ms (must be 0 or between 100 ms and i64::MAX ms)")]
    InvalidFrequency { frequency_ms: u64 },

    /// The crypto operation failed, or a fresh signature did not verify
    /// against the bytes it was computed over.
    ///
    /// Fatal to the single write that produced it; the write is aborted.
    #[error("signing failed: {reason}")]
    Signing { reason: String },

    /// A write or configuration change arrived between `prepare_reset` and
    /// `reset`.
    #[error("audit log is disabled while a reset is in progress")]
    SystemDisabled,

    /// The record store failed an insert, query, or delete.
    #[error("storage failure: {reason}")]
    Storage { reason: String },

    /// A stored row's embedded checksum does not match its content.
    #[error("integrity check failed for record {sequence_number} on node '{node_id}'")]
    IntegrityCheckFailed { node_id: String, sequence_number: u64 },

    /// Writing the export file or its detached signature failed.
    #[error("export failed: {reason}")]
    Export { reason: String },
}

/// Convenience alias used throughout the tessera crates.
pub type TesseraResult<T> = Result<T, TesseraError>;
