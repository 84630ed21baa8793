//! # tessera-verify
//!
//! Integrity verification and signed export for the tessera audit log.
//!
//! This crate provides:
//!
//! 1. [`validator::ChainValidator`]: walks each node's records in sequence
//!    order, reports gaps, and re-derives every signature with the config
//!    the record was signed under.
//! 2. [`export::Exporter`]: streams the validated chain and the config
//!    history to a JSON file, signs the file, and optionally deletes the
//!    exported records below the last signed anchor.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tessera_verify::ChainValidator;
//!
//! let validator = ChainValidator::new(records, configs, 1000);
//! let report = validator.verify(Utc::now())?;
//! for issue in &report.errors {
//!     eprintln!("{:?} {}..={}: {}", issue.kind, issue.first_sequence, issue.last_sequence, issue.reason);
//! }
//! ```

pub mod export;
pub mod validator;

pub use export::{verify_export, Exporter};
pub use validator::ChainValidator;
