//! # tessera-contracts
//!
//! Shared types for the tessera tamper-evident audit log.
//!
//! All crates in the workspace import from here. No business logic lives in
//! this crate, only data definitions, their validation, and error types.

pub mod error;
pub mod record;
pub mod report;
pub mod signing;
