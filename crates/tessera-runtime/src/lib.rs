//! # tessera-runtime
//!
//! The assembled tessera audit log.
//!
//! [`AuditService`] is the management surface: `log`, `sign_now`,
//! `change_log_management`, `current_configuration`,
//! `verify_logs_integrity`, `export_audit_logs`, `prepare_reset`, and
//! `reset`. It runs periodic signatures on a [`ThreadScheduler`] and stamps
//! records with any [`TimeSource`](tessera_core::traits::TimeSource), such
//! as [`SystemClock`] or, in tests, [`ManualClock`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tessera_audit::InMemoryStore;
//! use tessera_runtime::{AuditService, SystemClock};
//!
//! let store = Arc::new(InMemoryStore::new());
//! let service = AuditService::new(settings, store.clone(), store, Arc::new(SystemClock::new()))?;
//! service.log(AuditEvent::new("CERT_ISSUED", "ca-admin", "ca", "issuance"))?;
//! let report = service.verify_logs_integrity(Utc::now())?;
//! ```

pub mod clock;
pub mod scheduler;
pub mod service;

pub use clock::{ManualClock, SystemClock};
pub use scheduler::ThreadScheduler;
pub use service::AuditService;

// ── Tests ─────────────────────────────────────────────────────────────────────
