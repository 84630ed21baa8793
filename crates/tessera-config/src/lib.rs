//! # tessera-config
//!
//! Signing-configuration management for the tessera audit log.
//!
//! ## Overview
//!
//! - [`LoggerSettings`] is read from TOML and names the node, the export
//!   directory, and the signing scheme to create on first start.
//! - [`CryptoToken`] activates the key material of a `SigningConfig` and
//!   signs or verifies bytes with it (HMAC-SHA256 or Ed25519).
//! - [`ConfigurationManager`] holds the current config behind a read/write
//!   lock, validates and persists replacements, and reschedules periodic
//!   signing whenever the frequency changes.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use tessera_config::{ConfigurationManager, LoggerSettings};
//!
//! let settings = LoggerSettings::from_file(Path::new("tessera.toml"))?;
//! let manager = ConfigurationManager::new(store, scheduler, clock, settings.initial);
//! let current = manager.current_configuration()?;
//! ```

pub mod manager;
pub mod settings;
pub mod token;

pub use manager::{ActiveConfig, ConfigurationManager};
pub use settings::{InitialMode, InitialSigning, LoggerSettings};
pub use token::CryptoToken;

// ── Tests ─────────────────────────────────────────────────────────────────────
