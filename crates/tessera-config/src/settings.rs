//! Logger settings and the initial signing configuration.
//!
//! `LoggerSettings` is deserialized from TOML. Every field has a default, so
//! an empty document is valid.
//!
//! Example:
//! ```toml
//! node_id = "node-a"
//! export_dir = "exports"
//! verify_batch_size = 1000
//!
//! [initial]
//! mode = "ed25519"
//! key_label = "audit-signer"
//! frequency_ms = 8000
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    signing::SigningConfig,
};

use crate::token;

/// Signing scheme used when the config store is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InitialMode {
    Hmac,
    Ed25519,
}

/// The signing configuration created on first start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialSigning {
    pub mode: InitialMode,
    pub key_label: String,
    /// 0 signs every record.
    pub frequency_ms: u64,
}

impl Default for InitialSigning {
    fn default() -> Self {
        Self {
            mode: InitialMode::Hmac,
            key_label: "audit-log".to_string(),
            frequency_ms: 0,
        }
    }
}

impl InitialSigning {
    /// Generate fresh key material and build a draft config from it.
    pub fn build(&self) -> TesseraResult<SigningConfig> {
        let mode = match self.mode {
            InitialMode::Hmac => token::generate_hmac(&self.key_label),
            InitialMode::Ed25519 => token::generate_ed25519(&self.key_label),
        };
        let config = SigningConfig::new(mode, self.frequency_ms);
        config.validate()?;
        Ok(config)
    }
}

/// Process-level settings for one audit-log node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggerSettings {
    /// Tag written on every record; sequence numbers are contiguous per node.
    pub node_id: String,
    /// Directory export files and their signatures are written to.
    pub export_dir: PathBuf,
    /// Records read per store query while verifying or exporting.
    pub verify_batch_size: usize,
    pub initial: InitialSigning,
}

impl Default for LoggerSettings {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            export_dir: PathBuf::from("exports"),
            verify_batch_size: 1000,
            initial: InitialSigning::default(),
        }
    }
}

impl LoggerSettings {
    /// Parse `s` as TOML.
    ///
    /// Returns `TesseraError::Configuration` if the TOML is malformed or the
    /// values are out of range.
    pub fn from_toml_str(s: &str) -> TesseraResult<Self> {
        let settings: LoggerSettings = toml::from_str(s).map_err(|e| TesseraError::Configuration {
            reason: format!("failed to parse settings TOML: {}", e),
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Read the file at `path` and parse it as TOML settings.
    pub fn from_file(path: &Path) -> TesseraResult<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| TesseraError::Configuration {
            reason: format!("failed to read settings file '{}': {}", path.display(), e),
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> TesseraResult<()> {
        if self.node_id.trim().is_empty() {
            return Err(TesseraError::Configuration {
                reason: "node_id must not be empty".to_string(),
            });
        }
        if self.verify_batch_size == 0 {
            return Err(TesseraError::Configuration {
                reason: "verify_batch_size must be at least 1".to_string(),
            });
        }
        let frequency_ms = self.initial.frequency_ms;
        if !tessera_contracts::signing::is_valid_frequency(frequency_ms) {
            return Err(TesseraError::InvalidFrequency { frequency_ms });
        }
        Ok(())
    }
}
