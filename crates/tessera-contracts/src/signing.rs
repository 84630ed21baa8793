//! Signing configuration: which scheme signs the chain, with what key, and
//! how often.
//!
//! A `SigningConfig` is never deleted, only superseded. Records carry the id
//! of the config that was current when they were allocated, so verification
//! of old records resolves the historical config by id.

use std::fmt;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{TesseraError, TesseraResult};

/// Smallest non-zero signing interval, in milliseconds.
pub const MIN_FREQUENCY_MS: u64 = 100;

/// Largest signing interval. Elapsed time is compared as signed milliseconds.
pub const MAX_FREQUENCY_MS: u64 = i64::MAX as u64;

/// Whether `frequency_ms` is 0 or within `MIN_FREQUENCY_MS..=MAX_FREQUENCY_MS`.
pub fn is_valid_frequency(frequency_ms: u64) -> bool {
    frequency_ms == 0 || (MIN_FREQUENCY_MS..=MAX_FREQUENCY_MS).contains(&frequency_ms)
}

pub const HMAC_SHA256: &str = "HmacSHA256";
pub const ED25519: &str = "Ed25519";

/// Raw key bytes, base64-encoded when serialized.
///
/// `Debug` never prints the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyMaterial(pub Vec<u8>);

impl KeyMaterial {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyMaterial({} bytes)", self.0.len())
    }
}

impl Serialize for KeyMaterial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for KeyMaterial {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(KeyMaterial)
            .map_err(serde::de::Error::custom)
    }
}

/// The signing scheme and its key material.
///
/// The `mode` tag is the discriminator persisted with the config; loading a
/// config reconstructs the right signing behavior from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SignMode {
    /// Shared-secret HMAC.
    Hmac {
        key_label: String,
        algorithm: String,
        secret: KeyMaterial,
    },
    /// Asymmetric digital signature.
    Signature {
        key_label: String,
        algorithm: String,
        private_key: KeyMaterial,
        public_key: KeyMaterial,
    },
}

impl SignMode {
    pub fn name(&self) -> &'static str {
        match self {
            SignMode::Hmac { .. } => "hmac",
            SignMode::Signature { .. } => "signature",
        }
    }

    pub fn key_label(&self) -> &str {
        match self {
            SignMode::Hmac { key_label, .. } | SignMode::Signature { key_label, .. } => key_label,
        }
    }

    pub fn algorithm(&self) -> &str {
        match self {
            SignMode::Hmac { algorithm, .. } | SignMode::Signature { algorithm, .. } => algorithm,
        }
    }
}

/// A versioned signing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Assigned by the configuration manager on activation; 0 for a draft.
    pub id: u64,
    /// When this config became current. Unix epoch for a draft.
    pub activated_at: DateTime<Utc>,
    /// Interval between forced signatures in ms; 0 signs every record.
    pub frequency_ms: u64,
    pub mode: SignMode,
}

impl SigningConfig {
    /// A draft config, not yet activated.
    pub fn new(mode: SignMode, frequency_ms: u64) -> Self {
        Self {
            id: 0,
            activated_at: DateTime::<Utc>::UNIX_EPOCH,
            frequency_ms,
            mode,
        }
    }

    pub fn signs_every_record(&self) -> bool {
        self.frequency_ms == 0
    }

    /// Check required fields and the frequency range.
    ///
    /// # Errors
    ///
    /// `InvalidFrequency` for a frequency in `1..100` or above
    /// `MAX_FREQUENCY_MS`, `Configuration` for a
    /// missing label, an algorithm that does not match the mode, or empty key
    /// material.
    pub fn validate(&self) -> TesseraResult<()> {
        if !is_valid_frequency(self.frequency_ms) {
            return Err(TesseraError::InvalidFrequency {
                frequency_ms: self.frequency_ms,
            });
        }

        if self.mode.key_label().trim().is_empty() {
            return Err(TesseraError::Configuration {
                reason: "key label is required".to_string(),
            });
        }

        match &self.mode {
            SignMode::Hmac { algorithm, secret, .. } => {
                if algorithm != HMAC_SHA256 {
                    return Err(TesseraError::Configuration {
                        reason: format!("unsupported HMAC algorithm '{}'", algorithm),
                    });
                }
                if secret.is_empty() {
                    return Err(TesseraError::Configuration {
                        reason: "HMAC secret is required".to_string(),
                    });
                }
            }
            SignMode::Signature {
                algorithm,
                private_key,
                public_key,
                ..
            } => {
                if algorithm != ED25519 {
                    return Err(TesseraError::Configuration {
                        reason: format!("unsupported signature algorithm '{}'", algorithm),
                    });
                }
                if private_key.is_empty() || public_key.is_empty() {
                    return Err(TesseraError::Configuration {
                        reason: "signature key pair is required".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    /// The non-secret description of this config, as written to exports.
    pub fn public_details(&self) -> serde_json::Value {
        let mut details = serde_json::json!({
            "keyLabel": self.mode.key_label(),
            "algorithm": self.mode.algorithm(),
        });
        if let SignMode::Signature { public_key, .. } = &self.mode {
            details["publicKey"] = serde_json::Value::String(STANDARD.encode(public_key.as_bytes()));
        }
        details
    }
}
