//! Crypto tokens: activated key material behind a signing configuration.
//!
//! `CryptoToken::open` turns the key material persisted in a
//! `SigningConfig` into a live signer. `close` wipes it; dropping the last
//! reference to a token closes it as well, so key material is released on
//! every exit path.

use ed25519_dalek::{Signature, Signer as _, SigningKey, Verifier as _, VerifyingKey};
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use rand::{rngs::OsRng, RngCore};
use sha2::Sha256;
use tracing::debug;

use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    signing::{KeyMaterial, SignMode, SigningConfig, ED25519, HMAC_SHA256},
};

type HmacSha256 = Hmac<Sha256>;

/// Generate an HMAC-SHA256 mode with a random 32-byte secret.
pub fn generate_hmac(key_label: &str) -> SignMode {
    let mut secret = vec![0u8; 32];
    OsRng.fill_bytes(&mut secret);
    SignMode::Hmac {
        key_label: key_label.to_string(),
        algorithm: HMAC_SHA256.to_string(),
        secret: KeyMaterial(secret),
    }
}

/// Generate an Ed25519 mode with a fresh key pair.
pub fn generate_ed25519(key_label: &str) -> SignMode {
    let signing = SigningKey::generate(&mut OsRng);
    SignMode::Signature {
        key_label: key_label.to_string(),
        algorithm: ED25519.to_string(),
        private_key: KeyMaterial(signing.to_bytes().to_vec()),
        public_key: KeyMaterial(signing.verifying_key().to_bytes().to_vec()),
    }
}

enum ActiveKey {
    Hmac(Vec<u8>),
    Ed25519 {
        signing: SigningKey,
        verifying: VerifyingKey,
    },
}

/// Live key material for one signing configuration.
pub struct CryptoToken {
    config_id: u64,
    key_label: String,
    key: RwLock<Option<ActiveKey>>,
}

impl CryptoToken {
    /// Activate the key material of `config`.
    ///
    /// # Errors
    ///
    /// `Configuration` if the key bytes have the wrong length or the
    /// Ed25519 public key does not belong to the private key.
    pub fn open(config: &SigningConfig) -> TesseraResult<Self> {
        let key = match &config.mode {
            SignMode::Hmac { secret, .. } => ActiveKey::Hmac(secret.as_bytes().to_vec()),
            SignMode::Signature {
                private_key,
                public_key,
                ..
            } => {
                let bytes: [u8; 32] =
                    private_key
                        .as_bytes()
                        .try_into()
                        .map_err(|_| TesseraError::Configuration {
                            reason: format!(
                                "Ed25519 private key must be 32 bytes, got {}",
                                private_key.as_bytes().len()
                            ),
                        })?;
                let signing = SigningKey::from_bytes(&bytes);
                let verifying = signing.verifying_key();
                if verifying.as_bytes().as_slice() != public_key.as_bytes() {
                    return Err(TesseraError::Configuration {
                        reason: "Ed25519 public key does not match the private key".to_string(),
                    });
                }
                ActiveKey::Ed25519 { signing, verifying }
            }
        };

        debug!(
            config_id = config.id,
            key_label = %config.mode.key_label(),
            "crypto token opened"
        );

        Ok(Self {
            config_id: config.id,
            key_label: config.mode.key_label().to_string(),
            key: RwLock::new(Some(key)),
        })
    }

    pub fn config_id(&self) -> u64 {
        self.config_id
    }

    pub fn is_open(&self) -> bool {
        self.key.read().is_some()
    }

    pub fn sign(&self, data: &[u8]) -> TesseraResult<Vec<u8>> {
        let key = self.key.read();
        match key.as_ref() {
            Some(ActiveKey::Hmac(secret)) => {
                let mut mac =
                    HmacSha256::new_from_slice(secret).map_err(|e| TesseraError::Signing {
                        reason: format!("invalid HMAC key '{}': {}", self.key_label, e),
                    })?;
                mac.update(data);
                Ok(mac.finalize().into_bytes().to_vec())
            }
            Some(ActiveKey::Ed25519 { signing, .. }) => Ok(signing.sign(data).to_bytes().to_vec()),
            None => Err(TesseraError::Signing {
                reason: format!("crypto token '{}' is closed", self.key_label),
            }),
        }
    }

    /// Check `signature` over `data`. A malformed signature is `Ok(false)`.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> TesseraResult<bool> {
        let key = self.key.read();
        match key.as_ref() {
            Some(ActiveKey::Hmac(secret)) => {
                let mut mac =
                    HmacSha256::new_from_slice(secret).map_err(|e| TesseraError::Signing {
                        reason: format!("invalid HMAC key '{}': {}", self.key_label, e),
                    })?;
                mac.update(data);
                Ok(mac.verify_slice(signature).is_ok())
            }
            Some(ActiveKey::Ed25519 { verifying, .. }) => match Signature::from_slice(signature) {
                Ok(signature) => Ok(verifying.verify(data, &signature).is_ok()),
                Err(_) => Ok(false),
            },
            None => Err(TesseraError::Signing {
                reason: format!("crypto token '{}' is closed", self.key_label),
            }),
        }
    }

    /// Wipe the key material. Further `sign`/`verify` calls fail.
    pub fn close(&self) {
        let mut key = self.key.write();
        if let Some(ActiveKey::Hmac(secret)) = key.as_mut() {
            secret.iter_mut().for_each(|b| *b = 0);
        }
        if key.take().is_some() {
            debug!(config_id = self.config_id, key_label = %self.key_label, "crypto token closed");
        }
    }
}

impl Drop for CryptoToken {
    fn drop(&mut self) {
        self.close();
    }
}
