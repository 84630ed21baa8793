//! Signature primitives for chain segments.
//!
//! A segment's signature is computed over `chain_input(predecessors, record)`
//! (see `tessera_core::canonical`) and stored base64-encoded on the record
//! that closes the segment.

use base64::{engine::general_purpose::STANDARD, Engine as _};

use tessera_config::CryptoToken;
use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    record::AuditRecord,
};
use tessera_core::canonical::chain_input;

/// Sign `data` and check the result against the same bytes before handing
/// it out.
///
/// # Errors
///
/// `Signing` if the token fails or the fresh signature does not verify.
pub fn sign_segment(token: &CryptoToken, data: &[u8]) -> TesseraResult<String> {
    let signature = token.sign(data)?;
    if !token.verify(data, &signature)? {
        return Err(TesseraError::Signing {
            reason: format!(
                "signature produced by config {} failed self-verification",
                token.config_id()
            ),
        });
    }
    Ok(STANDARD.encode(signature))
}

/// Check a stored base64 signature over `data`. Undecodable signatures are
/// reported as a mismatch.
pub fn verify_segment(token: &CryptoToken, data: &[u8], signature: &str) -> TesseraResult<bool> {
    match STANDARD.decode(signature.as_bytes()) {
        Ok(raw) => token.verify(data, &raw),
        Err(_) => Ok(false),
    }
}

/// Re-derive and check `record`'s signature from the predecessors
/// accumulated since the previous signed record.
///
/// Returns `Ok(false)` for an unsigned record.
pub fn verify_record(
    token: &CryptoToken,
    predecessors: &[AuditRecord],
    record: &AuditRecord,
) -> TesseraResult<bool> {
    match &record.signature {
        Some(signature) => verify_segment(token, &chain_input(predecessors, record), signature),
        None => Ok(false),
    }
}
