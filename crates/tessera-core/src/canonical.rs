//! Canonical byte serialization of a record for signing and verification.
//!
//! The signer and the validator must produce identical bytes for the same
//! record, so every contributing field is listed here, in order:
//!
//!   1. id (16 raw UUID bytes)
//!   2. timestamp as i64 microseconds since the epoch, big-endian
//!   3. event_type, event_status, auth_token, service, module
//!   4. additional_details (optional, compact JSON)
//!   5. signature (optional, only when `include_signature` is set)
//!   6. sequence_number as u64 big-endian
//!   7. config_id (optional, u64 big-endian)
//!
//! Strings are prefixed with their length as a u32 big-endian. Optional
//! fields are prefixed with a presence byte (0 = absent, 1 = present).

use tessera_contracts::record::AuditRecord;

/// Serialize `record` to its canonical bytes.
///
/// A record being signed is serialized with `include_signature = false`; a
/// predecessor that already carries a signature (the previous chain anchor)
/// is serialized with `include_signature = true`, which is what links one
/// chain segment to the next.
pub fn canonical_bytes(record: &AuditRecord, include_signature: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);

    out.extend_from_slice(record.id.as_bytes());
    out.extend_from_slice(&record.timestamp.timestamp_micros().to_be_bytes());
    put_str(&mut out, &record.event_type);
    put_str(&mut out, record.event_status.as_str());
    put_str(&mut out, &record.auth_token);
    put_str(&mut out, &record.service);
    put_str(&mut out, &record.module);

    match &record.additional_details {
        Some(details) => {
            out.push(1);
            put_str(&mut out, &details.to_string());
        }
        None => out.push(0),
    }

    match (&record.signature, include_signature) {
        (Some(signature), true) => {
            out.push(1);
            put_str(&mut out, signature);
        }
        _ => out.push(0),
    }

    out.extend_from_slice(&record.sequence_number.to_be_bytes());

    match record.config_id {
        Some(config_id) => {
            out.push(1);
            out.extend_from_slice(&config_id.to_be_bytes());
        }
        None => out.push(0),
    }

    out
}

/// Concatenate the canonical bytes of `predecessors` (ascending, signatures
/// included) followed by `record` (signature excluded).
///
/// This is the exact input to `sign()` for a record that closes a segment.
pub fn chain_input(predecessors: &[AuditRecord], record: &AuditRecord) -> Vec<u8> {
    let mut data = Vec::new();
    for predecessor in predecessors {
        data.extend_from_slice(&canonical_bytes(predecessor, true));
    }
    data.extend_from_slice(&canonical_bytes(record, false));
    data
}

fn put_str(out: &mut Vec<u8>, value: &str) {
    out.extend_from_slice(&(value.len() as u32).to_be_bytes());
    out.extend_from_slice(value.as_bytes());
}
