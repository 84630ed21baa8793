//! Audit records and the events that produce them.
//!
//! An `AuditEvent` is what a business feature hands to the logger. The
//! logger turns it into an `AuditRecord` by allocating a sequence number,
//! stamping a timestamp, and (when required) attaching a signature.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Event types the logger itself emits.
///
/// Business features are free to use any other string.
pub mod event_types {
    /// A forced signing boundary, emitted by the periodic scheduler.
    pub const LOG_SIGN: &str = "LOG_SIGN";
    /// The signing configuration was replaced.
    pub const LOG_MANAGEMENT_CHANGE: &str = "LOG_MANAGEMENT_CHANGE";
    /// Records were exported (and possibly deleted).
    pub const LOG_EXPORT: &str = "LOG_EXPORT";

    /// Meta-events are always signed: they anchor the chain.
    pub fn is_meta(event_type: &str) -> bool {
        matches!(event_type, LOG_SIGN | LOG_MANAGEMENT_CHANGE)
    }
}

/// Outcome of the audited operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Success,
    Failure,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Success => "SUCCESS",
            EventStatus::Failure => "FAILURE",
        }
    }
}

/// A security-relevant event, as submitted by a caller of `log()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: String,
    pub event_status: EventStatus,
    /// Identity of the principal that triggered the event.
    pub auth_token: String,
    pub service: String,
    pub module: String,
    /// Opaque, caller-defined payload.
    pub additional_details: Option<serde_json::Value>,
}

impl AuditEvent {
    /// Build a successful event with no additional details.
    pub fn new(
        event_type: impl Into<String>,
        auth_token: impl Into<String>,
        service: impl Into<String>,
        module: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            event_status: EventStatus::Success,
            auth_token: auth_token.into(),
            service: service.into(),
            module: module.into(),
            additional_details: None,
        }
    }

    pub fn with_status(mut self, status: EventStatus) -> Self {
        self.event_status = status;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.additional_details = Some(details);
        self
    }
}

/// One immutable entry in the audit chain.
///
/// `sequence_number` and `timestamp` are assigned when the record is pushed
/// onto the sequence queue; `signature` is present only when the record
/// closes a chain segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: Uuid,
    /// Writer that produced the record. Sequence numbers are contiguous per node.
    pub node_id: String,
    pub sequence_number: u64,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub event_status: EventStatus,
    pub auth_token: String,
    pub service: String,
    pub module: String,
    pub additional_details: Option<serde_json::Value>,
    /// Base64 signature over this record and its unsigned predecessors.
    pub signature: Option<String>,
    /// Id of the signing configuration active when the record was allocated.
    pub config_id: Option<u64>,
}

impl AuditRecord {
    /// Wrap `event` in an unallocated record.
    ///
    /// The sequence number is 0 and the timestamp is the Unix epoch until the
    /// sequence queue stamps them.
    pub fn new(node_id: impl Into<String>, event: AuditEvent, config_id: Option<u64>) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id: node_id.into(),
            sequence_number: 0,
            timestamp: DateTime::<Utc>::UNIX_EPOCH,
            event_type: event.event_type,
            event_status: event.event_status,
            auth_token: event.auth_token,
            service: event.service,
            module: event.module,
            additional_details: event.additional_details,
            signature: None,
            config_id,
        }
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }

    pub fn is_meta_event(&self) -> bool {
        event_types::is_meta(&self.event_type)
    }
}
