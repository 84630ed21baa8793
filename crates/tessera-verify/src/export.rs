//! Signed export of the audit log.
//!
//! The export file is a single JSON object written as a stream while the
//! chain is validated:
//!
//! ```json
//! { "logs": [ {record}, ... ], "configs": [ {config}, ... ] }
//! ```
//!
//! Records are written verbatim in the order the validator visits them.
//! Configs carry only their public details. A detached base64 signature
//! over the finished file is written next to it as `<file>.sig`.
//!
//! With `delete_after_export`, each node's records strictly below its last
//! exported signed record are deleted. The signed record stays behind as
//! the anchor the next signature chains from.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tessera_audit::sign_segment;
use tessera_config::CryptoToken;
use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    record::AuditRecord,
    report::{ExportSummary, IntegrityReport},
    signing::SigningConfig,
};
use tessera_core::traits::{ConfigStore, RecordFilter, RecordStore};

use crate::validator::ChainValidator;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportedRecord<'a> {
    id: Uuid,
    node_id: &'a str,
    sequence_number: u64,
    timestamp: String,
    event_type: &'a str,
    event_status: &'a str,
    auth_token: &'a str,
    service: &'a str,
    module: &'a str,
    additional_details: Option<&'a serde_json::Value>,
    signature: Option<&'a str>,
    config: Option<u64>,
}

impl<'a> From<&'a AuditRecord> for ExportedRecord<'a> {
    fn from(record: &'a AuditRecord) -> Self {
        Self {
            id: record.id,
            node_id: &record.node_id,
            sequence_number: record.sequence_number,
            timestamp: record.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            event_type: &record.event_type,
            event_status: record.event_status.as_str(),
            auth_token: &record.auth_token,
            service: &record.service,
            module: &record.module,
            additional_details: record.additional_details.as_ref(),
            signature: record.signature.as_deref(),
            config: record.config_id,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ExportedConfig {
    id: u64,
    timestamp: String,
    sign_mode: &'static str,
    frequency: u64,
    details: serde_json::Value,
}

impl From<&SigningConfig> for ExportedConfig {
    fn from(config: &SigningConfig) -> Self {
        Self {
            id: config.id,
            timestamp: config.activated_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            sign_mode: config.mode.name(),
            frequency: config.frequency_ms,
            details: config.public_details(),
        }
    }
}

/// Streams the validated chain and the config history to a signed file.
pub struct Exporter {
    records: Arc<dyn RecordStore>,
    configs: Arc<dyn ConfigStore>,
    validator: ChainValidator,
    export_dir: PathBuf,
}

impl Exporter {
    pub fn new(
        records: Arc<dyn RecordStore>,
        configs: Arc<dyn ConfigStore>,
        batch_size: usize,
        export_dir: impl Into<PathBuf>,
    ) -> Self {
        let validator = ChainValidator::new(Arc::clone(&records), Arc::clone(&configs), batch_size);
        Self {
            records,
            configs,
            validator,
            export_dir: export_dir.into(),
        }
    }

    /// Export every record with `timestamp <= upto`, sign the file with
    /// `signer`, and optionally delete what was exported.
    ///
    /// Nothing is deleted when validation found errors.
    ///
    /// # Errors
    ///
    /// `Export` for file-system failures, `Signing` if the file cannot be
    /// signed, and any unrecoverable store error. A partially written file
    /// is removed.
    pub fn export(
        &self,
        upto: DateTime<Utc>,
        delete_after_export: bool,
        signer: &CryptoToken,
    ) -> TesseraResult<ExportSummary> {
        fs::create_dir_all(&self.export_dir).map_err(|e| TesseraError::Export {
            reason: format!("cannot create {}: {}", self.export_dir.display(), e),
        })?;

        let file_name = format!(
            "audit-export-{}-{}.json",
            upto.format("%Y%m%dT%H%M%S%.3fZ"),
            Uuid::new_v4().simple()
        );
        let path = self.export_dir.join(file_name);

        let written = self.write_file(&path, upto);
        let (report, exported_count, anchors) = match written {
            Ok(result) => result,
            Err(e) => {
                if let Err(remove_error) = fs::remove_file(&path) {
                    debug!(path = %path.display(), error = %remove_error, "no partial export to remove");
                }
                return Err(e);
            }
        };

        let signature_file = self.sign_file(&path, signer)?;

        let deleted_count = if !delete_after_export {
            0
        } else if !report.is_clean() {
            warn!(
                errors = report.errors.len(),
                "integrity errors found, exported records were not deleted"
            );
            0
        } else {
            self.delete_exported(&anchors)?
        };

        info!(
            file = %path.display(),
            exported = exported_count,
            deleted = deleted_count,
            errors = report.errors.len(),
            warnings = report.warnings.len(),
            "audit log exported"
        );

        Ok(ExportSummary {
            exported_file: path,
            signature_file,
            exported_count,
            deleted_count,
            report,
        })
    }

    /// Write the export and return the report, the record count, and the
    /// last signed sequence number seen per node.
    fn write_file(
        &self,
        path: &Path,
        upto: DateTime<Utc>,
    ) -> TesseraResult<(IntegrityReport, usize, BTreeMap<String, u64>)> {
        let file = File::create(path).map_err(|e| export_error(path, e))?;
        let mut out = BufWriter::new(file);

        out.write_all(b"{\"logs\":[").map_err(|e| export_error(path, e))?;

        let mut count = 0usize;
        let mut anchors: BTreeMap<String, u64> = BTreeMap::new();
        let report = self.validator.walk(upto, &mut |record| {
            if count > 0 {
                out.write_all(b",").map_err(|e| export_error(path, e))?;
            }
            serde_json::to_writer(&mut out, &ExportedRecord::from(record)).map_err(|e| {
                TesseraError::Export {
                    reason: format!("cannot serialize record {}: {}", record.sequence_number, e),
                }
            })?;
            if record.is_signed() {
                anchors.insert(record.node_id.clone(), record.sequence_number);
            }
            count += 1;
            Ok(())
        })?;

        out.write_all(b"],\"configs\":[").map_err(|e| export_error(path, e))?;
        for (i, config) in self.configs.list_configs()?.iter().enumerate() {
            if i > 0 {
                out.write_all(b",").map_err(|e| export_error(path, e))?;
            }
            serde_json::to_writer(&mut out, &ExportedConfig::from(config)).map_err(|e| {
                TesseraError::Export {
                    reason: format!("cannot serialize config {}: {}", config.id, e),
                }
            })?;
        }
        out.write_all(b"]}").map_err(|e| export_error(path, e))?;
        out.flush().map_err(|e| export_error(path, e))?;

        Ok((report, count, anchors))
    }

    fn sign_file(&self, path: &Path, signer: &CryptoToken) -> TesseraResult<PathBuf> {
        let contents = fs::read(path).map_err(|e| export_error(path, e))?;
        let signature = sign_segment(signer, &contents)?;

        let mut name = OsString::from(path.as_os_str());
        name.push(".sig");
        let signature_file = PathBuf::from(name);
        fs::write(&signature_file, signature).map_err(|e| export_error(&signature_file, e))?;
        Ok(signature_file)
    }

    fn delete_exported(&self, anchors: &BTreeMap<String, u64>) -> TesseraResult<usize> {
        let mut deleted = 0;
        for (node_id, anchor) in anchors {
            let removed = self
                .records
                .delete_where(&RecordFilter::for_node(node_id.clone()).below_sequence(*anchor))?;
            debug!(node_id = %node_id, anchor, removed, "exported records deleted");
            deleted += removed;
        }
        Ok(deleted)
    }
}

fn export_error(path: &Path, e: std::io::Error) -> TesseraError {
    TesseraError::Export {
        reason: format!("{}: {}", path.display(), e),
    }
}

/// Check a detached export signature written by `Exporter::export`.
pub fn verify_export(path: &Path, signature_file: &Path, token: &CryptoToken) -> TesseraResult<bool> {
    let contents = fs::read(path).map_err(|e| export_error(path, e))?;
    let signature = fs::read_to_string(signature_file).map_err(|e| export_error(signature_file, e))?;
    tessera_audit::verify_segment(token, &contents, signature.trim())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
