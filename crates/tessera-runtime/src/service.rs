//! The audit service: the single management surface of the audit log.
//!
//! `AuditService` wires the configuration manager, the logger, the
//! validator, and the exporter around one record store and one config
//! store. Build it once at process start and share the returned `Arc`.
//!
//! Reset choreography:
//!
//!   prepare_reset  → reject new writes and config changes, drain in-flight writes
//!   (swap the underlying data, e.g. restore a backup)
//!   reset          → forget the queue and the cached config, accept writes again

use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, warn};

use tessera_audit::{
    logger::{SYSTEM_AUTH_TOKEN, SYSTEM_SERVICE},
    AuditLogger,
};
use tessera_config::{ConfigurationManager, LoggerSettings};
use tessera_contracts::{
    error::TesseraResult,
    record::{event_types, AuditEvent, AuditRecord, EventStatus},
    report::{ExportSummary, IntegrityReport},
    signing::SigningConfig,
};
use tessera_core::traits::{ConfigStore, RecordStore, Scheduler, TimeSource};
use tessera_verify::{ChainValidator, Exporter};

use crate::scheduler::ThreadScheduler;

const MANAGEMENT_MODULE: &str = "management";

/// Tamper-evident audit log for one node.
pub struct AuditService {
    settings: LoggerSettings,
    config: Arc<ConfigurationManager>,
    logger: AuditLogger,
    validator: ChainValidator,
    exporter: Exporter,
}

impl AuditService {
    /// Build the service with a `ThreadScheduler` driving periodic
    /// signatures.
    ///
    /// # Errors
    ///
    /// `Configuration` if `settings` are invalid.
    pub fn new(
        settings: LoggerSettings,
        records: Arc<dyn RecordStore>,
        configs: Arc<dyn ConfigStore>,
        clock: Arc<dyn TimeSource>,
    ) -> TesseraResult<Arc<Self>> {
        settings.validate()?;
        Ok(Arc::new_cyclic(|service: &Weak<AuditService>| {
            let service = service.clone();
            let scheduler = ThreadScheduler::new(move || {
                let Some(service) = service.upgrade() else {
                    return;
                };
                if let Err(e) = service.sign_now() {
                    warn!(error = %e, "periodic signature failed");
                }
            });
            Self::assemble(settings, records, configs, clock, Arc::new(scheduler))
        }))
    }

    /// Build the service around a caller-supplied scheduler.
    pub fn with_scheduler(
        settings: LoggerSettings,
        records: Arc<dyn RecordStore>,
        configs: Arc<dyn ConfigStore>,
        clock: Arc<dyn TimeSource>,
        scheduler: Arc<dyn Scheduler>,
    ) -> TesseraResult<Arc<Self>> {
        settings.validate()?;
        Ok(Arc::new(Self::assemble(settings, records, configs, clock, scheduler)))
    }

    fn assemble(
        settings: LoggerSettings,
        records: Arc<dyn RecordStore>,
        configs: Arc<dyn ConfigStore>,
        clock: Arc<dyn TimeSource>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let config = Arc::new(ConfigurationManager::new(
            Arc::clone(&configs),
            scheduler,
            Arc::clone(&clock),
            settings.initial.clone(),
        ));
        let logger = AuditLogger::new(
            settings.node_id.clone(),
            Arc::clone(&records),
            clock,
            Arc::clone(&config),
        );
        let validator = ChainValidator::new(
            Arc::clone(&records),
            Arc::clone(&configs),
            settings.verify_batch_size,
        );
        let exporter = Exporter::new(
            records,
            configs,
            settings.verify_batch_size,
            settings.export_dir.clone(),
        );

        info!(node_id = %settings.node_id, "audit service started");
        Self {
            settings,
            config,
            logger,
            validator,
            exporter,
        }
    }

    pub fn settings(&self) -> &LoggerSettings {
        &self.settings
    }

    pub fn logger(&self) -> &AuditLogger {
        &self.logger
    }

    /// Append an audit record.
    pub fn log(&self, event: AuditEvent) -> TesseraResult<AuditRecord> {
        self.logger.log(event)
    }

    /// Force a signature now. Invoked by the periodic scheduler.
    pub fn sign_now(&self) -> TesseraResult<AuditRecord> {
        self.logger.sign_now()
    }

    /// The signing configuration new records are written under.
    pub fn current_configuration(&self) -> TesseraResult<SigningConfig> {
        Ok(self.config.current_configuration()?.config.clone())
    }

    /// Replace the signing configuration and record the change as a signed
    /// `LOG_MANAGEMENT_CHANGE` event.
    ///
    /// # Errors
    ///
    /// `InvalidFrequency` or `Configuration` if the draft is rejected, in
    /// which case nothing changes. If the change event cannot be written,
    /// the new config stays active and the write error is returned.
    pub fn change_log_management(&self, draft: SigningConfig) -> TesseraResult<SigningConfig> {
        let active = self.config.update_configuration(draft)?;
        let config = active.config.clone();
        drop(active);

        self.logger.log(
            AuditEvent::new(
                event_types::LOG_MANAGEMENT_CHANGE,
                SYSTEM_AUTH_TOKEN,
                SYSTEM_SERVICE,
                MANAGEMENT_MODULE,
            )
            .with_details(json!({
                "configId": config.id,
                "signMode": config.mode.name(),
                "frequency": config.frequency_ms,
                "details": config.public_details(),
            })),
        )?;
        Ok(config)
    }

    /// Walk every record with `timestamp <= upto` and report gaps and
    /// signature mismatches. Read-only: running it twice without writes in
    /// between yields the same report.
    pub fn verify_logs_integrity(&self, upto: DateTime<Utc>) -> TesseraResult<IntegrityReport> {
        self.validator.verify(upto)
    }

    /// Export every record with `timestamp <= upto` to a signed file, then
    /// optionally delete what was exported, keeping each node's last signed
    /// record. A `LOG_EXPORT` record is written afterwards.
    pub fn export_audit_logs(
        &self,
        upto: DateTime<Utc>,
        delete_after_export: bool,
    ) -> TesseraResult<ExportSummary> {
        let active = self.config.current_configuration()?;
        let summary = self.exporter.export(upto, delete_after_export, &active.token)?;
        drop(active);

        let status = if summary.report.is_clean() {
            EventStatus::Success
        } else {
            EventStatus::Failure
        };
        self.logger.log(
            AuditEvent::new(
                event_types::LOG_EXPORT,
                SYSTEM_AUTH_TOKEN,
                SYSTEM_SERVICE,
                MANAGEMENT_MODULE,
            )
            .with_status(status)
            .with_details(json!({
                "file": summary.exported_file.display().to_string(),
                "exported": summary.exported_count,
                "deleted": summary.deleted_count,
                "errors": summary.report.errors.len(),
                "warnings": summary.report.warnings.len(),
            })),
        )?;
        Ok(summary)
    }

    /// Stop accepting writes and config changes, then block until every
    /// write already in flight has completed or aborted.
    pub fn prepare_reset(&self) {
        self.config.disable();
        self.logger.drain();
        info!(node_id = %self.settings.node_id, "audit log drained for reset");
    }

    /// Drop all cached state and accept writes again. The next write
    /// reloads the config and the sequence counter from the stores.
    pub fn reset(&self) {
        self.logger.discard_queue();
        self.config.reset();
        info!(node_id = %self.settings.node_id, "audit log reset");
    }
}
