//! Demo scenarios. Each one builds its own store and service.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;

use tessera_audit::InMemoryStore;
use tessera_config::{token::generate_hmac, LoggerSettings};
use tessera_contracts::{
    error::{TesseraError, TesseraResult},
    record::{event_types, AuditEvent},
    report::IntegrityReport,
    signing::SigningConfig,
};
use tessera_core::traits::{ConfigStore, RecordFilter, RecordStore};
use tessera_runtime::{AuditService, SystemClock};

fn start(settings: &LoggerSettings) -> TesseraResult<(Arc<InMemoryStore>, Arc<AuditService>)> {
    let store = Arc::new(InMemoryStore::new());
    let service = AuditService::new(
        settings.clone(),
        Arc::clone(&store) as Arc<dyn RecordStore>,
        Arc::clone(&store) as Arc<dyn ConfigStore>,
        Arc::new(SystemClock::new()),
    )?;
    Ok((store, service))
}

fn login(user: &str) -> AuditEvent {
    AuditEvent::new("ADMIN_LOGIN", user, "admin-web", "auth")
        .with_details(json!({ "remoteAddress": "10.0.0.7" }))
}

fn outcome(ok: bool) -> &'static str {
    if ok {
        "(expected)"
    } else {
        "UNEXPECTED"
    }
}

fn print_report(report: &IntegrityReport) {
    println!(
        "  Verified: {} record(s), {} error(s), {} warning(s)",
        report.verified_count,
        report.errors.len(),
        report.warnings.len()
    );
    for issue in report.errors.iter().chain(&report.warnings) {
        println!(
            "    {:?} {}..={}: {}",
            issue.kind, issue.first_sequence, issue.last_sequence, issue.reason
        );
    }
}

fn stored_sequences(store: &InMemoryStore, node_id: &str) -> TesseraResult<Vec<u64>> {
    Ok(store
        .find_ordered(&RecordFilter::for_node(node_id))?
        .iter()
        .map(|r| r.sequence_number)
        .collect())
}

fn every_record(service: &AuditService) -> TesseraResult<()> {
    if service.current_configuration()?.frequency_ms != 0 {
        service.change_log_management(SigningConfig::new(generate_hmac("demo-every"), 0))?;
    }
    Ok(())
}

// ── Scenarios ─────────────────────────────────────────────────────────────────

pub fn sign_every_record(settings: &LoggerSettings) -> TesseraResult<()> {
    println!("=== Scenario: Sign every record ===");
    let (_store, service) = start(settings)?;
    every_record(&service)?;

    let record = service.log(login("alice"))?;
    println!("  Sequence number: {}", record.sequence_number);
    println!("  Signed:          {}", record.is_signed());
    println!("  RESULT: signed record written {}", outcome(record.is_signed()));
    println!();
    Ok(())
}

pub fn concurrent_writers(settings: &LoggerSettings) -> TesseraResult<()> {
    println!("=== Scenario: 400 writes from 50 threads ===");
    let (store, service) = start(settings)?;
    every_record(&service)?;
    let first = service.log(login("setup"))?.sequence_number;

    let threads: Vec<_> = (0..50)
        .map(|t| {
            let service = Arc::clone(&service);
            thread::spawn(move || -> TesseraResult<()> {
                for i in 0..8 {
                    service.log(AuditEvent::new(
                        "CERT_ISSUED",
                        format!("ra-{}", t),
                        "ca",
                        format!("issuance-{}", i),
                    ))?;
                }
                Ok(())
            })
        })
        .collect();
    for handle in threads {
        handle.join().map_err(|_| TesseraError::Storage {
            reason: "writer thread panicked".to_string(),
        })??;
    }

    let sequences = stored_sequences(&store, &settings.node_id)?;
    let contiguous = sequences
        .iter()
        .copied()
        .eq(first..first + sequences.len() as u64);
    println!("  Records stored:  {}", sequences.len());
    println!("  Contiguous:      {} {}", contiguous, outcome(contiguous));

    let report = service.verify_logs_integrity(Utc::now())?;
    print_report(&report);
    println!("  RESULT: chain intact {}", outcome(report.is_clean()));
    println!();
    Ok(())
}

pub fn periodic_signing(settings: &LoggerSettings) -> TesseraResult<()> {
    println!("=== Scenario: Periodic signing ===");
    let (store, service) = start(settings)?;
    service.change_log_management(SigningConfig::new(generate_hmac("demo-periodic"), 200))?;

    let pending = service.log(login("bob"))?;
    println!("  Record {} signed on write: {}", pending.sequence_number, pending.is_signed());

    thread::sleep(Duration::from_millis(450));

    let records = store.find_ordered(&RecordFilter::for_node(settings.node_id.clone()))?;
    let forced = records
        .iter()
        .filter(|r| r.event_type == event_types::LOG_SIGN)
        .count();
    let covering = records
        .iter()
        .find(|r| r.is_signed() && r.sequence_number > pending.sequence_number);
    println!("  Scheduler signatures written: {}", forced);
    match covering {
        Some(record) => println!(
            "  Record {} covered by signature on record {} ({}) {}",
            pending.sequence_number,
            record.sequence_number,
            record.event_type,
            outcome(true)
        ),
        None => println!("  No covering signature {}", outcome(false)),
    }

    service.change_log_management(SigningConfig::new(generate_hmac("demo-every"), 0))?;
    let report = service.verify_logs_integrity(Utc::now())?;
    print_report(&report);
    println!();
    Ok(())
}

pub fn abort_reuses_number(settings: &LoggerSettings) -> TesseraResult<()> {
    println!("=== Scenario: Abort gives the number back ===");
    let (store, service) = start(settings)?;

    let first = service.log(login("carol"))?;
    store.fail_next_inserts(1);
    match service.log(login("mallory")) {
        Ok(record) => println!("  Write unexpectedly succeeded as {}", record.sequence_number),
        Err(e) => println!("  Write failed and was aborted: {}", e),
    }
    let next = service.log(login("carol"))?;

    let reused = next.sequence_number == first.sequence_number + 1;
    println!(
        "  Next write got sequence number {} {}",
        next.sequence_number,
        outcome(reused)
    );
    println!("  Stored: {:?}", stored_sequences(&store, &settings.node_id)?);
    println!();
    Ok(())
}

pub fn export_and_verify(settings: &LoggerSettings) -> TesseraResult<()> {
    println!("=== Scenario: Export, delete, verify ===");
    let (store, service) = start(settings)?;
    service.change_log_management(SigningConfig::new(generate_hmac("demo-export"), 60_000))?;
    for user in ["dave", "erin", "frank"] {
        service.log(login(user))?;
    }
    service.sign_now()?;
    service.log(login("grace"))?;

    let summary = service.export_audit_logs(Utc::now(), true)?;
    println!("  Export file:     {}", summary.exported_file.display());
    println!("  Signature file:  {}", summary.signature_file.display());
    println!("  Exported:        {}", summary.exported_count);
    println!("  Deleted:         {}", summary.deleted_count);
    println!("  Remaining:       {:?}", stored_sequences(&store, &settings.node_id)?);

    let report = service.verify_logs_integrity(Utc::now())?;
    print_report(&report);
    println!("  RESULT: remaining tail verifies {}", outcome(report.is_clean()));
    println!();
    Ok(())
}

pub fn tamper_detection(settings: &LoggerSettings) -> TesseraResult<()> {
    println!("=== Scenario: Tamper detection ===");
    let (store, service) = start(settings)?;
    service.change_log_management(SigningConfig::new(generate_hmac("demo-tamper"), 60_000))?;
    let victim = service.log(login("heidi"))?;
    service.log(login("ivan"))?;
    service.sign_now()?;

    store.rewrite_row(&settings.node_id, victim.sequence_number, |record| {
        record.auth_token = "nobody".to_string();
    })?;
    println!("  Rewrote auth token of record {}", victim.sequence_number);

    let report = service.verify_logs_integrity(Utc::now())?;
    print_report(&report);
    println!("  RESULT: tampering detected {}", outcome(!report.is_clean()));
    println!();
    Ok(())
}

pub fn drain_and_reset(settings: &LoggerSettings) -> TesseraResult<()> {
    println!("=== Scenario: Drain and reset ===");
    let (store, service) = start(settings)?;
    every_record(&service)?;

    let writers: Vec<_> = (0..4)
        .map(|t| {
            let service = Arc::clone(&service);
            thread::spawn(move || {
                (0..20)
                    .filter(|i| service.log(login(&format!("user-{}-{}", t, i))).is_ok())
                    .count()
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(5));
    service.prepare_reset();
    let rejected = matches!(service.log(login("late")), Err(TesseraError::SystemDisabled));
    println!("  Writes rejected while drained: {} {}", rejected, outcome(rejected));

    let mut written = 0;
    for handle in writers {
        written += handle.join().unwrap_or(0);
    }
    service.reset();

    let resumed = service.log(login("after-reset"))?;
    println!("  Writes completed before reset: {}", written);
    println!("  First write after reset:       {}", resumed.sequence_number);

    let sequences = stored_sequences(&store, &settings.node_id)?;
    let contiguous = sequences.iter().copied().eq(1..=sequences.len() as u64);
    println!("  Contiguous:                    {} {}", contiguous, outcome(contiguous));
    let report = service.verify_logs_integrity(Utc::now())?;
    print_report(&report);
    println!();
    Ok(())
}
