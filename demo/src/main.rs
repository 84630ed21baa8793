//! tessera demo CLI
//!
//! Runs one or all of the audit-log scenarios against an in-memory store.
//! Each scenario builds a fresh `AuditService` from the loaded settings.
//!
//! Usage:
//!   cargo run -p demo -- run-all
//!   cargo run -p demo -- --config demo/tessera.toml concurrent
//!   cargo run -p demo -- export

mod scenarios;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use tessera_config::LoggerSettings;
use tessera_contracts::error::TesseraResult;

// ── CLI definition ────────────────────────────────────────────────────────────

/// tessera: tamper-evident, sequence-chained audit log demo.
#[derive(Parser)]
#[command(
    name = "demo",
    about = "tessera audit log demo",
    long_about = "Runs tessera scenarios showing gap-free sequencing under concurrency,\n\
                  periodic and per-record signing, abort renumbering, signed export,\n\
                  tamper detection, and the drain/reset protocol."
)]
struct Cli {
    /// Settings file (TOML). Defaults are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run every scenario in sequence.
    RunAll,
    /// Sign every record and check the first one.
    SignEvery,
    /// 400 writes from 50 threads, then verify.
    Concurrent,
    /// Periodic signing driven by the scheduler thread.
    Periodic,
    /// A failed write gives its sequence number back.
    Abort,
    /// Export with delete, then verify the remaining tail.
    Export,
    /// Rewrite a stored record and watch verification catch it.
    Tamper,
    /// Drain an in-flight write, reset, and resume.
    Reset,
}

// ── Entry point ───────────────────────────────────────────────────────────────

fn main() {
    // Set RUST_LOG=debug for verbose output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_target(false)
        .compact()
        .init();

    let cli = Cli::parse();

    let settings = match load_settings(cli.config.as_ref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Settings error: {}", e);
            std::process::exit(2);
        }
    };

    print_banner(&settings);

    let result = match cli.command {
        Command::RunAll => run_all(&settings),
        Command::SignEvery => scenarios::sign_every_record(&settings),
        Command::Concurrent => scenarios::concurrent_writers(&settings),
        Command::Periodic => scenarios::periodic_signing(&settings),
        Command::Abort => scenarios::abort_reuses_number(&settings),
        Command::Export => scenarios::export_and_verify(&settings),
        Command::Tamper => scenarios::tamper_detection(&settings),
        Command::Reset => scenarios::drain_and_reset(&settings),
    };

    match result {
        Ok(()) => {
            println!("All selected scenarios completed successfully.");
        }
        Err(e) => {
            eprintln!("Demo error: {}", e);
            std::process::exit(1);
        }
    }
}

fn load_settings(path: Option<&PathBuf>) -> TesseraResult<LoggerSettings> {
    match path {
        Some(path) => LoggerSettings::from_file(path),
        None => Ok(LoggerSettings::default()),
    }
}

fn run_all(settings: &LoggerSettings) -> TesseraResult<()> {
    scenarios::sign_every_record(settings)?;
    scenarios::concurrent_writers(settings)?;
    scenarios::periodic_signing(settings)?;
    scenarios::abort_reuses_number(settings)?;
    scenarios::export_and_verify(settings)?;
    scenarios::tamper_detection(settings)?;
    scenarios::drain_and_reset(settings)?;
    Ok(())
}

// ── Banner ────────────────────────────────────────────────────────────────────

fn print_banner(settings: &LoggerSettings) {
    println!();
    println!("tessera — Tamper-evident Audit Log");
    println!("==================================");
    println!();
    println!("Write path per record:");
    println!("  [1] Allocate the next sequence number under the current signing config");
    println!("  [2] If the record must be signed, wait for every earlier in-flight write");
    println!("  [3] Sign the records since the last signature plus this one");
    println!("  [4] Persist; on failure abort and give the sequence number back");
    println!();
    println!(
        "Node: {}  |  initial mode: {:?}  |  frequency: {} ms",
        settings.node_id, settings.initial.mode, settings.initial.frequency_ms
    );
    println!();
}
