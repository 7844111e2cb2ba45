//! dues-runner: headless driver for the dues reconciliation engine.
//!
//! Usage:
//!   dues-runner submit --db dues.db --payer m-001 --image slip.jpg
//!   dues-runner process --db dues.db
//!   dues-runner dispatch --db dues.db
//!   dues-runner sweep-daily --db dues.db
//!   dues-runner sweep-monthly --db dues.db
//!   dues-runner demo [--seed 42]
//!
//! Ports are wired to the in-process adapters; a production deployment
//! embeds dues-core with real blob/provider/channel clients instead.

use anyhow::{bail, Result};
use dues_core::clock::SystemClock;
use dues_core::config::EngineConfig;
use dues_core::engine::{Engine, SlipDisposition};
use dues_core::ports::{
    MemoryBlobStore, RecordingMessenger, ScriptedVerifier, VerificationResult,
};
use dues_core::store::EngineStore;
use std::env;
use std::sync::Arc;

type DemoEngine = Engine<MemoryBlobStore, ScriptedVerifier, RecordingMessenger>;

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let Some(command) = args.get(1).map(String::as_str) else {
        bail!("usage: dues-runner <submit|process|dispatch|sweep-daily|sweep-monthly|demo> [options]");
    };

    let db = str_arg(&args, "--db", ":memory:");
    let config = match args.windows(2).find(|w| w[0] == "--config") {
        Some(w) => EngineConfig::load(&w[1])?,
        None => EngineConfig::defaults(),
    };

    let store = if db == ":memory:" {
        EngineStore::in_memory()?
    } else {
        EngineStore::open(db)?
    };

    let mut engine = build_engine(store, config)?;

    match command {
        "submit" => {
            let payer = require_arg(&args, "--payer")?;
            let image = require_arg(&args, "--image")?;
            let content_type = str_arg(&args, "--content-type", "image/jpeg");
            let bytes = std::fs::read(image)?;
            let slip_id = engine.submit_slip(payer, &bytes, content_type)?;
            println!("{}", serde_json::json!({ "slip_id": slip_id }));
        }
        "process" => {
            let results = match args.windows(2).find(|w| w[0] == "--slip") {
                Some(w) => {
                    let disposition = engine.process_slip(&w[1])?;
                    vec![(w[1].clone(), disposition)]
                }
                None => engine.process_eligible()?,
            };
            for (slip_id, disposition) in &results {
                println!(
                    "{}",
                    serde_json::json!({
                        "slip_id": slip_id,
                        "disposition": disposition_str(disposition),
                    })
                );
            }
            log::info!("processed {} slips", results.len());
        }
        "dispatch" => {
            let stats = engine.dispatch_notifications()?;
            println!(
                "{}",
                serde_json::json!({ "sent": stats.sent, "failed": stats.failed })
            );
        }
        "sweep-daily" => {
            let stats = engine.run_daily_sweep()?;
            println!(
                "{}",
                serde_json::json!({
                    "run_id": stats.run_id,
                    "slips_requeued": stats.slips_requeued,
                    "slips_retried": stats.slips_retried,
                    "payments_expired": stats.payments_expired,
                    "payments_mismatched": stats.payments_mismatched,
                    "items_processed": stats.items_processed,
                    "items_failed": stats.items_failed,
                })
            );
        }
        "sweep-monthly" => {
            let summary = engine.run_monthly_sweep()?;
            println!(
                "{}",
                serde_json::json!({
                    "period": summary.period,
                    "matched_count": summary.matched_count,
                    "matched_amount_cents": summary.matched_amount_cents,
                    "mismatched_count": summary.mismatched_count,
                    "mismatched_amount_cents": summary.mismatched_amount_cents,
                    "expired_count": summary.expired_count,
                    "expired_amount_cents": summary.expired_amount_cents,
                })
            );
        }
        "demo" => run_demo(&mut engine)?,
        other => bail!("unknown command '{other}'"),
    }

    Ok(())
}

fn build_engine(store: EngineStore, config: EngineConfig) -> Result<DemoEngine> {
    let verifier = ScriptedVerifier::always(VerificationResult {
        provider_txn_ref: format!("TXN-{}", chrono::Utc::now().timestamp()),
        amount_cents: 50_000,
        settled_at: chrono::Utc::now().timestamp(),
        sender_hint: None,
    });
    Ok(Engine::new(
        store,
        config,
        Arc::new(SystemClock),
        MemoryBlobStore::new(),
        verifier,
        RecordingMessenger::new(),
    )?)
}

/// End-to-end walkthrough against an in-memory database: one due, one
/// slip, verification, matching, notification, and a daily sweep.
fn run_demo(engine: &mut DemoEngine) -> Result<()> {
    let now = chrono::Utc::now().timestamp();
    println!("dues-runner demo");

    let payment_id = engine.create_payment("member-001", "cohort-2026", 50_000, "THB", now)?;
    println!("  payment created: {payment_id}");

    let slip_id = engine.submit_slip("member-001", b"demo slip image bytes", "image/jpeg")?;
    println!("  slip submitted:  {slip_id}");

    let results = engine.process_eligible()?;
    for (id, disposition) in &results {
        println!("  slip {id}: {}", disposition_str(disposition));
    }

    let stats = engine.dispatch_notifications()?;
    println!("  notifications:   {} sent, {} failed", stats.sent, stats.failed);

    let sweep = engine.run_daily_sweep()?;
    println!(
        "  daily sweep:     {} items, {} failed",
        sweep.items_processed, sweep.items_failed
    );
    Ok(())
}

fn disposition_str(d: &SlipDisposition) -> String {
    match d {
        SlipDisposition::Matched { payment_id } => format!("matched -> {payment_id}"),
        SlipDisposition::Duplicate { existing_slip_id } => {
            format!("duplicate of {existing_slip_id}")
        }
        SlipDisposition::Rejected => "rejected".to_string(),
    }
}

fn str_arg<'a>(args: &'a [String], name: &str, default: &'a str) -> &'a str {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].as_str())
        .unwrap_or(default)
}

fn require_arg<'a>(args: &'a [String], name: &str) -> Result<&'a str> {
    args.windows(2)
        .find(|w| w[0] == name)
        .map(|w| w[1].as_str())
        .ok_or_else(|| anyhow::anyhow!("missing required argument {name}"))
}
