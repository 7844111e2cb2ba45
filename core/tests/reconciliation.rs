//! Reconciliation sweep tests: expiry with grace, the mismatch
//! verdict, stale-slip recovery, the single-active-run guard, and the
//! monthly summary.

use chrono::TimeZone;
use dues_core::clock::{Clock, ManualClock};
use dues_core::config::EngineConfig;
use dues_core::engine::Engine;
use dues_core::error::EngineError;
use dues_core::payment::PaymentStatus;
use dues_core::ports::{
    MemoryBlobStore, RecordingMessenger, ScriptedVerifier, VerificationOutcome,
    VerificationResult,
};
use dues_core::scheduler::RunKind;
use dues_core::slip::{reason, SlipStatus};
use dues_core::store::EngineStore;
use std::sync::Arc;

type TestEngine = Engine<MemoryBlobStore, ScriptedVerifier, RecordingMessenger>;

const DAY: i64 = 86_400;

fn success(txn_ref: &str, amount_cents: i64, settled_at: i64) -> VerificationOutcome {
    VerificationOutcome::Success(VerificationResult {
        provider_txn_ref: txn_ref.into(),
        amount_cents,
        settled_at,
        sender_hint: None,
    })
}

fn build(script: Vec<VerificationOutcome>) -> (TestEngine, Arc<ManualClock>) {
    let clock = ManualClock::fixed();
    let engine = Engine::new(
        EngineStore::in_memory().unwrap(),
        EngineConfig::default_test(),
        clock.clone(),
        MemoryBlobStore::new(),
        ScriptedVerifier::new(script),
        RecordingMessenger::new(),
    )
    .unwrap();
    (engine, clock)
}

/// A payment past its grace period with no slip activity expires, gets
/// one notification, and a second sweep changes nothing.
#[test]
fn overdue_payment_expires_exactly_once() {
    let (engine, clock) = build(vec![success("TXN-A", 1, 0)]);
    let now = clock.now_unix();
    let payment_id = engine
        .create_payment("member-001", "cohort-a", 50_000, "THB", now - 4 * DAY)
        .unwrap();

    let stats = engine.run_daily_sweep().unwrap();
    assert_eq!(stats.payments_expired, 1);
    assert_eq!(stats.payments_mismatched, 0);

    let payment = engine.store().get_payment(&payment_id).unwrap();
    assert_eq!(payment.status, PaymentStatus::Expired);
    assert_eq!(engine.store().event_count("payment_expired").unwrap(), 1);

    let tasks = engine.store().tasks_for_payment(&payment_id).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].payload_kind, "expired");

    // Idempotent: the payment is terminal, so the second sweep sees it
    // as nothing to do.
    let stats = engine.run_daily_sweep().unwrap();
    assert_eq!(stats.payments_expired, 0);
    assert_eq!(engine.store().tasks_for_payment(&payment_id).unwrap().len(), 1);
    assert_eq!(engine.store().event_count("payment_expired").unwrap(), 1);
}

/// A payment still inside its grace period is left alone.
#[test]
fn grace_period_defers_expiry() {
    let (engine, clock) = build(vec![success("TXN-B", 1, 0)]);
    let now = clock.now_unix();
    let payment_id = engine
        .create_payment("member-001", "cohort-a", 50_000, "THB", now - 2 * DAY)
        .unwrap();

    let stats = engine.run_daily_sweep().unwrap();
    assert_eq!(stats.payments_expired, 0);
    assert!(engine
        .store()
        .get_payment(&payment_id)
        .unwrap()
        .status
        .is_outstanding());
}

/// A payer whose slip dead-ended (wrong amount) gets the mismatched
/// verdict instead of plain expiry.
#[test]
fn dead_end_slip_turns_expiry_into_mismatch() {
    let (mut engine, clock) = build(vec![success("TXN-C", 45_000, ManualClock::fixed().now_unix())]);
    let now = clock.now_unix();
    let payment_id = engine
        .create_payment("member-001", "cohort-a", 50_000, "THB", now - 4 * DAY)
        .unwrap();

    // The slip verifies at 450.00 against a 500.00 due: no match.
    let slip_id = engine.submit_slip("member-001", b"img", "image/jpeg").unwrap();
    engine.process_slip(&slip_id).unwrap();
    let slip = engine.store().get_slip(&slip_id).unwrap();
    assert_eq!(slip.failure_reason.as_deref(), Some(reason::NO_MATCHING_PAYMENT));

    let stats = engine.run_daily_sweep().unwrap();
    assert_eq!(stats.payments_mismatched, 1);
    assert_eq!(stats.payments_expired, 0);

    let payment = engine.store().get_payment(&payment_id).unwrap();
    assert_eq!(payment.status, PaymentStatus::Mismatched);
    let tasks = engine.store().tasks_for_payment(&payment_id).unwrap();
    assert_eq!(tasks[0].payload_kind, "mismatch");
}

/// A slip stuck in verifying past the staleness cutoff goes back to
/// pending.
#[test]
fn stale_slip_is_requeued() {
    let (mut engine, clock) = build(vec![success("TXN-D", 1, 0)]);
    let slip_id = engine.submit_slip("member-001", b"img", "image/jpeg").unwrap();
    engine.store().set_slip_verifying(&slip_id).unwrap();

    clock.advance(chrono::Duration::hours(7));
    let stats = engine.run_daily_sweep().unwrap();
    assert_eq!(stats.slips_requeued, 1);
    assert_eq!(
        engine.store().get_slip(&slip_id).unwrap().status,
        SlipStatus::Pending
    );
}

/// Provider-outage rejects are re-queued while their retry budget
/// lasts, and left alone once it is spent.
#[test]
fn provider_outage_slips_respect_the_retry_budget() {
    let (mut engine, _clock) = build(vec![VerificationOutcome::Transient("down".into())]);
    let slip_id = engine.submit_slip("member-001", b"img", "image/jpeg").unwrap();
    engine.process_slip(&slip_id).unwrap();
    assert_eq!(
        engine.store().get_slip(&slip_id).unwrap().failure_reason.as_deref(),
        Some(reason::PROVIDER_UNAVAILABLE)
    );

    let stats = engine.run_daily_sweep().unwrap();
    assert_eq!(stats.slips_retried, 1);
    let slip = engine.store().get_slip(&slip_id).unwrap();
    assert_eq!(slip.status, SlipStatus::Pending);
    assert_eq!(slip.retry_count, 1);

    // Burn the rest of the budget, then verify the sweep stops.
    engine.store().set_slip_rejected(&slip_id, reason::PROVIDER_UNAVAILABLE).unwrap();
    engine.store().increment_slip_retry(&slip_id).unwrap();
    engine.store().increment_slip_retry(&slip_id).unwrap();
    let stats = engine.run_daily_sweep().unwrap();
    assert_eq!(stats.slips_retried, 0);
    assert_eq!(
        engine.store().get_slip(&slip_id).unwrap().status,
        SlipStatus::Rejected
    );
}

/// A sweep aborted by a storage error still closes its run row, so
/// later sweeps of the same kind are not refused forever.
#[test]
fn aborted_sweep_still_closes_its_run() {
    let path = std::env::temp_dir().join(format!("dues-abort-{}.db", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let path = path.to_string_lossy().into_owned();
    let engine: TestEngine = Engine::new(
        EngineStore::open(&path).unwrap(),
        EngineConfig::default_test(),
        ManualClock::fixed(),
        MemoryBlobStore::new(),
        ScriptedVerifier::new(vec![success("TXN-ABORT", 1, 0)]),
        RecordingMessenger::new(),
    )
    .unwrap();

    // Knock the audit table out from a second connection so both sweep
    // kinds abort mid-flight.
    let raw = rusqlite::Connection::open(&path).unwrap();
    raw.execute_batch("DROP TABLE event_log;").unwrap();
    assert!(engine.run_daily_sweep().is_err());
    assert!(engine.run_monthly_sweep().is_err());

    // The failed runs were closed: once the table is back, the next
    // sweeps proceed instead of hitting the active-run guard.
    raw.execute_batch(
        "CREATE TABLE event_log (
            id         INTEGER PRIMARY KEY AUTOINCREMENT,
            component  TEXT NOT NULL,
            event_type TEXT NOT NULL,
            payload    TEXT NOT NULL,
            at         INTEGER NOT NULL
        );",
    )
    .unwrap();
    engine.run_daily_sweep().unwrap();
    engine.run_monthly_sweep().unwrap();
    assert_eq!(engine.store().run_count(RunKind::Daily).unwrap(), 2);
    assert_eq!(engine.store().run_count(RunKind::Monthly).unwrap(), 2);
    let _ = std::fs::remove_file(&path);
}

/// Only one run of a kind may be active at a time.
#[test]
fn overlapping_runs_of_one_kind_are_refused() {
    let (engine, clock) = build(vec![success("TXN-E", 1, 0)]);
    let now = clock.now_unix();
    engine.store().begin_run("run-held", RunKind::Daily, now).unwrap();

    let err = engine.run_daily_sweep().unwrap_err();
    assert!(matches!(err, EngineError::RunAlreadyActive { .. }), "got {err}");

    // A monthly run is a different kind and proceeds.
    engine.run_monthly_sweep().unwrap();

    // Completing the held run unblocks the next daily sweep.
    engine.store().complete_run("run-held", now, 0, 0).unwrap();
    engine.run_daily_sweep().unwrap();
    assert_eq!(engine.store().run_count(RunKind::Daily).unwrap(), 2);
}

/// The monthly sweep aggregates the previous calendar month's terminal
/// payments and re-running the period overwrites, not duplicates.
#[test]
fn monthly_summary_aggregates_the_previous_month() {
    let now = chrono::Utc
        .with_ymd_and_hms(2024, 4, 10, 9, 0, 0)
        .unwrap()
        .timestamp();
    let (mut engine, clock) = build(vec![
        success("TXN-M1", 50_000, now),
        success("TXN-M2", 30_000, now),
    ]);
    clock.set(chrono::Utc.with_ymd_and_hms(2024, 4, 10, 9, 0, 0).unwrap());

    // One matched due in April.
    engine.create_payment("member-001", "cohort-a", 50_000, "THB", now).unwrap();
    let s1 = engine.submit_slip("member-001", b"img", "image/jpeg").unwrap();
    engine.process_slip(&s1).unwrap();

    // One due that expires in April.
    engine
        .create_payment("member-002", "cohort-a", 20_000, "THB", now - 5 * DAY)
        .unwrap();
    engine.run_daily_sweep().unwrap();

    clock.set(chrono::Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap());
    let summary = engine.run_monthly_sweep().unwrap();
    assert_eq!(summary.period, "2024-04");
    assert_eq!(summary.matched_count, 1);
    assert_eq!(summary.matched_amount_cents, 50_000);
    assert_eq!(summary.expired_count, 1);
    assert_eq!(summary.expired_amount_cents, 20_000);
    assert_eq!(summary.mismatched_count, 0);

    // Second matched due later in April, then a re-run of the period.
    clock.set(chrono::Utc.with_ymd_and_hms(2024, 4, 20, 9, 0, 0).unwrap());
    engine.create_payment("member-003", "cohort-a", 30_000, "THB", now).unwrap();
    let s2 = engine.submit_slip("member-003", b"img", "image/jpeg").unwrap();
    engine.process_slip(&s2).unwrap();

    clock.set(chrono::Utc.with_ymd_and_hms(2024, 5, 2, 1, 0, 0).unwrap());
    let again = engine.run_monthly_sweep().unwrap();
    assert_eq!(again.matched_count, 2);
    assert_eq!(again.matched_amount_cents, 80_000);

    let stored = engine.store().get_monthly_summary("2024-04").unwrap().unwrap();
    assert_eq!(stored.matched_count, 2);
    assert_eq!(engine.store().run_count(RunKind::Monthly).unwrap(), 2);
}
