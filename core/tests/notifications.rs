//! Notification tests: one message per terminal transition, dispatch
//! retries, and the failed-task dead end.

use dues_core::clock::{Clock, ManualClock};
use dues_core::config::EngineConfig;
use dues_core::engine::Engine;
use dues_core::notifier::TaskStatus;
use dues_core::ports::{
    MemoryBlobStore, RecordingMessenger, ScriptedVerifier, VerificationOutcome,
    VerificationResult,
};
use dues_core::store::EngineStore;
use std::sync::Arc;

type TestEngine = Engine<MemoryBlobStore, ScriptedVerifier, RecordingMessenger>;

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

/// Match a fresh due end to end, leaving one queued notification.
fn match_one(engine: &mut TestEngine, member: &str) -> String {
    let now = ManualClock::fixed().now_unix();
    let payment_id = engine
        .create_payment(member, "cohort-a", 50_000, "THB", now)
        .unwrap();
    let slip_id = engine.submit_slip(member, b"img", "image/jpeg").unwrap();
    engine.process_slip(&slip_id).unwrap();
    payment_id
}

/// A matched payment queues exactly one success notification, and
/// dispatch delivers exactly one message to the member.
#[test]
fn matched_payment_notifies_exactly_once() {
    let now = ManualClock::fixed().now_unix();
    let (mut engine, _clock) = build(vec![success("TXN-A", 50_000, now)]);
    let payment_id = match_one(&mut engine, "member-001");

    let tasks = engine.store().tasks_for_payment(&payment_id).unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].payload_kind, "success");
    assert_eq!(tasks[0].status, TaskStatus::Queued);

    let stats = engine.dispatch_notifications().unwrap();
    assert_eq!(stats.sent, 1);
    assert_eq!(stats.failed, 0);
    assert_eq!(
        engine.messenger().sent,
        vec![("member-001".to_string(), "success".to_string())]
    );

    // Dispatching again finds an empty queue.
    let stats = engine.dispatch_notifications().unwrap();
    assert_eq!(stats.sent, 0);
    assert_eq!(engine.messenger().sent.len(), 1);
}

/// Transient channel failures are retried within the attempt budget.
#[test]
fn transient_send_failures_are_retried() {
    let now = ManualClock::fixed().now_unix();
    let (mut engine, _clock) = build(vec![success("TXN-B", 50_000, now)]);
    engine.messenger_mut().transient_failures = 2;
    let payment_id = match_one(&mut engine, "member-001");

    let stats = engine.dispatch_notifications().unwrap();
    assert_eq!(stats.sent, 1, "third attempt should succeed");

    let tasks = engine.store().tasks_for_payment(&payment_id).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Sent);
    assert_eq!(tasks[0].attempts, 3);
    assert_eq!(engine.store().event_count("notification_sent").unwrap(), 1);
}

/// Exhausting the send budget marks the task failed for manual
/// follow-up; the payment itself is untouched.
#[test]
fn exhausted_sends_mark_the_task_failed() {
    let now = ManualClock::fixed().now_unix();
    let (mut engine, _clock) = build(vec![success("TXN-C", 50_000, now)]);
    engine.messenger_mut().transient_failures = 99;
    let payment_id = match_one(&mut engine, "member-001");

    let stats = engine.dispatch_notifications().unwrap();
    assert_eq!(stats.sent, 0);
    assert_eq!(stats.failed, 1);

    let tasks = engine.store().tasks_for_payment(&payment_id).unwrap();
    assert_eq!(tasks[0].status, TaskStatus::Failed);
    assert_eq!(tasks[0].attempts, 3);
    assert_eq!(engine.store().event_count("notification_failed").unwrap(), 1);
    assert!(engine
        .store()
        .get_payment(&payment_id)
        .unwrap()
        .status
        .is_terminal());
}

/// Delivery receipts from the channel land on the task row.
#[test]
fn delivery_receipt_is_recorded() {
    let now = ManualClock::fixed().now_unix();
    let (mut engine, _clock) = build(vec![success("TXN-D", 50_000, now)]);
    let payment_id = match_one(&mut engine, "member-001");
    engine.dispatch_notifications().unwrap();

    let task_id = engine.store().tasks_for_payment(&payment_id).unwrap()[0]
        .task_id
        .clone();
    engine.record_delivery(&task_id, true).unwrap();

    let task = &engine.store().tasks_for_payment(&payment_id).unwrap()[0];
    assert_eq!(task.delivered, Some(true));
}
