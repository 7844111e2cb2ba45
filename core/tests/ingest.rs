//! Slip ingestion tests: upload validation, blob storage, and the
//! pending-dues side effect.

use dues_core::clock::{Clock, ManualClock};
use dues_core::config::EngineConfig;
use dues_core::engine::Engine;
use dues_core::error::EngineError;
use dues_core::payment::PaymentStatus;
use dues_core::ports::{
    MemoryBlobStore, RecordingMessenger, ScriptedVerifier, VerificationResult,
};
use dues_core::slip::SlipStatus;
use dues_core::store::EngineStore;
use std::sync::Arc;

type TestEngine = Engine<MemoryBlobStore, ScriptedVerifier, RecordingMessenger>;

fn build() -> (TestEngine, Arc<ManualClock>) {
    let clock = ManualClock::fixed();
    let verifier = ScriptedVerifier::always(VerificationResult {
        provider_txn_ref: "TXN-0001".into(),
        amount_cents: 50_000,
        settled_at: clock.now_unix(),
        sender_hint: None,
    });
    let engine = Engine::new(
        EngineStore::in_memory().unwrap(),
        EngineConfig::default_test(),
        clock.clone(),
        MemoryBlobStore::new(),
        verifier,
        RecordingMessenger::new(),
    )
    .unwrap();
    (engine, clock)
}

/// A valid upload persists a pending slip and an audit event.
#[test]
fn valid_upload_creates_pending_slip() {
    let (mut engine, _clock) = build();
    let slip_id = engine
        .submit_slip("member-001", b"jpeg bytes", "image/jpeg")
        .unwrap();

    let slip = engine.store().get_slip(&slip_id).unwrap();
    assert_eq!(slip.status, SlipStatus::Pending);
    assert_eq!(slip.claimed_payer_id, "member-001");
    assert!(slip.image_ref.starts_with("blob/"));
    assert_eq!(engine.store().event_count("slip_submitted").unwrap(), 1);
}

/// Uploading a slip moves the payer's pending dues to
/// awaiting_verification, and repeat uploads leave them there.
#[test]
fn upload_wakes_the_payers_pending_dues() {
    let (mut engine, clock) = build();
    let now = clock.now_unix();
    let payment_id = engine
        .create_payment("member-001", "cohort-a", 50_000, "THB", now + 86_400)
        .unwrap();

    engine.submit_slip("member-001", b"a", "image/jpeg").unwrap();
    let p = engine.store().get_payment(&payment_id).unwrap();
    assert_eq!(p.status, PaymentStatus::AwaitingVerification);
    assert_eq!(p.version, 1);

    // Second upload: status unchanged, no extra version bump.
    engine.submit_slip("member-001", b"b", "image/jpeg").unwrap();
    let p = engine.store().get_payment(&payment_id).unwrap();
    assert_eq!(p.status, PaymentStatus::AwaitingVerification);
    assert_eq!(p.version, 1);
}

/// Unsupported content types are refused before anything is stored.
#[test]
fn unsupported_content_type_is_rejected() {
    let (mut engine, _clock) = build();
    let err = engine
        .submit_slip("member-001", b"%PDF-1.4", "application/pdf")
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidUpload(_)), "got {err}");
    assert_eq!(engine.store().slip_count_by_status(SlipStatus::Pending).unwrap(), 0);
}

/// Empty and oversized images are both invalid uploads.
#[test]
fn empty_and_oversized_images_are_rejected() {
    let (mut engine, _clock) = build();

    let err = engine.submit_slip("member-001", b"", "image/jpeg").unwrap_err();
    assert!(matches!(err, EngineError::InvalidUpload(_)));

    let max = engine.config().ingest.max_image_bytes;
    let big = vec![0u8; max + 1];
    let err = engine.submit_slip("member-001", &big, "image/jpeg").unwrap_err();
    assert!(matches!(err, EngineError::InvalidUpload(_)));
}

/// A blob store outage surfaces as StorageUnavailable and leaves no
/// slip row behind.
#[test]
fn storage_outage_leaves_nothing_behind() {
    let clock = ManualClock::fixed();
    let mut blob = MemoryBlobStore::new();
    blob.unavailable = true;
    let verifier = ScriptedVerifier::always(VerificationResult {
        provider_txn_ref: "TXN-0001".into(),
        amount_cents: 1,
        settled_at: clock.now_unix(),
        sender_hint: None,
    });
    let mut engine = Engine::new(
        EngineStore::in_memory().unwrap(),
        EngineConfig::default_test(),
        clock,
        blob,
        verifier,
        RecordingMessenger::new(),
    )
    .unwrap();

    let err = engine.submit_slip("member-001", b"bytes", "image/jpeg").unwrap_err();
    assert!(matches!(err, EngineError::StorageUnavailable(_)), "got {err}");
    assert_eq!(engine.store().slip_count_by_status(SlipStatus::Pending).unwrap(), 0);
    assert_eq!(engine.store().event_count("slip_submitted").unwrap(), 0);
}
