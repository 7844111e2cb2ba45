//! Ports to the three external collaborators: the blob store holding
//! slip images, the slip-verification provider, and the messaging
//! channel. The engine only ever sees these traits; production
//! adapters live outside this crate.

use crate::types::{AmountCents, UnixTime};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ── Blob store ─────────────────────────────────────────────────────

/// Opaque image storage. `put` either durably accepts the bytes and
/// returns a stable reference, or fails whole — no partial writes.
pub trait BlobStore {
    fn put(&mut self, bytes: &[u8], content_type: &str) -> Result<String, String>;
}

// ── Verification provider ──────────────────────────────────────────

/// Transaction data the provider extracts from a slip image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationResult {
    pub provider_txn_ref: String,
    pub amount_cents: AmountCents,
    pub settled_at: UnixTime,
    pub sender_hint: Option<String>,
}

/// Every provider response falls into exactly one of these. Callers
/// must handle all three; there is no untyped error path.
#[derive(Debug, Clone)]
pub enum VerificationOutcome {
    Success(VerificationResult),
    /// Timeout, 5xx, rate limit — worth retrying.
    Transient(String),
    /// The provider examined the image and said no. Never retried.
    Permanent(String),
}

pub trait SlipVerifier {
    fn verify(&mut self, image_ref: &str) -> VerificationOutcome;
}

// ── Messaging channel ──────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum SendOutcome {
    Sent,
    /// Channel throttling or transport hiccup — worth retrying.
    Transient(String),
    /// The channel refused the message outright.
    Permanent(String),
}

pub trait Messenger {
    fn send(&mut self, recipient: &str, payload_kind: &str, payment_id: &str) -> SendOutcome;
}

// ── In-process implementations ─────────────────────────────────────

/// Keeps blobs in a map. Backs the runner's demo mode and most tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: HashMap<String, Vec<u8>>,
    next_id: u64,
    /// When set, every `put` fails — simulates a storage outage.
    pub unavailable: bool,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&mut self, bytes: &[u8], content_type: &str) -> Result<String, String> {
        if self.unavailable {
            return Err("blob store offline".into());
        }
        self.next_id += 1;
        let ext = match content_type {
            "image/png" => "png",
            _ => "jpg",
        };
        let image_ref = format!("blob/{:08}.{ext}", self.next_id);
        self.blobs.insert(image_ref.clone(), bytes.to_vec());
        Ok(image_ref)
    }
}

/// Replays a scripted sequence of outcomes, then repeats the last one.
/// Lets tests express "fail transiently three times, then succeed".
pub struct ScriptedVerifier {
    script: Vec<VerificationOutcome>,
    cursor: usize,
    pub calls: u32,
}

impl ScriptedVerifier {
    pub fn new(script: Vec<VerificationOutcome>) -> Self {
        assert!(!script.is_empty(), "script must not be empty");
        Self {
            script,
            cursor: 0,
            calls: 0,
        }
    }

    /// Always succeeds with the given result.
    pub fn always(result: VerificationResult) -> Self {
        Self::new(vec![VerificationOutcome::Success(result)])
    }
}

impl SlipVerifier for ScriptedVerifier {
    fn verify(&mut self, _image_ref: &str) -> VerificationOutcome {
        self.calls += 1;
        let outcome = self.script[self.cursor].clone();
        if self.cursor + 1 < self.script.len() {
            self.cursor += 1;
        }
        outcome
    }
}

/// Records every send; optionally fails the first `transient_failures`
/// attempts per task before succeeding.
#[derive(Default)]
pub struct RecordingMessenger {
    pub sent: Vec<(String, String)>, // (recipient, payload_kind)
    pub transient_failures: u32,
    failures_seen: HashMap<String, u32>,
}

impl RecordingMessenger {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Messenger for RecordingMessenger {
    fn send(&mut self, recipient: &str, payload_kind: &str, payment_id: &str) -> SendOutcome {
        let seen = self.failures_seen.entry(payment_id.to_string()).or_insert(0);
        if *seen < self.transient_failures {
            *seen += 1;
            return SendOutcome::Transient("channel throttled".into());
        }
        self.sent.push((recipient.to_string(), payload_kind.to_string()));
        SendOutcome::Sent
    }
}
