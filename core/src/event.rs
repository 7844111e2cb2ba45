//! Audit events.
//!
//! Every externally observable state change is appended to the event
//! log. A slip or a due may dead-end, but its trail never disappears —
//! operators resolve mismatches and failures from this log.

use crate::types::{AmountCents, EntityId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // ── Ingestion ──────────────────────────────────
    SlipSubmitted {
        slip_id: EntityId,
        claimed_payer_id: EntityId,
        image_ref: String,
    },

    // ── Verification ───────────────────────────────
    SlipVerified {
        slip_id: EntityId,
        provider_txn_ref: String,
        amount_cents: AmountCents,
    },
    SlipRejected {
        slip_id: EntityId,
        reason: String,
    },
    CircuitOpened {
        consecutive_failures: u32,
    },
    CircuitClosed,

    // ── Matching ───────────────────────────────────
    SlipMarkedDuplicate {
        slip_id: EntityId,
        provider_txn_ref: String,
        existing_slip_id: EntityId,
    },
    PaymentMatched {
        payment_id: EntityId,
        slip_id: EntityId,
        amount_cents: AmountCents,
    },

    // ── Lifecycle ──────────────────────────────────
    PaymentExpired {
        payment_id: EntityId,
    },
    PaymentMismatched {
        payment_id: EntityId,
    },

    // ── Notifications ──────────────────────────────
    NotificationQueued {
        task_id: EntityId,
        payment_id: EntityId,
        payload_kind: String,
    },
    NotificationSent {
        task_id: EntityId,
        attempts: u32,
    },
    NotificationFailed {
        task_id: EntityId,
        attempts: u32,
        reason: String,
    },

    // ── Sweeps ─────────────────────────────────────
    SweepStarted {
        run_id: EntityId,
        kind: String,
    },
    SweepCompleted {
        run_id: EntityId,
        kind: String,
        items_processed: i64,
        items_failed: i64,
    },
}

impl EngineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::SlipSubmitted { .. } => "slip_submitted",
            Self::SlipVerified { .. } => "slip_verified",
            Self::SlipRejected { .. } => "slip_rejected",
            Self::CircuitOpened { .. } => "circuit_opened",
            Self::CircuitClosed => "circuit_closed",
            Self::SlipMarkedDuplicate { .. } => "slip_marked_duplicate",
            Self::PaymentMatched { .. } => "payment_matched",
            Self::PaymentExpired { .. } => "payment_expired",
            Self::PaymentMismatched { .. } => "payment_mismatched",
            Self::NotificationQueued { .. } => "notification_queued",
            Self::NotificationSent { .. } => "notification_sent",
            Self::NotificationFailed { .. } => "notification_failed",
            Self::SweepStarted { .. } => "sweep_started",
            Self::SweepCompleted { .. } => "sweep_completed",
        }
    }
}

/// One persisted row of the audit log.
#[derive(Debug, Clone)]
pub struct EventLogEntry {
    pub id: Option<i64>,
    pub component: String,
    pub event_type: String,
    pub payload: String,
    pub at: i64,
}
