//! Slip records: one uploaded piece of transfer evidence plus the
//! provider's verdict. Slips are never deleted — every upload leaves a
//! permanent audit trail whatever its fate.

use crate::types::{AmountCents, EntityId, UnixTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlipStatus {
    Pending,
    Verifying,
    Verified,
    Matched,
    Rejected,
    Duplicate,
}

impl SlipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::Matched => "matched",
            Self::Rejected => "rejected",
            Self::Duplicate => "duplicate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "verifying" => Some(Self::Verifying),
            "verified" => Some(Self::Verified),
            "matched" => Some(Self::Matched),
            "rejected" => Some(Self::Rejected),
            "duplicate" => Some(Self::Duplicate),
            _ => None,
        }
    }
}

/// Rejection reasons the engine itself assigns. Provider-supplied
/// reasons are stored verbatim instead.
pub mod reason {
    pub const PROVIDER_UNAVAILABLE: &str = "provider_unavailable";
    pub const CIRCUIT_OPEN: &str = "circuit_open";
    pub const NO_MATCHING_PAYMENT: &str = "no_matching_payment";
    pub const AMBIGUOUS_MATCH: &str = "ambiguous_match";
}

#[derive(Debug, Clone)]
pub struct SlipRecord {
    pub slip_id: EntityId,
    pub claimed_payer_id: EntityId,
    pub image_ref: String,
    pub uploaded_at: UnixTime,
    pub status: SlipStatus,
    pub provider_txn_ref: Option<String>,
    pub verified_amount_cents: Option<AmountCents>,
    pub verified_at: Option<UnixTime>,
    pub settled_at: Option<UnixTime>,
    pub failure_reason: Option<String>,
    pub retry_count: i64,
    pub matched_payment_id: Option<EntityId>,
}
