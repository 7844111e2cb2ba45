//! Payment records and the status state machine.
//!
//! Transitions are one-way and validated centrally here. Terminal
//! states are never re-entered by the engine; correcting one requires
//! an administrative override outside this crate.

use crate::types::{AmountCents, EntityId, UnixTime};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    AwaitingVerification,
    Matched,
    Mismatched,
    Expired,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::AwaitingVerification => "awaiting_verification",
            Self::Matched => "matched",
            Self::Mismatched => "mismatched",
            Self::Expired => "expired",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "awaiting_verification" => Some(Self::AwaitingVerification),
            "matched" => Some(Self::Matched),
            "mismatched" => Some(Self::Mismatched),
            "expired" => Some(Self::Expired),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Matched | Self::Mismatched | Self::Expired | Self::Failed
        )
    }

    /// A payment in one of these states can still be settled by a slip.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::AwaitingVerification)
    }

    /// The one-way transition table.
    pub fn can_transition_to(&self, next: PaymentStatus) -> bool {
        use PaymentStatus::*;
        match (self, next) {
            (Pending, AwaitingVerification) => true,
            (Pending, Matched | Mismatched | Expired | Failed) => true,
            (AwaitingVerification, Matched | Mismatched | Expired | Failed) => true,
            _ => false,
        }
    }
}

/// The message kind a terminal transition queues, if any.
/// Failed payments go to manual intervention, not to the member.
pub fn payload_kind_for(status: PaymentStatus) -> Option<&'static str> {
    match status {
        PaymentStatus::Matched => Some("success"),
        PaymentStatus::Mismatched => Some("mismatch"),
        PaymentStatus::Expired => Some("expired"),
        _ => None,
    }
}

/// One expected due for one member in one cohort.
#[derive(Debug, Clone)]
pub struct PaymentRecord {
    pub payment_id: EntityId,
    pub member_id: EntityId,
    pub cohort_id: EntityId,
    pub expected_amount_cents: AmountCents,
    pub currency: String,
    pub due_at: UnixTime,
    pub status: PaymentStatus,
    pub version: i64,
    pub matched_slip_id: Option<EntityId>,
    pub created_at: UnixTime,
    pub updated_at: UnixTime,
}

#[cfg(test)]
mod tests {
    use super::*;
    use PaymentStatus::*;

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [Matched, Mismatched, Expired, Failed] {
            for next in [
                Pending,
                AwaitingVerification,
                Matched,
                Mismatched,
                Expired,
                Failed,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal:?} must not transition to {next:?}"
                );
            }
        }
    }

    #[test]
    fn pending_reaches_all_terminals() {
        for next in [Matched, Mismatched, Expired, Failed] {
            assert!(Pending.can_transition_to(next));
            assert!(AwaitingVerification.can_transition_to(next));
        }
    }

    #[test]
    fn awaiting_cannot_regress() {
        assert!(!AwaitingVerification.can_transition_to(Pending));
    }

    #[test]
    fn payload_kinds() {
        assert_eq!(payload_kind_for(Matched), Some("success"));
        assert_eq!(payload_kind_for(Mismatched), Some("mismatch"));
        assert_eq!(payload_kind_for(Expired), Some("expired"));
        assert_eq!(payload_kind_for(Failed), None);
        assert_eq!(payload_kind_for(Pending), None);
    }

    #[test]
    fn status_strings_round_trip() {
        for s in [Pending, AwaitingVerification, Matched, Mismatched, Expired, Failed] {
            assert_eq!(PaymentStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(PaymentStatus::parse("bogus"), None);
    }
}
