//! Deterministic slip-to-payment matching.
//!
//! RULE: a provider transaction reference settles at most one payment,
//! ever. The dedup lookup runs before candidate selection, so a replayed
//! slip is marked duplicate without touching any payment.
//!
//! Candidate selection is a pure query: same payer, amount within
//! tolerance, due date inside the settlement window. Exactly one
//! candidate settles; zero or several dead-end the slip for manual
//! resolution rather than guessing.

use crate::clock::Clock;
use crate::config::MatchConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::EngineEvent;
use crate::slip::{reason, SlipRecord, SlipStatus};
use crate::store::EngineStore;
use crate::types::EntityId;
use std::sync::Arc;

const DAY_SECS: i64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    Matched { payment_id: EntityId },
    Duplicate { existing_slip_id: EntityId },
    NoMatch,
    Ambiguous { candidates: Vec<EntityId> },
}

pub struct PaymentMatcher {
    config: MatchConfig,
    clock: Arc<dyn Clock>,
}

impl PaymentMatcher {
    pub fn new(config: MatchConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, clock }
    }

    /// Try to settle one verified slip against the payer's outstanding
    /// dues. The slip always leaves in a definite state: matched,
    /// duplicate, or rejected with a reason.
    pub fn match_slip(&self, store: &EngineStore, slip_id: &str) -> EngineResult<MatchOutcome> {
        let slip = store.get_slip(slip_id)?;
        if slip.status != SlipStatus::Verified {
            return Err(EngineError::Other(anyhow::anyhow!(
                "slip {slip_id} is {}, not matchable",
                slip.status.as_str()
            )));
        }
        let (txn_ref, amount, settled_at) = self.verified_fields(&slip)?;

        if let Some(holder) = store.txn_ref_holder(&txn_ref, slip_id)? {
            store.set_slip_duplicate(slip_id)?;
            store.record_event(
                "matcher",
                &EngineEvent::SlipMarkedDuplicate {
                    slip_id: slip_id.to_string(),
                    provider_txn_ref: txn_ref.clone(),
                    existing_slip_id: holder.slip_id.clone(),
                },
                self.clock.now_unix(),
            )?;
            log::warn!(
                "slip {slip_id}: txn ref {txn_ref} already held by slip {}",
                holder.slip_id
            );
            return Ok(MatchOutcome::Duplicate {
                existing_slip_id: holder.slip_id,
            });
        }

        let window_start = settled_at - self.config.window_lookback_days * DAY_SECS;
        let window_end = settled_at + self.config.window_lookahead_days * DAY_SECS;

        // One retry on version conflict covers the common race (a
        // concurrent slip settled one of our candidates while we read).
        // Losing twice means contention worth a human look.
        for pass in 0..2 {
            let candidates = store.candidate_payments(
                &slip.claimed_payer_id,
                amount,
                self.config.amount_tolerance_cents,
                window_start,
                window_end,
            )?;

            match candidates.len() {
                0 => return self.reject(store, slip_id, reason::NO_MATCHING_PAYMENT, MatchOutcome::NoMatch),
                1 => {
                    let payment = &candidates[0];
                    let now = self.clock.now_unix();
                    match store.try_match_payment(&payment.payment_id, slip_id, payment.version, now) {
                        Ok(()) => {
                            store.set_slip_matched(slip_id, &payment.payment_id)?;
                            store.record_event(
                                "matcher",
                                &EngineEvent::PaymentMatched {
                                    payment_id: payment.payment_id.clone(),
                                    slip_id: slip_id.to_string(),
                                    amount_cents: amount,
                                },
                                now,
                            )?;
                            log::info!(
                                "payment {} matched by slip {slip_id} ({amount}c)",
                                payment.payment_id
                            );
                            return Ok(MatchOutcome::Matched {
                                payment_id: payment.payment_id.clone(),
                            });
                        }
                        Err(EngineError::VersionConflict { .. }) if pass == 0 => {
                            log::debug!(
                                "slip {slip_id}: lost match race on payment {}, re-selecting",
                                payment.payment_id
                            );
                            continue;
                        }
                        Err(EngineError::VersionConflict { .. }) => break,
                        Err(e) => return Err(e),
                    }
                }
                _ => {
                    let ids: Vec<EntityId> =
                        candidates.iter().map(|p| p.payment_id.clone()).collect();
                    log::warn!(
                        "slip {slip_id}: {} candidate payments, refusing to guess",
                        ids.len()
                    );
                    return self.reject(
                        store,
                        slip_id,
                        reason::AMBIGUOUS_MATCH,
                        MatchOutcome::Ambiguous { candidates: ids },
                    );
                }
            }
        }

        // Lost the race twice running. Contention like this wants a
        // human look, so the slip dead-ends instead of spinning.
        self.reject(
            store,
            slip_id,
            reason::AMBIGUOUS_MATCH,
            MatchOutcome::Ambiguous { candidates: vec![] },
        )
    }

    fn verified_fields(&self, slip: &SlipRecord) -> EngineResult<(String, i64, i64)> {
        match (&slip.provider_txn_ref, slip.verified_amount_cents, slip.settled_at) {
            (Some(txn_ref), Some(amount), Some(settled_at)) => {
                Ok((txn_ref.clone(), amount, settled_at))
            }
            _ => Err(EngineError::Other(anyhow::anyhow!(
                "slip {} is verified but missing provider fields",
                slip.slip_id
            ))),
        }
    }

    fn reject(
        &self,
        store: &EngineStore,
        slip_id: &str,
        why: &'static str,
        outcome: MatchOutcome,
    ) -> EngineResult<MatchOutcome> {
        store.set_slip_rejected(slip_id, why)?;
        store.record_event(
            "matcher",
            &EngineEvent::SlipRejected {
                slip_id: slip_id.to_string(),
                reason: why.to_string(),
            },
            self.clock.now_unix(),
        )?;
        Ok(outcome)
    }
}
