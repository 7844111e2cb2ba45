//! Verification provider client: bounded retries with exponential
//! backoff and deterministic jitter, fronted by the circuit breaker.
//!
//! Outcome handling is exhaustive over the tagged provider result:
//!   Success   -> slip verified
//!   Permanent -> slip rejected with the provider's reason, no retry
//!   Transient -> retried up to the cap, then rejected
//!                with "provider_unavailable" (daily sweep re-queues)

use crate::breaker::{CircuitBreaker, CircuitState};
use crate::clock::Clock;
use crate::config::RetryPolicy;
use crate::error::{EngineError, EngineResult};
use crate::event::EngineEvent;
use crate::ports::{SlipVerifier, VerificationOutcome};
use crate::rng::JitterRng;
use crate::slip::{reason, SlipStatus};
use crate::store::EngineStore;
use std::sync::Arc;
use std::time::Duration;

pub struct ProviderClient {
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    rng: JitterRng,
    clock: Arc<dyn Clock>,
}

impl ProviderClient {
    pub fn new(
        retry: RetryPolicy,
        breaker: CircuitBreaker,
        rng: JitterRng,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            retry,
            breaker,
            rng,
            clock,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Run one slip through provider verification. Returns the slip's
    /// resulting status; the verdict details land on the slip row.
    pub fn verify_slip(
        &mut self,
        store: &EngineStore,
        verifier: &mut dyn SlipVerifier,
        slip_id: &str,
    ) -> EngineResult<SlipStatus> {
        let slip = store.get_slip(slip_id)?;
        match slip.status {
            SlipStatus::Pending | SlipStatus::Verifying => {}
            other => {
                return Err(EngineError::Other(anyhow::anyhow!(
                    "slip {slip_id} is {}, not verifiable",
                    other.as_str()
                )))
            }
        }

        store.set_slip_verifying(slip_id)?;

        let mut attempt: u32 = 0;
        loop {
            if !self.breaker.allow() {
                return self.reject(store, slip_id, reason::CIRCUIT_OPEN);
            }
            attempt += 1;

            match verifier.verify(&slip.image_ref) {
                VerificationOutcome::Success(result) => {
                    let recovered = self.breaker.state() != CircuitState::Closed;
                    self.breaker.record_success();
                    let now = self.clock.now_unix();
                    if recovered {
                        store.record_event("provider", &EngineEvent::CircuitClosed, now)?;
                        log::info!("provider circuit closed after successful probe");
                    }
                    store.set_slip_verified(
                        slip_id,
                        &result.provider_txn_ref,
                        result.amount_cents,
                        now,
                        result.settled_at,
                    )?;
                    store.record_event(
                        "provider",
                        &EngineEvent::SlipVerified {
                            slip_id: slip_id.to_string(),
                            provider_txn_ref: result.provider_txn_ref.clone(),
                            amount_cents: result.amount_cents,
                        },
                        now,
                    )?;
                    log::info!(
                        "slip {slip_id} verified: ref={} amount={}c (attempt {attempt})",
                        result.provider_txn_ref,
                        result.amount_cents
                    );
                    return Ok(SlipStatus::Verified);
                }
                VerificationOutcome::Permanent(why) => {
                    // The provider looked and said no. Not a health
                    // signal, so the breaker is untouched.
                    log::warn!("slip {slip_id} rejected by provider: {why}");
                    return self.reject(store, slip_id, &why);
                }
                VerificationOutcome::Transient(why) => {
                    let tripped = self.breaker.record_failure();
                    if tripped {
                        store.record_event(
                            "provider",
                            &EngineEvent::CircuitOpened {
                                consecutive_failures: self.breaker.consecutive_failures(),
                            },
                            self.clock.now_unix(),
                        )?;
                        log::warn!("provider circuit opened after {attempt} attempts: {why}");
                    }
                    if attempt >= self.retry.max_attempts {
                        log::warn!(
                            "slip {slip_id}: provider unavailable after {attempt} attempts ({why})"
                        );
                        return self.reject(store, slip_id, reason::PROVIDER_UNAVAILABLE);
                    }
                    let jitter = self.rng.below(self.retry.jitter_ms);
                    let delay = self.retry.delay_ms(attempt, jitter);
                    log::debug!("slip {slip_id}: transient provider failure ({why}), retry in {delay}ms");
                    if delay > 0 {
                        std::thread::sleep(Duration::from_millis(delay));
                    }
                }
            }
        }
    }

    fn reject(
        &mut self,
        store: &EngineStore,
        slip_id: &str,
        why: &str,
    ) -> EngineResult<SlipStatus> {
        store.set_slip_rejected(slip_id, why)?;
        store.record_event(
            "provider",
            &EngineEvent::SlipRejected {
                slip_id: slip_id.to_string(),
                reason: why.to_string(),
            },
            self.clock.now_unix(),
        )?;
        Ok(SlipStatus::Rejected)
    }
}
