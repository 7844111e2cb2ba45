//! The engine facade: wires the store, components, and ports together
//! and exposes the operations the runner (or an embedding service)
//! calls.
//!
//! Ownership is deliberate: the engine owns one store, one of each
//! component, and one adapter per port. Components never hold the
//! store — it is passed into every call, which keeps the borrow
//! structure flat and the store trivially swappable in tests.

use crate::breaker::CircuitBreaker;
use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::ingest::SlipIngestor;
use crate::matcher::{MatchOutcome, PaymentMatcher};
use crate::notifier::{queue_for_transition, DispatchStats, NotificationDispatcher};
use crate::payment::{PaymentRecord, PaymentStatus};
use crate::ports::{BlobStore, Messenger, SlipVerifier};
use crate::provider::ProviderClient;
use crate::rng::{ComponentSlot, JitterRng};
use crate::scheduler::{MonthlySummary, ReconciliationScheduler, SweepStats};
use crate::slip::SlipStatus;
use crate::store::EngineStore;
use crate::types::{AmountCents, EntityId, UnixTime};
use std::sync::Arc;

/// What became of one slip after verification and matching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlipDisposition {
    Matched { payment_id: EntityId },
    Duplicate { existing_slip_id: EntityId },
    Rejected,
}

pub struct Engine<B: BlobStore, V: SlipVerifier, M: Messenger> {
    store: EngineStore,
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    blob: B,
    verifier: V,
    messenger: M,
    ingestor: SlipIngestor,
    provider: ProviderClient,
    matcher: PaymentMatcher,
    dispatcher: NotificationDispatcher,
    scheduler: ReconciliationScheduler,
}

impl<B: BlobStore, V: SlipVerifier, M: Messenger> Engine<B, V, M> {
    pub fn new(
        store: EngineStore,
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        blob: B,
        verifier: V,
        messenger: M,
    ) -> EngineResult<Self> {
        store.migrate()?;
        let ingestor = SlipIngestor::new(config.ingest.clone(), clock.clone());
        let provider = ProviderClient::new(
            config.provider_retry.clone(),
            CircuitBreaker::new(config.breaker.clone(), clock.clone()),
            JitterRng::new(config.seed, ComponentSlot::Provider),
            clock.clone(),
        );
        let matcher = PaymentMatcher::new(config.matching.clone(), clock.clone());
        let dispatcher = NotificationDispatcher::new(
            &config.notify,
            JitterRng::new(config.seed, ComponentSlot::Notifier),
            clock.clone(),
        );
        let scheduler = ReconciliationScheduler::new(
            config.sweep.clone(),
            config.notify.channel.clone(),
            clock.clone(),
        );
        Ok(Self {
            store,
            config,
            clock,
            blob,
            verifier,
            messenger,
            ingestor,
            provider,
            matcher,
            dispatcher,
            scheduler,
        })
    }

    pub fn store(&self) -> &EngineStore {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scheduler(&self) -> &ReconciliationScheduler {
        &self.scheduler
    }

    pub fn messenger(&self) -> &M {
        &self.messenger
    }

    pub fn messenger_mut(&mut self) -> &mut M {
        &mut self.messenger
    }

    pub fn verifier(&self) -> &V {
        &self.verifier
    }

    pub fn verifier_mut(&mut self) -> &mut V {
        &mut self.verifier
    }

    // ── Payments ───────────────────────────────────────────────

    /// Register one expected due for a member.
    pub fn create_payment(
        &self,
        member_id: &str,
        cohort_id: &str,
        expected_amount_cents: AmountCents,
        currency: &str,
        due_at: UnixTime,
    ) -> EngineResult<EntityId> {
        let now = self.clock.now_unix();
        let payment = PaymentRecord {
            payment_id: crate::store::entity_id(),
            member_id: member_id.to_string(),
            cohort_id: cohort_id.to_string(),
            expected_amount_cents,
            currency: currency.to_string(),
            due_at,
            status: PaymentStatus::Pending,
            version: 0,
            matched_slip_id: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_payment(&payment)?;
        log::info!(
            "payment {} created for member {member_id}: {expected_amount_cents}c due at {due_at}",
            payment.payment_id
        );
        Ok(payment.payment_id)
    }

    // ── Slips ──────────────────────────────────────────────────

    /// Accept an uploaded slip image. The slip is persisted pending;
    /// verification happens in `process_slip`.
    pub fn submit_slip(
        &mut self,
        claimed_payer_id: &str,
        image_bytes: &[u8],
        content_type: &str,
    ) -> EngineResult<EntityId> {
        self.ingestor.submit(
            &self.store,
            &mut self.blob,
            claimed_payer_id,
            image_bytes,
            content_type,
        )
    }

    /// Verify one slip against the provider and, on success, run the
    /// matcher. A slip already verified (the process died between
    /// verification and matching) skips straight to the matcher. The
    /// matching writes and the notification task commit atomically.
    pub fn process_slip(&mut self, slip_id: &str) -> EngineResult<SlipDisposition> {
        if self.store.get_slip(slip_id)?.status != SlipStatus::Verified {
            let status = self
                .provider
                .verify_slip(&self.store, &mut self.verifier, slip_id)?;
            if status != SlipStatus::Verified {
                return Ok(SlipDisposition::Rejected);
            }
        }

        let store = &self.store;
        let matcher = &self.matcher;
        let channel = self.dispatcher.channel();
        let now = self.clock.now_unix();
        let outcome = store.transaction(|| {
            let outcome = matcher.match_slip(store, slip_id)?;
            if let MatchOutcome::Matched { payment_id } = &outcome {
                queue_for_transition(store, payment_id, PaymentStatus::Matched, channel, now)?;
            }
            Ok(outcome)
        })?;

        Ok(match outcome {
            MatchOutcome::Matched { payment_id } => SlipDisposition::Matched { payment_id },
            MatchOutcome::Duplicate { existing_slip_id } => {
                SlipDisposition::Duplicate { existing_slip_id }
            }
            MatchOutcome::NoMatch | MatchOutcome::Ambiguous { .. } => SlipDisposition::Rejected,
        })
    }

    /// Process every slip the pipeline still owes work — pending ones
    /// awaiting verification plus verified ones whose match never
    /// landed — oldest first. Per-slip errors are logged and skipped.
    pub fn process_eligible(&mut self) -> EngineResult<Vec<(EntityId, SlipDisposition)>> {
        let mut results = Vec::new();
        for slip in self.store.unfinished_slips()? {
            match self.process_slip(&slip.slip_id) {
                Ok(disposition) => results.push((slip.slip_id, disposition)),
                Err(e) => log::warn!("slip {}: processing failed: {e}", slip.slip_id),
            }
        }
        Ok(results)
    }

    // ── Notifications ──────────────────────────────────────────

    pub fn dispatch_notifications(&mut self) -> EngineResult<DispatchStats> {
        self.dispatcher
            .dispatch_pending(&self.store, &mut self.messenger)
    }

    /// Record a delivery receipt reported back by the channel.
    pub fn record_delivery(&self, task_id: &str, delivered: bool) -> EngineResult<()> {
        self.store.record_task_delivery(task_id, delivered)
    }

    // ── Sweeps ─────────────────────────────────────────────────

    pub fn run_daily_sweep(&self) -> EngineResult<SweepStats> {
        self.scheduler.run_daily(&self.store)
    }

    pub fn run_monthly_sweep(&self) -> EngineResult<MonthlySummary> {
        self.scheduler.run_monthly(&self.store)
    }
}
