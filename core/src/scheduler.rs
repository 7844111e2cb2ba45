//! Reconciliation sweeps.
//!
//! The daily sweep is the engine's self-healing pass: stale slips go
//! back in line, provider-outage slips get another verification
//! attempt, and overdue payments get their terminal verdict. The
//! monthly sweep folds the previous calendar month into one summary
//! row for the treasurer.
//!
//! RULE: at most one run of a kind is active at a time, and partial
//! failure is normal — a bad item is counted and skipped, never fatal
//! to the run.

use crate::clock::Clock;
use crate::config::SweepConfig;
use crate::error::EngineResult;
use crate::event::EngineEvent;
use crate::notifier::queue_for_transition;
use crate::payment::PaymentStatus;
use crate::store::EngineStore;
use crate::types::{AmountCents, EntityId, UnixTime};
use chrono::{Datelike, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const DAY_SECS: i64 = 86_400;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunKind {
    Daily,
    Monthly,
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Daily => "daily",
            Self::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "daily" => Some(Self::Daily),
            "monthly" => Some(Self::Monthly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconciliationRunRecord {
    pub run_id: EntityId,
    pub kind: RunKind,
    pub started_at: UnixTime,
    pub completed_at: Option<UnixTime>,
    pub items_processed: i64,
    pub items_failed: i64,
}

/// Aggregate of one calendar month, keyed by "YYYY-MM".
#[derive(Debug, Clone)]
pub struct MonthlySummary {
    pub period: String,
    pub run_id: EntityId,
    pub matched_count: i64,
    pub matched_amount_cents: AmountCents,
    pub mismatched_count: i64,
    pub mismatched_amount_cents: AmountCents,
    pub expired_count: i64,
    pub expired_amount_cents: AmountCents,
    pub computed_at: UnixTime,
}

#[derive(Debug, Default, Clone)]
pub struct SweepStats {
    pub run_id: EntityId,
    pub slips_requeued: u32,
    pub slips_retried: u32,
    pub payments_expired: u32,
    pub payments_mismatched: u32,
    pub items_processed: i64,
    pub items_failed: i64,
}

pub struct ReconciliationScheduler {
    config: SweepConfig,
    channel: String,
    clock: Arc<dyn Clock>,
    stop: Arc<AtomicBool>,
}

impl ReconciliationScheduler {
    pub fn new(config: SweepConfig, channel: String, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            channel,
            clock,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Handle for graceful shutdown: flip it and the current sweep
    /// stops between items, leaving the run record honest.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.stop.clone()
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::Relaxed)
    }

    pub fn run_daily(&self, store: &EngineStore) -> EngineResult<SweepStats> {
        let now = self.clock.now_unix();
        let run_id = crate::store::entity_id();
        store.begin_run(&run_id, RunKind::Daily, now)?;

        let mut stats = SweepStats {
            run_id: run_id.clone(),
            ..Default::default()
        };
        let result = self.daily_pass(store, &run_id, now, &mut stats);

        // The run row must close whatever became of the pass; a run
        // left open would refuse every later sweep of this kind.
        let done = self.clock.now_unix();
        if let Err(close_err) =
            store.complete_run(&run_id, done, stats.items_processed, stats.items_failed)
        {
            log::error!("daily sweep {run_id}: failed to close run: {close_err}");
        }
        match result {
            Ok(()) => {
                store.record_event(
                    "scheduler",
                    &EngineEvent::SweepCompleted {
                        run_id: run_id.clone(),
                        kind: RunKind::Daily.as_str().to_string(),
                        items_processed: stats.items_processed,
                        items_failed: stats.items_failed,
                    },
                    done,
                )?;
                log::info!(
                    "daily sweep {run_id} completed: {} requeued, {} retried, {} expired, {} mismatched, {} failed",
                    stats.slips_requeued,
                    stats.slips_retried,
                    stats.payments_expired,
                    stats.payments_mismatched,
                    stats.items_failed
                );
                Ok(stats)
            }
            Err(e) => {
                log::error!("daily sweep {run_id} aborted: {e}");
                Err(e)
            }
        }
    }

    fn daily_pass(
        &self,
        store: &EngineStore,
        run_id: &str,
        now: UnixTime,
        stats: &mut SweepStats,
    ) -> EngineResult<()> {
        store.record_event(
            "scheduler",
            &EngineEvent::SweepStarted {
                run_id: run_id.to_string(),
                kind: RunKind::Daily.as_str().to_string(),
            },
            now,
        )?;
        log::info!("daily sweep {run_id} started");

        // Slips stuck in pending/verifying past the staleness cutoff.
        let stale_cutoff = now - self.config.stale_slip_hours * 3_600;
        for slip in store.stale_slips(stale_cutoff)? {
            if self.stopped() {
                break;
            }
            stats.items_processed += 1;
            match store.requeue_slip(&slip.slip_id) {
                Ok(()) => stats.slips_requeued += 1,
                Err(e) => {
                    stats.items_failed += 1;
                    log::warn!("sweep {run_id}: requeue of slip {} failed: {e}", slip.slip_id);
                }
            }
        }

        // Provider-outage rejects still inside their retry budget.
        for slip in store.provider_unavailable_slips(self.config.provider_retry_budget)? {
            if self.stopped() {
                break;
            }
            stats.items_processed += 1;
            let requeued = store
                .increment_slip_retry(&slip.slip_id)
                .and_then(|_| store.requeue_slip(&slip.slip_id));
            match requeued {
                Ok(()) => stats.slips_retried += 1,
                Err(e) => {
                    stats.items_failed += 1;
                    log::warn!("sweep {run_id}: retry of slip {} failed: {e}", slip.slip_id);
                }
            }
        }

        // Overdue payments past their grace period. A payer with a
        // dead-ended slip tried and failed to match, so their due goes
        // to mismatched; everyone else simply expires.
        let overdue_cutoff = now - self.config.grace_days * DAY_SECS;
        for payment in store.payments_overdue(overdue_cutoff)? {
            if self.stopped() {
                break;
            }
            stats.items_processed += 1;
            match self.settle_overdue(store, &payment.payment_id, &payment.member_id, now) {
                Ok(Some(PaymentStatus::Mismatched)) => stats.payments_mismatched += 1,
                Ok(Some(_)) => stats.payments_expired += 1,
                Ok(None) => {} // already terminal, nothing to do
                Err(e) => {
                    stats.items_failed += 1;
                    log::warn!(
                        "sweep {run_id}: overdue payment {} failed: {e}",
                        payment.payment_id
                    );
                }
            }
        }

        Ok(())
    }

    fn settle_overdue(
        &self,
        store: &EngineStore,
        payment_id: &str,
        member_id: &str,
        now: UnixTime,
    ) -> EngineResult<Option<PaymentStatus>> {
        let verdict = if store.payer_has_dead_end_slip(member_id)? {
            PaymentStatus::Mismatched
        } else {
            PaymentStatus::Expired
        };
        // One atomic unit: the terminal write, its event, and its
        // notification task land together or not at all. The
        // conditional write makes a concurrent match a no-op, which is
        // the correct outcome.
        store.transaction(|| {
            if !store.transition_if_outstanding(payment_id, verdict, now)? {
                return Ok(None);
            }
            let event = match verdict {
                PaymentStatus::Mismatched => EngineEvent::PaymentMismatched {
                    payment_id: payment_id.to_string(),
                },
                _ => EngineEvent::PaymentExpired {
                    payment_id: payment_id.to_string(),
                },
            };
            store.record_event("scheduler", &event, now)?;
            queue_for_transition(store, payment_id, verdict, &self.channel, now)?;
            Ok(Some(verdict))
        })
    }

    /// Summarize the previous calendar month (relative to the clock).
    pub fn run_monthly(&self, store: &EngineStore) -> EngineResult<MonthlySummary> {
        let (period, start, end) = previous_month_window(self.clock.as_ref());
        self.run_monthly_for(store, &period, start, end)
    }

    /// Summarize an explicit period. `start`/`end` bound the month as
    /// unix seconds, end exclusive.
    pub fn run_monthly_for(
        &self,
        store: &EngineStore,
        period: &str,
        start: UnixTime,
        end: UnixTime,
    ) -> EngineResult<MonthlySummary> {
        let now = self.clock.now_unix();
        let run_id = crate::store::entity_id();
        store.begin_run(&run_id, RunKind::Monthly, now)?;

        let result = self.monthly_pass(store, &run_id, period, start, end, now);

        // Close the run on both arms so an aborted pass never blocks
        // the next monthly sweep.
        let done = self.clock.now_unix();
        let (items, failed) = match &result {
            Ok(s) => (s.matched_count + s.mismatched_count + s.expired_count, 0),
            Err(_) => (0, 1),
        };
        if let Err(close_err) = store.complete_run(&run_id, done, items, failed) {
            log::error!("monthly sweep {run_id}: failed to close run: {close_err}");
        }
        let summary = result?;

        store.record_event(
            "scheduler",
            &EngineEvent::SweepCompleted {
                run_id,
                kind: RunKind::Monthly.as_str().to_string(),
                items_processed: items,
                items_failed: 0,
            },
            done,
        )?;
        log::info!(
            "monthly summary {period}: {} matched ({}c), {} mismatched, {} expired",
            summary.matched_count,
            summary.matched_amount_cents,
            summary.mismatched_count,
            summary.expired_count
        );
        Ok(summary)
    }

    fn monthly_pass(
        &self,
        store: &EngineStore,
        run_id: &str,
        period: &str,
        start: UnixTime,
        end: UnixTime,
        now: UnixTime,
    ) -> EngineResult<MonthlySummary> {
        store.record_event(
            "scheduler",
            &EngineEvent::SweepStarted {
                run_id: run_id.to_string(),
                kind: RunKind::Monthly.as_str().to_string(),
            },
            now,
        )?;

        let (matched_count, matched_amount_cents) =
            store.terminal_aggregate(PaymentStatus::Matched, start, end)?;
        let (mismatched_count, mismatched_amount_cents) =
            store.terminal_aggregate(PaymentStatus::Mismatched, start, end)?;
        let (expired_count, expired_amount_cents) =
            store.terminal_aggregate(PaymentStatus::Expired, start, end)?;

        let summary = MonthlySummary {
            period: period.to_string(),
            run_id: run_id.to_string(),
            matched_count,
            matched_amount_cents,
            mismatched_count,
            mismatched_amount_cents,
            expired_count,
            expired_amount_cents,
            computed_at: self.clock.now_unix(),
        };
        // Upsert: re-running a period overwrites its summary, so a
        // corrected month converges instead of duplicating.
        store.insert_monthly_summary(&summary)?;
        Ok(summary)
    }
}

/// The previous calendar month as ("YYYY-MM", start, end) in UTC.
pub fn previous_month_window(clock: &dyn Clock) -> (String, UnixTime, UnixTime) {
    let now = clock.now();
    let (this_year, this_month) = (now.year(), now.month());
    let (year, month) = if this_month == 1 {
        (this_year - 1, 12)
    } else {
        (this_year, this_month - 1)
    };
    let start = Utc
        .with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(0);
    let end = Utc
        .with_ymd_and_hms(this_year, this_month, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(0);
    (format!("{year:04}-{month:02}"), start, end)
}
