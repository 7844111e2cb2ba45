//! Notification tasks and their dispatcher.
//!
//! Tasks are created by the payment lifecycle (one per terminal
//! transition) and owned by the dispatcher from then on. Dispatch is
//! best-effort: a task that exhausts its retries is marked failed and
//! logged for manual follow-up — it never rolls back payment state and
//! never blocks other tasks.

use crate::clock::Clock;
use crate::config::{NotifyConfig, RetryPolicy};
use crate::error::EngineResult;
use crate::event::EngineEvent;
use crate::payment::{payload_kind_for, PaymentStatus};
use crate::ports::{Messenger, SendOutcome};
use crate::rng::JitterRng;
use crate::store::EngineStore;
use crate::types::{EntityId, UnixTime};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Queued,
    Sent,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// One outbound message attempt.
#[derive(Debug, Clone)]
pub struct NotificationTask {
    pub task_id: EntityId,
    pub payment_id: EntityId,
    pub channel: String,
    pub payload_kind: String,
    pub attempts: i64,
    pub status: TaskStatus,
    pub last_attempt_at: Option<UnixTime>,
    pub delivered: Option<bool>,
}

/// Queue the message a terminal transition owes. Returns None for
/// statuses that notify nobody (`failed` goes to operators via the
/// log, not to the member).
pub fn queue_for_transition(
    store: &EngineStore,
    payment_id: &str,
    status: PaymentStatus,
    channel: &str,
    now: UnixTime,
) -> EngineResult<Option<EntityId>> {
    let Some(kind) = payload_kind_for(status) else {
        return Ok(None);
    };
    let task = NotificationTask {
        task_id: crate::store::entity_id(),
        payment_id: payment_id.to_string(),
        channel: channel.to_string(),
        payload_kind: kind.to_string(),
        attempts: 0,
        status: TaskStatus::Queued,
        last_attempt_at: None,
        delivered: None,
    };
    store.insert_notification_task(&task)?;
    store.record_event(
        "notifier",
        &EngineEvent::NotificationQueued {
            task_id: task.task_id.clone(),
            payment_id: payment_id.to_string(),
            payload_kind: kind.to_string(),
        },
        now,
    )?;
    Ok(Some(task.task_id))
}

/// Token-bucket limiter shared across all tasks: at most
/// `max_per_second` sends inside any one-second window.
pub struct RateLimiter {
    max_per_second: u32,
    clock: Arc<dyn Clock>,
    window_start: Option<chrono::DateTime<chrono::Utc>>,
    sent_in_window: u32,
}

impl RateLimiter {
    pub fn new(max_per_second: u32, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_per_second,
            clock,
            window_start: None,
            sent_in_window: 0,
        }
    }

    /// Take one send slot, or learn how long until the window rolls.
    pub fn try_acquire(&mut self) -> Result<(), Duration> {
        let now = self.clock.now();
        match self.window_start {
            Some(start) if now - start < ChronoDuration::seconds(1) => {
                if self.sent_in_window < self.max_per_second {
                    self.sent_in_window += 1;
                    Ok(())
                } else {
                    let elapsed = (now - start)
                        .to_std()
                        .unwrap_or(Duration::from_secs(0));
                    Err(Duration::from_secs(1).saturating_sub(elapsed))
                }
            }
            _ => {
                // A zero budget never grants, not even the opening slot.
                if self.max_per_second == 0 {
                    return Err(Duration::from_secs(1));
                }
                self.window_start = Some(now);
                self.sent_in_window = 1;
                Ok(())
            }
        }
    }

    /// Force the window forward after a real-time wait. Needed because
    /// the injected clock does not advance during `thread::sleep`.
    pub fn roll_window(&mut self) {
        self.window_start = None;
        self.sent_in_window = 0;
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DispatchStats {
    pub sent: u32,
    pub failed: u32,
}

pub struct NotificationDispatcher {
    retry: RetryPolicy,
    channel: String,
    limiter: RateLimiter,
    rng: JitterRng,
    clock: Arc<dyn Clock>,
}

impl NotificationDispatcher {
    pub fn new(config: &NotifyConfig, rng: JitterRng, clock: Arc<dyn Clock>) -> Self {
        Self {
            retry: config.retry.clone(),
            channel: config.channel.clone(),
            limiter: RateLimiter::new(config.max_sends_per_second, clock.clone()),
            rng,
            clock,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Drain the queue. Each task is scheduled independently: one
    /// task's dead-end never stalls the rest.
    pub fn dispatch_pending(
        &mut self,
        store: &EngineStore,
        messenger: &mut dyn Messenger,
    ) -> EngineResult<DispatchStats> {
        let mut stats = DispatchStats::default();
        if self.limiter.max_per_second == 0 {
            log::warn!("send budget is zero, leaving the queue untouched");
            return Ok(stats);
        }
        for task in store.queued_tasks()? {
            match self.dispatch_one(store, messenger, &task) {
                Ok(true) => stats.sent += 1,
                Ok(false) => stats.failed += 1,
                Err(e) => {
                    stats.failed += 1;
                    log::warn!("task {}: dispatch error: {e}", task.task_id);
                }
            }
        }
        Ok(stats)
    }

    /// Returns Ok(true) when sent, Ok(false) when the task was marked
    /// failed for manual follow-up.
    fn dispatch_one(
        &mut self,
        store: &EngineStore,
        messenger: &mut dyn Messenger,
        task: &NotificationTask,
    ) -> EngineResult<bool> {
        let payment = store.get_payment(&task.payment_id)?;
        let mut attempts = task.attempts;

        while (attempts as u32) < self.retry.max_attempts {
            if let Err(wait) = self.limiter.try_acquire() {
                if !wait.is_zero() {
                    std::thread::sleep(wait);
                }
                self.limiter.roll_window();
                continue;
            }
            attempts += 1;
            let now = self.clock.now_unix();

            match messenger.send(&payment.member_id, &task.payload_kind, &task.payment_id) {
                SendOutcome::Sent => {
                    store.mark_task_sent(&task.task_id, attempts, now)?;
                    store.record_event(
                        "notifier",
                        &EngineEvent::NotificationSent {
                            task_id: task.task_id.clone(),
                            attempts: attempts as u32,
                        },
                        now,
                    )?;
                    log::info!(
                        "notification {} sent to {} ({})",
                        task.task_id,
                        payment.member_id,
                        task.payload_kind
                    );
                    return Ok(true);
                }
                SendOutcome::Permanent(why) => {
                    return self.fail(store, task, attempts, now, &why);
                }
                SendOutcome::Transient(why) => {
                    store.bump_task_attempt(&task.task_id, attempts, now)?;
                    if (attempts as u32) >= self.retry.max_attempts {
                        return self.fail(store, task, attempts, now, &why);
                    }
                    let jitter = self.rng.below(self.retry.jitter_ms);
                    let delay = self.retry.delay_ms(attempts as u32, jitter);
                    log::debug!(
                        "task {}: transient send failure ({why}), retry in {delay}ms",
                        task.task_id
                    );
                    if delay > 0 {
                        std::thread::sleep(Duration::from_millis(delay));
                    }
                }
            }
        }

        // Attempts were already exhausted when we picked the task up.
        self.fail(
            store,
            task,
            attempts,
            self.clock.now_unix(),
            "retry budget exhausted",
        )
    }

    fn fail(
        &self,
        store: &EngineStore,
        task: &NotificationTask,
        attempts: i64,
        now: UnixTime,
        why: &str,
    ) -> EngineResult<bool> {
        store.mark_task_failed(&task.task_id, attempts, now)?;
        store.record_event(
            "notifier",
            &EngineEvent::NotificationFailed {
                task_id: task.task_id.clone(),
                attempts: attempts as u32,
                reason: why.to_string(),
            },
            now,
        )?;
        log::error!(
            "notification {} failed after {attempts} attempts: {why} (manual follow-up)",
            task.task_id
        );
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn limiter_allows_up_to_budget_within_window() {
        let clock = ManualClock::fixed();
        let mut limiter = RateLimiter::new(2, clock.clone());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_ok());
        let wait = limiter.try_acquire().unwrap_err();
        assert!(wait <= Duration::from_secs(1));
    }

    #[test]
    fn limiter_resets_after_one_second() {
        let clock = ManualClock::fixed();
        let mut limiter = RateLimiter::new(1, clock.clone());
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
        clock.advance(chrono::Duration::seconds(1));
        assert!(limiter.try_acquire().is_ok());
    }

    #[test]
    fn zero_budget_never_grants() {
        let clock = ManualClock::fixed();
        let mut limiter = RateLimiter::new(0, clock.clone());
        assert!(limiter.try_acquire().is_err());
        clock.advance(chrono::Duration::seconds(5));
        assert!(limiter.try_acquire().is_err());
        limiter.roll_window();
        assert!(limiter.try_acquire().is_err());
    }

    #[test]
    fn roll_window_frees_the_budget() {
        let clock = ManualClock::fixed();
        let mut limiter = RateLimiter::new(1, clock);
        assert!(limiter.try_acquire().is_ok());
        assert!(limiter.try_acquire().is_err());
        limiter.roll_window();
        assert!(limiter.try_acquire().is_ok());
    }
}
