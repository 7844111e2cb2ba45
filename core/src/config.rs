//! Engine configuration.
//!
//! Everything operators may tune — retry schedules, the breaker,
//! matching tolerances, sweep thresholds — is plain data here. No
//! policy is hard-coded in the components.

use crate::types::AmountCents;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Content types accepted for slip images.
    pub allowed_content_types: Vec<String>,
    /// Upper bound on the uploaded image, in bytes.
    pub max_image_bytes: usize,
}

/// A bounded exponential-backoff schedule. Delay for attempt `n`
/// (1-based) is `base_delay_ms * multiplier^(n-1) + jitter`, jitter
/// drawn uniformly from [0, jitter_ms).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub jitter_ms: u64,
}

impl RetryPolicy {
    pub fn delay_ms(&self, attempt: u32, jitter: u64) -> u64 {
        let exp = (attempt.saturating_sub(1)) as i32;
        let base = self.base_delay_ms as f64 * self.multiplier.powi(exp);
        base as u64 + jitter
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that open the circuit.
    pub failure_threshold: u32,
    /// Failures further apart than this do not count as consecutive.
    pub failure_window_secs: i64,
    /// Open duration before the breaker half-opens and allows a probe.
    pub cooldown_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchConfig {
    /// Allowed absolute difference between verified and expected
    /// amounts. Zero means exact match required.
    pub amount_tolerance_cents: AmountCents,
    /// How far before the settlement timestamp a due date may lie.
    pub window_lookback_days: i64,
    /// How far after the settlement timestamp a due date may lie.
    pub window_lookahead_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// Messaging channel identifier stamped on every task.
    pub channel: String,
    pub retry: RetryPolicy,
    /// Shared send budget across all tasks, per second.
    pub max_sends_per_second: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    /// A slip stuck in pending/verifying longer than this is re-queued.
    pub stale_slip_hours: i64,
    /// Extra verification attempts granted to provider_unavailable
    /// slips across daily sweeps.
    pub provider_retry_budget: u32,
    /// Grace period after due date before a payment expires.
    pub grace_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seed for the deterministic jitter streams.
    pub seed: u64,
    pub ingest: IngestConfig,
    pub provider_retry: RetryPolicy,
    pub breaker: CircuitBreakerConfig,
    pub matching: MatchConfig,
    pub notify: NotifyConfig,
    pub sweep: SweepConfig,
}

impl EngineConfig {
    /// Load from a JSON file.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Cannot read {path}: {e}"))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Production defaults, used when no config file is given.
    pub fn defaults() -> Self {
        Self {
            seed: 0,
            ingest: IngestConfig {
                allowed_content_types: vec!["image/jpeg".into(), "image/png".into()],
                max_image_bytes: 8 * 1024 * 1024,
            },
            provider_retry: RetryPolicy {
                max_attempts: 5,
                base_delay_ms: 500,
                multiplier: 2.0,
                jitter_ms: 250,
            },
            breaker: CircuitBreakerConfig {
                failure_threshold: 5,
                failure_window_secs: 120,
                cooldown_secs: 60,
            },
            matching: MatchConfig {
                amount_tolerance_cents: 0,
                window_lookback_days: 30,
                window_lookahead_days: 7,
            },
            notify: NotifyConfig {
                channel: "line".into(),
                retry: RetryPolicy {
                    max_attempts: 3,
                    base_delay_ms: 1_000,
                    multiplier: 2.0,
                    jitter_ms: 500,
                },
                max_sends_per_second: 10,
            },
            sweep: SweepConfig {
                stale_slip_hours: 6,
                provider_retry_budget: 3,
                grace_days: 3,
            },
        }
    }

    /// Config with instant retries and wide limits for unit tests.
    pub fn default_test() -> Self {
        let mut cfg = Self::defaults();
        cfg.seed = 42;
        cfg.provider_retry = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 0,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        cfg.notify.retry = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 0,
            multiplier: 2.0,
            jitter_ms: 0,
        };
        cfg.notify.max_sends_per_second = 1_000;
        cfg
    }
}
