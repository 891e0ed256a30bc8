//! Retry scheduling for transactions that failed with a retryable error.
//!
//! `delay(n) = min(base * 2^n + jitter, cap)` where `jitter` is drawn from
//! `[0, jitter_ratio * base * 2^n]`. With `jitter_ratio < 1` the delay is
//! non-decreasing in `n` for any jitter draw.

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_MAX_DELAY_MS: u64 = 10_000;
const DEFAULT_JITTER_RATIO: f64 = 0.3;
const DEFAULT_WARN_THRESHOLD: u32 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ratio: f64,
    /// Retryable failures after which a row is flagged for the operator.
    /// `None` retries forever.
    pub max_retries: Option<u32>,
    /// Retry count at which a warning is logged for the row.
    pub warn_threshold: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: DEFAULT_BASE_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            jitter_ratio: DEFAULT_JITTER_RATIO,
            max_retries: None,
            warn_threshold: DEFAULT_WARN_THRESHOLD,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt of an item that has failed
    /// `retry_count` times, with a random jitter draw.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let fraction = if self.jitter_ratio > 0.0 {
            rand::rng().random_range(0.0..=self.jitter_ratio)
        } else {
            0.0
        };
        self.delay_with_jitter(retry_count, fraction)
    }

    /// Deterministic variant: `jitter_fraction` is clamped to
    /// `[0, jitter_ratio]`.
    pub fn delay_with_jitter(&self, retry_count: u32, jitter_fraction: f64) -> Duration {
        let cap = self.max_delay_ms;
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64.checked_shl(retry_count.min(63)).unwrap_or(u64::MAX));
        let fraction = jitter_fraction.clamp(0.0, self.jitter_ratio.max(0.0));
        let jitter = (exp as f64 * fraction) as u64;
        Duration::from_millis(exp.saturating_add(jitter).min(cap))
    }

    pub fn next_retry_at(&self, now: DateTime<Utc>, retry_count: u32) -> DateTime<Utc> {
        let delay = self.delay_for(retry_count);
        now + chrono::Duration::milliseconds(delay.as_millis() as i64)
    }

    pub fn is_exhausted(&self, retry_count: u32) -> bool {
        self.max_retries.is_some_and(|max| retry_count >= max)
    }

    pub fn should_warn(&self, retry_count: u32) -> bool {
        self.warn_threshold > 0 && retry_count >= self.warn_threshold
    }
}
