//! Retry policy for failed sync attempts.
//!
//! A transient failure schedules another attempt after
//! `base * 2^retry_count` (capped at `max_delay`) plus random jitter, where
//! `retry_count` is the number of failed attempts before this one. Once the
//! new count would exceed `max_retries` the event is dead-lettered instead,
//! so an event that always fails transiently is attempted exactly
//! `max_retries + 1` times. Permanent failures go straight to dead without
//! touching the count.

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// How a failed attempt should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network, availability, timeout, or version race. Worth retrying.
    Transient,
    /// Malformed payload or schema violation. Retrying cannot help.
    Permanent,
}

/// What to persist for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        retry_count: u32,
        delay: Duration,
        next_attempt_at: DateTime<Utc>,
    },
    Dead {
        retry_count: u32,
    },
}

/// Backoff and retry budget.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Up to this fraction of the delay is added as random jitter.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Backoff before the attempt following `retry_count` earlier failures,
    /// without jitter.
    ///
    /// | retry_count | delay (base=1s, max=300s) |
    /// |-------------|---------------------------|
    /// | 0           | 1s                        |
    /// | 1           | 2s                        |
    /// | 4           | 16s                       |
    /// | 9+          | 300s                      |
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let max_ms = self.max_delay.as_millis() as u64;
        let multiplier = 1u64.checked_shl(retry_count).unwrap_or(u64::MAX);
        let delay_ms = base_ms.saturating_mul(multiplier).min(max_ms);

        Duration::from_millis(delay_ms)
    }

    /// `delay` plus a uniform random extra in `0..=delay * jitter_ratio`.
    pub fn with_jitter<R: Rng>(&self, delay: Duration, rng: &mut R) -> Duration {
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        let spread_ms = (delay.as_millis() as f64 * ratio) as u64;
        if spread_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rng.gen_range(0..=spread_ms))
    }

    /// Decide the outcome of a failed attempt on an event that had
    /// `retry_count` failures before it.
    pub fn decide(&self, retry_count: u32, kind: FailureKind, now: DateTime<Utc>) -> FailureDecision {
        self.decide_with_rng(retry_count, kind, now, &mut rand::thread_rng())
    }

    pub fn decide_with_rng<R: Rng>(
        &self,
        retry_count: u32,
        kind: FailureKind,
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> FailureDecision {
        if kind == FailureKind::Permanent {
            return FailureDecision::Dead { retry_count };
        }

        let next_count = retry_count.saturating_add(1);
        if next_count > self.max_retries {
            return FailureDecision::Dead {
                retry_count: next_count,
            };
        }

        let delay = self.with_jitter(self.backoff_delay(retry_count), rng);
        let next_attempt_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));

        FailureDecision::Retry {
            retry_count: next_count,
            delay,
            next_attempt_at,
        }
    }
}
