// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Truncated exponential backoff for store operations.

use std::time::Duration;

use rand::Rng;

/// A retry schedule: delays double from `min_delay` up to `max_delay`, for
/// at most `max_attempts` attempts, with up to 10% of subtractive jitter so
/// concurrent contenders do not retry in lockstep.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Longest delay between retries.
    pub max_delay: Duration,
    /// Total attempts before giving up.
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Schedule for acquisition passes.
    #[must_use]
    pub const fn acquire_default() -> Self {
        Self {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
        }
    }

    /// Schedule for heartbeat and release writes.
    #[must_use]
    pub const fn heartbeat_default() -> Self {
        Self {
            min_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(500),
            max_attempts: 10,
        }
    }

    /// Schedule for the table-active poll during provisioning.
    #[must_use]
    pub const fn provision_default() -> Self {
        Self {
            min_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            max_attempts: 10,
        }
    }

    /// Delay before retrying after `failed_attempts` tries, or `None` once
    /// the schedule is exhausted.
    #[must_use]
    pub fn backoff(&self, failed_attempts: u32) -> Option<Duration> {
        let base = self.base_delay(failed_attempts)?;
        // NOTE: This number may be biased. If this is an issue, look at different ways to generate jitter.
        let jitter_multiplier = rand::thread_rng().gen_range(0.90..=1.0);
        Some(base.mul_f64(jitter_multiplier))
    }

    fn base_delay(&self, failed_attempts: u32) -> Option<Duration> {
        if failed_attempts == 0 || failed_attempts >= self.max_attempts {
            return None;
        }
        let exponent = failed_attempts.saturating_sub(1).min(20);
        let delay = self
            .min_delay
            .saturating_mul(2_u32.saturating_pow(exponent));
        Some(delay.min(self.max_delay))
    }
}
