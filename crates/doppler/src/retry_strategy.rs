// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backoff policies mapping a retry attempt count to a wait duration.

use std::time::Duration;

/// Exponent at which exponential backoff stops growing: 2^22 ms, a little over 70 minutes.
pub const DEFAULT_MAX_EXPONENT: u32 = 23;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Retry without waiting.
    Immediate,
    /// Wait `step * attempt`, never more than `max`.
    LinearBackoff { step: Duration, max: Duration },
    /// Wait `base` on the first attempt, then `base * 2^(attempt - 1)` until `max_exponent`.
    ExponentialBackoff { base: Duration, max_exponent: u32 },
}

impl Default for RetryStrategy {
    fn default() -> Self {
        RetryStrategy::ExponentialBackoff {
            base: Duration::from_millis(1),
            max_exponent: DEFAULT_MAX_EXPONENT,
        }
    }
}

impl RetryStrategy {
    /// Wait before retry number `attempt`. Pure and non-decreasing in `attempt`.
    #[must_use]
    pub fn duration(&self, attempt: u32) -> Duration {
        match self {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::LinearBackoff { step, max } => step.saturating_mul(attempt).min(*max),
            RetryStrategy::ExponentialBackoff { base, max_exponent } => {
                if attempt == 0 {
                    return *base;
                }
                let exponent = attempt.min((*max_exponent).max(1)) - 1;
                let factor = 2u32.checked_pow(exponent).unwrap_or(u32::MAX);
                base.saturating_mul(factor)
            }
        }
    }

    /// Wait at the ceiling, i.e. the largest value `duration` can return.
    #[must_use]
    pub fn ceiling(&self) -> Duration {
        match self {
            RetryStrategy::Immediate => Duration::ZERO,
            RetryStrategy::LinearBackoff { max, .. } => *max,
            RetryStrategy::ExponentialBackoff { max_exponent, .. } => {
                self.duration((*max_exponent).max(1))
            }
        }
    }
}
