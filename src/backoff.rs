//! Backoff strategies for records that failed to send.

use std::fmt;
use std::time::Duration;

use rand::Rng;

/// Computes how long a failed entry waits before its next attempt.
pub trait Backoff: fmt::Debug + Send + Sync {
    /// Delay before the next attempt, given how many attempts already failed.
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential backoff with optional jitter:
/// `min(min * factor^(attempt - 1) + jitter, max)`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay after the first failure
    pub min: Duration,

    /// Upper bound on any delay
    pub max: Duration,

    /// Growth factor between attempts
    pub factor: f64,

    /// Add up to 25% random jitter to each delay
    pub jitter: bool,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            min: Duration::from_millis(100),
            max: Duration::from_secs(10),
            factor: 2.0,
            jitter: true,
        }
    }
}

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let max_secs = self.max.as_secs_f64();

        let mut delay_secs = self.min.as_secs_f64() * self.factor.max(1.0).powi(exponent);
        if !delay_secs.is_finite() || delay_secs > max_secs {
            delay_secs = max_secs;
        }

        if self.jitter && delay_secs > 0.0 {
            delay_secs += rand::thread_rng().gen_range(0.0..=delay_secs / 4.0);
        }

        Duration::from_secs_f64(delay_secs.min(max_secs))
    }
}

/// The same delay for every attempt.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn delay(&self, _attempt: u32) -> Duration {
        self.0
    }
}
