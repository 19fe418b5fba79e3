//! Exponential backoff between retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

/// Delay before retry `n` is `base_delay * multiplier^(n-1)`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Upper bound on a single delay.
    pub max_delay: Option<Duration>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: DEFAULT_MULTIPLIER,
            max_delay: None,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, multiplier: f64) -> Self {
        Self {
            base_delay,
            multiplier,
            max_delay: None,
        }
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// No delay at all, for tests and dry runs.
    pub fn none() -> Self {
        Self::new(Duration::ZERO, 1.0)
    }

    /// Delay before `attempt` (zero for the first run).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.max(1.0).powi(exponent);
        let delay = Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for(2), Duration::from_secs(10));
        assert_eq!(policy.delay_for(3), Duration::from_secs(20));
    }

    #[test]
    fn test_cap_and_overflow() {
        let policy = BackoffPolicy::default().with_max_delay(Duration::from_secs(60));
        assert_eq!(policy.delay_for(10), Duration::from_secs(60));
        assert_eq!(BackoffPolicy::default().delay_for(u32::MAX), Duration::MAX);
    }

    #[test]
    fn test_none_policy() {
        let policy = BackoffPolicy::none();
        assert_eq!(policy.delay_for(3), Duration::ZERO);
    }
}
