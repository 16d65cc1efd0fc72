use std::time::Duration;

/// Retry ceiling stamped onto every new record unless configured otherwise.
pub const DEFAULT_MAX_ATTEMPTS: i32 = 5;
pub const DEFAULT_BATCH_SIZE: i64 = 20;

/// Process-wide retry settings, built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: i32,
    pub batch_size: i64,
    pub handler_timeout: Duration,
    /// How long a record may sit in `processing` before the batch sweep releases it.
    pub processing_lease: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(60_000),
            max_delay: Duration::from_millis(3_600_000),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            batch_size: DEFAULT_BATCH_SIZE,
            handler_timeout: Duration::from_secs(30),
            processing_lease: Duration::from_secs(900),
        }
    }
}

impl RetryPolicy {
    /// `min(initial_delay * 2^attempt_count, max_delay)`, saturating.
    pub fn calculate_retry_delay(&self, attempt_count: u32) -> Duration {
        let initial = self.initial_delay.as_millis();
        let factor = 1u128.checked_shl(attempt_count).unwrap_or(u128::MAX);
        let delay_ms = initial.saturating_mul(factor).min(self.max_delay.as_millis());
        Duration::from_millis(u64::try_from(delay_ms).unwrap_or(u64::MAX))
    }

    pub fn delay_for(&self, attempt_count: i32) -> Duration {
        self.calculate_retry_delay(u32::try_from(attempt_count).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_delay_is_initial_delay() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_retry_delay(0), Duration::from_secs(60));
    }

    #[test]
    fn delay_doubles_until_capped() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.calculate_retry_delay(1), Duration::from_secs(120));
        assert_eq!(policy.calculate_retry_delay(2), Duration::from_secs(240));
        assert_eq!(policy.calculate_retry_delay(5), Duration::from_secs(1920));
        assert_eq!(policy.calculate_retry_delay(6), Duration::from_secs(3600));
        assert_eq!(policy.calculate_retry_delay(200), Duration::from_secs(3600));
    }

    #[test]
    fn delay_is_monotonic_and_never_overflows() {
        let policy = RetryPolicy {
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(86_400),
            ..RetryPolicy::default()
        };
        let mut previous = Duration::ZERO;
        for attempt in 0..=300u32 {
            let delay = policy.calculate_retry_delay(attempt);
            assert!(delay >= previous, "attempt {attempt} went backwards");
            assert!(delay <= policy.max_delay);
            let expected = 1000u128
                .checked_mul(1u128.checked_shl(attempt).unwrap_or(u128::MAX))
                .unwrap_or(u128::MAX)
                .min(86_400_000);
            assert_eq!(delay.as_millis(), expected);
            previous = delay;
        }
    }

    #[test]
    fn negative_attempt_counts_are_treated_as_zero() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(-1), policy.initial_delay);
    }
}
