use std::time::Duration;

/// Exponential backoff schedule for the drain loop.
///
/// The delay doubles with each consecutive failed cycle and is clamped to
/// `ceiling_ms`. A server-provided retry-after hint can only lengthen the
/// computed delay, never shorten the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub ceiling_ms: u64,
}

impl RetryPolicy {
    pub fn new(base_ms: u64, ceiling_ms: u64) -> Self {
        Self { base_ms, ceiling_ms }
    }

    /// Delay before the next drain attempt after `consecutive_failures`
    /// failed cycles (the first failure waits `base_ms`).
    pub fn delay_after_failures(
        &self,
        consecutive_failures: u32,
        hint_ms: Option<u64>,
    ) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1).min(20);
        let calculated = self.base_ms.saturating_mul(1u64 << exponent);
        let bounded = calculated.max(hint_ms.unwrap_or(0)).min(self.ceiling_ms);
        Duration::from_millis(bounded)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: 500,
            ceiling_ms: 30_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_double_per_failure() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_after_failures(1, None), Duration::from_millis(500));
        assert_eq!(policy.delay_after_failures(2, None), Duration::from_millis(1000));
        assert_eq!(policy.delay_after_failures(3, None), Duration::from_millis(2000));
        assert_eq!(policy.delay_after_failures(4, None), Duration::from_millis(4000));
    }

    #[test]
    fn delay_is_clamped_to_the_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_after_failures(30, None),
            Duration::from_millis(30_000)
        );
        // Large failure counts must not overflow the shift.
        assert_eq!(
            policy.delay_after_failures(u32::MAX, None),
            Duration::from_millis(30_000)
        );
    }

    #[test]
    fn server_hint_extends_but_never_exceeds_ceiling() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.delay_after_failures(1, Some(5_000)),
            Duration::from_millis(5_000)
        );
        assert_eq!(
            policy.delay_after_failures(1, Some(120_000)),
            Duration::from_millis(30_000)
        );
        // A hint below the computed delay changes nothing.
        assert_eq!(
            policy.delay_after_failures(3, Some(100)),
            Duration::from_millis(2000)
        );
    }

    #[test]
    fn zero_failures_waits_the_base_delay() {
        let policy = RetryPolicy::new(250, 10_000);
        assert_eq!(policy.delay_after_failures(0, None), Duration::from_millis(250));
    }
}
