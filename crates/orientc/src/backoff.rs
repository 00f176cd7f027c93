use rand::Rng;
use std::time::Duration;

/// Exponential reconnect delay, indexed by attempt number, with optional jitter.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    factor: f64,
    jitter: bool,
}

impl ExponentialBackoff {
    /// Creates a new `ExponentialBackoff` with the given parameters.
    ///
    /// # Examples
    ///
    /// ```
    /// use orientc::backoff::ExponentialBackoff;
    /// use std::time::Duration;
    /// let backoff = ExponentialBackoff::new(
    ///     Duration::from_millis(1000),
    ///     Duration::from_millis(30_000),
    ///     2.0,
    /// );
    /// assert_eq!(backoff.delay(0), Duration::from_millis(1000));
    /// assert_eq!(backoff.delay(3), Duration::from_millis(8000));
    /// assert_eq!(backoff.delay(9), Duration::from_millis(30_000));
    /// ```
    #[must_use]
    pub const fn new(initial: Duration, max: Duration, factor: f64) -> Self {
        Self {
            initial,
            max,
            factor,
            jitter: false,
        }
    }

    /// Enables or disables the ±25% jitter band.
    #[must_use]
    pub const fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    /// Delay before reconnect attempt `attempt` (0-based), ignoring jitter:
    /// `min(initial * factor^attempt, max)`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let initial_ms = self.initial.as_millis().min(u128::from(u64::MAX)) as f64;
        let max_ms = self.max.as_millis().min(u128::from(u64::MAX)) as f64;
        let exp = i32::try_from(attempt).unwrap_or(i32::MAX);

        let ms = (initial_ms * self.factor.powi(exp)).min(max_ms);
        Duration::from_millis(ms as u64)
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_precision_loss,
        clippy::cast_sign_loss
    )]
    /// Delay before reconnect attempt `attempt`, with jitter applied if enabled.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter {
            return base;
        }
        let base_ms = base.as_millis().min(u128::from(u64::MAX)) as u64;
        let jitter_factor = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((base_ms as f64 * jitter_factor) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relay_backoff() -> ExponentialBackoff {
        ExponentialBackoff::new(
            Duration::from_millis(1000),
            Duration::from_millis(30_000),
            2.0,
        )
    }

    #[test]
    fn test_first_five_delays_double() {
        let backoff = relay_backoff();
        let delays: Vec<u128> = (0..5).map(|a| backoff.delay(a).as_millis()).collect();
        assert_eq!(delays, vec![1000, 2000, 4000, 8000, 16000]);
    }

    #[test]
    fn test_delays_cap_at_max_from_attempt_five() {
        let backoff = relay_backoff();
        for attempt in 5..12 {
            assert_eq!(backoff.delay(attempt), Duration::from_millis(30_000));
        }
    }

    #[test]
    fn test_overflow_safety_with_huge_attempt() {
        let backoff = relay_backoff();
        assert_eq!(backoff.delay(u32::MAX), Duration::from_millis(30_000));

        let unbounded =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(u64::MAX), 2.0);
        assert!(unbounded.delay(2000) > Duration::ZERO);
    }

    #[test]
    fn test_factor_of_one_stays_at_initial() {
        let backoff =
            ExponentialBackoff::new(Duration::from_millis(100), Duration::from_millis(5000), 1.0);
        for attempt in 0..5 {
            assert_eq!(backoff.delay(attempt), Duration::from_millis(100));
        }
    }

    #[test]
    #[allow(clippy::cast_precision_loss)]
    fn test_jitter_stays_within_band() {
        let backoff = relay_backoff().with_jitter(true);
        for attempt in 0..10 {
            let base = backoff.base_delay(attempt).as_millis() as f64;
            let delay = backoff.delay(attempt).as_millis() as f64;
            assert!(
                delay >= base * 0.75 - 1.0 && delay <= base * 1.25 + 1.0,
                "delay {delay} outside jitter band around {base}"
            );
        }
    }
}
