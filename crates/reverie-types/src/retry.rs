use std::time::Duration;

/// Local retry policy for side-effect closures.
///
/// Delays grow geometrically from `initial_interval` by `factor`, clamped
/// to `max_interval`. `max_attempts` counts executions (not retries); a
/// policy may also bound the total time spent across attempts via
/// `max_duration`. A policy with neither bound retries indefinitely.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub factor: f32,
    pub max_interval: Option<Duration>,
    pub max_attempts: Option<u32>,
    pub max_duration: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(50),
            factor: 2.0,
            max_interval: Some(Duration::from_secs(10)),
            max_attempts: None,
            max_duration: None,
        }
    }
}

impl RetryPolicy {
    /// Constant delay between at most `max_attempts` executions.
    pub fn fixed_delay(interval: Duration, max_attempts: u32) -> Self {
        Self {
            initial_interval: interval,
            factor: 1.0,
            max_interval: None,
            max_attempts: Some(max_attempts),
            max_duration: None,
        }
    }

    /// Geometric backoff bounded by attempt count.
    pub fn exponential(initial_interval: Duration, factor: f32, max_attempts: u32) -> Self {
        Self {
            initial_interval,
            factor,
            max_interval: None,
            max_attempts: Some(max_attempts),
            max_duration: None,
        }
    }

    pub fn with_max_interval(mut self, max_interval: Duration) -> Self {
        self.max_interval = Some(max_interval);
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    /// Delay to apply before attempt `attempt + 1`, or `None` when the
    /// policy is exhausted.
    ///
    /// `attempt` is 1-based (the execution that just failed); `elapsed` is
    /// the total time spent since the first execution started.
    pub fn next_delay(&self, attempt: u32, elapsed: Duration) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts
            && attempt >= max_attempts
        {
            return None;
        }
        if let Some(max_duration) = self.max_duration
            && elapsed >= max_duration
        {
            return None;
        }
        let exp = self.factor.powi(attempt.saturating_sub(1) as i32);
        let delay = self.initial_interval.mul_f32(exp.max(0.0));
        Some(match self.max_interval {
            Some(max) if delay > max => max,
            _ => delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_delay_exhausts_after_max_attempts() {
        let policy = RetryPolicy::fixed_delay(Duration::from_millis(10), 3);
        assert_eq!(
            policy.next_delay(1, Duration::ZERO),
            Some(Duration::from_millis(10))
        );
        assert_eq!(
            policy.next_delay(2, Duration::ZERO),
            Some(Duration::from_millis(10))
        );
        assert_eq!(policy.next_delay(3, Duration::ZERO), None);
    }

    #[test]
    fn exponential_growth_is_clamped() {
        let policy = RetryPolicy::exponential(Duration::from_millis(100), 2.0, 10)
            .with_max_interval(Duration::from_millis(250));
        assert_eq!(
            policy.next_delay(1, Duration::ZERO),
            Some(Duration::from_millis(100))
        );
        assert_eq!(
            policy.next_delay(2, Duration::ZERO),
            Some(Duration::from_millis(200))
        );
        assert_eq!(
            policy.next_delay(3, Duration::ZERO),
            Some(Duration::from_millis(250))
        );
    }

    #[test]
    fn max_duration_cuts_off_retries() {
        let policy = RetryPolicy::exponential(Duration::from_millis(1), 2.0, 100)
            .with_max_duration(Duration::from_secs(1));
        assert!(policy.next_delay(5, Duration::from_millis(999)).is_some());
        assert_eq!(policy.next_delay(5, Duration::from_secs(1)), None);
    }
}
