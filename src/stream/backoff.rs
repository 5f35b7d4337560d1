use std::time::Duration;

use rand::Rng;

use crate::config::StreamConfig;

/// Exponential reconnect delay with additive jitter, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
    current: Duration,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, multiplier: f64, jitter: f64) -> Self {
        Self {
            base,
            max,
            multiplier: multiplier.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            current: base,
        }
    }

    pub fn from_config(config: &StreamConfig) -> Self {
        Self::new(
            Duration::from_millis(config.reconnect_base_ms),
            Duration::from_millis(config.reconnect_max_ms),
            config.reconnect_multiplier,
            config.reconnect_jitter,
        )
    }

    /// Delay before the next attempt; grows the delay for the one after.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);
        self.with_jitter(delay)
    }

    pub fn reset(&mut self) {
        self.current = self.base;
    }

    fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 {
            return delay.min(self.max);
        }
        let factor = rand::rng().random_range(0.0..=self.jitter);
        (delay + delay.mul_f64(factor)).min(self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_doubles_from_base() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0, 0.0);
        let delays: Vec<Duration> = (0..3).map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[test]
    fn test_jitter_stays_within_tolerance_and_cap() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(10), 2.0, 0.2);
        let expected = [1.0, 2.0, 4.0, 8.0, 10.0, 10.0, 10.0];
        for nominal in expected {
            let delay = backoff.next_delay().as_secs_f64();
            assert!(delay >= nominal, "delay {} below nominal {}", delay, nominal);
            assert!(delay <= (nominal * 1.2).min(10.0) + 1e-6, "delay {} too large", delay);
        }
    }

    #[test]
    fn test_reset_returns_to_base() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1), 3.0, 0.0);
        backoff.next_delay();
        backoff.next_delay();
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }
}
