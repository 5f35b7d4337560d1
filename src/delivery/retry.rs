use std::time::Duration;

use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, SendFailure};

/// What to do after a failed send attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    Retry(Duration),
    Abort(DeliveryError),
}

/// Bounded retry rules for a single message.
///
/// Throttling is retried once, after the server's hint or `throttle_wait`.
/// Transient failures back off exponentially from `base` until
/// `max_attempts` of them have been seen. Permanent failures abort at once.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base: Duration,
    max: Duration,
    throttle_wait: Duration,
}

#[derive(Debug)]
pub struct RetryState {
    policy: RetryPolicy,
    attempts: u32,
    transient_failures: u32,
    throttle_retried: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base: Duration, max: Duration, throttle_wait: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base,
            max,
            throttle_wait,
        }
    }

    pub fn from_config(config: &DeliveryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.retry_base_ms),
            Duration::from_millis(config.retry_max_ms),
            config.throttle_wait(),
        )
    }

    pub fn start(&self) -> RetryState {
        RetryState {
            policy: self.clone(),
            attempts: 0,
            transient_failures: 0,
            throttle_retried: false,
        }
    }

    fn transient_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base.saturating_mul(1 << exponent).min(self.max)
    }
}

impl RetryState {
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_failure(&mut self, failure: SendFailure) -> RetryDecision {
        self.attempts += 1;
        match failure {
            SendFailure::Throttled { retry_after } => {
                if self.throttle_retried {
                    return RetryDecision::Abort(DeliveryError::Throttled {
                        attempts: self.attempts,
                    });
                }
                self.throttle_retried = true;
                RetryDecision::Retry(retry_after.unwrap_or(self.policy.throttle_wait))
            }
            SendFailure::Transient(reason) => {
                self.transient_failures += 1;
                if self.transient_failures >= self.policy.max_attempts {
                    return RetryDecision::Abort(DeliveryError::Transient {
                        attempts: self.attempts,
                        reason,
                    });
                }
                RetryDecision::Retry(self.policy.transient_delay(self.transient_failures))
            }
            SendFailure::Permanent(reason) => {
                RetryDecision::Abort(DeliveryError::Permanent(reason))
            }
        }
    }
}
