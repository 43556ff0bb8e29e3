use log::{debug, warn};
use serde::Serialize;
use std::fmt::Display;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Delay before the second attempt; doubles for every attempt after.
    pub base_delay: Duration,
    /// From this attempt number on, the operation is asked to use its
    /// alternate parameterisation.
    pub alternate_from: Option<u32>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            alternate_from: None,
        }
    }

    pub fn with_alternate_from(mut self, attempt: u32) -> Self {
        self.alternate_from = Some(attempt);
        self
    }

    /// Sleep before `attempt` (1-based). Nothing before the first.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(attempt - 2).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attempt {
    pub number: u32,
    pub alternate: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct AttemptFailure {
    pub attempt: u32,
    pub alternate: bool,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetryOutcome<T> {
    pub success: bool,
    pub attempts: u32,
    pub value: Option<T>,
    pub failures: Vec<AttemptFailure>,
    /// Set when a fatal error ended the loop early.
    pub aborted: bool,
}

pub fn retry_strategy<T, E: Display>(
    policy: &RetryPolicy,
    operation: impl FnMut(Attempt) -> Result<T, E>,
) -> RetryOutcome<T> {
    retry_with(policy, operation, |_| false)
}

/// Runs `operation` up to `policy.max_attempts` times with exponential
/// backoff. An error for which `fatal` returns true stops immediately.
pub fn retry_with<T, E: Display>(
    policy: &RetryPolicy,
    mut operation: impl FnMut(Attempt) -> Result<T, E>,
    fatal: impl Fn(&E) -> bool,
) -> RetryOutcome<T> {
    let mut failures = Vec::new();
    let max_attempts = policy.max_attempts.max(1);

    for number in 1..=max_attempts {
        let delay = policy.delay_before(number);
        if !delay.is_zero() {
            debug!("retry backoff {}ms before attempt {}", delay.as_millis(), number);
            std::thread::sleep(delay);
        }
        let attempt = Attempt {
            number,
            alternate: policy.alternate_from.map(|from| number >= from).unwrap_or(false),
        };
        match operation(attempt) {
            Ok(value) => {
                return RetryOutcome {
                    success: true,
                    attempts: number,
                    value: Some(value),
                    failures,
                    aborted: false,
                }
            }
            Err(err) => {
                warn!("attempt {}/{} failed: {}", number, max_attempts, err);
                let stop = fatal(&err);
                failures.push(AttemptFailure {
                    attempt: number,
                    alternate: attempt.alternate,
                    error: err.to_string(),
                });
                if stop {
                    return RetryOutcome {
                        success: false,
                        attempts: number,
                        value: None,
                        failures,
                        aborted: true,
                    };
                }
            }
        }
    }

    RetryOutcome {
        success: false,
        attempts: max_attempts,
        value: None,
        failures,
        aborted: false,
    }
}
