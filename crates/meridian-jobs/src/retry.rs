//! Retry policies for failed jobs.

use crate::config::RetryConfig;
use crate::error::JobError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-enqueue the job after the given delay.
    RetryAfter(Duration),
    /// Terminally fail the job.
    GiveUp,
}

/// How the delay between attempts grows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Delay for attempt `n` is entry `n - 1`, clamped to the last entry.
    Sequence(Vec<Duration>),
    /// `initial * multiplier^(n - 1)`, capped at `max`.
    Exponential {
        initial: Duration,
        multiplier: f64,
        max: Duration,
    },
}

/// Retry policy configuration.
///
/// Stateless and deterministic: the same attempt and error always yield
/// the same decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts allowed, including the first.
    pub max_attempts: u32,

    /// Delay growth.
    pub backoff: Backoff,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::sequence(3, vec![Duration::from_secs(300)])
    }
}

impl RetryPolicy {
    /// Creates a policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Sequence(Vec::new()),
        }
    }

    /// Creates a fixed delay retry policy.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self::sequence(max_attempts, vec![delay])
    }

    /// Creates a policy that walks an explicit delay sequence.
    pub fn sequence(max_attempts: u32, delays: Vec<Duration>) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Sequence(delays),
        }
    }

    /// Creates an exponential backoff retry policy (1s doubling, capped at 1h).
    pub fn exponential(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            backoff: Backoff::Exponential {
                initial: Duration::from_secs(1),
                multiplier: 2.0,
                max: Duration::from_secs(3600),
            },
        }
    }

    /// Decides the next step after `attempt` (1-based) failed with `error`.
    pub fn decide(&self, attempt: u32, error: &JobError) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::RetryAfter(self.delay_for_attempt(attempt))
    }

    /// Calculate delay for the given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        match &self.backoff {
            Backoff::Sequence(delays) => {
                let index = (attempt as usize - 1).min(delays.len().saturating_sub(1));
                delays.get(index).copied().unwrap_or(Duration::ZERO)
            }
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exp = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
                let secs = initial.as_secs_f64() * multiplier.powi(exp);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                }
            }
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::sequence(
            config.max_attempts,
            config.delays_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure() -> JobError {
        JobError::ExecutionFailed("boom".into())
    }

    #[test]
    fn test_no_retry() {
        let policy = RetryPolicy::none();
        assert_eq!(policy.decide(1, &failure()), RetryDecision::GiveUp);
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(
            policy.decide(1, &failure()),
            RetryDecision::RetryAfter(Duration::from_secs(300))
        );
        assert_eq!(
            policy.decide(2, &failure()),
            RetryDecision::RetryAfter(Duration::from_secs(300))
        );
        assert_eq!(policy.decide(3, &failure()), RetryDecision::GiveUp);
    }

    #[test]
    fn test_give_up_exactly_at_max() {
        for max in 1..=6 {
            let policy = RetryPolicy::sequence(max, vec![Duration::from_secs(5), Duration::from_secs(15)]);
            for attempt in 1..max {
                assert!(matches!(
                    policy.decide(attempt, &failure()),
                    RetryDecision::RetryAfter(_)
                ));
            }
            assert_eq!(policy.decide(max, &failure()), RetryDecision::GiveUp);
            assert_eq!(policy.decide(max + 1, &failure()), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn test_sequence_clamps_to_last_entry() {
        let policy = RetryPolicy::sequence(5, vec![Duration::from_secs(5), Duration::from_secs(15)]);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(15));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_secs(15));
    }

    #[test]
    fn test_empty_sequence_retries_immediately() {
        let policy = RetryPolicy::sequence(2, Vec::new());
        assert_eq!(
            policy.decide(1, &failure()),
            RetryDecision::RetryAfter(Duration::ZERO)
        );
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(10);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_secs(3600));
    }

    #[test]
    fn test_delays_non_decreasing() {
        let policies = [
            RetryPolicy::default(),
            RetryPolicy::exponential(20),
            RetryPolicy::sequence(8, vec![Duration::from_secs(1), Duration::from_secs(10), Duration::from_secs(60)]),
        ];
        for policy in policies {
            let delays: Vec<Duration> = (1..policy.max_attempts)
                .map(|a| policy.delay_for_attempt(a))
                .collect();
            assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        }
    }

    #[test]
    fn test_non_retryable_error_gives_up() {
        let policy = RetryPolicy::default();
        let error = JobError::UnknownJobKind("missing".into());
        assert_eq!(policy.decide(1, &error), RetryDecision::GiveUp);
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            max_attempts: 4,
            delays_secs: vec![5, 15],
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_secs(15));
    }
}
