//! Retry policy as an explicit state machine, decoupled from the HTTP
//! transport so the terminal classification is testable on its own.

use std::time::Duration;

use core_types::CollectError;

/// Classification of one finished request attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    /// HTTP 429. `wait_hint` is the server-provided Retry-After, if any.
    RateLimited { wait_hint: Option<Duration> },
    /// HTTP 418 or 403. Terminal for the whole process run.
    Banned { status: u16 },
    /// Any other 4xx. Not worth retrying.
    Rejected { status: u16 },
    /// Connect/timeout/5xx class failures.
    Network { detail: String },
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            rate_limit_wait: Duration::from_secs(5),
        }
    }
}

/// What the caller must do after a failed attempt.
#[derive(Debug)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Abort(CollectError),
}

/// Attempt counter plus terminal classification of the last error.
#[derive(Debug, Default)]
pub struct RetryState {
    attempts: u32,
}

impl RetryState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_error(&mut self, err: AttemptError, policy: &RetryPolicy) -> RetryDecision {
        self.attempts += 1;
        match err {
            AttemptError::Banned { status } => {
                RetryDecision::Abort(CollectError::Banned { status })
            }
            AttemptError::Rejected { status } => {
                RetryDecision::Abort(CollectError::Rejected { status })
            }
            AttemptError::RateLimited { wait_hint } => {
                if self.attempts >= policy.max_attempts {
                    RetryDecision::Abort(CollectError::RetriesExhausted {
                        attempts: self.attempts,
                        last_error: "rate limited".to_string(),
                    })
                } else {
                    RetryDecision::RetryAfter(wait_hint.unwrap_or(policy.rate_limit_wait))
                }
            }
            AttemptError::Network { detail } => {
                if self.attempts >= policy.max_attempts {
                    RetryDecision::Abort(CollectError::RetriesExhausted {
                        attempts: self.attempts,
                        last_error: detail,
                    })
                } else {
                    RetryDecision::RetryAfter(backoff_delay(self.attempts))
                }
            }
        }
    }
}

/// Exponential backoff: 1s after the first failure, doubling per attempt.
fn backoff_delay(failed_attempts: u32) -> Duration {
    let exp = failed_attempts.saturating_sub(1).min(6);
    Duration::from_secs(1u64 << exp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            rate_limit_wait: Duration::from_secs(5),
        }
    }

    #[test]
    fn ban_aborts_on_first_attempt() {
        let mut state = RetryState::new();
        let decision = state.on_error(AttemptError::Banned { status: 418 }, &policy());
        match decision {
            RetryDecision::Abort(CollectError::Banned { status }) => assert_eq!(status, 418),
            other => panic!("expected ban abort, got {other:?}"),
        }
    }

    #[test]
    fn other_4xx_is_not_retried() {
        let mut state = RetryState::new();
        let decision = state.on_error(AttemptError::Rejected { status: 400 }, &policy());
        assert!(matches!(
            decision,
            RetryDecision::Abort(CollectError::Rejected { status: 400 })
        ));
        assert_eq!(state.attempts(), 1);
    }

    #[test]
    fn rate_limit_sleeps_server_hint_then_default() {
        let mut state = RetryState::new();
        let d1 = state.on_error(
            AttemptError::RateLimited {
                wait_hint: Some(Duration::from_secs(11)),
            },
            &policy(),
        );
        assert!(matches!(d1, RetryDecision::RetryAfter(d) if d == Duration::from_secs(11)));

        let d2 = state.on_error(AttemptError::RateLimited { wait_hint: None }, &policy());
        assert!(matches!(d2, RetryDecision::RetryAfter(d) if d == Duration::from_secs(5)));
    }

    #[test]
    fn network_backoff_doubles_then_exhausts() {
        let mut state = RetryState::new();
        let err = || AttemptError::Network {
            detail: "connect timeout".to_string(),
        };

        let d1 = state.on_error(err(), &policy());
        assert!(matches!(d1, RetryDecision::RetryAfter(d) if d == Duration::from_secs(1)));

        let d2 = state.on_error(err(), &policy());
        assert!(matches!(d2, RetryDecision::RetryAfter(d) if d == Duration::from_secs(2)));

        let d3 = state.on_error(err(), &policy());
        match d3 {
            RetryDecision::Abort(CollectError::RetriesExhausted {
                attempts,
                last_error,
            }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last_error, "connect timeout");
            }
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[test]
    fn backoff_is_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(1));
        assert_eq!(backoff_delay(4), Duration::from_secs(8));
        assert_eq!(backoff_delay(40), Duration::from_secs(64));
    }
}
