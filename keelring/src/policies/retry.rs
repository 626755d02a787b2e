//! Retry policies: deciding whether and where a failed attempt is
//! retried.

use crate::errors::RequestAttemptError;

/// Everything a retry decision may depend on.
#[derive(Debug, Clone, Copy)]
pub struct RequestInfo<'a> {
    /// The error the last attempt ended with.
    pub error: &'a RequestAttemptError,
    /// How many attempts have been made so far, the failed one included.
    pub attempts: usize,
    /// Whether the request is safe to run more than once.
    pub is_idempotent: bool,
    /// Whether the request is a lightweight transaction. Retrying an
    /// LWT on another host forfeits the cached Paxos state, so LWT
    /// retries stay on the same host.
    pub is_lwt: bool,
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryType {
    /// Retry on the same host.
    Retry,
    /// Retry on the next host of the plan.
    RetryNextHost,
    /// Swallow the error and report an empty result.
    Ignore,
    /// Give up and surface the error.
    Rethrow,
}

/// Decides whether a failed request gets another attempt, and where.
pub trait RetryPolicy: Send + Sync {
    /// Whether any further attempt should be made at all.
    fn attempt(&self, request: &RequestInfo<'_>) -> bool;

    /// How the next attempt should be made.
    fn retry_type(&self, request: &RequestInfo<'_>) -> RetryType;
}

/// Retries up to a fixed number of times, moving to the next host on
/// connectivity problems and staying put on server-side timeouts.
#[derive(Debug, Clone, Copy)]
pub struct SimpleRetryPolicy {
    /// How many retries are allowed on top of the initial attempt.
    pub num_retries: usize,
}

impl Default for SimpleRetryPolicy {
    fn default() -> Self {
        SimpleRetryPolicy { num_retries: 3 }
    }
}

impl RetryPolicy for SimpleRetryPolicy {
    fn attempt(&self, request: &RequestInfo<'_>) -> bool {
        request.attempts <= self.num_retries
    }

    fn retry_type(&self, request: &RequestInfo<'_>) -> RetryType {
        let moving = match request.error {
            RequestAttemptError::BrokenConnection(_) | RequestAttemptError::Unavailable => {
                RetryType::RetryNextHost
            }
            RequestAttemptError::ReadTimeout
            | RequestAttemptError::WriteTimeout
            | RequestAttemptError::Overloaded => RetryType::Retry,
            _ => return RetryType::Rethrow,
        };
        if request.is_lwt && moving == RetryType::RetryNextHost {
            RetryType::Retry
        } else {
            moving
        }
    }
}

/// Never retries anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn attempt(&self, _request: &RequestInfo<'_>) -> bool {
        false
    }

    fn retry_type(&self, _request: &RequestInfo<'_>) -> RetryType {
        RetryType::Rethrow
    }
}
