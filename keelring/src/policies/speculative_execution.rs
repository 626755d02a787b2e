//! Speculative execution: racing additional attempts of an idempotent
//! request against hosts that are slow to answer.

use std::future::Future;
use std::time::Duration;

use futures::{future::FutureExt, stream::FuturesUnordered, StreamExt};
use tracing::warn;

use crate::errors::{RequestAttemptError, RequestError};

/// Controls how many speculative attempts are made and how far apart.
pub trait SpeculativeExecutionPolicy: std::fmt::Debug + Send + Sync {
    /// Maximum number of speculative attempts on top of the initial one.
    fn max_retry_count(&self) -> usize;

    /// Delay before each additional attempt is started.
    fn retry_interval(&self) -> Duration;
}

/// A fixed attempt count with a constant delay between attempts.
#[derive(Debug, Clone, Copy)]
pub struct SimpleSpeculativeExecutionPolicy {
    /// Maximum number of speculative attempts.
    pub max_retry_count: usize,
    /// Delay between attempts.
    pub retry_interval: Duration,
}

impl SpeculativeExecutionPolicy for SimpleSpeculativeExecutionPolicy {
    fn max_retry_count(&self) -> usize {
        self.max_retry_count
    }

    fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

/// Whether an attempt's failure may be held back while other in-flight
/// attempts are still racing.
pub(crate) trait SpeculativeError {
    fn can_be_ignored(&self) -> bool;
}

impl SpeculativeError for RequestError {
    fn can_be_ignored(&self) -> bool {
        matches!(
            self,
            RequestError::NoConnections
                | RequestError::LastAttemptError(
                    RequestAttemptError::BrokenConnection(_)
                        | RequestAttemptError::Unavailable
                        | RequestAttemptError::Overloaded
                )
        )
    }
}

/// Races attempts produced by `run` against each other.
///
/// `run(true)` marks a speculative attempt. An attempt resolving to
/// `None` means its host plan was exhausted without making a call. The
/// first success wins; a failure that can't be ignored wins too. When
/// everything has failed ignorably, the last failure is surfaced,
/// falling back to `exhausted_error` if no attempt got as far as
/// failing.
pub(crate) async fn execute<AttemptFut, ResT, ErrT>(
    policy: &dyn SpeculativeExecutionPolicy,
    exhausted_error: ErrT,
    run: impl Fn(bool) -> AttemptFut,
) -> Result<ResT, ErrT>
where
    AttemptFut: Future<Output = Option<Result<ResT, ErrT>>>,
    ErrT: SpeculativeError + std::fmt::Display,
{
    let mut retries_remaining = policy.max_retry_count();
    let retry_interval = policy.retry_interval();

    let mut attempts = FuturesUnordered::new();
    attempts.push(run(false));

    let sleep = tokio::time::sleep(retry_interval).fuse();
    tokio::pin!(sleep);

    let mut last_error: Option<ErrT> = None;
    loop {
        futures::select! {
            () = &mut sleep => {
                if retries_remaining > 0 {
                    attempts.push(run(true));
                    retries_remaining -= 1;
                    sleep.set(tokio::time::sleep(retry_interval).fuse());
                }
            }
            outcome = attempts.select_next_some() => {
                match outcome {
                    Some(Ok(result)) => return Ok(result),
                    Some(Err(error)) if !error.can_be_ignored() => return Err(error),
                    Some(Err(error)) => {
                        warn!(%error, "speculative attempt failed");
                        last_error = Some(error);
                    }
                    None => {}
                }
                if attempts.is_empty() && retries_remaining == 0 {
                    return Err(last_error.unwrap_or(exhausted_error));
                }
            }
        }
    }
}
