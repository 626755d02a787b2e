//! The request execution loop: walking a host plan, applying the retry
//! policy and racing speculative attempts.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::{RequestAttemptError, RequestError};
use crate::network::{Connection, PoolProvider};
use crate::policies::load_balancing::{HostPlan, HostSelectionPolicy, RoutingInfo, SelectedHost};
use crate::policies::retry::{RequestInfo, RetryPolicy, RetryType};
use crate::policies::speculative_execution::{self, SpeculativeExecutionPolicy};

/// A request the executor can drive to completion.
#[async_trait]
pub trait ExecutableRequest: Send + Sync {
    /// What a successful execution produces. The default value stands in
    /// for the result of an ignored failure.
    type Output: Default + Send;

    /// Routing properties of the request.
    fn routing_info(&self) -> RoutingInfo<'_>;

    /// The retry policy governing this request.
    fn retry_policy(&self) -> &dyn RetryPolicy;

    /// The speculative execution policy, when one applies. Only
    /// idempotent requests are ever executed speculatively.
    fn speculative_execution_policy(&self) -> Option<&dyn SpeculativeExecutionPolicy> {
        None
    }

    /// Runs the request once over the given connection.
    async fn execute(&self, conn: &dyn Connection) -> Result<Self::Output, RequestAttemptError>;
}

/// Drives requests through host plans produced by the selection policy.
///
/// For each candidate the executor skips hosts that are down or lack a
/// usable connection, executes the request, and classifies the outcome:
/// logical errors terminate the whole request at once, everything else
/// goes through the retry policy. Every attempt's outcome is reported
/// to the policy's host marking, with logical failures counting as
/// healthy. An idempotent request with a
/// speculative policy races additional attempts over the same shared
/// plan, so concurrent attempts never dial the same host.
pub struct QueryExecutor {
    policy: Arc<dyn HostSelectionPolicy>,
    pools: Arc<dyn PoolProvider>,
}

impl QueryExecutor {
    /// Creates an executor on top of a selection policy and the
    /// connection pools.
    pub fn new(policy: Arc<dyn HostSelectionPolicy>, pools: Arc<dyn PoolProvider>) -> Self {
        QueryExecutor { policy, pools }
    }

    /// Executes the request, retrying and failing over per its policies.
    pub async fn execute<R: ExecutableRequest>(
        &self,
        request: &R,
    ) -> Result<R::Output, RequestError> {
        let routing = request.routing_info();
        let mut plan = self.policy.pick(&routing).peekable();
        if plan.peek().is_none() {
            return Err(RequestError::EmptyPlan);
        }
        let plan: Arc<StdMutex<HostPlan>> = Arc::new(StdMutex::new(Box::new(plan)));

        match request.speculative_execution_policy() {
            Some(speculative_policy) if routing.is_idempotent => {
                speculative_execution::execute(
                    speculative_policy,
                    RequestError::NoConnections,
                    |is_speculative| {
                        let plan = plan.clone();
                        async move {
                            if is_speculative {
                                debug!("launching a speculative attempt");
                            }
                            self.run_attempts(request, &routing, plan.as_ref()).await
                        }
                    },
                )
                .await
            }
            _ => self
                .run_attempts(request, &routing, plan.as_ref())
                .await
                .unwrap_or(Err(RequestError::NoConnections)),
        }
    }

    /// Walks the shared plan until the request succeeds, a terminal
    /// error occurs, or the plan runs out. `None` means the plan was
    /// exhausted without a single attempt being made.
    async fn run_attempts<R: ExecutableRequest>(
        &self,
        request: &R,
        routing: &RoutingInfo<'_>,
        plan: &StdMutex<HostPlan>,
    ) -> Option<Result<R::Output, RequestError>> {
        let retry_policy = request.retry_policy();
        let mut attempts = 0usize;
        let mut last_error: Option<RequestAttemptError> = None;

        'hosts: loop {
            let next = { plan.lock().unwrap().next() };
            let Some(SelectedHost { host, token }) = next else {
                break;
            };
            if !host.is_up() {
                debug!(host = %host.hostname(), "skipping host marked down");
                continue;
            }
            let Some(pool) = self.pools.pool(&host) else {
                debug!(host = %host.hostname(), "skipping host without a pool");
                continue;
            };

            loop {
                let Some(conn) = pool.pick(token) else {
                    continue 'hosts;
                };
                attempts += 1;
                let error = match request.execute(conn.as_ref()).await {
                    Ok(output) => {
                        self.policy.mark_host(&host, None);
                        return Some(Ok(output));
                    }
                    Err(error) if error.is_logical() => {
                        // Logical failures do not count against the host.
                        self.policy.mark_host(&host, None);
                        return Some(Err(RequestError::LastAttemptError(error)));
                    }
                    Err(error) => {
                        self.policy.mark_host(&host, Some(&error));
                        error
                    }
                };

                let info = RequestInfo {
                    error: &error,
                    attempts,
                    is_idempotent: routing.is_idempotent,
                    is_lwt: routing.is_lwt,
                };
                if !retry_policy.attempt(&info) {
                    return Some(Err(RequestError::LastAttemptError(error)));
                }
                match retry_policy.retry_type(&info) {
                    RetryType::Retry => {
                        warn!(host = %host.hostname(), %error, "retrying on the same host");
                        last_error = Some(error);
                    }
                    RetryType::RetryNextHost => {
                        warn!(host = %host.hostname(), %error, "retrying on the next host");
                        last_error = Some(error);
                        continue 'hosts;
                    }
                    RetryType::Ignore => return Some(Ok(R::Output::default())),
                    RetryType::Rethrow => {
                        return Some(Err(RequestError::LastAttemptError(error)));
                    }
                }
            }
        }

        match last_error {
            Some(error) => Some(Err(RequestError::LastAttemptError(error))),
            None if attempts == 0 => None,
            None => Some(Err(RequestError::NoConnections)),
        }
    }
}
