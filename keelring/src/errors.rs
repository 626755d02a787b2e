//! Error types returned by the topology and routing subsystems.

use std::sync::Arc;

use itertools::Itertools as _;
use thiserror::Error;
use uuid::Uuid;

/// An error that occurred during a single attempt of executing a request
/// on one host.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestAttemptError {
    /// The caller cancelled the request.
    #[error("request was cancelled")]
    Cancelled,

    /// The caller-imposed deadline passed before the attempt finished.
    #[error("request deadline exceeded")]
    DeadlineExceeded,

    /// The requested entity does not exist.
    #[error("requested entity was not found")]
    NotFound,

    /// The connection was closed while the request was in flight.
    #[error("connection broken: {0}")]
    BrokenConnection(String),

    /// The coordinator did not have enough alive replicas.
    #[error("coordinator had not enough alive replicas")]
    Unavailable,

    /// The coordinator timed out waiting for replica reads.
    #[error("coordinator timed out waiting for replica reads")]
    ReadTimeout,

    /// The coordinator timed out waiting for replica writes.
    #[error("coordinator timed out waiting for replica writes")]
    WriteTimeout,

    /// The coordinator is shedding load.
    #[error("coordinator is overloaded")]
    Overloaded,

    /// Any other error reported by the server.
    #[error("server error: {0}")]
    Server(String),
}

impl RequestAttemptError {
    /// Logical errors describe the request itself rather than the host it
    /// was tried on. They terminate the whole request instead of being
    /// handed to the retry machinery.
    pub fn is_logical(&self) -> bool {
        matches!(
            self,
            RequestAttemptError::Cancelled
                | RequestAttemptError::DeadlineExceeded
                | RequestAttemptError::NotFound
        )
    }
}

/// An error that caused the whole request, over all attempted hosts,
/// to fail.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum RequestError {
    /// The selection policy produced no hosts at all.
    #[error("load balancing policy returned an empty plan")]
    EmptyPlan,

    /// Every host in the plan was down or had no usable connection,
    /// and no attempt was ever made.
    #[error("no connections were available to any host")]
    NoConnections,

    /// The error of the last attempt that was actually made.
    #[error(transparent)]
    LastAttemptError(#[from] RequestAttemptError),
}

/// An error encountered while discovering or refreshing cluster topology.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum MetadataError {
    /// No control connection is currently established.
    #[error("no control connection is available")]
    NoControlConnection,

    /// `system.local` unexpectedly returned no rows.
    #[error("system.local query returned no rows")]
    EmptyLocal,

    /// A system table row had a missing or mistyped column.
    #[error("invalid row in {table}: bad column {column}")]
    InvalidColumn {
        /// Name of the queried system table.
        table: &'static str,
        /// Name of the offending column.
        column: String,
    },

    /// A host expected to be present in the registry was not found.
    #[error("cannot find host {0} in the registry")]
    CannotFindHost(Uuid),

    /// A host was added to the registry concurrently.
    #[error("host {0} already exists in the registry")]
    HostAlreadyExists(Uuid),

    /// A release version string could not be parsed.
    #[error("invalid release version {version:?}: {reason}")]
    InvalidReleaseVersion {
        /// The unparsable version string.
        version: String,
        /// What made it unparsable.
        reason: &'static str,
    },

    /// A refresh was requested after the refresher had been stopped.
    #[error("topology refresh was requested on a stopped refresher")]
    RefresherStopped,

    /// The underlying system table request failed.
    #[error("system table request failed: {0}")]
    Request(#[from] RequestAttemptError),
}

/// An error returned by client-route based address translation.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum TranslationError {
    /// The host carries an id, but no client route is known for it.
    #[error("no client route is known for host {0}")]
    NoRouteForHost(Uuid),

    /// The route snapshot was concurrently replaced on every publication
    /// attempt.
    #[error("route snapshot kept changing during translation ({0} attempts)")]
    SnapshotContention(usize),

    /// Resolving the route's hostname failed.
    #[error(transparent)]
    Resolution(#[from] ResolutionError),
}

/// An error produced while resolving a client route's hostname.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ResolutionError {
    /// The DNS lookup itself failed.
    #[error("dns lookup for {hostname} failed: {reason}")]
    Lookup {
        /// The hostname that was being resolved.
        hostname: String,
        /// The underlying I/O error.
        reason: Arc<std::io::Error>,
    },

    /// The DNS lookup succeeded but returned no addresses.
    #[error("dns lookup for {0} returned no addresses")]
    EmptyLookup(String),
}

/// Errors collected while resolving a batch of client routes.
///
/// Successful resolutions in the batch are still applied.
#[derive(Error, Debug, Clone)]
#[error("{} route resolution(s) failed: {}", .0.len(), .0.iter().map(|e| e.to_string()).join("; "))]
pub struct AggregatedResolutionError(pub Vec<ResolutionError>);

/// An error returned by the event bus lifecycle and subscription calls.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EventBusError {
    /// `start` was called on a bus that is already running.
    #[error("event bus is already started")]
    AlreadyStarted,

    /// The bus has been stopped and cannot be used again.
    #[error("event bus is already stopped")]
    AlreadyStopped,

    /// `stop` was called on a bus that was never started.
    #[error("event bus is not started")]
    NotStarted,

    /// No subscriber with the given name is registered.
    #[error("subscriber not found")]
    SubscriberNotFound,
}

/// A host selection policy configuration error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PolicyError {
    /// The configured local datacenter matches no host in the cluster.
    #[error("datacenter {0:?} is unknown to the cluster")]
    UnknownDatacenter(String),
}

/// An error in raw tablet metadata received from the cluster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum TabletParsingError {
    /// A replica carried a negative shard number.
    #[error("tablet replica shard number {0} is negative")]
    ShardNum(i64),

    /// A tablet range was empty or inverted.
    #[error("tablet first token {first} is not lower than last token {last}")]
    TokenOrder {
        /// Exclusive lower bound of the tablet.
        first: i64,
        /// Inclusive upper bound of the tablet.
        last: i64,
    },
}
