//! Narrow interfaces to the data plane.
//!
//! The topology subsystem does not own connections; it consumes them
//! through the traits below, implemented by the connection layer. Rows of
//! system tables are passed around as loosely typed column maps so that
//! this crate stays independent of the wire codec.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::cluster::node::Host;
use crate::errors::RequestAttemptError;
use crate::routing::Token;

/// A single value of a system table column.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum RowValue {
    /// A `text` / `varchar` column.
    Text(String),
    /// An `int` column.
    Int(i32),
    /// A `bigint` column.
    BigInt(i64),
    /// A `boolean` column.
    Bool(bool),
    /// A `uuid` column.
    Uuid(Uuid),
    /// An `inet` column.
    Inet(IpAddr),
    /// A `list<text>` / `set<text>` column.
    TextList(Vec<String>),
}

impl RowValue {
    /// Borrows the value as text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            RowValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Reads the value as an `int`.
    pub fn as_int(&self) -> Option<i32> {
        match self {
            RowValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads the value as a `boolean`.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            RowValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads the value as a `uuid`.
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            RowValue::Uuid(v) => Some(*v),
            _ => None,
        }
    }

    /// Reads the value as an `inet` address.
    pub fn as_inet(&self) -> Option<IpAddr> {
        match self {
            RowValue::Inet(v) => Some(*v),
            _ => None,
        }
    }

    /// Borrows the value as a text list.
    pub fn as_text_list(&self) -> Option<&[String]> {
        match self {
            RowValue::TextList(v) => Some(v),
            _ => None,
        }
    }
}

/// A row of a system table, keyed by column name.
pub type Row = HashMap<String, RowValue>;

/// A single established connection to one host.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Executes a parameterized statement on this connection.
    async fn query(
        &self,
        statement: &str,
        values: &[RowValue],
    ) -> Result<Vec<Row>, RequestAttemptError>;
}

/// The connection currently backing the control connection, together with
/// the host it leads to.
#[derive(Clone)]
pub struct ConnHost {
    /// The control connection's current transport.
    pub conn: Arc<dyn Connection>,
    /// The host the transport is established to.
    pub host: Arc<Host>,
}

/// The long-lived connection used for topology discovery and server
/// events.
#[async_trait]
pub trait ControlConnection: Send + Sync {
    /// Returns the currently established connection, if any.
    fn get_conn(&self) -> Option<ConnHost>;

    /// Executes a statement on the control host.
    async fn query(
        &self,
        statement: &str,
        values: &[RowValue],
    ) -> Result<Vec<Row>, RequestAttemptError>;

    /// Tears the current connection down and dials a new control host.
    async fn reconnect(&self) -> Result<(), RequestAttemptError>;

    /// Waits until all reachable hosts converge on one schema version.
    async fn await_schema_agreement(&self) -> Result<(), RequestAttemptError>;

    /// Closes the control connection for good.
    async fn close(&self);
}

/// A pool of connections to a single host.
pub trait ConnectionPool: Send + Sync {
    /// Picks a connection, preferring the shard owning the given token.
    fn pick(&self, token: Option<Token>) -> Option<Arc<dyn Connection>>;

    /// Number of requests currently in flight through this pool.
    fn in_flight(&self) -> usize;
}

/// Owner of the per-host connection pools.
pub trait PoolProvider: Send + Sync {
    /// Returns the pool of the given host, if one exists.
    fn pool(&self, host: &Host) -> Option<Arc<dyn ConnectionPool>>;

    /// Asynchronously establishes the pool of a newly discovered host.
    fn fill(&self, host: &Arc<Host>);

    /// Tears down the pool of a removed host.
    fn remove(&self, host: &Host);
}
