//! Server-pushed cluster events, as delivered by the event frame layer.

use std::net::IpAddr;

/// Kind of a topology change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyChangeType {
    /// A node joined the cluster.
    NewNode,
    /// A node left the cluster.
    RemovedNode,
}

impl std::fmt::Display for TopologyChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopologyChangeType::NewNode => write!(f, "NEW_NODE"),
            TopologyChangeType::RemovedNode => write!(f, "REMOVED_NODE"),
        }
    }
}

/// Kind of a status change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusChangeType {
    /// The node came up.
    Up,
    /// The node went down.
    Down,
}

impl std::fmt::Display for StatusChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StatusChangeType::Up => write!(f, "UP"),
            StatusChangeType::Down => write!(f, "DOWN"),
        }
    }
}

/// A cluster membership change.
///
/// The address is the node-to-node address of the affected node; it does
/// not uniquely identify the node when multiple nodes share an IP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyChangeEvent {
    /// What happened.
    pub change: TopologyChangeType,
    /// Node-to-node address of the affected node.
    pub address: IpAddr,
    /// Port the node reports.
    pub port: u16,
}

/// A node liveness change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChangeEvent {
    /// What happened.
    pub change: StatusChangeType,
    /// Node-to-node address of the affected node.
    pub address: IpAddr,
    /// Port the node reports.
    pub port: u16,
}

/// A schema change, scoped to the kind of object that changed.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum SchemaChangeEvent {
    /// A keyspace was created, altered or dropped.
    Keyspace {
        /// `CREATED`, `UPDATED` or `DROPPED`, as sent by the server.
        change: String,
        /// The affected keyspace.
        keyspace: String,
    },
    /// A table was created, altered or dropped.
    Table {
        /// The change kind, as sent by the server.
        change: String,
        /// Keyspace of the affected table.
        keyspace: String,
        /// The affected table.
        table: String,
    },
    /// A user-defined type was created, altered or dropped.
    Type {
        /// The change kind, as sent by the server.
        change: String,
        /// Keyspace of the affected type.
        keyspace: String,
        /// The affected type.
        type_name: String,
    },
    /// A user-defined function was created, altered or dropped.
    Function {
        /// The change kind, as sent by the server.
        change: String,
        /// Keyspace of the affected function.
        keyspace: String,
        /// The affected function.
        function: String,
        /// Argument types of the affected function.
        arguments: Vec<String>,
    },
    /// A user-defined aggregate was created, altered or dropped.
    Aggregate {
        /// The change kind, as sent by the server.
        change: String,
        /// Keyspace of the affected aggregate.
        keyspace: String,
        /// The affected aggregate.
        aggregate: String,
        /// Argument types of the affected aggregate.
        arguments: Vec<String>,
    },
}

/// Any event the cluster (or the control connection itself) can emit.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ClusterEvent {
    /// Cluster membership changed.
    TopologyChange(TopologyChangeEvent),
    /// A node's liveness changed.
    StatusChange(StatusChangeEvent),
    /// The schema changed.
    SchemaChange(SchemaChangeEvent),
    /// The `system.client_routes` table changed.
    ClientRoutesChanged,
    /// The control connection was torn down and re-established, possibly
    /// against a different host; cached topology may be stale.
    ControlConnectionRecreated,
}

impl std::fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterEvent::TopologyChange(ev) => {
                write!(f, "topology change {} {}:{}", ev.change, ev.address, ev.port)
            }
            ClusterEvent::StatusChange(ev) => {
                write!(f, "status change {} {}:{}", ev.change, ev.address, ev.port)
            }
            ClusterEvent::SchemaChange(ev) => match ev {
                SchemaChangeEvent::Keyspace { change, keyspace } => {
                    write!(f, "schema change {change} keyspace {keyspace}")
                }
                SchemaChangeEvent::Table {
                    change,
                    keyspace,
                    table,
                } => write!(f, "schema change {change} table {keyspace}.{table}"),
                SchemaChangeEvent::Type {
                    change,
                    keyspace,
                    type_name,
                } => write!(f, "schema change {change} type {keyspace}.{type_name}"),
                SchemaChangeEvent::Function {
                    change,
                    keyspace,
                    function,
                    ..
                } => write!(f, "schema change {change} function {keyspace}.{function}"),
                SchemaChangeEvent::Aggregate {
                    change,
                    keyspace,
                    aggregate,
                    ..
                } => write!(f, "schema change {change} aggregate {keyspace}.{aggregate}"),
            },
            ClusterEvent::ClientRoutesChanged => write!(f, "client routes changed"),
            ClusterEvent::ControlConnectionRecreated => {
                write!(f, "control connection recreated")
            }
        }
    }
}
