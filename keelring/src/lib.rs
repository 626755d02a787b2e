//! Cluster topology discovery and request routing for CQL-compatible databases.
//!
//! This crate implements the control-plane side of a database driver:
//! * discovery of cluster members from the `system.local` / `system.peers`
//!   tables and maintenance of a host registry,
//! * a token ring with `SimpleStrategy` / `NetworkTopologyStrategy`
//!   replica placement, plus a copy-on-write tablet index for
//!   tablet-partitioned tables,
//! * client-route based address translation with asynchronous DNS
//!   resolution,
//! * debounced topology refresh driven by server events delivered over a
//!   generic event bus,
//! * host selection policies (round-robin, datacenter-aware, token/tablet
//!   aware) and a request executor with retry and speculative execution.
//!
//! The data plane (wire protocol, connection pooling, session API) is out
//! of scope; it is consumed through the narrow traits in [`network`].

pub mod cluster;
pub mod debounce;
pub mod errors;
pub mod eventbus;
pub mod events;
pub mod execution;
pub mod network;
pub mod policies;
pub mod routes;
pub mod routing;

#[cfg(test)]
pub(crate) mod test_utils;
