//! Filtering of discovered hosts before they enter the driver's view of
//! the cluster.

use std::collections::HashSet;
use std::net::IpAddr;

use crate::cluster::node::Host;

/// Decides which discovered hosts the driver is allowed to track and
/// connect to. Hosts rejected by the filter never reach the registry,
/// the pools or the selection policy.
pub trait HostFilter: Send + Sync {
    /// Whether the host should be tracked.
    fn accept(&self, host: &Host) -> bool;
}

/// Accepts every host.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAllHostFilter;

impl HostFilter for AcceptAllHostFilter {
    fn accept(&self, _host: &Host) -> bool {
        true
    }
}

/// Accepts only hosts from one datacenter.
#[derive(Debug, Clone)]
pub struct DcHostFilter {
    local_dc: String,
}

impl DcHostFilter {
    /// Creates a filter keeping only hosts of `local_dc`.
    pub fn new(local_dc: impl Into<String>) -> Self {
        DcHostFilter {
            local_dc: local_dc.into(),
        }
    }
}

impl HostFilter for DcHostFilter {
    fn accept(&self, host: &Host) -> bool {
        host.datacenter() == self.local_dc
    }
}

/// Accepts only hosts whose connect address is on an allow list.
#[derive(Debug, Clone)]
pub struct AllowListHostFilter {
    allowed: HashSet<IpAddr>,
}

impl AllowListHostFilter {
    /// Creates a filter from the allowed addresses.
    pub fn new(allowed: impl IntoIterator<Item = IpAddr>) -> Self {
        AllowListHostFilter {
            allowed: allowed.into_iter().collect(),
        }
    }
}

impl HostFilter for AllowListHostFilter {
    fn accept(&self, host: &Host) -> bool {
        host.connect_address()
            .is_some_and(|address| self.allowed.contains(&address))
    }
}
