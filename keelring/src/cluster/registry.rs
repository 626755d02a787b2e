//! The host registry: the authoritative set of known cluster members.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::cluster::node::Host;

/// The set of hosts currently considered cluster members, keyed by host
/// id. Shared by the refresh loop, the selection policies and the event
/// handlers.
#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: RwLock<HashMap<Uuid, Arc<Host>>>,
}

impl HostRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a host unless one with the same id is already present.
    ///
    /// Returns the winning entry and whether it already existed. An
    /// existing entry is back-filled with the candidate's fields, so a
    /// stub host created from an event gets completed by discovery.
    pub fn add_host_if_missing(&self, host: Arc<Host>) -> (Arc<Host>, bool) {
        let Some(host_id) = host.host_id() else {
            // Hosts without an id never enter the registry.
            return (host, false);
        };
        let mut hosts = self.hosts.write().unwrap();
        match hosts.entry(host_id) {
            std::collections::hash_map::Entry::Occupied(entry) => {
                let existing = entry.get().clone();
                drop(hosts);
                existing.update(&host);
                (existing, true)
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(host.clone());
                (host, false)
            }
        }
    }

    /// Removes a host, but only if the stored entry has the same
    /// identity (id and connect address). Returns whether an entry was
    /// removed.
    pub fn remove_host(&self, host: &Host) -> bool {
        let Some(host_id) = host.host_id() else {
            return false;
        };
        let mut hosts = self.hosts.write().unwrap();
        if let Some(existing) = hosts.get(&host_id) {
            if existing.same_identity(host) {
                hosts.remove(&host_id);
                return true;
            }
        }
        false
    }

    /// Looks a host up by id.
    pub fn get_host(&self, host_id: Uuid) -> Option<Arc<Host>> {
        self.hosts.read().unwrap().get(&host_id).cloned()
    }

    /// Finds a host by its node-to-node address. Status events identify
    /// hosts this way.
    pub fn find_by_node_address(&self, address: IpAddr) -> Option<Arc<Host>> {
        self.hosts
            .read()
            .unwrap()
            .values()
            .find(|host| host.node_to_node_address() == address)
            .cloned()
    }

    /// A snapshot of all known hosts.
    pub fn get_hosts_list(&self) -> Vec<Arc<Host>> {
        self.hosts.read().unwrap().values().cloned().collect()
    }

    /// A snapshot of all known hosts, keyed by id.
    pub fn get_hosts_map(&self) -> HashMap<Uuid, Arc<Host>> {
        self.hosts.read().unwrap().clone()
    }

    /// Number of known hosts.
    pub fn len(&self) -> usize {
        self.hosts.read().unwrap().len()
    }

    /// Whether no host is known yet.
    pub fn is_empty(&self) -> bool {
        self.hosts.read().unwrap().is_empty()
    }
}
