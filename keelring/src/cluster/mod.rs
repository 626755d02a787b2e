//! Cluster state tracking: hosts, their liveness, and the refresh
//! machinery keeping the local view in sync with the server.

pub mod node;
pub mod registry;
pub mod ring_describer;

use std::sync::{Arc, Weak};
use std::time::Duration;

use tracing::{debug, warn};

use crate::cluster::node::{Host, NodeState};
use crate::cluster::registry::HostRegistry;
use crate::cluster::ring_describer::{RingDescriber, RingDescriberConfig};
use crate::debounce::{DebouncerStopped, RefreshDebouncer};
use crate::errors::MetadataError;
use crate::eventbus::Subscriber;
use crate::events::{ClusterEvent, StatusChangeType};
use crate::network::{ControlConnection, PoolProvider};
use crate::policies::address_translator::AddressTranslator;
use crate::policies::host_filter::HostFilter;
use crate::policies::load_balancing::HostSelectionPolicy;
use crate::routes::ClientRoutesHandler;
use crate::routing::tablets::CowTabletList;

/// Tunables of the cluster tracker.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Topology discovery settings.
    pub ring: RingDescriberConfig,
    /// How long a burst of refresh triggers is coalesced before a single
    /// ring refresh runs.
    pub refresh_interval: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        ClusterConfig {
            ring: RingDescriberConfig::default(),
            refresh_interval: Duration::from_secs(1),
        }
    }
}

/// The driver's live view of the cluster.
///
/// Owns the host registry, the tablet index and the discovery machinery,
/// and keeps the host selection policy and the connection pools informed
/// of every membership change. Mutations funnel through `refresh_ring`,
/// which diffs a fresh discovery snapshot against the registry.
pub struct Cluster {
    registry: Arc<HostRegistry>,
    describer: RingDescriber,
    control: Arc<dyn ControlConnection>,
    pools: Arc<dyn PoolProvider>,
    policy: Arc<dyn HostSelectionPolicy>,
    tablets: Arc<CowTabletList>,
    host_filter: Option<Arc<dyn HostFilter>>,
    routes: Option<Arc<ClientRoutesHandler>>,
    refresher: RefreshDebouncer<MetadataError>,
}

impl Cluster {
    /// Builds the tracker and spawns its refresh debouncer.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        control: Arc<dyn ControlConnection>,
        translator: Arc<dyn AddressTranslator>,
        pools: Arc<dyn PoolProvider>,
        policy: Arc<dyn HostSelectionPolicy>,
        tablets: Arc<CowTabletList>,
        host_filter: Option<Arc<dyn HostFilter>>,
        routes: Option<Arc<ClientRoutesHandler>>,
        config: ClusterConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Cluster>| {
            let weak = weak.clone();
            let refresher = RefreshDebouncer::new(
                config.refresh_interval,
                Box::new(move || {
                    let weak = weak.clone();
                    Box::pin(async move {
                        match weak.upgrade() {
                            Some(cluster) => cluster.refresh_ring().await,
                            None => Ok(()),
                        }
                    })
                }),
            );
            Cluster {
                registry: Arc::new(HostRegistry::new()),
                describer: RingDescriber::new(control.clone(), translator, config.ring),
                control,
                pools,
                policy,
                tablets,
                host_filter,
                routes,
                refresher,
            }
        })
    }

    /// The host registry.
    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    /// The tablet index.
    pub fn tablets(&self) -> &Arc<CowTabletList> {
        &self.tablets
    }

    /// All hosts currently tracked.
    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.registry.get_hosts_list()
    }

    /// Discovers the topology and applies the difference to the
    /// registry, the policy and the pools.
    ///
    /// A failed discovery leaves the previous view untouched; the error
    /// is surfaced but the last known topology stays authoritative.
    pub async fn refresh_ring(&self) -> Result<(), MetadataError> {
        let snapshot = match self.describer.get_hosts().await {
            Ok(snapshot) => snapshot,
            Err(stale) => {
                warn!(error = %stale.source, "ring discovery failed, keeping the previous topology");
                return Err(stale.source);
            }
        };

        let mut previous = self.registry.get_hosts_map();
        for host in snapshot.hosts {
            if let Some(filter) = &self.host_filter {
                if !filter.accept(&host) {
                    continue;
                }
            }
            let Some(host_id) = host.host_id() else {
                continue;
            };
            match previous.remove(&host_id) {
                None => {
                    debug!(%host, "discovered a new host");
                    self.add_host(host);
                }
                Some(existing) => {
                    if existing.connect_address_and_port() != host.connect_address_and_port() {
                        debug!(old = %existing, new = %host, "host changed its address");
                        self.swap_rotated_host(&existing, host)?;
                    } else {
                        existing.update(&host);
                    }
                }
            }
        }

        for host in previous.values() {
            debug!(%host, "host left the cluster");
            self.drop_host(host);
        }

        self.policy.set_partitioner(&snapshot.partitioner);
        Ok(())
    }

    /// Requests a coalesced ring refresh.
    pub fn debounce_ring_refresh(&self) {
        self.refresher.debounce();
    }

    /// Refreshes the ring immediately, skipping the debounce window.
    pub async fn refresh_ring_now(&self) -> Result<(), MetadataError> {
        match self.refresher.refresh_now().await {
            Ok(result) => result,
            Err(DebouncerStopped) => Err(MetadataError::RefresherStopped),
        }
    }

    /// Stops the refresh machinery.
    pub fn stop(&self) {
        self.refresher.stop();
    }

    fn add_host(&self, host: Arc<Host>) {
        let (host, existed) = self.registry.add_host_if_missing(host);
        if !existed {
            self.policy.add_host(&host);
            self.pools.fill(&host);
        }
    }

    /// Replaces a host that kept its id but moved to a new address.
    fn swap_rotated_host(
        &self,
        old: &Arc<Host>,
        new: Arc<Host>,
    ) -> Result<(), MetadataError> {
        let host_id = old.host_id().unwrap_or_default();
        if !self.registry.remove_host(old) {
            return Err(MetadataError::CannotFindHost(host_id));
        }
        self.tablets.remove_tablets_with_host(host_id);
        self.pools.remove(old);
        self.policy.remove_host(old);

        let (host, existed) = self.registry.add_host_if_missing(new);
        if existed {
            return Err(MetadataError::HostAlreadyExists(host_id));
        }
        self.policy.add_host(&host);
        self.pools.fill(&host);
        Ok(())
    }

    fn drop_host(&self, host: &Arc<Host>) {
        if let Some(host_id) = host.host_id() {
            self.tablets.remove_tablets_with_host(host_id);
        }
        self.pools.remove(host);
        self.policy.remove_host(host);
        self.registry.remove_host(host);
    }

    /// Reacts to one server-pushed event.
    pub fn handle_event(self: &Arc<Self>, event: ClusterEvent) {
        debug!(%event, "cluster event");
        match event {
            ClusterEvent::TopologyChange(_) | ClusterEvent::ControlConnectionRecreated => {
                self.refresher.debounce();
            }
            ClusterEvent::StatusChange(change) => {
                let Some(host) = self.registry.find_by_node_address(change.address) else {
                    // An event for a host we don't track yet; discovery
                    // will catch up with it.
                    self.refresher.debounce();
                    return;
                };
                let state = match change.change {
                    StatusChangeType::Up => NodeState::Up,
                    StatusChangeType::Down => NodeState::Down,
                };
                host.set_state(state);
            }
            ClusterEvent::ClientRoutesChanged => {
                if let Some(routes) = &self.routes {
                    let routes = routes.clone();
                    let control = self.control.clone();
                    tokio::spawn(async move {
                        if let Err(error) = routes.refresh(control.as_ref()).await {
                            warn!(%error, "client routes refresh failed");
                        }
                    });
                }
            }
            // Schema metadata lives outside this subsystem.
            ClusterEvent::SchemaChange(_) => {}
        }
    }

    /// Spawns a task feeding bus events into [`Cluster::handle_event`].
    pub fn spawn_event_intake(
        self: &Arc<Self>,
        mut subscriber: Subscriber<ClusterEvent>,
    ) -> tokio::task::JoinHandle<()> {
        let cluster = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(event) = subscriber.recv().await {
                let Some(cluster) = cluster.upgrade() else {
                    break;
                };
                cluster.handle_event(event);
            }
        })
    }
}
