//! Host selection: turning a request into an ordered plan of candidate
//! hosts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::cluster::node::Host;
use crate::cluster::registry::HostRegistry;
use crate::errors::{PolicyError, RequestAttemptError};
use crate::routing::ring::{ReplicationStrategy, TokenReplicas, TokenRing};
use crate::routing::tablets::CowTabletList;
use crate::routing::{PartitionerName, Token};

/// What the policy may know about a request when planning its hosts.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoutingInfo<'a> {
    /// The serialized partition key, when the statement has one.
    pub routing_key: Option<&'a [u8]>,
    /// Keyspace the statement operates on.
    pub keyspace: Option<&'a str>,
    /// Table the statement operates on.
    pub table: Option<&'a str>,
    /// Whether the statement may safely run more than once.
    pub is_idempotent: bool,
    /// Whether the statement is a lightweight transaction.
    pub is_lwt: bool,
}

/// One candidate produced by a plan: the host to try and the token the
/// request hashes to, for shard-aware connection picking.
#[derive(Clone)]
pub struct SelectedHost {
    /// The host to attempt.
    pub host: Arc<Host>,
    /// The request's token, when the policy could compute one.
    pub token: Option<Token>,
}

/// An ordered, lazily consumed sequence of candidate hosts.
pub type HostPlan = Box<dyn Iterator<Item = SelectedHost> + Send>;

/// Produces host plans and tracks cluster topology on behalf of the
/// planner.
///
/// The cluster keeps every policy informed through `add_host`,
/// `remove_host`, `set_partitioner` and `set_keyspace_strategy`; `pick`
/// must never block on I/O.
pub trait HostSelectionPolicy: Send + Sync {
    /// Plans the hosts to attempt for the given request.
    fn pick(&self, request: &RoutingInfo<'_>) -> HostPlan;

    /// A host joined the cluster (or came back).
    fn add_host(&self, host: &Arc<Host>);

    /// A host left the cluster.
    fn remove_host(&self, host: &Host);

    /// Reports the outcome of an attempt on a host. `None` means the
    /// attempt left the host healthy; an error feeds the policy's host
    /// health accounting. Logical failures (cancellation, deadlines,
    /// not-found) are reported as healthy.
    fn mark_host(&self, host: &Arc<Host>, error: Option<&RequestAttemptError>) {
        let _ = (host, error);
    }

    /// The cluster's partitioner class name became known or changed.
    fn set_partitioner(&self, partitioner: &str) {
        let _ = partitioner;
    }

    /// A keyspace's replication strategy became known or changed.
    fn set_keyspace_strategy(&self, keyspace: &str, strategy: ReplicationStrategy) {
        let _ = (keyspace, strategy);
    }

    /// Checks the policy's configuration against the known topology.
    /// Called once the initial topology is in.
    fn validate(&self) -> Result<(), PolicyError> {
        Ok(())
    }
}

fn contains_host(hosts: &[Arc<Host>], host: &Host) -> bool {
    hosts
        .iter()
        .any(|known| known.host_id().is_some() && known.host_id() == host.host_id())
}

/// Rotates through all known hosts, ignoring topology entirely.
#[derive(Default)]
pub struct RoundRobinPolicy {
    hosts: RwLock<Vec<Arc<Host>>>,
    counter: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Creates the policy with no hosts yet.
    pub fn new() -> Self {
        Self::default()
    }
}

impl HostSelectionPolicy for RoundRobinPolicy {
    fn pick(&self, _request: &RoutingInfo<'_>) -> HostPlan {
        let hosts = self.hosts.read().unwrap().clone();
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        Box::new(rotated(hosts, start).map(|host| SelectedHost { host, token: None }))
    }

    fn add_host(&self, host: &Arc<Host>) {
        let mut hosts = self.hosts.write().unwrap();
        if !contains_host(&hosts, host) {
            hosts.push(host.clone());
        }
    }

    fn remove_host(&self, host: &Host) {
        self.hosts
            .write()
            .unwrap()
            .retain(|known| known.host_id() != host.host_id());
    }
}

/// Rotates through the local datacenter's hosts first, then through the
/// remote ones.
pub struct DcAwareRoundRobinPolicy {
    local_dc: String,
    hosts: RwLock<Vec<Arc<Host>>>,
    counter: AtomicUsize,
}

impl DcAwareRoundRobinPolicy {
    /// Creates the policy preferring the given datacenter.
    pub fn new(local_dc: impl Into<String>) -> Self {
        DcAwareRoundRobinPolicy {
            local_dc: local_dc.into(),
            hosts: RwLock::new(Vec::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// The preferred datacenter.
    pub fn local_dc(&self) -> &str {
        &self.local_dc
    }
}

impl HostSelectionPolicy for DcAwareRoundRobinPolicy {
    fn pick(&self, _request: &RoutingInfo<'_>) -> HostPlan {
        let hosts = self.hosts.read().unwrap();
        let (local, remote): (Vec<_>, Vec<_>) = hosts
            .iter()
            .cloned()
            .partition(|host| host.datacenter() == self.local_dc);
        drop(hosts);
        let start = self.counter.fetch_add(1, Ordering::Relaxed);
        Box::new(
            rotated(local, start)
                .chain(rotated(remote, start))
                .map(|host| SelectedHost { host, token: None }),
        )
    }

    fn add_host(&self, host: &Arc<Host>) {
        let mut hosts = self.hosts.write().unwrap();
        if !contains_host(&hosts, host) {
            hosts.push(host.clone());
        }
    }

    fn remove_host(&self, host: &Host) {
        self.hosts
            .write()
            .unwrap()
            .retain(|known| known.host_id() != host.host_id());
    }

    fn validate(&self) -> Result<(), PolicyError> {
        let hosts = self.hosts.read().unwrap();
        if hosts.iter().any(|host| host.datacenter() == self.local_dc) {
            Ok(())
        } else {
            Err(PolicyError::UnknownDatacenter(self.local_dc.clone()))
        }
    }
}

/// Puts the replicas owning the request's token first, falling back to
/// an inner policy for the rest of the plan (and entirely, when the
/// token can't be computed).
///
/// Tablet-replicated tables are routed through the tablet index; all
/// other tables through the per-keyspace replica map rebuilt from the
/// token ring whenever the topology or a replication strategy changes.
pub struct TokenAwarePolicy {
    fallback: Arc<dyn HostSelectionPolicy>,
    tablets: Arc<CowTabletList>,
    registry: Arc<HostRegistry>,
    hosts: RwLock<Vec<Arc<Host>>>,
    partitioner: RwLock<Option<PartitionerName>>,
    strategies: RwLock<HashMap<String, ReplicationStrategy>>,
    replicas: ArcSwap<HashMap<String, TokenReplicas>>,
    counter: AtomicUsize,
}

impl TokenAwarePolicy {
    /// Wraps the given fallback policy.
    pub fn new(
        fallback: Arc<dyn HostSelectionPolicy>,
        tablets: Arc<CowTabletList>,
        registry: Arc<HostRegistry>,
    ) -> Self {
        TokenAwarePolicy {
            fallback,
            tablets,
            registry,
            hosts: RwLock::new(Vec::new()),
            partitioner: RwLock::new(Some(PartitionerName::default())),
            strategies: RwLock::new(HashMap::new()),
            replicas: ArcSwap::from_pointee(HashMap::new()),
            counter: AtomicUsize::new(0),
        }
    }

    /// Recomputes every keyspace's replica map from the current host
    /// set.
    fn rebuild_replicas(&self) {
        let hosts = self.hosts.read().unwrap().clone();
        let ring = TokenRing::new(&hosts);
        let strategies = self.strategies.read().unwrap();
        let replicas: HashMap<String, TokenReplicas> = strategies
            .iter()
            .map(|(keyspace, strategy)| (keyspace.clone(), strategy.replica_map(&ring)))
            .collect();
        drop(strategies);
        self.replicas.store(Arc::new(replicas));
    }

    /// The replica set for a request, tablet index first, replica map
    /// second.
    fn replicas_for(
        &self,
        keyspace: &str,
        table: Option<&str>,
        token: Token,
    ) -> Vec<Arc<Host>> {
        if let Some(table) = table {
            let tablet_replicas = self.tablets.replicas_for_token(keyspace, table, token);
            if !tablet_replicas.is_empty() {
                return tablet_replicas
                    .iter()
                    .filter_map(|replica| self.registry.get_host(replica.host))
                    .collect();
            }
        }
        self.replicas
            .load()
            .get(keyspace)
            .and_then(|map| map.replicas_for(token))
            .map(<[Arc<Host>]>::to_vec)
            .unwrap_or_default()
    }
}

impl HostSelectionPolicy for TokenAwarePolicy {
    fn pick(&self, request: &RoutingInfo<'_>) -> HostPlan {
        let token = match (*self.partitioner.read().unwrap(), request.routing_key) {
            (Some(partitioner), Some(routing_key)) => partitioner.hash_one(routing_key),
            // No routing key, or an unrecognized partitioner: only the
            // fallback can plan anything.
            _ => return self.fallback.pick(request),
        };
        let Some(keyspace) = request.keyspace else {
            return self.fallback.pick(request);
        };

        let mut replicas = self.replicas_for(keyspace, request.table, token);
        if !request.is_lwt && !replicas.is_empty() {
            // LWTs always try the first replica first so Paxos state
            // stays warm on one host; everything else spreads the load.
            let start = self.counter.fetch_add(1, Ordering::Relaxed) % replicas.len();
            replicas.rotate_left(start);
        }

        let fallback = self.fallback.pick(request);
        let replica_ids: Vec<_> = replicas.iter().filter_map(|host| host.host_id()).collect();
        let plan = replicas
            .into_iter()
            .map(move |host| SelectedHost {
                host,
                token: Some(token),
            })
            .chain(fallback.filter_map(move |selected| {
                match selected.host.host_id() {
                    Some(id) if replica_ids.contains(&id) => None,
                    _ => Some(SelectedHost {
                        token: Some(token),
                        ..selected
                    }),
                }
            }));
        Box::new(plan)
    }

    fn add_host(&self, host: &Arc<Host>) {
        {
            let mut hosts = self.hosts.write().unwrap();
            if !contains_host(&hosts, host) {
                hosts.push(host.clone());
            }
        }
        self.fallback.add_host(host);
        self.rebuild_replicas();
    }

    fn remove_host(&self, host: &Host) {
        self.hosts
            .write()
            .unwrap()
            .retain(|known| known.host_id() != host.host_id());
        self.fallback.remove_host(host);
        self.rebuild_replicas();
    }

    fn mark_host(&self, host: &Arc<Host>, error: Option<&RequestAttemptError>) {
        self.fallback.mark_host(host, error);
    }

    fn set_partitioner(&self, partitioner: &str) {
        let recognized = PartitionerName::from_class_name(partitioner);
        if recognized.is_none() {
            debug!(partitioner, "unrecognized partitioner, token awareness disabled");
        }
        *self.partitioner.write().unwrap() = recognized;
        self.fallback.set_partitioner(partitioner);
    }

    fn set_keyspace_strategy(&self, keyspace: &str, strategy: ReplicationStrategy) {
        self.strategies
            .write()
            .unwrap()
            .insert(keyspace.to_owned(), strategy.clone());
        self.fallback.set_keyspace_strategy(keyspace, strategy);
        self.rebuild_replicas();
    }

    fn validate(&self) -> Result<(), PolicyError> {
        self.fallback.validate()
    }
}

fn rotated(hosts: Vec<Arc<Host>>, start: usize) -> impl Iterator<Item = Arc<Host>> {
    let len = hosts.len();
    let start = if len == 0 { 0 } else { start % len };
    hosts.into_iter().cycle().skip(start).take(len)
}
