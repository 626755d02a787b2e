//! The host model: everything the driver knows about one cluster member.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, RwLock};

use uuid::Uuid;

use crate::errors::MetadataError;
use crate::network::Row;
use crate::policies::address_translator::{AddressPort, AddressTranslator};

/// Perceived liveness of a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NodeState {
    /// The host is believed to be accepting requests.
    #[default]
    Up,
    /// The host is believed to be down.
    Down,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Up => write!(f, "UP"),
            NodeState::Down => write!(f, "DOWN"),
        }
    }
}

/// A parsed `release_version` of a host.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReleaseVersion {
    /// Major version number.
    pub major: u32,
    /// Minor version number.
    pub minor: u32,
    /// Patch version number.
    pub patch: u32,
    /// Trailing qualifier, e.g. `rc1`. Ignored in comparisons.
    pub qualifier: String,
}

impl ReleaseVersion {
    /// Parses a version string. Tolerates a leading `v` and a trailing
    /// `-SNAPSHOT`; the patch component is optional.
    pub fn parse(version: &str) -> Result<Self, MetadataError> {
        let invalid = |reason| MetadataError::InvalidReleaseVersion {
            version: version.to_owned(),
            reason,
        };

        let trimmed = version
            .trim_end_matches("-SNAPSHOT")
            .trim_start_matches('v');
        let mut parts = trimmed.splitn(3, '.');
        let major = parts
            .next()
            .filter(|s| !s.is_empty())
            .and_then(|s| s.parse().ok())
            .ok_or(invalid("bad major component"))?;

        let minor_part = parts.next().ok_or(invalid("missing minor component"))?;
        let (minor_str, mut qualifier) = match parts.next() {
            // major.minor only; the qualifier may hang off the minor.
            None => match minor_part.split_once('-') {
                Some((m, q)) => (m, q.to_owned()),
                None => (minor_part, String::new()),
            },
            Some(_) => (minor_part, String::new()),
        };
        let minor = minor_str
            .parse()
            .map_err(|_| invalid("bad minor component"))?;

        let patch = match parts.next() {
            None => 0,
            Some(patch_part) => {
                let patch_str = match patch_part.split_once('-') {
                    Some((p, q)) => {
                        qualifier = q.to_owned();
                        p
                    }
                    None => patch_part,
                };
                patch_str
                    .parse()
                    .map_err(|_| invalid("bad patch component"))?
            }
        };

        Ok(ReleaseVersion {
            major,
            minor,
            patch,
            qualifier,
        })
    }

    /// Whether this version is lower than the given one.
    pub fn before(&self, major: u32, minor: u32, patch: u32) -> bool {
        (self.major, self.minor, self.patch) < (major, minor, patch)
    }

    /// Whether this version is at least the given one.
    pub fn at_least(&self, major: u32, minor: u32, patch: u32) -> bool {
        !self.before(major, minor, patch)
    }
}

impl std::fmt::Display for ReleaseVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if !self.qualifier.is_empty() {
            write!(f, "-{}", self.qualifier)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct HostRecord {
    pub(crate) hostname: String,
    pub(crate) peer: Option<IpAddr>,
    pub(crate) broadcast_address: Option<IpAddr>,
    pub(crate) listen_address: Option<IpAddr>,
    pub(crate) rpc_address: Option<IpAddr>,
    pub(crate) preferred_ip: Option<IpAddr>,
    pub(crate) connect_address: Option<IpAddr>,
    pub(crate) untranslated_connect_address: Option<IpAddr>,
    pub(crate) port: u16,
    pub(crate) data_center: String,
    pub(crate) rack: String,
    pub(crate) host_id: Option<Uuid>,
    pub(crate) workload: String,
    pub(crate) graph: bool,
    pub(crate) dse_version: String,
    pub(crate) partitioner: String,
    pub(crate) cluster_name: String,
    pub(crate) version: ReleaseVersion,
    pub(crate) state: NodeState,
    pub(crate) schema_version: Option<Uuid>,
    pub(crate) tokens: Vec<String>,
    pub(crate) shard_aware_port: u16,
    pub(crate) shard_aware_port_tls: u16,
}

fn valid_ip(addr: Option<IpAddr>) -> bool {
    addr.is_some_and(|a| !a.is_unspecified())
}

impl HostRecord {
    /// The address to connect to, in decreasing order of preference.
    fn connect_address(&self) -> Option<IpAddr> {
        [
            self.connect_address,
            self.rpc_address,
            self.preferred_ip,
            self.broadcast_address,
            self.peer,
        ]
        .into_iter()
        .find(|addr| valid_ip(*addr))
        .flatten()
    }
}

/// Everything known about a single cluster member.
///
/// All fields sit behind one lock; getters clone the values out. A `Host`
/// is shared via `Arc` between the registry, the selection policies and
/// the connection pools.
#[derive(Debug, Default)]
pub struct Host {
    record: RwLock<HostRecord>,
}

impl Host {
    pub(crate) fn from_record(record: HostRecord) -> Self {
        Host {
            record: RwLock::new(record),
        }
    }

    /// Builds a host from a `system.local` / `system.peers` row.
    ///
    /// `table` is only used in error messages. The connect address is
    /// derived from the row, remembered untranslated, and then run
    /// through the translator.
    pub fn from_row(
        row: &Row,
        table: &'static str,
        default_port: u16,
        translator: &dyn AddressTranslator,
    ) -> Result<Host, MetadataError> {
        let mut record = HostRecord {
            port: default_port,
            ..Default::default()
        };
        let bad_column = |column: &str| MetadataError::InvalidColumn {
            table,
            column: column.to_owned(),
        };

        for (column, value) in row {
            match column.as_str() {
                "data_center" => {
                    record.data_center = value
                        .as_text()
                        .ok_or_else(|| bad_column(column))?
                        .to_owned();
                }
                "rack" => {
                    record.rack = value
                        .as_text()
                        .ok_or_else(|| bad_column(column))?
                        .to_owned();
                }
                "host_id" => {
                    record.host_id = Some(value.as_uuid().ok_or_else(|| bad_column(column))?);
                }
                "release_version" => {
                    let version = value.as_text().ok_or_else(|| bad_column(column))?;
                    if !version.is_empty() {
                        record.version = ReleaseVersion::parse(version)?;
                    }
                }
                "peer" => {
                    record.peer = Some(value.as_inet().ok_or_else(|| bad_column(column))?);
                }
                "cluster_name" => {
                    record.cluster_name = value
                        .as_text()
                        .ok_or_else(|| bad_column(column))?
                        .to_owned();
                }
                "partitioner" => {
                    record.partitioner = value
                        .as_text()
                        .ok_or_else(|| bad_column(column))?
                        .to_owned();
                }
                "broadcast_address" => {
                    record.broadcast_address =
                        Some(value.as_inet().ok_or_else(|| bad_column(column))?);
                }
                "preferred_ip" => {
                    record.preferred_ip = Some(value.as_inet().ok_or_else(|| bad_column(column))?);
                }
                "rpc_address" | "native_address" => {
                    record.rpc_address = Some(value.as_inet().ok_or_else(|| bad_column(column))?);
                }
                "listen_address" => {
                    record.listen_address =
                        Some(value.as_inet().ok_or_else(|| bad_column(column))?);
                }
                "native_port" => {
                    let port = value.as_int().ok_or_else(|| bad_column(column))?;
                    record.port = port.try_into().map_err(|_| bad_column(column))?;
                }
                "workload" => {
                    record.workload = value
                        .as_text()
                        .ok_or_else(|| bad_column(column))?
                        .to_owned();
                }
                "graph" => {
                    record.graph = value.as_bool().ok_or_else(|| bad_column(column))?;
                }
                "tokens" => {
                    record.tokens = value
                        .as_text_list()
                        .ok_or_else(|| bad_column(column))?
                        .to_vec();
                }
                "dse_version" => {
                    record.dse_version = value
                        .as_text()
                        .ok_or_else(|| bad_column(column))?
                        .to_owned();
                }
                "schema_version" => {
                    record.schema_version =
                        Some(value.as_uuid().ok_or_else(|| bad_column(column))?);
                }
                // Columns this subsystem has no use for.
                _ => {}
            }
        }

        if let Some(untranslated) = record.connect_address() {
            record.untranslated_connect_address = Some(untranslated);
            let translated = translator.translate(AddressPort {
                address: untranslated,
                port: record.port,
            });
            record.connect_address = Some(translated.address);
            record.port = translated.port;
        }

        Ok(Host::from_record(record))
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HostRecord> {
        self.record.read().unwrap()
    }

    /// Unique id of the host, when known.
    pub fn host_id(&self) -> Option<Uuid> {
        self.read().host_id
    }

    /// The hostname this host was contacted through, if any.
    pub fn hostname(&self) -> String {
        self.read().hostname.clone()
    }

    /// The `peer` column address.
    pub fn peer(&self) -> Option<IpAddr> {
        self.read().peer
    }

    /// The broadcast address of the host.
    pub fn broadcast_address(&self) -> Option<IpAddr> {
        self.read().broadcast_address
    }

    /// The listen address of the host.
    pub fn listen_address(&self) -> Option<IpAddr> {
        self.read().listen_address
    }

    /// The rpc (native transport) address of the host.
    pub fn rpc_address(&self) -> Option<IpAddr> {
        self.read().rpc_address
    }

    /// The preferred IP of the host.
    pub fn preferred_ip(&self) -> Option<IpAddr> {
        self.read().preferred_ip
    }

    /// The address the driver should connect to, following the
    /// `connect → rpc → preferred → broadcast → peer` precedence.
    /// `None` when no valid address is known.
    pub fn connect_address(&self) -> Option<IpAddr> {
        self.read().connect_address()
    }

    /// The connect address before translation was applied.
    pub fn untranslated_connect_address(&self) -> Option<IpAddr> {
        let record = self.read();
        record
            .untranslated_connect_address
            .or_else(|| record.connect_address())
    }

    /// The connect address and port, with the unspecified address
    /// standing in when no valid address is known.
    pub fn connect_address_and_port(&self) -> (IpAddr, u16) {
        let record = self.read();
        (
            record
                .connect_address()
                .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            record.port,
        )
    }

    /// The address this node is known by to its peers: the broadcast
    /// address for the local node, the peer address for others. Status
    /// events carry this address.
    pub fn node_to_node_address(&self) -> IpAddr {
        let record = self.read();
        [record.broadcast_address, record.peer]
            .into_iter()
            .find(|addr| valid_ip(*addr))
            .flatten()
            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    }

    /// Overrides the connect address, bypassing the usual precedence.
    pub fn set_connect_address(&self, address: IpAddr) {
        self.record.write().unwrap().connect_address = Some(address);
    }

    /// The native transport port.
    pub fn port(&self) -> u16 {
        self.read().port
    }

    /// Datacenter the host lives in.
    pub fn datacenter(&self) -> String {
        self.read().data_center.clone()
    }

    /// Rack the host lives in.
    pub fn rack(&self) -> String {
        self.read().rack.clone()
    }

    /// The partitioner reported by the host (local row only).
    pub fn partitioner(&self) -> String {
        self.read().partitioner.clone()
    }

    /// Name of the cluster (local row only).
    pub fn cluster_name(&self) -> String {
        self.read().cluster_name.clone()
    }

    /// The workload type reported by DSE clusters.
    pub fn workload(&self) -> String {
        self.read().workload.clone()
    }

    /// Whether the host runs the DSE graph workload.
    pub fn graph(&self) -> bool {
        self.read().graph
    }

    /// The DSE version, when the cluster reports one.
    pub fn dse_version(&self) -> String {
        self.read().dse_version.clone()
    }

    /// Parsed release version of the host.
    pub fn version(&self) -> ReleaseVersion {
        self.read().version.clone()
    }

    /// Schema version the host is at.
    pub fn schema_version(&self) -> Option<Uuid> {
        self.read().schema_version
    }

    /// The tokens owned by this host, as reported by the system tables.
    pub fn tokens(&self) -> Vec<String> {
        self.read().tokens.clone()
    }

    /// Current liveness state.
    pub fn state(&self) -> NodeState {
        self.read().state
    }

    pub(crate) fn set_state(&self, state: NodeState) {
        self.record.write().unwrap().state = state;
    }

    /// Whether the host is believed to be up.
    pub fn is_up(&self) -> bool {
        self.state() == NodeState::Up
    }

    /// The shard-aware port, zero when unknown.
    pub fn shard_aware_port(&self) -> u16 {
        self.read().shard_aware_port
    }

    /// The TLS shard-aware port, zero when unknown.
    pub fn shard_aware_port_tls(&self) -> u16 {
        self.read().shard_aware_port_tls
    }

    /// Records the shard-aware ports advertised by the host.
    pub fn set_shard_aware_ports(&self, plain: u16, tls: u16) {
        let mut record = self.record.write().unwrap();
        record.shard_aware_port = plain;
        record.shard_aware_port_tls = tls;
    }

    /// Fills the unset fields of `self` from `from`. Populated fields are
    /// never overwritten; state is not touched.
    pub fn update(self: &Arc<Self>, from: &Arc<Host>) {
        if Arc::ptr_eq(self, from) {
            return;
        }
        let mut record = self.record.write().unwrap();
        let from = from.read();

        if record.peer.is_none() {
            record.peer = from.peer;
        }
        if record.broadcast_address.is_none() {
            record.broadcast_address = from.broadcast_address;
        }
        if record.listen_address.is_none() {
            record.listen_address = from.listen_address;
        }
        if record.rpc_address.is_none() {
            record.rpc_address = from.rpc_address;
        }
        if record.preferred_ip.is_none() {
            record.preferred_ip = from.preferred_ip;
        }
        if record.connect_address.is_none() {
            record.connect_address = from.connect_address;
        }
        if record.port == 0 {
            record.port = from.port;
        }
        if record.data_center.is_empty() {
            record.data_center = from.data_center.clone();
        }
        if record.rack.is_empty() {
            record.rack = from.rack.clone();
        }
        if record.host_id.is_none() {
            record.host_id = from.host_id;
        }
        if record.workload.is_empty() {
            record.workload = from.workload.clone();
        }
        if record.dse_version.is_empty() {
            record.dse_version = from.dse_version.clone();
        }
        if record.partitioner.is_empty() {
            record.partitioner = from.partitioner.clone();
        }
        if record.cluster_name.is_empty() {
            record.cluster_name = from.cluster_name.clone();
        }
        if record.version == ReleaseVersion::default() {
            record.version = from.version.clone();
        }
        if record.tokens.is_empty() {
            record.tokens = from.tokens.clone();
        }
    }

    /// Identity comparison: same host id and same connect address+port.
    pub fn same_identity(&self, other: &Host) -> bool {
        if std::ptr::eq(self, other) {
            return true;
        }
        self.host_id() == other.host_id()
            && self.connect_address_and_port() == other.connect_address_and_port()
    }
}

impl std::fmt::Display for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let record = self.read();
        write!(
            f,
            "[Host host_id={:?} connect_address={:?} port={} data_center={:?} rack={:?} \
             version={} state={} num_tokens={}]",
            record.host_id,
            record.connect_address(),
            record.port,
            record.data_center,
            record.rack,
            record.version,
            record.state,
            record.tokens.len()
        )
    }
}
