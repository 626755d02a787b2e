//! Discovery of cluster members from the `system.local` and
//! `system.peers` tables.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::cluster::node::{Host, ReleaseVersion};
use crate::errors::MetadataError;
use crate::network::ControlConnection;
use crate::policies::address_translator::AddressTranslator;

const LOCAL_STATEMENT: &str = "SELECT * FROM system.local WHERE key='local'";
const PEERS_STATEMENT: &str = "SELECT * FROM system.peers";
const PEERS_V2_STATEMENT: &str = "SELECT * FROM system.peers_v2";

/// Configuration of the topology discovery.
#[derive(Debug, Clone)]
pub struct RingDescriberConfig {
    /// Default native transport port, used when the system tables don't
    /// carry one.
    pub port: u16,
    /// Whether token-less hosts should still be part of the topology.
    pub allow_zero_token_nodes: bool,
}

impl Default for RingDescriberConfig {
    fn default() -> Self {
        RingDescriberConfig {
            port: 9042,
            allow_zero_token_nodes: false,
        }
    }
}

/// A successfully discovered topology: all hosts and the partitioner the
/// cluster hashes with.
#[derive(Debug, Clone, Default)]
pub struct RingSnapshot {
    /// All valid cluster members, the local host first.
    pub hosts: Vec<Arc<Host>>,
    /// Partitioner class name, taken from the first discovered host.
    pub partitioner: String,
}

/// Discovery failed; the last successfully discovered topology is served
/// alongside the cause, so callers can choose between aborting and
/// running on stale data.
#[derive(Error, Debug)]
#[error("ring discovery failed, last known topology retained: {source}")]
pub struct StaleRing {
    /// The last snapshot that discovery produced.
    pub snapshot: RingSnapshot,
    /// Why the fresh discovery failed.
    #[source]
    pub source: MetadataError,
}

/// Queries the control connection for the current set of cluster members.
pub struct RingDescriber {
    control: Arc<dyn ControlConnection>,
    translator: Arc<dyn AddressTranslator>,
    config: RingDescriberConfig,
    // Serializes discoveries and keeps the fail-safe-stale snapshot.
    cached: Mutex<RingSnapshot>,
}

impl RingDescriber {
    /// Creates a describer on top of the given control connection.
    pub fn new(
        control: Arc<dyn ControlConnection>,
        translator: Arc<dyn AddressTranslator>,
        config: RingDescriberConfig,
    ) -> Self {
        RingDescriber {
            control,
            translator,
            config,
            cached: Mutex::new(RingSnapshot::default()),
        }
    }

    /// Discovers the current topology.
    ///
    /// On success the snapshot is cached; on failure the previous
    /// snapshot is returned inside [`StaleRing`].
    pub async fn get_hosts(&self) -> Result<RingSnapshot, StaleRing> {
        let mut cached = self.cached.lock().await;
        match self.discover().await {
            Ok(snapshot) => {
                *cached = snapshot.clone();
                Ok(snapshot)
            }
            Err(source) => Err(StaleRing {
                snapshot: cached.clone(),
                source,
            }),
        }
    }

    async fn discover(&self) -> Result<RingSnapshot, MetadataError> {
        let local = self.get_local_host_info().await?;
        let peers = self.get_cluster_peer_info(&local.version()).await?;

        let mut hosts = Vec::with_capacity(peers.len() + 1);
        if self.config.allow_zero_token_nodes || !is_zero_token(&local) {
            hosts.push(local);
        } else {
            debug!(host = %local, "local host owns no tokens, excluded from the ring");
        }
        hosts.extend(peers);

        let partitioner = hosts
            .first()
            .map(|host| host.partitioner())
            .unwrap_or_default();

        Ok(RingSnapshot { hosts, partitioner })
    }

    /// Builds the local host from `system.local`.
    async fn get_local_host_info(&self) -> Result<Arc<Host>, MetadataError> {
        let conn_host = self
            .control
            .get_conn()
            .ok_or(MetadataError::NoControlConnection)?;
        let rows = conn_host.conn.query(LOCAL_STATEMENT, &[]).await?;
        let row = rows.first().ok_or(MetadataError::EmptyLocal)?;
        let host = Host::from_row(
            row,
            "system.local",
            self.config.port,
            self.translator.as_ref(),
        )?;
        Ok(Arc::new(host))
    }

    /// Builds all peers of the control host, dropping invalid ones.
    async fn get_cluster_peer_info(
        &self,
        local_version: &ReleaseVersion,
    ) -> Result<Vec<Arc<Host>>, MetadataError> {
        let conn_host = self
            .control
            .get_conn()
            .ok_or(MetadataError::NoControlConnection)?;

        let rows = if local_version.at_least(4, 0, 0) {
            // Newer clusters serve peers_v2; fall back for those that
            // report a 4.x version without having the table.
            match conn_host.conn.query(PEERS_V2_STATEMENT, &[]).await {
                Ok(rows) => rows,
                Err(_) => conn_host.conn.query(PEERS_STATEMENT, &[]).await?,
            }
        } else {
            conn_host.conn.query(PEERS_STATEMENT, &[]).await?
        };

        let mut peers = Vec::with_capacity(rows.len());
        for row in &rows {
            let host = Host::from_row(
                row,
                "system.peers",
                self.config.port,
                self.translator.as_ref(),
            )?;
            if !is_valid_peer(&host) {
                warn!(
                    host = %host,
                    "found invalid peer, likely a gossip or snitch issue; ignoring it"
                );
                continue;
            }
            if !self.config.allow_zero_token_nodes && is_zero_token(&host) {
                debug!(host = %host, "peer owns no tokens, excluded from the ring");
                continue;
            }
            peers.push(Arc::new(host));
        }

        Ok(peers)
    }
}

/// A peer row is usable when it carries an rpc address, a host id, a
/// datacenter and a rack.
fn is_valid_peer(host: &Host) -> bool {
    host.rpc_address().is_some()
        && host.host_id().is_some()
        && !host.datacenter().is_empty()
        && !host.rack().is_empty()
}

fn is_zero_token(host: &Host) -> bool {
    host.tokens().is_empty()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex as StdMutex;

    use assert_matches::assert_matches;
    use async_trait::async_trait;

    use super::*;
    use crate::errors::RequestAttemptError;
    use crate::network::{ConnHost, Connection, Row, RowValue};
    use crate::policies::address_translator::IdentityTranslator;
    use crate::test_utils::{peer_row, setup_tracing, test_host};

    /// A scripted connection serving canned system table rows.
    struct FakeConn {
        local: StdMutex<Vec<Row>>,
        peers: StdMutex<Vec<Row>>,
        fail: StdMutex<bool>,
    }

    #[async_trait]
    impl Connection for FakeConn {
        async fn query(
            &self,
            statement: &str,
            _values: &[RowValue],
        ) -> Result<Vec<Row>, RequestAttemptError> {
            if *self.fail.lock().unwrap() {
                return Err(RequestAttemptError::BrokenConnection("scripted".into()));
            }
            if statement.contains("system.local") {
                Ok(self.local.lock().unwrap().clone())
            } else if statement.contains("system.peers_v2") {
                Err(RequestAttemptError::Server("unknown table".into()))
            } else {
                Ok(self.peers.lock().unwrap().clone())
            }
        }
    }

    /// A control connection wrapping one scripted transport.
    struct FakeControl {
        conn: Arc<FakeConn>,
    }

    impl FakeControl {
        fn new(local: Vec<Row>, peers: Vec<Row>) -> Arc<Self> {
            Arc::new(FakeControl {
                conn: Arc::new(FakeConn {
                    local: StdMutex::new(local),
                    peers: StdMutex::new(peers),
                    fail: StdMutex::new(false),
                }),
            })
        }

        fn set_failing(&self, fail: bool) {
            *self.conn.fail.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl ControlConnection for FakeControl {
        fn get_conn(&self) -> Option<ConnHost> {
            Some(ConnHost {
                conn: self.conn.clone(),
                host: test_host(uuid::Uuid::new_v4(), "dc1", "r1", &[]),
            })
        }

        async fn query(
            &self,
            statement: &str,
            values: &[RowValue],
        ) -> Result<Vec<Row>, RequestAttemptError> {
            self.conn.query(statement, values).await
        }

        async fn reconnect(&self) -> Result<(), RequestAttemptError> {
            Ok(())
        }

        async fn await_schema_agreement(&self) -> Result<(), RequestAttemptError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn describer(control: Arc<FakeControl>) -> RingDescriber {
        RingDescriber::new(
            control,
            Arc::new(IdentityTranslator),
            RingDescriberConfig::default(),
        )
    }

    fn local_row(host_id: uuid::Uuid) -> Row {
        let mut row = peer_row(host_id, "10.0.0.1".parse().unwrap(), "dc1", "r1", &["-100"]);
        row.insert(
            "partitioner".to_owned(),
            RowValue::Text("org.apache.cassandra.dht.Murmur3Partitioner".to_owned()),
        );
        row.insert(
            "cluster_name".to_owned(),
            RowValue::Text("test-cluster".to_owned()),
        );
        row
    }

    #[tokio::test]
    async fn test_get_hosts_discovers_local_and_peers() {
        setup_tracing();
        let local_id = uuid::Uuid::new_v4();
        let peer_id = uuid::Uuid::new_v4();
        let control = FakeControl::new(
            vec![local_row(local_id)],
            vec![peer_row(
                peer_id,
                "10.0.0.2".parse().unwrap(),
                "dc1",
                "r2",
                &["100"],
            )],
        );

        let snapshot = describer(control).get_hosts().await.unwrap();
        assert_eq!(snapshot.hosts.len(), 2);
        assert_eq!(snapshot.hosts[0].host_id(), Some(local_id));
        assert_eq!(snapshot.hosts[1].host_id(), Some(peer_id));
        assert_eq!(
            snapshot.partitioner,
            "org.apache.cassandra.dht.Murmur3Partitioner"
        );
    }

    #[tokio::test]
    async fn test_invalid_and_zero_token_peers_are_skipped() {
        setup_tracing();
        let local_id = uuid::Uuid::new_v4();
        let good_id = uuid::Uuid::new_v4();

        // One peer without a rack, one without tokens, one good.
        let mut rackless = peer_row(
            uuid::Uuid::new_v4(),
            "10.0.0.3".parse().unwrap(),
            "dc1",
            "",
            &["1"],
        );
        rackless.remove("rack");
        let tokenless = peer_row(
            uuid::Uuid::new_v4(),
            "10.0.0.4".parse().unwrap(),
            "dc1",
            "r1",
            &[],
        );
        let good = peer_row(good_id, "10.0.0.5".parse().unwrap(), "dc1", "r1", &["7"]);

        let control = FakeControl::new(vec![local_row(local_id)], vec![rackless, tokenless, good]);
        let snapshot = describer(control).get_hosts().await.unwrap();

        let ids: Vec<_> = snapshot.hosts.iter().map(|h| h.host_id()).collect();
        assert_eq!(ids, vec![Some(local_id), Some(good_id)]);
    }

    #[tokio::test]
    async fn test_get_hosts_serves_stale_snapshot_on_failure() {
        setup_tracing();
        let local_id = uuid::Uuid::new_v4();
        let control = FakeControl::new(vec![local_row(local_id)], vec![]);
        let describer = describer(control.clone());

        let fresh = describer.get_hosts().await.unwrap();
        assert_eq!(fresh.hosts.len(), 1);

        control.set_failing(true);
        let stale = describer.get_hosts().await.unwrap_err();
        assert_matches!(stale.source, MetadataError::Request(_));
        assert_eq!(stale.snapshot.hosts.len(), 1);
        assert_eq!(stale.snapshot.hosts[0].host_id(), Some(local_id));
    }

    #[tokio::test]
    async fn test_empty_local_is_an_error() {
        let control = FakeControl::new(vec![], vec![]);
        let err = describer(control).get_hosts().await.unwrap_err();
        assert_matches!(err.source, MetadataError::EmptyLocal);
    }
}
