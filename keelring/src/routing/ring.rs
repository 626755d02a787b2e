//! The token ring and the replica placement strategies on top of it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::cluster::node::Host;
use crate::routing::Token;

/// A sorted view of the ring: every token of every host, paired with the
/// host that owns it. Rebuilt from scratch on each topology refresh;
/// never mutated in place.
#[derive(Debug, Default, Clone)]
pub struct TokenRing {
    entries: Vec<(Token, Arc<Host>)>,
}

impl TokenRing {
    /// Builds the ring from the given hosts' token sets.
    ///
    /// Hosts without tokens contribute nothing. Token strings that don't
    /// parse are skipped with a warning rather than failing the whole
    /// refresh.
    pub fn new(hosts: &[Arc<Host>]) -> Self {
        let mut entries: Vec<(Token, Arc<Host>)> = Vec::new();
        for host in hosts {
            for token_str in host.tokens() {
                match token_str.parse::<Token>() {
                    Ok(token) => entries.push((token, host.clone())),
                    Err(_) => {
                        warn!(host = %host, token = %token_str, "unparsable token, skipping it")
                    }
                }
            }
        }
        entries.sort_by_key(|(token, _)| *token);
        TokenRing { entries }
    }

    /// All ring positions, sorted by token.
    pub fn entries(&self) -> &[(Token, Arc<Host>)] {
        &self.entries
    }

    /// Number of ring positions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the ring holds no tokens at all.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The host owning the given token: the owner of the smallest ring
    /// token `>= token`, wrapping past the maximum.
    pub fn owner(&self, token: Token) -> Option<&Arc<Host>> {
        if self.entries.is_empty() {
            return None;
        }
        let mut p = self.entries.partition_point(|(t, _)| *t < token);
        if p >= self.entries.len() {
            p = 0;
        }
        Some(&self.entries[p].1)
    }
}

/// How a keyspace places its replicas on the ring.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ReplicationStrategy {
    /// Rack- and datacenter-oblivious placement: the next `replication_factor`
    /// distinct hosts clockwise from each token.
    Simple {
        /// How many replicas each token gets.
        replication_factor: usize,
    },
    /// Per-datacenter replication factors with rack diversity inside
    /// each datacenter.
    NetworkTopology {
        /// Replication factor per datacenter name. Datacenters absent
        /// from the map (or mapped to zero) hold no replicas.
        datacenter_rfs: HashMap<String, usize>,
    },
}

impl ReplicationStrategy {
    /// Computes the replica map of the given ring under this strategy.
    pub fn replica_map(&self, ring: &TokenRing) -> TokenReplicas {
        match self {
            ReplicationStrategy::Simple { replication_factor } => {
                simple_replica_map(ring, *replication_factor)
            }
            ReplicationStrategy::NetworkTopology { datacenter_rfs } => {
                network_topology_replica_map(ring, datacenter_rfs)
            }
        }
    }
}

fn simple_replica_map(ring: &TokenRing, rf: usize) -> TokenReplicas {
    let entries = ring.entries();
    let mut map = Vec::with_capacity(entries.len());

    for (i, (token, _)) in entries.iter().enumerate() {
        let mut replicas: Vec<Arc<Host>> = Vec::with_capacity(rf);
        for j in 0..entries.len() {
            if replicas.len() >= rf {
                break;
            }
            let candidate = &entries[(i + j) % entries.len()].1;
            if !replicas.iter().any(|h| Arc::ptr_eq(h, candidate)) {
                replicas.push(candidate.clone());
            }
        }
        map.push((*token, replicas));
    }

    TokenReplicas { entries: map }
}

fn network_topology_replica_map(
    ring: &TokenRing,
    datacenter_rfs: &HashMap<String, usize>,
) -> TokenReplicas {
    let entries = ring.entries();

    // All racks each datacenter actually has, so we know when a walk has
    // seen every rack of a datacenter.
    let mut dc_racks: HashMap<String, HashSet<String>> = HashMap::new();
    for (_, host) in entries {
        dc_racks
            .entry(host.datacenter())
            .or_default()
            .insert(host.rack());
    }

    let total_rf: usize = datacenter_rfs.values().sum();
    let mut map = Vec::with_capacity(entries.len());

    for (i, (token, _)) in entries.iter().enumerate() {
        let mut replicas: Vec<Arc<Host>> = Vec::with_capacity(total_rf);
        let mut replicas_in_dc: HashMap<&str, usize> = HashMap::new();
        let mut seen_racks: HashMap<String, HashSet<String>> = HashMap::new();
        let mut deferred: HashMap<String, Vec<Arc<Host>>> = HashMap::new();

        for j in 0..entries.len() {
            if replicas.len() >= total_rf {
                break;
            }
            let host = &entries[(i + j) % entries.len()].1;
            let dc = host.datacenter();
            let rack = host.rack();

            let Some(&rf) = datacenter_rfs.get(&dc) else {
                continue;
            };
            if rf == 0 || replicas_in_dc.get(dc.as_str()).copied().unwrap_or(0) >= rf {
                continue;
            }
            let all_racks = &dc_racks[&dc];

            let racks = seen_racks.entry(dc.clone()).or_default();
            if racks.contains(&rack) {
                if racks.len() == all_racks.len() {
                    // Every rack has been tried once already; rack
                    // diversity can't improve, take the host.
                    replicas.push(host.clone());
                    *replicas_in_dc.entry(entry_key(datacenter_rfs, &dc)).or_insert(0) += 1;
                } else {
                    // Hold this host back in case the remaining racks
                    // can't fill the datacenter's factor.
                    deferred.entry(dc.clone()).or_default().push(host.clone());
                }
            } else {
                racks.insert(rack);
                replicas.push(host.clone());
                let mut in_dc = replicas_in_dc.get(dc.as_str()).copied().unwrap_or(0) + 1;

                if seen_racks[&dc].len() == all_racks.len() {
                    // All racks covered; flush the held-back hosts until
                    // the factor is met.
                    if let Some(held) = deferred.get(&dc) {
                        for host in held {
                            if in_dc >= rf {
                                break;
                            }
                            replicas.push(host.clone());
                            in_dc += 1;
                        }
                    }
                }
                replicas_in_dc.insert(entry_key(datacenter_rfs, &dc), in_dc);
            }
        }

        if !replicas.is_empty() {
            map.push((*token, replicas));
        }
    }

    TokenReplicas { entries: map }
}

// Borrows the datacenter key from the config map so the per-token
// bookkeeping maps don't clone the name on every increment.
fn entry_key<'a>(datacenter_rfs: &'a HashMap<String, usize>, dc: &str) -> &'a str {
    datacenter_rfs
        .get_key_value(dc)
        .map(|(key, _)| key.as_str())
        .unwrap_or("")
}

/// The replica map: for every ring token, the ordered replica set owning
/// the range ending at that token.
#[derive(Debug, Default, Clone)]
pub struct TokenReplicas {
    entries: Vec<(Token, Vec<Arc<Host>>)>,
}

impl TokenReplicas {
    /// The replica set responsible for the given token: the entry with
    /// the smallest token `>= token`, wrapping to the first entry past
    /// the maximum. `None` only on an empty map.
    pub fn replicas_for(&self, token: Token) -> Option<&[Arc<Host>]> {
        if self.entries.is_empty() {
            return None;
        }
        let mut p = self.entries.partition_point(|(t, _)| *t < token);
        if p >= self.entries.len() {
            p = 0;
        }
        Some(&self.entries[p].1)
    }

    /// All entries, sorted by token.
    pub fn entries(&self) -> &[(Token, Vec<Arc<Host>>)] {
        &self.entries
    }

    /// Whether the map holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::test_utils::{setup_tracing, test_host};

    fn ring_of(hosts: &[Arc<Host>]) -> TokenRing {
        TokenRing::new(hosts)
    }

    fn ids(replicas: &[Arc<Host>]) -> Vec<Uuid> {
        replicas.iter().filter_map(|h| h.host_id()).collect()
    }

    #[test]
    fn test_ring_is_sorted_and_skips_bad_tokens() {
        setup_tracing();
        let a = test_host(Uuid::new_v4(), "dc1", "r1", &["300", "-100", "bogus"]);
        let b = test_host(Uuid::new_v4(), "dc1", "r1", &["100"]);
        let tokenless = test_host(Uuid::new_v4(), "dc1", "r1", &[]);

        let ring = ring_of(&[a, b, tokenless]);
        let tokens: Vec<i64> = ring.entries().iter().map(|(t, _)| t.value).collect();
        assert_eq!(tokens, vec![-100, 100, 300]);
    }

    #[test]
    fn test_owner_wraps_past_the_maximum() {
        let a = test_host(Uuid::new_v4(), "dc1", "r1", &["0"]);
        let b = test_host(Uuid::new_v4(), "dc1", "r1", &["100"]);
        let ring = ring_of(&[a.clone(), b.clone()]);

        assert!(Arc::ptr_eq(ring.owner(Token::new(-5)).unwrap(), &a));
        assert!(Arc::ptr_eq(ring.owner(Token::new(100)).unwrap(), &b));
        assert!(Arc::ptr_eq(ring.owner(Token::new(101)).unwrap(), &a));
        assert!(TokenRing::default().owner(Token::new(0)).is_none());
    }

    #[test]
    fn test_simple_strategy_takes_the_next_distinct_hosts() {
        // Four equally spaced tokens, RF=2: each token's replica set is
        // its owner plus the successor, wrapping at the end.
        let hosts: Vec<_> = (0..4)
            .map(|i| test_host(Uuid::new_v4(), "dc1", "r1", &[&(i * 100).to_string()]))
            .collect();
        let ring = ring_of(&hosts);

        let map = ReplicationStrategy::Simple {
            replication_factor: 2,
        }
        .replica_map(&ring);

        for i in 0..4 {
            let replicas = map.replicas_for(Token::new(i as i64 * 100)).unwrap();
            assert_eq!(
                ids(replicas),
                vec![
                    hosts[i].host_id().unwrap(),
                    hosts[(i + 1) % 4].host_id().unwrap()
                ]
            );
        }
    }

    #[test]
    fn test_simple_strategy_deduplicates_a_multi_token_host() {
        let a = test_host(Uuid::new_v4(), "dc1", "r1", &["0", "100"]);
        let b = test_host(Uuid::new_v4(), "dc1", "r1", &["200"]);
        let ring = ring_of(&[a.clone(), b.clone()]);

        let map = ReplicationStrategy::Simple {
            replication_factor: 2,
        }
        .replica_map(&ring);

        // Walking from token 0 passes two positions of host a; the
        // replica set still holds two distinct hosts.
        let replicas = map.replicas_for(Token::new(0)).unwrap();
        assert_eq!(ids(replicas), vec![a.host_id().unwrap(), b.host_id().unwrap()]);
    }

    #[test]
    fn test_simple_strategy_rf_larger_than_cluster() {
        let a = test_host(Uuid::new_v4(), "dc1", "r1", &["0"]);
        let ring = ring_of(&[a]);
        let map = ReplicationStrategy::Simple {
            replication_factor: 3,
        }
        .replica_map(&ring);
        assert_eq!(map.replicas_for(Token::new(7)).unwrap().len(), 1);
    }

    #[test]
    fn test_network_topology_prefers_rack_diversity() {
        // dc1 has racks r1 (two hosts) and r2 (one host). With rf 2 the
        // replica set must span both racks even though the second r1
        // host sits earlier on the ring.
        let r1a = test_host(Uuid::new_v4(), "dc1", "r1", &["0"]);
        let r1b = test_host(Uuid::new_v4(), "dc1", "r1", &["100"]);
        let r2 = test_host(Uuid::new_v4(), "dc1", "r2", &["200"]);
        let ring = ring_of(&[r1a.clone(), r1b.clone(), r2.clone()]);

        let map = ReplicationStrategy::NetworkTopology {
            datacenter_rfs: HashMap::from([("dc1".to_owned(), 2)]),
        }
        .replica_map(&ring);

        let replicas = map.replicas_for(Token::new(0)).unwrap();
        assert_eq!(
            ids(replicas),
            vec![r1a.host_id().unwrap(), r2.host_id().unwrap()]
        );
    }

    #[test]
    fn test_network_topology_flushes_deferred_hosts() {
        // Both racks seen after two picks, rf 3: the deferred second r1
        // host fills the remaining slot.
        let r1a = test_host(Uuid::new_v4(), "dc1", "r1", &["0"]);
        let r1b = test_host(Uuid::new_v4(), "dc1", "r1", &["100"]);
        let r2 = test_host(Uuid::new_v4(), "dc1", "r2", &["200"]);
        let ring = ring_of(&[r1a.clone(), r1b.clone(), r2.clone()]);

        let map = ReplicationStrategy::NetworkTopology {
            datacenter_rfs: HashMap::from([("dc1".to_owned(), 3)]),
        }
        .replica_map(&ring);

        let replicas = map.replicas_for(Token::new(0)).unwrap();
        assert_eq!(
            ids(replicas),
            vec![
                r1a.host_id().unwrap(),
                r2.host_id().unwrap(),
                r1b.host_id().unwrap()
            ]
        );
    }

    #[test]
    fn test_network_topology_spans_datacenters() {
        let dc1 = test_host(Uuid::new_v4(), "dc1", "r1", &["0"]);
        let dc2 = test_host(Uuid::new_v4(), "dc2", "r1", &["100"]);
        let ring = ring_of(&[dc1.clone(), dc2.clone()]);

        let map = ReplicationStrategy::NetworkTopology {
            datacenter_rfs: HashMap::from([("dc1".to_owned(), 1), ("dc2".to_owned(), 1)]),
        }
        .replica_map(&ring);

        let replicas = map.replicas_for(Token::new(50)).unwrap();
        assert_eq!(
            ids(replicas),
            vec![dc2.host_id().unwrap(), dc1.host_id().unwrap()]
        );
    }

    #[test]
    fn test_network_topology_skips_unconfigured_datacenters() {
        let dc1 = test_host(Uuid::new_v4(), "dc1", "r1", &["0"]);
        let dc2 = test_host(Uuid::new_v4(), "dc2", "r1", &["100"]);
        let ring = ring_of(&[dc1, dc2.clone()]);

        let map = ReplicationStrategy::NetworkTopology {
            datacenter_rfs: HashMap::from([("dc2".to_owned(), 1)]),
        }
        .replica_map(&ring);

        // Positions owned by the unconfigured dc1 still resolve, to
        // dc2's hosts only.
        let replicas = map.replicas_for(Token::new(0)).unwrap();
        assert_eq!(ids(replicas), vec![dc2.host_id().unwrap()]);

        // Datacenters configured but absent from the cluster are
        // ignored silently.
        let map = ReplicationStrategy::NetworkTopology {
            datacenter_rfs: HashMap::from([("dc2".to_owned(), 1), ("dc9".to_owned(), 3)]),
        }
        .replica_map(&ring);
        assert_eq!(
            ids(map.replicas_for(Token::new(0)).unwrap()),
            vec![dc2.host_id().unwrap()]
        );
    }

    #[test]
    fn test_replicas_for_on_empty_map_is_none() {
        assert!(TokenReplicas::default().replicas_for(Token::new(0)).is_none());
    }
}
