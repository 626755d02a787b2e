//! Tablet metadata and the copy-on-write tablet index.
//!
//! Tablet-partitioned tables don't follow ring placement: the cluster
//! sends, piggybacked on responses to mistargeted requests, the tablet
//! that owns the requested token. Those tablets are spliced into a flat
//! list grouped by `(keyspace, table)`, each group kept sorted by the
//! tablet's last token. Readers work on immutable snapshots; writers
//! serialize and publish a rebuilt list.

use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use uuid::Uuid;

use crate::errors::TabletParsingError;
use crate::routing::Token;

/// A single tablet replica: a host and a shard on that host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TabletReplica {
    /// Id of the host holding the replica.
    pub host: Uuid,
    /// Shard of the host the replica lives on.
    pub shard: i32,
}

/// Metadata of a single tablet: a token range of one table and the
/// replicas that own it.
///
/// The token range is left-exclusive, right-inclusive:
/// `(first_token, last_token]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabletInfo {
    keyspace: String,
    table: String,
    first_token: Token,
    last_token: Token,
    replicas: Vec<TabletReplica>,
}

impl TabletInfo {
    /// Creates a tablet from already validated parts.
    pub fn new(
        keyspace: impl Into<String>,
        table: impl Into<String>,
        first_token: Token,
        last_token: Token,
        replicas: Vec<TabletReplica>,
    ) -> Self {
        TabletInfo {
            keyspace: keyspace.into(),
            table: table.into(),
            first_token,
            last_token,
            replicas,
        }
    }

    /// Builds a tablet from the raw values carried by the routing
    /// metadata payload, validating the range and the shard numbers.
    pub fn from_raw(
        keyspace: impl Into<String>,
        table: impl Into<String>,
        first_token: i64,
        last_token: i64,
        raw_replicas: Vec<(Uuid, i64)>,
    ) -> Result<Self, TabletParsingError> {
        if first_token >= last_token {
            return Err(TabletParsingError::TokenOrder {
                first: first_token,
                last: last_token,
            });
        }
        let replicas = raw_replicas
            .into_iter()
            .map(|(host, shard)| {
                let shard = shard
                    .try_into()
                    .map_err(|_| TabletParsingError::ShardNum(shard))?;
                Ok(TabletReplica { host, shard })
            })
            .collect::<Result<Vec<_>, TabletParsingError>>()?;
        Ok(TabletInfo::new(
            keyspace,
            table,
            Token::new(first_token),
            Token::new(last_token),
            replicas,
        ))
    }

    /// Keyspace of the table this tablet belongs to.
    pub fn keyspace(&self) -> &str {
        &self.keyspace
    }

    /// Table this tablet belongs to.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Exclusive lower bound of the owned token range.
    pub fn first_token(&self) -> Token {
        self.first_token
    }

    /// Inclusive upper bound of the owned token range.
    pub fn last_token(&self) -> Token {
        self.last_token
    }

    /// Replicas owning this tablet.
    pub fn replicas(&self) -> &[TabletReplica] {
        &self.replicas
    }

    /// Whether the given host holds a replica of this tablet.
    pub fn has_replica_on(&self, host: Uuid) -> bool {
        self.replicas.iter().any(|r| r.host == host)
    }
}

/// An immutable, ordered list of tablets.
///
/// Tablets of one table form a contiguous run sorted by last token.
/// All mutating operations return a new list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TabletInfoList {
    tablets: Vec<Arc<TabletInfo>>,
}

impl TabletInfoList {
    /// Creates a list from pre-grouped, pre-sorted tablets. Intended for
    /// snapshot replacement; incremental updates go through
    /// [`TabletInfoList::add_tablet`].
    pub fn from_tablets(tablets: Vec<Arc<TabletInfo>>) -> Self {
        TabletInfoList { tablets }
    }

    /// Number of tablets in the list.
    pub fn len(&self) -> usize {
        self.tablets.len()
    }

    /// Whether the list holds no tablets.
    pub fn is_empty(&self) -> bool {
        self.tablets.is_empty()
    }

    /// Iterates over the tablets in list order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<TabletInfo>> {
        self.tablets.iter()
    }

    /// Finds the contiguous run of tablets belonging to the given table.
    /// Returns the inclusive index bounds of the run.
    pub fn find_tablets(&self, keyspace: &str, table: &str) -> Option<(usize, usize)> {
        let mut bounds = None;
        for (i, tablet) in self.tablets.iter().enumerate() {
            if tablet.keyspace == keyspace && tablet.table == table {
                match &mut bounds {
                    None => bounds = Some((i, i)),
                    Some((_, r)) => *r = i,
                }
            } else if bounds.is_some() {
                break;
            }
        }
        bounds
    }

    /// Splices a tablet into the list, removing every tablet of the same
    /// table whose range overlaps the incoming one.
    ///
    /// The index arithmetic below, including the asymmetric `>` / `>=`
    /// boundary comparisons, is the contract of the routing metadata
    /// protocol; ranges are left-exclusive, right-inclusive.
    #[must_use]
    pub fn add_tablet(&self, tablet: Arc<TabletInfo>) -> TabletInfoList {
        let (l, r) = match self.find_tablets(&tablet.keyspace, &tablet.table) {
            Some((l, r)) => (l as isize, r as isize + 1),
            None => (0, 0),
        };
        let t = &self.tablets;

        // First tablet that could overlap the incoming range.
        let (mut l1, mut r1) = (l, r);
        while l1 < r1 {
            let mid = (l1 + r1) / 2;
            if t[mid as usize].first_token < tablet.first_token {
                l1 = mid + 1;
            } else {
                r1 = mid;
            }
        }
        let mut start = l1;
        if start > l && t[start as usize - 1].last_token > tablet.first_token {
            start -= 1;
        }

        // Last tablet that could overlap the incoming range.
        let (mut l2, mut r2) = (l, r);
        while l2 < r2 {
            let mid = (l2 + r2) / 2;
            if t[mid as usize].last_token < tablet.last_token {
                l2 = mid + 1;
            } else {
                r2 = mid;
            }
        }
        let mut end = l2;
        if end < r && t[end as usize].first_token >= tablet.last_token {
            end -= 1;
        }
        if end == t.len() as isize {
            end -= 1;
        }

        let mut updated = self.tablets.clone();
        if start <= end {
            updated.drain(start as usize..=end as usize);
        }
        updated.insert(start as usize, tablet);
        TabletInfoList { tablets: updated }
    }

    /// Removes every tablet that has the given host among its replicas.
    #[must_use]
    pub fn remove_tablets_with_host(&self, host: Uuid) -> TabletInfoList {
        TabletInfoList {
            tablets: self
                .tablets
                .iter()
                .filter(|t| !t.has_replica_on(host))
                .cloned()
                .collect(),
        }
    }

    /// Removes every tablet of the given keyspace.
    #[must_use]
    pub fn remove_tablets_with_keyspace(&self, keyspace: &str) -> TabletInfoList {
        TabletInfoList {
            tablets: self
                .tablets
                .iter()
                .filter(|t| t.keyspace != keyspace)
                .cloned()
                .collect(),
        }
    }

    /// Removes every tablet of the given table.
    #[must_use]
    pub fn remove_tablets_with_table(&self, keyspace: &str, table: &str) -> TabletInfoList {
        TabletInfoList {
            tablets: self
                .tablets
                .iter()
                .filter(|t| !(t.keyspace == keyspace && t.table == table))
                .cloned()
                .collect(),
        }
    }

    /// Within the run `[l, r]` of one table, finds the first tablet whose
    /// last token is not lower than the given token. The caller is
    /// responsible for checking the first-token side of the range.
    pub fn find_tablet_for_token(&self, token: Token, l: usize, r: usize) -> &Arc<TabletInfo> {
        let (mut l, mut r) = (l, r);
        while l < r {
            let mid = l + (r - l) / 2;
            if self.tablets[mid].last_token < token {
                l = mid + 1;
            } else {
                r = mid;
            }
        }
        &self.tablets[l]
    }
}

/// A copy-on-write tablet list.
///
/// Readers load the current snapshot without taking any lock; writers
/// serialize on a mutex and publish a rebuilt list.
#[derive(Debug, Default)]
pub struct CowTabletList {
    list: ArcSwap<TabletInfoList>,
    write_lock: Mutex<()>,
}

impl CowTabletList {
    /// Creates an empty tablet index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current snapshot.
    pub fn get(&self) -> Arc<TabletInfoList> {
        self.list.load_full()
    }

    /// Replaces the whole list.
    pub fn set(&self, tablets: TabletInfoList) {
        let _guard = self.write_lock.lock().unwrap();
        self.list.store(Arc::new(tablets));
    }

    /// Splices one tablet in.
    pub fn add_tablet(&self, tablet: Arc<TabletInfo>) {
        let _guard = self.write_lock.lock().unwrap();
        let updated = self.list.load().add_tablet(tablet);
        self.list.store(Arc::new(updated));
    }

    /// Splices a batch of tablets in under a single writer critical
    /// section, publishing one snapshot.
    pub fn bulk_add_tablets(&self, tablets: impl IntoIterator<Item = Arc<TabletInfo>>) {
        let _guard = self.write_lock.lock().unwrap();
        let mut updated = TabletInfoList::clone(&self.list.load());
        for tablet in tablets {
            updated = updated.add_tablet(tablet);
        }
        self.list.store(Arc::new(updated));
    }

    /// Drops every tablet replicated on the given host.
    pub fn remove_tablets_with_host(&self, host: Uuid) {
        let _guard = self.write_lock.lock().unwrap();
        let updated = self.list.load().remove_tablets_with_host(host);
        self.list.store(Arc::new(updated));
    }

    /// Drops every tablet of the given keyspace.
    pub fn remove_tablets_with_keyspace(&self, keyspace: &str) {
        let _guard = self.write_lock.lock().unwrap();
        let updated = self.list.load().remove_tablets_with_keyspace(keyspace);
        self.list.store(Arc::new(updated));
    }

    /// Drops every tablet of the given table.
    pub fn remove_tablets_with_table(&self, keyspace: &str, table: &str) {
        let _guard = self.write_lock.lock().unwrap();
        let updated = self.list.load().remove_tablets_with_table(keyspace, table);
        self.list.store(Arc::new(updated));
    }

    /// Returns the replicas of the tablet owning the given token, or an
    /// empty list when no known tablet of that table covers the token.
    pub fn replicas_for_token(&self, keyspace: &str, table: &str, token: Token) -> Vec<TabletReplica> {
        let snapshot = self.list.load();
        let Some((l, r)) = snapshot.find_tablets(keyspace, table) else {
            return Vec::new();
        };
        let tablet = snapshot.find_tablet_for_token(token, l, r);
        if tablet.first_token < token && token <= tablet.last_token {
            tablet.replicas.clone()
        } else {
            Vec::new()
        }
    }
}
