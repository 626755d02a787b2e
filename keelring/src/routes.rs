//! Client route resolution for proxy deployments.
//!
//! A connection proxy publishes a `system.client_routes` table mapping
//! each host to the hostname and ports the client must dial instead of
//! the node's own address. This module keeps a resolved snapshot of that
//! table, re-resolves hostnames through DNS as needed, and translates
//! host addresses against the snapshot without blocking readers.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use itertools::Itertools;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::{
    AggregatedResolutionError, MetadataError, ResolutionError, TranslationError,
};
use crate::network::{ControlConnection, Row, RowValue};
use crate::policies::address_translator::AddressPort;

/// How many times a translation retries after losing a snapshot race
/// before giving up.
const MAX_SNAPSHOT_RETRIES: usize = 5;

/// A row of the client routes table, before any DNS resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnresolvedClientRoute {
    /// Proxy connection the route belongs to.
    pub connection_id: String,
    /// The host this route leads to.
    pub host_id: Uuid,
    /// Hostname (or address literal) to dial.
    pub address: String,
    /// Plaintext native transport port.
    pub port: u16,
    /// TLS native transport port.
    pub tls_port: u16,
}

/// A route together with its resolution state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedClientRoute {
    /// The route as read from the table.
    pub route: UnresolvedClientRoute,
    /// Every address the hostname resolved to last time.
    pub all_known_ips: Vec<IpAddr>,
    /// The address currently in use, when resolution succeeded.
    pub current_ip: Option<IpAddr>,
    /// When the route was last resolved.
    pub update_time: DateTime<Utc>,
    /// Set when the table changed under the route; forces the next
    /// resolution pass to re-resolve it.
    pub forced_resolve: bool,
}

impl ResolvedClientRoute {
    /// Wraps a fresh table row; the route starts unresolved.
    pub fn new(route: UnresolvedClientRoute) -> Self {
        ResolvedClientRoute {
            route,
            all_known_ips: Vec::new(),
            current_ip: None,
            update_time: DateTime::UNIX_EPOCH,
            forced_resolve: false,
        }
    }

    /// Whether the route must be re-resolved before it is usable.
    pub fn needs_update(&self) -> bool {
        self.current_ip.is_none() || self.all_known_ips.is_empty() || self.forced_resolve
    }

    /// Whether `candidate` carries fresher resolution state than `self`.
    /// A candidate with a current address beats a record without one;
    /// otherwise the later update time wins.
    pub fn newer(&self, candidate: &ResolvedClientRoute) -> bool {
        if candidate.current_ip.is_some() && self.current_ip.is_none() {
            return true;
        }
        candidate.update_time > self.update_time
    }
}

/// The resolved snapshot of the client routes table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedClientRouteList {
    records: Vec<ResolvedClientRoute>,
}

impl ResolvedClientRouteList {
    /// Builds a list from already resolved records.
    pub fn from_records(records: Vec<ResolvedClientRoute>) -> Self {
        ResolvedClientRouteList { records }
    }

    /// All records.
    pub fn records(&self) -> &[ResolvedClientRoute] {
        &self.records
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Folds a fresh read of the table into the list.
    ///
    /// Records are matched on (connection id, host id). A matching row
    /// with a changed address or ports overwrites those fields and
    /// forces re-resolution; an unseen pair is appended as forced; an
    /// unchanged match is left alone. Records absent from the incoming
    /// set are retained, since reads may be filtered to a subset of the
    /// table.
    pub fn merge_with_unresolved(&mut self, incoming: &[UnresolvedClientRoute]) {
        for unresolved in incoming {
            let existing = self.records.iter_mut().find(|record| {
                record.route.connection_id == unresolved.connection_id
                    && record.route.host_id == unresolved.host_id
            });
            match existing {
                Some(record) => {
                    if record.route != *unresolved {
                        record.route = unresolved.clone();
                        record.forced_resolve = true;
                    }
                }
                None => {
                    let mut record = ResolvedClientRoute::new(unresolved.clone());
                    record.forced_resolve = true;
                    self.records.push(record);
                }
            }
        }
    }

    /// Folds another resolved list in, keeping whichever record is
    /// newer per (connection id, host id); unmatched records append.
    pub fn merge_with_resolved(&mut self, other: &ResolvedClientRouteList) {
        for candidate in &other.records {
            let existing = self.records.iter_mut().find(|record| {
                record.route.connection_id == candidate.route.connection_id
                    && record.route.host_id == candidate.route.host_id
            });
            match existing {
                Some(record) => {
                    if record.newer(candidate) {
                        *record = candidate.clone();
                    }
                }
                None => self.records.push(candidate.clone()),
            }
        }
    }

    /// Replaces the matching record when the candidate is newer.
    /// Returns whether a replacement happened.
    pub fn update_if_newer(&mut self, candidate: ResolvedClientRoute) -> bool {
        let Some(record) = self.records.iter_mut().find(|record| {
            record.route.connection_id == candidate.route.connection_id
                && record.route.host_id == candidate.route.host_id
        }) else {
            return false;
        };
        if record.newer(&candidate) {
            *record = candidate;
            return true;
        }
        false
    }

    /// Looks a route up by host id.
    pub fn find_by_host_id(&self, host_id: Uuid) -> Option<&ResolvedClientRoute> {
        self.records
            .iter()
            .find(|record| record.route.host_id == host_id)
    }

    fn find_by_host_id_mut(&mut self, host_id: Uuid) -> Option<&mut ResolvedClientRoute> {
        self.records
            .iter_mut()
            .find(|record| record.route.host_id == host_id)
    }
}

/// Hostname to address lookup.
#[async_trait]
pub trait DnsResolver: Send + Sync {
    /// Resolves a hostname to its addresses.
    async fn lookup_ip(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolutionError>;
}

/// The system resolver, through tokio's `lookup_host`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDnsResolver;

#[async_trait]
impl DnsResolver for TokioDnsResolver {
    async fn lookup_ip(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        let addresses = tokio::net::lookup_host((hostname, 0u16))
            .await
            .map_err(|reason| ResolutionError::Lookup {
                hostname: hostname.to_owned(),
                reason: Arc::new(reason),
            })?;
        Ok(addresses.map(|address| address.ip()).collect())
    }
}

#[async_trait]
impl<F> DnsResolver for F
where
    F: Fn(&str) -> Result<Vec<IpAddr>, ResolutionError> + Send + Sync,
{
    async fn lookup_ip(&self, hostname: &str) -> Result<Vec<IpAddr>, ResolutionError> {
        self(hostname)
    }
}

/// Resolves one client route into its address set and current address.
#[async_trait]
pub trait ClientRoutesResolver: Send + Sync {
    /// Resolves the route's hostname.
    async fn resolve(
        &self,
        route: &ResolvedClientRoute,
    ) -> Result<(Vec<IpAddr>, Option<IpAddr>), ResolutionError>;
}

/// A DNS-backed resolver with a per-hostname TTL cache.
///
/// A failed or empty lookup falls back to the route's previously known
/// addresses with a warning; the error surfaces only when there is
/// nothing to fall back to. The current address is preserved across a
/// refresh when it is still part of the fresh answer, otherwise the
/// first answer takes over.
pub struct SimpleClientRoutesResolver {
    ttl: Duration,
    dns: Arc<dyn DnsResolver>,
    cache: StdMutex<HashMap<String, (Vec<IpAddr>, Instant)>>,
}

impl SimpleClientRoutesResolver {
    /// Creates a resolver caching answers for `ttl`.
    pub fn new(ttl: Duration, dns: Arc<dyn DnsResolver>) -> Self {
        SimpleClientRoutesResolver {
            ttl,
            dns,
            cache: StdMutex::new(HashMap::new()),
        }
    }

    fn cached(&self, hostname: &str) -> Option<Vec<IpAddr>> {
        let cache = self.cache.lock().unwrap();
        let (ips, expires) = cache.get(hostname)?;
        if Instant::now() < *expires {
            Some(ips.clone())
        } else {
            None
        }
    }
}

#[async_trait]
impl ClientRoutesResolver for SimpleClientRoutesResolver {
    async fn resolve(
        &self,
        route: &ResolvedClientRoute,
    ) -> Result<(Vec<IpAddr>, Option<IpAddr>), ResolutionError> {
        let hostname = &route.route.address;
        let answer = match self.cached(hostname) {
            Some(ips) => Ok(ips),
            None => match self.dns.lookup_ip(hostname).await {
                Ok(ips) if ips.is_empty() => Err(ResolutionError::EmptyLookup(hostname.clone())),
                other => other,
            },
        };

        let ips = match answer {
            Ok(ips) => ips,
            Err(error) => {
                if route.all_known_ips.is_empty() && route.current_ip.is_none() {
                    return Err(error);
                }
                warn!(%hostname, %error, "route resolution failed, keeping the last known addresses");
                return Ok((route.all_known_ips.clone(), route.current_ip));
            }
        };

        self.cache
            .lock()
            .unwrap()
            .insert(hostname.clone(), (ips.clone(), Instant::now() + self.ttl));

        let current = match route.current_ip {
            Some(current) if ips.contains(&current) => Some(current),
            _ => ips.first().copied(),
        };
        Ok((ips, current))
    }
}

/// Settings of the client routes machinery.
#[derive(Debug, Clone)]
pub struct ClientRoutesConfig {
    /// Fully qualified name of the routes table.
    pub table: String,
    /// Restrict reads to these connection ids; empty reads everything.
    pub connection_ids: Vec<String>,
    /// Restrict reads to these host ids; empty reads everything.
    pub host_ids: Vec<Uuid>,
    /// Upper bound on concurrent resolver calls during a refresh.
    pub max_resolver_concurrency: usize,
    /// Healthy routes older than this get re-resolved on refresh.
    pub resolve_healthy_endpoint_period: Duration,
    /// Whether translations hand out the TLS port.
    pub use_tls_ports: bool,
}

impl Default for ClientRoutesConfig {
    fn default() -> Self {
        ClientRoutesConfig {
            table: "system.client_routes".to_owned(),
            connection_ids: Vec::new(),
            host_ids: Vec::new(),
            max_resolver_concurrency: 8,
            resolve_healthy_endpoint_period: Duration::from_secs(3600),
            use_tls_ports: false,
        }
    }
}

/// Builds the routes select statement and its bound values.
///
/// `allow filtering` is appended unless both id filters are present, in
/// which case the primary key is fully restricted.
fn build_routes_statement(
    table: &str,
    connection_ids: &[String],
    host_ids: &[Uuid],
) -> (String, Vec<RowValue>) {
    let mut statement =
        format!("select connection_id, host_id, address, port, tls_port from {table}");
    let mut values = Vec::with_capacity(connection_ids.len() + host_ids.len());

    if !connection_ids.is_empty() {
        let markers = std::iter::repeat("?").take(connection_ids.len()).join(",");
        statement.push_str(&format!(" where connection_id in ({markers})"));
        values.extend(connection_ids.iter().map(|id| RowValue::Text(id.clone())));
    }
    if !host_ids.is_empty() {
        let keyword = if connection_ids.is_empty() { "where" } else { "and" };
        let markers = std::iter::repeat("?").take(host_ids.len()).join(",");
        statement.push_str(&format!(" {keyword} host_id in ({markers})"));
        values.extend(host_ids.iter().map(|id| RowValue::Uuid(*id)));
    }
    if connection_ids.is_empty() || host_ids.is_empty() {
        statement.push_str(" allow filtering");
    }

    (statement, values)
}

fn route_from_row(row: &Row) -> Result<UnresolvedClientRoute, MetadataError> {
    fn column<'a>(row: &'a Row, name: &str) -> Result<&'a RowValue, MetadataError> {
        row.get(name).ok_or_else(|| MetadataError::InvalidColumn {
            table: "client_routes",
            column: name.to_owned(),
        })
    }
    fn port(value: &RowValue) -> u16 {
        value
            .as_int()
            .and_then(|port| u16::try_from(port).ok())
            .unwrap_or(0)
    }

    Ok(UnresolvedClientRoute {
        connection_id: column(row, "connection_id")?
            .as_text()
            .unwrap_or_default()
            .to_owned(),
        host_id: column(row, "host_id")?.as_uuid().unwrap_or_default(),
        address: column(row, "address")?
            .as_text()
            .unwrap_or_default()
            .to_owned(),
        port: port(column(row, "port")?),
        tls_port: port(column(row, "tls_port")?),
    })
}

/// Keeps the resolved routes snapshot and translates host addresses
/// against it.
pub struct ClientRoutesHandler {
    cfg: ClientRoutesConfig,
    resolver: Arc<dyn ClientRoutesResolver>,
    resolved: ArcSwap<ResolvedClientRouteList>,
}

impl ClientRoutesHandler {
    /// Creates a handler with an empty snapshot.
    pub fn new(cfg: ClientRoutesConfig, resolver: Arc<dyn ClientRoutesResolver>) -> Self {
        ClientRoutesHandler {
            cfg,
            resolver,
            resolved: ArcSwap::from_pointee(ResolvedClientRouteList::default()),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<ResolvedClientRouteList> {
        self.resolved.load_full()
    }

    fn address_of(&self, record: &ResolvedClientRoute, ip: IpAddr) -> AddressPort {
        let port = if self.cfg.use_tls_ports && record.route.tls_port != 0 {
            record.route.tls_port
        } else {
            record.route.port
        };
        AddressPort { address: ip, port }
    }

    /// Translates a host's address through its client route.
    ///
    /// Hosts without an id pass `fallback` through untouched. A known
    /// id whose route is not resolved yet triggers an on-demand
    /// resolution published with a compare-and-swap: when a concurrent
    /// refresh swapped the snapshot underneath, the resolution result
    /// is discarded and the lookup retried against the new snapshot, a
    /// bounded number of times.
    pub async fn translate_host(
        &self,
        host_id: Option<Uuid>,
        fallback: AddressPort,
    ) -> Result<AddressPort, TranslationError> {
        let Some(host_id) = host_id else {
            return Ok(fallback);
        };

        for _ in 0..MAX_SNAPSHOT_RETRIES {
            let snapshot = self.resolved.load_full();
            let Some(record) = snapshot.find_by_host_id(host_id) else {
                return Err(TranslationError::NoRouteForHost(host_id));
            };
            if let Some(ip) = record.current_ip {
                return Ok(self.address_of(record, ip));
            }

            let (ips, current) = self.resolver.resolve(record).await?;
            let mut updated = (*snapshot).clone();
            if let Some(record) = updated.find_by_host_id_mut(host_id) {
                record.all_known_ips = ips;
                record.current_ip = current;
                record.update_time = Utc::now();
                record.forced_resolve = false;
            }
            let updated = Arc::new(updated);
            let previous = self.resolved.compare_and_swap(&snapshot, updated.clone());
            if !Arc::ptr_eq(&previous, &snapshot) {
                // Lost the race against a concurrent refresh; throw the
                // result away and look again.
                debug!(%host_id, "client routes snapshot changed mid-resolve, retrying");
                continue;
            }

            let record = updated
                .find_by_host_id(host_id)
                .ok_or(TranslationError::NoRouteForHost(host_id))?;
            return match record.current_ip {
                Some(ip) => Ok(self.address_of(record, ip)),
                None => Err(TranslationError::NoRouteForHost(host_id)),
            };
        }

        Err(TranslationError::SnapshotContention(MAX_SNAPSHOT_RETRIES))
    }

    /// Resolves every record that needs it, bounded by the configured
    /// resolver concurrency. Successful resolutions apply even when
    /// others fail; failures are aggregated into one error.
    async fn resolve_and_update_in_place(
        &self,
        records: &mut ResolvedClientRouteList,
    ) -> Result<(), AggregatedResolutionError> {
        let now = Utc::now();
        let staleness = chrono::Duration::from_std(self.cfg.resolve_healthy_endpoint_period)
            .unwrap_or_else(|_| chrono::Duration::MAX);
        let pending: Vec<usize> = records
            .records
            .iter()
            .enumerate()
            .filter(|(_, record)| {
                record.needs_update() || now.signed_duration_since(record.update_time) > staleness
            })
            .map(|(idx, _)| idx)
            .collect();

        let limit = Arc::new(Semaphore::new(self.cfg.max_resolver_concurrency.max(1)));
        let lookups = pending.into_iter().map(|idx| {
            let record = records.records[idx].clone();
            let limit = limit.clone();
            let resolver = self.resolver.clone();
            async move {
                let _permit = limit.acquire_owned().await.ok();
                (idx, resolver.resolve(&record).await)
            }
        });
        let outcomes = futures::future::join_all(lookups).await;

        let mut errors = Vec::new();
        for (idx, outcome) in outcomes {
            match outcome {
                Ok((ips, current)) => {
                    let record = &mut records.records[idx];
                    record.all_known_ips = ips;
                    record.current_ip = current;
                    record.update_time = now;
                    record.forced_resolve = false;
                }
                Err(error) => errors.push(error),
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(AggregatedResolutionError(errors))
        }
    }

    /// Re-reads the routes table, folds it into the snapshot, resolves
    /// what needs resolving and publishes the result.
    ///
    /// Partial resolution failures are logged, not surfaced; the
    /// records that did resolve are published regardless.
    pub async fn refresh(&self, control: &dyn ControlConnection) -> Result<(), MetadataError> {
        let (statement, values) =
            build_routes_statement(&self.cfg.table, &self.cfg.connection_ids, &self.cfg.host_ids);
        let rows = control.query(&statement, &values).await?;
        let incoming = rows
            .iter()
            .map(route_from_row)
            .collect::<Result<Vec<_>, MetadataError>>()?;

        let mut merged = (*self.resolved.load_full()).clone();
        merged.merge_with_unresolved(&incoming);
        if let Err(error) = self.resolve_and_update_in_place(&mut merged).await {
            warn!(%error, "some client routes failed to resolve");
        }
        self.resolved.store(Arc::new(merged));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::OnceLock;

    use assert_matches::assert_matches;

    use super::*;

    fn unresolved(connection_id: &str, host_id: Uuid, address: &str, port: u16) -> UnresolvedClientRoute {
        UnresolvedClientRoute {
            connection_id: connection_id.to_owned(),
            host_id,
            address: address.to_owned(),
            port,
            tls_port: 0,
        }
    }

    fn resolved_at(route: UnresolvedClientRoute, seconds: i64) -> ResolvedClientRoute {
        ResolvedClientRoute {
            update_time: DateTime::from_timestamp(seconds, 0).unwrap(),
            ..ResolvedClientRoute::new(route)
        }
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_needs_update_and_newer() {
        let h1 = Uuid::new_v4();
        let mut record = ResolvedClientRoute::new(unresolved("c1", h1, "host", 9042));
        assert!(record.needs_update());

        record.current_ip = Some(ip("10.0.0.1"));
        // Known-IP list still empty.
        assert!(record.needs_update());

        record.all_known_ips = vec![ip("10.0.0.1")];
        assert!(!record.needs_update());

        record.forced_resolve = true;
        assert!(record.needs_update());

        // A candidate with a current address beats one without.
        let blank = ResolvedClientRoute::new(unresolved("c1", h1, "host", 9042));
        assert!(blank.newer(&record));
        assert!(!record.newer(&blank));

        // Otherwise the later update time wins.
        let older = resolved_at(unresolved("c1", h1, "host", 9042), 10);
        let later = resolved_at(unresolved("c1", h1, "host", 9042), 20);
        assert!(older.newer(&later));
        assert!(!later.newer(&older));
    }

    #[test]
    fn test_merge_with_unresolved() {
        let h1 = Uuid::new_v4();
        let mut list = ResolvedClientRouteList::from_records(vec![ResolvedClientRoute::new(
            unresolved("c1", h1, "a1", 9042),
        )]);

        // Identical incoming row: untouched, not forced.
        list.merge_with_unresolved(&[unresolved("c1", h1, "a1", 9042)]);
        assert_eq!(list.len(), 1);
        assert!(!list.records()[0].forced_resolve);

        // Changed address and port: overwritten and forced.
        list.merge_with_unresolved(&[unresolved("c1", h1, "a2", 9043)]);
        assert_eq!(list.records()[0].route.address, "a2");
        assert_eq!(list.records()[0].route.port, 9043);
        assert!(list.records()[0].forced_resolve);

        // Unseen pair: appended as forced.
        let h2 = Uuid::new_v4();
        list.merge_with_unresolved(&[unresolved("c2", h2, "a3", 9044)]);
        assert_eq!(list.len(), 2);
        assert!(list.records()[1].forced_resolve);

        // An incoming set missing h1 retains h1.
        list.merge_with_unresolved(&[unresolved("c2", h2, "a3", 9044)]);
        assert_eq!(list.len(), 2);
        assert!(list.find_by_host_id(h1).is_some());
    }

    #[test]
    fn test_merge_with_resolved() {
        let h1 = Uuid::new_v4();
        let h2 = Uuid::new_v4();
        let older = resolved_at(unresolved("c1", h1, "host", 9042), 10);
        let newer = ResolvedClientRoute {
            current_ip: Some(ip("10.0.0.1")),
            ..resolved_at(unresolved("c1", h1, "host", 9042), 20)
        };

        let mut list = ResolvedClientRouteList::from_records(vec![older.clone()]);
        let other = ResolvedClientRouteList::from_records(vec![
            newer.clone(),
            ResolvedClientRoute::new(unresolved("c2", h2, "other", 9042)),
        ]);
        list.merge_with_resolved(&other);

        assert_eq!(list.records()[0].update_time, newer.update_time);
        assert!(list.records()[0].current_ip.is_some());
        assert_eq!(list.len(), 2);

        // A stale incoming record does not clobber a newer one.
        let mut list = ResolvedClientRouteList::from_records(vec![newer.clone()]);
        list.merge_with_resolved(&ResolvedClientRouteList::from_records(vec![older]));
        assert_eq!(list.records()[0].update_time, newer.update_time);
    }

    #[test]
    fn test_update_if_newer_and_find_by_host_id() {
        let h1 = Uuid::new_v4();
        let mut list = ResolvedClientRouteList::from_records(vec![resolved_at(
            unresolved("c1", h1, "host", 9042),
            10,
        )]);

        assert!(!list.update_if_newer(resolved_at(unresolved("c1", h1, "host", 9042), 5)));
        assert!(list.update_if_newer(resolved_at(unresolved("c1", h1, "host", 9042), 15)));
        assert_eq!(
            list.find_by_host_id(h1).unwrap().update_time,
            DateTime::from_timestamp(15, 0).unwrap()
        );
        assert!(list.find_by_host_id(Uuid::new_v4()).is_none());
    }

    #[tokio::test]
    async fn test_simple_resolver_caches_and_preserves_current_ip() {
        let calls = Arc::new(AtomicUsize::new(0));
        let dns = {
            let calls = calls.clone();
            move |_hostname: &str| {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(vec![ip("10.0.0.1"), ip("10.0.0.2")])
            }
        };
        let resolver = SimpleClientRoutesResolver::new(Duration::from_secs(3600), Arc::new(dns));

        let route = ResolvedClientRoute {
            current_ip: Some(ip("10.0.0.2")),
            ..ResolvedClientRoute::new(unresolved("c1", Uuid::new_v4(), "example", 9042))
        };
        let (all, current) = resolver.resolve(&route).await.unwrap();
        assert_eq!(all.len(), 2);
        // Still present in the answer, so preserved.
        assert_eq!(current, Some(ip("10.0.0.2")));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A second resolve inside the TTL hits the cache.
        resolver.resolve(&route).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // A vanished current address is replaced by the first answer.
        let route = ResolvedClientRoute {
            current_ip: Some(ip("10.9.9.9")),
            ..route
        };
        let (_, current) = resolver.resolve(&route).await.unwrap();
        assert_eq!(current, Some(ip("10.0.0.1")));
    }

    #[tokio::test]
    async fn test_simple_resolver_falls_back_on_failure() {
        let failing = |hostname: &str| -> Result<Vec<IpAddr>, ResolutionError> {
            Err(ResolutionError::Lookup {
                hostname: hostname.to_owned(),
                reason: Arc::new(std::io::Error::other("nxdomain")),
            })
        };
        let resolver = SimpleClientRoutesResolver::new(Duration::ZERO, Arc::new(failing));

        // With known addresses the failure degrades to the old values.
        let route = ResolvedClientRoute {
            current_ip: Some(ip("10.0.0.9")),
            all_known_ips: vec![ip("10.0.0.9")],
            ..ResolvedClientRoute::new(unresolved("c1", Uuid::new_v4(), "example", 9042))
        };
        let (all, current) = resolver.resolve(&route).await.unwrap();
        assert_eq!(all, vec![ip("10.0.0.9")]);
        assert_eq!(current, Some(ip("10.0.0.9")));

        // Without a fallback the error surfaces.
        let blank = ResolvedClientRoute::new(unresolved("c1", Uuid::new_v4(), "example", 9042));
        assert_matches!(
            resolver.resolve(&blank).await,
            Err(ResolutionError::Lookup { .. })
        );

        // An empty answer behaves like a failure.
        let empty = |_hostname: &str| -> Result<Vec<IpAddr>, ResolutionError> { Ok(vec![]) };
        let resolver = SimpleClientRoutesResolver::new(Duration::ZERO, Arc::new(empty));
        assert_matches!(
            resolver.resolve(&blank).await,
            Err(ResolutionError::EmptyLookup(_))
        );
    }

    struct FixedResolver {
        answer: Vec<IpAddr>,
    }

    #[async_trait]
    impl ClientRoutesResolver for FixedResolver {
        async fn resolve(
            &self,
            _route: &ResolvedClientRoute,
        ) -> Result<(Vec<IpAddr>, Option<IpAddr>), ResolutionError> {
            Ok((self.answer.clone(), self.answer.first().copied()))
        }
    }

    fn handler_with(
        cfg: ClientRoutesConfig,
        resolver: Arc<dyn ClientRoutesResolver>,
        records: Vec<ResolvedClientRoute>,
    ) -> ClientRoutesHandler {
        let handler = ClientRoutesHandler::new(cfg, resolver);
        handler
            .resolved
            .store(Arc::new(ResolvedClientRouteList::from_records(records)));
        handler
    }

    #[tokio::test]
    async fn test_translate_host_pass_through_and_missing() {
        let fallback = AddressPort {
            address: ip("1.1.1.1"),
            port: 9042,
        };
        let handler = handler_with(
            ClientRoutesConfig::default(),
            Arc::new(FixedResolver { answer: vec![] }),
            vec![],
        );

        // No host id: the fallback passes through.
        assert_eq!(handler.translate_host(None, fallback).await.unwrap(), fallback);

        // A host id with no route is an error.
        let missing = Uuid::new_v4();
        assert_matches!(
            handler.translate_host(Some(missing), fallback).await,
            Err(TranslationError::NoRouteForHost(id)) if id == missing
        );
    }

    #[tokio::test]
    async fn test_translate_host_picks_configured_port() {
        let fallback = AddressPort {
            address: ip("1.1.1.1"),
            port: 9042,
        };
        let h1 = Uuid::new_v4();
        let record = ResolvedClientRoute {
            current_ip: Some(ip("10.0.0.1")),
            all_known_ips: vec![ip("10.0.0.1")],
            ..ResolvedClientRoute::new(UnresolvedClientRoute {
                tls_port: 9142,
                ..unresolved("c1", h1, "host", 9042)
            })
        };

        let handler = handler_with(
            ClientRoutesConfig::default(),
            Arc::new(FixedResolver { answer: vec![] }),
            vec![record.clone()],
        );
        let translated = handler.translate_host(Some(h1), fallback).await.unwrap();
        assert_eq!(translated.address, ip("10.0.0.1"));
        assert_eq!(translated.port, 9042);

        let handler = handler_with(
            ClientRoutesConfig {
                use_tls_ports: true,
                ..ClientRoutesConfig::default()
            },
            Arc::new(FixedResolver { answer: vec![] }),
            vec![record],
        );
        let translated = handler.translate_host(Some(h1), fallback).await.unwrap();
        assert_eq!(translated.port, 9142);
    }

    #[tokio::test]
    async fn test_translate_host_resolves_on_demand() {
        let fallback = AddressPort {
            address: ip("1.1.1.1"),
            port: 9042,
        };
        let h1 = Uuid::new_v4();
        let handler = handler_with(
            ClientRoutesConfig::default(),
            Arc::new(FixedResolver {
                answer: vec![ip("10.0.0.7")],
            }),
            vec![ResolvedClientRoute::new(unresolved("c1", h1, "host", 9042))],
        );

        let translated = handler.translate_host(Some(h1), fallback).await.unwrap();
        assert_eq!(translated.address, ip("10.0.0.7"));

        // The resolution was published for the next caller.
        let snapshot = handler.snapshot();
        let record = snapshot.find_by_host_id(h1).unwrap();
        assert_eq!(record.current_ip, Some(ip("10.0.0.7")));
        assert!(!record.forced_resolve);
    }

    /// Swaps the snapshot during every resolve call, making the CAS
    /// publication lose. `contend` controls for how many calls.
    struct ContendingResolver {
        handler: OnceLock<Arc<ClientRoutesHandler>>,
        contend: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ClientRoutesResolver for ContendingResolver {
        async fn resolve(
            &self,
            _route: &ResolvedClientRoute,
        ) -> Result<(Vec<IpAddr>, Option<IpAddr>), ResolutionError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.contend {
                let handler = self.handler.get().unwrap();
                // A fresh allocation with equal content: the CAS fails
                // while the record set stays intact.
                let clone = (*handler.resolved.load_full()).clone();
                handler.resolved.store(Arc::new(clone));
            }
            let answer = ip("10.0.0.1");
            Ok((vec![answer], Some(answer)))
        }
    }

    #[tokio::test]
    async fn test_translate_host_retries_after_snapshot_swap() {
        let fallback = AddressPort {
            address: ip("1.1.1.1"),
            port: 9042,
        };
        let h1 = Uuid::new_v4();
        let resolver = Arc::new(ContendingResolver {
            handler: OnceLock::new(),
            contend: 1,
            calls: AtomicUsize::new(0),
        });
        let handler = Arc::new(handler_with(
            ClientRoutesConfig::default(),
            resolver.clone(),
            vec![ResolvedClientRoute::new(unresolved("c1", h1, "host", 9042))],
        ));
        resolver.handler.set(handler.clone()).ok();

        let translated = handler.translate_host(Some(h1), fallback).await.unwrap();
        assert_eq!(translated.address, ip("10.0.0.1"));
        // First resolve lost the race, the second one published.
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_translate_host_gives_up_under_contention() {
        let fallback = AddressPort {
            address: ip("1.1.1.1"),
            port: 9042,
        };
        let h1 = Uuid::new_v4();
        let resolver = Arc::new(ContendingResolver {
            handler: OnceLock::new(),
            contend: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let handler = Arc::new(handler_with(
            ClientRoutesConfig::default(),
            resolver.clone(),
            vec![ResolvedClientRoute::new(unresolved("c1", h1, "host", 9042))],
        ));
        resolver.handler.set(handler.clone()).ok();

        assert_matches!(
            handler.translate_host(Some(h1), fallback).await,
            Err(TranslationError::SnapshotContention(MAX_SNAPSHOT_RETRIES))
        );
    }

    /// Records which addresses were resolved and tracks the in-flight
    /// peak; routes named "err" fail.
    struct InstrumentedResolver {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        seen: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ClientRoutesResolver for InstrumentedResolver {
        async fn resolve(
            &self,
            route: &ResolvedClientRoute,
        ) -> Result<(Vec<IpAddr>, Option<IpAddr>), ResolutionError> {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            self.seen.lock().unwrap().push(route.route.address.clone());
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if route.route.address == "err" {
                return Err(ResolutionError::EmptyLookup("err".to_owned()));
            }
            let answer = ip("10.0.0.1");
            Ok((vec![answer], Some(answer)))
        }
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_resolve_and_update_in_place() {
        let resolver = Arc::new(InstrumentedResolver {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            seen: StdMutex::new(Vec::new()),
        });
        let handler = ClientRoutesHandler::new(
            ClientRoutesConfig {
                max_resolver_concurrency: 2,
                resolve_healthy_endpoint_period: Duration::from_secs(3600),
                ..ClientRoutesConfig::default()
            },
            resolver.clone(),
        );

        let now = Utc::now();
        let known = ip("10.0.0.2");
        let healthy = ResolvedClientRoute {
            current_ip: Some(known),
            all_known_ips: vec![known],
            update_time: now,
            ..ResolvedClientRoute::new(unresolved("c1", Uuid::new_v4(), "healthy", 9042))
        };
        let forced = ResolvedClientRoute {
            current_ip: Some(known),
            all_known_ips: vec![known],
            update_time: now,
            forced_resolve: true,
            ..ResolvedClientRoute::new(unresolved("c2", Uuid::new_v4(), "forced", 9042))
        };
        let empty = ResolvedClientRoute::new(unresolved("c3", Uuid::new_v4(), "empty", 9042));
        let stale = ResolvedClientRoute {
            current_ip: Some(known),
            all_known_ips: vec![known],
            update_time: now - chrono::Duration::hours(2),
            ..ResolvedClientRoute::new(unresolved("c4", Uuid::new_v4(), "stale", 9042))
        };
        let failing = ResolvedClientRoute::new(unresolved("c5", Uuid::new_v4(), "err", 9042));

        let mut records = ResolvedClientRouteList::from_records(vec![
            healthy, forced, empty, stale, failing,
        ]);
        let err = handler
            .resolve_and_update_in_place(&mut records)
            .await
            .unwrap_err();
        assert_eq!(err.0.len(), 1);

        let seen = resolver.seen.lock().unwrap().clone();
        assert!(!seen.contains(&"healthy".to_owned()));
        for address in ["forced", "empty", "stale", "err"] {
            assert!(seen.contains(&address.to_owned()), "{address} not resolved");
        }
        assert!(resolver.peak.load(Ordering::SeqCst) <= 2);

        // The forced record resolved and the flag cleared.
        let forced = &records.records()[1];
        assert_eq!(forced.current_ip, Some(ip("10.0.0.1")));
        assert!(!forced.forced_resolve);
        // The failed record kept its (empty) state.
        assert!(records.records()[4].current_ip.is_none());
    }

    struct TableControl {
        rows: Vec<Row>,
        statements: StdMutex<Vec<String>>,
    }

    #[async_trait]
    impl ControlConnection for TableControl {
        fn get_conn(&self) -> Option<crate::network::ConnHost> {
            None
        }

        async fn query(
            &self,
            statement: &str,
            _values: &[RowValue],
        ) -> Result<Vec<Row>, crate::errors::RequestAttemptError> {
            self.statements.lock().unwrap().push(statement.to_owned());
            Ok(self.rows.clone())
        }

        async fn reconnect(&self) -> Result<(), crate::errors::RequestAttemptError> {
            Ok(())
        }

        async fn await_schema_agreement(&self) -> Result<(), crate::errors::RequestAttemptError> {
            Ok(())
        }

        async fn close(&self) {}
    }

    fn route_row(connection_id: &str, host_id: Uuid, address: &str, port: i32) -> Row {
        Row::from([
            (
                "connection_id".to_owned(),
                RowValue::Text(connection_id.to_owned()),
            ),
            ("host_id".to_owned(), RowValue::Uuid(host_id)),
            ("address".to_owned(), RowValue::Text(address.to_owned())),
            ("port".to_owned(), RowValue::Int(port)),
            ("tls_port".to_owned(), RowValue::Int(0)),
        ])
    }

    #[tokio::test]
    async fn test_refresh_reads_merges_and_resolves() {
        let h1 = Uuid::new_v4();
        let control = TableControl {
            rows: vec![route_row("c1", h1, "node-1.proxy", 9042)],
            statements: StdMutex::new(Vec::new()),
        };
        let handler = ClientRoutesHandler::new(
            ClientRoutesConfig::default(),
            Arc::new(FixedResolver {
                answer: vec![ip("10.0.0.5")],
            }),
        );

        handler.refresh(&control).await.unwrap();

        let statements = control.statements.lock().unwrap().clone();
        assert_eq!(
            statements,
            vec![
                "select connection_id, host_id, address, port, tls_port \
                 from system.client_routes allow filtering"
                    .to_owned()
            ]
        );
        let snapshot = handler.snapshot();
        let record = snapshot.find_by_host_id(h1).unwrap();
        assert_eq!(record.current_ip, Some(ip("10.0.0.5")));
        assert!(!record.forced_resolve);
        assert!(!record.needs_update());

        // Translation now uses the resolved route.
        let translated = handler
            .translate_host(
                Some(h1),
                AddressPort {
                    address: ip("1.1.1.1"),
                    port: 9042,
                },
            )
            .await
            .unwrap();
        assert_eq!(translated.address, ip("10.0.0.5"));
        assert_eq!(translated.port, 9042);
    }

    #[test]
    fn test_build_routes_statement() {
        let c = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        let h1 = Uuid::new_v4();
        let h2 = Uuid::new_v4();

        let (stmt, values) = build_routes_statement("system.client_routes", &[], &[]);
        assert_eq!(
            stmt,
            "select connection_id, host_id, address, port, tls_port from system.client_routes allow filtering"
        );
        assert!(values.is_empty());

        let (stmt, values) =
            build_routes_statement("system.client_routes", &c(&["c1", "c2"]), &[]);
        assert_eq!(
            stmt,
            "select connection_id, host_id, address, port, tls_port from system.client_routes where connection_id in (?,?) allow filtering"
        );
        assert_eq!(
            values,
            vec![
                RowValue::Text("c1".to_owned()),
                RowValue::Text("c2".to_owned())
            ]
        );

        let (stmt, values) = build_routes_statement("system.client_routes", &[], &[h1]);
        assert_eq!(
            stmt,
            "select connection_id, host_id, address, port, tls_port from system.client_routes where host_id in (?) allow filtering"
        );
        assert_eq!(values, vec![RowValue::Uuid(h1)]);

        // Fully restricted: no filtering clause.
        let (stmt, values) =
            build_routes_statement("system.client_routes", &c(&["c1"]), &[h1, h2]);
        assert_eq!(
            stmt,
            "select connection_id, host_id, address, port, tls_port from system.client_routes where connection_id in (?) and host_id in (?,?)"
        );
        assert_eq!(
            values,
            vec![
                RowValue::Text("c1".to_owned()),
                RowValue::Uuid(h1),
                RowValue::Uuid(h2)
            ]
        );
    }
}
