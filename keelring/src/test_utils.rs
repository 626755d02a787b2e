//! Shared helpers for the crate's unit tests.

use std::net::IpAddr;
use std::sync::Arc;

use uuid::Uuid;

use crate::cluster::node::{Host, HostRecord};
use crate::network::{Row, RowValue};

/// Initializes a per-test tracing subscriber honoring `RUST_LOG`.
/// Safe to call from every test; only the first call wins.
pub(crate) fn setup_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A host with the identity and ring attributes tests care about.
pub(crate) fn test_host(host_id: Uuid, dc: &str, rack: &str, tokens: &[&str]) -> Arc<Host> {
    Arc::new(Host::from_record(HostRecord {
        host_id: Some(host_id),
        data_center: dc.to_owned(),
        rack: rack.to_owned(),
        tokens: tokens.iter().map(|token| token.to_string()).collect(),
        port: 9042,
        ..HostRecord::default()
    }))
}

/// A host with only its candidate addresses set, for exercising the
/// connect-address preference order.
pub(crate) fn host_with_addresses(
    peer: Option<IpAddr>,
    broadcast: Option<IpAddr>,
    rpc: Option<IpAddr>,
) -> Arc<Host> {
    Arc::new(Host::from_record(HostRecord {
        host_id: Some(Uuid::new_v4()),
        peer,
        broadcast_address: broadcast,
        rpc_address: rpc,
        port: 9042,
        ..HostRecord::default()
    }))
}

/// A `system.peers`-shaped row.
pub(crate) fn peer_row(host_id: Uuid, ip: IpAddr, dc: &str, rack: &str, tokens: &[&str]) -> Row {
    Row::from([
        ("host_id".to_owned(), RowValue::Uuid(host_id)),
        ("rpc_address".to_owned(), RowValue::Inet(ip)),
        ("data_center".to_owned(), RowValue::Text(dc.to_owned())),
        ("rack".to_owned(), RowValue::Text(rack.to_owned())),
        (
            "tokens".to_owned(),
            RowValue::TextList(tokens.iter().map(|token| token.to_string()).collect()),
        ),
        (
            "release_version".to_owned(),
            RowValue::Text("3.11.4".to_owned()),
        ),
    ])
}
