//! Translation of node addresses advertised by the cluster into
//! addresses the driver can actually dial.

use std::collections::HashMap;
use std::net::IpAddr;

/// An address and port pair, as advertised or as dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressPort {
    /// The IP address.
    pub address: IpAddr,
    /// The native transport port.
    pub port: u16,
}

impl std::fmt::Display for AddressPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Maps the address a node advertises in the system tables to the
/// address the driver should connect to.
///
/// Deployments behind NAT or a proxy advertise internal addresses; a
/// translator rewrites them before any connection is attempted.
pub trait AddressTranslator: Send + Sync {
    /// Translates an advertised address. Addresses the translator does
    /// not know pass through unchanged.
    fn translate(&self, address: AddressPort) -> AddressPort;
}

/// The no-op translator: every address maps to itself, including the
/// unspecified address.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTranslator;

impl AddressTranslator for IdentityTranslator {
    fn translate(&self, address: AddressPort) -> AddressPort {
        address
    }
}

/// A static translation table. Addresses absent from the map pass
/// through unchanged.
impl AddressTranslator for HashMap<AddressPort, AddressPort> {
    fn translate(&self, address: AddressPort) -> AddressPort {
        self.get(&address).copied().unwrap_or(address)
    }
}

impl<F> AddressTranslator for F
where
    F: Fn(AddressPort) -> AddressPort + Send + Sync,
{
    fn translate(&self, address: AddressPort) -> AddressPort {
        self(address)
    }
}
