//! Host name resolution boundary
//!
//! Sessions may be created with only a host name or only an address. The
//! missing half is looked up through a [`NameResolver`]; DNS and NetBIOS
//! name-service traffic itself is not implemented here.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// NetBIOS name suffix identifying the service a name is registered for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NameServiceType {
    WorkStation,
    Messenger,
    FileServer,
    DomainMaster,
}

impl NameServiceType {
    /// The suffix byte appended to the 15-character NetBIOS name
    pub fn suffix(&self) -> u8 {
        match self {
            Self::WorkStation => 0x00,
            Self::Messenger => 0x03,
            Self::FileServer => 0x20,
            Self::DomainMaster => 0x1B,
        }
    }

    pub fn from_suffix(suffix: u8) -> Option<Self> {
        match suffix {
            0x00 => Some(Self::WorkStation),
            0x03 => Some(Self::Messenger),
            0x20 => Some(Self::FileServer),
            0x1B => Some(Self::DomainMaster),
            _ => None,
        }
    }
}

impl fmt::Display for NameServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::WorkStation => "workstation",
            Self::Messenger => "messenger",
            Self::FileServer => "file server",
            Self::DomainMaster => "domain master",
        };
        f.write_str(s)
    }
}

/// One NetBIOS name-service record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetBiosEntry {
    pub name: String,
    pub group: String,
    pub service_type: NameServiceType,
    pub address: String,
}

/// Name lookup failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    #[error("no address found for {0}")]
    NotFound(String),
    #[error("lookup is not supported by this resolver")]
    Unsupported,
    #[error("lookup failed: {0}")]
    Failed(String),
}

/// Forward, reverse and NetBIOS lookups
pub trait NameResolver: Send + Sync {
    /// IP address text for a host name
    fn address_for_hostname(&self, host_name: &str) -> Result<String, ResolveError>;

    /// Host name for an IP address
    fn hostname_for_address(&self, address: &str) -> Result<String, ResolveError>;

    /// NetBIOS name-service record for a name
    fn netbios_lookup(&self, name: &str) -> Result<NetBiosEntry, ResolveError>;
}

/// Resolver backed by the operating system's forward lookup
///
/// Reverse and NetBIOS lookups need protocol traffic this crate does not
/// speak, so they report [`ResolveError::Unsupported`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl NameResolver for SystemResolver {
    fn address_for_hostname(&self, host_name: &str) -> Result<String, ResolveError> {
        if is_valid_ip_address(host_name) {
            return Ok(host_name.to_string());
        }
        let addrs = (host_name, 0)
            .to_socket_addrs()
            .map_err(|e| ResolveError::Failed(e.to_string()))?;

        // Prefer IPv4; many NAS devices only listen there
        let mut first = None;
        for addr in addrs {
            if addr.is_ipv4() {
                debug!(host = host_name, address = %addr.ip(), "resolved host");
                return Ok(addr.ip().to_string());
            }
            first.get_or_insert(addr.ip());
        }
        first
            .map(|ip| ip.to_string())
            .ok_or_else(|| ResolveError::NotFound(host_name.to_string()))
    }

    fn hostname_for_address(&self, _address: &str) -> Result<String, ResolveError> {
        Err(ResolveError::Unsupported)
    }

    fn netbios_lookup(&self, _name: &str) -> Result<NetBiosEntry, ResolveError> {
        Err(ResolveError::Unsupported)
    }
}

// =============================================================================
// IP literal validation
// =============================================================================

pub fn is_valid_ipv4(address: &str) -> bool {
    address.parse::<Ipv4Addr>().is_ok()
}

pub fn is_valid_ipv6(address: &str) -> bool {
    let trimmed = address.trim_start_matches('[').trim_end_matches(']');
    trimmed.parse::<Ipv6Addr>().is_ok()
}

/// True when `address` is an IPv4 or IPv6 literal
pub fn is_valid_ip_address(address: &str) -> bool {
    address.parse::<IpAddr>().is_ok() || is_valid_ipv6(address)
}
