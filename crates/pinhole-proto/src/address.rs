//! Pinhole address parsing
//!
//! Pinholes only exist for IPv6. Remote hosts may be wildcarded: an absent or
//! empty host, or one starting with `*`, means "any peer".

use std::net::{IpAddr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// Address parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AddressError {
    #[error("Invalid IPv6 address: {0}")]
    InvalidAddress(String),

    #[error("Address family not supported for pinholes: {0}")]
    UnsupportedFamily(String),
}

/// Check whether a remote host string means "any peer"
pub fn is_wildcard_host(host: Option<&str>) -> bool {
    match host.map(str::trim) {
        None => true,
        Some(h) => h.is_empty() || h.starts_with('*'),
    }
}

/// Parse a host string into the IPv6 address a pinhole rule matches on
///
/// Surrounding whitespace and `[...]` brackets are accepted. IPv4 literals are
/// rejected with [`AddressError::UnsupportedFamily`].
pub fn parse_pinhole_addr(host: &str) -> Result<Ipv6Addr, AddressError> {
    let trimmed = host.trim();
    let bare = trimmed
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(trimmed);

    match IpAddr::from_str(bare) {
        Ok(IpAddr::V6(addr)) => Ok(addr),
        Ok(IpAddr::V4(_)) => Err(AddressError::UnsupportedFamily(host.to_string())),
        Err(_) => Err(AddressError::InvalidAddress(host.to_string())),
    }
}
