//! Destination family resolution.
//!
//! IPv6 destinations are reached from a rotated egress address; everything
//! else falls back to the host's default IPv4 path.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use async_trait::async_trait;
use tracing::debug;

use crate::error::ProxyError;

/// Name lookup backend.
#[async_trait]
pub trait Lookup: Send + Sync + 'static {
    /// Return every address `host` resolves to, in resolver order.
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>>;
}

/// System resolver via `tokio::net::lookup_host`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLookup;

#[async_trait]
impl Lookup for SystemLookup {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        // lookup_host needs a port; it is discarded.
        let addrs = tokio::net::lookup_host((host, 0)).await?;
        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Where a destination is reachable from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    /// Reachable over IPv6: dial from a rotated egress address.
    Rotated(Ipv6Addr),
    /// IPv4 only: dial from the default path.
    Default(Ipv4Addr),
}

impl Destination {
    /// The destination address.
    pub fn ip(&self) -> IpAddr {
        match self {
            Self::Rotated(v6) => IpAddr::V6(*v6),
            Self::Default(v4) => IpAddr::V4(*v4),
        }
    }

    /// Whether the rotated family is used.
    pub fn is_rotated(&self) -> bool {
        matches!(self, Self::Rotated(_))
    }
}

/// Picks the address family for a destination host.
#[derive(Debug, Clone)]
pub struct DestinationResolver<L = SystemLookup> {
    lookup: L,
}

impl<L: Lookup> DestinationResolver<L> {
    /// Create a resolver over `lookup`.
    pub fn new(lookup: L) -> Self {
        Self { lookup }
    }

    /// Resolve `host`, preferring the first IPv6 address over the first IPv4.
    ///
    /// Every call performs a fresh lookup.
    pub async fn resolve(&self, host: &str) -> Result<Destination, ProxyError> {
        let host = strip_brackets(host);

        let addrs = self
            .lookup
            .lookup(host)
            .await
            .map_err(|e| ProxyError::resolution(host, e.to_string()))?;

        let destination = select(&addrs)
            .ok_or_else(|| ProxyError::resolution(host, "no valid IP addresses found"))?;

        debug!(
            host = %host,
            address = %destination.ip(),
            rotated = destination.is_rotated(),
            candidates = addrs.len(),
            "Resolved destination"
        );

        Ok(destination)
    }
}

impl Default for DestinationResolver<SystemLookup> {
    fn default() -> Self {
        Self::new(SystemLookup)
    }
}

/// First native IPv6 address, else first IPv4 (mapped addresses count as v4).
fn select(addrs: &[IpAddr]) -> Option<Destination> {
    let v6 = addrs.iter().find_map(|addr| match addr {
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => Some(*v6),
        _ => None,
    });
    if let Some(v6) = v6 {
        return Some(Destination::Rotated(v6));
    }

    addrs
        .iter()
        .find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(v6) => v6.to_ipv4_mapped(),
        })
        .map(Destination::Default)
}

/// `[::1]` -> `::1`, as found in URI and CONNECT authorities.
fn strip_brackets(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
