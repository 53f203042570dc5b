//! Networking utilities for the egress proxy.
//!
//! This library provides helpers for:
//! - Parsing CIDR network blocks of either address family
//! - Randomized egress address allocation inside an IPv6 block

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use std::sync::Arc;

use rand::RngCore;
use thiserror::Error;

/// Networking errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NetworkError {
    /// Invalid IP address.
    #[error("invalid IP address: {0}")]
    InvalidAddress(String),

    /// Invalid CIDR prefix.
    #[error("invalid CIDR prefix: {0}")]
    InvalidPrefix(String),

    /// Block belongs to the wrong address family for egress allocation.
    #[error("expected an IPv6 network, got {0}")]
    WrongFamily(String),
}

// ============================================================================
// Network blocks
// ============================================================================

/// A network block in CIDR form.
///
/// Both families parse so that the family check can be reported precisely
/// where the block is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NetworkBlock {
    /// Network address, masked to the prefix.
    pub address: IpAddr,

    /// Prefix length (e.g., 32 for /32).
    pub prefix_len: u8,
}

impl NetworkBlock {
    /// Create a new block, masking host bits off `address`.
    pub fn new(address: IpAddr, prefix_len: u8) -> Result<Self, NetworkError> {
        let max = max_prefix_len(address);
        if prefix_len > max {
            return Err(NetworkError::InvalidPrefix(format!(
                "prefix length {} exceeds {}",
                prefix_len, max
            )));
        }

        let address = match address {
            IpAddr::V4(v4) => IpAddr::V4(Ipv4Addr::from(u32::from(v4) & mask_v4(prefix_len))),
            IpAddr::V6(v6) => IpAddr::V6(Ipv6Addr::from(u128::from(v6) & mask_v6(prefix_len))),
        };

        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Parse from CIDR notation (e.g., "2001:db8::/32").
    pub fn from_cidr(s: &str) -> Result<Self, NetworkError> {
        let s = s.trim();
        let Some((addr_str, prefix_str)) = s.split_once('/') else {
            return Err(NetworkError::InvalidPrefix(format!(
                "missing '/' in CIDR: {}",
                s
            )));
        };

        let address = IpAddr::from_str(addr_str)
            .map_err(|_| NetworkError::InvalidAddress(addr_str.to_string()))?;

        let prefix_len = prefix_str
            .parse::<u8>()
            .map_err(|_| NetworkError::InvalidPrefix(prefix_str.to_string()))?;

        Self::new(address, prefix_len)
    }

    /// Whether the block is IPv6.
    pub fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// The IPv6 network address, or `WrongFamily` for an IPv4 block.
    pub fn ipv6_network(&self) -> Result<Ipv6Addr, NetworkError> {
        match self.address {
            IpAddr::V6(v6) => Ok(v6),
            IpAddr::V4(_) => Err(NetworkError::WrongFamily(self.to_string())),
        }
    }

    /// The mask for this block as a full-width IPv6 value.
    ///
    /// Only meaningful for IPv6 blocks.
    pub fn ipv6_mask(&self) -> u128 {
        mask_v6(self.prefix_len)
    }

    /// Check if an address is within this block.
    ///
    /// Addresses of the other family are never contained.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self.address, addr) {
            (IpAddr::V4(net), IpAddr::V4(a)) => {
                u32::from(a) & mask_v4(self.prefix_len) == u32::from(net)
            }
            (IpAddr::V6(net), IpAddr::V6(a)) => {
                u128::from(a) & mask_v6(self.prefix_len) == u128::from(net)
            }
            _ => false,
        }
    }
}

impl FromStr for NetworkBlock {
    type Err = NetworkError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_cidr(s)
    }
}

impl std::fmt::Display for NetworkBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

fn max_prefix_len(addr: IpAddr) -> u8 {
    match addr {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn mask_v4(prefix_len: u8) -> u32 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 32 {
        u32::MAX
    } else {
        u32::MAX << (32 - prefix_len)
    }
}

fn mask_v6(prefix_len: u8) -> u128 {
    if prefix_len == 0 {
        0
    } else if prefix_len >= 128 {
        u128::MAX
    } else {
        u128::MAX << (128 - prefix_len)
    }
}

// ============================================================================
// Egress address allocation
// ============================================================================

/// Source of random bytes for address allocation.
pub trait EntropySource: Send + Sync {
    /// Fill `dest` with random bytes.
    fn fill_bytes(&self, dest: &mut [u8]);
}

/// Entropy from the thread-local CSPRNG (seeded from the OS).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEntropy;

impl EntropySource for SystemEntropy {
    fn fill_bytes(&self, dest: &mut [u8]) {
        rand::rng().fill_bytes(dest);
    }
}

/// Randomized IPv6 address allocator.
///
/// Unlike a sequential pool, every call draws a fresh address, so nothing is
/// tracked between allocations and the allocator never runs out.
#[derive(Clone)]
pub struct AddressAllocator {
    entropy: Arc<dyn EntropySource>,
}

impl AddressAllocator {
    /// Create an allocator drawing from `entropy`.
    pub fn new(entropy: Arc<dyn EntropySource>) -> Self {
        Self { entropy }
    }

    /// Allocate a random address inside `block`.
    ///
    /// Prefix bits are copied from the block; every host bit comes from a
    /// freshly drawn 128-bit random value.
    pub fn allocate(&self, block: &NetworkBlock) -> Result<Ipv6Addr, NetworkError> {
        let network = u128::from(block.ipv6_network()?);
        let mask = block.ipv6_mask();

        let mut random = [0u8; 16];
        self.entropy.fill_bytes(&mut random);
        let random = u128::from_be_bytes(random);

        Ok(Ipv6Addr::from((network & mask) | (random & !mask)))
    }

    /// Parse `cidr` and allocate a random address inside it.
    pub fn allocate_cidr(&self, cidr: &str) -> Result<Ipv6Addr, NetworkError> {
        self.allocate(&NetworkBlock::from_cidr(cidr)?)
    }
}

impl Default for AddressAllocator {
    fn default() -> Self {
        Self::new(Arc::new(SystemEntropy))
    }
}

impl std::fmt::Debug for AddressAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddressAllocator").finish_non_exhaustive()
    }
}
