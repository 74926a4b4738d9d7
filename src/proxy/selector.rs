//! Random egress address selection inside an IPv6 prefix
//!
//! Every call draws a fresh address; nothing is cached between connections.

use std::net::Ipv6Addr;

use ipnet::{IpNet, Ipv6Net};
use rand::Rng;

use crate::error::{PoolError, Result};

/// Parse a CIDR string into an IPv6 prefix.
///
/// Malformed input fails with `InvalidPrefix`, a well-formed IPv4 network
/// with `InvalidPrefixFamily`.
pub fn parse_prefix(cidr: &str) -> Result<Ipv6Net> {
    let net: IpNet = cidr
        .trim()
        .parse()
        .map_err(|e| PoolError::InvalidPrefix(format!("'{}': {}", cidr, e)))?;

    match net {
        IpNet::V6(net) => Ok(net),
        IpNet::V4(net) => Err(PoolError::InvalidPrefixFamily(net.to_string())),
    }
}

/// Selects uniformly random addresses inside a fixed IPv6 prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressSelector {
    prefix: Ipv6Net,
}

impl AddressSelector {
    /// Create a selector; host bits of the given prefix are cleared.
    pub fn new(prefix: Ipv6Net) -> Self {
        Self {
            prefix: prefix.trunc(),
        }
    }

    /// Create a selector from a CIDR string
    pub fn from_cidr(cidr: &str) -> Result<Self> {
        parse_prefix(cidr).map(Self::new)
    }

    /// The (truncated) prefix addresses are drawn from
    pub fn prefix(&self) -> Ipv6Net {
        self.prefix
    }

    /// Draw an address using the calling thread's generator.
    ///
    /// `thread_rng` is seeded independently per thread from the OS and is
    /// never shared across threads, so concurrent callers need no locking.
    pub fn select(&self) -> Ipv6Addr {
        let mut rng = rand::thread_rng();
        self.select_with(&mut rng)
    }

    /// Draw an address using a caller-owned generator.
    pub fn select_with<R: Rng>(&self, rng: &mut R) -> Ipv6Addr {
        let host_mask = self.host_mask();
        let network = u128::from(self.prefix.network()) & !host_mask;
        let host_bits = rng.gen::<u128>() & host_mask;

        Ipv6Addr::from(network | host_bits)
    }

    /// Whether `addr` lies inside the prefix
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        self.prefix.contains(addr)
    }

    fn host_mask(&self) -> u128 {
        u128::MAX
            .checked_shr(u32::from(self.prefix.prefix_len()))
            .unwrap_or(0)
    }
}
