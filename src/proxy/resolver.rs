//! Destination classification
//!
//! Decides whether a target should be reached over IPv6 (rotated egress)
//! or IPv4 (default route) based on what the hostname resolves to.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::{PoolError, Result};
use crate::proxy::egress::with_timeout;

/// Hostname resolution
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Resolve a hostname (or IP literal) to its addresses, in resolver order
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>>;
}

/// Resolver backed by the system's `getaddrinfo`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn lookup(&self, host: &str) -> Result<Vec<IpAddr>> {
        let addrs = tokio::net::lookup_host((host, 0))
            .await
            .map_err(|e| PoolError::ResolutionFailed(format!("{}: {}", host, e)))?;

        Ok(addrs.map(|addr| addr.ip()).collect())
    }
}

/// Result of classifying a destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Destination {
    /// Representative address, for logging only
    pub address: IpAddr,
    /// Whether the destination should be dialed over IPv6
    pub use_ipv6: bool,
}

/// Classifies destinations by address family
#[derive(Clone)]
pub struct Classifier {
    resolver: Arc<dyn Resolver>,
    timeout: Option<Duration>,
}

impl Classifier {
    pub fn new(resolver: Arc<dyn Resolver>, timeout: Option<Duration>) -> Self {
        Self { resolver, timeout }
    }

    /// Resolve `host` and pick the family to dial it with.
    #[instrument(skip(self))]
    pub async fn classify(&self, host: &str) -> Result<Destination> {
        let host = unbracket(host);
        let addrs = with_timeout(self.timeout, self.resolver.lookup(host)).await?;

        let destination = pick_destination(&addrs)
            .ok_or_else(|| PoolError::NoAddressFound(host.to_string()))?;

        debug!(
            address = %destination.address,
            use_ipv6 = destination.use_ipv6,
            "Destination classified"
        );
        Ok(destination)
    }
}

/// IPv6 wins if present; IPv4-mapped IPv6 addresses count as IPv4.
fn pick_destination(addrs: &[IpAddr]) -> Option<Destination> {
    let v6 = addrs.iter().find_map(|addr| match addr {
        IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none() => Some(IpAddr::V6(*v6)),
        _ => None,
    });

    if let Some(address) = v6 {
        return Some(Destination {
            address,
            use_ipv6: true,
        });
    }

    addrs
        .iter()
        .find_map(|addr| match addr {
            IpAddr::V4(v4) => Some(IpAddr::V4(*v4)),
            IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4),
        })
        .map(|address| Destination {
            address,
            use_ipv6: false,
        })
}

/// Strip the brackets URIs put around IPv6 literals
pub(crate) fn unbracket(host: &str) -> &str {
    host.strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host)
}
