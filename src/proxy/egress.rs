use std::fmt;
use std::future::Future;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};
use tracing::{debug, instrument};

use crate::error::{PoolError, Result};
use crate::proxy::resolver::{unbracket, Destination, Resolver};
use crate::proxy::selector::AddressSelector;

/// Source address for one outbound connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressDecision {
    /// Let the kernel pick the default source address
    Local,
    /// Bind to this address before connecting
    Address(Ipv6Addr),
}

impl EgressDecision {
    /// Draw a fresh decision for a classified destination.
    pub fn for_destination(destination: &Destination, selector: &AddressSelector) -> Self {
        if destination.use_ipv6 {
            EgressDecision::Address(selector.select())
        } else {
            EgressDecision::Local
        }
    }
}

impl fmt::Display for EgressDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EgressDecision::Local => f.write_str("local net"),
            EgressDecision::Address(addr) => write!(f, "{}", addr),
        }
    }
}

/// Opens outbound TCP connections from a chosen source address
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, host: &str, port: u16, egress: EgressDecision) -> Result<TcpStream>;
}

/// Connector dialing real sockets
#[derive(Clone)]
pub struct TcpConnector {
    resolver: Arc<dyn Resolver>,
    connect_timeout: Option<Duration>,
}

impl TcpConnector {
    pub fn new(resolver: Arc<dyn Resolver>, connect_timeout: Option<Duration>) -> Self {
        Self {
            resolver,
            connect_timeout,
        }
    }

    async fn connect_direct(&self, host: &str, port: u16) -> Result<TcpStream> {
        let targets = self.resolver.lookup(host).await?;
        dial_first(host, port, targets, None).await
    }

    async fn connect_from(&self, host: &str, port: u16, source: Ipv6Addr) -> Result<TcpStream> {
        let targets: Vec<IpAddr> = self
            .resolver
            .lookup(host)
            .await?
            .into_iter()
            .filter(|addr| matches!(addr, IpAddr::V6(v6) if v6.to_ipv4_mapped().is_none()))
            .collect();

        dial_first(host, port, targets, Some(source)).await
    }
}

/// Try `targets` in order and return the first connection that succeeds.
async fn dial_first(
    host: &str,
    port: u16,
    targets: Vec<IpAddr>,
    source: Option<Ipv6Addr>,
) -> Result<TcpStream> {
    let mut last_error = None;
    for target in targets {
        let remote = SocketAddr::new(target, port);
        let attempt = match source {
            Some(source) => connect_bound(source, remote).await,
            None => TcpStream::connect(remote).await,
        };
        match attempt {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                debug!(%remote, ?source, error = %e, "Connect attempt failed");
                last_error = Some(e);
            }
        }
    }

    let target = format_tcp_addr(host, port);
    Err(match (last_error, source) {
        (Some(e), Some(source)) => {
            PoolError::DialFailed(format!("{} from {}: {}", target, source, e))
        }
        (Some(e), None) => PoolError::DialFailed(format!("{}: {}", target, e)),
        (None, Some(_)) => PoolError::DialFailed(format!("{} has no IPv6 address", host)),
        (None, None) => PoolError::DialFailed(format!("{} has no address", host)),
    })
}

#[async_trait]
impl Connector for TcpConnector {
    #[instrument(skip(self, egress), fields(egress = %egress))]
    async fn connect(&self, host: &str, port: u16, egress: EgressDecision) -> Result<TcpStream> {
        let host = unbracket(host);
        let dial = async {
            match egress {
                EgressDecision::Local => self.connect_direct(host, port).await,
                EgressDecision::Address(source) => self.connect_from(host, port, source).await,
            }
        };

        with_timeout(self.connect_timeout, dial).await
    }
}

/// Connect to `remote` with the local end bound to `source`.
///
/// Binding an address outside the host's configured ones needs the local
/// route and `ip_nonlocal_bind` set up by [`crate::setup::HostSetup`].
async fn connect_bound(source: Ipv6Addr, remote: SocketAddr) -> std::io::Result<TcpStream> {
    let socket = TcpSocket::new_v6()?;
    socket.bind(SocketAddr::new(IpAddr::V6(source), 0))?;
    socket.connect(remote).await
}

/// Run `fut`, bounded by `limit` when one is configured.
pub(crate) async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .map_err(|_| PoolError::Timeout)?,
        None => fut.await,
    }
}

pub(crate) fn format_tcp_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
