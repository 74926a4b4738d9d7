//! Proxy server implementation
//!
//! This module provides the proxy server functionality including:
//! - Random egress address selection inside an IPv6 prefix
//! - Destination classification by address family
//! - CONNECT tunnels for HTTPS
//! - Plain HTTP forwarding from the selected source address, over TLS for
//!   `https://` targets

pub mod egress;
pub mod handler;
pub mod hooks;
pub mod middleware;
pub mod resolver;
pub mod selector;
pub mod server;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use egress::{Connector, EgressDecision, TcpConnector};
pub use handler::{ForwardHandler, ForwardOutcome};
pub use hooks::{EgressProxy, Intercept, ProxyHooks};
pub use resolver::{Classifier, Destination, Resolver, SystemResolver};
pub use selector::AddressSelector;
pub use server::{ProxyServer, ProxyServerBuilder};
pub use tunnel::{TunnelHandler, TunnelOutcome};
