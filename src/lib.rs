//! v6pool - IPv6 egress-rotating forward proxy
//!
//! An HTTP/HTTPS forward proxy that gives every outbound connection to an
//! IPv6-reachable destination a fresh random source address from a
//! configured prefix.
//!
//! ## Features
//!
//! - CONNECT tunneling and plain HTTP forwarding
//! - Uniformly random egress addresses per connection
//! - IPv4-only destinations fall back to the default route
//! - Optional Basic proxy authentication
//! - Automatic host setup (non-local bind, local route, forwarding)

pub mod config;
pub mod error;
pub mod proxy;
pub mod setup;

pub use config::Config;
pub use error::{PoolError, Result};
