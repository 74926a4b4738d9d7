//! Proxy middleware for authentication

mod auth;

pub use auth::{Credential, ProxyAuth, CHALLENGE_LINE};
