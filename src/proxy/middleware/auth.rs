//! Proxy authentication middleware
//!
//! Handles Basic authentication for the proxy server.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hyper::header::{HeaderMap, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use hyper::{Response, StatusCode};
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::{PoolError, Result};

/// Raw 407 response written on hijacked CONNECT streams
pub const CHALLENGE_LINE: &[u8] =
    b"HTTP/1.1 407 Proxy Authentication Required\r\nProxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n";

const CHALLENGE: &str = "Basic realm=\"Proxy\"";

/// Configured username/password pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub username: String,
    pub password: String,
}

impl Credential {
    /// Build a credential from configuration values.
    ///
    /// Both empty means authentication is off; only one empty is rejected.
    pub fn from_parts(username: &str, password: &str) -> Result<Option<Self>> {
        match (username.is_empty(), password.is_empty()) {
            (true, true) => Ok(None),
            (false, false) => Ok(Some(Self {
                username: username.to_string(),
                password: password.to_string(),
            })),
            _ => Err(PoolError::InvalidConfig(
                "proxy username and password must be set together".into(),
            )),
        }
    }
}

/// Proxy authentication handler
#[derive(Clone)]
pub struct ProxyAuth {
    /// Expected credential; `None` disables authentication
    credential: Option<Credential>,
}

impl ProxyAuth {
    /// Create a new proxy auth handler
    pub fn new(credential: Option<Credential>) -> Self {
        Self { credential }
    }

    /// Create a disabled auth handler
    pub fn disabled() -> Self {
        Self { credential: None }
    }

    /// Check if authentication is enabled
    pub fn is_enabled(&self) -> bool {
        self.credential.is_some()
    }

    /// Validate the Proxy-Authorization header
    pub fn validate(&self, headers: &HeaderMap) -> Result<()> {
        let Some(expected) = &self.credential else {
            return Ok(());
        };

        let auth_str = headers
            .get(PROXY_AUTHORIZATION)
            .ok_or(PoolError::AuthenticationFailed)?
            .to_str()
            .map_err(|_| PoolError::AuthenticationFailed)?;

        // Parse "Basic <base64>"
        let encoded = auth_str
            .strip_prefix("Basic ")
            .ok_or(PoolError::AuthenticationFailed)?;

        let decoded = BASE64
            .decode(encoded)
            .map_err(|_| PoolError::AuthenticationFailed)?;

        let credentials = String::from_utf8(decoded).map_err(|_| PoolError::AuthenticationFailed)?;

        let (user, pass) = credentials
            .split_once(':')
            .ok_or(PoolError::AuthenticationFailed)?;

        // Evaluate both halves so the comparison time does not depend on
        // which field mismatched.
        let user_ok = user.as_bytes().ct_eq(expected.username.as_bytes());
        let pass_ok = pass.as_bytes().ct_eq(expected.password.as_bytes());

        if bool::from(user_ok & pass_ok) {
            debug!("Proxy authentication successful for user: {}", user);
            Ok(())
        } else {
            debug!("Proxy authentication failed for user: {}", user);
            Err(PoolError::AuthenticationFailed)
        }
    }

    /// Whether the request carries acceptable credentials
    pub fn is_authorized(&self, headers: &HeaderMap) -> bool {
        self.validate(headers).is_ok()
    }

    /// Create a 407 Proxy Authentication Required response
    pub fn challenge_response<T>(&self, body: T) -> Response<T> {
        let mut response = Response::new(body);
        *response.status_mut() = StatusCode::PROXY_AUTHENTICATION_REQUIRED;
        response
            .headers_mut()
            .insert(PROXY_AUTHENTICATE, hyper::header::HeaderValue::from_static(CHALLENGE));
        response
    }
}
