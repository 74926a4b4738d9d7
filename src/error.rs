use hyper::StatusCode;
use thiserror::Error;

/// Unified error type for the v6pool proxy
#[derive(Error, Debug)]
pub enum PoolError {
    // Prefix errors (fatal at startup)
    #[error("Invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("Expected an IPv6 prefix, got {0}")]
    InvalidPrefixFamily(String),

    // Destination errors
    #[error("Resolution failed: {0}")]
    ResolutionFailed(String),

    #[error("No address found for {0}")]
    NoAddressFound(String),

    // Dial errors
    #[error("Dial failed: {0}")]
    DialFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    // Authentication errors
    #[error("Authentication failed")]
    AuthenticationFailed,

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Host setup failed: {0}")]
    HostSetup(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),
}

/// Result type alias for v6pool operations
pub type Result<T> = std::result::Result<T, PoolError>;

impl PoolError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            PoolError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 407 Proxy Authentication Required
            PoolError::AuthenticationFailed => StatusCode::PROXY_AUTHENTICATION_REQUIRED,

            // 502 Bad Gateway
            PoolError::ResolutionFailed(_)
            | PoolError::NoAddressFound(_)
            | PoolError::DialFailed(_)
            | PoolError::Tls(_)
            | PoolError::Http(_) => StatusCode::BAD_GATEWAY,

            // 504 Gateway Timeout
            PoolError::Timeout => StatusCode::GATEWAY_TIMEOUT,

            // 500 Internal Server Error
            PoolError::InvalidPrefix(_)
            | PoolError::InvalidPrefixFamily(_)
            | PoolError::InvalidConfig(_)
            | PoolError::HostSetup(_)
            | PoolError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// Convert from hyper errors
impl From<hyper::Error> for PoolError {
    fn from(err: hyper::Error) -> Self {
        PoolError::Http(err.to_string())
    }
}
