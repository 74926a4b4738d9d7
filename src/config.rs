use crate::error::{PoolError, Result};
use crate::proxy::egress::format_tcp_addr;
use crate::proxy::middleware::Credential;
use crate::proxy::selector::parse_prefix;
use clap::Parser;
use std::env;
use std::time::Duration;

/// Command-line flags; every flag overrides its environment variable
#[derive(Parser, Debug, Default, Clone)]
#[command(name = "v6pool", version, about, long_about = None)]
pub struct Cli {
    /// IPv6 prefix to draw egress addresses from (e.g. 2001:db8::/64)
    #[arg(short, long, value_name = "CIDR")]
    pub cidr: Option<String>,

    /// Address to listen on
    #[arg(short, long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Port to listen on
    #[arg(short, long, value_name = "PORT")]
    pub port: Option<u16>,

    /// Basic auth username
    #[arg(short, long, value_name = "USER")]
    pub username: Option<String>,

    /// Basic auth password
    #[arg(long, value_name = "PASS")]
    pub password: Option<String>,

    /// Resolve/dial timeout in seconds, 0 disables it
    #[arg(long, value_name = "SECONDS")]
    pub connect_timeout: Option<u64>,

    /// Add a local route for the prefix on lo
    #[arg(long, value_name = "BOOL")]
    pub auto_route: Option<bool>,

    /// Enable net.ipv6.conf.all.forwarding
    #[arg(long, value_name = "BOOL")]
    pub auto_forwarding: Option<bool>,

    /// Enable net.ipv6.ip_nonlocal_bind
    #[arg(long, value_name = "BOOL")]
    pub auto_ip_nonlocal_bind: Option<bool>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL")]
    pub log_level: Option<String>,
}

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Proxy server configuration
    pub proxy: ProxyServerConfig,
    /// Host preparation steps run before listening
    pub setup: SetupConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct ProxyServerConfig {
    /// Host to bind to (default: 127.0.0.1)
    pub host: String,
    /// Port for the proxy server (default: 33300)
    pub port: u16,
    /// IPv6 prefix egress addresses are drawn from
    pub cidr: String,
    /// Authentication username, empty when auth is off
    pub username: String,
    /// Authentication password, empty when auth is off
    pub password: String,
    /// Bound on resolution and dialing; `None` waits indefinitely
    pub connect_timeout: Option<Duration>,
    /// Largest request head accepted from a client
    pub max_header_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupConfig {
    pub auto_route: bool,
    pub auto_forwarding: bool,
    pub auto_ip_nonlocal_bind: bool,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            proxy: ProxyServerConfig {
                host: get_env_or("PROXY_BIND", "127.0.0.1"),
                port: get_env_or("PROXY_PORT", "33300").parse().map_err(|_| {
                    PoolError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                cidr: get_env_or("PROXY_CIDR", ""),
                username: get_env_or("PROXY_USERNAME", ""),
                password: get_env_or("PROXY_PASSWORD", ""),
                connect_timeout: seconds(get_env_or("PROXY_CONNECT_TIMEOUT", "0").parse().map_err(
                    |_| {
                        PoolError::InvalidConfig(
                            "PROXY_CONNECT_TIMEOUT must be a number of seconds".into(),
                        )
                    },
                )?),
                max_header_size: get_env_or("PROXY_MAX_HEADER_SIZE", "65536")
                    .parse()
                    .map_err(|_| {
                        PoolError::InvalidConfig("PROXY_MAX_HEADER_SIZE must be a valid size".into())
                    })?,
            },
            setup: SetupConfig {
                auto_route: get_env_bool("AUTO_ROUTE", true)?,
                auto_forwarding: get_env_bool("AUTO_FORWARDING", true)?,
                auto_ip_nonlocal_bind: get_env_bool("AUTO_IP_NONLOCAL_BIND", true)?,
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Environment, then command-line overrides, then validation.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = Self::from_env()?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// Overwrite every value the command line sets explicitly.
    pub fn apply_cli(&mut self, cli: &Cli) {
        if let Some(cidr) = &cli.cidr {
            self.proxy.cidr = cidr.clone();
        }
        if let Some(bind) = &cli.bind {
            self.proxy.host = bind.clone();
        }
        if let Some(port) = cli.port {
            self.proxy.port = port;
        }
        if let Some(username) = &cli.username {
            self.proxy.username = username.clone();
        }
        if let Some(password) = &cli.password {
            self.proxy.password = password.clone();
        }
        if let Some(secs) = cli.connect_timeout {
            self.proxy.connect_timeout = seconds(secs);
        }
        if let Some(enabled) = cli.auto_route {
            self.setup.auto_route = enabled;
        }
        if let Some(enabled) = cli.auto_forwarding {
            self.setup.auto_forwarding = enabled;
        }
        if let Some(enabled) = cli.auto_ip_nonlocal_bind {
            self.setup.auto_ip_nonlocal_bind = enabled;
        }
        if let Some(level) = &cli.log_level {
            self.log.level = level.clone();
        }
    }

    /// Reject configurations the proxy cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.proxy.cidr.is_empty() {
            return Err(PoolError::InvalidConfig(
                "an IPv6 prefix is required (PROXY_CIDR or --cidr)".into(),
            ));
        }
        parse_prefix(&self.proxy.cidr)?;

        if self.proxy.port == 0 {
            return Err(PoolError::InvalidConfig(
                "PROXY_PORT must be between 1 and 65535".into(),
            ));
        }

        Credential::from_parts(&self.proxy.username, &self.proxy.password)?;

        if !matches!(self.log.format.as_str(), "pretty" | "json") {
            return Err(PoolError::InvalidConfig(format!(
                "LOG_FORMAT must be 'pretty' or 'json', got '{}'",
                self.log.format
            )));
        }

        Ok(())
    }

    /// Get the proxy server address
    pub fn proxy_addr(&self) -> String {
        format_tcp_addr(&self.proxy.host, self.proxy.port)
    }
}

impl SetupConfig {
    /// Whether any privileged step is enabled
    pub fn any_enabled(&self) -> bool {
        self.auto_route || self.auto_forwarding || self.auto_ip_nonlocal_bind
    }
}

fn seconds(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_bool(key: &str, default: bool) -> Result<bool> {
    match env::var(key) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(PoolError::InvalidConfig(format!(
                "{} must be a boolean, got '{}'",
                key, value
            ))),
        },
        Err(_) => Ok(default),
    }
}
