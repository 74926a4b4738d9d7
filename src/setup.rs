//! Privileged host preparation
//!
//! Binding arbitrary addresses from the prefix needs the kernel to accept
//! non-local binds and to route the whole prefix to the loopback device.

use std::fmt;

use ipnet::Ipv6Net;
use nix::unistd::geteuid;
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::config::SetupConfig;
use crate::error::{PoolError, Result};

/// One external command run during setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupCommand {
    pub program: &'static str,
    pub args: Vec<String>,
    /// A non-zero exit is logged and skipped
    pub ignore_failure: bool,
}

impl SetupCommand {
    fn new(program: &'static str, args: &[&str]) -> Self {
        Self {
            program,
            args: args.iter().map(|arg| arg.to_string()).collect(),
            ignore_failure: false,
        }
    }

    fn ignoring_failure(mut self) -> Self {
        self.ignore_failure = true;
        self
    }

    async fn run(&self) -> Result<()> {
        let output = Command::new(self.program)
            .args(&self.args)
            .output()
            .await
            .map_err(|e| PoolError::HostSetup(format!("{}: {}", self, e)))?;

        if output.status.success() {
            info!("{}", self);
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if self.ignore_failure {
            debug!("{} failed ({}), ignoring: {}", self, output.status, stderr.trim());
            Ok(())
        } else {
            Err(PoolError::HostSetup(format!(
                "{} exited with {}: {}",
                self,
                output.status,
                stderr.trim()
            )))
        }
    }
}

impl fmt::Display for SetupCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Ordered list of setup commands for one prefix
#[derive(Debug, Clone)]
pub struct HostSetup {
    commands: Vec<SetupCommand>,
}

impl HostSetup {
    pub fn from_config(setup: &SetupConfig, prefix: &Ipv6Net) -> Self {
        let mut commands = Vec::new();

        if setup.auto_forwarding {
            commands.push(SetupCommand::new(
                "sysctl",
                &["-w", "net.ipv6.conf.all.forwarding=1"],
            ));
        }

        if setup.auto_ip_nonlocal_bind {
            commands.push(SetupCommand::new(
                "sysctl",
                &["-w", "net.ipv6.ip_nonlocal_bind=1"],
            ));
        }

        if setup.auto_route {
            let cidr = prefix.trunc().to_string();
            // A stale route from a previous run may or may not exist.
            commands.push(
                SetupCommand::new("ip", &["route", "del", "local", cidr.as_str(), "dev", "lo"])
                    .ignoring_failure(),
            );
            commands.push(SetupCommand::new(
                "ip",
                &["route", "add", "local", cidr.as_str(), "dev", "lo"],
            ));
        }

        Self { commands }
    }

    pub fn commands(&self) -> &[SetupCommand] {
        &self.commands
    }

    /// Run every planned command in order, stopping at the first failure.
    #[instrument(skip(self))]
    pub async fn apply(&self) -> Result<()> {
        if self.commands.is_empty() {
            debug!("Host setup disabled");
            return Ok(());
        }

        if !geteuid().is_root() {
            return Err(PoolError::HostSetup(
                "root privileges are required for automatic host setup; \
                 run as root or disable auto-route, auto-forwarding and auto-ip-nonlocal-bind"
                    .into(),
            ));
        }

        for command in &self.commands {
            command.run().await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prefix() -> Ipv6Net {
        "2001:db8::1/64".parse().unwrap()
    }

    fn all_enabled() -> SetupConfig {
        SetupConfig {
            auto_route: true,
            auto_forwarding: true,
            auto_ip_nonlocal_bind: true,
        }
    }

    #[test]
    fn test_full_plan_order() {
        let setup = HostSetup::from_config(&all_enabled(), &prefix());
        let lines: Vec<String> = setup.commands().iter().map(|c| c.to_string()).collect();

        assert_eq!(
            lines,
            vec![
                "sysctl -w net.ipv6.conf.all.forwarding=1",
                "sysctl -w net.ipv6.ip_nonlocal_bind=1",
                "ip route del local 2001:db8::/64 dev lo",
                "ip route add local 2001:db8::/64 dev lo",
            ]
        );

        let ignored: Vec<bool> = setup.commands().iter().map(|c| c.ignore_failure).collect();
        assert_eq!(ignored, vec![false, false, true, false]);
    }

    #[test]
    fn test_partial_plan() {
        let config = SetupConfig {
            auto_route: true,
            auto_forwarding: false,
            auto_ip_nonlocal_bind: false,
        };
        let setup = HostSetup::from_config(&config, &prefix());
        assert_eq!(setup.commands().len(), 2);
        assert!(setup.commands().iter().all(|c| c.program == "ip"));
    }

    #[tokio::test]
    async fn test_disabled_setup_is_a_no_op() {
        let config = SetupConfig {
            auto_route: false,
            auto_forwarding: false,
            auto_ip_nonlocal_bind: false,
        };
        assert!(!config.any_enabled());

        let setup = HostSetup::from_config(&config, &prefix());
        assert!(setup.commands().is_empty());
        setup.apply().await.unwrap();
    }

    #[tokio::test]
    async fn test_enabled_setup_requires_root() {
        if geteuid().is_root() {
            return;
        }

        let setup = HostSetup::from_config(&all_enabled(), &prefix());
        assert!(matches!(setup.apply().await, Err(PoolError::HostSetup(_))));
    }
}
