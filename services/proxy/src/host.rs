//! One-time host network setup.
//!
//! Binding outbound sockets to arbitrary addresses in the egress block needs
//! the block routed locally and non-local bind enabled. Each step is
//! optional and a failure only warns.

use std::process::Command;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::config::Config;

const IPV6_FORWARDING: &str = "/proc/sys/net/ipv6/conf/all/forwarding";
const IPV6_NONLOCAL_BIND: &str = "/proc/sys/net/ipv6/ip_nonlocal_bind";

/// Apply the toggles enabled in `config`.
pub fn prepare(config: &Config) {
    if config.auto_forwarding {
        match write_sysctl(IPV6_FORWARDING) {
            Ok(()) => info!("IPv6 forwarding enabled"),
            Err(e) => warn!(error = %e, "Failed to enable IPv6 forwarding"),
        }
    }

    if config.auto_route {
        match run_ip(&local_route_args(&config.cidr)) {
            Ok(()) => info!(cidr = %config.cidr, "Local route added"),
            Err(e) => warn!(cidr = %config.cidr, error = %e, "Failed to add local route"),
        }
    }

    if config.auto_ip_nonlocal_bind {
        match write_sysctl(IPV6_NONLOCAL_BIND) {
            Ok(()) => info!("IPv6 non-local bind enabled"),
            Err(e) => warn!(error = %e, "Failed to enable IPv6 non-local bind"),
        }
    }
}

/// `ip` arguments routing `cidr` to the loopback device.
fn local_route_args(cidr: &str) -> Vec<&str> {
    vec!["-6", "route", "add", "local", cidr, "dev", "lo"]
}

fn write_sysctl(path: &str) -> Result<()> {
    std::fs::write(path, "1").with_context(|| format!("failed to write {}", path))
}

/// Run an `ip` command and return result.
fn run_ip(args: &[&str]) -> Result<()> {
    let output = Command::new("ip")
        .args(args)
        .output()
        .context("failed to execute ip command")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        anyhow::bail!("ip {} failed: {}", args.join(" "), stderr.trim());
    }

    Ok(())
}
