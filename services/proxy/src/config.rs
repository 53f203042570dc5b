//! Proxy configuration.
//!
//! Flags can also be supplied through `ROTOR_*` environment variables.

use std::net::{IpAddr, SocketAddr};

use anyhow::{bail, Context, Result};
use clap::Parser;
use rotor_networking::NetworkBlock;
use tracing::warn;

use crate::proxy::{Credentials, DEFAULT_MAX_CONNECTIONS};

/// Command-line arguments.
#[derive(Debug, Clone, Parser)]
#[command(name = "rotor-proxy")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// IPv6 block egress addresses are drawn from (e.g. 2001:db8::/48).
    #[arg(long, env = "ROTOR_CIDR")]
    pub cidr: Option<String>,

    /// Address to listen on.
    #[arg(long, env = "ROTOR_BIND", default_value = "0.0.0.0")]
    pub bind: IpAddr,

    /// Port to listen on.
    #[arg(long, env = "ROTOR_PORT", default_value_t = 33300)]
    pub port: u16,

    /// Proxy username; auth is enabled only when a password is also set.
    #[arg(long, env = "ROTOR_USERNAME", default_value = "")]
    pub username: String,

    /// Proxy password.
    #[arg(long, env = "ROTOR_PASSWORD", default_value = "", hide_env_values = true)]
    pub password: String,

    /// Enable IPv6 forwarding on startup.
    #[arg(long, env = "ROTOR_AUTO_FORWARDING")]
    pub auto_forwarding: bool,

    /// Add a local route for the block on startup.
    #[arg(long, env = "ROTOR_AUTO_ROUTE")]
    pub auto_route: bool,

    /// Enable IPv6 non-local bind on startup.
    #[arg(long, env = "ROTOR_AUTO_IP_NONLOCAL_BIND")]
    pub auto_ip_nonlocal_bind: bool,

    /// Maximum concurrent client connections.
    #[arg(long, env = "ROTOR_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error). RUST_LOG takes precedence.
    #[arg(long, env = "ROTOR_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

/// Validated proxy configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Egress block.
    pub block: NetworkBlock,

    /// Block text as given, for host route setup.
    pub cidr: String,

    /// Listen address.
    pub listen_addr: SocketAddr,

    /// Proxy credentials; `None` leaves the proxy open.
    pub credentials: Option<Credentials>,

    /// Enable IPv6 forwarding.
    pub auto_forwarding: bool,

    /// Add a local route for the block.
    pub auto_route: bool,

    /// Enable IPv6 non-local bind.
    pub auto_ip_nonlocal_bind: bool,

    /// Maximum concurrent client connections.
    pub max_connections: usize,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Validate parsed arguments.
    pub fn from_args(args: Args) -> Result<Self> {
        let cidr = match args.cidr.as_deref().map(str::trim) {
            Some(cidr) if !cidr.is_empty() => cidr.to_string(),
            _ => bail!("cidr is required"),
        };

        let block: NetworkBlock = cidr
            .parse()
            .with_context(|| format!("invalid cidr {:?}", cidr))?;
        if !block.is_ipv6() {
            warn!(cidr = %cidr, "Egress block is not IPv6; IPv6 destinations will fail allocation");
        }

        if args.max_connections == 0 {
            bail!("max-connections must be at least 1");
        }

        let credentials = Credentials::from_parts(&args.username, &args.password);
        if credentials.is_none() && (!args.username.is_empty() || !args.password.is_empty()) {
            warn!("Only one of username/password set; proxy authentication is disabled");
        }

        Ok(Self {
            block,
            cidr,
            listen_addr: SocketAddr::new(args.bind, args.port),
            credentials,
            auto_forwarding: args.auto_forwarding,
            auto_route: args.auto_route,
            auto_ip_nonlocal_bind: args.auto_ip_nonlocal_bind,
            max_connections: args.max_connections,
            log_level: args.log_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> Args {
        let mut argv = vec!["rotor-proxy"];
        argv.extend_from_slice(extra);
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_args(args(&["--cidr", "2001:db8::/48"])).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:33300".parse().unwrap());
        assert_eq!(config.block.prefix_len, 48);
        assert!(config.credentials.is_none());
        assert!(!config.auto_forwarding);
        assert!(!config.auto_route);
        assert!(!config.auto_ip_nonlocal_bind);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn test_all_flags() {
        let config = Config::from_args(args(&[
            "--cidr",
            "2001:db8:1::/64",
            "--bind",
            "::1",
            "--port",
            "8080",
            "--username",
            "alice",
            "--password",
            "s3cret",
            "--auto-forwarding",
            "--auto-route",
            "--auto-ip-nonlocal-bind",
            "--max-connections",
            "16",
        ]))
        .unwrap();

        assert_eq!(config.listen_addr, "[::1]:8080".parse().unwrap());
        assert_eq!(config.cidr, "2001:db8:1::/64");
        assert_eq!(config.credentials.unwrap().username(), "alice");
        assert!(config.auto_forwarding && config.auto_route && config.auto_ip_nonlocal_bind);
        assert_eq!(config.max_connections, 16);
    }

    #[test]
    fn test_cidr_required() {
        let err = Config::from_args(args(&[])).unwrap_err();
        assert_eq!(err.to_string(), "cidr is required");

        let err = Config::from_args(args(&["--cidr", "  "])).unwrap_err();
        assert_eq!(err.to_string(), "cidr is required");
    }

    #[test]
    fn test_invalid_cidr() {
        let err = Config::from_args(args(&["--cidr", "2001:db8::"])).unwrap_err();
        assert!(err.to_string().contains("invalid cidr"));
    }

    #[test]
    fn test_ipv4_block_accepted_at_startup() {
        let config = Config::from_args(args(&["--cidr", "192.0.2.0/24"])).unwrap();
        assert!(!config.block.is_ipv6());
    }

    #[test]
    fn test_partial_credentials_disable_auth() {
        let config =
            Config::from_args(args(&["--cidr", "2001:db8::/48", "--username", "alice"])).unwrap();
        assert!(config.credentials.is_none());
    }
}
