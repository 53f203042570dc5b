//! Proxy error taxonomy.
//!
//! Every variant is terminal for the request or connection that raised it.
//! Configuration problems never show up here; they abort startup through
//! `anyhow` in the binary.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use rotor_networking::NetworkError;
use thiserror::Error;

/// Errors raised while handling a single proxied request or tunnel.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Egress address allocation failed (malformed block or wrong family).
    #[error("failed to allocate egress address: {0}")]
    Allocation(#[from] NetworkError),

    /// Destination lookup failed or returned no usable address.
    #[error("failed to resolve {host}: {reason}")]
    Resolution { host: String, reason: String },

    /// Outbound dial did not complete in time.
    #[error("connection to {target} timed out after {elapsed:?}")]
    DialTimeout { target: SocketAddr, elapsed: Duration },

    /// Outbound dial failed.
    #[error("failed to connect to {target}: {source}")]
    Dial {
        target: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Upstream HTTP exchange failed.
    #[error("{0}")]
    Transport(String),

    /// The inbound request cannot be proxied as given.
    #[error("bad request: {0}")]
    BadRequest(String),
}

impl ProxyError {
    /// Create a resolution error.
    pub fn resolution(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolution {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Whether this is a dial timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::DialTimeout { .. })
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(err: reqwest::Error) -> Self {
        // reqwest keeps the useful part (refused, reset, dns) in the source chain.
        let mut message = err.to_string();
        let mut source = std::error::Error::source(&err);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self::Transport(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_context() {
        let err = ProxyError::resolution("example.test", "no addresses");
        assert_eq!(err.to_string(), "failed to resolve example.test: no addresses");

        let err = ProxyError::DialTimeout {
            target: "[2001:db8::1]:443".parse().unwrap(),
            elapsed: Duration::from_secs(30),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("[2001:db8::1]:443"));
    }

    #[test]
    fn test_allocation_wraps_network_error() {
        let err: ProxyError = NetworkError::WrongFamily("10.0.0.0/8".into()).into();
        assert!(matches!(err, ProxyError::Allocation(NetworkError::WrongFamily(_))));
        assert!(!err.is_timeout());
    }
}
