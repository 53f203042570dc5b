//! Outbound TCP dialing from an optional source address.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::net::{TcpSocket, TcpStream};
use tokio::time::timeout;

use crate::error::ProxyError;

/// Connect timeout for outbound connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// TCP keep-alive interval for bound outbound connections.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Opens outbound TCP connections.
#[async_trait]
pub trait Connect: Send + Sync + 'static {
    /// Connect to `target`, bound to `source` when given.
    async fn connect(&self, target: SocketAddr, source: Option<IpAddr>)
        -> Result<TcpStream, ProxyError>;
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    timeout: Duration,
}

impl TcpConnector {
    /// Create a connector with a custom connect timeout.
    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::with_timeout(DIAL_TIMEOUT)
    }
}

#[async_trait]
impl Connect for TcpConnector {
    async fn connect(
        &self,
        target: SocketAddr,
        source: Option<IpAddr>,
    ) -> Result<TcpStream, ProxyError> {
        let dial_err = |e| ProxyError::Dial { target, source: e };

        let socket = if target.is_ipv6() {
            TcpSocket::new_v6()
        } else {
            TcpSocket::new_v4()
        }
        .map_err(dial_err)?;

        socket.set_keepalive(true).map_err(dial_err)?;
        if let Some(ip) = source {
            // Binding outside the host's configured addresses needs a local
            // route for the block plus ip_nonlocal_bind.
            socket.bind(SocketAddr::new(ip, 0)).map_err(dial_err)?;
        }

        let started = Instant::now();
        match timeout(self.timeout, socket.connect(target)).await {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true).map_err(dial_err)?;
                Ok(stream)
            }
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::TimedOut => Err(ProxyError::DialTimeout {
                target,
                elapsed: started.elapsed(),
            }),
            Ok(Err(e)) => Err(dial_err(e)),
            Err(_) => Err(ProxyError::DialTimeout {
                target,
                elapsed: started.elapsed(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_connect_default_path() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpConnector::default().connect(addr, None).await.unwrap();
        assert_eq!(stream.peer_addr().unwrap(), addr);
    }

    #[tokio::test]
    async fn test_connect_bound_source() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let stream = TcpConnector::default()
            .connect(addr, Some(IpAddr::V4(Ipv4Addr::LOCALHOST)))
            .await
            .unwrap();
        assert_eq!(stream.local_addr().unwrap().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to get a port with nothing listening.
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let err = TcpConnector::default().connect(addr, None).await.unwrap_err();
        assert!(matches!(err, ProxyError::Dial { .. }));
        assert!(!err.is_timeout());
    }
}
