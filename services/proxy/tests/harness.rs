//! Test harness for forward proxy integration tests.
//!
//! Provides helpers to spawn echo and HTTP upstreams, an in-process proxy
//! with pinned name resolution, and raw-socket client helpers.

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

use rotor_networking::{AddressAllocator, EntropySource, NetworkBlock, SystemEntropy};
use rotor_proxy::proxy::{
    Connect, HttpTransport, Lookup, SystemLookup, TcpConnector, DEFAULT_HEADER_READ_TIMEOUT,
};
use rotor_proxy::{
    Credentials, DestinationResolver, Dispatcher, Listener, ListenerConfig, ProxyError,
};

/// Egress block used by every test proxy.
pub const TEST_BLOCK: &str = "2001:db8::/32";

pub const TEST_USER: &str = "alice";
pub const TEST_PASS: &str = "s3cret";

#[allow(dead_code)]
pub struct TcpEchoBackend {
    pub addr: SocketAddr,
    pub connections: Arc<AtomicU64>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl TcpEchoBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connections = Arc::new(AtomicU64::new(0));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();

        let conn_clone = Arc::clone(&connections);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                conn_clone.fetch_add(1, Ordering::Relaxed);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) => break,
                                            Ok(n) => {
                                                if stream.write_all(&buf[..n]).await.is_err() {
                                                    break;
                                                }
                                            }
                                            Err(_) => break,
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            connections,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

impl Drop for TcpEchoBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// HTTP/1.1 upstream answering every request with a fixed body and
/// recording each request head.
#[allow(dead_code)]
pub struct HttpUpstream {
    pub addr: SocketAddr,
    pub requests: Arc<Mutex<Vec<String>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl HttpUpstream {
    pub async fn spawn(body: &'static str) -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let requests_clone = Arc::clone(&requests);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                let requests = Arc::clone(&requests_clone);
                                tokio::spawn(async move {
                                    let Ok(head) = read_head(&mut stream).await else {
                                        return;
                                    };
                                    requests.lock().unwrap().push(head);
                                    let response = format!(
                                        "HTTP/1.1 200 OK\r\n\
                                         Content-Length: {}\r\n\
                                         X-Upstream: rotor-test\r\n\
                                         Connection: close\r\n\r\n{}",
                                        body.len(),
                                        body
                                    );
                                    let _ = stream.write_all(response.as_bytes()).await;
                                    let _ = stream.shutdown().await;
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            requests,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn recorded(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

impl Drop for HttpUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Name lookup with pinned entries, falling back to the system resolver.
#[derive(Default)]
pub struct StaticLookup {
    hosts: HashMap<String, Vec<IpAddr>>,
}

impl StaticLookup {
    pub fn with(mut self, host: &str, addr: &str) -> Self {
        self.hosts
            .entry(host.to_string())
            .or_default()
            .push(addr.parse().unwrap());
        self
    }
}

#[async_trait]
impl Lookup for StaticLookup {
    async fn lookup(&self, host: &str) -> io::Result<Vec<IpAddr>> {
        match self.hosts.get(host) {
            Some(addrs) => Ok(addrs.clone()),
            None => SystemLookup.lookup(host).await,
        }
    }
}

pub type DialLog = Arc<Mutex<Vec<(SocketAddr, Option<IpAddr>)>>>;

/// Records every dial. With `redirect` set, dials go there unbound instead,
/// so rotated-source tunnels work on hosts without the block routed.
pub struct RecordingConnector {
    dials: DialLog,
    redirect: Option<SocketAddr>,
    inner: TcpConnector,
}

#[async_trait]
impl Connect for RecordingConnector {
    async fn connect(
        &self,
        target: SocketAddr,
        source: Option<IpAddr>,
    ) -> Result<TcpStream, ProxyError> {
        self.dials.lock().unwrap().push((target, source));
        match self.redirect {
            Some(addr) => self.inner.connect(addr, None).await,
            None => self.inner.connect(target, source).await,
        }
    }
}

/// System entropy that counts how often it is drawn from.
#[derive(Default)]
pub struct CountingEntropy {
    calls: Arc<AtomicU64>,
}

impl EntropySource for CountingEntropy {
    fn fill_bytes(&self, dest: &mut [u8]) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        SystemEntropy.fill_bytes(dest);
    }
}

/// In-process proxy bound to loopback.
#[allow(dead_code)]
pub struct ProxyHandle {
    pub listen_addr: SocketAddr,
    pub listener: Arc<Listener>,
    pub block: NetworkBlock,
    pub dials: DialLog,
    pub entropy_draws: Arc<AtomicU64>,
}

impl ProxyHandle {
    pub async fn spawn(
        credentials: Option<Credentials>,
        lookup: StaticLookup,
        redirect: Option<SocketAddr>,
    ) -> io::Result<Self> {
        Self::spawn_with_timeout(credentials, lookup, redirect, DEFAULT_HEADER_READ_TIMEOUT).await
    }

    /// Like [`ProxyHandle::spawn`], with a custom head read timeout. The same
    /// timeout bounds how long unanswered connections are held.
    pub async fn spawn_with_timeout(
        credentials: Option<Credentials>,
        lookup: StaticLookup,
        redirect: Option<SocketAddr>,
        header_read_timeout: Duration,
    ) -> io::Result<Self> {
        let block: NetworkBlock = TEST_BLOCK.parse().unwrap();
        let dials = DialLog::default();
        let entropy = CountingEntropy::default();
        let entropy_draws = Arc::clone(&entropy.calls);

        let dispatcher = Dispatcher::with_components(
            block,
            credentials,
            AddressAllocator::new(Arc::new(entropy)),
            DestinationResolver::new(lookup),
            RecordingConnector {
                dials: Arc::clone(&dials),
                redirect,
                inner: TcpConnector::with_timeout(Duration::from_secs(2)),
            },
            HttpTransport::new().map_err(io::Error::other)?,
        );

        let mut config = ListenerConfig::new("127.0.0.1:0".parse().unwrap());
        config.header_read_timeout = header_read_timeout;
        let listener = Listener::bind(config, Arc::new(dispatcher)).await?;

        let listen_addr = listener.local_addr()?;
        let listener = Arc::new(listener);

        let runner = Arc::clone(&listener);
        tokio::spawn(async move {
            let _ = runner.run().await;
        });

        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            listen_addr,
            listener,
            block,
            dials,
            entropy_draws,
        })
    }

    pub async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(self.listen_addr).await
    }

    pub fn dials(&self) -> Vec<(SocketAddr, Option<IpAddr>)> {
        self.dials.lock().unwrap().clone()
    }

    pub fn entropy_draws(&self) -> u64 {
        self.entropy_draws.load(Ordering::Relaxed)
    }
}

pub fn test_credentials() -> Option<Credentials> {
    Credentials::from_parts(TEST_USER, TEST_PASS)
}

pub fn basic(user: &str, pass: &str) -> String {
    format!("Basic {}", STANDARD.encode(format!("{}:{}", user, pass)))
}

/// Send a CONNECT head.
pub async fn send_connect(
    stream: &mut TcpStream,
    authority: &str,
    auth: Option<&str>,
    proto: &str,
) -> io::Result<()> {
    let mut head = format!("CONNECT {} {}\r\nHost: {}\r\n", authority, proto, authority);
    if let Some(auth) = auth {
        head.push_str(&format!("Proxy-Authorization: {}\r\n", auth));
    }
    head.push_str("\r\n");
    stream.write_all(head.as_bytes()).await
}

/// Read up to and including the blank line ending a head. Returns whatever
/// arrived if the peer closes first.
pub async fn read_head(stream: &mut TcpStream) -> io::Result<String> {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        if stream.read(&mut byte).await? == 0 {
            break;
        }
        head.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&head).to_string())
}

/// Read one response: head, then a `Content-Length` body or everything up
/// to EOF.
pub async fn read_response(stream: &mut TcpStream) -> io::Result<(String, Vec<u8>)> {
    let head = read_head(stream).await?;
    let content_length = head.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        if name.trim().eq_ignore_ascii_case("content-length") {
            value.trim().parse::<usize>().ok()
        } else {
            None
        }
    });

    let mut body = Vec::new();
    match content_length {
        Some(len) => {
            body.resize(len, 0);
            stream.read_exact(&mut body).await?;
        }
        None => {
            stream.read_to_end(&mut body).await?;
        }
    }
    Ok((head, body))
}
