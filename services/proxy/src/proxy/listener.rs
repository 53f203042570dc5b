//! TCP listener and connection handling.
//!
//! Each accepted connection gets its own task. The first request head is
//! sniffed: a CONNECT is answered on the raw socket with fixed status lines
//! and then relayed; anything else is handed to a hyper HTTP/1 connection,
//! which serves the rest of the keep-alive session. A CONNECT arriving later
//! on such a session goes through hyper's upgrade mechanism.
//!
//! A CONNECT that cannot be resolved or given a source address gets no
//! answer at all: the socket is held until the client gives up or the head
//! read timeout passes.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::header::{CONNECTION, CONTENT_TYPE, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn, Instrument};

use super::auth::PROXY_AUTHENTICATE as PROXY_AUTHENTICATE_CHALLENGE;
use super::dispatcher::{Outcome, ProxyHandler, TunnelRequest};
use super::prefixed::PrefixedStream;
use super::relay::{relay, RelayStats};
use super::transport::{empty_body, full_body, BoxError, ProxyBody};

/// Default maximum concurrent connections per listener.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default time allowed for the first request head to arrive.
pub const DEFAULT_HEADER_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Largest first request head inspected before handing off to hyper.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Most headers inspected in the first request head.
const MAX_HEADERS: usize = 64;

/// Sent on a CONNECT that fails the credential check.
const TUNNEL_AUTH_REQUIRED: &str = "HTTP/1.1 407 Proxy Authentication Required\r\n\
     Proxy-Authenticate: Basic realm=\"Proxy\"\r\n\r\n";

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Time allowed for the first request head.
    pub header_read_timeout: Duration,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
        }
    }
}

/// Statistics for a listener.
#[derive(Debug, Default)]
pub struct ListenerStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Total connections currently active.
    pub connections_active: AtomicU64,
    /// Total connections closed.
    pub connections_closed: AtomicU64,
    /// Connections rejected due to max limit.
    pub connections_rejected: AtomicU64,
    /// CONNECT tunnels confirmed with 200.
    pub tunnels_established: AtomicU64,
    /// Plain requests answered with an upstream response.
    pub requests_forwarded: AtomicU64,
    /// Requests and tunnels answered with an error status.
    pub requests_denied: AtomicU64,
    /// Requests and tunnels dropped without a response.
    pub requests_abandoned: AtomicU64,
    /// Tunnel bytes sent to servers.
    pub bytes_to_server: AtomicU64,
    /// Tunnel bytes sent to clients.
    pub bytes_to_client: AtomicU64,
}

impl ListenerStats {
    fn record_relay(&self, stats: RelayStats) {
        self.bytes_to_server
            .fetch_add(stats.bytes_to_server, Ordering::Relaxed);
        self.bytes_to_client
            .fetch_add(stats.bytes_to_client, Ordering::Relaxed);
    }
}

/// A TCP listener for the forward proxy.
pub struct Listener {
    /// The TCP listener.
    listener: TcpListener,
    /// Time allowed for the first request head.
    header_read_timeout: Duration,
    /// Request handling.
    handler: Arc<dyn ProxyHandler>,
    /// Connection semaphore for limiting concurrent connections.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<ListenerStats>,
}

impl Listener {
    /// Create a new listener.
    pub async fn bind(config: ListenerConfig, handler: Arc<dyn ProxyHandler>) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            "Listener bound"
        );

        Ok(Self {
            listener,
            header_read_timeout: config.header_read_timeout,
            handler,
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            stats: Arc::new(ListenerStats::default()),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get listener statistics.
    pub fn stats(&self) -> &ListenerStats {
        &self.stats
    }

    /// Run the listener, accepting and handling connections.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let local_addr = self.listener.local_addr()?;
        info!(bind_addr = %local_addr, "Listener started");

        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    let permit = match self.conn_semaphore.clone().try_acquire_owned() {
                        Ok(permit) => permit,
                        Err(_) => {
                            self.stats
                                .connections_rejected
                                .fetch_add(1, Ordering::Relaxed);
                            warn!(
                                peer_addr = %peer_addr,
                                "Connection rejected: max connections reached"
                            );
                            continue;
                        }
                    };

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);

                    tokio::spawn(
                        async move {
                            if let Err(e) = listener.handle_connection(stream).await {
                                debug!(error = %e, "Connection error");
                            }

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(tracing::info_span!("connection", peer = %peer_addr)),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    // Brief sleep to avoid tight loop on persistent errors
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Handle a single connection.
    async fn handle_connection(&self, mut client: TcpStream) -> io::Result<()> {
        let mut buf = BytesMut::with_capacity(4096);

        let head = match tokio::time::timeout(
            self.header_read_timeout,
            read_head(&mut client, &mut buf),
        )
        .await
        {
            Ok(result) => result?,
            Err(_) => {
                debug!("Timed out waiting for request head");
                return Ok(());
            }
        };

        match head {
            Head::Closed => Ok(()),
            Head::Connect { request, proto, len } => {
                let leftover = buf.split_off(len).freeze();
                self.handle_tunnel(client, request, proto, leftover).await
            }
            Head::Http => self.serve_http(client, buf.freeze()).await,
        }
    }

    /// Answer a first-request CONNECT on the raw socket.
    async fn handle_tunnel(
        &self,
        mut client: TcpStream,
        request: TunnelRequest,
        proto: &'static str,
        leftover: Bytes,
    ) -> io::Result<()> {
        match self.handler.handle_tunnel(request).await {
            Outcome::Tunnel(mut server) => {
                self.stats
                    .tunnels_established
                    .fetch_add(1, Ordering::Relaxed);
                client
                    .write_all(format!("{} 200 OK\r\n\r\n", proto).as_bytes())
                    .await?;
                // Bytes the client pipelined behind the CONNECT head.
                if !leftover.is_empty() {
                    server.write_all(&leftover).await?;
                }

                let mut stats = relay(client, server).await;
                stats.bytes_to_server += leftover.len() as u64;
                self.stats.record_relay(stats);
                Ok(())
            }
            Outcome::Deny { status, .. } => {
                self.stats.requests_denied.fetch_add(1, Ordering::Relaxed);
                client.write_all(tunnel_status_line(proto, status).as_bytes()).await?;
                client.shutdown().await
            }
            Outcome::Forward(response) => {
                self.stats.requests_denied.fetch_add(1, Ordering::Relaxed);
                client
                    .write_all(tunnel_status_line(proto, response.status()).as_bytes())
                    .await?;
                client.shutdown().await
            }
            Outcome::Abandon => {
                self.stats
                    .requests_abandoned
                    .fetch_add(1, Ordering::Relaxed);
                linger(client, self.header_read_timeout).await;
                Ok(())
            }
        }
    }

    /// Serve the connection as HTTP/1, replaying the bytes already read.
    async fn serve_http(&self, client: TcpStream, prefix: Bytes) -> io::Result<()> {
        let io = TokioIo::new(PrefixedStream::new(prefix, client));
        let handler = Arc::clone(&self.handler);
        let stats = Arc::clone(&self.stats);
        let hold = self.header_read_timeout;

        let service = service_fn(move |req: Request<Incoming>| {
            let handler = Arc::clone(&handler);
            let stats = Arc::clone(&stats);
            serve_request(handler, stats, hold, req)
        });

        http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(io, service)
            .with_upgrades()
            .await
            .map_err(io::Error::other)
    }
}

/// What the first request head turned out to be.
enum Head {
    /// Client closed before sending anything.
    Closed,
    /// A complete CONNECT head of `len` bytes.
    Connect {
        request: TunnelRequest,
        proto: &'static str,
        len: usize,
    },
    /// Anything else; hyper takes over.
    Http,
}

/// Read until the first request head is classified.
async fn read_head(stream: &mut TcpStream, buf: &mut BytesMut) -> io::Result<Head> {
    loop {
        if let Some(head) = classify(buf) {
            return Ok(head);
        }
        if buf.len() >= MAX_HEAD_SIZE {
            return Ok(Head::Http);
        }

        buf.reserve(4096);
        if stream.read_buf(buf).await? == 0 {
            return Ok(if buf.is_empty() {
                Head::Closed
            } else {
                Head::Http
            });
        }
    }
}

/// Classify a partial head, or `None` if more bytes are needed.
fn classify(buf: &[u8]) -> Option<Head> {
    if buf.is_empty() {
        return None;
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);
    let status = match req.parse(buf) {
        Ok(status) => status,
        // Malformed or oversized; hyper produces the error response.
        Err(_) => return Some(Head::Http),
    };

    match req.method {
        Some(method) if method != Method::CONNECT.as_str() => return Some(Head::Http),
        None => return None,
        Some(_) => {}
    }

    let len = match status {
        httparse::Status::Complete(len) => len,
        httparse::Status::Partial => return None,
    };

    let proto = match req.version {
        Some(0) => "HTTP/1.0",
        _ => "HTTP/1.1",
    };
    let proxy_authorization = req
        .headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(PROXY_AUTHORIZATION.as_str()))
        .and_then(|h| std::str::from_utf8(h.value).ok())
        .map(str::to_string);

    Some(Head::Connect {
        request: TunnelRequest {
            authority: req.path.unwrap_or_default().to_string(),
            proxy_authorization,
        },
        proto,
        len,
    })
}

/// Hold an unanswered connection until the client closes or `limit` passes.
async fn linger(mut client: TcpStream, limit: Duration) {
    let mut buf = [0u8; 1024];
    let drain = async {
        while let Ok(n) = client.read(&mut buf).await {
            if n == 0 {
                break;
            }
        }
    };
    if tokio::time::timeout(limit, drain).await.is_err() {
        debug!("Dropping unanswered connection");
    }
}

/// Status line (and challenge, for 407) written for a failed CONNECT.
fn tunnel_status_line(proto: &str, status: StatusCode) -> String {
    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        return TUNNEL_AUTH_REQUIRED.to_string();
    }
    format!(
        "{} {} {}\r\n\r\n",
        proto,
        status.as_u16(),
        status.canonical_reason().unwrap_or("Unknown")
    )
}

/// Handle one request on a hyper-served connection. An error makes hyper
/// drop the connection without writing a response.
async fn serve_request(
    handler: Arc<dyn ProxyHandler>,
    stats: Arc<ListenerStats>,
    hold: Duration,
    req: Request<Incoming>,
) -> io::Result<Response<ProxyBody>> {
    if req.method() == Method::CONNECT {
        return serve_upgrade(handler, stats, hold, req).await;
    }

    let req = req.map(|body| body.map_err(|e| Box::new(e) as BoxError).boxed_unsync());
    match handler.handle_forward(req).await {
        Outcome::Forward(response) => {
            stats.requests_forwarded.fetch_add(1, Ordering::Relaxed);
            Ok(response)
        }
        Outcome::Deny { status, body } => {
            stats.requests_denied.fetch_add(1, Ordering::Relaxed);
            Ok(deny_response(status, body))
        }
        Outcome::Tunnel(_) | Outcome::Abandon => {
            stats.requests_abandoned.fetch_add(1, Ordering::Relaxed);
            Err(io::Error::other("request abandoned"))
        }
    }
}

/// CONNECT on an established HTTP/1 session.
async fn serve_upgrade(
    handler: Arc<dyn ProxyHandler>,
    stats: Arc<ListenerStats>,
    hold: Duration,
    req: Request<Incoming>,
) -> io::Result<Response<ProxyBody>> {
    let request = TunnelRequest {
        authority: req
            .uri()
            .authority()
            .map(|a| a.to_string())
            .unwrap_or_default(),
        proxy_authorization: req
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    };

    match handler.handle_tunnel(request).await {
        Outcome::Tunnel(server) => {
            stats.tunnels_established.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(
                async move {
                    match hyper::upgrade::on(req).await {
                        Ok(upgraded) => {
                            let relayed = relay(TokioIo::new(upgraded), server).await;
                            stats.record_relay(relayed);
                        }
                        Err(e) => debug!(error = %e, "Upgrade failed"),
                    }
                }
                .in_current_span(),
            );
            Ok(Response::new(empty_body()))
        }
        Outcome::Deny { status, .. } => {
            stats.requests_denied.fetch_add(1, Ordering::Relaxed);
            Ok(tunnel_deny_response(status))
        }
        Outcome::Forward(response) => {
            stats.requests_denied.fetch_add(1, Ordering::Relaxed);
            Ok(tunnel_deny_response(response.status()))
        }
        Outcome::Abandon => {
            stats.requests_abandoned.fetch_add(1, Ordering::Relaxed);
            tokio::time::sleep(hold).await;
            Err(io::Error::new(io::ErrorKind::TimedOut, "CONNECT abandoned"))
        }
    }
}

/// Failed CONNECT on a hyper session: bare status, no body, then close.
fn tunnel_deny_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(empty_body());
    *response.status_mut() = status;
    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        response.headers_mut().insert(
            PROXY_AUTHENTICATE,
            HeaderValue::from_static(PROXY_AUTHENTICATE_CHALLENGE),
        );
    }
    response
        .headers_mut()
        .insert(CONNECTION, HeaderValue::from_static("close"));
    response
}

/// Plain-text error response; 407 carries the Basic challenge.
fn deny_response(status: StatusCode, body: String) -> Response<ProxyBody> {
    let mut response = Response::new(full_body(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if status == StatusCode::PROXY_AUTHENTICATION_REQUIRED {
        response.headers_mut().insert(
            PROXY_AUTHENTICATE,
            HeaderValue::from_static(PROXY_AUTHENTICATE_CHALLENGE),
        );
    }
    response
}
