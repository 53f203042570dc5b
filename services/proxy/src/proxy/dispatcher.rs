//! Per-request proxy state machine.
//!
//! Both paths run the same pipeline: credential check, destination
//! resolution, egress source selection, then either an outbound dial
//! (CONNECT) or a single upstream exchange (everything else). The listener
//! turns the returned [`Outcome`] into bytes on the wire.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header::{HOST, PROXY_AUTHORIZATION};
use http::uri::Authority;
use http::{Request, Response, StatusCode, Uri};
use rotor_networking::{AddressAllocator, NetworkBlock};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::auth::Credentials;
use super::dial::{Connect, TcpConnector};
use super::resolver::{Destination, DestinationResolver, Lookup, SystemLookup};
use super::transport::{strip_hop_by_hop, HttpTransport, ProxyBody, Transport};
use crate::error::ProxyError;

/// A CONNECT request as read off the wire.
#[derive(Debug, Clone)]
pub struct TunnelRequest {
    /// Request target, `host:port`.
    pub authority: String,
    /// Raw `Proxy-Authorization` value, if sent.
    pub proxy_authorization: Option<String>,
}

/// What the listener should do with a request.
#[derive(Debug)]
pub enum Outcome {
    /// Relay this upstream response to the client.
    Forward(Response<ProxyBody>),
    /// Answer with an error status and a plain-text body.
    Deny { status: StatusCode, body: String },
    /// Confirm the tunnel and relay bytes over this stream.
    Tunnel(TcpStream),
    /// Write nothing and drop the connection.
    Abandon,
}

impl Outcome {
    fn deny(status: StatusCode, body: impl Into<String>) -> Self {
        Self::Deny {
            status,
            body: body.into(),
        }
    }
}

/// Request handling behind the listener.
#[async_trait]
pub trait ProxyHandler: Send + Sync + 'static {
    /// Handle a CONNECT request.
    async fn handle_tunnel(&self, request: TunnelRequest) -> Outcome;

    /// Handle any non-CONNECT request.
    async fn handle_forward(&self, request: Request<ProxyBody>) -> Outcome;
}

/// State carried through one request once the destination is known.
#[derive(Debug)]
struct RequestContext {
    host: String,
    destination: Destination,
    source: Option<IpAddr>,
    started: Instant,
}

impl RequestContext {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

/// The proxy's [`ProxyHandler`].
pub struct Dispatcher<L = SystemLookup, C = TcpConnector, T = HttpTransport> {
    block: NetworkBlock,
    credentials: Option<Credentials>,
    allocator: AddressAllocator,
    resolver: DestinationResolver<L>,
    connector: C,
    transport: T,
}

impl Dispatcher {
    /// Dispatcher using the system resolver, plain TCP dialing and `reqwest`.
    pub fn new(block: NetworkBlock, credentials: Option<Credentials>) -> Result<Self, ProxyError> {
        Ok(Self::with_components(
            block,
            credentials,
            AddressAllocator::default(),
            DestinationResolver::default(),
            TcpConnector::default(),
            HttpTransport::new()?,
        ))
    }
}

impl<L, C, T> Dispatcher<L, C, T>
where
    L: Lookup,
    C: Connect,
    T: Transport,
{
    /// Dispatcher over explicit components.
    pub fn with_components(
        block: NetworkBlock,
        credentials: Option<Credentials>,
        allocator: AddressAllocator,
        resolver: DestinationResolver<L>,
        connector: C,
        transport: T,
    ) -> Self {
        Self {
            block,
            credentials,
            allocator,
            resolver,
            connector,
            transport,
        }
    }

    fn authorized(&self, header: Option<&str>) -> bool {
        match &self.credentials {
            Some(credentials) => credentials.verify(header),
            None => true,
        }
    }

    /// Resolve `host` and pick the egress source for it.
    async fn prepare(&self, host: &str, started: Instant) -> Result<RequestContext, ProxyError> {
        let destination = self.resolver.resolve(host).await?;
        let source = match destination {
            Destination::Rotated(_) => Some(IpAddr::V6(self.allocator.allocate(&self.block)?)),
            Destination::Default(_) => None,
        };

        Ok(RequestContext {
            host: host.to_string(),
            destination,
            source,
            started,
        })
    }
}

#[async_trait]
impl<L, C, T> ProxyHandler for Dispatcher<L, C, T>
where
    L: Lookup,
    C: Connect,
    T: Transport,
{
    async fn handle_tunnel(&self, request: TunnelRequest) -> Outcome {
        let started = Instant::now();

        if !self.authorized(request.proxy_authorization.as_deref()) {
            debug!(authority = %request.authority, "CONNECT rejected: proxy authentication failed");
            return Outcome::deny(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                "Proxy Authentication Required",
            );
        }

        let (host, port) = match split_authority(&request.authority) {
            Ok(parts) => parts,
            Err(e) => {
                debug!(authority = %request.authority, error = %e, "CONNECT rejected");
                return Outcome::deny(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        let ctx = match self.prepare(&host, started).await {
            Ok(ctx) => ctx,
            Err(e) => {
                warn!(authority = %request.authority, error = %e, "CONNECT abandoned");
                return Outcome::Abandon;
            }
        };

        let target = SocketAddr::new(ctx.destination.ip(), port);
        match self.connector.connect(target, ctx.source).await {
            Ok(stream) => {
                info!(
                    authority = %request.authority,
                    address = %target,
                    source = ?ctx.source,
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    "Tunnel established"
                );
                Outcome::Tunnel(stream)
            }
            Err(e) => {
                if e.is_timeout() {
                    warn!(
                        authority = %request.authority,
                        address = %target,
                        source = ?ctx.source,
                        elapsed_ms = ctx.elapsed().as_millis() as u64,
                        "Dial timed out"
                    );
                } else {
                    warn!(
                        authority = %request.authority,
                        address = %target,
                        source = ?ctx.source,
                        elapsed_ms = ctx.elapsed().as_millis() as u64,
                        error = %e,
                        "Dial failed"
                    );
                }
                Outcome::deny(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }

    async fn handle_forward(&self, request: Request<ProxyBody>) -> Outcome {
        let started = Instant::now();

        let header = request
            .headers()
            .get(PROXY_AUTHORIZATION)
            .and_then(|value| value.to_str().ok());
        if !self.authorized(header) {
            debug!(uri = %request.uri(), "Request rejected: proxy authentication failed");
            return Outcome::deny(
                StatusCode::PROXY_AUTHENTICATION_REQUIRED,
                "Proxy Authentication Required",
            );
        }

        let (mut parts, body) = request.into_parts();
        strip_hop_by_hop(&mut parts.headers);

        let host = match absolute_target(&mut parts) {
            Ok(host) => host,
            Err(e) => {
                debug!(uri = %parts.uri, error = %e, "Request rejected");
                return Outcome::deny(StatusCode::BAD_REQUEST, e.to_string());
            }
        };

        let ctx = match self.prepare(&host, started).await {
            Ok(ctx) => ctx,
            Err(ProxyError::Allocation(e)) => {
                warn!(host = %host, error = %e, "Failed to generate outgoing IP");
                return Outcome::deny(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to generate outgoing IP",
                );
            }
            Err(e) => {
                warn!(host = %host, error = %e, "Failed to resolve host");
                return Outcome::deny(StatusCode::INTERNAL_SERVER_ERROR, "Failed to resolve host");
            }
        };

        let method = parts.method.clone();
        let uri = parts.uri.clone();
        match self
            .transport
            .forward(
                Request::from_parts(parts, body),
                ctx.destination.ip(),
                ctx.source,
            )
            .await
        {
            Ok(response) => {
                info!(
                    method = %method,
                    uri = %uri,
                    host = %ctx.host,
                    address = %ctx.destination.ip(),
                    source = ?ctx.source,
                    status = response.status().as_u16(),
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    "Request forwarded"
                );
                Outcome::Forward(response)
            }
            Err(e) => {
                warn!(
                    method = %method,
                    uri = %uri,
                    source = ?ctx.source,
                    elapsed_ms = ctx.elapsed().as_millis() as u64,
                    error = %e,
                    "Upstream request failed"
                );
                Outcome::deny(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
            }
        }
    }
}

/// Split a CONNECT target into host and port. Both are required.
fn split_authority(authority: &str) -> Result<(String, u16), ProxyError> {
    let parsed: Authority = authority
        .parse()
        .map_err(|_| ProxyError::BadRequest(format!("invalid CONNECT target: {}", authority)))?;
    let port = parsed
        .port_u16()
        .ok_or_else(|| {
            ProxyError::BadRequest(format!("CONNECT target has no port: {}", authority))
        })?;
    if parsed.host().is_empty() {
        return Err(ProxyError::BadRequest(format!(
            "CONNECT target has no host: {}",
            authority
        )));
    }
    Ok((parsed.host().to_string(), port))
}

/// Make the request URI absolute and return its host.
///
/// Origin-form requests (`GET /path` with a `Host` header) are rewritten to
/// `http://<host><path>`.
fn absolute_target(parts: &mut http::request::Parts) -> Result<String, ProxyError> {
    if let Some(host) = parts.uri.host() {
        return Ok(host.to_string());
    }

    let host = parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| ProxyError::BadRequest("request has no target host".to_string()))?;
    let path = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let uri: Uri = format!("http://{}{}", host, path)
        .parse()
        .map_err(|_| ProxyError::BadRequest(format!("invalid target host: {}", host)))?;
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::BadRequest("request has no target host".to_string()))?
        .to_string();

    parts.uri = uri;
    Ok(host)
}
