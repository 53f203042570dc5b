//! Upstream HTTP exchange for plain (non-CONNECT) proxy requests.
//!
//! Requests with a rotated source address get a throwaway client bound to
//! that address and pinned to the already-resolved destination, so the
//! connection cannot drift to another address family. Everything else
//! shares one default client.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::TryStreamExt;
use http::header::{self, HeaderMap, HeaderName};
use http::{Request, Response};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, BodyStream, Empty, Full, StreamBody};
use hyper::body::{Body, Frame};
use tracing::debug;

use super::dial::{DIAL_TIMEOUT, KEEPALIVE_INTERVAL};
use crate::error::ProxyError;

/// Boxed error carried by proxy bodies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type for requests and responses passing through the proxy.
pub type ProxyBody = UnsyncBoxBody<Bytes, BoxError>;

/// Build a body from a complete buffer.
pub fn full_body(data: impl Into<Bytes>) -> ProxyBody {
    Full::new(data.into())
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Build an empty body.
pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed_unsync()
}

/// Performs one upstream request/response exchange.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `request` to `destination`, from `source` when given.
    async fn forward(
        &self,
        request: Request<ProxyBody>,
        destination: IpAddr,
        source: Option<IpAddr>,
    ) -> Result<Response<ProxyBody>, ProxyError>;
}

/// `reqwest`-backed transport.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    default_client: reqwest::Client,
}

impl HttpTransport {
    /// Create the transport and its shared default client.
    pub fn new() -> Result<Self, ProxyError> {
        Ok(Self {
            default_client: base_builder().build()?,
        })
    }

    fn bound_client(
        &self,
        host: &str,
        destination: IpAddr,
        source: IpAddr,
    ) -> Result<reqwest::Client, ProxyError> {
        // Built per request: the local address is a client-wide setting in
        // reqwest. Only rotated destinations pay for it. The port is taken
        // from the URL.
        Ok(base_builder()
            .resolve(host, SocketAddr::new(destination, 0))
            .local_address(source)
            .connect_timeout(DIAL_TIMEOUT)
            .tcp_keepalive(KEEPALIVE_INTERVAL)
            // One request per client; nothing to pool.
            .pool_max_idle_per_host(0)
            .build()?)
    }
}

/// Client settings shared by the default and bound clients.
fn base_builder() -> reqwest::ClientBuilder {
    reqwest::Client::builder()
        .no_proxy()
        .redirect(reqwest::redirect::Policy::none())
}

#[async_trait]
impl Transport for HttpTransport {
    async fn forward(
        &self,
        request: Request<ProxyBody>,
        destination: IpAddr,
        source: Option<IpAddr>,
    ) -> Result<Response<ProxyBody>, ProxyError> {
        let client = match source {
            Some(ip) => {
                let host = request.uri().host().unwrap_or_default();
                self.bound_client(host, destination, ip)?
            }
            None => self.default_client.clone(),
        };

        let (parts, body) = request.into_parts();
        let body = if body.is_end_stream() {
            reqwest::Body::from(Bytes::new())
        } else {
            reqwest::Body::wrap_stream(
                BodyStream::new(body)
                    .try_filter_map(|frame| async move { Ok(frame.into_data().ok()) }),
            )
        };

        let request = reqwest::Request::try_from(Request::from_parts(parts, body))?;
        debug!(method = %request.method(), url = %request.url(), "Forwarding request upstream");

        let upstream = client.execute(request).await?;

        let status = upstream.status();
        let mut headers = upstream.headers().clone();
        strip_hop_by_hop(&mut headers);

        let body = StreamBody::new(
            upstream
                .bytes_stream()
                .map_ok(Frame::data)
                .map_err(|e| Box::new(e) as BoxError),
        );

        let mut response = Response::new(body.boxed_unsync());
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Headers that describe a single hop and are never forwarded.
const HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
    HeaderName::from_static("keep-alive"),
];

/// Remove hop-by-hop headers, including any listed in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed.iter().chain(HOP_BY_HOP.iter()) {
        headers.remove(name);
    }
    headers.remove("proxy-connection");
}
