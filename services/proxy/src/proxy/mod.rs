//! Forward proxy implementation.
//!
//! This module provides:
//! - TCP listener management and first-request sniffing
//! - Proxy credential checks
//! - Destination family resolution
//! - Outbound dialing from rotated IPv6 source addresses
//! - CONNECT tunnelling and plain HTTP forwarding
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> Dispatcher -> auth -> resolver -> allocator
//!                           |
//!              CONNECT: dial -> relay      other: transport (reqwest)
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use rotor_proxy::proxy::{Dispatcher, Listener, ListenerConfig};
//!
//! let dispatcher = Arc::new(Dispatcher::new("2001:db8::/48".parse()?, None)?);
//!
//! let config = ListenerConfig::new("[::]:33300".parse()?);
//! let listener = Arc::new(Listener::bind(config, dispatcher).await?);
//! listener.run().await?;
//! ```

mod auth;
mod dial;
mod dispatcher;
mod listener;
mod prefixed;
mod relay;
mod resolver;
mod transport;

pub use auth::{check, Credentials, PROXY_AUTHENTICATE};
pub use dial::{Connect, TcpConnector, DIAL_TIMEOUT, KEEPALIVE_INTERVAL};
pub use dispatcher::{Dispatcher, Outcome, ProxyHandler, TunnelRequest};
pub use listener::{
    Listener, ListenerConfig, ListenerStats, DEFAULT_HEADER_READ_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use prefixed::PrefixedStream;
pub use relay::{relay, RelayStats};
pub use resolver::{Destination, DestinationResolver, Lookup, SystemLookup};
pub use transport::{
    empty_body, full_body, strip_hop_by_hop, BoxError, HttpTransport, ProxyBody, Transport,
};
