pub mod config;
pub mod error;
pub mod host;
pub mod proxy;

pub use error::ProxyError;
pub use proxy::{
    Credentials, Destination, DestinationResolver, Dispatcher, Listener, ListenerConfig,
    ListenerStats, Outcome, ProxyHandler, TunnelRequest,
};
