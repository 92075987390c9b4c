//! metricgate: an authenticating relay for the Graphite plaintext protocol.
//!
//! Clients prefix every metric path with an API key. Lines whose first
//! component is an authorized key are forwarded verbatim to a Graphite
//! backend over a fixed pool of connections; everything else is dropped.

pub mod config;
pub mod proxy;

pub use config::{Args, ConfigError, LogFormat, RelayConfig, TlsPaths};
pub use proxy::{
    Backend, BackendError, BackendPool, Listener, ListenerConfig, ProxySession, RejectPolicy,
    RelayStats, SessionConfig, SessionOutcome, TlsError,
};
