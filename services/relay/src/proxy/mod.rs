//! Authenticating line relay.
//!
//! This module provides:
//! - TCP listener with optional TLS termination
//! - Per-session line assembly and API-key filtering
//! - A fixed pool of backend connections with round-robin assignment
//!
//! ## Architecture
//!
//! ```text
//! Client -> Listener -> [TLS] -> ProxySession -> Backend (pool, round robin) -> Graphite
//!                                     |
//!                          LineAssemblyBuffer + AcceptedKeySet
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use proxy::{BackendPool, Listener, ListenerConfig};
//!
//! let keys = Arc::new(AcceptedKeySet::new(["MYAPIKEY"])?);
//! let pool = Arc::new(BackendPool::connect("graphite:2003", 4, DEFAULT_CONNECT_TIMEOUT).await?);
//!
//! let config = ListenerConfig::new("0.0.0.0:9090".parse()?);
//! let listener = Arc::new(Listener::bind(config, pool, keys, None).await?);
//! listener.run().await?;
//! ```

mod backend;
mod listener;
mod session;
mod tls;

pub use backend::{
    Backend, BackendError, BackendPool, BackendStats, BackendWriter, DEFAULT_CONNECT_TIMEOUT,
};
pub use listener::{
    Listener, ListenerConfig, RelayStats, DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};
pub use session::{
    ProxySession, RejectPolicy, SessionConfig, SessionOutcome, SessionState, MIN_READ_SPACE,
};
pub use tls::{build_acceptor, load_certificates, load_private_key, TlsError};
