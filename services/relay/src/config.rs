//! Relay configuration.
//!
//! Command-line flags (with environment fallbacks) are parsed into [`Args`]
//! and validated once into an immutable [`RelayConfig`].

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use metricgate_lines::{validate_key, AcceptedKeySet, KeyError};
use thiserror::Error;

use crate::proxy::{
    ListenerConfig, RejectPolicy, SessionConfig, DEFAULT_CONNECT_TIMEOUT,
    DEFAULT_HANDSHAKE_TIMEOUT, DEFAULT_MAX_CONNECTIONS,
};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("at least one API key is required (--apikey or --apikey-file)")]
    NoApiKeys,

    #[error("--beconnections must be at least 1")]
    NoBackends,

    #[error("--cert and --key must be given together")]
    IncompleteTls,

    #[error("failed to read API key file {path}: {source}")]
    KeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid API key: {0}")]
    InvalidKey(#[from] KeyError),

    #[error("invalid listen address {0:?}")]
    ListenAddr(String),
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per event.
    Json,
}

/// Command-line arguments.
#[derive(Parser)]
#[command(
    name = "metricgate",
    version,
    about = "Authenticating relay for the Graphite plaintext protocol"
)]
pub struct Args {
    /// Address to accept client connections on (":port" binds all interfaces).
    #[arg(long, env = "METRICGATE_LISTEN", default_value = ":9090")]
    pub listen: String,

    /// Graphite backend as host:port.
    #[arg(long, env = "METRICGATE_REMOTE")]
    pub remote: String,

    /// Number of connections opened to the backend.
    #[arg(long, env = "METRICGATE_BECONNECTIONS", default_value_t = 1)]
    pub beconnections: usize,

    /// Authorized API key. Repeat for several keys.
    #[arg(long = "apikey", env = "METRICGATE_APIKEYS", value_delimiter = ',')]
    pub apikeys: Vec<String>,

    /// File with one API key per line. Blank lines and `#` comments are skipped.
    #[arg(long, env = "METRICGATE_APIKEY_FILE")]
    pub apikey_file: Option<PathBuf>,

    /// PEM certificate chain for TLS termination.
    #[arg(long, env = "METRICGATE_CERT")]
    pub cert: Option<PathBuf>,

    /// PEM private key for TLS termination.
    #[arg(long, env = "METRICGATE_KEY")]
    pub key: Option<PathBuf>,

    /// Disconnect clients that send a line with an unauthorized key.
    #[arg(long, env = "METRICGATE_STRICT")]
    pub strict: bool,

    /// Maximum concurrent client sessions.
    #[arg(long, env = "METRICGATE_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub max_connections: usize,

    /// Close sessions idle for this many seconds (0 disables).
    #[arg(long, env = "METRICGATE_IDLE_TIMEOUT_SECS", default_value_t = 0)]
    pub idle_timeout_secs: u64,

    /// Backend dial timeout in milliseconds.
    #[arg(
        long,
        env = "METRICGATE_CONNECT_TIMEOUT_MS",
        default_value_t = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64
    )]
    pub connect_timeout_ms: u64,

    /// Deadline for clients to complete the TLS handshake, in milliseconds.
    #[arg(
        long,
        env = "METRICGATE_HANDSHAKE_TIMEOUT_MS",
        default_value_t = DEFAULT_HANDSHAKE_TIMEOUT.as_millis() as u64
    )]
    pub handshake_timeout_ms: u64,

    /// Longest unterminated line buffered per session (0 disables the limit).
    #[arg(long, env = "METRICGATE_MAX_LINE_BYTES", default_value_t = 0)]
    pub max_line_bytes: usize,

    /// Log level, used when RUST_LOG is unset.
    #[arg(long, env = "METRICGATE_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Log output format.
    #[arg(long, env = "METRICGATE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Certificate and key paths for TLS termination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Validated relay configuration.
#[derive(Clone)]
pub struct RelayConfig {
    /// Client-facing bind address.
    pub listen: SocketAddr,
    /// Backend address.
    pub remote: String,
    /// Backend pool size.
    pub backend_connections: usize,
    /// Authorized keys, deduplicated, in first-seen order.
    pub api_keys: Vec<String>,
    /// TLS termination, if configured.
    pub tls: Option<TlsPaths>,
    /// Unauthorized-line handling.
    pub reject_policy: RejectPolicy,
    /// Session cap.
    pub max_connections: usize,
    /// Client idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Backend dial timeout.
    pub connect_timeout: Duration,
    /// Client TLS handshake deadline.
    pub handshake_timeout: Duration,
    /// Unterminated line limit.
    pub max_line_len: Option<usize>,
    /// Fallback log filter.
    pub log_level: String,
    /// Log output format.
    pub log_format: LogFormat,
}

impl RelayConfig {
    /// Defaults for a relay in front of `remote` accepting `api_keys`.
    pub fn new(remote: impl Into<String>, api_keys: Vec<String>) -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 9090)),
            remote: remote.into(),
            backend_connections: 1,
            api_keys,
            tls: None,
            reject_policy: RejectPolicy::default(),
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            max_line_len: None,
            log_level: "info".to_string(),
            log_format: LogFormat::default(),
        }
    }

    /// Build the accepted key set.
    pub fn key_set(&self) -> Result<AcceptedKeySet, KeyError> {
        AcceptedKeySet::new(&self.api_keys)
    }

    /// Per-session settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reject_policy: self.reject_policy,
            idle_timeout: self.idle_timeout,
            max_line_len: self.max_line_len,
            ..SessionConfig::default()
        }
    }

    /// Listener settings.
    pub fn listener_config(&self) -> ListenerConfig {
        ListenerConfig {
            bind_addr: self.listen,
            max_connections: self.max_connections,
            handshake_timeout: self.handshake_timeout,
            session: self.session_config(),
        }
    }
}

impl Args {
    /// Validate the arguments into a [`RelayConfig`].
    pub fn into_config(self) -> Result<RelayConfig, ConfigError> {
        let listen = parse_listen(&self.listen)?;

        if self.beconnections == 0 {
            return Err(ConfigError::NoBackends);
        }

        let mut api_keys = Vec::new();
        let from_file = match &self.apikey_file {
            Some(path) => read_key_file(path)?,
            None => Vec::new(),
        };
        for key in self.apikeys.into_iter().chain(from_file) {
            let key = key.trim().to_string();
            if key.is_empty() {
                continue;
            }
            validate_key(key.as_bytes())?;
            if !api_keys.contains(&key) {
                api_keys.push(key);
            }
        }
        if api_keys.is_empty() {
            return Err(ConfigError::NoApiKeys);
        }

        let tls = match (self.cert, self.key) {
            (Some(cert), Some(key)) => Some(TlsPaths { cert, key }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteTls),
        };

        let reject_policy = if self.strict {
            RejectPolicy::Disconnect
        } else {
            RejectPolicy::Drop
        };

        Ok(RelayConfig {
            listen,
            remote: self.remote,
            backend_connections: self.beconnections,
            api_keys,
            tls,
            reject_policy,
            max_connections: self.max_connections,
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            max_line_len: (self.max_line_bytes > 0).then_some(self.max_line_bytes),
            log_level: self.log_level,
            log_format: self.log_format,
        })
    }
}

// API keys are credentials: print how many, never which.
impl std::fmt::Debug for Args {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Args")
            .field("listen", &self.listen)
            .field("remote", &self.remote)
            .field("beconnections", &self.beconnections)
            .field("apikeys", &self.apikeys.len())
            .field("apikey_file", &self.apikey_file)
            .field("cert", &self.cert)
            .field("key", &self.key)
            .field("strict", &self.strict)
            .field("max_connections", &self.max_connections)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("handshake_timeout_ms", &self.handshake_timeout_ms)
            .field("max_line_bytes", &self.max_line_bytes)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

impl std::fmt::Debug for RelayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayConfig")
            .field("listen", &self.listen)
            .field("remote", &self.remote)
            .field("backend_connections", &self.backend_connections)
            .field("api_keys", &self.api_keys.len())
            .field("tls", &self.tls)
            .field("reject_policy", &self.reject_policy)
            .field("max_connections", &self.max_connections)
            .field("idle_timeout", &self.idle_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_line_len", &self.max_line_len)
            .field("log_level", &self.log_level)
            .field("log_format", &self.log_format)
            .finish()
    }
}

/// Parse a bind address. A bare `:port` binds every IPv4 interface.
fn parse_listen(value: &str) -> Result<SocketAddr, ConfigError> {
    let full = match value.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{}", port),
        None => value.to_string(),
    };
    full.parse()
        .map_err(|_| ConfigError::ListenAddr(value.to_string()))
}

fn read_key_file(path: &Path) -> Result<Vec<String>, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::KeyFile {
        path: path.to_path_buf(),
        source,
    })?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}
