//! TCP listener and connection handling.
//!
//! Accepts client connections, optionally terminates TLS, assigns each one a
//! backend by round robin and runs a [`ProxySession`] for it in its own task.
//!
//! Backend assignment happens in the accept loop, so the n-th admitted
//! connection always lands on backend `n mod pool size`. The TLS handshake
//! runs in the session task so a slow client cannot stall accepts.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metricgate_lines::AcceptedKeySet;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn, Instrument};

use super::backend::{Backend, BackendPool};
use super::session::{ProxySession, SessionConfig, SessionOutcome};

/// Default maximum concurrent client sessions.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default deadline for a client to complete the TLS handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause after a failed accept to avoid a tight loop on persistent errors.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Configuration for a listener.
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    /// Deadline for the TLS handshake; the permit is held meanwhile.
    pub handshake_timeout: Duration,
    /// Settings applied to every session.
    pub session: SessionConfig,
}

impl ListenerConfig {
    /// Create a new listener configuration.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            session: SessionConfig::default(),
        }
    }
}

/// Relay-wide statistics.
#[derive(Debug, Default)]
pub struct RelayStats {
    /// Total connections accepted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently running.
    pub connections_active: AtomicU64,
    /// Sessions finished.
    pub connections_closed: AtomicU64,
    /// Connections refused because the session cap was reached.
    pub connections_rejected: AtomicU64,
    /// Failed or timed out TLS handshakes.
    pub tls_failures: AtomicU64,
    /// Lines forwarded to backends.
    pub lines_forwarded: AtomicU64,
    /// Unauthorized or malformed lines dropped.
    pub lines_dropped: AtomicU64,
    /// Bytes forwarded to backends.
    pub bytes_forwarded: AtomicU64,
}

/// A TCP listener feeding the relay.
pub struct Listener {
    /// Listener configuration.
    config: ListenerConfig,
    /// The TCP listener.
    listener: TcpListener,
    /// Outbound connections.
    pool: Arc<BackendPool>,
    /// Authorized keys, shared read-only.
    keys: Arc<AcceptedKeySet>,
    /// Present when clients must speak TLS.
    tls: Option<TlsAcceptor>,
    /// Limits concurrent sessions.
    conn_semaphore: Arc<Semaphore>,
    /// Statistics.
    stats: Arc<RelayStats>,
    /// Session id source, for log correlation.
    next_session_id: AtomicU64,
}

impl Listener {
    /// Bind a new listener.
    pub async fn bind(
        config: ListenerConfig,
        pool: Arc<BackendPool>,
        keys: Arc<AcceptedKeySet>,
        tls: Option<TlsAcceptor>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;

        info!(
            bind_addr = %local_addr,
            max_connections = config.max_connections,
            tls = tls.is_some(),
            backends = pool.len(),
            "Listener bound"
        );

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(config.max_connections)),
            listener,
            config,
            pool,
            keys,
            tls,
            stats: Arc::new(RelayStats::default()),
            next_session_id: AtomicU64::new(0),
        })
    }

    /// Get the local address this listener is bound to.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Get relay statistics.
    pub fn stats(&self) -> &Arc<RelayStats> {
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

                    let backend = self.pool.assign();
                    let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);

                    self.stats
                        .connections_accepted
                        .fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .connections_active
                        .fetch_add(1, Ordering::Relaxed);

                    let listener = Arc::clone(&self);
                    let stats = Arc::clone(&self.stats);
                    let span = tracing::info_span!(
                        "session",
                        id = session_id,
                        peer = %peer_addr,
                        backend = backend.id(),
                        remote = backend.addr()
                    );

                    tokio::spawn(
                        async move {
                            listener.handle_connection(stream, backend).await;

                            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                            stats.connections_closed.fetch_add(1, Ordering::Relaxed);
                            drop(permit);
                        }
                        .instrument(span),
                    );
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            }
        }
    }

    /// Handle a single connection until its session ends.
    async fn handle_connection(&self, stream: TcpStream, backend: Arc<Backend>) {
        debug!("Session opened");

        let outcome = match &self.tls {
            Some(acceptor) => {
                let handshake = timeout(self.config.handshake_timeout, acceptor.accept(stream));
                match handshake.await {
                    Ok(Ok(tls_stream)) => self.run_session(tls_stream, backend).await,
                    Ok(Err(e)) => {
                        self.stats.tls_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(error = %e, "TLS handshake failed");
                        return;
                    }
                    Err(_) => {
                        self.stats.tls_failures.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            timeout_ms = self.config.handshake_timeout.as_millis() as u64,
                            "TLS handshake timed out"
                        );
                        return;
                    }
                }
            }
            None => self.run_session(stream, backend).await,
        };

        match &outcome {
            SessionOutcome::ClientClosed { leftover } => {
                debug!(leftover, "Session closed by client");
            }
            SessionOutcome::IdleTimeout => {
                debug!("Session idle timeout");
            }
            SessionOutcome::ReadFailed(e) => {
                warn!(error = %e, "Connection error: read failed");
            }
            SessionOutcome::BackendFailed(e) => {
                warn!(error = %e, "Connection error: backend write failed");
            }
            SessionOutcome::Rejected { lines } => {
                warn!(lines, "Connection dropped: unauthorized key");
            }
        }
    }

    async fn run_session<S>(&self, stream: S, backend: Arc<Backend>) -> SessionOutcome
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        ProxySession::new(
            stream,
            backend,
            Arc::clone(&self.keys),
            self.config.session.clone(),
            Arc::clone(&self.stats),
        )
        .run()
        .await
    }
}
