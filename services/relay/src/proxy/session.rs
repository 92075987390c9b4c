//! Per-client relay session.
//!
//! A session owns one [`LineAssemblyBuffer`] and is bound to one backend for
//! its lifetime. Each iteration reads from the client straight into the
//! buffer, extracts the lines that read completed, and forwards the valid
//! ones to the backend in arrival order. The unterminated tail stays in the
//! buffer, together with its validation state, for the next read.
//!
//! ```text
//! Active --(EOF | read error | write error | reject | idle)--> Closing --> Closed
//! ```

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use metricgate_lines::{AcceptedKeySet, LineAssemblyBuffer, DEFAULT_CAPACITY};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use super::backend::Backend;
use super::listener::RelayStats;

/// Minimum spare space offered to each client read.
pub const MIN_READ_SPACE: usize = 4096;

/// What to do with a connection that sends an unauthorized line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RejectPolicy {
    /// Drop the line and keep serving the connection.
    #[default]
    Drop,
    /// Close the connection; nothing from the offending read is forwarded.
    Disconnect,
}

/// Per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Unauthorized-line handling.
    pub reject_policy: RejectPolicy,
    /// Close the session when the client sends nothing for this long.
    pub idle_timeout: Option<Duration>,
    /// Initial assembly buffer capacity.
    pub buffer_capacity: usize,
    /// Longest unterminated line kept in memory.
    pub max_line_len: Option<usize>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            reject_policy: RejectPolicy::default(),
            idle_timeout: None,
            buffer_capacity: DEFAULT_CAPACITY,
            max_line_len: None,
        }
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Closing,
    Closed,
}

/// Why a session ended.
#[derive(Debug)]
pub enum SessionOutcome {
    /// Client reached end of stream. `leftover` unterminated bytes were not forwarded.
    ClientClosed { leftover: usize },
    /// No client data within the idle timeout.
    IdleTimeout,
    /// Reading from the client failed.
    ReadFailed(io::Error),
    /// Writing to the backend failed.
    BackendFailed(io::Error),
    /// Unauthorized lines under [`RejectPolicy::Disconnect`].
    Rejected { lines: usize },
}

impl SessionOutcome {
    /// True for endings other than a clean client close.
    pub fn is_error(&self) -> bool {
        !matches!(self, Self::ClientClosed { .. })
    }

    /// Short machine-readable reason.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::ClientClosed { .. } => "client_closed",
            Self::IdleTimeout => "idle_timeout",
            Self::ReadFailed(_) => "read_failed",
            Self::BackendFailed(_) => "backend_failed",
            Self::Rejected { .. } => "rejected",
        }
    }
}

/// Relay session for one client connection.
pub struct ProxySession<S> {
    client: S,
    backend: Arc<Backend>,
    keys: Arc<AcceptedKeySet>,
    buffer: LineAssemblyBuffer,
    config: SessionConfig,
    stats: Arc<RelayStats>,
    state: SessionState,
}

impl<S> ProxySession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a session in the `Active` state.
    pub fn new(
        client: S,
        backend: Arc<Backend>,
        keys: Arc<AcceptedKeySet>,
        config: SessionConfig,
        stats: Arc<RelayStats>,
    ) -> Self {
        let mut buffer = LineAssemblyBuffer::with_capacity(config.buffer_capacity);
        if let Some(limit) = config.max_line_len {
            buffer = buffer.with_max_line_len(limit);
        }

        Self {
            client,
            backend,
            keys,
            buffer,
            config,
            stats,
            state: SessionState::Active,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run until the client closes or an error ends the session.
    ///
    /// The client stream is closed before returning.
    pub async fn run(mut self) -> SessionOutcome {
        let outcome = self.pump().await;
        self.close().await;
        outcome
    }

    async fn pump(&mut self) -> SessionOutcome {
        loop {
            let spare = self.buffer.spare_mut(MIN_READ_SPACE);
            let read = match self.config.idle_timeout {
                Some(idle) => match tokio::time::timeout(idle, self.client.read(spare)).await {
                    Ok(result) => result,
                    Err(_) => return SessionOutcome::IdleTimeout,
                },
                None => self.client.read(spare).await,
            };

            let n = match read {
                Ok(0) => {
                    return SessionOutcome::ClientClosed {
                        leftover: self.buffer.leftover().len(),
                    }
                }
                Ok(n) => n,
                Err(e) => return SessionOutcome::ReadFailed(e),
            };

            let batch = self.buffer.commit(n, &self.keys);
            let accepted = batch.accepted();
            let rejected = batch.rejected();
            trace!(
                read = n,
                accepted,
                rejected,
                leftover = batch.leftover().len(),
                "Batch extracted"
            );

            if rejected > 0 {
                self.stats
                    .lines_dropped
                    .fetch_add(rejected as u64, Ordering::Relaxed);
                if self.config.reject_policy == RejectPolicy::Disconnect {
                    return SessionOutcome::Rejected { lines: rejected };
                }
                debug!(rejected, "Dropped unauthorized lines");
            }

            if accepted == 0 {
                continue;
            }

            let bytes = batch.accepted_bytes() as u64;
            let runs: Vec<&[u8]> = batch.runs().collect();
            if let Err(e) = self.backend.send_runs(&runs).await {
                return SessionOutcome::BackendFailed(e);
            }

            self.stats
                .lines_forwarded
                .fetch_add(accepted as u64, Ordering::Relaxed);
            self.stats
                .bytes_forwarded
                .fetch_add(bytes, Ordering::Relaxed);
        }
    }

    /// Shut the client stream down. Only the first call has any effect.
    async fn close(&mut self) {
        if self.state != SessionState::Active {
            return;
        }
        self.state = SessionState::Closing;

        if let Err(e) = self.client.shutdown().await {
            debug!(error = %e, "Client shutdown failed");
        }
        self.state = SessionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::BackendPool;
    use tokio::io::DuplexStream;

    fn keys(list: &[&str]) -> Arc<AcceptedKeySet> {
        Arc::new(AcceptedKeySet::new(list).unwrap())
    }

    fn pool() -> (BackendPool, DuplexStream) {
        let (writer, reader) = tokio::io::duplex(1 << 16);
        (BackendPool::from_writers(vec![writer]).unwrap(), reader)
    }

    async fn drain(mut reader: DuplexStream, pool: BackendPool) -> Vec<u8> {
        // Dropping the pool closes the writer so the read ends.
        drop(pool);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn test_forwards_lines_split_across_reads() {
        let client = tokio_test::io::Builder::new()
            .read(b"abc123.host.cpu 10 1000\nabc")
            .read(b"12")
            .read(b"3.host.mem 20 1000\nnope.x 1 1\nabc123.tail")
            .build();
        let (pool, reader) = pool();
        let stats = Arc::new(RelayStats::default());

        let session = ProxySession::new(
            client,
            pool.assign(),
            keys(&["abc123"]),
            SessionConfig::default(),
            Arc::clone(&stats),
        );
        let outcome = session.run().await;

        assert!(matches!(
            outcome,
            SessionOutcome::ClientClosed { leftover: 11 }
        ));
        assert_eq!(
            drain(reader, pool).await,
            b"abc123.host.cpu 10 1000\nabc123.host.mem 20 1000\n"
        );
        assert_eq!(stats.lines_forwarded.load(Ordering::Relaxed), 2);
        assert_eq!(stats.lines_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_disconnect_policy_forwards_nothing_from_bad_read() {
        let client = tokio_test::io::Builder::new()
            .read(b"abc.ok 1 1\n")
            .read(b"abc.also 1 1\nbad.x 1 1\n")
            .build();
        let (pool, reader) = pool();
        let config = SessionConfig {
            reject_policy: RejectPolicy::Disconnect,
            ..SessionConfig::default()
        };

        let session = ProxySession::new(
            client,
            pool.assign(),
            keys(&["abc"]),
            config,
            Arc::new(RelayStats::default()),
        );
        let outcome = session.run().await;

        assert!(matches!(outcome, SessionOutcome::Rejected { lines: 1 }));
        assert_eq!(outcome.reason(), "rejected");
        assert_eq!(drain(reader, pool).await, b"abc.ok 1 1\n");
    }

    #[tokio::test]
    async fn test_read_error_ends_session() {
        let client = tokio_test::io::Builder::new()
            .read(b"abc.ok 1 1\n")
            .read_error(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .build();
        let (pool, reader) = pool();

        let session = ProxySession::new(
            client,
            pool.assign(),
            keys(&["abc"]),
            SessionConfig::default(),
            Arc::new(RelayStats::default()),
        );
        let outcome = session.run().await;

        match outcome {
            SessionOutcome::ReadFailed(e) => assert_eq!(e.kind(), io::ErrorKind::ConnectionReset),
            other => panic!("expected ReadFailed, got {:?}", other),
        }
        assert_eq!(drain(reader, pool).await, b"abc.ok 1 1\n");
    }

    #[tokio::test]
    async fn test_backend_failure_ends_session() {
        let (writer, reader) = tokio::io::duplex(64);
        drop(reader);
        let pool = BackendPool::from_writers(vec![writer]).unwrap();

        let client = tokio_test::io::Builder::new().read(b"abc.ok 1 1\n").build();
        let session = ProxySession::new(
            client,
            pool.assign(),
            keys(&["abc"]),
            SessionConfig::default(),
            Arc::new(RelayStats::default()),
        );
        let outcome = session.run().await;

        assert!(matches!(outcome, SessionOutcome::BackendFailed(_)));
        assert!(outcome.is_error());
        assert_eq!(pool.stats()[0].write_failures, 1);
    }

    #[tokio::test]
    async fn test_idle_timeout() {
        let (client, _peer) = tokio::io::duplex(64);
        let (pool, _reader) = pool();
        let config = SessionConfig {
            idle_timeout: Some(Duration::from_millis(20)),
            ..SessionConfig::default()
        };

        let session = ProxySession::new(
            client,
            pool.assign(),
            keys(&["abc"]),
            config,
            Arc::new(RelayStats::default()),
        );
        let outcome = session.run().await;
        assert!(matches!(outcome, SessionOutcome::IdleTimeout));
    }

    #[tokio::test]
    async fn test_close_is_fire_once() {
        let (client, mut peer) = tokio::io::duplex(64);
        let (pool, _reader) = pool();

        let mut session = ProxySession::new(
            client,
            pool.assign(),
            keys(&["abc"]),
            SessionConfig::default(),
            Arc::new(RelayStats::default()),
        );
        assert_eq!(session.state(), SessionState::Active);

        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);
        session.close().await;
        assert_eq!(session.state(), SessionState::Closed);

        // The peer sees the shutdown as end of stream.
        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }
}
