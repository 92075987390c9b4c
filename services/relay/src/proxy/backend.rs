//! Backend pool management and selection.
//!
//! The pool is a fixed set of long-lived connections to the Graphite relay
//! target, dialled once at startup:
//! - Round-robin assignment, one backend per client session for its lifetime
//! - Writes to a backend are serialized by a per-backend lock so lines from
//!   different sessions never interleave
//! - A failed write ends the session that issued it; the backend stays in the pool

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, info};

/// Default connect timeout for backend connections.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Writable half of a backend connection.
pub type BackendWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Errors raised while building the backend pool.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The pool must hold at least one connection.
    #[error("backend connection count must be at least 1")]
    NoBackends,

    /// Dialling a backend failed.
    #[error("failed to connect backend {index} to {addr}: {source}")]
    Connect {
        index: usize,
        addr: String,
        #[source]
        source: io::Error,
    },

    /// Dialling a backend did not complete in time.
    #[error("timed out after {timeout:?} connecting backend {index} to {addr}")]
    ConnectTimeout {
        index: usize,
        addr: String,
        timeout: Duration,
    },
}

/// One outbound connection shared by every session assigned to it.
pub struct Backend {
    /// Position in the pool.
    id: usize,
    /// Remote address, for logging.
    addr: String,
    /// Serializes writers.
    writer: Mutex<BackendWriter>,
    /// Bytes successfully written.
    bytes_written: AtomicU64,
    /// Failed write calls.
    write_failures: AtomicU64,
}

impl Backend {
    fn new(id: usize, addr: String, writer: BackendWriter) -> Self {
        Self {
            id,
            addr,
            writer: Mutex::new(writer),
            bytes_written: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
        }
    }

    /// Position of this backend in the pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Remote address this backend was dialled to.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Write `bytes` verbatim while holding the backend lock.
    pub async fn send(&self, bytes: &[u8]) -> io::Result<()> {
        self.send_runs(&[bytes]).await
    }

    /// Write several byte runs back to back under a single lock acquisition.
    ///
    /// No other session can write between the runs.
    pub async fn send_runs<B: AsRef<[u8]>>(&self, runs: &[B]) -> io::Result<()> {
        let mut writer = self.writer.lock().await;

        let mut written = 0u64;
        let result = async {
            for run in runs {
                let run = run.as_ref();
                writer.write_all(run).await?;
                written += run.len() as u64;
            }
            writer.flush().await
        }
        .await;

        self.bytes_written.fetch_add(written, Ordering::Relaxed);
        if result.is_err() {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Get write statistics.
    pub fn stats(&self) -> BackendStats {
        BackendStats {
            id: self.id,
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("id", &self.id)
            .field("addr", &self.addr)
            .finish_non_exhaustive()
    }
}

/// Statistics for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStats {
    pub id: usize,
    pub bytes_written: u64,
    pub write_failures: u64,
}

/// Fixed-size pool of backend connections.
#[derive(Debug)]
pub struct BackendPool {
    /// Backends in dial order.
    backends: Vec<Arc<Backend>>,
    /// Round-robin counter.
    rr_counter: AtomicUsize,
}

impl BackendPool {
    /// Dial `count` connections to `remote`, one after another.
    ///
    /// Any failure aborts the whole pool; there is no partial startup.
    pub async fn connect(
        remote: &str,
        count: usize,
        connect_timeout: Duration,
    ) -> Result<Self, BackendError> {
        if count == 0 {
            return Err(BackendError::NoBackends);
        }

        info!(remote = %remote, count, "Starting backend connections");

        let mut writers: Vec<(String, BackendWriter)> = Vec::with_capacity(count);
        for index in 0..count {
            let stream = match timeout(connect_timeout, TcpStream::connect(remote)).await {
                Ok(Ok(stream)) => stream,
                Ok(Err(source)) => {
                    return Err(BackendError::Connect {
                        index,
                        addr: remote.to_string(),
                        source,
                    })
                }
                Err(_) => {
                    return Err(BackendError::ConnectTimeout {
                        index,
                        addr: remote.to_string(),
                        timeout: connect_timeout,
                    })
                }
            };

            // Lines are flushed whole; don't hold them back waiting for more.
            if let Err(e) = stream.set_nodelay(true) {
                debug!(index, error = %e, "Failed to set TCP_NODELAY");
            }

            let local_addr = stream
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_default();
            debug!(index, local_addr = %local_addr, remote = %remote, "Backend connected");

            writers.push((remote.to_string(), Box::new(stream) as BackendWriter));
        }

        Ok(Self::from_named(writers))
    }

    /// Build a pool over already-open writers.
    pub fn from_writers<W, I>(writers: I) -> Result<Self, BackendError>
    where
        I: IntoIterator<Item = W>,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let writers: Vec<(String, BackendWriter)> = writers
            .into_iter()
            .enumerate()
            .map(|(i, w)| (format!("writer-{}", i), Box::new(w) as BackendWriter))
            .collect();

        if writers.is_empty() {
            return Err(BackendError::NoBackends);
        }
        Ok(Self::from_named(writers))
    }

    fn from_named(writers: Vec<(String, BackendWriter)>) -> Self {
        let backends = writers
            .into_iter()
            .enumerate()
            .map(|(id, (addr, writer))| Arc::new(Backend::new(id, addr, writer)))
            .collect();

        Self {
            backends,
            rr_counter: AtomicUsize::new(0),
        }
    }

    /// Pick the backend for a new session.
    ///
    /// Called once per accepted connection; the n-th call returns backend
    /// `n mod len`.
    pub fn assign(&self) -> Arc<Backend> {
        let index = self.rr_counter.fetch_add(1, Ordering::Relaxed) % self.backends.len();
        Arc::clone(&self.backends[index])
    }

    /// Number of backends in the pool.
    pub fn len(&self) -> usize {
        self.backends.len()
    }

    /// Check if the pool is empty (never true for a constructed pool).
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Get statistics for every backend.
    pub fn stats(&self) -> Vec<BackendStats> {
        self.backends.iter().map(|b| b.stats()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::AsyncReadExt;

    /// Writer that fails every call.
    struct BrokenWriter;

    impl AsyncWrite for BrokenWriter {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken")))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_round_robin_assignment() {
        let pool = BackendPool::from_writers(vec![tokio::io::sink(), tokio::io::sink()]).unwrap();

        let assigned: Vec<usize> = (0..3).map(|_| pool.assign().id()).collect();
        assert_eq!(assigned, vec![0, 1, 0]);
    }

    #[test]
    fn test_round_robin_wraps_for_any_size() {
        let pool = BackendPool::from_writers((0..5).map(|_| tokio::io::sink())).unwrap();
        for i in 0..23 {
            assert_eq!(pool.assign().id(), i % 5);
        }
    }

    #[test]
    fn test_empty_pool_rejected() {
        let result = BackendPool::from_writers(Vec::<tokio::io::Sink>::new());
        assert!(matches!(result, Err(BackendError::NoBackends)));
    }

    #[tokio::test]
    async fn test_zero_count_rejected() {
        let result = BackendPool::connect("127.0.0.1:1", 0, DEFAULT_CONNECT_TIMEOUT).await;
        assert!(matches!(result, Err(BackendError::NoBackends)));
    }

    #[tokio::test]
    async fn test_send_runs_are_contiguous() {
        let (writer, mut reader) = tokio::io::duplex(64);
        let pool = BackendPool::from_writers(vec![writer]).unwrap();
        let backend = pool.assign();

        let mut tasks = Vec::new();
        for tag in [b'a', b'b', b'c'] {
            let backend = Arc::clone(&backend);
            tasks.push(tokio::spawn(async move {
                for _ in 0..50 {
                    let line = [tag; 15];
                    let runs = [&line[..7], &line[7..], &b"\n"[..]];
                    backend.send_runs(&runs).await.unwrap();
                }
            }));
        }

        let reading = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut buf = [0u8; 256];
            while received.len() < 3 * 50 * 16 {
                let n = reader.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            received
        });

        for task in tasks {
            task.await.unwrap();
        }
        let received = reading.await.unwrap();

        for line in received.split(|&b| b == b'\n').filter(|l| !l.is_empty()) {
            assert_eq!(line.len(), 15);
            assert!(line.iter().all(|&b| b == line[0]), "interleaved line");
        }
        assert_eq!(backend.stats().bytes_written, 3 * 50 * 16);
    }

    #[tokio::test]
    async fn test_write_failure_counted() {
        let pool = BackendPool::from_writers(vec![BrokenWriter]).unwrap();
        let backend = pool.assign();

        let err = backend.send(b"k.m 1 1\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert_eq!(backend.stats().write_failures, 1);

        // The backend is still handed out.
        assert_eq!(pool.assign().id(), 0);
    }
}
