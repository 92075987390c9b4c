//! Test harness for relay integration tests.
//!
//! Provides a capturing Graphite backend, a relay spawner and TLS client
//! helpers for loopback tests.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use rustls::pki_types::{CertificateDer, ServerName};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::TlsConnector;

use metricgate::proxy::build_acceptor;
use metricgate::{BackendPool, Listener, RelayConfig, RelayStats, TlsPaths};

static INIT_CRYPTO: Once = Once::new();

fn init_crypto_provider() {
    INIT_CRYPTO.call_once(|| {
        rustls::crypto::ring::default_provider()
            .install_default()
            .ok();
    });
}

/// Graphite stand-in that records what each connection receives.
///
/// Connections are numbered in accept order, which is the relay's dial order.
#[allow(dead_code)]
pub struct CaptureBackend {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

#[allow(dead_code)]
impl CaptureBackend {
    pub async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        let received_clone = Arc::clone(&received);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok((mut stream, _)) => {
                                let slot = {
                                    let mut all = received_clone.lock().unwrap();
                                    all.push(Vec::new());
                                    all.len() - 1
                                };
                                let received = Arc::clone(&received_clone);
                                tokio::spawn(async move {
                                    let mut buf = vec![0u8; 8192];
                                    loop {
                                        match stream.read(&mut buf).await {
                                            Ok(0) | Err(_) => break,
                                            Ok(n) => {
                                                received.lock().unwrap()[slot]
                                                    .extend_from_slice(&buf[..n]);
                                            }
                                        }
                                    }
                                });
                            }
                            Err(_) => break,
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            received,
            shutdown_tx: Some(shutdown_tx),
        })
    }

    pub fn connection_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }

    /// Bytes received so far on the `index`-th connection.
    pub fn received(&self, index: usize) -> Vec<u8> {
        self.received
            .lock()
            .unwrap()
            .get(index)
            .cloned()
            .unwrap_or_default()
    }

    /// Bytes received across every connection.
    pub fn total_received(&self) -> usize {
        self.received.lock().unwrap().iter().map(Vec::len).sum()
    }
}

impl Drop for CaptureBackend {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

/// A running relay on a loopback port.
#[allow(dead_code)]
pub struct RelayHandle {
    pub listen_addr: SocketAddr,
    pub stats: Arc<RelayStats>,
    pub pool: Arc<BackendPool>,
}

#[allow(dead_code)]
impl RelayHandle {
    /// Start a relay in front of `backend` accepting `keys`.
    pub async fn spawn(backend: &CaptureBackend, keys: &[&str]) -> io::Result<Self> {
        Self::spawn_with(relay_config(backend, keys)).await
    }

    /// Start a relay from a full configuration, following the startup order
    /// of the binary: keys, backend pool, TLS, listener.
    pub async fn spawn_with(config: RelayConfig) -> io::Result<Self> {
        let keys = Arc::new(config.key_set().map_err(io::Error::other)?);
        let pool = BackendPool::connect(
            &config.remote,
            config.backend_connections,
            config.connect_timeout,
        )
        .await
        .map_err(io::Error::other)?;
        let pool = Arc::new(pool);

        let tls = match &config.tls {
            Some(paths) => {
                init_crypto_provider();
                Some(build_acceptor(&paths.cert, &paths.key).map_err(io::Error::other)?)
            }
            None => None,
        };

        let listener =
            Listener::bind(config.listener_config(), Arc::clone(&pool), keys, tls).await?;
        let listen_addr = listener.local_addr()?;
        let stats = Arc::clone(listener.stats());
        let listener = Arc::new(listener);

        tokio::spawn(async move {
            let _ = listener.run().await;
        });

        // Backend connections are accepted asynchronously on the capture side.
        tokio::time::sleep(Duration::from_millis(10)).await;

        Ok(Self {
            listen_addr,
            stats,
            pool,
        })
    }
}

/// Relay configuration bound to a loopback ephemeral port.
#[allow(dead_code)]
pub fn relay_config(backend: &CaptureBackend, keys: &[&str]) -> RelayConfig {
    let mut config = RelayConfig::new(
        backend.addr.to_string(),
        keys.iter().map(|k| k.to_string()).collect(),
    );
    config.listen = "127.0.0.1:0".parse().unwrap();
    config
}

/// Poll `check` until it holds or two seconds pass.
#[allow(dead_code)]
pub async fn wait_for<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Self-signed certificate written to PEM files for the relay to load.
#[allow(dead_code)]
pub struct TestCert {
    pub cert_der: Vec<u8>,
    pub paths: TlsPaths,
    _cert_file: tempfile::NamedTempFile,
    _key_file: tempfile::NamedTempFile,
}

#[allow(dead_code)]
pub fn generate_cert(server_name: &str) -> io::Result<TestCert> {
    use std::io::Write;

    let cert = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
        .map_err(io::Error::other)?;

    let mut cert_file = tempfile::NamedTempFile::new()?;
    cert_file.write_all(cert.cert.pem().as_bytes())?;
    let mut key_file = tempfile::NamedTempFile::new()?;
    key_file.write_all(cert.key_pair.serialize_pem().as_bytes())?;

    Ok(TestCert {
        cert_der: cert.cert.der().to_vec(),
        paths: TlsPaths {
            cert: cert_file.path().to_path_buf(),
            key: key_file.path().to_path_buf(),
        },
        _cert_file: cert_file,
        _key_file: key_file,
    })
}

#[allow(dead_code)]
pub async fn tls_client_connect(
    addr: SocketAddr,
    server_name: &str,
    cert_der: &[u8],
) -> io::Result<tokio_rustls::client::TlsStream<TcpStream>> {
    init_crypto_provider();

    let mut root_store = rustls::RootCertStore::empty();
    root_store
        .add(CertificateDer::from(cert_der.to_vec()))
        .map_err(io::Error::other)?;

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));
    let stream = TcpStream::connect(addr).await?;
    let server_name = ServerName::try_from(server_name.to_string())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    connector.connect(server_name, stream).await
}
