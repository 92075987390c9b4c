//! metricgate
//!
//! Authenticating relay for the Graphite plaintext protocol.
//!
//! This service:
//! - Opens a fixed pool of connections to the Graphite backend
//! - Accepts client connections, optionally over TLS
//! - Forwards lines whose first path component is an authorized API key
//! - Drops everything else

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use metricgate::proxy::{build_acceptor, BackendPool, Listener};
use metricgate::{Args, LogFormat, RelayConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Args::parse()
        .into_config()
        .context("Invalid configuration")?;

    init_tracing(&config);

    info!("Starting metricgate");
    info!(
        listen = %config.listen,
        remote = %config.remote,
        backend_connections = config.backend_connections,
        api_keys = config.api_keys.len(),
        reject_policy = ?config.reject_policy,
        max_connections = config.max_connections,
        "Configuration loaded"
    );

    let keys = Arc::new(config.key_set().context("Invalid API keys")?);

    let pool = BackendPool::connect(
        &config.remote,
        config.backend_connections,
        config.connect_timeout,
    )
    .await
    .with_context(|| format!("Failed to connect to backend {}", config.remote))?;
    info!(count = pool.len(), "Backend connections established");
    let pool = Arc::new(pool);

    let tls = match &config.tls {
        Some(paths) => Some(
            build_acceptor(&paths.cert, &paths.key).context("Failed to set up TLS")?,
        ),
        None => {
            warn!("No certificate configured, not using TLS");
            None
        }
    };

    let listener = Listener::bind(config.listener_config(), Arc::clone(&pool), keys, tls)
        .await
        .with_context(|| format!("Failed to bind listener on {}", config.listen))?;
    let listener = Arc::new(listener);

    tokio::select! {
        result = Arc::clone(&listener).run() => {
            if let Err(e) = &result {
                error!(error = %e, "Listener error");
            }
            result.context("Listener failed")?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    for backend in pool.stats() {
        info!(
            backend = backend.id,
            bytes_written = backend.bytes_written,
            write_failures = backend.write_failures,
            "Backend totals"
        );
    }

    Ok(())
}

/// Initialize tracing (prefer RUST_LOG, fall back to --log-level).
fn init_tracing(config: &RelayConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);

    match config.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
