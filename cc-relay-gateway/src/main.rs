//! # cc-relay Binary
//!
//! Entry point for the relay server.
//!
//! ```bash
//! # Default configuration file (cc-relay.toml)
//! cc-relay
//!
//! # Explicit configuration, host and port
//! cc-relay --config relay.toml --host 0.0.0.0 --port 8787
//! ```
//!
//! SIGHUP reloads the configuration file in place; SIGINT/SIGTERM drain
//! in-flight requests for the configured window and exit. The process
//! exits non-zero on a fatal startup error (invalid configuration or a
//! listener bind failure).

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;

use cc_relay_gateway::config::{Config, LogFormat};
use cc_relay_gateway::lifecycle::Lifecycle;
use cc_relay_gateway::server::create_server;

/// Command line arguments for the relay.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "cc-relay.toml")]
    config: String,

    /// Override the configured listen port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured listen host.
    #[arg(long)]
    host: Option<String>,

    /// Log filter, e.g. "info" or "cc_relay_gateway=debug".
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = Config::load(&args.config)?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }

    let filter = args
        .log_level
        .unwrap_or_else(|| config.logging.level.clone());
    match config.logging.format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        LogFormat::Compact => tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    // The listener address and HTTP/2 flag are fixed for the process
    // lifetime; everything else reloads on SIGHUP.
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    let drain_timeout = config.server.drain_timeout();

    let lifecycle = Lifecycle::new(config, Some(args.config.clone())).await?;
    let app = create_server(Arc::clone(&lifecycle));

    // SIGHUP → reload loop.
    {
        let lifecycle = Arc::clone(&lifecycle);
        tokio::spawn(async move {
            let Ok(mut hangup) =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            else {
                return;
            };
            while hangup.recv().await.is_some() {
                tracing::info!("SIGHUP received, reloading configuration");
                lifecycle.reload_from_file().await;
            }
        });
    }

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "cc-relay listening");

    // The serve task stops accepting on the first signal and then drains;
    // the drain window bounds how long in-flight requests may take.
    let (stopping_tx, mut stopping_rx) = tokio::sync::watch::channel(false);
    let mut server = tokio::spawn(async move {
        let shutdown = async move {
            shutdown_signal().await;
            let _ = stopping_tx.send(true);
        };
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await
    });

    tokio::select! {
        result = &mut server => result??,
        _ = stopping_rx.changed() => {
            tracing::info!(drain_secs = drain_timeout.as_secs(), "draining in-flight requests");
            match tokio::time::timeout(drain_timeout, &mut server).await {
                Ok(result) => result??,
                Err(_) => {
                    tracing::warn!("drain window elapsed, aborting remaining requests");
                    server.abort();
                }
            }
        }
    }

    // Handler drained first, then the background workers.
    lifecycle.shutdown().await;
    tracing::info!("cc-relay stopped");
    Ok(())
}

/// Resolve when the process should stop accepting requests.
async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
