use anyhow::{Context, Result};
use clap::Parser;
use clickrank_core::StoreCell;
use clickrank_server::{build_app, cancel_on_signal, serve, AppState};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "clickrank-server")]
#[command(about = "Serve ranked search over WebSocket and HTTP", long_about = None)]
struct Args {
    /// Store snapshot path
    #[arg(long, default_value = "./cache.bin")]
    store: String,
    /// Host to bind, overrides the stored `address` setting
    #[arg(long)]
    host: Option<String>,
    /// Port to bind, overrides the stored `port` setting
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    fmt().with_env_filter(EnvFilter::from_default_env()).init();
    let args = Args::parse();

    let cell = StoreCell::new(&args.store);
    let store = cell.load();
    let settings = store.settings();

    let host = args.host.unwrap_or_else(|| settings.address());
    let port = match args.port {
        Some(p) => p,
        None => settings.port().context("invalid port setting")?,
    };
    if settings.ssl() {
        // TLS termination is left to a fronting proxy; the paths are only checked here.
        match (settings.cert(), settings.key()) {
            (Some(cert), Some(key)) => {
                tracing::warn!(cert = %cert.display(), key = %key.display(), "ssl is set but this server speaks plain ws")
            }
            _ => tracing::warn!("ssl is set without both cert and key, serving plain ws"),
        }
    }
    if store.engine().is_none() {
        tracing::warn!(store = %args.store, "no model stored yet, queries return nothing until the indexer builds one");
    }

    let shutdown = CancellationToken::new();
    let state = AppState::new(store.clone(), shutdown.clone())?;
    let app = build_app(state);

    tokio::spawn(cancel_on_signal(shutdown.clone()));

    let listener = TcpListener::bind((host.as_str(), port)).await.with_context(|| format!("bind {host}:{port}"))?;
    tracing::info!(addr = %listener.local_addr()?, "server listening");
    serve(listener, app, shutdown).await?;

    drop(cell);
    let saved = match Arc::try_unwrap(store) {
        Ok(store) => store.close(),
        Err(shared) => shared.save(),
    };
    if let Err(e) = saved {
        tracing::error!(error = %e, "final store save failed");
    }
    tracing::info!("server stopped");
    Ok(())
}
