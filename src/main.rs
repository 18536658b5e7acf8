mod cache;
mod config;
mod git;
mod http;
mod lock;
mod metrics;
mod protocol;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::cleaner::{CacheCleaner, CLEAN_INTERVAL, TMP_GRACE};
use crate::cache::lfs::LfsCache;
use crate::cache::pack::PackCache;
use crate::config::Config;
use crate::git::RepoMirror;
use crate::lock::PathLocks;
use crate::metrics::Metrics;

/// Upstream connect timeout; reads get per-flow budgets instead.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub http_client: reqwest::Client,
    pub mirror: RepoMirror,
    pub pack_cache: PackCache,
    pub lfs_cache: LfsCache,
    pub metrics: Arc<Metrics>,
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

async fn run_http_server(state: AppState) -> Result<()> {
    let listen_addr: std::net::SocketAddr = state
        .config
        .listen_addr
        .parse()
        .context("invalid listen address")?;

    let app = http::handler::create_router(Arc::new(state));

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Background eviction
// ---------------------------------------------------------------------------

async fn run_eviction(cleaners: Vec<CacheCleaner>) {
    let mut ticker = tokio::time::interval(CLEAN_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for cleaner in &cleaners {
                    if let Err(e) = cleaner.sweep().await {
                        warn!(error = %e, "eviction sweep failed");
                    }
                }
            }
            () = shutdown_signal() => {
                info!("eviction loop stopping");
                return;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- Config ----
    let config = Config::parse();
    config.validate()?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_new(&config.log_level)
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        upstream = %config.upstream_base(),
        workdir = %config.working_directory.display(),
        "starting gitcdn"
    );

    // ---- Cache directories ----
    for dir in [
        config.git_root(),
        config.pack_cache_root(),
        config.lfs_root(),
    ] {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create cache dir: {}", dir.display()))?;
    }

    // ---- Upstream client ----
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("gitcdn/", env!("CARGO_PKG_VERSION")))
        .connect_timeout(CONNECT_TIMEOUT)
        .pool_max_idle_per_host(config.max_connections)
        .build()
        .context("failed to build HTTP client")?;

    // ---- Core components ----
    let locks = PathLocks::new();
    let metrics = Arc::new(Metrics::new());

    let mirror = RepoMirror::new(
        config.git_root(),
        config.upstream_base(),
        locks.clone(),
        config.lock_timeout(),
    );
    let pack_cache = PackCache::new(
        config.pack_cache_root(),
        locks.clone(),
        config.lock_timeout(),
        config.upload_pack_timeout(),
    );
    let lfs_cache = LfsCache::new(
        config.lfs_root(),
        locks.clone(),
        config.lock_timeout(),
        // LFS downloads get a tighter budget than pack builds.
        cache::lfs::DOWNLOAD_TIMEOUT,
        config.upstream_base(),
    );

    // ---- Cleaners ----
    let pack_cleaner = CacheCleaner::new(
        config.pack_cache_root(),
        config.pack_cache_max_bytes(),
        Some(config.pack_cache_max_age()),
        pack_cache.store().readers().clone(),
    );
    let lfs_cleaner = CacheCleaner::new(
        config.lfs_root(),
        config.lfs_cache_max_bytes(),
        None,
        lfs_cache.store().readers().clone(),
    );

    // Debris from crashed workers; safe before any producer starts.
    for cleaner in [&pack_cleaner, &lfs_cleaner] {
        match cleaner.sweep_stale_tmp(TMP_GRACE) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "startup tempfile sweep"),
            Err(e) => warn!(error = %e, "startup tempfile sweep failed"),
        }
    }

    // ---- App state ----
    let state = AppState {
        config: Arc::clone(&config),
        http_client,
        mirror,
        pack_cache,
        lfs_cache,
        metrics,
    };

    // ---- Spawn services ----
    let eviction_handle = tokio::spawn(run_eviction(vec![pack_cleaner, lfs_cleaner]));

    run_http_server(state).await?;

    eviction_handle.abort();
    info!("gitcdn shut down cleanly");
    Ok(())
}
