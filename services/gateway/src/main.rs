//! Acroxy gateway
//!
//! Single-binary Rust service that:
//! 1. Loads a pool of Cloud Code accounts from the account file
//! 2. Listens for Anthropic Messages API requests
//! 3. Translates each request to a Cloud Code generation call
//! 4. Dispatches it through the pool, falling back across accounts and models
//! 5. Translates the answer (or SSE stream) back to the Messages API shape

mod config;
mod dispatch;
mod error;
mod metrics;
mod provider_impl;
mod routes;
mod service;
mod stream;
mod translate;
mod usage;

#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use account_pool::{AccountPool, TokenBroker, spawn_refresh_task};
use anyhow::{Context, Result};
use cloudcode::{AccountStore, CloudCodeClient, TokenClient};
use provider::Upstream;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::dispatch::{DispatchSettings, Dispatcher};
use crate::provider_impl::CloudCodeUpstream;
use crate::routes::{AppState, build_router};
use crate::service::ProxyServer;
use crate::usage::UsageHistory;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting acroxy");

    // Install Prometheus metrics recorder before any metrics are emitted
    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    // CLI: --config <path> and --fallback
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    config.apply_cli(&args);

    info!(
        listen_addr = %config.server.listen_addr,
        accounts_path = %config.accounts.path.display(),
        base_urls = config.upstream.base_urls.len(),
        fallback = config.dispatch.fallback,
        model_mappings = config.model_mapping.len(),
        "configuration loaded"
    );

    let client_secret = config
        .oauth
        .client_secret
        .take()
        .context("OAuth client secret missing")?;
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.upstream.timeout_secs))
        .build()
        .context("failed to build HTTP client")?;
    let upstream: Arc<dyn Upstream> = Arc::new(CloudCodeUpstream::new(
        TokenClient::new(http.clone(), config.oauth.client_id.clone(), client_secret),
        CloudCodeClient::new(http, config.upstream.base_urls.clone()),
    ));

    let store = Arc::new(AccountStore::new(config.accounts.path.clone()));
    let pool = Arc::new(AccountPool::new(store));
    // Requests retry initialization, so a bad account file is not fatal here
    if let Err(e) = pool.initialize().await {
        warn!(error = %e, "account pool not initialized at startup");
    }

    let broker = Arc::new(TokenBroker::new(
        pool.clone(),
        upstream,
        Duration::from_secs(config.accounts.token_refresh_margin_secs),
    ));
    let refresh_task = (config.accounts.background_refresh_secs > 0).then(|| {
        spawn_refresh_task(
            broker.clone(),
            Duration::from_secs(config.accounts.background_refresh_secs),
        )
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let usage = Arc::new(UsageHistory::new());
    let dispatcher = Arc::new(Dispatcher::new(
        broker.clone(),
        DispatchSettings {
            model_mapping: config.model_mapping.clone(),
            model_fallbacks: config.model_fallbacks.clone(),
            default_cooldown: Duration::from_secs(config.accounts.default_cooldown_secs),
        },
        usage.clone(),
        shutdown_rx,
    ));

    let app_state = AppState {
        pool,
        broker,
        dispatcher,
        usage,
        fallback_enabled: config.dispatch.fallback,
        prometheus: prometheus_handle,
    };
    let app = build_router(
        app_state,
        config.server.max_connections,
        config.body_limit_bytes(),
    );

    let server = ProxyServer::new(app, shutdown_tx);
    let bound = server
        .start(config.server.listen_addr)
        .await
        .with_context(|| format!("failed to start on {}", config.server.listen_addr))?;
    info!(addr = %bound, "accepting requests");

    shutdown_signal().await;

    server.stop().await;
    if let Some(task) = refresh_task {
        task.abort();
    }

    info!("shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
///
/// A handler that fails to install is logged and never fires.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
