//! Depot server binary.

use anyhow::{Context, Result};
use clap::Parser;
use depot_core::config::AppConfig;
use depot_server::{AppState, create_router};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use std::net::SocketAddr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Depot - content-addressable attachment storage
#[derive(Parser, Debug)]
#[command(name = "depotd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        env = "DEPOT_CONFIG",
        default_value = "config/depot.toml"
    )]
    config: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("depot v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration (file is optional, env vars can provide/override
    // everything).
    let config_path = std::path::Path::new(&args.config);
    let mut figment = Figment::new();
    let has_config_file = config_path.exists();

    if has_config_file {
        tracing::info!(config_path = %args.config, "loading configuration from file");
        figment = figment.merge(Toml::file(&args.config));
    }

    let has_env_config =
        std::env::vars().any(|(key, _)| key.starts_with("DEPOT_") && key != "DEPOT_CONFIG");

    if !has_config_file && !has_env_config {
        anyhow::bail!(
            "No configuration provided.\n\n\
             Provide configuration via one of:\n  \
             1. Config file: depotd --config /path/to/depot.toml\n  \
             2. Environment variables: DEPOT_SERVER__BIND=0.0.0.0:8080 depotd\n\n\
             At minimum one [[storage.endpoints]] entry with role = \"primary\" is required."
        );
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("DEPOT_").split("__"))
        .extract()
        .context("failed to load configuration")?;

    // Fail fast on invalid topology (e.g. zero or two enabled primaries).
    let warnings = config
        .validate()
        .map_err(|e| anyhow::anyhow!("invalid configuration: {e}"))?;
    for warning in warnings {
        tracing::warn!("configuration warning: {warning}");
    }

    depot_server::metrics::register_metrics();

    // Storage endpoints and orchestrator.
    let storage = depot_storage::from_config(&config.storage)
        .await
        .context("failed to initialize storage endpoints")?;

    // Probe every endpoint once before accepting traffic so configuration
    // errors surface at startup rather than on the first upload.
    let report = storage
        .health_sweep(config.health.probe_timeout(), u32::MAX)
        .await;
    for probe in &report.probes {
        if probe.healthy {
            tracing::info!(
                endpoint = %probe.endpoint_id,
                latency_ms = probe.latency.as_millis() as u64,
                "storage endpoint reachable"
            );
        } else {
            tracing::warn!(
                endpoint = %probe.endpoint_id,
                error = ?probe.error,
                "storage endpoint unreachable at startup"
            );
        }
    }

    // Metadata store.
    let metadata = depot_metadata::from_config(&config.metadata)
        .await
        .context("failed to initialize metadata store")?;
    tracing::info!("metadata store initialized");

    let cleanup_enabled = config.cleanup.enabled;
    let health_enabled = config.health.enabled;
    let rate_limit_cleanup_interval =
        std::time::Duration::from_secs(config.rate_limit.cleanup_interval_secs.max(1));

    let state = AppState::new(config.clone(), metadata, storage);

    // Background tasks, each on its own child cancellation token.
    if cleanup_enabled {
        depot_server::tasks::spawn_orphan_cleanup(state.clone());
    }
    if health_enabled {
        depot_server::tasks::spawn_health_sweep(state.clone());
    }
    if state.rate_limiter.is_enabled() {
        depot_server::ratelimit::spawn_cleanup_task(
            state.rate_limiter.clone(),
            rate_limit_cleanup_interval,
            state.shutdown.child_token(),
        );
    }

    let shutdown = state.shutdown.clone();
    let app = create_router(state);

    let addr: SocketAddr = config.server.bind.parse().context("invalid bind address")?;
    tracing::info!("listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received, stopping background tasks");
        shutdown.cancel();
    })
    .await?;

    Ok(())
}
