//! Background periodic tasks.
//!
//! Each loop owns a child cancellation token and exits promptly when it
//! fires; a failed cycle is logged and retried on the next tick, never
//! allowed to take the process down.

use crate::metrics;
use crate::state::AppState;
use depot_metadata::models::StorageHealthRow;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// How much endpoint health history to retain (7 days).
const HEALTH_HISTORY_RETENTION: time::Duration = time::Duration::days(7);

/// Spawn the orphan cleanup loop.
pub fn spawn_orphan_cleanup(state: AppState) -> JoinHandle<()> {
    let cancel = state.shutdown.child_token();
    let config = state.config.cleanup.clone();
    let engine = state.engine.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup isn't
        // deleting anything before the server is even listening.
        ticker.tick().await;

        tracing::info!(
            interval_secs = config.interval_secs,
            retention_secs = config.retention_secs,
            "orphan cleanup task started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match engine
                        .cleanup_orphans(config.retention(), config.batch_size)
                        .await
                    {
                        Ok((count, bytes)) if count > 0 => {
                            tracing::info!(count, bytes, "orphan cleanup cycle complete");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            tracing::error!(error = %e,
                                "orphan cleanup cycle failed, retrying next tick");
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("orphan cleanup task stopped");
                    return;
                }
            }
        }
    })
}

/// Spawn the endpoint health sweep loop.
pub fn spawn_health_sweep(state: AppState) -> JoinHandle<()> {
    let cancel = state.shutdown.child_token();
    let config = state.config.health.clone();
    let storage = state.storage.clone();
    let metadata = state.metadata.clone();

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        tracing::info!(
            interval_secs = config.interval_secs,
            failure_threshold = config.failure_threshold,
            "storage health sweep task started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = storage
                        .health_sweep(config.probe_timeout(), config.failure_threshold)
                        .await;

                    if let Some((old_id, new_id)) = &report.promotion {
                        metrics::PRIMARY_PROMOTIONS.inc();
                        tracing::warn!(
                            demoted = %old_id,
                            promoted = %new_id,
                            "health sweep promoted a new primary"
                        );
                    }

                    for probe in &report.probes {
                        if !probe.healthy {
                            metrics::HEALTH_PROBES_FAILED
                                .with_label_values(&[probe.endpoint_id.as_str()])
                                .inc();
                        }
                        let row = StorageHealthRow {
                            endpoint_id: probe.endpoint_id.clone(),
                            checked_at: OffsetDateTime::now_utc(),
                            healthy: probe.healthy,
                            latency_ms: probe.latency.as_millis().min(i64::MAX as u128) as i64,
                            error: probe.error.clone(),
                        };
                        if let Err(e) = metadata.record_health(&row).await {
                            tracing::error!(endpoint = %probe.endpoint_id, error = %e,
                                "failed to record health probe");
                        }
                    }

                    // Keep the time series bounded.
                    let cutoff = OffsetDateTime::now_utc() - HEALTH_HISTORY_RETENTION;
                    if let Err(e) = metadata.prune_health(cutoff).await {
                        tracing::debug!(error = %e, "failed to prune health history");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::info!("storage health sweep task stopped");
                    return;
                }
            }
        }
    })
}
