//! Admin handlers. Every route here requires the admin role.

use crate::auth::AuthContext;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde::Deserialize;
use std::time::Duration;

/// GET /healthz - unauthenticated liveness probe for load balancers.
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({"status": "ok"})))
}

/// GET /api/v1/admin/health - full health view: metadata connectivity,
/// endpoint circuit/role state, and the latest persisted probes.
pub async fn health(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    let metadata_ok = state.metadata.health_check().await.is_ok();
    let endpoints = state.storage.endpoint_statuses();
    let latest_probes = state.metadata.latest_health().await.unwrap_or_default();

    let all_healthy = metadata_ok
        && latest_probes.iter().all(|p| p.healthy)
        && endpoints.iter().any(|e| e.role == "primary" && e.enabled);

    Ok(Json(serde_json::json!({
        "status": if all_healthy { "ok" } else { "degraded" },
        "metadata": if metadata_ok { "ok" } else { "unreachable" },
        "primary": state.storage.primary_id(),
        "endpoints": endpoints,
        "latest_probes": latest_probes,
    })))
}

/// GET /api/v1/admin/stats - deduplication, storage, and limiter stats.
pub async fn stats(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    let dedup = state.engine.stats().await?;
    let rate_limiter = state.rate_limiter.stats();
    let endpoints = state.storage.endpoint_statuses();

    Ok(Json(serde_json::json!({
        "deduplication": dedup,
        "rate_limiter": rate_limiter,
        "endpoints": endpoints,
    })))
}

/// POST /api/v1/admin/storage/verify - recompute reference counts and
/// report drift without touching anything.
pub async fn verify_integrity(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    let issues = state.metadata.verify_integrity().await?;
    if !issues.is_empty() {
        tracing::warn!(count = issues.len(), "integrity verification found drift");
    }

    Ok(Json(serde_json::json!({
        "issues": issues,
        "count": issues.len(),
    })))
}

/// POST /api/v1/admin/storage/repair - overwrite drifted counts with the
/// recomputed truth.
pub async fn repair_integrity(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    let repaired = state.metadata.repair_integrity().await?;
    if repaired > 0 {
        tracing::warn!(repaired, "integrity repair rewrote reference counts");
    }

    Ok(Json(serde_json::json!({ "repaired": repaired })))
}

/// Optional override for one cleanup run.
#[derive(Debug, Deserialize)]
pub struct CleanupParams {
    pub retention_secs: Option<u64>,
}

/// POST /api/v1/admin/cleanup/orphans - run one orphan cleanup pass now.
pub async fn cleanup_orphans(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Query(params): Query<CleanupParams>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;

    let retention = params
        .retention_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| state.config.cleanup.retention());

    let (deleted, bytes) = state
        .engine
        .cleanup_orphans(retention, state.config.cleanup.batch_size)
        .await?;

    Ok(Json(serde_json::json!({
        "deleted": deleted,
        "bytes_reclaimed": bytes,
        "retention_secs": retention.as_secs(),
    })))
}

fn validate_ip(ip: &str) -> ApiResult<()> {
    ip.parse::<std::net::IpAddr>()
        .map(|_| ())
        .map_err(|_| ApiError::Validation(format!("invalid IP address: {ip}")))
}

/// POST /api/v1/admin/blacklist/{ip} - deny an address unconditionally.
pub async fn blacklist_ip(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(ip): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;
    validate_ip(&ip)?;

    let added = state.rate_limiter.add_to_blacklist(&ip);
    tracing::info!(ip = %ip, added, "IP blacklisted");

    Ok(Json(serde_json::json!({
        "ip": ip,
        "blacklisted": true,
        "added": added,
    })))
}

/// DELETE /api/v1/admin/blacklist/{ip} - lift a blacklist entry.
pub async fn unblacklist_ip(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(ip): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    auth.require_admin()?;
    validate_ip(&ip)?;

    let removed = state.rate_limiter.remove_from_blacklist(&ip);
    tracing::info!(ip = %ip, removed, "IP removed from blacklist");

    Ok(Json(serde_json::json!({
        "ip": ip,
        "blacklisted": false,
        "removed": removed,
    })))
}
