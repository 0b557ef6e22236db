//! Route configuration.

use crate::auth::auth_middleware;
use crate::handlers::{admin, attachments, download, uploads};
use crate::metrics::metrics_handler;
use crate::ratelimit::{RateLimitLayer, rate_limit_middleware};
use crate::state::AppState;
use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, patch, post};
use tower_http::trace::TraceLayer;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        // Upload surface
        .route("/upload", post(uploads::upload))
        .route("/upload/multiple", post(uploads::upload_multiple))
        // Read surface
        .route("/download/{reference_id}", get(download::download))
        .route("/view/{reference_id}", get(download::view))
        .route("/info/{reference_id}", get(download::info))
        // Reference management
        .route(
            "/attachments/search",
            get(attachments::search),
        )
        .route(
            "/attachments/hash/{file_hash}",
            get(attachments::list_by_hash),
        )
        .route(
            "/attachments/{entity_type}/{entity_id}",
            get(attachments::list_by_entity),
        )
        .route(
            "/attachments/{reference_id}",
            patch(attachments::update).delete(attachments::delete),
        )
        // Admin surface (handlers enforce the admin role)
        .route("/admin/health", get(admin::health))
        .route("/admin/stats", get(admin::stats))
        .route("/admin/storage/verify", post(admin::verify_integrity))
        .route("/admin/storage/repair", post(admin::repair_integrity))
        .route("/admin/cleanup/orphans", post(admin::cleanup_orphans))
        .route(
            "/admin/blacklist/{ip}",
            post(admin::blacklist_ip).delete(admin::unblacklist_ip),
        );

    let mut router = Router::new()
        .nest("/api/v1", api_routes)
        // Liveness probe, intentionally unauthenticated for load balancers.
        .route("/healthz", get(admin::healthz));

    // The /metrics endpoint is config-gated; when enabled it must be
    // network-restricted to scraper IPs at the infrastructure level.
    if state.config.server.metrics_enabled {
        router = router.route("/metrics", get(metrics_handler));
    }

    let rate_limit_layer = RateLimitLayer {
        limiter: state.rate_limiter.clone(),
        upload_cost: state.config.rate_limit.upload_cost,
        download_cost: state.config.rate_limit.download_cost,
    };

    // Body limit leaves headroom over the max upload size for multipart
    // framing and text fields.
    let body_limit = (state.config.server.max_upload_size_bytes as usize)
        .saturating_add(1024 * 1024);

    // Middleware layers are applied in reverse order (outermost last).
    // Execution order: TraceLayer -> auth -> rate limit -> handler.
    router
        .layer(middleware::from_fn_with_state(
            rate_limit_layer,
            rate_limit_middleware,
        ))
        .layer(middleware::from_fn(auth_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}
