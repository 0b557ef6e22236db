//! Prometheus metrics for the depot server.
//!
//! The `/metrics` endpoint is unauthenticated to allow scraping; restrict
//! it to scraper IPs at the infrastructure level when enabled.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Upload metrics
pub static UPLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_uploads_total", "Total successful uploads")
        .expect("metric creation failed")
});

pub static UPLOADS_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_uploads_deduplicated_total",
        "Uploads that matched existing content and wrote no blob",
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_bytes_uploaded_total",
        "Bytes written to storage (new content only)",
    )
    .expect("metric creation failed")
});

pub static BYTES_DEDUPLICATED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_bytes_deduplicated_total",
        "Bytes saved through deduplication",
    )
    .expect("metric creation failed")
});

pub static UPLOAD_ERRORS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new("depot_upload_errors_total", "Upload errors by type"),
        &["error_type"],
    )
    .expect("metric creation failed")
});

// Download metrics
pub static DOWNLOADS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new("depot_downloads_total", "Total successful downloads")
        .expect("metric creation failed")
});

pub static RANGE_REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_range_requests_total",
        "Downloads served as partial content",
    )
    .expect("metric creation failed")
});

// Admission metrics
pub static REQUESTS_RATE_LIMITED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_requests_rate_limited_total",
        "Requests denied by the rate limiter",
    )
    .expect("metric creation failed")
});

pub static SECURITY_REJECTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_security_rejections_total",
        "Uploads rejected by the content scanner",
    )
    .expect("metric creation failed")
});

// Background task metrics
pub static ORPHANS_CLEANED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_orphans_cleaned_total",
        "Orphaned content objects removed by cleanup",
    )
    .expect("metric creation failed")
});

pub static ORPHAN_BYTES_RECLAIMED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_orphan_bytes_reclaimed_total",
        "Bytes reclaimed by orphan cleanup",
    )
    .expect("metric creation failed")
});

pub static HEALTH_PROBES_FAILED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "depot_health_probes_failed_total",
            "Failed endpoint health probes by endpoint",
        ),
        &["endpoint"],
    )
    .expect("metric creation failed")
});

pub static PRIMARY_PROMOTIONS: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "depot_primary_promotions_total",
        "Times a backup endpoint was promoted to primary",
    )
    .expect("metric creation failed")
});

pub static ACTIVE_UPLOADS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new("depot_active_uploads", "Uploads currently in flight")
        .expect("metric creation failed")
});

pub static UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "depot_upload_duration_seconds",
            "Time to process one upload end to end",
        )
        .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
    )
    .expect("metric creation failed")
});

static REGISTER: Once = Once::new();

/// Register all metrics with the registry. Idempotent.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(UPLOADS_TOTAL.clone()),
            Box::new(UPLOADS_DEDUPLICATED.clone()),
            Box::new(BYTES_UPLOADED.clone()),
            Box::new(BYTES_DEDUPLICATED.clone()),
            Box::new(UPLOAD_ERRORS.clone()),
            Box::new(DOWNLOADS_TOTAL.clone()),
            Box::new(RANGE_REQUESTS_TOTAL.clone()),
            Box::new(REQUESTS_RATE_LIMITED.clone()),
            Box::new(SECURITY_REJECTIONS.clone()),
            Box::new(ORPHANS_CLEANED.clone()),
            Box::new(ORPHAN_BYTES_RECLAIMED.clone()),
            Box::new(HEALTH_PROBES_FAILED.clone()),
            Box::new(PRIMARY_PROMOTIONS.clone()),
            Box::new(ACTIVE_UPLOADS.clone()),
            Box::new(UPLOAD_DURATION.clone()),
        ];
        for collector in collectors {
            if let Err(e) = REGISTRY.register(collector) {
                tracing::warn!(error = %e, "failed to register metric");
            }
        }
    });
}

/// GET /metrics - Prometheus text exposition.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::error!(error = %e, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new()).into_response();
    }
    (
        StatusCode::OK,
        [("Content-Type", prometheus::TEXT_FORMAT)],
        buffer,
    )
        .into_response()
}
