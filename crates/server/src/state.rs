//! Application state shared across handlers.

use crate::dedup::{DedupEngine, EngineConfig};
use crate::ratelimit::RateLimiter;
use crate::scan::{BasicScanner, NoopScanner, Scanner};
use crate::validate::Validator;
use depot_core::config::AppConfig;
use depot_metadata::MetadataStore;
use depot_storage::Orchestrator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state. Constructed once at startup; every field is a
/// handle, so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Metadata store (reference counting, quotas, health records).
    pub metadata: Arc<dyn MetadataStore>,
    /// Storage orchestrator.
    pub storage: Arc<Orchestrator>,
    /// Upload/download engine.
    pub engine: Arc<DedupEngine>,
    /// Admission control.
    pub rate_limiter: RateLimiter,
    /// Input validation.
    pub validator: Arc<Validator>,
    /// Root cancellation token; child tokens drive background tasks and
    /// in-flight uploads at shutdown.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create application state from validated configuration and
    /// constructed stores.
    ///
    /// # Panics
    ///
    /// Panics if the configuration fails validation; `AppConfig::validate`
    /// should have been called (and its warnings logged) beforehand.
    pub fn new(
        config: AppConfig,
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<Orchestrator>,
    ) -> Self {
        match config.validate() {
            Ok(warnings) => {
                for warning in warnings {
                    tracing::warn!("configuration warning: {warning}");
                }
            }
            Err(error) => panic!("invalid configuration: {error}"),
        }

        let scanner: Arc<dyn Scanner> = if config.security.scan_enabled {
            Arc::new(BasicScanner::new(&config.security))
        } else {
            Arc::new(NoopScanner)
        };

        let engine = Arc::new(DedupEngine::new(
            metadata.clone(),
            storage.clone(),
            scanner,
            EngineConfig {
                spool_threshold_bytes: config.server.spool_threshold_bytes,
                max_upload_size_bytes: config.server.max_upload_size_bytes,
                scan_enabled: config.security.scan_enabled,
                quota_enabled: config.quota.enabled,
                quota_default_limit_bytes: config.quota.default_limit_bytes.min(i64::MAX as u64)
                    as i64,
                quota_default_limit_files: config.quota.default_limit_files.min(i64::MAX as u64)
                    as i64,
            },
        ));

        let rate_limiter = RateLimiter::new(&config.rate_limit);
        let validator = Arc::new(Validator::new(config.validation.clone()));

        Self {
            config: Arc::new(config),
            metadata,
            storage,
            engine,
            rate_limiter,
            validator,
            shutdown: CancellationToken::new(),
        }
    }
}
