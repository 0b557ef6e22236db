//! Storage backends and replication orchestration for depot.
//!
//! A [`ObjectStore`] adapter wraps one physical backend (filesystem or S3).
//! The [`Orchestrator`] owns every configured adapter and implements the
//! replication policy, read failover, endpoint health tracking, and primary
//! promotion on top of them.

pub mod backends;
pub mod circuit;
pub mod error;
pub mod orchestrator;
pub mod spool;
pub mod traits;

pub use backends::{FilesystemBackend, S3Backend};
pub use circuit::{CircuitBreaker, CircuitState};
pub use error::{StorageError, StorageResult};
pub use orchestrator::{
    EndpointStatus, HealthProbe, Orchestrator, SweepReport, WriteReceipt,
};
pub use spool::{Spool, SpoolWriter};
pub use traits::{ByteStream, ObjectMeta, ObjectStore, StreamingUpload};

use depot_core::config::{BackendConfig, StorageConfig};
use std::sync::Arc;

/// Build an orchestrator from validated storage configuration, constructing
/// one adapter per configured endpoint.
pub async fn from_config(config: &StorageConfig) -> StorageResult<Arc<Orchestrator>> {
    let mut adapters: Vec<Arc<dyn ObjectStore>> = Vec::with_capacity(config.endpoints.len());
    for endpoint in &config.endpoints {
        let adapter: Arc<dyn ObjectStore> = match &endpoint.backend {
            BackendConfig::Filesystem { path } => Arc::new(FilesystemBackend::new(path).await?),
            BackendConfig::S3 {
                bucket,
                endpoint: url,
                region,
                prefix,
                access_key_id,
                secret_access_key,
                force_path_style,
            } => Arc::new(
                S3Backend::new(
                    bucket,
                    url.clone(),
                    region.clone(),
                    prefix.clone(),
                    access_key_id.clone(),
                    secret_access_key.clone(),
                    *force_path_style,
                )
                .await?,
            ),
        };
        tracing::info!(
            endpoint = %endpoint.id,
            backend = adapter.backend_name(),
            role = endpoint.role.as_str(),
            priority = endpoint.priority,
            enabled = endpoint.enabled,
            "storage endpoint configured"
        );
        adapters.push(adapter);
    }
    Ok(Arc::new(Orchestrator::new(config, adapters)))
}
