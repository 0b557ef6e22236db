//! Storage health repository.

use crate::error::MetadataResult;
use crate::models::StorageHealthRow;
use async_trait::async_trait;

/// Repository for the endpoint health time series.
#[async_trait]
pub trait HealthRepo: Send + Sync {
    /// Append one probe observation.
    async fn record_health(&self, probe: &StorageHealthRow) -> MetadataResult<()>;

    /// Most recent probes for one endpoint, newest first.
    async fn recent_health(
        &self,
        endpoint_id: &str,
        limit: u32,
    ) -> MetadataResult<Vec<StorageHealthRow>>;

    /// Most recent probe per endpoint.
    async fn latest_health(&self) -> MetadataResult<Vec<StorageHealthRow>>;

    /// Drop observations older than the cutoff; returns rows removed.
    async fn prune_health(&self, older_than: time::OffsetDateTime) -> MetadataResult<u64>;
}
