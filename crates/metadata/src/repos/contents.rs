//! Content object repository.

use crate::error::MetadataResult;
use crate::models::{ContentObjectRow, IntegrityIssue, StorageStats};
use async_trait::async_trait;
use time::OffsetDateTime;

/// Repository for content object reads, orphan cleanup, and ref-count
/// integrity.
#[async_trait]
pub trait ContentRepo: Send + Sync {
    /// Get a content object by hash.
    async fn get_content(&self, content_hash: &str) -> MetadataResult<Option<ContentObjectRow>>;

    /// Check whether a content object exists.
    async fn content_exists(&self, content_hash: &str) -> MetadataResult<bool>;

    /// Update the last-accessed timestamp.
    async fn touch_content(
        &self,
        content_hash: &str,
        accessed_at: OffsetDateTime,
    ) -> MetadataResult<()>;

    /// List orphans (ref_count = 0) whose last mutation is older than
    /// `older_than`, oldest first.
    async fn find_orphaned(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ContentObjectRow>>;

    /// Atomically delete orphaned content rows and return what was deleted.
    ///
    /// Each row delete re-checks `ref_count = 0` inside the deleting
    /// transaction, so a hash re-attached between the scan and the delete
    /// survives. Blob deletion happens after this call; a blob whose delete
    /// fails is retried on the next cleanup cycle.
    async fn delete_orphaned_atomic(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ContentObjectRow>>;

    /// Compare every stored ref_count against the live reference count.
    /// Read-only; returns one issue per mismatch.
    async fn verify_integrity(&self) -> MetadataResult<Vec<IntegrityIssue>>;

    /// Overwrite every mismatched ref_count with the recomputed true value.
    /// Returns the number of rows repaired.
    async fn repair_integrity(&self) -> MetadataResult<u64>;

    /// Aggregate storage statistics.
    async fn storage_stats(&self) -> MetadataResult<StorageStats>;
}
