//! Upload quota repository.

use crate::error::MetadataResult;
use crate::models::QuotaRow;
use async_trait::async_trait;

/// Repository for per-user upload quotas.
///
/// Reservation is a single conditional update so two concurrent uploads can
/// never jointly overshoot a user's budget.
#[async_trait]
pub trait QuotaRepo: Send + Sync {
    /// Get a user's quota row.
    async fn get_quota(&self, user_id: &str) -> MetadataResult<Option<QuotaRow>>;

    /// Create the quota row with the given limits if it doesn't exist yet,
    /// then return it.
    async fn ensure_quota(
        &self,
        user_id: &str,
        limit_bytes: i64,
        limit_files: i64,
    ) -> MetadataResult<QuotaRow>;

    /// Atomically reserve `size_bytes` and one file slot. Fails with
    /// `QuotaExceeded` (and no mutation) when either limit would be
    /// exceeded.
    async fn reserve_quota(&self, user_id: &str, size_bytes: i64) -> MetadataResult<()>;

    /// Return previously reserved usage, clamping at zero.
    async fn release_quota(&self, user_id: &str, size_bytes: i64) -> MetadataResult<()>;
}
