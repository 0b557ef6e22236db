//! Reference repository.
//!
//! `attach` and `detach` are the only operations that mutate `ref_count`,
//! and both do it with a conditional SQL update inside a transaction, never
//! with an application-level read-modify-write. Concurrent callers against
//! the same hash therefore linearize in the database and the final count is
//! always the net of all increments and decrements.

use crate::error::MetadataResult;
use crate::models::{NewContentObject, NewReference, ReferenceRow, ReferenceSearch};
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for reference rows and the atomic ref-count transitions.
#[async_trait]
pub trait ReferenceRepo: Send + Sync {
    /// Attach a reference to content in one transaction.
    ///
    /// Upserts the content row: created with `ref_count = 1` if the hash is
    /// new (the caller must already have written the blob), incremented
    /// otherwise. The reference insert and the count change are never
    /// separably visible.
    async fn attach(
        &self,
        content: &NewContentObject,
        reference: &NewReference,
    ) -> MetadataResult<ReferenceRow>;

    /// Soft-delete a reference and decrement its content's ref_count in one
    /// transaction. Decrementing a count that is already zero is reported
    /// as an integrity violation, never clamped.
    async fn detach(&self, reference_id: Uuid) -> MetadataResult<ReferenceRow>;

    /// Get a live (non-soft-deleted) reference.
    async fn get_reference(&self, reference_id: Uuid) -> MetadataResult<Option<ReferenceRow>>;

    /// Live references attached to one entity, newest first.
    async fn list_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> MetadataResult<Vec<ReferenceRow>>;

    /// Live references sharing one content hash.
    async fn list_by_hash(&self, content_hash: &str) -> MetadataResult<Vec<ReferenceRow>>;

    /// Filtered reference search.
    async fn search_references(
        &self,
        search: &ReferenceSearch,
    ) -> MetadataResult<Vec<ReferenceRow>>;

    /// Update a live reference's description and/or tags.
    async fn update_reference(
        &self,
        reference_id: Uuid,
        description: Option<Option<String>>,
        tags: Option<Vec<String>>,
    ) -> MetadataResult<ReferenceRow>;
}
