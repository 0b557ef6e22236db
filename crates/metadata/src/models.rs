//! Database models mapping to the metadata schema.

use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

// =============================================================================
// Content objects
// =============================================================================

/// One unique byte sequence, stored once and shared by every reference.
///
/// `ref_count` is owned exclusively by the store's attach/detach/repair
/// operations; nothing else writes it.
#[derive(Debug, Clone, FromRow)]
pub struct ContentObjectRow {
    pub content_hash: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub extension: String,
    pub ref_count: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    pub last_accessed_at: OffsetDateTime,
}

/// Fields needed to create a content object on first upload of a hash.
#[derive(Debug, Clone)]
pub struct NewContentObject {
    pub content_hash: String,
    pub size_bytes: i64,
    pub mime_type: String,
    pub extension: String,
}

// =============================================================================
// References
// =============================================================================

/// A named, entity-scoped pointer at a content object.
#[derive(Debug, Clone, FromRow)]
pub struct ReferenceRow {
    pub reference_id: Uuid,
    pub content_hash: String,
    pub entity_type: String,
    pub entity_id: String,
    pub filename: String,
    pub uploader_id: String,
    pub description: Option<String>,
    /// JSON-encoded array of tag strings.
    pub tags_json: String,
    pub created_at: OffsetDateTime,
    pub modified_at: OffsetDateTime,
    pub deleted_at: Option<OffsetDateTime>,
}

impl ReferenceRow {
    /// Decode the tag set. Malformed stored JSON yields an empty set rather
    /// than failing a read path.
    pub fn tags(&self) -> Vec<String> {
        serde_json::from_str(&self.tags_json).unwrap_or_default()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields needed to insert a reference row.
#[derive(Debug, Clone)]
pub struct NewReference {
    pub reference_id: Uuid,
    pub content_hash: String,
    pub entity_type: String,
    pub entity_id: String,
    pub filename: String,
    pub uploader_id: String,
    pub description: Option<String>,
    pub tags: Vec<String>,
}

impl NewReference {
    pub fn tags_json(&self) -> String {
        serde_json::to_string(&self.tags).unwrap_or_else(|_| "[]".to_string())
    }
}

/// Search filter for reference listings.
#[derive(Debug, Clone, Default)]
pub struct ReferenceSearch {
    /// Substring match on filename.
    pub filename_contains: Option<String>,
    /// Exact entity type match.
    pub entity_type: Option<String>,
    /// References carrying this tag.
    pub tag: Option<String>,
    /// Uploads by this user.
    pub uploader_id: Option<String>,
    pub limit: u32,
    pub offset: u32,
}

// =============================================================================
// Storage health
// =============================================================================

/// One health probe observation for a storage endpoint.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct StorageHealthRow {
    pub endpoint_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub checked_at: OffsetDateTime,
    pub healthy: bool,
    pub latency_ms: i64,
    pub error: Option<String>,
}

// =============================================================================
// Quotas
// =============================================================================

/// Per-user upload quota and usage counters.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct QuotaRow {
    pub user_id: String,
    pub used_bytes: i64,
    pub used_files: i64,
    pub limit_bytes: i64,
    pub limit_files: i64,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

// =============================================================================
// Integrity
// =============================================================================

/// A divergence between the stored ref_count and the live reference count.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct IntegrityIssue {
    pub content_hash: String,
    pub recorded_ref_count: i64,
    pub actual_ref_count: i64,
}

/// Aggregate storage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StorageStats {
    /// Distinct content objects.
    pub total_files: i64,
    /// Live (non-soft-deleted) references.
    pub total_references: i64,
    /// Content objects with exactly one reference.
    pub unique_files: i64,
    /// Content objects shared by multiple references.
    pub shared_files: i64,
    /// Content objects with zero references awaiting cleanup.
    pub orphaned_files: i64,
    /// Physical bytes stored (each blob counted once).
    pub physical_bytes: i64,
    /// Logical bytes as seen by uploaders (size x ref_count).
    pub logical_bytes: i64,
    /// Bytes avoided by deduplication.
    pub saved_bytes: i64,
}
