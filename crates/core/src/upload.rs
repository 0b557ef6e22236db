//! Upload domain types.

use crate::hash::ContentHash;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Validated metadata accompanying an upload.
///
/// All string fields are expected to have passed the input validator before
/// this struct is constructed; the engine treats them as clean.
#[derive(Debug, Clone)]
pub struct UploadMetadata {
    /// Business object kind the attachment belongs to (e.g. "ticket").
    pub entity_type: String,
    /// Business object identifier.
    pub entity_id: String,
    /// Logical filename at upload time, independent of content.
    pub filename: String,
    /// Authenticated uploader.
    pub uploader_id: String,
    /// Declared or sniffed MIME type.
    pub mime_type: String,
    /// File extension without the dot, lowercase.
    pub extension: String,
    /// Optional free-form description.
    pub description: Option<String>,
    /// Unordered tag set.
    pub tags: Vec<String>,
}

/// Outcome of a processed upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResult {
    /// Newly created reference id.
    pub reference_id: Uuid,
    /// Content hash of the uploaded bytes.
    pub content_hash: ContentHash,
    /// Size of the uploaded content.
    pub size_bytes: u64,
    /// True when an identical blob already existed and no storage write
    /// happened.
    pub deduplicated: bool,
    /// Bytes not written because of deduplication (equals `size_bytes` on a
    /// dedup hit, zero otherwise).
    pub saved_bytes: u64,
}

/// Read-only aggregate view of deduplication effectiveness.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DedupStats {
    /// Distinct content objects stored.
    pub total_files: u64,
    /// Live references across all content.
    pub total_references: u64,
    /// Content objects with exactly one reference.
    pub unique_files: u64,
    /// Content objects with more than one reference.
    pub shared_files: u64,
    /// Content objects with zero references awaiting cleanup.
    pub orphaned_files: u64,
    /// references / files; 1.0 means no sharing at all.
    pub deduplication_rate: f64,
    /// Total bytes avoided by deduplication.
    pub saved_bytes_total: u64,
}
