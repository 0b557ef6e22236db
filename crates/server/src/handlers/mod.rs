//! HTTP request handlers.

pub mod admin;
pub mod attachments;
pub mod download;
pub mod uploads;

use depot_metadata::models::{ContentObjectRow, ReferenceRow};
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// Metadata view of one reference, shared by info/list/search responses.
#[derive(Debug, Serialize)]
pub struct ReferenceInfo {
    pub reference_id: Uuid,
    pub file_hash: String,
    pub filename: String,
    pub entity_type: String,
    pub entity_id: String,
    pub uploader_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub tags: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub modified_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
}

impl ReferenceInfo {
    /// View of a reference alone (list endpoints).
    pub fn from_reference(reference: &ReferenceRow) -> Self {
        Self {
            reference_id: reference.reference_id,
            file_hash: reference.content_hash.clone(),
            filename: reference.filename.clone(),
            entity_type: reference.entity_type.clone(),
            entity_id: reference.entity_id.clone(),
            uploader_id: reference.uploader_id.clone(),
            description: reference.description.clone(),
            tags: reference.tags(),
            created_at: reference.created_at,
            modified_at: reference.modified_at,
            size_bytes: None,
            mime_type: None,
            extension: None,
        }
    }

    /// View of a reference joined with its content object (info endpoint).
    pub fn with_content(reference: &ReferenceRow, content: &ContentObjectRow) -> Self {
        let mut info = Self::from_reference(reference);
        info.size_bytes = Some(content.size_bytes);
        info.mime_type = Some(content.mime_type.clone());
        info.extension = Some(content.extension.clone());
        info
    }
}
