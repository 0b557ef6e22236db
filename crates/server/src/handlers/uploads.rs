//! Upload handlers.

use crate::auth::AuthContext;
use crate::dedup::PreparedUpload;
use crate::error::{ApiError, ApiResult};
use crate::scan::extension_of;
use crate::state::AppState;
use axum::Json;
use axum::extract::multipart::Field;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Extension;
use axum::response::IntoResponse;
use depot_core::upload::{UploadMetadata, UploadResult};
use futures::stream;
use serde::Serialize;
use time::OffsetDateTime;

/// One successful upload, as returned to the client.
#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub reference_id: uuid::Uuid,
    pub file_hash: String,
    pub filename: String,
    pub size_bytes: u64,
    pub mime_type: String,
    pub deduplicated: bool,
    pub saved_bytes: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub upload_time: OffsetDateTime,
}

impl UploadResponse {
    fn new(result: &UploadResult, filename: &str, mime_type: &str) -> Self {
        Self {
            reference_id: result.reference_id,
            file_hash: result.content_hash.to_hex(),
            filename: filename.to_string(),
            size_bytes: result.size_bytes,
            mime_type: mime_type.to_string(),
            deduplicated: result.deduplicated,
            saved_bytes: result.saved_bytes,
            upload_time: OffsetDateTime::now_utc(),
        }
    }
}

/// A file pulled out of the multipart form, hashed and spooled.
struct PreparedFile {
    prepared: PreparedUpload,
    filename: String,
    declared_mime: Option<String>,
}

/// Text fields accompanying the file(s).
#[derive(Default)]
struct FormFields {
    entity_type: Option<String>,
    entity_id: Option<String>,
    description: Option<String>,
    tags: Vec<String>,
}

/// Stream one multipart field through the engine's hasher/spool.
async fn prepare_field(
    state: &AppState,
    field: Field<'_>,
) -> ApiResult<PreparedFile> {
    let filename = field
        .file_name()
        .map(str::to_string)
        .ok_or_else(|| ApiError::Validation("file field has no filename".to_string()))?;
    let declared_mime = field.content_type().map(str::to_string);

    let chunks = Box::pin(stream::unfold(field, |mut field| async move {
        match field.chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), field)),
            Ok(None) => None,
            Err(e) => Some((Err(e), field)),
        }
    }));
    let prepared = state
        .engine
        .prepare(chunks, state.shutdown.child_token())
        .await?;

    Ok(PreparedFile {
        prepared,
        filename,
        declared_mime,
    })
}

fn collect_tags(fields: &mut FormFields, raw: &str) {
    for tag in raw.split(',') {
        let tag = tag.trim();
        if !tag.is_empty() {
            fields.tags.push(tag.to_string());
        }
    }
}

async fn text_value(field: Field<'_>) -> ApiResult<String> {
    field
        .text()
        .await
        .map_err(|e| ApiError::Validation(format!("failed to read form field: {e}")))
}

/// Build validated upload metadata from form fields plus one file.
fn build_metadata(
    state: &AppState,
    auth: &AuthContext,
    fields: &FormFields,
    file: &PreparedFile,
) -> ApiResult<UploadMetadata> {
    let uploader_id = auth.require_user()?.to_string();
    let entity_type = fields
        .entity_type
        .as_deref()
        .ok_or_else(|| ApiError::Validation("entity_type is required".to_string()))?;
    let entity_id = fields
        .entity_id
        .as_deref()
        .ok_or_else(|| ApiError::Validation("entity_id is required".to_string()))?;

    let validator = &state.validator;
    let filename = validator.sanitize_filename(&file.filename)?;
    Ok(UploadMetadata {
        entity_type: validator.validate_entity_type(entity_type)?,
        entity_id: validator.validate_entity_id(entity_id)?,
        extension: extension_of(&filename),
        mime_type: file
            .declared_mime
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_string()),
        filename,
        uploader_id,
        description: validator.validate_description(fields.description.as_deref())?,
        tags: validator.validate_tags(&fields.tags)?,
    })
}

/// POST /api/v1/upload - single-file multipart upload.
pub async fn upload(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    auth.require_user()?;

    let mut fields = FormFields::default();
    let mut file: Option<PreparedFile> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                if file.is_some() {
                    return Err(ApiError::Validation(
                        "multiple file fields in single upload".to_string(),
                    ));
                }
                file = Some(prepare_field(&state, field).await?);
            }
            "entity_type" => fields.entity_type = Some(text_value(field).await?),
            "entity_id" => fields.entity_id = Some(text_value(field).await?),
            "description" => fields.description = Some(text_value(field).await?),
            "tags" | "tags[]" => {
                let raw = text_value(field).await?;
                collect_tags(&mut fields, &raw);
            }
            other => {
                tracing::debug!(field = %other, "ignoring unknown form field");
            }
        }
    }

    let file = file.ok_or_else(|| ApiError::Validation("file field is required".to_string()))?;
    let metadata = build_metadata(&state, &auth, &fields, &file)?;
    let mime_hint = metadata.mime_type.clone();
    let filename = metadata.filename.clone();

    let result = state
        .engine
        .commit(&file.prepared, metadata, state.shutdown.child_token())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadResponse::new(&result, &filename, &mime_hint)),
    ))
}

/// Per-file failure in a batch upload.
#[derive(Debug, Serialize)]
pub struct BatchUploadError {
    pub filename: String,
    pub error: String,
    pub details: String,
}

/// Batch upload summary.
#[derive(Debug, Serialize)]
pub struct BatchUploadSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

/// POST /api/v1/upload/multiple response.
#[derive(Debug, Serialize)]
pub struct BatchUploadResponse {
    pub uploads: Vec<UploadResponse>,
    pub errors: Vec<BatchUploadError>,
    pub summary: BatchUploadSummary,
}

/// POST /api/v1/upload/multiple - up to `max_batch_files` files in one
/// multipart request. One file failing never aborts the others; the
/// endpoint itself answers 200 with per-file outcomes.
pub async fn upload_multiple(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    mut multipart: Multipart,
) -> ApiResult<impl IntoResponse> {
    auth.require_user()?;

    let max_files = state.config.server.max_batch_files;
    let mut fields = FormFields::default();
    let mut files: Vec<Result<PreparedFile, BatchUploadError>> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::Validation(format!("malformed multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" | "files" | "files[]" => {
                if files.len() >= max_files {
                    return Err(ApiError::Validation(format!(
                        "too many files in batch (max {max_files})"
                    )));
                }
                let filename = field.file_name().unwrap_or("unnamed").to_string();
                // A failure to read or spool one file is recorded and the
                // rest of the form continues to parse.
                match prepare_field(&state, field).await {
                    Ok(prepared) => files.push(Ok(prepared)),
                    Err(e) => files.push(Err(BatchUploadError {
                        filename,
                        error: e.code().to_string(),
                        details: e.to_string(),
                    })),
                }
            }
            "entity_type" => fields.entity_type = Some(text_value(field).await?),
            "entity_id" => fields.entity_id = Some(text_value(field).await?),
            "description" => fields.description = Some(text_value(field).await?),
            "tags" | "tags[]" => {
                let raw = text_value(field).await?;
                collect_tags(&mut fields, &raw);
            }
            other => {
                tracing::debug!(field = %other, "ignoring unknown form field");
            }
        }
    }

    if files.is_empty() {
        return Err(ApiError::Validation(
            "at least one file is required".to_string(),
        ));
    }

    let mut uploads = Vec::new();
    let mut errors = Vec::new();

    for file in files {
        let file = match file {
            Ok(file) => file,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };

        let outcome = async {
            let metadata = build_metadata(&state, &auth, &fields, &file)?;
            let mime_hint = metadata.mime_type.clone();
            let filename = metadata.filename.clone();
            let result = state
                .engine
                .commit(&file.prepared, metadata, state.shutdown.child_token())
                .await?;
            Ok::<_, ApiError>(UploadResponse::new(&result, &filename, &mime_hint))
        }
        .await;

        match outcome {
            Ok(response) => uploads.push(response),
            Err(e) => errors.push(BatchUploadError {
                filename: file.filename.clone(),
                error: e.code().to_string(),
                details: e.to_string(),
            }),
        }
    }

    let summary = BatchUploadSummary {
        total: uploads.len() + errors.len(),
        successful: uploads.len(),
        failed: errors.len(),
    };

    Ok((
        StatusCode::OK,
        Json(BatchUploadResponse {
            uploads,
            errors,
            summary,
        }),
    ))
}
