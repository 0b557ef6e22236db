//! Download, inline view, and metadata handlers.

use super::ReferenceInfo;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::header::{
    ACCEPT_RANGES, CACHE_CONTROL, CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_RANGE,
    CONTENT_TYPE, ETAG, IF_NONE_MATCH, RANGE,
};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use depot_core::ByteRange;
use uuid::Uuid;

fn parse_reference_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::Validation(format!("invalid reference id: {raw}")))
}

/// Quote a filename for Content-Disposition.
fn disposition(kind: &str, filename: &str) -> String {
    let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
    format!("{kind}; filename=\"{escaped}\"")
}

fn map_range_error(e: depot_core::Error) -> ApiError {
    ApiError::RangeNotSatisfiable(e.to_string())
}

/// GET /api/v1/download/{reference_id} - attachment download, honoring
/// `Range: bytes=...` with strict bounds (416 on out-of-range, never
/// clamped).
pub async fn download(
    State(state): State<AppState>,
    Path(reference_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let reference_id = parse_reference_id(&reference_id)?;
    let cache_control = format!("public, max-age={}", state.config.server.cache_max_age_secs);

    if let Some(range_header) = headers.get(RANGE).and_then(|v| v.to_str().ok()) {
        // Resolve first so the range is validated against the true size.
        let (_, content) = state.engine.resolve(reference_id).await?;
        let size = content.size_bytes.max(0) as u64;
        let range = ByteRange::parse(range_header, size).map_err(map_range_error)?;

        let (bytes, reference, content) = state
            .engine
            .open_download_range(reference_id, range)
            .await?;

        return Ok((
            StatusCode::PARTIAL_CONTENT,
            [
                (CONTENT_TYPE, content.mime_type.clone()),
                (CONTENT_LENGTH, range.len().to_string()),
                (CONTENT_RANGE, range.content_range(size)),
                (
                    CONTENT_DISPOSITION,
                    disposition("attachment", &reference.filename),
                ),
                (ACCEPT_RANGES, "bytes".to_string()),
                (CACHE_CONTROL, cache_control),
            ],
            Body::from(bytes),
        )
            .into_response());
    }

    let (stream, reference, content) = state.engine.open_download(reference_id).await?;

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, content.mime_type.clone()),
            (CONTENT_LENGTH, content.size_bytes.to_string()),
            (
                CONTENT_DISPOSITION,
                disposition("attachment", &reference.filename),
            ),
            (ACCEPT_RANGES, "bytes".to_string()),
            (CACHE_CONTROL, cache_control),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// GET /api/v1/view/{reference_id} - inline rendering with cache
/// validation (ETag is the content hash, so it never changes for a given
/// blob).
pub async fn view(
    State(state): State<AppState>,
    Path(reference_id): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let reference_id = parse_reference_id(&reference_id)?;

    let (_, content) = state.engine.resolve(reference_id).await?;
    let etag = format!("\"{}\"", content.content_hash);

    if let Some(if_none_match) = headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok())
        && if_none_match == etag
    {
        return Ok((StatusCode::NOT_MODIFIED, [(ETAG, etag)]).into_response());
    }

    let (stream, reference, content) = state.engine.open_download(reference_id).await?;

    Ok((
        StatusCode::OK,
        [
            (CONTENT_TYPE, content.mime_type.clone()),
            (CONTENT_LENGTH, content.size_bytes.to_string()),
            (
                CONTENT_DISPOSITION,
                disposition("inline", &reference.filename),
            ),
            (
                CACHE_CONTROL,
                format!("public, max-age={}", state.config.server.cache_max_age_secs),
            ),
            (ETAG, etag),
        ],
        Body::from_stream(stream),
    )
        .into_response())
}

/// GET /api/v1/info/{reference_id} - metadata only, no body streaming.
pub async fn info(
    State(state): State<AppState>,
    Path(reference_id): Path<String>,
) -> ApiResult<Json<ReferenceInfo>> {
    let reference_id = parse_reference_id(&reference_id)?;
    let (reference, content) = state.engine.resolve(reference_id).await?;
    Ok(Json(ReferenceInfo::with_content(&reference, &content)))
}
