//! Reference management handlers: list, search, update, detach.

use super::ReferenceInfo;
use crate::auth::AuthContext;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;
use axum::Extension;
use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use depot_core::hash::ContentHash;
use depot_metadata::models::ReferenceSearch;
use serde::Deserialize;
use uuid::Uuid;

fn parse_reference_id(raw: &str) -> ApiResult<Uuid> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::Validation(format!("invalid reference id: {raw}")))
}

/// GET /api/v1/attachments/{entity_type}/{entity_id} - live references for
/// one business object.
pub async fn list_by_entity(
    State(state): State<AppState>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> ApiResult<Json<serde_json::Value>> {
    let entity_type = state.validator.validate_entity_type(&entity_type)?;
    let entity_id = state.validator.validate_entity_id(&entity_id)?;

    let references = state
        .metadata
        .list_by_entity(&entity_type, &entity_id)
        .await?;
    let attachments: Vec<ReferenceInfo> =
        references.iter().map(ReferenceInfo::from_reference).collect();

    Ok(Json(serde_json::json!({
        "entity_type": entity_type,
        "entity_id": entity_id,
        "count": attachments.len(),
        "attachments": attachments,
    })))
}

/// Search query parameters.
#[derive(Debug, Deserialize)]
pub struct SearchParams {
    /// Filename substring.
    pub q: Option<String>,
    pub entity_type: Option<String>,
    pub tag: Option<String>,
    pub uploader: Option<String>,
    #[serde(default)]
    pub limit: u32,
    #[serde(default)]
    pub offset: u32,
}

/// GET /api/v1/attachments/search - filtered reference search.
pub async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<serde_json::Value>> {
    let entity_type = match &params.entity_type {
        Some(t) => Some(state.validator.validate_entity_type(t)?),
        None => None,
    };

    let search = ReferenceSearch {
        filename_contains: params.q.clone().filter(|q| !q.trim().is_empty()),
        entity_type,
        tag: params.tag.clone().filter(|t| !t.trim().is_empty()),
        uploader_id: params.uploader.clone().filter(|u| !u.trim().is_empty()),
        limit: params.limit.min(1000),
        offset: params.offset,
    };

    let references = state.metadata.search_references(&search).await?;
    let results: Vec<ReferenceInfo> =
        references.iter().map(ReferenceInfo::from_reference).collect();

    Ok(Json(serde_json::json!({
        "count": results.len(),
        "results": results,
    })))
}

/// GET /api/v1/attachments/hash/{file_hash} - every live reference sharing
/// one content hash.
pub async fn list_by_hash(
    State(state): State<AppState>,
    Path(file_hash): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    // Normalizes case and rejects anything that isn't a well-formed digest.
    let hash = ContentHash::from_hex(&file_hash)
        .map_err(|e| ApiError::Validation(e.to_string()))?;

    let content = state.metadata.get_content(&hash.to_hex()).await?;
    let references = state.metadata.list_by_hash(&hash.to_hex()).await?;
    let results: Vec<ReferenceInfo> =
        references.iter().map(ReferenceInfo::from_reference).collect();

    Ok(Json(serde_json::json!({
        "file_hash": hash.to_hex(),
        "ref_count": content.as_ref().map(|c| c.ref_count).unwrap_or(0),
        "size_bytes": content.as_ref().map(|c| c.size_bytes),
        "references": results,
    })))
}

/// PATCH body for reference updates. Omitted fields are left unchanged; an
/// empty description clears it.
#[derive(Debug, Deserialize)]
pub struct UpdateRequest {
    pub description: Option<String>,
    pub tags: Option<Vec<String>>,
}

/// PATCH /api/v1/attachments/{reference_id} - update description/tags.
pub async fn update(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(reference_id): Path<String>,
    Json(body): Json<UpdateRequest>,
) -> ApiResult<Json<ReferenceInfo>> {
    auth.require_user()?;
    let reference_id = parse_reference_id(&reference_id)?;

    let description = match body.description {
        None => None,
        Some(d) => Some(state.validator.validate_description(Some(&d))?),
    };
    let tags = match body.tags {
        None => None,
        Some(t) => Some(state.validator.validate_tags(&t)?),
    };

    let updated = state
        .metadata
        .update_reference(reference_id, description, tags)
        .await?;

    Ok(Json(ReferenceInfo::from_reference(&updated)))
}

/// DELETE /api/v1/attachments/{reference_id} - detach. The blob stays put
/// until orphan cleanup decides its fate.
pub async fn delete(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(reference_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    auth.require_user()?;
    let reference_id = parse_reference_id(&reference_id)?;

    state.engine.delete_reference(reference_id).await?;

    Ok((
        StatusCode::OK,
        Json(serde_json::json!({
            "reference_id": reference_id,
            "deleted": true,
        })),
    ))
}
