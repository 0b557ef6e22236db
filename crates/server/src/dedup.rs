//! Deduplication engine: upload and download orchestration.
//!
//! Uploads are hashed while they spool, then either attach to existing
//! content (no storage write) or write the blob first and attach second.
//! The engine owns the ordering invariant: on the new-content path the blob
//! write must succeed before the reference transaction runs, and a blob
//! left behind by a failed attach is removed best-effort (orphan cleanup
//! is the backstop). Blob removal on detach is never done inline; the
//! retention window protects racing re-uploads of the same content.

use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::scan::Scanner;
use bytes::Bytes;
use depot_core::ByteRange;
use depot_core::hash::ContentHash;
use depot_core::upload::{DedupStats, UploadMetadata, UploadResult};
use depot_metadata::MetadataStore;
use depot_metadata::models::{ContentObjectRow, NewContentObject, NewReference, ReferenceRow};
use depot_storage::{ByteStream, Orchestrator, Spool, SpoolWriter};
use futures::{Stream, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Bytes of content handed to the scanner (magic bytes and signature checks
/// only need the head).
const SCAN_HEAD_BYTES: usize = 1024 * 1024;

/// Engine configuration lifted out of AppConfig.
#[derive(Clone)]
pub struct EngineConfig {
    pub spool_threshold_bytes: u64,
    pub max_upload_size_bytes: u64,
    pub scan_enabled: bool,
    pub quota_enabled: bool,
    pub quota_default_limit_bytes: i64,
    pub quota_default_limit_files: i64,
}

/// A hashed, spooled upload awaiting commit. Dropping it discards the
/// spooled bytes without any metadata side effects.
pub struct PreparedUpload {
    pub hash: ContentHash,
    pub size: u64,
    pub spool: Arc<Spool>,
}

/// Upload/download orchestration over the storage orchestrator and the
/// metadata store. Never talks to an individual backend directly.
pub struct DedupEngine {
    metadata: Arc<dyn MetadataStore>,
    storage: Arc<Orchestrator>,
    scanner: Arc<dyn Scanner>,
    config: EngineConfig,
}

impl DedupEngine {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        storage: Arc<Orchestrator>,
        scanner: Arc<dyn Scanner>,
        config: EngineConfig,
    ) -> Self {
        Self {
            metadata,
            storage,
            scanner,
            config,
        }
    }

    /// Hash and spool an incoming byte stream. No metadata is touched; a
    /// dropped [`PreparedUpload`] discards the spool and leaves no trace.
    pub async fn prepare<S, E>(
        &self,
        mut body: S,
        cancel: CancellationToken,
    ) -> ApiResult<PreparedUpload>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: std::fmt::Display,
    {
        metrics::ACTIVE_UPLOADS.inc();
        let result = self.prepare_inner(&mut body, cancel).await;
        metrics::ACTIVE_UPLOADS.dec();
        result
    }

    async fn prepare_inner<S, E>(
        &self,
        body: &mut S,
        cancel: CancellationToken,
    ) -> ApiResult<PreparedUpload>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: std::fmt::Display,
    {
        // Hash while spooling; never the whole payload in memory.
        let mut hasher = ContentHash::hasher();
        let mut spool = SpoolWriter::new(self.config.spool_threshold_bytes);
        let mut total: u64 = 0;

        loop {
            let chunk = tokio::select! {
                chunk = body.next() => chunk,
                _ = cancel.cancelled() => {
                    // Cancelled before hashing completed: the spool is
                    // dropped and no row is ever created.
                    return Err(ApiError::Internal("upload cancelled".to_string()));
                }
            };
            let chunk = match chunk {
                Some(Ok(chunk)) => chunk,
                Some(Err(e)) => {
                    return Err(ApiError::Validation(format!("failed to read upload: {e}")));
                }
                None => break,
            };

            total += chunk.len() as u64;
            if total > self.config.max_upload_size_bytes {
                return Err(ApiError::PayloadTooLarge(format!(
                    "upload exceeds {} bytes",
                    self.config.max_upload_size_bytes
                )));
            }
            hasher.update(&chunk);
            spool.write(&chunk).await?;
        }

        if total == 0 {
            return Err(ApiError::Validation("upload is empty".to_string()));
        }

        Ok(PreparedUpload {
            hash: hasher.finalize(),
            size: total,
            spool: Arc::new(spool.finish().await?),
        })
    }

    /// Scan, reserve quota, and attach a prepared upload: the dedup-hit
    /// path attaches without a storage write, the new-content path writes
    /// the blob first.
    pub async fn commit(
        &self,
        prepared: &PreparedUpload,
        metadata: UploadMetadata,
        cancel: CancellationToken,
    ) -> ApiResult<UploadResult> {
        let timer = metrics::UPLOAD_DURATION.start_timer();
        let result = self.commit_inner(prepared, metadata, cancel).await;
        timer.observe_duration();
        if let Err(e) = &result {
            metrics::UPLOAD_ERRORS.with_label_values(&[e.code()]).inc();
        }
        result
    }

    /// `prepare` followed by `commit`.
    pub async fn process_upload<S, E>(
        &self,
        body: S,
        metadata: UploadMetadata,
        cancel: CancellationToken,
    ) -> ApiResult<UploadResult>
    where
        S: Stream<Item = Result<Bytes, E>> + Unpin + Send,
        E: std::fmt::Display,
    {
        let prepared = self.prepare(body, cancel.clone()).await?;
        self.commit(&prepared, metadata, cancel).await
    }

    async fn commit_inner(
        &self,
        prepared: &PreparedUpload,
        metadata: UploadMetadata,
        cancel: CancellationToken,
    ) -> ApiResult<UploadResult> {
        let total = prepared.size;
        let hash = prepared.hash;
        let spool = prepared.spool.clone();

        // Scan the content head. Terminal on an unsafe verdict, before any
        // quota or metadata mutation.
        let mut metadata = metadata;
        if self.config.scan_enabled {
            let head = read_head(&spool, SCAN_HEAD_BYTES).await?;
            let verdict = self
                .scanner
                .scan(&metadata.filename, Some(&metadata.mime_type), &head)
                .await;
            for warning in &verdict.warnings {
                tracing::warn!(filename = %metadata.filename, warning = %warning, "scan warning");
            }
            if !verdict.safe {
                metrics::SECURITY_REJECTIONS.inc();
                let detail = match &verdict.virus_name {
                    Some(name) => format!("malware detected: {name}"),
                    None => "content rejected by scanner".to_string(),
                };
                return Err(ApiError::SecurityRejection(detail));
            }
            metadata.mime_type = verdict.mime_type;
            metadata.extension = verdict.extension;
        }

        // Quota is reserved before any write so a storage failure can give
        // it back; a dedup hit still consumes logical quota.
        let quota_reserved = if self.config.quota_enabled {
            self.metadata
                .ensure_quota(
                    &metadata.uploader_id,
                    self.config.quota_default_limit_bytes,
                    self.config.quota_default_limit_files,
                )
                .await?;
            match self
                .metadata
                .reserve_quota(&metadata.uploader_id, total as i64)
                .await
            {
                Ok(()) => true,
                Err(depot_metadata::MetadataError::QuotaExceeded { detail, .. }) => {
                    return Err(ApiError::QuotaExceeded(detail));
                }
                Err(e) => return Err(e.into()),
            }
        } else {
            false
        };

        let result = self
            .store_and_attach(hash, total, spool, &metadata, cancel)
            .await;

        if result.is_err() && quota_reserved {
            if let Err(e) = self
                .metadata
                .release_quota(&metadata.uploader_id, total as i64)
                .await
            {
                tracing::warn!(user = %metadata.uploader_id, error = %e,
                    "failed to release quota after upload failure");
            }
        }
        result
    }

    async fn store_and_attach(
        &self,
        hash: ContentHash,
        size: u64,
        spool: Arc<Spool>,
        metadata: &UploadMetadata,
        cancel: CancellationToken,
    ) -> ApiResult<UploadResult> {
        let hash_hex = hash.to_hex();
        let deduplicated = self.metadata.content_exists(&hash_hex).await?;

        if !deduplicated {
            // New content: the blob write must complete before the
            // reference transaction runs. On failure nothing was written
            // to the database.
            if cancel.is_cancelled() {
                return Err(ApiError::Internal("upload cancelled".to_string()));
            }
            self.storage
                .write_blob(&hash.blob_key(), spool)
                .await
                .map_err(|e| match e {
                    depot_storage::StorageError::QuorumNotMet(_)
                    | depot_storage::StorageError::AllEndpointsFailed { .. } => {
                        ApiError::StorageUnavailable(e.to_string())
                    }
                    other => ApiError::Storage(other),
                })?;
        }

        let new_content = NewContentObject {
            content_hash: hash_hex.clone(),
            size_bytes: size as i64,
            mime_type: metadata.mime_type.clone(),
            extension: metadata.extension.clone(),
        };
        let new_reference = NewReference {
            reference_id: Uuid::new_v4(),
            content_hash: hash_hex.clone(),
            entity_type: metadata.entity_type.clone(),
            entity_id: metadata.entity_id.clone(),
            filename: metadata.filename.clone(),
            uploader_id: metadata.uploader_id.clone(),
            description: metadata.description.clone(),
            tags: metadata.tags.clone(),
        };

        let reference = match self.metadata.attach(&new_content, &new_reference).await {
            Ok(reference) => reference,
            Err(e) => {
                if !deduplicated {
                    // The blob landed but the counter transaction failed.
                    // Remove it now; orphan cleanup is the backstop if this
                    // delete fails too.
                    if let Err(del_err) = self.storage.delete_blob(&hash.blob_key()).await {
                        tracing::warn!(hash = %hash_hex, error = %del_err,
                            "failed to remove blob after attach failure");
                    }
                }
                return Err(e.into());
            }
        };

        let saved_bytes = if deduplicated { size } else { 0 };
        metrics::UPLOADS_TOTAL.inc();
        if deduplicated {
            metrics::UPLOADS_DEDUPLICATED.inc();
            metrics::BYTES_DEDUPLICATED.inc_by(saved_bytes);
        } else {
            metrics::BYTES_UPLOADED.inc_by(size);
        }

        tracing::info!(
            hash = %hash_hex,
            reference_id = %reference.reference_id,
            entity_type = %metadata.entity_type,
            entity_id = %metadata.entity_id,
            size_bytes = size,
            deduplicated,
            "upload processed"
        );

        Ok(UploadResult {
            reference_id: reference.reference_id,
            content_hash: hash,
            size_bytes: size,
            deduplicated,
            saved_bytes,
        })
    }

    /// Resolve a reference and open a full-content read stream.
    pub async fn open_download(
        &self,
        reference_id: Uuid,
    ) -> ApiResult<(ByteStream, ReferenceRow, ContentObjectRow)> {
        let (reference, content) = self.resolve(reference_id).await?;
        let hash = ContentHash::from_hex(&content.content_hash)
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let stream = self.storage.read_blob(&hash.blob_key()).await?;
        self.touch_in_background(&content.content_hash);
        metrics::DOWNLOADS_TOTAL.inc();

        Ok((stream, reference, content))
    }

    /// Resolve a reference and read one validated byte range.
    pub async fn open_download_range(
        &self,
        reference_id: Uuid,
        range: ByteRange,
    ) -> ApiResult<(Bytes, ReferenceRow, ContentObjectRow)> {
        let (reference, content) = self.resolve(reference_id).await?;
        let hash = ContentHash::from_hex(&content.content_hash)
            .map_err(|e| ApiError::Internal(e.to_string()))?;

        let bytes = self
            .storage
            .read_blob_range(&hash.blob_key(), range.start, range.end)
            .await?;
        self.touch_in_background(&content.content_hash);
        metrics::DOWNLOADS_TOTAL.inc();
        metrics::RANGE_REQUESTS_TOTAL.inc();

        Ok((bytes, reference, content))
    }

    /// Resolve a live reference and its content row.
    pub async fn resolve(
        &self,
        reference_id: Uuid,
    ) -> ApiResult<(ReferenceRow, ContentObjectRow)> {
        let reference = self
            .metadata
            .get_reference(reference_id)
            .await?
            .ok_or_else(|| ApiError::NotFound(format!("reference {reference_id}")))?;
        let content = self
            .metadata
            .get_content(&reference.content_hash)
            .await?
            .ok_or_else(|| {
                tracing::error!(
                    reference_id = %reference_id,
                    hash = %reference.content_hash,
                    "live reference points at missing content object"
                );
                ApiError::NotFound(format!("content for reference {reference_id}"))
            })?;
        Ok((reference, content))
    }

    /// Detach a reference. Blob removal is orphan cleanup's job.
    pub async fn delete_reference(&self, reference_id: Uuid) -> ApiResult<ReferenceRow> {
        let detached = self.metadata.detach(reference_id).await?;

        if self.config.quota_enabled {
            if let Some(content) = self.metadata.get_content(&detached.content_hash).await? {
                if let Err(e) = self
                    .metadata
                    .release_quota(&detached.uploader_id, content.size_bytes)
                    .await
                {
                    tracing::warn!(user = %detached.uploader_id, error = %e,
                        "failed to release quota on detach");
                }
            }
        }

        tracing::info!(
            reference_id = %reference_id,
            hash = %detached.content_hash,
            "reference detached"
        );
        Ok(detached)
    }

    /// One orphan cleanup pass: delete expired zero-reference rows, then
    /// their blobs. Returns (objects removed, bytes reclaimed).
    pub async fn cleanup_orphans(
        &self,
        retention: Duration,
        batch_size: u32,
    ) -> ApiResult<(u64, u64)> {
        let cutoff = OffsetDateTime::now_utc() - retention;
        let deleted = self
            .metadata
            .delete_orphaned_atomic(cutoff, batch_size)
            .await?;

        let mut bytes = 0u64;
        for row in &deleted {
            bytes += row.size_bytes.max(0) as u64;
            let hash = match ContentHash::from_hex(&row.content_hash) {
                Ok(hash) => hash,
                Err(e) => {
                    tracing::error!(hash = %row.content_hash, error = %e,
                        "orphaned row has malformed hash, skipping blob delete");
                    continue;
                }
            };
            if let Err(e) = self.storage.delete_blob(&hash.blob_key()).await {
                // The row is gone; the blob will be retried next cycle only
                // if another row re-creates it, so make this loud.
                tracing::warn!(hash = %row.content_hash, error = %e,
                    "failed to delete orphaned blob");
            }
        }

        let count = deleted.len() as u64;
        if count > 0 {
            metrics::ORPHANS_CLEANED.inc_by(count);
            metrics::ORPHAN_BYTES_RECLAIMED.inc_by(bytes);
            tracing::info!(count, bytes, "orphan cleanup removed content");
        }
        Ok((count, bytes))
    }

    /// Read-only deduplication statistics.
    pub async fn stats(&self) -> ApiResult<DedupStats> {
        let stats = self.metadata.storage_stats().await?;
        let rate = if stats.total_files > 0 {
            stats.total_references as f64 / stats.total_files as f64
        } else {
            0.0
        };
        Ok(DedupStats {
            total_files: stats.total_files.max(0) as u64,
            total_references: stats.total_references.max(0) as u64,
            unique_files: stats.unique_files.max(0) as u64,
            shared_files: stats.shared_files.max(0) as u64,
            orphaned_files: stats.orphaned_files.max(0) as u64,
            deduplication_rate: rate,
            saved_bytes_total: stats.saved_bytes.max(0) as u64,
        })
    }

    /// Access to the metadata store for handlers doing plain queries.
    pub fn metadata(&self) -> &Arc<dyn MetadataStore> {
        &self.metadata
    }

    /// Access to the storage orchestrator.
    pub fn storage(&self) -> &Arc<Orchestrator> {
        &self.storage
    }

    fn touch_in_background(&self, content_hash: &str) {
        let metadata = self.metadata.clone();
        let hash = content_hash.to_string();
        tokio::spawn(async move {
            if let Err(e) = metadata.touch_content(&hash, OffsetDateTime::now_utc()).await {
                tracing::debug!(hash = %hash, error = %e, "failed to touch content");
            }
        });
    }
}

/// Read up to `limit` bytes from the front of a spool.
async fn read_head(spool: &Spool, limit: usize) -> ApiResult<Vec<u8>> {
    let mut reader = spool.reader().await?;
    let mut head = Vec::with_capacity(limit.min(spool.len() as usize));
    while head.len() < limit {
        match reader.try_next().await? {
            Some(chunk) => {
                let take = (limit - head.len()).min(chunk.len());
                head.extend_from_slice(&chunk[..take]);
            }
            None => break,
        }
    }
    Ok(head)
}
