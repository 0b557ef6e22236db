//! Metadata store trait and SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{
    ContentObjectRow, IntegrityIssue, NewContentObject, NewReference, QuotaRow, ReferenceRow,
    ReferenceSearch, StorageHealthRow, StorageStats,
};
use crate::repos::{ContentRepo, HealthRepo, QuotaRepo, ReferenceRepo};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore:
    ContentRepo + ReferenceRepo + HealthRepo + QuotaRepo + Send + Sync
{
    /// Run database migrations.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity.
    async fn health_check(&self) -> MetadataResult<()>;
}

/// Embedded schema, shared in shape with the PostgreSQL variant.
const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS content_objects (
    content_hash     TEXT PRIMARY KEY,
    size_bytes       INTEGER NOT NULL,
    mime_type        TEXT NOT NULL,
    extension        TEXT NOT NULL DEFAULT '',
    ref_count        INTEGER NOT NULL DEFAULT 0 CHECK (ref_count >= 0),
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    last_accessed_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attachment_references (
    reference_id  BLOB PRIMARY KEY,
    content_hash  TEXT NOT NULL REFERENCES content_objects(content_hash),
    entity_type   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    filename      TEXT NOT NULL,
    uploader_id   TEXT NOT NULL,
    description   TEXT,
    tags_json     TEXT NOT NULL DEFAULT '[]',
    created_at    TEXT NOT NULL,
    modified_at   TEXT NOT NULL,
    deleted_at    TEXT
);

CREATE INDEX IF NOT EXISTS idx_references_entity
    ON attachment_references(entity_type, entity_id) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_references_hash
    ON attachment_references(content_hash);
CREATE INDEX IF NOT EXISTS idx_content_orphans
    ON content_objects(updated_at) WHERE ref_count = 0;

CREATE TABLE IF NOT EXISTS storage_health (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    endpoint_id TEXT NOT NULL,
    checked_at  TEXT NOT NULL,
    healthy     INTEGER NOT NULL,
    latency_ms  INTEGER NOT NULL,
    error       TEXT
);

CREATE INDEX IF NOT EXISTS idx_health_endpoint
    ON storage_health(endpoint_id, checked_at);

CREATE TABLE IF NOT EXISTS upload_quotas (
    user_id     TEXT PRIMARY KEY,
    used_bytes  INTEGER NOT NULL DEFAULT 0,
    used_files  INTEGER NOT NULL DEFAULT 0,
    limit_bytes INTEGER NOT NULL,
    limit_files INTEGER NOT NULL,
    updated_at  TEXT NOT NULL
);
"#;

/// SQLite-based metadata store.
///
/// WAL mode with a single pooled connection: SQLite permits limited write
/// concurrency, and one connection avoids persistent "database is locked"
/// failures under concurrent handlers while preserving transactional
/// atomicity.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Create a new SQLite store, running migrations.
    pub async fn new(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))
            .map_err(MetadataError::Database)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl ContentRepo for SqliteStore {
    async fn get_content(&self, content_hash: &str) -> MetadataResult<Option<ContentObjectRow>> {
        let row = sqlx::query_as::<_, ContentObjectRow>(
            "SELECT * FROM content_objects WHERE content_hash = ?",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn content_exists(&self, content_hash: &str) -> MetadataResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM content_objects WHERE content_hash = ?)",
        )
        .bind(content_hash)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn touch_content(
        &self,
        content_hash: &str,
        accessed_at: OffsetDateTime,
    ) -> MetadataResult<()> {
        sqlx::query("UPDATE content_objects SET last_accessed_at = ? WHERE content_hash = ?")
            .bind(accessed_at)
            .bind(content_hash)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn find_orphaned(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ContentObjectRow>> {
        let rows = sqlx::query_as::<_, ContentObjectRow>(
            "SELECT * FROM content_objects \
             WHERE ref_count = 0 AND updated_at < ? \
             ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_orphaned_atomic(
        &self,
        older_than: OffsetDateTime,
        limit: u32,
    ) -> MetadataResult<Vec<ContentObjectRow>> {
        let mut tx = self.pool.begin().await?;

        let candidates = sqlx::query_as::<_, ContentObjectRow>(
            "SELECT * FROM content_objects \
             WHERE ref_count = 0 AND updated_at < ? \
             ORDER BY updated_at ASC LIMIT ?",
        )
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await?;

        let mut deleted = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            // Re-check ref_count inside the deleting transaction: a hash
            // re-attached since the scan keeps its row.
            let result = sqlx::query(
                "DELETE FROM content_objects WHERE content_hash = ? AND ref_count = 0",
            )
            .bind(&candidate.content_hash)
            .execute(&mut *tx)
            .await?;
            if result.rows_affected() == 1 {
                deleted.push(candidate);
            }
        }

        tx.commit().await?;
        Ok(deleted)
    }

    async fn verify_integrity(&self) -> MetadataResult<Vec<IntegrityIssue>> {
        let issues = sqlx::query_as::<_, IntegrityIssue>(
            "SELECT c.content_hash AS content_hash, \
                    c.ref_count AS recorded_ref_count, \
                    (SELECT COUNT(*) FROM attachment_references r \
                     WHERE r.content_hash = c.content_hash AND r.deleted_at IS NULL) \
                        AS actual_ref_count \
             FROM content_objects c \
             WHERE c.ref_count <> \
                   (SELECT COUNT(*) FROM attachment_references r \
                    WHERE r.content_hash = c.content_hash AND r.deleted_at IS NULL) \
             ORDER BY c.content_hash",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(issues)
    }

    async fn repair_integrity(&self) -> MetadataResult<u64> {
        let result = sqlx::query(
            "UPDATE content_objects SET \
                 ref_count = (SELECT COUNT(*) FROM attachment_references r \
                              WHERE r.content_hash = content_objects.content_hash \
                                AND r.deleted_at IS NULL), \
                 updated_at = ? \
             WHERE ref_count <> (SELECT COUNT(*) FROM attachment_references r \
                                 WHERE r.content_hash = content_objects.content_hash \
                                   AND r.deleted_at IS NULL)",
        )
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn storage_stats(&self) -> MetadataResult<StorageStats> {
        let (total_files, unique_files, shared_files, orphaned_files): (i64, i64, i64, i64) =
            sqlx::query_as(
                "SELECT COUNT(*), \
                        COALESCE(SUM(CASE WHEN ref_count = 1 THEN 1 ELSE 0 END), 0), \
                        COALESCE(SUM(CASE WHEN ref_count > 1 THEN 1 ELSE 0 END), 0), \
                        COALESCE(SUM(CASE WHEN ref_count = 0 THEN 1 ELSE 0 END), 0) \
                 FROM content_objects",
            )
            .fetch_one(&self.pool)
            .await?;

        let total_references: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM attachment_references WHERE deleted_at IS NULL",
        )
        .fetch_one(&self.pool)
        .await?;

        let (physical_bytes, logical_bytes, saved_bytes): (i64, i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(size_bytes), 0), \
                    COALESCE(SUM(size_bytes * ref_count), 0), \
                    COALESCE(SUM(CASE WHEN ref_count > 1 \
                                      THEN size_bytes * (ref_count - 1) ELSE 0 END), 0) \
             FROM content_objects",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StorageStats {
            total_files,
            total_references,
            unique_files,
            shared_files,
            orphaned_files,
            physical_bytes,
            logical_bytes,
            saved_bytes,
        })
    }
}

#[async_trait]
impl ReferenceRepo for SqliteStore {
    async fn attach(
        &self,
        content: &NewContentObject,
        reference: &NewReference,
    ) -> MetadataResult<ReferenceRow> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        // Single upsert: create at ref_count = 1 or increment in place. The
        // increment is done by the database, never read-modify-written here.
        sqlx::query(
            "INSERT INTO content_objects \
                 (content_hash, size_bytes, mime_type, extension, ref_count, \
                  created_at, updated_at, last_accessed_at) \
             VALUES (?, ?, ?, ?, 1, ?, ?, ?) \
             ON CONFLICT(content_hash) DO UPDATE SET \
                 ref_count = ref_count + 1, \
                 updated_at = excluded.updated_at, \
                 last_accessed_at = excluded.last_accessed_at",
        )
        .bind(&content.content_hash)
        .bind(content.size_bytes)
        .bind(&content.mime_type)
        .bind(&content.extension)
        .bind(now)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO attachment_references \
                 (reference_id, content_hash, entity_type, entity_id, filename, \
                  uploader_id, description, tags_json, created_at, modified_at, deleted_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, NULL)",
        )
        .bind(reference.reference_id)
        .bind(&reference.content_hash)
        .bind(&reference.entity_type)
        .bind(&reference.entity_id)
        .bind(&reference.filename)
        .bind(&reference.uploader_id)
        .bind(&reference.description)
        .bind(reference.tags_json())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, ReferenceRow>(
            "SELECT * FROM attachment_references WHERE reference_id = ?",
        )
        .bind(reference.reference_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn detach(&self, reference_id: Uuid) -> MetadataResult<ReferenceRow> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            "UPDATE attachment_references SET deleted_at = ?, modified_at = ? \
             WHERE reference_id = ? AND deleted_at IS NULL",
        )
        .bind(now)
        .bind(now)
        .bind(reference_id)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!(
                "reference {reference_id}"
            )));
        }

        let row = sqlx::query_as::<_, ReferenceRow>(
            "SELECT * FROM attachment_references WHERE reference_id = ?",
        )
        .bind(reference_id)
        .fetch_one(&mut *tx)
        .await?;

        // Guarded decrement: zero rows affected means the stored count was
        // already zero, which can only happen if bookkeeping drifted.
        // Dropping the transaction rolls the soft-delete back.
        let result = sqlx::query(
            "UPDATE content_objects SET ref_count = ref_count - 1, updated_at = ? \
             WHERE content_hash = ? AND ref_count > 0",
        )
        .bind(now)
        .bind(&row.content_hash)
        .execute(&mut *tx)
        .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::Integrity(format!(
                "ref_count for {} is already zero while a live reference existed",
                row.content_hash
            )));
        }

        tx.commit().await?;
        Ok(row)
    }

    async fn get_reference(&self, reference_id: Uuid) -> MetadataResult<Option<ReferenceRow>> {
        let row = sqlx::query_as::<_, ReferenceRow>(
            "SELECT * FROM attachment_references \
             WHERE reference_id = ? AND deleted_at IS NULL",
        )
        .bind(reference_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_by_entity(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> MetadataResult<Vec<ReferenceRow>> {
        let rows = sqlx::query_as::<_, ReferenceRow>(
            "SELECT * FROM attachment_references \
             WHERE entity_type = ? AND entity_id = ? AND deleted_at IS NULL \
             ORDER BY created_at DESC",
        )
        .bind(entity_type)
        .bind(entity_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_by_hash(&self, content_hash: &str) -> MetadataResult<Vec<ReferenceRow>> {
        let rows = sqlx::query_as::<_, ReferenceRow>(
            "SELECT * FROM attachment_references \
             WHERE content_hash = ? AND deleted_at IS NULL \
             ORDER BY created_at DESC",
        )
        .bind(content_hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn search_references(
        &self,
        search: &ReferenceSearch,
    ) -> MetadataResult<Vec<ReferenceRow>> {
        let mut sql =
            String::from("SELECT * FROM attachment_references WHERE deleted_at IS NULL");
        let mut binds: Vec<String> = Vec::new();

        if let Some(fragment) = &search.filename_contains {
            sql.push_str(" AND filename LIKE ?");
            binds.push(format!("%{}%", escape_like(fragment)));
        }
        if let Some(entity_type) = &search.entity_type {
            sql.push_str(" AND entity_type = ?");
            binds.push(entity_type.clone());
        }
        if let Some(tag) = &search.tag {
            // Tags are a JSON array of validated strings, so a quoted
            // substring match is exact enough.
            sql.push_str(" AND tags_json LIKE ?");
            binds.push(format!("%\"{}\"%", escape_like(tag)));
        }
        if let Some(uploader_id) = &search.uploader_id {
            sql.push_str(" AND uploader_id = ?");
            binds.push(uploader_id.clone());
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");

        let mut query = sqlx::query_as::<_, ReferenceRow>(&sql);
        for bind in &binds {
            query = query.bind(bind);
        }
        let limit = if search.limit == 0 { 100 } else { search.limit };
        query = query.bind(limit as i64).bind(search.offset as i64);

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn update_reference(
        &self,
        reference_id: Uuid,
        description: Option<Option<String>>,
        tags: Option<Vec<String>>,
    ) -> MetadataResult<ReferenceRow> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query_as::<_, ReferenceRow>(
            "SELECT * FROM attachment_references \
             WHERE reference_id = ? AND deleted_at IS NULL",
        )
        .bind(reference_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("reference {reference_id}")))?;

        let new_description = match description {
            Some(d) => d,
            None => existing.description.clone(),
        };
        let new_tags_json = match tags {
            Some(t) => serde_json::to_string(&t)
                .map_err(|e| MetadataError::Internal(e.to_string()))?,
            None => existing.tags_json.clone(),
        };

        sqlx::query(
            "UPDATE attachment_references \
             SET description = ?, tags_json = ?, modified_at = ? \
             WHERE reference_id = ?",
        )
        .bind(&new_description)
        .bind(&new_tags_json)
        .bind(now)
        .bind(reference_id)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, ReferenceRow>(
            "SELECT * FROM attachment_references WHERE reference_id = ?",
        )
        .bind(reference_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }
}

#[async_trait]
impl HealthRepo for SqliteStore {
    async fn record_health(&self, probe: &StorageHealthRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO storage_health (endpoint_id, checked_at, healthy, latency_ms, error) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&probe.endpoint_id)
        .bind(probe.checked_at)
        .bind(probe.healthy)
        .bind(probe.latency_ms)
        .bind(&probe.error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn recent_health(
        &self,
        endpoint_id: &str,
        limit: u32,
    ) -> MetadataResult<Vec<StorageHealthRow>> {
        let rows = sqlx::query_as::<_, StorageHealthRow>(
            "SELECT endpoint_id, checked_at, healthy, latency_ms, error \
             FROM storage_health WHERE endpoint_id = ? \
             ORDER BY checked_at DESC LIMIT ?",
        )
        .bind(endpoint_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn latest_health(&self) -> MetadataResult<Vec<StorageHealthRow>> {
        let rows = sqlx::query_as::<_, StorageHealthRow>(
            "SELECT h.endpoint_id, h.checked_at, h.healthy, h.latency_ms, h.error \
             FROM storage_health h \
             JOIN (SELECT endpoint_id, MAX(checked_at) AS max_checked \
                   FROM storage_health GROUP BY endpoint_id) latest \
               ON h.endpoint_id = latest.endpoint_id \
              AND h.checked_at = latest.max_checked \
             ORDER BY h.endpoint_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn prune_health(&self, older_than: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM storage_health WHERE checked_at < ?")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl QuotaRepo for SqliteStore {
    async fn get_quota(&self, user_id: &str) -> MetadataResult<Option<QuotaRow>> {
        let row = sqlx::query_as::<_, QuotaRow>("SELECT * FROM upload_quotas WHERE user_id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn ensure_quota(
        &self,
        user_id: &str,
        limit_bytes: i64,
        limit_files: i64,
    ) -> MetadataResult<QuotaRow> {
        sqlx::query(
            "INSERT INTO upload_quotas (user_id, used_bytes, used_files, \
                                        limit_bytes, limit_files, updated_at) \
             VALUES (?, 0, 0, ?, ?, ?) \
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(limit_bytes)
        .bind(limit_files)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, QuotaRow>("SELECT * FROM upload_quotas WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn reserve_quota(&self, user_id: &str, size_bytes: i64) -> MetadataResult<()> {
        // Conditional update: the reservation and the limit check are one
        // statement, so concurrent uploads cannot jointly overshoot.
        let result = sqlx::query(
            "UPDATE upload_quotas SET \
                 used_bytes = used_bytes + ?, \
                 used_files = used_files + 1, \
                 updated_at = ? \
             WHERE user_id = ? \
               AND used_bytes + ? <= limit_bytes \
               AND used_files + 1 <= limit_files",
        )
        .bind(size_bytes)
        .bind(OffsetDateTime::now_utc())
        .bind(user_id)
        .bind(size_bytes)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(());
        }

        match self.get_quota(user_id).await? {
            Some(quota) => Err(MetadataError::QuotaExceeded {
                user_id: user_id.to_string(),
                detail: format!(
                    "{} of {} bytes, {} of {} files used",
                    quota.used_bytes, quota.limit_bytes, quota.used_files, quota.limit_files
                ),
            }),
            None => Err(MetadataError::NotFound(format!(
                "quota row for user {user_id}"
            ))),
        }
    }

    async fn release_quota(&self, user_id: &str, size_bytes: i64) -> MetadataResult<()> {
        sqlx::query(
            "UPDATE upload_quotas SET \
                 used_bytes = MAX(used_bytes - ?, 0), \
                 used_files = MAX(used_files - 1, 0), \
                 updated_at = ? \
             WHERE user_id = ?",
        )
        .bind(size_bytes)
        .bind(OffsetDateTime::now_utc())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Escape LIKE wildcards in user-supplied fragments.
fn escape_like(fragment: &str) -> String {
    fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::new(dir.path().join("metadata.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn new_content(hash: &str, size: i64) -> NewContentObject {
        NewContentObject {
            content_hash: hash.to_string(),
            size_bytes: size,
            mime_type: "application/octet-stream".to_string(),
            extension: "bin".to_string(),
        }
    }

    fn new_reference(hash: &str, entity_id: &str) -> NewReference {
        NewReference {
            reference_id: Uuid::new_v4(),
            content_hash: hash.to_string(),
            entity_type: "ticket".to_string(),
            entity_id: entity_id.to_string(),
            filename: "report.pdf".to_string(),
            uploader_id: "user-1".to_string(),
            description: None,
            tags: vec!["bug".to_string()],
        }
    }

    const HASH: &str = "0000000000000000000000000000000000000000000000000000000000000001";

    #[tokio::test]
    async fn test_attach_creates_then_increments() {
        let (_dir, store) = test_store().await;

        store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-1"))
            .await
            .unwrap();
        let content = store.get_content(HASH).await.unwrap().unwrap();
        assert_eq!(content.ref_count, 1);
        assert_eq!(content.size_bytes, 100);

        store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-2"))
            .await
            .unwrap();
        let content = store.get_content(HASH).await.unwrap().unwrap();
        assert_eq!(content.ref_count, 2);

        let refs = store.list_by_hash(HASH).await.unwrap();
        assert_eq!(refs.len(), 2);
    }

    #[tokio::test]
    async fn test_detach_decrements_and_soft_deletes() {
        let (_dir, store) = test_store().await;

        let r1 = store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-1"))
            .await
            .unwrap();
        store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-2"))
            .await
            .unwrap();

        let detached = store.detach(r1.reference_id).await.unwrap();
        assert!(detached.deleted_at.is_some());

        let content = store.get_content(HASH).await.unwrap().unwrap();
        assert_eq!(content.ref_count, 1);

        // The soft-deleted reference is gone from live lookups.
        assert!(store.get_reference(r1.reference_id).await.unwrap().is_none());
        // Double-detach is NotFound, not a second decrement.
        assert!(matches!(
            store.detach(r1.reference_id).await,
            Err(MetadataError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_detach_at_zero_is_integrity_violation() {
        let (_dir, store) = test_store().await;

        let r = store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-1"))
            .await
            .unwrap();

        // Force drift: zero the count while the reference is still live.
        sqlx::query("UPDATE content_objects SET ref_count = 0 WHERE content_hash = ?")
            .bind(HASH)
            .execute(store.pool())
            .await
            .unwrap();

        let err = store.detach(r.reference_id).await.unwrap_err();
        assert!(matches!(err, MetadataError::Integrity(_)));

        // The failed transaction rolled the soft-delete back.
        assert!(store.get_reference(r.reference_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_orphan_cleanup_respects_retention_and_reattach() {
        let (_dir, store) = test_store().await;

        let r = store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-1"))
            .await
            .unwrap();
        store.detach(r.reference_id).await.unwrap();

        // Young orphan survives: cutoff is in the past.
        let past_cutoff = OffsetDateTime::now_utc() - time::Duration::hours(1);
        let deleted = store.delete_orphaned_atomic(past_cutoff, 100).await.unwrap();
        assert!(deleted.is_empty());
        assert!(store.content_exists(HASH).await.unwrap());

        // Re-attached content survives even past the cutoff.
        store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-2"))
            .await
            .unwrap();
        let future_cutoff = OffsetDateTime::now_utc() + time::Duration::hours(1);
        let deleted = store
            .delete_orphaned_atomic(future_cutoff, 100)
            .await
            .unwrap();
        assert!(deleted.is_empty());

        // Orphan past the window goes.
        let refs = store.list_by_hash(HASH).await.unwrap();
        store.detach(refs[0].reference_id).await.unwrap();
        let orphans = store.find_orphaned(future_cutoff, 100).await.unwrap();
        assert_eq!(orphans.len(), 1);
        let deleted = store
            .delete_orphaned_atomic(future_cutoff, 100)
            .await
            .unwrap();
        assert_eq!(deleted.len(), 1);
        assert_eq!(deleted[0].content_hash, HASH);
        assert!(!store.content_exists(HASH).await.unwrap());
    }

    #[tokio::test]
    async fn test_verify_and_repair_integrity() {
        let (_dir, store) = test_store().await;

        store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-1"))
            .await
            .unwrap();
        store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-2"))
            .await
            .unwrap();

        // Undisturbed system: no issues.
        assert!(store.verify_integrity().await.unwrap().is_empty());

        // Force the stored count wrong.
        sqlx::query("UPDATE content_objects SET ref_count = 7 WHERE content_hash = ?")
            .bind(HASH)
            .execute(store.pool())
            .await
            .unwrap();

        let issues = store.verify_integrity().await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].content_hash, HASH);
        assert_eq!(issues[0].recorded_ref_count, 7);
        assert_eq!(issues[0].actual_ref_count, 2);

        // Verify alone must not modify state.
        assert_eq!(store.get_content(HASH).await.unwrap().unwrap().ref_count, 7);

        let repaired = store.repair_integrity().await.unwrap();
        assert_eq!(repaired, 1);
        assert_eq!(store.get_content(HASH).await.unwrap().unwrap().ref_count, 2);
        assert!(store.verify_integrity().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_search_references() {
        let (_dir, store) = test_store().await;

        let mut r = new_reference(HASH, "T-1");
        r.filename = "design-doc.pdf".to_string();
        r.tags = vec!["design".to_string()];
        store.attach(&new_content(HASH, 10), &r).await.unwrap();

        let mut r2 = new_reference(HASH, "T-2");
        r2.filename = "screenshot.png".to_string();
        store.attach(&new_content(HASH, 10), &r2).await.unwrap();

        let hits = store
            .search_references(&ReferenceSearch {
                filename_contains: Some("design".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].filename, "design-doc.pdf");

        let hits = store
            .search_references(&ReferenceSearch {
                tag: Some("design".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);

        let hits = store
            .search_references(&ReferenceSearch {
                entity_type: Some("project".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_update_reference() {
        let (_dir, store) = test_store().await;

        let r = store
            .attach(&new_content(HASH, 10), &new_reference(HASH, "T-1"))
            .await
            .unwrap();

        let updated = store
            .update_reference(
                r.reference_id,
                Some(Some("now with words".to_string())),
                Some(vec!["a".to_string(), "b".to_string()]),
            )
            .await
            .unwrap();
        assert_eq!(updated.description.as_deref(), Some("now with words"));
        assert_eq!(updated.tags(), vec!["a", "b"]);

        // Omitted fields stay untouched.
        let updated = store
            .update_reference(r.reference_id, None, None)
            .await
            .unwrap();
        assert_eq!(updated.description.as_deref(), Some("now with words"));
    }

    #[tokio::test]
    async fn test_quota_reserve_and_release() {
        let (_dir, store) = test_store().await;

        store.ensure_quota("u1", 100, 2).await.unwrap();
        store.reserve_quota("u1", 60).await.unwrap();
        store.reserve_quota("u1", 40).await.unwrap();

        // Byte budget exhausted.
        let err = store.reserve_quota("u1", 1).await.unwrap_err();
        assert!(matches!(err, MetadataError::QuotaExceeded { .. }));

        store.release_quota("u1", 60).await.unwrap();
        store.reserve_quota("u1", 10).await.unwrap();

        // File budget: 2 slots, both in use again.
        let err = store.reserve_quota("u1", 1).await.unwrap_err();
        assert!(matches!(err, MetadataError::QuotaExceeded { .. }));

        let quota = store.get_quota("u1").await.unwrap().unwrap();
        assert_eq!(quota.used_bytes, 50);
        assert_eq!(quota.used_files, 2);
    }

    #[tokio::test]
    async fn test_health_records_and_latest() {
        let (_dir, store) = test_store().await;

        for (id, healthy) in [("ep-a", true), ("ep-a", false), ("ep-b", true)] {
            store
                .record_health(&StorageHealthRow {
                    endpoint_id: id.to_string(),
                    checked_at: OffsetDateTime::now_utc(),
                    healthy,
                    latency_ms: 5,
                    error: (!healthy).then(|| "probe failed".to_string()),
                })
                .await
                .unwrap();
            // Distinct timestamps for deterministic MAX().
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let recent = store.recent_health("ep-a", 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(!recent[0].healthy, "newest ep-a probe is the failure");

        let latest = store.latest_health().await.unwrap();
        assert_eq!(latest.len(), 2);
    }

    #[tokio::test]
    async fn test_storage_stats() {
        let (_dir, store) = test_store().await;

        const OTHER: &str =
            "0000000000000000000000000000000000000000000000000000000000000002";

        store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-1"))
            .await
            .unwrap();
        store
            .attach(&new_content(HASH, 100), &new_reference(HASH, "T-2"))
            .await
            .unwrap();
        store
            .attach(&new_content(OTHER, 50), &new_reference(OTHER, "T-3"))
            .await
            .unwrap();

        let stats = store.storage_stats().await.unwrap();
        assert_eq!(stats.total_files, 2);
        assert_eq!(stats.total_references, 3);
        assert_eq!(stats.unique_files, 1);
        assert_eq!(stats.shared_files, 1);
        assert_eq!(stats.physical_bytes, 150);
        assert_eq!(stats.logical_bytes, 250);
        assert_eq!(stats.saved_bytes, 100);
    }
}
