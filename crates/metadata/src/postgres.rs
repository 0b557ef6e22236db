//! PostgreSQL metadata store implementation.
//!
//! Mirrors the SQLite store operation for operation; recommended for
//! multi-instance deployments where SQLite's single-writer model is not
//! enough. All cross-process coordination (concurrent attach of the same
//! hash from different service instances) happens through these queries.

use crate::error::{MetadataError, MetadataResult};
use crate::models::{
    ContentObjectRow, IntegrityIssue, NewContentObject, NewReference, QuotaRow, ReferenceRow,
    ReferenceSearch, StorageHealthRow, StorageStats,
};
use crate::repos::{ContentRepo, HealthRepo, QuotaRepo, ReferenceRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres};
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS content_objects (
    content_hash     TEXT PRIMARY KEY,
    size_bytes       BIGINT NOT NULL,
    mime_type        TEXT NOT NULL,
    extension        TEXT NOT NULL DEFAULT '',
    ref_count        BIGINT NOT NULL DEFAULT 0 CHECK (ref_count >= 0),
    created_at       TIMESTAMPTZ NOT NULL,
    updated_at       TIMESTAMPTZ NOT NULL,
    last_accessed_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS attachment_references (
    reference_id  UUID PRIMARY KEY,
    content_hash  TEXT NOT NULL REFERENCES content_objects(content_hash),
    entity_type   TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    filename      TEXT NOT NULL,
    uploader_id   TEXT NOT NULL,
    description   TEXT,
    tags_json     TEXT NOT NULL DEFAULT '[]',
    created_at    TIMESTAMPTZ NOT NULL,
    modified_at   TIMESTAMPTZ NOT NULL,
    deleted_at    TIMESTAMPTZ
);

CREATE INDEX IF NOT EXISTS idx_references_entity
    ON attachment_references(entity_type, entity_id) WHERE deleted_at IS NULL;
CREATE INDEX IF NOT EXISTS idx_references_hash
    ON attachment_references(content_hash);
CREATE INDEX IF NOT EXISTS idx_content_orphans
    ON content_objects(updated_at) WHERE ref_count = 0;

CREATE TABLE IF NOT EXISTS storage_health (
    id          BIGSERIAL PRIMARY KEY,
    endpoint_id TEXT NOT NULL,
    checked_at  TIMESTAMPTZ NOT NULL,
    healthy     BOOLEAN NOT NULL,
    latency_ms  BIGINT NOT NULL,
    error       TEXT
);

CREATE INDEX IF NOT EXISTS idx_health_endpoint
    ON storage_health(endpoint_id, checked_at);

CREATE TABLE IF NOT EXISTS upload_quotas (
    user_id     TEXT PRIMARY KEY,
    used_bytes  BIGINT NOT NULL DEFAULT 0,
    used_files  BIGINT NOT NULL DEFAULT 0,
    limit_bytes BIGINT NOT NULL,
    limit_files BIGINT NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);
"#;

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a full connection URL.
    pub async fn from_url(
        url: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url).map_err(MetadataError::Database)?;
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    /// Connect using individual parameters.
    #[allow(clippy::too_many_arguments)]
    pub async fn from_params(
        host: &str,
        port: u16,
        username: Option<&str>,
        password: Option<&str>,
        database: &str,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        let mut opts = PgConnectOptions::new()
            .host(host)
            .port(port)
            .database(database);
        if let Some(username) = username {
            opts = opts.username(username);
        }
        if let Some(password) = password {
            opts = opts.password(password);
        }
        Self::connect(opts, max_connections, statement_timeout_ms).await
    }

    async fn connect(
        mut opts: PgConnectOptions,
        max_connections: u32,
        statement_timeout_ms: Option<u64>,
    ) -> MetadataResult<Self> {
        if let Some(timeout_ms) = statement_timeout_ms {
            opts = opts.options([("statement_timeout", timeout_ms.to_string())]);
        }

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
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
impl ContentRepo for PostgresStore {
    async fn get_content(&self, content_hash: &str) -> MetadataResult<Option<ContentObjectRow>> {
        let row = sqlx::query_as::<_, ContentObjectRow>(
            "SELECT * FROM content_objects WHERE content_hash = $1",
        )
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn content_exists(&self, content_hash: &str) -> MetadataResult<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM content_objects WHERE content_hash = $1)",
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
        sqlx::query("UPDATE content_objects SET last_accessed_at = $1 WHERE content_hash = $2")
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
             WHERE ref_count = 0 AND updated_at < $1 \
             ORDER BY updated_at ASC LIMIT $2",
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
        // CTE with FOR UPDATE SKIP LOCKED: candidate rows stay locked from
        // the select through the delete, so a concurrent attach either
        // beats the lock (and the ref_count check fails) or waits for it.
        let rows = sqlx::query_as::<_, ContentObjectRow>(
            "WITH candidates AS ( \
                 SELECT content_hash FROM content_objects \
                 WHERE ref_count = 0 AND updated_at < $1 \
                 ORDER BY updated_at ASC LIMIT $2 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             DELETE FROM content_objects c \
             USING candidates \
             WHERE c.content_hash = candidates.content_hash AND c.ref_count = 0 \
             RETURNING c.*",
        )
        .bind(older_than)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
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
                 updated_at = $1 \
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
                        COUNT(*) FILTER (WHERE ref_count = 1), \
                        COUNT(*) FILTER (WHERE ref_count > 1), \
                        COUNT(*) FILTER (WHERE ref_count = 0) \
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
            "SELECT COALESCE(SUM(size_bytes), 0)::BIGINT, \
                    COALESCE(SUM(size_bytes * ref_count), 0)::BIGINT, \
                    COALESCE(SUM(CASE WHEN ref_count > 1 \
                                      THEN size_bytes * (ref_count - 1) ELSE 0 END), 0)::BIGINT \
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
impl ReferenceRepo for PostgresStore {
    async fn attach(
        &self,
        content: &NewContentObject,
        reference: &NewReference,
    ) -> MetadataResult<ReferenceRow> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO content_objects \
                 (content_hash, size_bytes, mime_type, extension, ref_count, \
                  created_at, updated_at, last_accessed_at) \
             VALUES ($1, $2, $3, $4, 1, $5, $5, $5) \
             ON CONFLICT (content_hash) DO UPDATE SET \
                 ref_count = content_objects.ref_count + 1, \
                 updated_at = EXCLUDED.updated_at, \
                 last_accessed_at = EXCLUDED.last_accessed_at",
        )
        .bind(&content.content_hash)
        .bind(content.size_bytes)
        .bind(&content.mime_type)
        .bind(&content.extension)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let row = sqlx::query_as::<_, ReferenceRow>(
            "INSERT INTO attachment_references \
                 (reference_id, content_hash, entity_type, entity_id, filename, \
                  uploader_id, description, tags_json, created_at, modified_at, deleted_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9, NULL) \
             RETURNING *",
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
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }

    async fn detach(&self, reference_id: Uuid) -> MetadataResult<ReferenceRow> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, ReferenceRow>(
            "UPDATE attachment_references SET deleted_at = $1, modified_at = $1 \
             WHERE reference_id = $2 AND deleted_at IS NULL \
             RETURNING *",
        )
        .bind(now)
        .bind(reference_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| MetadataError::NotFound(format!("reference {reference_id}")))?;

        let result = sqlx::query(
            "UPDATE content_objects SET ref_count = ref_count - 1, updated_at = $1 \
             WHERE content_hash = $2 AND ref_count > 0",
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
             WHERE reference_id = $1 AND deleted_at IS NULL",
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
             WHERE entity_type = $1 AND entity_id = $2 AND deleted_at IS NULL \
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
             WHERE content_hash = $1 AND deleted_at IS NULL \
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
        let mut n = 0;

        if let Some(fragment) = &search.filename_contains {
            n += 1;
            sql.push_str(&format!(" AND filename ILIKE ${n}"));
            binds.push(format!("%{}%", escape_like(fragment)));
        }
        if let Some(entity_type) = &search.entity_type {
            n += 1;
            sql.push_str(&format!(" AND entity_type = ${n}"));
            binds.push(entity_type.clone());
        }
        if let Some(tag) = &search.tag {
            n += 1;
            sql.push_str(&format!(" AND tags_json LIKE ${n}"));
            binds.push(format!("%\"{}\"%", escape_like(tag)));
        }
        if let Some(uploader_id) = &search.uploader_id {
            n += 1;
            sql.push_str(&format!(" AND uploader_id = ${n}"));
            binds.push(uploader_id.clone());
        }
        sql.push_str(&format!(
            " ORDER BY created_at DESC LIMIT ${} OFFSET ${}",
            n + 1,
            n + 2
        ));

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
             WHERE reference_id = $1 AND deleted_at IS NULL FOR UPDATE",
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

        let row = sqlx::query_as::<_, ReferenceRow>(
            "UPDATE attachment_references \
             SET description = $1, tags_json = $2, modified_at = $3 \
             WHERE reference_id = $4 \
             RETURNING *",
        )
        .bind(&new_description)
        .bind(&new_tags_json)
        .bind(now)
        .bind(reference_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(row)
    }
}

#[async_trait]
impl HealthRepo for PostgresStore {
    async fn record_health(&self, probe: &StorageHealthRow) -> MetadataResult<()> {
        sqlx::query(
            "INSERT INTO storage_health (endpoint_id, checked_at, healthy, latency_ms, error) \
             VALUES ($1, $2, $3, $4, $5)",
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
             FROM storage_health WHERE endpoint_id = $1 \
             ORDER BY checked_at DESC LIMIT $2",
        )
        .bind(endpoint_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn latest_health(&self) -> MetadataResult<Vec<StorageHealthRow>> {
        let rows = sqlx::query_as::<_, StorageHealthRow>(
            "SELECT DISTINCT ON (endpoint_id) \
                    endpoint_id, checked_at, healthy, latency_ms, error \
             FROM storage_health \
             ORDER BY endpoint_id, checked_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn prune_health(&self, older_than: OffsetDateTime) -> MetadataResult<u64> {
        let result = sqlx::query("DELETE FROM storage_health WHERE checked_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl QuotaRepo for PostgresStore {
    async fn get_quota(&self, user_id: &str) -> MetadataResult<Option<QuotaRow>> {
        let row = sqlx::query_as::<_, QuotaRow>("SELECT * FROM upload_quotas WHERE user_id = $1")
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
             VALUES ($1, 0, 0, $2, $3, $4) \
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .bind(limit_bytes)
        .bind(limit_files)
        .bind(OffsetDateTime::now_utc())
        .execute(&self.pool)
        .await?;

        let row = sqlx::query_as::<_, QuotaRow>("SELECT * FROM upload_quotas WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row)
    }

    async fn reserve_quota(&self, user_id: &str, size_bytes: i64) -> MetadataResult<()> {
        let result = sqlx::query(
            "UPDATE upload_quotas SET \
                 used_bytes = used_bytes + $1, \
                 used_files = used_files + 1, \
                 updated_at = $2 \
             WHERE user_id = $3 \
               AND used_bytes + $1 <= limit_bytes \
               AND used_files + 1 <= limit_files",
        )
        .bind(size_bytes)
        .bind(OffsetDateTime::now_utc())
        .bind(user_id)
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
                 used_bytes = GREATEST(used_bytes - $1, 0), \
                 used_files = GREATEST(used_files - 1, 0), \
                 updated_at = $2 \
             WHERE user_id = $3",
        )
        .bind(size_bytes)
        .bind(OffsetDateTime::now_utc())
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn escape_like(fragment: &str) -> String {
    fragment
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}
