//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Maximum accepted upload size in bytes.
    #[serde(default = "default_max_upload_size")]
    pub max_upload_size_bytes: u64,
    /// Spool threshold: uploads larger than this spill to a temp file.
    #[serde(default = "default_spool_threshold")]
    pub spool_threshold_bytes: u64,
    /// Maximum files per batch upload request.
    #[serde(default = "default_max_batch_files")]
    pub max_batch_files: usize,
    /// Cache max-age for download/view responses, in seconds.
    #[serde(default = "default_cache_max_age_secs")]
    pub cache_max_age_secs: u64,
    /// Enable the /metrics endpoint for Prometheus scraping (default: true).
    /// When enabled, restrict the endpoint to scraper IPs at the
    /// infrastructure level.
    #[serde(default = "default_metrics_enabled")]
    pub metrics_enabled: bool,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_max_upload_size() -> u64 {
    crate::DEFAULT_MAX_UPLOAD_SIZE
}

fn default_spool_threshold() -> u64 {
    crate::DEFAULT_SPOOL_THRESHOLD
}

fn default_max_batch_files() -> usize {
    crate::MAX_BATCH_UPLOAD_FILES
}

fn default_cache_max_age_secs() -> u64 {
    3600
}

fn default_metrics_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            max_upload_size_bytes: default_max_upload_size(),
            spool_threshold_bytes: default_spool_threshold(),
            max_batch_files: default_max_batch_files(),
            cache_max_age_secs: default_cache_max_age_secs(),
            metrics_enabled: default_metrics_enabled(),
        }
    }
}

/// Storage backend configuration for a single endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// Local filesystem storage.
    Filesystem {
        /// Root directory for storage.
        path: PathBuf,
    },
    /// S3-compatible storage.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Optional endpoint URL (for MinIO, etc.).
        endpoint: Option<String>,
        /// AWS region.
        region: Option<String>,
        /// Optional key prefix.
        prefix: Option<String>,
        /// AWS access key ID. Falls back to the ambient credential chain if
        /// not set. Prefer env vars or IAM roles over config files.
        access_key_id: Option<String>,
        /// AWS secret access key.
        secret_access_key: Option<String>,
        /// Force path-style URLs (required for MinIO and some S3-compatible
        /// services). Defaults to false (virtual-hosted style).
        #[serde(default)]
        force_path_style: bool,
    },
}

impl BackendConfig {
    /// Validate backend configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            BackendConfig::S3 {
                access_key_id,
                secret_access_key,
                ..
            } => match (access_key_id.as_ref(), secret_access_key.as_ref()) {
                (Some(_), Some(_)) | (None, None) => Ok(()),
                _ => Err(
                    "s3 backend requires both access_key_id and secret_access_key when either is set"
                        .to_string(),
                ),
            },
            BackendConfig::Filesystem { .. } => Ok(()),
        }
    }
}

/// Role of a storage endpoint in the replication topology.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
    /// First choice for reads, required acknowledger for all writes.
    Primary,
    /// Read failover target; participates in hybrid write quorums.
    Backup,
    /// Asynchronous replica, last-resort read target.
    Mirror,
}

impl EndpointRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Primary => "primary",
            Self::Backup => "backup",
            Self::Mirror => "mirror",
        }
    }
}

/// A single configured storage endpoint.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Stable identifier, referenced by health records and promote calls.
    pub id: String,
    /// Replication role.
    pub role: EndpointRole,
    /// Read-order tie-break; lower probes first within a role.
    #[serde(default = "default_endpoint_priority")]
    pub priority: u32,
    /// Disabled endpoints are skipped entirely.
    #[serde(default = "default_endpoint_enabled")]
    pub enabled: bool,
    /// Optional capacity ceiling in bytes (advisory, surfaced in stats).
    pub max_size_bytes: Option<u64>,
    /// Backend this endpoint writes to.
    pub backend: BackendConfig,
}

fn default_endpoint_priority() -> u32 {
    1
}

fn default_endpoint_enabled() -> bool {
    true
}

/// Replication policy for blob writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    /// Every enabled endpoint must acknowledge before the write succeeds.
    #[default]
    Synchronous,
    /// The primary alone must acknowledge; replication happens in the
    /// background and failures are logged, not surfaced.
    Asynchronous,
    /// Primary plus at least one backup must acknowledge; mirrors replicate
    /// in the background.
    Hybrid,
}

/// Storage orchestration configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Replication policy applied to blob writes.
    #[serde(default)]
    pub replication: ReplicationMode,
    /// Configured endpoints. Exactly one enabled endpoint must be primary.
    pub endpoints: Vec<EndpointConfig>,
    /// Retry attempts per endpoint operation.
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    /// Base backoff between retries in milliseconds (doubles per attempt).
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Consecutive failures before an endpoint's circuit opens.
    #[serde(default = "default_breaker_threshold")]
    pub breaker_threshold: u32,
    /// Seconds an open circuit waits before letting a probe request through.
    #[serde(default = "default_breaker_cooldown_secs")]
    pub breaker_cooldown_secs: u64,
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_breaker_threshold() -> u32 {
    5
}

fn default_breaker_cooldown_secs() -> u64 {
    60
}

impl StorageConfig {
    /// Validate the endpoint topology.
    ///
    /// Enforced invariants:
    /// - at least one endpoint configured
    /// - endpoint ids are unique and non-empty
    /// - exactly one enabled endpoint has the primary role
    pub fn validate(&self) -> Result<(), String> {
        if self.endpoints.is_empty() {
            return Err("storage requires at least one endpoint".to_string());
        }

        let mut seen = std::collections::HashSet::new();
        for ep in &self.endpoints {
            if ep.id.is_empty() {
                return Err("endpoint id must not be empty".to_string());
            }
            if !seen.insert(ep.id.as_str()) {
                return Err(format!("duplicate endpoint id: {}", ep.id));
            }
            ep.backend.validate()?;
        }

        let enabled_primaries = self
            .endpoints
            .iter()
            .filter(|ep| ep.enabled && ep.role == EndpointRole::Primary)
            .count();
        if enabled_primaries != 1 {
            return Err(format!(
                "exactly one enabled primary endpoint required, found {enabled_primaries}"
            ));
        }

        Ok(())
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn breaker_cooldown(&self) -> Duration {
        Duration::from_secs(self.breaker_cooldown_secs)
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database (recommended for testing and small deployments).
    Sqlite {
        /// Database file path.
        path: PathBuf,
    },
    /// PostgreSQL database.
    Postgres {
        /// Connection URL (optional if using individual fields).
        url: Option<String>,
        /// Database host.
        host: Option<String>,
        /// Database port (default: 5432).
        #[serde(default = "default_pg_port")]
        port: Option<u16>,
        /// Database username.
        username: Option<String>,
        /// Database password. Prefer the DEPOT_METADATA__PASSWORD env var
        /// over storing this in config files.
        password: Option<String>,
        /// Database name.
        database: Option<String>,
        /// Maximum connections in the pool.
        #[serde(default = "default_max_connections")]
        max_connections: u32,
        /// Statement timeout in milliseconds (prevents hung queries).
        #[serde(default = "default_statement_timeout_ms")]
        statement_timeout_ms: Option<u64>,
    },
}

fn default_pg_port() -> Option<u16> {
    Some(5432)
}

fn default_max_connections() -> u32 {
    10
}

fn default_statement_timeout_ms() -> Option<u64> {
    Some(300_000)
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/metadata.db"),
        }
    }
}

impl MetadataConfig {
    /// Validate metadata configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { .. } => Ok(()),
            MetadataConfig::Postgres {
                url,
                host,
                database,
                ..
            } => match (url.as_ref(), host.as_ref(), database.as_ref()) {
                (Some(_), _, _) => Ok(()),
                (None, Some(_), Some(_)) => Ok(()),
                _ => Err(
                    "postgres config requires either 'url' or 'host' + 'database'".to_string(),
                ),
            },
        }
    }
}

/// Rate limiter configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Master switch; when false no buckets are allocated.
    #[serde(default = "default_rate_limit_enabled")]
    pub enabled: bool,
    /// Per-IP token refill rate (requests per minute).
    #[serde(default = "default_ip_rpm")]
    pub ip_requests_per_minute: u32,
    /// Per-IP bucket capacity.
    #[serde(default = "default_ip_burst")]
    pub ip_burst: u32,
    /// Per-user token refill rate (requests per minute).
    #[serde(default = "default_user_rpm")]
    pub user_requests_per_minute: u32,
    /// Per-user bucket capacity.
    #[serde(default = "default_user_burst")]
    pub user_burst: u32,
    /// Global token refill rate (requests per minute).
    #[serde(default = "default_global_rpm")]
    pub global_requests_per_minute: u32,
    /// Global bucket capacity.
    #[serde(default = "default_global_burst")]
    pub global_burst: u32,
    /// Tokens debited per upload request.
    #[serde(default = "default_upload_cost")]
    pub upload_cost: u32,
    /// Tokens debited per download/read request.
    #[serde(default = "default_download_cost")]
    pub download_cost: u32,
    /// IPs admitted unconditionally.
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// IPs denied unconditionally.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Maximum tracked bucket entries before new identities are rejected.
    #[serde(default = "default_rate_limit_max_entries")]
    pub max_entries: u32,
    /// Idle time before a bucket entry is evicted, in seconds.
    #[serde(default = "default_rate_limit_entry_ttl_secs")]
    pub entry_ttl_secs: u64,
    /// Interval between bucket eviction passes, in seconds.
    #[serde(default = "default_rate_limit_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

fn default_rate_limit_enabled() -> bool {
    true
}

fn default_ip_rpm() -> u32 {
    120
}

fn default_ip_burst() -> u32 {
    30
}

fn default_user_rpm() -> u32 {
    240
}

fn default_user_burst() -> u32 {
    60
}

fn default_global_rpm() -> u32 {
    6000
}

fn default_global_burst() -> u32 {
    1000
}

fn default_upload_cost() -> u32 {
    5
}

fn default_download_cost() -> u32 {
    1
}

fn default_rate_limit_max_entries() -> u32 {
    100_000
}

fn default_rate_limit_entry_ttl_secs() -> u64 {
    900
}

fn default_rate_limit_cleanup_interval_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_rate_limit_enabled(),
            ip_requests_per_minute: default_ip_rpm(),
            ip_burst: default_ip_burst(),
            user_requests_per_minute: default_user_rpm(),
            user_burst: default_user_burst(),
            global_requests_per_minute: default_global_rpm(),
            global_burst: default_global_burst(),
            upload_cost: default_upload_cost(),
            download_cost: default_download_cost(),
            whitelist: Vec::new(),
            blacklist: Vec::new(),
            max_entries: default_rate_limit_max_entries(),
            entry_ttl_secs: default_rate_limit_entry_ttl_secs(),
            cleanup_interval_secs: default_rate_limit_cleanup_interval_secs(),
        }
    }
}

impl RateLimitConfig {
    /// Validate rate limit configuration. Returns non-fatal warnings.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if !self.enabled {
            return Ok(warnings);
        }

        if self.ip_requests_per_minute == 0
            || self.user_requests_per_minute == 0
            || self.global_requests_per_minute == 0
        {
            return Err("rate limit refill rates must be positive".to_string());
        }
        if self.ip_burst == 0 || self.user_burst == 0 || self.global_burst == 0 {
            return Err("rate limit burst sizes must be positive".to_string());
        }
        if self.upload_cost == 0 || self.download_cost == 0 {
            return Err("rate limit costs must be positive".to_string());
        }

        if self.upload_cost > self.ip_burst {
            return Err(format!(
                "upload_cost ({}) exceeds ip_burst ({}); uploads could never be admitted",
                self.upload_cost, self.ip_burst
            ));
        }

        if self.upload_cost <= self.download_cost {
            warnings.push(
                "upload_cost <= download_cost; uploads are normally weighted heavier than reads"
                    .to_string(),
            );
        }
        if self.max_entries < 1000 {
            warnings.push(format!(
                "max_entries ({}) is low; bursty traffic may hit the entry cap",
                self.max_entries
            ));
        }

        for ip in self.whitelist.iter().chain(self.blacklist.iter()) {
            if ip.parse::<std::net::IpAddr>().is_err() {
                return Err(format!("invalid IP in whitelist/blacklist: {ip}"));
            }
        }

        Ok(warnings)
    }

    pub fn entry_ttl(&self) -> Duration {
        Duration::from_secs(self.entry_ttl_secs)
    }
}

/// Security scanning configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Enable content scanning on upload.
    #[serde(default = "default_scan_enabled")]
    pub scan_enabled: bool,
    /// Extensions rejected outright (lowercase, without the dot).
    #[serde(default = "default_blocked_extensions")]
    pub blocked_extensions: Vec<String>,
}

fn default_scan_enabled() -> bool {
    true
}

fn default_blocked_extensions() -> Vec<String> {
    ["exe", "dll", "bat", "cmd", "sh", "msi", "scr", "com", "jar"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            scan_enabled: default_scan_enabled(),
            blocked_extensions: default_blocked_extensions(),
        }
    }
}

/// Input validation configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidationConfig {
    /// Maximum filename length after sanitization.
    #[serde(default = "default_max_filename_length")]
    pub max_filename_length: usize,
    /// Entity types references may attach to.
    #[serde(default = "default_allowed_entity_types")]
    pub allowed_entity_types: Vec<String>,
    /// Maximum entity id length.
    #[serde(default = "default_max_entity_id_length")]
    pub max_entity_id_length: usize,
    /// Maximum description length.
    #[serde(default = "default_max_description_length")]
    pub max_description_length: usize,
    /// Maximum number of tags per reference.
    #[serde(default = "default_max_tags")]
    pub max_tags: usize,
    /// Maximum length of a single tag.
    #[serde(default = "default_max_tag_length")]
    pub max_tag_length: usize,
}

fn default_max_filename_length() -> usize {
    255
}

fn default_allowed_entity_types() -> Vec<String> {
    [
        "ticket", "project", "epic", "story", "task", "comment", "document", "team", "user",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_max_entity_id_length() -> usize {
    100
}

fn default_max_description_length() -> usize {
    1000
}

fn default_max_tags() -> usize {
    20
}

fn default_max_tag_length() -> usize {
    50
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_filename_length: default_max_filename_length(),
            allowed_entity_types: default_allowed_entity_types(),
            max_entity_id_length: default_max_entity_id_length(),
            max_description_length: default_max_description_length(),
            max_tags: default_max_tags(),
            max_tag_length: default_max_tag_length(),
        }
    }
}

/// Per-user upload quota configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Enable quota enforcement on uploads.
    #[serde(default = "default_quota_enabled")]
    pub enabled: bool,
    /// Default byte budget for users without an explicit quota row (10 GiB).
    #[serde(default = "default_quota_limit_bytes")]
    pub default_limit_bytes: u64,
    /// Default file-count budget.
    #[serde(default = "default_quota_limit_files")]
    pub default_limit_files: u64,
}

fn default_quota_enabled() -> bool {
    true
}

fn default_quota_limit_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_quota_limit_files() -> u64 {
    10_000
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            enabled: default_quota_enabled(),
            default_limit_bytes: default_quota_limit_bytes(),
            default_limit_files: default_quota_limit_files(),
        }
    }
}

/// Orphan cleanup configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Enable the periodic orphan cleanup task.
    #[serde(default = "default_cleanup_enabled")]
    pub enabled: bool,
    /// Interval between cleanup runs, in seconds.
    #[serde(default = "default_cleanup_interval_secs")]
    pub interval_secs: u64,
    /// Retention window: orphans younger than this are never deleted. This
    /// protects in-flight uploads about to re-attach the same hash.
    #[serde(default = "default_cleanup_retention_secs")]
    pub retention_secs: u64,
    /// Maximum orphans removed per run.
    #[serde(default = "default_cleanup_batch_size")]
    pub batch_size: u32,
}

fn default_cleanup_enabled() -> bool {
    true
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_cleanup_retention_secs() -> u64 {
    86400
}

fn default_cleanup_batch_size() -> u32 {
    1000
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: default_cleanup_enabled(),
            interval_secs: default_cleanup_interval_secs(),
            retention_secs: default_cleanup_retention_secs(),
            batch_size: default_cleanup_batch_size(),
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Endpoint health monitoring configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Enable the periodic health sweep task.
    #[serde(default = "default_health_enabled")]
    pub enabled: bool,
    /// Interval between sweeps, in seconds.
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,
    /// Per-probe timeout, in seconds.
    #[serde(default = "default_health_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
    /// Consecutive failed probes before the primary is demoted and a backup
    /// promoted in its place.
    #[serde(default = "default_health_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_health_enabled() -> bool {
    true
}

fn default_health_interval_secs() -> u64 {
    60
}

fn default_health_probe_timeout_secs() -> u64 {
    10
}

fn default_health_failure_threshold() -> u32 {
    3
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            enabled: default_health_enabled(),
            interval_secs: default_health_interval_secs(),
            probe_timeout_secs: default_health_probe_timeout_secs(),
            failure_threshold: default_health_failure_threshold(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs.max(1))
    }
}

/// Top-level application configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub cleanup: CleanupConfig,
    #[serde(default)]
    pub health: HealthConfig,
}

impl AppConfig {
    /// Validate the whole configuration, failing fast on hard errors and
    /// returning non-fatal warnings for the caller to log.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        self.storage.validate()?;
        self.metadata.validate()?;
        let warnings = self.rate_limit.validate()?;
        Ok(warnings)
    }

    /// Create a test configuration backed by paths under `root`.
    ///
    /// **For testing only.** Single filesystem primary, SQLite metadata,
    /// rate limiting disabled.
    pub fn for_testing(root: &std::path::Path) -> Self {
        Self {
            server: ServerConfig::default(),
            storage: StorageConfig {
                replication: ReplicationMode::Synchronous,
                endpoints: vec![EndpointConfig {
                    id: "primary".to_string(),
                    role: EndpointRole::Primary,
                    priority: 1,
                    enabled: true,
                    max_size_bytes: None,
                    backend: BackendConfig::Filesystem {
                        path: root.join("storage"),
                    },
                }],
                retry_attempts: 1,
                retry_backoff_ms: 10,
                breaker_threshold: default_breaker_threshold(),
                breaker_cooldown_secs: default_breaker_cooldown_secs(),
            },
            metadata: MetadataConfig::Sqlite {
                path: root.join("metadata.db"),
            },
            rate_limit: RateLimitConfig {
                enabled: false,
                ..Default::default()
            },
            security: SecurityConfig::default(),
            validation: ValidationConfig::default(),
            quota: QuotaConfig::default(),
            cleanup: CleanupConfig::default(),
            health: HealthConfig::default(),
        }
    }
}
