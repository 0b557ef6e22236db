//! Storage orchestrator: replication policy and read failover across the
//! configured endpoint set.
//!
//! The orchestrator owns every endpoint adapter. Callers never talk to a
//! backend directly; blob placement, failover order, endpoint health, and
//! primary promotion are all decided here.

use crate::circuit::{CircuitBreaker, CircuitState};
use crate::error::{StorageError, StorageResult};
use crate::spool::Spool;
use crate::traits::{ByteStream, ObjectStore};
use bytes::Bytes;
use depot_core::config::{EndpointRole, ReplicationMode, StorageConfig};
use futures::TryStreamExt;
use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

/// A configured storage endpoint wrapped with health tracking.
pub struct Endpoint {
    id: String,
    role: RwLock<EndpointRole>,
    priority: u32,
    enabled: bool,
    max_size_bytes: Option<u64>,
    adapter: Arc<dyn ObjectStore>,
    breaker: CircuitBreaker,
    consecutive_probe_failures: AtomicU32,
}

impl Endpoint {
    fn role(&self) -> EndpointRole {
        *self.role.read().unwrap_or_else(|p| p.into_inner())
    }

    fn set_role(&self, role: EndpointRole) {
        *self.role.write().unwrap_or_else(|p| p.into_inner()) = role;
    }

    fn role_rank(&self) -> u8 {
        match self.role() {
            EndpointRole::Primary => 0,
            EndpointRole::Backup => 1,
            EndpointRole::Mirror => 2,
        }
    }
}

/// Result of a single endpoint health probe.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    pub endpoint_id: String,
    pub healthy: bool,
    pub latency: Duration,
    pub error: Option<String>,
}

/// Outcome of a full health sweep.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    pub probes: Vec<HealthProbe>,
    /// `(demoted_id, promoted_id)` when the sweep replaced the primary.
    pub promotion: Option<(String, String)>,
}

/// Acknowledged write result.
#[derive(Debug, Clone)]
pub struct WriteReceipt {
    /// Endpoints that acknowledged before the write returned.
    pub acknowledged: Vec<String>,
    /// Endpoints still replicating in the background.
    pub pending: usize,
}

/// Point-in-time view of one endpoint, for admin/health output.
#[derive(Debug, Clone, serde::Serialize)]
pub struct EndpointStatus {
    pub id: String,
    pub backend: &'static str,
    pub role: &'static str,
    pub priority: u32,
    pub enabled: bool,
    pub circuit: &'static str,
    pub consecutive_probe_failures: u32,
}

/// Storage orchestrator over the configured endpoint set.
pub struct Orchestrator {
    endpoints: Vec<Arc<Endpoint>>,
    replication: ReplicationMode,
    retry_attempts: u32,
    retry_backoff: Duration,
}

impl Orchestrator {
    /// Build an orchestrator from validated configuration and constructed
    /// adapters (one per endpoint, same order).
    pub fn new(config: &StorageConfig, adapters: Vec<Arc<dyn ObjectStore>>) -> Self {
        let endpoints = config
            .endpoints
            .iter()
            .zip(adapters)
            .map(|(ep, adapter)| {
                Arc::new(Endpoint {
                    id: ep.id.clone(),
                    role: RwLock::new(ep.role),
                    priority: ep.priority,
                    enabled: ep.enabled,
                    max_size_bytes: ep.max_size_bytes,
                    adapter,
                    breaker: CircuitBreaker::new(
                        config.breaker_threshold,
                        config.breaker_cooldown(),
                    ),
                    consecutive_probe_failures: AtomicU32::new(0),
                })
            })
            .collect();

        Self {
            endpoints,
            replication: config.replication,
            retry_attempts: config.retry_attempts.max(1),
            retry_backoff: config.retry_backoff(),
        }
    }

    /// Enabled endpoints in read order: primary first, then backups, then
    /// mirrors, priority ascending within each role.
    fn read_order(&self) -> Vec<Arc<Endpoint>> {
        let mut eps: Vec<Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|ep| ep.enabled)
            .cloned()
            .collect();
        eps.sort_by_key(|ep| (ep.role_rank(), ep.priority, ep.id.clone()));
        eps
    }

    fn enabled_by_role(&self, role: EndpointRole) -> Vec<Arc<Endpoint>> {
        let mut eps: Vec<Arc<Endpoint>> = self
            .endpoints
            .iter()
            .filter(|ep| ep.enabled && ep.role() == role)
            .cloned()
            .collect();
        eps.sort_by_key(|ep| (ep.priority, ep.id.clone()));
        eps
    }

    fn primary(&self) -> StorageResult<Arc<Endpoint>> {
        self.enabled_by_role(EndpointRole::Primary)
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::QuorumNotMet("no enabled primary endpoint".to_string()))
    }

    /// Write one blob to one endpoint, streaming from a fresh spool reader,
    /// with bounded retry and circuit breaker accounting.
    async fn write_to_endpoint(
        endpoint: &Endpoint,
        key: &str,
        spool: &Spool,
        retry_attempts: u32,
        retry_backoff: Duration,
    ) -> StorageResult<()> {
        if let Some(cap) = endpoint.max_size_bytes
            && spool.len() > cap
        {
            return Err(StorageError::Backend {
                backend: endpoint.adapter.backend_name(),
                message: format!(
                    "blob of {} bytes exceeds endpoint {} capacity of {cap} bytes",
                    spool.len(),
                    endpoint.id
                ),
            });
        }

        let mut last_err = None;
        for attempt in 0..retry_attempts {
            if !endpoint.breaker.can_execute() {
                return Err(StorageError::CircuitOpen(endpoint.id.clone()));
            }
            if attempt > 0 {
                tokio::time::sleep(retry_backoff * 2u32.pow(attempt - 1)).await;
            }

            match Self::write_once(endpoint, key, spool).await {
                Ok(()) => {
                    endpoint.breaker.record_success();
                    return Ok(());
                }
                Err(e) => {
                    endpoint.breaker.record_failure();
                    tracing::warn!(
                        endpoint = %endpoint.id,
                        key = %key,
                        attempt = attempt + 1,
                        error = %e,
                        "endpoint write failed"
                    );
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StorageError::Backend {
            backend: endpoint.adapter.backend_name(),
            message: "write failed with no recorded error".to_string(),
        }))
    }

    async fn write_once(endpoint: &Endpoint, key: &str, spool: &Spool) -> StorageResult<()> {
        let mut reader = spool.reader().await?;
        let mut upload = endpoint.adapter.put_stream(key).await?;
        loop {
            match reader.try_next().await {
                Ok(Some(chunk)) => {
                    if let Err(e) = upload.write(chunk).await {
                        let _ = upload.abort().await;
                        return Err(e);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = upload.abort().await;
                    return Err(e);
                }
            }
        }
        upload.finish().await?;
        Ok(())
    }

    /// Replicate `key` to `targets` in the background. Failures are logged
    /// and feed the breaker, but are never surfaced to the original caller.
    fn spawn_replication(&self, key: &str, spool: Arc<Spool>, targets: Vec<Arc<Endpoint>>) {
        if targets.is_empty() {
            return;
        }
        let key = key.to_string();
        let retry_attempts = self.retry_attempts;
        let retry_backoff = self.retry_backoff;
        tokio::spawn(async move {
            for endpoint in targets {
                match Self::write_to_endpoint(&endpoint, &key, &spool, retry_attempts, retry_backoff)
                    .await
                {
                    Ok(()) => {
                        tracing::debug!(endpoint = %endpoint.id, key = %key, "async replication complete");
                    }
                    Err(e) => {
                        tracing::warn!(
                            endpoint = %endpoint.id,
                            key = %key,
                            error = %e,
                            "async replication failed"
                        );
                    }
                }
            }
        });
    }

    /// Write a blob according to the configured replication mode.
    ///
    /// - synchronous: every enabled endpoint must acknowledge; on failure,
    ///   copies already written are deleted best-effort and the error is
    ///   returned (the caller must not create a content row).
    /// - asynchronous: the primary must acknowledge; everything else
    ///   replicates in the background.
    /// - hybrid: the primary plus at least one backup must acknowledge;
    ///   mirrors replicate in the background. With no backups configured the
    ///   primary alone satisfies the quorum.
    pub async fn write_blob(&self, key: &str, spool: Arc<Spool>) -> StorageResult<WriteReceipt> {
        match self.replication {
            ReplicationMode::Synchronous => self.write_synchronous(key, &spool).await,
            ReplicationMode::Asynchronous => self.write_asynchronous(key, spool).await,
            ReplicationMode::Hybrid => self.write_hybrid(key, spool).await,
        }
    }

    async fn write_synchronous(&self, key: &str, spool: &Arc<Spool>) -> StorageResult<WriteReceipt> {
        let targets = self.read_order();
        if targets.is_empty() {
            return Err(StorageError::QuorumNotMet(
                "no enabled endpoints".to_string(),
            ));
        }

        let results = futures::future::join_all(targets.iter().map(|ep| {
            let ep = ep.clone();
            async move {
                let res = Self::write_to_endpoint(
                    &ep,
                    key,
                    spool,
                    self.retry_attempts,
                    self.retry_backoff,
                )
                .await;
                (ep, res)
            }
        }))
        .await;

        let mut acknowledged = Vec::new();
        let mut failure = None;
        for (ep, res) in results {
            match res {
                Ok(()) => acknowledged.push(ep),
                Err(e) => failure = Some((ep.id.clone(), e)),
            }
        }

        if let Some((failed_id, err)) = failure {
            // Roll back copies that did land so a failed synchronous write
            // leaves no stray replicas behind.
            for ep in &acknowledged {
                if let Err(e) = ep.adapter.delete(key).await
                    && !matches!(e, StorageError::NotFound(_))
                {
                    tracing::warn!(endpoint = %ep.id, key = %key, error = %e,
                        "failed to roll back replica after synchronous write failure");
                }
            }
            return Err(StorageError::QuorumNotMet(format!(
                "synchronous replication failed at endpoint {failed_id}: {err}"
            )));
        }

        Ok(WriteReceipt {
            acknowledged: acknowledged.into_iter().map(|ep| ep.id.clone()).collect(),
            pending: 0,
        })
    }

    async fn write_asynchronous(&self, key: &str, spool: Arc<Spool>) -> StorageResult<WriteReceipt> {
        let primary = self.primary()?;
        Self::write_to_endpoint(&primary, key, &spool, self.retry_attempts, self.retry_backoff)
            .await?;

        let rest: Vec<Arc<Endpoint>> = self
            .read_order()
            .into_iter()
            .filter(|ep| ep.id != primary.id)
            .collect();
        let pending = rest.len();
        self.spawn_replication(key, spool, rest);

        Ok(WriteReceipt {
            acknowledged: vec![primary.id.clone()],
            pending,
        })
    }

    async fn write_hybrid(&self, key: &str, spool: Arc<Spool>) -> StorageResult<WriteReceipt> {
        let primary = self.primary()?;
        Self::write_to_endpoint(&primary, key, &spool, self.retry_attempts, self.retry_backoff)
            .await?;

        let backups = self.enabled_by_role(EndpointRole::Backup);
        let mut acknowledged = vec![primary.id.clone()];
        let mut deferred: Vec<Arc<Endpoint>> = Vec::new();

        if !backups.is_empty() {
            let results = futures::future::join_all(backups.iter().map(|ep| {
                let ep = ep.clone();
                let spool = &spool;
                async move {
                    let res = Self::write_to_endpoint(
                        &ep,
                        key,
                        spool,
                        self.retry_attempts,
                        self.retry_backoff,
                    )
                    .await;
                    (ep, res)
                }
            }))
            .await;

            let mut any_backup_ok = false;
            for (ep, res) in results {
                match res {
                    Ok(()) => {
                        any_backup_ok = true;
                        acknowledged.push(ep.id.clone());
                    }
                    Err(e) => {
                        tracing::warn!(endpoint = %ep.id, key = %key, error = %e,
                            "backup write failed during hybrid replication");
                    }
                }
            }

            if !any_backup_ok {
                return Err(StorageError::QuorumNotMet(format!(
                    "hybrid replication for {key}: primary acknowledged but no backup did"
                )));
            }
        }

        for ep in self.enabled_by_role(EndpointRole::Mirror) {
            deferred.push(ep);
        }
        let pending = deferred.len();
        self.spawn_replication(key, spool, deferred);

        Ok(WriteReceipt {
            acknowledged,
            pending,
        })
    }

    /// Open a read stream, trying endpoints in priority order and falling
    /// back transparently on failure.
    pub async fn read_blob(&self, key: &str) -> StorageResult<ByteStream> {
        let mut last_err: Option<(String, StorageError)> = None;
        for endpoint in self.read_order() {
            if !endpoint.breaker.can_execute() {
                continue;
            }
            match endpoint.adapter.get_stream(key).await {
                Ok(stream) => {
                    endpoint.breaker.record_success();
                    return Ok(stream);
                }
                Err(e) => {
                    // A missing blob doesn't indict the endpoint; real
                    // backend failures do.
                    if !matches!(e, StorageError::NotFound(_)) {
                        endpoint.breaker.record_failure();
                    }
                    if !e.is_failover_eligible() {
                        return Err(e);
                    }
                    tracing::debug!(endpoint = %endpoint.id, key = %key, error = %e,
                        "read failed, trying next endpoint");
                    last_err = Some((endpoint.id.clone(), e));
                }
            }
        }
        Err(Self::all_failed(key, last_err))
    }

    /// Ranged read with the same failover discipline as `read_blob`.
    pub async fn read_blob_range(&self, key: &str, start: u64, end: u64) -> StorageResult<Bytes> {
        let mut last_err: Option<(String, StorageError)> = None;
        for endpoint in self.read_order() {
            if !endpoint.breaker.can_execute() {
                continue;
            }
            match endpoint.adapter.get_range(key, start, end).await {
                Ok(bytes) => {
                    endpoint.breaker.record_success();
                    return Ok(bytes);
                }
                Err(e) => {
                    if !matches!(e, StorageError::NotFound(_)) {
                        endpoint.breaker.record_failure();
                    }
                    if !e.is_failover_eligible() {
                        return Err(e);
                    }
                    last_err = Some((endpoint.id.clone(), e));
                }
            }
        }
        Err(Self::all_failed(key, last_err))
    }

    fn all_failed(key: &str, last_err: Option<(String, StorageError)>) -> StorageError {
        let detail = match last_err {
            Some((id, e)) => format!("last error from {id}: {e}"),
            None => "no endpoint accepted the request".to_string(),
        };
        StorageError::AllEndpointsFailed {
            key: key.to_string(),
            detail,
        }
    }

    /// Delete a blob from every enabled endpoint. Missing copies are fine;
    /// any other failure is returned after all endpoints were attempted so
    /// the next cleanup cycle can retry the stragglers.
    pub async fn delete_blob(&self, key: &str) -> StorageResult<()> {
        let mut first_err = None;
        for endpoint in self.read_order() {
            match endpoint.adapter.delete(key).await {
                Ok(()) | Err(StorageError::NotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint.id, key = %key, error = %e,
                        "blob delete failed");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }
        match first_err {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// Whether the blob exists on any enabled endpoint.
    pub async fn blob_exists(&self, key: &str) -> StorageResult<bool> {
        let mut last_err = None;
        for endpoint in self.read_order() {
            match endpoint.adapter.exists(key).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(e) => last_err = Some(e),
            }
        }
        match last_err {
            Some(e) => Err(e),
            None => Ok(false),
        }
    }

    /// Re-designate which endpoint is primary. The current primary is
    /// demoted to backup. Invoked by the health sweep, not inferred from
    /// individual read failures, to avoid flapping.
    pub fn promote(&self, endpoint_id: &str) -> StorageResult<()> {
        let target = self
            .endpoints
            .iter()
            .find(|ep| ep.id == endpoint_id)
            .ok_or_else(|| StorageError::UnknownEndpoint(endpoint_id.to_string()))?;
        if !target.enabled {
            return Err(StorageError::UnknownEndpoint(format!(
                "{endpoint_id} is disabled"
            )));
        }
        if target.role() == EndpointRole::Primary {
            return Ok(());
        }

        for ep in &self.endpoints {
            if ep.enabled && ep.role() == EndpointRole::Primary {
                ep.set_role(EndpointRole::Backup);
                tracing::info!(endpoint = %ep.id, "demoted to backup");
            }
        }
        target.set_role(EndpointRole::Primary);
        target.breaker.reset();
        target.consecutive_probe_failures.store(0, Ordering::Relaxed);
        tracing::info!(endpoint = %target.id, "promoted to primary");
        Ok(())
    }

    /// Probe every enabled endpoint and, when the primary has failed
    /// `failure_threshold` consecutive probes, promote the healthiest
    /// backup in its place.
    pub async fn health_sweep(
        &self,
        probe_timeout: Duration,
        failure_threshold: u32,
    ) -> SweepReport {
        let mut report = SweepReport::default();

        for endpoint in self.read_order() {
            let started = Instant::now();
            let result =
                tokio::time::timeout(probe_timeout, endpoint.adapter.health_check()).await;
            let latency = started.elapsed();

            let error = match result {
                Ok(Ok(())) => None,
                Ok(Err(e)) => Some(e.to_string()),
                Err(_) => Some(StorageError::Timeout(probe_timeout).to_string()),
            };
            let healthy = error.is_none();

            if healthy {
                endpoint.consecutive_probe_failures.store(0, Ordering::Relaxed);
            } else {
                endpoint
                    .consecutive_probe_failures
                    .fetch_add(1, Ordering::Relaxed);
            }

            report.probes.push(HealthProbe {
                endpoint_id: endpoint.id.clone(),
                healthy,
                latency,
                error,
            });
        }

        // Promotion decision: primary persistently failing and a healthy
        // backup available this sweep.
        if let Ok(primary) = self.primary() {
            let failures = primary.consecutive_probe_failures.load(Ordering::Relaxed);
            if failures >= failure_threshold {
                let candidate = self
                    .enabled_by_role(EndpointRole::Backup)
                    .into_iter()
                    .find(|ep| {
                        report
                            .probes
                            .iter()
                            .any(|p| p.endpoint_id == ep.id && p.healthy)
                    });
                if let Some(candidate) = candidate {
                    let old_id = primary.id.clone();
                    let new_id = candidate.id.clone();
                    tracing::warn!(
                        old_primary = %old_id,
                        new_primary = %new_id,
                        consecutive_failures = failures,
                        "primary unhealthy, promoting backup"
                    );
                    if self.promote(&new_id).is_ok() {
                        report.promotion = Some((old_id, new_id));
                    }
                } else {
                    tracing::error!(
                        primary = %primary.id,
                        consecutive_failures = failures,
                        "primary unhealthy but no healthy backup to promote"
                    );
                }
            }
        }

        report
    }

    /// Current endpoint view for admin/health output.
    pub fn endpoint_statuses(&self) -> Vec<EndpointStatus> {
        self.endpoints
            .iter()
            .map(|ep| EndpointStatus {
                id: ep.id.clone(),
                backend: ep.adapter.backend_name(),
                role: ep.role().as_str(),
                priority: ep.priority,
                enabled: ep.enabled,
                circuit: ep.breaker.state().as_str(),
                consecutive_probe_failures: ep.consecutive_probe_failures.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Id of the current primary, if one is enabled.
    pub fn primary_id(&self) -> Option<String> {
        self.primary().ok().map(|ep| ep.id.clone())
    }

    #[doc(hidden)]
    pub fn breaker_state_for_testing(&self, endpoint_id: &str) -> Option<CircuitState> {
        self.endpoints
            .iter()
            .find(|ep| ep.id == endpoint_id)
            .map(|ep| ep.breaker.state())
    }
}
