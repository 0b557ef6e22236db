//! Token-bucket admission control.
//!
//! Three bucket layers guard every entry point: per-IP, per-user (when
//! authenticated), and one global bucket. An admit debits all applicable
//! buckets atomically: the bucket locks are held together in a fixed order
//! (global, IP, user) while availability is checked, and tokens are only
//! taken once every bucket can cover the cost, so a denied request never
//! leaves a partial debit behind.
//!
//! Blacklisted IPs are denied before any bucket is consulted; whitelisted
//! IPs are admitted unconditionally. Bucket maps are capped and idle
//! entries are evicted by a periodic cleanup task to bound memory under
//! address-spraying traffic.

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use depot_core::config::RateLimitConfig;
use serde::Serialize;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

/// A single token bucket. Refill happens lazily on access.
#[derive(Debug)]
struct TokenBucket {
    /// Tokens per second.
    rate: f64,
    /// Capacity ceiling.
    burst: f64,
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32, burst: u32) -> Self {
        let now = Instant::now();
        Self {
            rate: per_minute as f64 / 60.0,
            burst: burst as f64,
            tokens: burst as f64,
            last_refill: now,
            last_access: now,
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.burst);
        self.last_refill = now;
        self.last_access = now;
    }

    fn has(&self, cost: f64) -> bool {
        self.tokens >= cost
    }

    fn debit(&mut self, cost: f64) {
        self.tokens -= cost;
    }

    /// Seconds until `cost` tokens will be available.
    fn wait_secs(&self, cost: f64) -> u64 {
        let deficit = (cost - self.tokens).max(0.0);
        (deficit / self.rate).ceil() as u64
    }
}

/// Who is asking for admission.
#[derive(Debug, Clone, Copy)]
pub struct Identity<'a> {
    pub ip: &'a str,
    pub user_id: Option<&'a str>,
}

/// Why an admit was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DenyReason {
    Blacklisted,
    RateLimited,
    AtCapacity,
}

/// Admission denial.
#[derive(Debug)]
pub struct AdmitError {
    pub reason: DenyReason,
    pub retry_after_secs: u64,
}

/// Read-only bucket occupancy snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub ip_buckets: usize,
    pub user_buckets: usize,
    pub blacklisted_ips: usize,
    pub whitelisted_ips: usize,
    pub global_tokens_available: u64,
}

struct Inner {
    ip_rate: u32,
    ip_burst: u32,
    user_rate: u32,
    user_burst: u32,
    global: Mutex<TokenBucket>,
    ip_buckets: DashMap<String, Mutex<TokenBucket>>,
    user_buckets: DashMap<String, Mutex<TokenBucket>>,
    whitelist: RwLock<HashSet<String>>,
    blacklist: RwLock<HashSet<String>>,
    max_entries: usize,
    entry_ttl: Duration,
}

/// Shared rate limiter handle. Constructed once at startup and passed into
/// every request path; never a process-global.
#[derive(Clone)]
pub struct RateLimiter {
    inner: Option<Arc<Inner>>,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        if !config.enabled {
            return Self { inner: None };
        }

        Self {
            inner: Some(Arc::new(Inner {
                ip_rate: config.ip_requests_per_minute,
                ip_burst: config.ip_burst,
                user_rate: config.user_requests_per_minute,
                user_burst: config.user_burst,
                global: Mutex::new(TokenBucket::new(
                    config.global_requests_per_minute,
                    config.global_burst,
                )),
                ip_buckets: DashMap::new(),
                user_buckets: DashMap::new(),
                whitelist: RwLock::new(config.whitelist.iter().cloned().collect()),
                blacklist: RwLock::new(config.blacklist.iter().cloned().collect()),
                max_entries: config.max_entries as usize,
                entry_ttl: config.entry_ttl(),
            })),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Admit or deny a request of the given cost.
    pub fn admit(&self, identity: Identity<'_>, cost: u32) -> Result<(), AdmitError> {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return Ok(()),
        };

        // Static overrides bypass the buckets entirely.
        if inner
            .blacklist
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(identity.ip)
        {
            return Err(AdmitError {
                reason: DenyReason::Blacklisted,
                retry_after_secs: 0,
            });
        }
        if inner
            .whitelist
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .contains(identity.ip)
        {
            return Ok(());
        }

        let cost = cost as f64;
        let now = Instant::now();

        // Bucket entries are created before any lock is taken so the entry
        // guards below are plain lookups. New identities are rejected once
        // the maps hit their cap.
        if !inner.ip_buckets.contains_key(identity.ip) {
            if inner.ip_buckets.len() >= inner.max_entries {
                return Err(AdmitError {
                    reason: DenyReason::AtCapacity,
                    retry_after_secs: 60,
                });
            }
            inner
                .ip_buckets
                .entry(identity.ip.to_string())
                .or_insert_with(|| Mutex::new(TokenBucket::new(inner.ip_rate, inner.ip_burst)));
        }
        if let Some(user) = identity.user_id
            && !inner.user_buckets.contains_key(user)
        {
            if inner.user_buckets.len() >= inner.max_entries {
                return Err(AdmitError {
                    reason: DenyReason::AtCapacity,
                    retry_after_secs: 60,
                });
            }
            inner
                .user_buckets
                .entry(user.to_string())
                .or_insert_with(|| Mutex::new(TokenBucket::new(inner.user_rate, inner.user_burst)));
        }

        // Fixed acquisition order: global, then IP, then user. All guards
        // are held across the check and the debit so the admit is atomic:
        // either every bucket pays or none does.
        let mut global = inner.global.lock().unwrap_or_else(|p| p.into_inner());
        global.refill(now);

        let ip_entry = inner.ip_buckets.get(identity.ip);
        let mut ip_guard: Option<MutexGuard<'_, TokenBucket>> = ip_entry
            .as_ref()
            .map(|e| e.value().lock().unwrap_or_else(|p| p.into_inner()));
        if let Some(g) = ip_guard.as_mut() {
            g.refill(now);
        }

        let user_entry = identity.user_id.and_then(|u| inner.user_buckets.get(u));
        let mut user_guard: Option<MutexGuard<'_, TokenBucket>> = user_entry
            .as_ref()
            .map(|e| e.value().lock().unwrap_or_else(|p| p.into_inner()));
        if let Some(g) = user_guard.as_mut() {
            g.refill(now);
        }

        let mut wait = 0u64;
        if !global.has(cost) {
            wait = wait.max(global.wait_secs(cost));
        }
        if let Some(g) = ip_guard.as_ref()
            && !g.has(cost)
        {
            wait = wait.max(g.wait_secs(cost));
        }
        if let Some(g) = user_guard.as_ref()
            && !g.has(cost)
        {
            wait = wait.max(g.wait_secs(cost));
        }

        if wait > 0 {
            return Err(AdmitError {
                reason: DenyReason::RateLimited,
                retry_after_secs: wait.max(1),
            });
        }

        global.debit(cost);
        if let Some(g) = ip_guard.as_mut() {
            g.debit(cost);
        }
        if let Some(g) = user_guard.as_mut() {
            g.debit(cost);
        }
        Ok(())
    }

    /// Add an IP to the blacklist. Returns false if it was already present.
    pub fn add_to_blacklist(&self, ip: &str) -> bool {
        match &self.inner {
            Some(inner) => inner
                .blacklist
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .insert(ip.to_string()),
            None => false,
        }
    }

    /// Remove an IP from the blacklist. Returns false if it wasn't there.
    pub fn remove_from_blacklist(&self, ip: &str) -> bool {
        match &self.inner {
            Some(inner) => inner
                .blacklist
                .write()
                .unwrap_or_else(|p| p.into_inner())
                .remove(ip),
            None => false,
        }
    }

    pub fn is_blacklisted(&self, ip: &str) -> bool {
        match &self.inner {
            Some(inner) => inner
                .blacklist
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .contains(ip),
            None => false,
        }
    }

    /// Evict buckets idle longer than the configured TTL. Returns the
    /// number of entries removed.
    pub fn cleanup(&self) -> usize {
        let inner = match &self.inner {
            Some(inner) => inner,
            None => return 0,
        };
        let ttl = inner.entry_ttl;
        let before = inner.ip_buckets.len() + inner.user_buckets.len();
        inner.ip_buckets.retain(|_, bucket| {
            bucket.lock().unwrap_or_else(|p| p.into_inner()).last_access.elapsed() <= ttl
        });
        inner.user_buckets.retain(|_, bucket| {
            bucket.lock().unwrap_or_else(|p| p.into_inner()).last_access.elapsed() <= ttl
        });
        before - (inner.ip_buckets.len() + inner.user_buckets.len())
    }

    /// Current occupancy, read-only.
    pub fn stats(&self) -> RateLimiterStats {
        match &self.inner {
            Some(inner) => {
                let mut global = inner.global.lock().unwrap_or_else(|p| p.into_inner());
                global.refill(Instant::now());
                RateLimiterStats {
                    enabled: true,
                    ip_buckets: inner.ip_buckets.len(),
                    user_buckets: inner.user_buckets.len(),
                    blacklisted_ips: inner
                        .blacklist
                        .read()
                        .unwrap_or_else(|p| p.into_inner())
                        .len(),
                    whitelisted_ips: inner
                        .whitelist
                        .read()
                        .unwrap_or_else(|p| p.into_inner())
                        .len(),
                    global_tokens_available: global.tokens as u64,
                }
            }
            None => RateLimiterStats {
                enabled: false,
                ip_buckets: 0,
                user_buckets: 0,
                blacklisted_ips: 0,
                whitelisted_ips: 0,
                global_tokens_available: 0,
            },
        }
    }
}

impl IntoResponse for AdmitError {
    fn into_response(self) -> Response {
        let (code, message) = match self.reason {
            DenyReason::Blacklisted => (
                "blacklisted",
                "Requests from this address are not accepted.".to_string(),
            ),
            DenyReason::RateLimited => (
                "rate_limited",
                format!(
                    "Rate limit exceeded. Retry after {} seconds.",
                    self.retry_after_secs
                ),
            ),
            DenyReason::AtCapacity => (
                "rate_limiter_at_capacity",
                "Server is tracking too many clients. Please retry later.".to_string(),
            ),
        };

        let body = serde_json::json!({
            "error": code,
            "details": message,
        });

        (
            StatusCode::TOO_MANY_REQUESTS,
            [("Retry-After", self.retry_after_secs.max(1).to_string())],
            axum::Json(body),
        )
            .into_response()
    }
}

/// Per-request cost configuration for the middleware.
#[derive(Clone)]
pub struct RateLimitLayer {
    pub limiter: RateLimiter,
    pub upload_cost: u32,
    pub download_cost: u32,
}

fn extract_ip(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Admission middleware. Runs after auth (so the user bucket applies) and
/// before any handler logic; uploads are weighted heavier than reads.
pub async fn rate_limit_middleware(
    State(layer): State<RateLimitLayer>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if !layer.limiter.is_enabled() {
        return next.run(req).await;
    }

    let ip = extract_ip(&req);
    let user = req
        .extensions()
        .get::<crate::auth::AuthContext>()
        .and_then(|auth| auth.user_id.clone());

    let cost = if req.method() == Method::POST && req.uri().path().contains("/upload") {
        layer.upload_cost
    } else {
        layer.download_cost
    };

    let identity = Identity {
        ip: &ip,
        user_id: user.as_deref(),
    };

    match layer.limiter.admit(identity, cost) {
        Ok(()) => next.run(req).await,
        Err(deny) => {
            crate::metrics::REQUESTS_RATE_LIMITED.inc();
            tracing::debug!(ip = %ip, user = ?user, reason = ?deny.reason, "request denied");
            deny.into_response()
        }
    }
}

/// Spawn the periodic bucket eviction task; exits when `cancel` fires.
pub fn spawn_cleanup_task(
    limiter: RateLimiter,
    interval: Duration,
    cancel: tokio_util::sync::CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let evicted = limiter.cleanup();
                    if evicted > 0 {
                        tracing::debug!(evicted, "rate limiter evicted idle buckets");
                    }
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("rate limiter cleanup task stopped");
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(ip_burst: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            ip_requests_per_minute: 60,
            ip_burst,
            user_requests_per_minute: 120,
            user_burst: 100,
            global_requests_per_minute: 6000,
            global_burst: 1000,
            upload_cost: 5,
            download_cost: 1,
            ..Default::default()
        }
    }

    fn ip(addr: &str) -> Identity<'_> {
        Identity {
            ip: addr,
            user_id: None,
        }
    }

    #[test]
    fn test_budget_exhaustion_denies_at_budget_plus_one() {
        let limiter = RateLimiter::new(&config(10));

        for i in 0..10 {
            assert!(
                limiter.admit(ip("1.2.3.4"), 1).is_ok(),
                "request {i} within budget denied"
            );
        }
        let deny = limiter.admit(ip("1.2.3.4"), 1).unwrap_err();
        assert_eq!(deny.reason, DenyReason::RateLimited);
        assert!(deny.retry_after_secs >= 1);

        // A different IP has its own budget.
        assert!(limiter.admit(ip("5.6.7.8"), 1).is_ok());
    }

    #[test]
    fn test_upload_cost_drains_faster() {
        let limiter = RateLimiter::new(&config(10));
        assert!(limiter.admit(ip("1.2.3.4"), 5).is_ok());
        assert!(limiter.admit(ip("1.2.3.4"), 5).is_ok());
        assert!(limiter.admit(ip("1.2.3.4"), 5).is_err());
    }

    #[test]
    fn test_blacklist_denies_first_request() {
        let limiter = RateLimiter::new(&config(10));
        limiter.add_to_blacklist("9.9.9.9");

        let deny = limiter.admit(ip("9.9.9.9"), 1).unwrap_err();
        assert_eq!(deny.reason, DenyReason::Blacklisted);

        limiter.remove_from_blacklist("9.9.9.9");
        assert!(limiter.admit(ip("9.9.9.9"), 1).is_ok());
    }

    #[test]
    fn test_whitelist_never_denied() {
        let mut cfg = config(2);
        cfg.whitelist.push("8.8.8.8".to_string());
        let limiter = RateLimiter::new(&cfg);

        for _ in 0..50 {
            assert!(limiter.admit(ip("8.8.8.8"), 5).is_ok());
        }
    }

    #[test]
    fn test_denied_admit_leaves_no_partial_debit() {
        // IP bucket too small for the cost, global bucket plentiful.
        let limiter = RateLimiter::new(&config(3));

        let global_before = limiter.stats().global_tokens_available;
        assert!(limiter.admit(ip("1.2.3.4"), 5).is_err());
        let global_after = limiter.stats().global_tokens_available;
        assert_eq!(
            global_before, global_after,
            "global bucket was debited on a denied admit"
        );
    }

    #[test]
    fn test_user_bucket_applies_when_authenticated() {
        let mut cfg = config(1000);
        cfg.user_burst = 2;
        let limiter = RateLimiter::new(&cfg);

        let identity = Identity {
            ip: "1.2.3.4",
            user_id: Some("alice"),
        };
        assert!(limiter.admit(identity, 1).is_ok());
        assert!(limiter.admit(identity, 1).is_ok());
        let deny = limiter.admit(identity, 1).unwrap_err();
        assert_eq!(deny.reason, DenyReason::RateLimited);

        // Same IP, different user: the IP bucket still has room.
        let other = Identity {
            ip: "1.2.3.4",
            user_id: Some("bob"),
        };
        assert!(limiter.admit(other, 1).is_ok());
    }

    #[test]
    fn test_capacity_cap_rejects_new_identities() {
        let mut cfg = config(10);
        cfg.max_entries = 2;
        let limiter = RateLimiter::new(&cfg);

        assert!(limiter.admit(ip("1.1.1.1"), 1).is_ok());
        assert!(limiter.admit(ip("2.2.2.2"), 1).is_ok());
        let deny = limiter.admit(ip("3.3.3.3"), 1).unwrap_err();
        assert_eq!(deny.reason, DenyReason::AtCapacity);

        // Known identities keep working.
        assert!(limiter.admit(ip("1.1.1.1"), 1).is_ok());
    }

    #[test]
    fn test_cleanup_evicts_idle_buckets() {
        let mut cfg = config(10);
        cfg.entry_ttl_secs = 0;
        let limiter = RateLimiter::new(&cfg);

        limiter.admit(ip("1.1.1.1"), 1).unwrap();
        limiter.admit(ip("2.2.2.2"), 1).unwrap();
        assert_eq!(limiter.stats().ip_buckets, 2);

        std::thread::sleep(Duration::from_millis(10));
        let evicted = limiter.cleanup();
        assert_eq!(evicted, 2);
        assert_eq!(limiter.stats().ip_buckets, 0);
    }

    #[test]
    fn test_disabled_limiter_admits_everything() {
        let limiter = RateLimiter::new(&RateLimitConfig {
            enabled: false,
            ..Default::default()
        });
        assert!(!limiter.is_enabled());
        for _ in 0..10_000 {
            assert!(limiter.admit(ip("1.1.1.1"), 100).is_ok());
        }
        assert!(!limiter.stats().enabled);
    }
}
