//! HTTP server for the depot attachment store.
//!
//! This crate provides:
//! - The upload/download deduplication engine
//! - Token-bucket admission control
//! - Content scanning and input validation
//! - The axum route surface and admin endpoints
//! - Background orphan cleanup and endpoint health sweeps

pub mod auth;
pub mod dedup;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod ratelimit;
pub mod routes;
pub mod scan;
pub mod state;
pub mod tasks;
pub mod validate;

pub use error::{ApiError, ApiResult};
pub use ratelimit::RateLimiter;
pub use routes::create_router;
pub use state::AppState;
