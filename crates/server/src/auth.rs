//! Request identity extraction.
//!
//! Authentication itself is an upstream concern: the gateway in front of
//! this service validates credentials and forwards the caller's identity in
//! `X-Depot-User` / `X-Depot-Role` headers. This middleware lifts those
//! headers into an [`AuthContext`] extension; handlers decide whether a
//! user (or the admin role) is required.

use axum::body::Body;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::{ApiError, ApiResult};

/// Role forwarded by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Admin,
}

/// Caller identity attached to every request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// Authenticated user id, if any.
    pub user_id: Option<String>,
    pub role: Role,
}

impl AuthContext {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            role: Role::User,
        }
    }

    /// The user id, or an Unauthorized error for routes that require one.
    pub fn require_user(&self) -> ApiResult<&str> {
        self.user_id
            .as_deref()
            .ok_or_else(|| ApiError::Unauthorized("authentication required".to_string()))
    }

    /// Error unless the caller has the admin role.
    pub fn require_admin(&self) -> ApiResult<()> {
        match self.role {
            Role::Admin => Ok(()),
            Role::User => Err(ApiError::Forbidden(
                "admin role required".to_string(),
            )),
        }
    }
}

fn header_str<'a>(req: &'a Request<Body>, name: &str) -> Option<&'a str> {
    req.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

/// Populate the [`AuthContext`] extension from gateway headers.
pub async fn auth_middleware(mut req: Request<Body>, next: Next) -> Response {
    let user_id = header_str(&req, "x-depot-user").map(str::to_string);
    let role = match header_str(&req, "x-depot-role") {
        Some(role) if role.eq_ignore_ascii_case("admin") => Role::Admin,
        _ => Role::User,
    };

    req.extensions_mut().insert(AuthContext { user_id, role });
    next.run(req).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_user() {
        let auth = AuthContext {
            user_id: Some("alice".to_string()),
            role: Role::User,
        };
        assert_eq!(auth.require_user().unwrap(), "alice");
        assert!(AuthContext::anonymous().require_user().is_err());
    }

    #[test]
    fn test_require_admin() {
        let admin = AuthContext {
            user_id: Some("root".to_string()),
            role: Role::Admin,
        };
        assert!(admin.require_admin().is_ok());

        let user = AuthContext {
            user_id: Some("alice".to_string()),
            role: Role::User,
        };
        assert!(matches!(
            user.require_admin(),
            Err(ApiError::Forbidden(_))
        ));
    }
}
