//! Authorization module
//!
//! The HTTP adapter asks an [`Authorizer`] before running any operation.
//! Returning `Ok(())` allows the request; an error rejects it and decides
//! between 401 and 403.

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

pub mod jwt;

pub use jwt::JwtAuthorizer;

/// Authorization errors
#[derive(Error, Debug)]
pub enum AuthzError {
    /// No usable credentials (401)
    #[error("Missing or invalid credentials: {0}")]
    Unauthorized(String),

    /// Credentials are valid but not sufficient (403)
    #[error("Access denied: {0}")]
    Forbidden(String),

    #[error("Authorizer misconfigured: {0}")]
    Config(String),
}

/// Authorization request
#[derive(Debug, Clone)]
pub struct AuthzRequest {
    /// Operation name, e.g. `create` or `append`
    pub operation: String,
    /// Target upload, absent for collection-level operations
    pub upload_id: Option<String>,
    /// Request headers with lower-cased names
    pub headers: HashMap<String, String>,
    /// Raw query string
    pub query: Option<String>,
}

/// Authorizer trait
#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Allow the request, or say why not
    async fn authorize(&self, request: &AuthzRequest) -> Result<(), AuthzError>;
}

/// Authorizer that allows everything
pub struct AllowAllAuthorizer;

#[async_trait]
impl Authorizer for AllowAllAuthorizer {
    async fn authorize(&self, _request: &AuthzRequest) -> Result<(), AuthzError> {
        Ok(())
    }
}

/// Authorizer that denies everything
pub struct DenyAllAuthorizer;

#[async_trait]
impl Authorizer for DenyAllAuthorizer {
    async fn authorize(&self, request: &AuthzRequest) -> Result<(), AuthzError> {
        Err(AuthzError::Forbidden(format!(
            "{} is not permitted",
            request.operation
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_request() -> AuthzRequest {
        AuthzRequest {
            operation: "append".into(),
            upload_id: Some("0123456789abcdef0123456789abcdef".into()),
            headers: HashMap::new(),
            query: None,
        }
    }

    #[tokio::test]
    async fn test_allow_all() {
        let authz = AllowAllAuthorizer;
        assert!(authz.authorize(&test_request()).await.is_ok());
    }

    #[tokio::test]
    async fn test_deny_all() {
        let authz = DenyAllAuthorizer;
        let result = authz.authorize(&test_request()).await;
        assert!(matches!(result, Err(AuthzError::Forbidden(_))));
    }
}
