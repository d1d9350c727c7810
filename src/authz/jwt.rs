//! JWT authorizer
//!
//! Accepts a request when it carries a valid token, either as
//! `Authorization: Bearer <token>` or as a `token` query parameter.
//! Supports HS256, RS256 and ES256.

use super::{AuthzError, AuthzRequest, Authorizer};
use crate::config::JwtConfig;
use async_trait::async_trait;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

/// JWT Claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
    #[serde(default)]
    pub iat: Option<usize>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
}

/// JWT Authorizer
///
/// # Example
///
/// ```
/// use tus_uploadr::authz::jwt::JwtAuthorizer;
///
/// let authz = JwtAuthorizer::new_hs256("my-secret")
///     .with_issuer("https://auth.example.com")
///     .with_audience("uploads");
/// ```
pub struct JwtAuthorizer {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtAuthorizer {
    /// HMAC secret (HS256)
    pub fn new_hs256(secret: &str) -> Self {
        Self::with_key(
            DecodingKey::from_secret(secret.as_bytes()),
            Algorithm::HS256,
        )
    }

    /// RSA public key in PEM form (RS256)
    pub fn new_rs256(public_key_pem: &str) -> Result<Self, AuthzError> {
        let key = DecodingKey::from_rsa_pem(public_key_pem.as_bytes())
            .map_err(|e| AuthzError::Config(e.to_string()))?;
        Ok(Self::with_key(key, Algorithm::RS256))
    }

    /// EC P-256 public key in PEM form (ES256)
    pub fn new_es256(public_key_pem: &str) -> Result<Self, AuthzError> {
        let key = DecodingKey::from_ec_pem(public_key_pem.as_bytes())
            .map_err(|e| AuthzError::Config(e.to_string()))?;
        Ok(Self::with_key(key, Algorithm::ES256))
    }

    /// Build from the `auth.jwt` configuration section
    pub fn from_config(config: &JwtConfig) -> Result<Self, AuthzError> {
        let mut authz = match config.algorithm.to_uppercase().as_str() {
            "HS256" => Self::new_hs256(&config.secret),
            "RS256" => Self::new_rs256(&config.secret)?,
            "ES256" => Self::new_es256(&config.secret)?,
            other => {
                return Err(AuthzError::Config(format!(
                    "Unsupported JWT algorithm: {}",
                    other
                )))
            }
        };
        if let Some(issuer) = &config.issuer {
            authz = authz.with_issuer(issuer);
        }
        if let Some(audience) = &config.audience {
            authz = authz.with_audience(audience);
        }
        Ok(authz)
    }

    fn with_key(decoding_key: DecodingKey, algorithm: Algorithm) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.validate_exp = true;
        validation.validate_aud = false; // Only validate aud when explicitly set

        Self {
            decoding_key,
            validation,
        }
    }

    /// Require this issuer (`iss` claim)
    #[must_use]
    pub fn with_issuer(mut self, issuer: &str) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    /// Require this audience (`aud` claim)
    #[must_use]
    pub fn with_audience(mut self, audience: &str) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    fn extract_token(request: &AuthzRequest) -> Option<&str> {
        if let Some(auth) = request.headers.get("authorization") {
            if let Some(token) = auth.strip_prefix("Bearer ") {
                return Some(token.trim());
            }
        }

        request
            .query
            .as_deref()?
            .split('&')
            .find_map(|pair| pair.strip_prefix("token="))
    }
}

#[async_trait]
impl Authorizer for JwtAuthorizer {
    #[tracing::instrument(
        name = "authz.jwt",
        skip(self, request),
        fields(
            authz.operation = %request.operation,
            authz.token_present = Self::extract_token(request).is_some()
        ),
        err
    )]
    async fn authorize(&self, request: &AuthzRequest) -> Result<(), AuthzError> {
        let token = Self::extract_token(request)
            .ok_or_else(|| AuthzError::Unauthorized("missing token".into()))?;

        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    AuthzError::Unauthorized("token expired".into())
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    AuthzError::Unauthorized("invalid signature".into())
                }
                jsonwebtoken::errors::ErrorKind::InvalidIssuer
                | jsonwebtoken::errors::ErrorKind::InvalidAudience => {
                    AuthzError::Forbidden(e.to_string())
                }
                _ => AuthzError::Unauthorized(e.to_string()),
            },
        )?;

        tracing::debug!(
            subject = %token_data.claims.sub,
            operation = %request.operation,
            "JWT authorization successful"
        );
        Ok(())
    }
}
