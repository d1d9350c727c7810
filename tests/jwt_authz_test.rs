//! JWT Authorizer Integration Tests
//!
//! Token validation for the tus authorization hook.

mod tests {
    use std::collections::HashMap;
    use tus_uploadr::authz::jwt::{Claims, JwtAuthorizer};
    use tus_uploadr::authz::{AuthzError, AuthzRequest, Authorizer};
    use tus_uploadr::config::JwtConfig;

    // ========================================================================
    // Helpers
    // ========================================================================

    fn create_hs256_token(secret: &str, claims: &Claims) -> String {
        use jsonwebtoken::{encode, EncodingKey, Header};
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn request_with_token(token: &str) -> AuthzRequest {
        let mut headers = HashMap::new();
        headers.insert("authorization".to_string(), format!("Bearer {}", token));
        AuthzRequest {
            operation: "append".to_string(),
            upload_id: Some("0123456789abcdef0123456789abcdef".to_string()),
            headers,
            query: None,
        }
    }

    fn claims(offset_hours: i64) -> Claims {
        Claims {
            sub: "user123".to_string(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(offset_hours)).timestamp() as usize,
            iat: Some(chrono::Utc::now().timestamp() as usize),
            iss: Some("test-issuer".to_string()),
            aud: Some("test-audience".to_string()),
        }
    }

    // ========================================================================
    // HS256
    // ========================================================================

    #[tokio::test]
    async fn test_valid_token_accepted() {
        let secret = "super-secret-key-for-testing";
        let authz = JwtAuthorizer::new_hs256(secret);
        let token = create_hs256_token(secret, &claims(1));

        assert!(authz.authorize(&request_with_token(&token)).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_secret_unauthorized() {
        let authz = JwtAuthorizer::new_hs256("right-secret");
        let token = create_hs256_token("wrong-secret", &claims(1));

        let result = authz.authorize(&request_with_token(&token)).await;
        assert!(matches!(result, Err(AuthzError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_expired_token_unauthorized() {
        let secret = "secret";
        let authz = JwtAuthorizer::new_hs256(secret);
        let token = create_hs256_token(secret, &claims(-2));

        let result = authz.authorize(&request_with_token(&token)).await;
        assert!(matches!(result, Err(AuthzError::Unauthorized(_))));
    }

    #[tokio::test]
    async fn test_token_in_query_parameter() {
        let secret = "secret";
        let authz = JwtAuthorizer::new_hs256(secret);
        let token = create_hs256_token(secret, &claims(1));

        let request = AuthzRequest {
            operation: "download".to_string(),
            upload_id: Some("0123456789abcdef0123456789abcdef".to_string()),
            headers: HashMap::new(),
            query: Some(format!("token={}", token)),
        };
        assert!(authz.authorize(&request).await.is_ok());
    }

    // ========================================================================
    // Issuer / audience
    // ========================================================================

    #[tokio::test]
    async fn test_wrong_issuer_forbidden() {
        let secret = "secret";
        let authz = JwtAuthorizer::new_hs256(secret).with_issuer("someone-else");
        let token = create_hs256_token(secret, &claims(1));

        let result = authz.authorize(&request_with_token(&token)).await;
        assert!(matches!(result, Err(AuthzError::Forbidden(_))));
    }

    #[tokio::test]
    async fn test_matching_audience_accepted() {
        let secret = "secret";
        let authz = JwtAuthorizer::new_hs256(secret)
            .with_issuer("test-issuer")
            .with_audience("test-audience");
        let token = create_hs256_token(secret, &claims(1));

        assert!(authz.authorize(&request_with_token(&token)).await.is_ok());
    }

    // ========================================================================
    // Construction
    // ========================================================================

    #[test]
    fn test_invalid_rsa_key_rejected() {
        assert!(matches!(
            JwtAuthorizer::new_rs256("not a pem"),
            Err(AuthzError::Config(_))
        ));
        assert!(matches!(
            JwtAuthorizer::new_es256("not a pem"),
            Err(AuthzError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_from_config_applies_audience() {
        let secret = "secret";
        let authz = JwtAuthorizer::from_config(&JwtConfig {
            secret: secret.to_string(),
            algorithm: "hs256".to_string(),
            issuer: None,
            audience: Some("other-audience".to_string()),
        })
        .unwrap();
        let token = create_hs256_token(secret, &claims(1));

        let result = authz.authorize(&request_with_token(&token)).await;
        assert!(matches!(result, Err(AuthzError::Forbidden(_))));
    }
}
