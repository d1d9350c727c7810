//! HTTP Server Integration Tests
//!
//! Drives a server bound to port 0 with reqwest and checks status codes and
//! tus headers for every operation.

use reqwest::{Client, Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tus_uploadr::authz::{AllowAllAuthorizer, Authorizer, DenyAllAuthorizer, JwtAuthorizer};
use tus_uploadr::config::{Config, ExpiryPolicy, StorageBackend};
use tus_uploadr::notify::NoopNotifier;
use tus_uploadr::{TusServer, UploadService};

const TUS: &str = "1.0.0";
const OCTET: &str = "application/offset+octet-stream";

/// A running server and the means to stop it
struct TestServer {
    addr: SocketAddr,
    service: Arc<UploadService>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    async fn start(authorizer: Arc<dyn Authorizer>) -> Self {
        let mut config = Config::with_address("127.0.0.1:0");
        config.storage.backend = StorageBackend::Memory;
        Self::start_with_config(authorizer, config).await
    }

    async fn start_with_config(authorizer: Arc<dyn Authorizer>, config: Config) -> Self {
        let service = Arc::new(UploadService::from_config(&config, Arc::new(NoopNotifier)).unwrap());
        let server = TusServer::bind(&config.server.address, service.clone(), authorizer)
            .await
            .expect("Failed to bind server");
        let addr = server.local_addr();

        let (tx, rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            server
                .run_until(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            addr,
            service,
            shutdown: Some(tx),
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            handle.await.unwrap();
        }
    }
}

fn header<'a>(response: &'a reqwest::Response, name: &str) -> Option<&'a str> {
    response.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn create(client: &Client, server: &TestServer, length: u64) -> String {
    let response = client
        .post(server.url("/files"))
        .header("Tus-Resumable", TUS)
        .header("Upload-Length", length.to_string())
        .header("Upload-Metadata", "filename aGVsbG8udHh0,public")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let location = header(&response, "location").unwrap().to_string();
    location.rsplit('/').next().unwrap().to_string()
}

async fn patch(
    client: &Client,
    server: &TestServer,
    id: &str,
    offset: u64,
    body: &'static [u8],
) -> reqwest::Response {
    client
        .patch(server.url(&format!("/files/{}", id)))
        .header("Tus-Resumable", TUS)
        .header("Upload-Offset", offset.to_string())
        .header("Content-Type", OCTET)
        .body(body)
        .send()
        .await
        .unwrap()
}

mod tests {
    use super::*;

    #[tokio::test]
    async fn test_options_advertises_capabilities() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();

        let response = client
            .request(Method::OPTIONS, server.url("/files"))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&response, "tus-resumable"), Some(TUS));
        assert_eq!(header(&response, "tus-version"), Some(TUS));
        assert_eq!(header(&response, "tus-max-size"), Some("128849018880"));
        assert!(header(&response, "tus-extension")
            .unwrap()
            .contains("termination"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_full_upload_lifecycle() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();

        let response = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "10")
            .header("Upload-Metadata", "filename aGVsbG8udHh0")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(header(&response, "tus-resumable"), Some(TUS));
        assert!(header(&response, "upload-expires").is_some());
        let location = header(&response, "location").unwrap().to_string();
        let prefix = format!("http://{}/files/", server.addr);
        assert!(location.starts_with(&prefix), "unexpected {}", location);
        let id = location[prefix.len()..].to_string();

        let head = client
            .head(server.url(&format!("/files/{}", id)))
            .header("Tus-Resumable", TUS)
            .send()
            .await
            .unwrap();
        assert_eq!(head.status(), StatusCode::OK);
        assert_eq!(header(&head, "upload-offset"), Some("0"));
        assert_eq!(header(&head, "upload-length"), Some("10"));
        assert_eq!(header(&head, "upload-metadata"), Some("filename aGVsbG8udHh0"));
        assert_eq!(header(&head, "cache-control"), Some("no-store"));

        let first = patch(&client, &server, &id, 0, b"01234").await;
        assert_eq!(first.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&first, "upload-offset"), Some("5"));

        let stale = patch(&client, &server, &id, 0, b"01234").await;
        assert_eq!(stale.status(), StatusCode::CONFLICT);

        let second = patch(&client, &server, &id, 5, b"56789").await;
        assert_eq!(second.status(), StatusCode::NO_CONTENT);
        assert_eq!(header(&second, "upload-offset"), Some("10"));

        let download = client
            .get(server.url(&format!("/files/{}", id)))
            .send()
            .await
            .unwrap();
        assert_eq!(download.status(), StatusCode::OK);
        assert!(header(&download, "content-disposition")
            .unwrap()
            .contains("filename=\"hello.txt\""));
        assert_eq!(&download.bytes().await.unwrap()[..], b"0123456789");

        let delete = client
            .delete(server.url(&format!("/files/{}", id)))
            .header("Tus-Resumable", TUS)
            .send()
            .await
            .unwrap();
        assert_eq!(delete.status(), StatusCode::NO_CONTENT);

        let gone = client
            .head(server.url(&format!("/files/{}", id)))
            .header("Tus-Resumable", TUS)
            .send()
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_creation_with_upload() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();

        let response = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "8")
            .header("Content-Type", OCTET)
            .body("abcd")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(header(&response, "upload-offset"), Some("4"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_failed_inline_body_leaves_no_upload() {
        let mut config = Config::with_address("127.0.0.1:0");
        config.storage.backend = StorageBackend::Memory;
        config.expiration.policy = ExpiryPolicy::OnFirstChunk;
        let server = TestServer::start_with_config(Arc::new(AllowAllAuthorizer), config).await;
        let client = Client::new();

        let response = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "2")
            .header("Content-Type", OCTET)
            .body("abcd")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(header(&response, "location"), None);
        assert!(server.service.list_ids().await.unwrap().is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_deferred_length_head() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();

        let response = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Defer-Length", "1")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let location = header(&response, "location").unwrap().to_string();
        let id = location.rsplit('/').next().unwrap();

        let head = client
            .head(server.url(&format!("/files/{}", id)))
            .header("Tus-Resumable", TUS)
            .send()
            .await
            .unwrap();
        assert_eq!(header(&head, "upload-defer-length"), Some("1"));
        assert!(header(&head, "upload-length").is_none());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_creation_rejects_bad_headers() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();

        let both = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "5")
            .header("Upload-Defer-Length", "1")
            .send()
            .await
            .unwrap();
        assert_eq!(both.status(), StatusCode::BAD_REQUEST);

        let bad_metadata = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "5")
            .header("Upload-Metadata", "filename !!!notbase64")
            .send()
            .await
            .unwrap();
        assert_eq!(bad_metadata.status(), StatusCode::BAD_REQUEST);

        let too_large = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "999999999999999")
            .send()
            .await
            .unwrap();
        assert_eq!(too_large.status(), StatusCode::PAYLOAD_TOO_LARGE);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_version_mismatch_is_412() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();

        let response = client
            .post(server.url("/files"))
            .header("Tus-Resumable", "0.2.2")
            .header("Upload-Length", "5")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PRECONDITION_FAILED);
        assert_eq!(header(&response, "tus-version"), Some(TUS));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_415() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();
        let id = create(&client, &server, 5).await;

        let response = client
            .patch(server.url(&format!("/files/{}", id)))
            .header("Tus-Resumable", TUS)
            .header("Upload-Offset", "0")
            .header("Content-Type", "text/plain")
            .body("hello")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_forwarded_headers_shape_location() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();

        let response = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "5")
            .header("X-Forwarded-Proto", "https")
            .header("X-Forwarded-Host", "uploads.example.com, proxy.internal")
            .send()
            .await
            .unwrap();
        let location = header(&response, "location").unwrap();
        assert!(location.starts_with("https://uploads.example.com/files/"));

        server.stop().await;
    }

    #[tokio::test]
    async fn test_method_override_delete() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();
        let id = create(&client, &server, 5).await;

        let response = client
            .post(server.url(&format!("/files/{}", id)))
            .header("Tus-Resumable", TUS)
            .header("X-HTTP-Method-Override", "DELETE")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_unknown_paths() {
        let server = TestServer::start(Arc::new(AllowAllAuthorizer)).await;
        let client = Client::new();

        let outside = client
            .post(server.url("/elsewhere"))
            .header("Tus-Resumable", TUS)
            .send()
            .await
            .unwrap();
        assert_eq!(outside.status(), StatusCode::NOT_FOUND);

        let missing = client
            .head(server.url("/files/ffffffffffffffffffffffffffffffff"))
            .header("Tus-Resumable", TUS)
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_denied_requests_are_403() {
        let server = TestServer::start(Arc::new(DenyAllAuthorizer)).await;
        let client = Client::new();

        let response = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "5")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_jwt_required() {
        let secret = "http-test-secret";
        let server = TestServer::start(Arc::new(JwtAuthorizer::new_hs256(secret))).await;
        let client = Client::new();

        let anonymous = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "5")
            .send()
            .await
            .unwrap();
        assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(header(&anonymous, "www-authenticate"), Some("Bearer"));

        let claims = tus_uploadr::authz::jwt::Claims {
            sub: "alice".into(),
            exp: (chrono::Utc::now() + chrono::Duration::hours(1)).timestamp() as usize,
            iat: None,
            iss: None,
            aud: None,
        };
        let token = jsonwebtoken::encode(
            &jsonwebtoken::Header::default(),
            &claims,
            &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let authorized = client
            .post(server.url("/files"))
            .header("Tus-Resumable", TUS)
            .header("Upload-Length", "5")
            .bearer_auth(token)
            .send()
            .await
            .unwrap();
        assert_eq!(authorized.status(), StatusCode::CREATED);

        server.stop().await;
    }
}
