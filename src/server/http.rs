//! tus HTTP front end
//!
//! A hyper HTTP/1.1 server. Each request is parsed into a
//! [`TusOperation`], checked against the authorizer and handed to the
//! [`UploadService`]. Chunk bodies are streamed frame by frame into the
//! service, never buffered whole.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use tus_uploadr::authz::AllowAllAuthorizer;
//! use tus_uploadr::config::Config;
//! use tus_uploadr::notify::NoopNotifier;
//! use tus_uploadr::server::TusServer;
//! use tus_uploadr::upload::UploadService;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::with_address("127.0.0.1:0");
//! let service = Arc::new(UploadService::from_config(&config, Arc::new(NoopNotifier))?);
//! let server = TusServer::bind(&config.server.address, service, Arc::new(AllowAllAuthorizer)).await?;
//! println!("Listening on {}", server.local_addr());
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::authz::{AuthzError, AuthzRequest, Authorizer};
use crate::metrics;
use crate::router::{RouterError, TusOperation, TusRequestParser, METHOD_OVERRIDE_HEADER};
use crate::server::ServerError;
use crate::upload::location::{build_location_url, LocationParts};
use crate::upload::{
    http_date, metadata, parse_defer_length, parse_u64_header, ChunkRequest, ClientMetadata,
    CreateRequest, UploadError, UploadService, OFFSET_CONTENT_TYPE, TUS_VERSION,
};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderName, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use std::collections::HashMap;
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn, Instrument, Span};

type TusResponse = Response<Full<Bytes>>;

/// Shared by every connection
struct AppState {
    service: Arc<UploadService>,
    authorizer: Arc<dyn Authorizer>,
    prefix: String,
}

/// HTTP server for the tus protocol
pub struct TusServer {
    state: Arc<AppState>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TusServer {
    /// Bind to `address`. Port 0 lets the OS pick a port; see
    /// [`local_addr`](Self::local_addr).
    pub async fn bind(
        address: &str,
        service: Arc<UploadService>,
        authorizer: Arc<dyn Authorizer>,
    ) -> Result<Self, ServerError> {
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| ServerError::BindError(format!("Invalid address: {}", e)))?;

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindError(format!("Failed to bind to {}: {}", addr, e)))?;

        let local_addr = listener
            .local_addr()
            .map_err(|e| ServerError::BindError(format!("Failed to get local address: {}", e)))?;

        info!("Server bound to {}", local_addr);

        let prefix = service.tus_config().path_prefix.clone();
        Ok(Self {
            state: Arc::new(AppState {
                service,
                authorizer,
                prefix,
            }),
            listener,
            local_addr,
        })
    }

    /// Address the server is listening on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until Ctrl-C
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve until `shutdown` resolves, then let open connections finish
    /// their current request.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send,
    {
        info!(prefix = %self.state.prefix, "Starting tus server on {}", self.local_addr);

        let (close_tx, close_rx) = watch::channel(false);
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };

                    let state = Arc::clone(&self.state);
                    let mut close_rx = close_rx.clone();
                    connections.spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| {
                            let state = Arc::clone(&state);
                            async move { Ok::<_, Infallible>(handle_request(req, state).await) }
                        });

                        let conn = http1::Builder::new().serve_connection(io, service);
                        tokio::pin!(conn);
                        let result = tokio::select! {
                            result = conn.as_mut() => result,
                            _ = close_rx.changed() => {
                                conn.as_mut().graceful_shutdown();
                                conn.as_mut().await
                            }
                        };
                        if let Err(e) = result {
                            debug!("Error serving connection from {}: {}", peer_addr, e);
                        }
                    });
                }
            }
        }

        info!(
            open_connections = connections.len(),
            "Shutting down, draining connections"
        );
        let _ = close_tx.send(true);
        while connections.join_next().await.is_some() {}
        info!("Server stopped");
        Ok(())
    }
}

// ============================================================================
// Request handling
// ============================================================================

async fn handle_request(req: Request<Incoming>, state: Arc<AppState>) -> TusResponse {
    let span = tracing::info_span!(
        "http.request",
        http.method = %req.method(),
        http.target = %req.uri().path(),
        http.status_code = tracing::field::Empty,
        upload_id = tracing::field::Empty,
    );

    async move {
        let mut response = match dispatch(req, &state).await {
            Ok(response) => response,
            Err(e) => error_response(&e),
        };
        set_header(&mut response, "tus-resumable", TUS_VERSION);
        Span::current().record("http.status_code", response.status().as_u16());
        response
    }
    .instrument(span)
    .await
}

async fn dispatch(req: Request<Incoming>, state: &AppState) -> Result<TusResponse, UploadError> {
    let operation = match TusRequestParser::parse(
        req.method().as_str(),
        header_str(req.headers(), METHOD_OVERRIDE_HEADER),
        req.uri().path(),
        &state.prefix,
    ) {
        Ok(op) => op,
        Err(RouterError::NotFound(path)) => return Err(UploadError::NotFound(path)),
        Err(RouterError::MethodNotAllowed(msg)) => {
            return Ok(text_response(StatusCode::METHOD_NOT_ALLOWED, msg))
        }
    };
    if let Some(id) = operation.upload_id() {
        Span::current().record("upload_id", id);
    }

    check_tus_resumable(req.headers(), &operation)?;
    authorize(state, &req, &operation).await?;

    match operation {
        TusOperation::Create => create(req, state).await,
        TusOperation::Append { upload_id } => append(req, state, &upload_id).await,
        TusOperation::Head { upload_id } => head(state, &upload_id).await,
        TusOperation::Options { upload_id } => options(state, upload_id.as_deref()).await,
        TusOperation::Download { upload_id } => download(state, &upload_id).await,
        TusOperation::Delete { upload_id } => {
            state.service.delete(&upload_id).await?;
            Ok(empty_response(StatusCode::NO_CONTENT))
        }
    }
}

/// Every request but OPTIONS and plain downloads must speak our version
fn check_tus_resumable(headers: &HeaderMap, operation: &TusOperation) -> Result<(), UploadError> {
    match header_str(headers, "tus-resumable") {
        Some(version) if version.trim() == TUS_VERSION => Ok(()),
        Some(version) => Err(UploadError::UnsupportedVersion(version.to_string())),
        None => match operation {
            TusOperation::Options { .. } | TusOperation::Download { .. } => Ok(()),
            _ => Err(UploadError::UnsupportedVersion(
                "missing Tus-Resumable".into(),
            )),
        },
    }
}

async fn authorize(
    state: &AppState,
    req: &Request<Incoming>,
    operation: &TusOperation,
) -> Result<(), UploadError> {
    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.as_str().to_lowercase(), v.to_string());
        }
    }

    let request = AuthzRequest {
        operation: operation.name().to_string(),
        upload_id: operation.upload_id().map(str::to_string),
        headers,
        query: req.uri().query().map(str::to_string),
    };

    state
        .authorizer
        .authorize(&request)
        .await
        .map_err(|e| match e {
            AuthzError::Unauthorized(_) => UploadError::Unauthorized,
            AuthzError::Forbidden(reason) => UploadError::Forbidden(reason),
            AuthzError::Config(reason) => {
                // Fail closed
                error!("Authorizer misconfigured: {}", reason);
                UploadError::Forbidden("authorization unavailable".into())
            }
        })
}

async fn create(req: Request<Incoming>, state: &AppState) -> Result<TusResponse, UploadError> {
    let headers = req.headers();
    let upload_length = parse_u64_header("Upload-Length", header_str(headers, "upload-length"))?;
    let defer_length = parse_defer_length(header_str(headers, "upload-defer-length"))?;
    let metadata = match header_str(headers, "upload-metadata") {
        Some(value) if !value.trim().is_empty() => metadata::decode(value)?,
        _ => ClientMetadata::new(),
    };

    let content_type = header_str(headers, "content-type").map(str::to_string);
    let with_upload = content_type.as_deref().is_some_and(is_offset_content_type)
        && header_str(headers, "content-length") != Some("0");

    let record = state
        .service
        .initiate(CreateRequest {
            upload_length,
            defer_length,
            metadata,
        })
        .await?;

    let location = build_location_url(
        &LocationParts {
            host: header_str(headers, "host"),
            forwarded_proto: header_str(headers, "x-forwarded-proto"),
            forwarded_host: header_str(headers, "x-forwarded-host"),
            scheme: req.uri().scheme_str(),
        },
        &state.prefix,
        &record.id,
    );

    let mut response = empty_response(StatusCode::CREATED);
    set_header(&mut response, "location", &location);

    if with_upload {
        let request = ChunkRequest {
            offset: 0,
            upload_length: None,
            content_type,
        };
        let body = req.into_body().into_data_stream();
        // The client only learns the id from a 201, so a failed inline body
        // must not leave the upload behind.
        let outcome = match state.service.append_chunk(&record.id, request, body).await {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Err(cleanup) = state.service.delete(&record.id).await {
                    warn!(
                        upload_id = %record.id,
                        error = %cleanup,
                        "Failed to discard upload after inline body error"
                    );
                }
                return Err(e);
            }
        };
        set_header(&mut response, "upload-offset", &outcome.offset.to_string());
        if let Some(expires_at) = outcome.expires_at {
            set_header(&mut response, "upload-expires", &http_date(expires_at));
        }
    } else if let Some(expires_at) = record.expires_at {
        set_header(&mut response, "upload-expires", &http_date(expires_at));
    }

    Ok(response)
}

async fn append(
    req: Request<Incoming>,
    state: &AppState,
    upload_id: &str,
) -> Result<TusResponse, UploadError> {
    let headers = req.headers();
    let offset = parse_u64_header("Upload-Offset", header_str(headers, "upload-offset"))?
        .ok_or_else(|| UploadError::BadRequest("Upload-Offset header is required".into()))?;
    let request = ChunkRequest {
        offset,
        upload_length: parse_u64_header("Upload-Length", header_str(headers, "upload-length"))?,
        content_type: header_str(headers, "content-type").map(str::to_string),
    };

    let body = req.into_body().into_data_stream();
    let outcome = state.service.append_chunk(upload_id, request, body).await?;

    let mut response = empty_response(StatusCode::NO_CONTENT);
    set_header(&mut response, "upload-offset", &outcome.offset.to_string());
    if let Some(expires_at) = outcome.expires_at {
        set_header(&mut response, "upload-expires", &http_date(expires_at));
    }
    Ok(response)
}

async fn head(state: &AppState, upload_id: &str) -> Result<TusResponse, UploadError> {
    let record = state.service.query_head(upload_id).await?;

    let mut response = empty_response(StatusCode::OK);
    set_header(&mut response, "upload-offset", &record.offset.to_string());
    match record.size {
        Some(size) => set_header(&mut response, "upload-length", &size.to_string()),
        None => set_header(&mut response, "upload-defer-length", "1"),
    }
    if !record.metadata.is_empty() {
        set_header(
            &mut response,
            "upload-metadata",
            &metadata::encode(&record.metadata),
        );
    }
    if let Some(expires_at) = record.expires_at {
        set_header(&mut response, "upload-expires", &http_date(expires_at));
    }
    set_header(&mut response, "cache-control", "no-store");
    Ok(response)
}

async fn options(state: &AppState, upload_id: Option<&str>) -> Result<TusResponse, UploadError> {
    let capabilities = state.service.query_options(upload_id).await?;

    let mut response = empty_response(StatusCode::NO_CONTENT);
    set_header(&mut response, "tus-version", capabilities.version);
    set_header(&mut response, "tus-extension", capabilities.extensions);
    set_header(
        &mut response,
        "tus-max-size",
        &capabilities.max_size.to_string(),
    );
    Ok(response)
}

async fn download(state: &AppState, upload_id: &str) -> Result<TusResponse, UploadError> {
    let download = state.service.download(upload_id).await?;

    let mut response = Response::new(Full::new(download.data));
    set_header(
        &mut response,
        "content-type",
        download
            .content_type
            .as_deref()
            .unwrap_or("application/octet-stream"),
    );
    set_header(
        &mut response,
        "content-disposition",
        &content_disposition(&download.filename),
    );
    Ok(response)
}

// ============================================================================
// Response helpers
// ============================================================================

fn error_response(error: &UploadError) -> TusResponse {
    let status = error.status_code();
    if status.is_server_error() {
        error!(kind = error.kind(), "Request failed: {}", error);
    } else {
        warn!(kind = error.kind(), "Request rejected: {}", error);
    }
    metrics::record_error(error.kind());

    let mut response = text_response(status, error.to_string());
    match error {
        UploadError::UnsupportedVersion(_) => {
            set_header(&mut response, "tus-version", TUS_VERSION);
        }
        UploadError::Unauthorized => {
            set_header(&mut response, "www-authenticate", "Bearer");
        }
        _ => {}
    }
    response
}

fn empty_response(status: StatusCode) -> TusResponse {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn text_response(status: StatusCode, body: String) -> TusResponse {
    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    set_header(&mut response, "content-type", "text/plain; charset=utf-8");
    response
}

/// `name` must be lower-case
fn set_header(response: &mut TusResponse, name: &'static str, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(name), value);
        }
        Err(_) => warn!(header = name, "Dropping header with invalid value"),
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn is_offset_content_type(content_type: &str) -> bool {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .is_some_and(|ct| ct.eq_ignore_ascii_case(OFFSET_CONTENT_TYPE))
}

/// `attachment` with an ASCII fallback name and the exact name in RFC 5987 form
fn content_disposition(filename: &str) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| {
            if c == ' ' || (c.is_ascii_graphic() && c != '"' && c != '\\') {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        utf8_percent_encode(filename, NON_ALPHANUMERIC)
    )
}
