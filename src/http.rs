//! HTTP server for shard RPC and the command boundary
//!
//! ## Endpoints
//!
//! - `GET /health` - liveness and store counts
//! - `POST /shard/search` - `{"query"}` → this shard's local matches
//! - `GET /shard/stats` - this shard's community and project counts
//! - `POST /command` - a [`Command`] document → a [`CommandOutcome`] document
//!
//! Errors are returned as `{"error", "kind"}` with 404 for NotFound, 403 for
//! PermissionDenied, 400 for Validation, 409 for AlreadyExists and 500
//! otherwise.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::{Body, Incoming};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use crate::error::TrackerError;
use crate::services::{Command, Services};
use crate::shard::{LocalShard, ShardPeer, ShardSearchRequest, ShardSearchResponse};

/// Largest request body accepted
const MAX_BODY_BYTES: usize = 1024 * 1024;

type HttpResponse = Response<Full<Bytes>>;

/// HTTP status for an error returned to a caller
pub fn status_for(err: &TrackerError) -> StatusCode {
    match err {
        TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
        TrackerError::PermissionDenied { .. } => StatusCode::FORBIDDEN,
        TrackerError::Validation(_) | TrackerError::Json(_) => StatusCode::BAD_REQUEST,
        TrackerError::AlreadyExists(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn json_response<T: Serialize>(status: StatusCode, body: &T) -> HttpResponse {
    match serde_json::to_vec(body) {
        Ok(bytes) => {
            let mut response = Response::new(Full::new(Bytes::from(bytes)));
            *response.status_mut() = status;
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(e) => {
            error!(error = %e, "Failed to encode response");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode response")
        }
    }
}

fn text_response(status: StatusCode, body: &'static str) -> HttpResponse {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    kind: &'static str,
}

fn error_response(err: &TrackerError) -> HttpResponse {
    json_response(
        status_for(err),
        &ErrorBody {
            error: err.to_string(),
            kind: err.kind(),
        },
    )
}

/// Collect a request body, stopping as soon as it passes `MAX_BODY_BYTES`
async fn read_limited<B>(body: B) -> Result<Bytes, TrackerError>
where
    B: Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(TrackerError::Validation(format!(
            "request body exceeds {} bytes",
            MAX_BODY_BYTES
        ))),
        Err(e) => Err(TrackerError::Connection(format!("Failed to read body: {}", e))),
    }
}

/// HTTP server state
pub struct HttpServer {
    services: Arc<Services>,
    local: Arc<LocalShard>,
    bind_addr: SocketAddr,
}

impl HttpServer {
    pub fn new(services: Arc<Services>, local: Arc<LocalShard>, bind_addr: SocketAddr) -> Self {
        Self {
            services,
            local,
            bind_addr,
        }
    }

    /// Bind the configured address and serve until the task is dropped
    pub async fn run(self: Arc<Self>) -> Result<(), TrackerError> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), TrackerError> {
        info!(addr = %listener.local_addr()?, shard_id = self.local.shard_id(), "HTTP server listening");

        loop {
            let (stream, remote_addr) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let server = server.clone();
                    async move { server.handle_request(req).await }
                });

                if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                    warn!(addr = %remote_addr, error = %err, "Connection error");
                }
            });
        }
    }

    /// Route requests to handlers
    async fn handle_request(&self, req: Request<Incoming>) -> Result<HttpResponse, hyper::Error> {
        let path = req.uri().path().to_string();
        let method = req.method().clone();

        debug!(method = %method, path = %path, "Incoming request");

        let result = match (method, path.as_str()) {
            (Method::GET, "/health") => self.handle_health(),
            (Method::GET, "/shard/stats") => self.handle_shard_stats().await,
            (Method::POST, "/shard/search") => self.handle_shard_search(req).await,
            (Method::POST, "/command") => self.handle_command(req).await,
            _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
        };

        Ok(match result {
            Ok(response) => response,
            Err(e) => {
                if e.is_user_error() {
                    debug!(path = %path, error = %e, "Request rejected");
                } else {
                    error!(path = %path, error = %e, "Request error");
                }
                error_response(&e)
            }
        })
    }

    async fn read_json<T: serde::de::DeserializeOwned>(req: Request<Incoming>) -> Result<T, TrackerError> {
        let body = read_limited(req.into_body()).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    fn handle_health(&self) -> Result<HttpResponse, TrackerError> {
        let db = self.services.db.stats()?;
        let body = serde_json::json!({
            "status": "ok",
            "shard_id": self.local.shard_id(),
            "peers": self.services.shards.shard_count(),
            "projects": db.project_count,
            "resources": db.resource_count,
        });
        Ok(json_response(StatusCode::OK, &body))
    }

    /// POST /shard/search - answer from this shard only
    async fn handle_shard_search(&self, req: Request<Incoming>) -> Result<HttpResponse, TrackerError> {
        let request: ShardSearchRequest = Self::read_json(req).await?;
        let matches = self.local.search(request.query.trim()).await?;
        Ok(json_response(
            StatusCode::OK,
            &ShardSearchResponse {
                shard_id: self.local.shard_id(),
                matches,
            },
        ))
    }

    async fn handle_shard_stats(&self) -> Result<HttpResponse, TrackerError> {
        let stats = self.local.stats().await?;
        Ok(json_response(StatusCode::OK, &stats))
    }

    /// POST /command - run one command document
    async fn handle_command(&self, req: Request<Incoming>) -> Result<HttpResponse, TrackerError> {
        let command: Command = Self::read_json(req).await?;
        let outcome = self.services.execute(command).await?;
        Ok(json_response(StatusCode::OK, &outcome))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(status_for(&TrackerError::NotFound("p".into())), StatusCode::NOT_FOUND);
        assert_eq!(
            status_for(&TrackerError::PermissionDenied { user_id: "u".into(), project: "p".into() }),
            StatusCode::FORBIDDEN
        );
        assert_eq!(status_for(&TrackerError::Validation("v".into())), StatusCode::BAD_REQUEST);
        assert_eq!(status_for(&TrackerError::AlreadyExists("p".into())), StatusCode::CONFLICT);
        assert_eq!(status_for(&TrackerError::Internal("x".into())), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_oversized_body_is_rejected() {
        let big = Full::new(Bytes::from(vec![b' '; MAX_BODY_BYTES + 1]));
        assert!(matches!(read_limited(big).await, Err(TrackerError::Validation(_))));

        let small = Full::new(Bytes::from_static(b"{\"query\": \"keep\"}"));
        let body = read_limited(small).await.unwrap();
        let request: ShardSearchRequest = serde_json::from_slice(&body).unwrap();
        assert_eq!(request.query, "keep");
    }

    #[test]
    fn test_error_body() {
        let response = error_response(&TrackerError::NotFound("project Keep".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get(CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }
}
