//! HTTP bridge.
//!
//! Git clients address the bridge with smart HTTP URLs of any depth
//! (`/<repo>/info/refs?service=...`, `/<repo>/git-upload-pack`,
//! `/<repo>/git-receive-pack`), so one fallback handler classifies the raw
//! request URI instead of relying on route patterns.
//!
//! The response body streams: the request runs on its own task writing into
//! a [`StreamingBody`](crate::sink::StreamingBody), and the handler returns
//! as soon as the status is known. When the client goes away the body is
//! dropped, the next write fails and the git process is killed.

use crate::observability::request_id_layer;
use crate::server::GitServer;
use crate::sink::streaming;
use crate::ServeError;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::Instrument;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The bridge.
    pub server: Arc<GitServer>,
    /// Largest accepted request body.
    pub max_body_bytes: usize,
}

impl AppState {
    /// Creates the state for `server`.
    pub fn new(server: GitServer, max_body_bytes: usize) -> Self {
        Self {
            server: Arc::new(server),
            max_body_bytes,
        }
    }
}

/// Creates the HTTP router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .fallback(git_http)
        .layer(request_id_layer())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

/// Smart HTTP endpoint.
async fn git_http(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();
    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());

    let body = match axum::body::to_bytes(body, state.max_body_bytes).await {
        Ok(body) => body,
        Err(e) => return error_response(ServeError::RequestBodyReadFailure(e.to_string())),
    };

    let request = match state
        .server
        .classify(parts.method.as_str(), &request_uri, &body)
    {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(uri = %request_uri, error = %e, "Unclassifiable request");
            return error_response(e);
        }
    };

    if state.server.config().debug {
        tracing::info!(
            method = %parts.method,
            uri = %request_uri,
            repo = %request.repo_name,
            service = %request.service,
            hooks = request.should_run_hooks,
            "Git request"
        );
    }

    let authorization = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(String::from);
    let content_type = request.content_type();

    let (mut sink, head, response_body) = streaming();
    let server = state.server.clone();

    let task = tokio::spawn(
        async move {
            // `serve` already logged the failure and reported it on the sink.
            if let Err(e) = server.serve(&request, &body, authorization, &mut sink).await {
                tracing::debug!(error = %e, "Git request finished with error");
            }
        }
        .instrument(tracing::Span::current()),
    );
    tokio::spawn(async move {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Git request task failed");
        }
    });

    // The sink commits a status before it goes away, even on panic.
    let status = head.await.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response = Response::new(response_body);
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    no_cache(response.headers_mut());
    response
}

fn error_response(err: ServeError) -> Response {
    let mut response = err.into_response();
    no_cache(response.headers_mut());
    response
}

/// Adds the headers keeping proxies and clients from caching git responses.
fn no_cache(headers: &mut HeaderMap) {
    headers.insert(
        header::EXPIRES,
        HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"),
    );
    headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
}
