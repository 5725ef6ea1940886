//! Shared helpers for the integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{body::Body, http::Request, response::Response};
use gittp_git::{encode, ZERO_ID};
use gittp_server::{
    api::{create_router, AppState},
    sink::ResponseSink,
    GitBackend, GitServer, Invocation, ServeError, ServerConfig,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const NEW_ID: &str = "68839ad5d8bedf1147c214e4897ca6ad8afbfecc";

/// Backend recording calls instead of running git.
#[derive(Default)]
pub struct SpyBackend {
    pub existing: Mutex<HashSet<PathBuf>>,
    pub calls: Mutex<Vec<String>>,
    pub output: Vec<u8>,
}

impl SpyBackend {
    pub fn with_output(output: &[u8]) -> Self {
        Self {
            output: output.to_vec(),
            ..Self::default()
        }
    }

    pub fn add_repository(&self, path: &Path) {
        self.existing.lock().insert(path.to_path_buf());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl GitBackend for SpyBackend {
    fn exists(&self, path: &Path) -> bool {
        self.existing.lock().contains(path)
    }

    async fn init_bare(&self, path: &Path) -> gittp_server::Result<()> {
        self.calls.lock().push("init".to_string());
        self.add_repository(path);
        Ok(())
    }

    async fn archive(&self, _path: &Path, rev: &str) -> gittp_server::Result<Vec<u8>> {
        self.calls.lock().push(format!("archive {rev}"));
        Err(ServeError::CommandExecutionFailure {
            service: "git-archive".to_string(),
            reason: "not a real repository".to_string(),
        })
    }

    async fn run_service(
        &self,
        invocation: &Invocation<'_>,
        _input: &[u8],
        output: &mut dyn ResponseSink,
    ) -> gittp_server::Result<()> {
        self.calls.lock().push(format!("run {}", invocation.service));
        output.send(&self.output).await?;
        Ok(())
    }
}

pub fn create_test_app(config: ServerConfig, spy: Arc<SpyBackend>) -> axum::Router {
    let server = GitServer::new(config, spy);
    create_router(AppState::new(server, 1024 * 1024))
}

/// Body of a push updating `branch` to [`NEW_ID`].
pub fn push_body(branch: &str) -> Vec<u8> {
    let mut body = encode(
        format!("{ZERO_ID} {NEW_ID} {branch}\0report-status side-band-64k agent=git/2.8.3")
            .as_bytes(),
    )
    .unwrap();
    body.extend_from_slice(b"0000PACK");
    body
}

pub fn receive_pack_request(repo: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(format!("/{repo}/git-receive-pack"))
        .header("content-type", "application/x-git-receive-pack-request")
        .body(Body::from(body))
        .unwrap()
}

pub async fn body_bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

pub fn assert_no_cache(response: &Response) {
    let headers = response.headers();
    assert_eq!(headers["expires"], "Fri, 01 Jan 1980 00:00:00 GMT");
    assert_eq!(headers["pragma"], "no-cache");
    assert_eq!(headers["cache-control"], "no-cache, max-age=0, must-revalidate");
}
