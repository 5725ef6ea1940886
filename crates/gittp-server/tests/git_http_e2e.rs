//! End-to-end tests of the smart HTTP bridge with a recording git backend.

mod common;

use axum::{body::Body, http::Request};
use common::*;
use gittp_git::{encode_ref_advertisement, ServiceType};
use gittp_server::hooks::{AllowCreate, Decision, HookContext, OnlyBranch};
use gittp_server::ServerConfig;
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::TempDir;
use tower::ServiceExt;

// ==================== Ref Advertisement ====================

#[tokio::test]
async fn test_refs_discovery() {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig::new(dir.path()).unwrap();
    let spy = Arc::new(SpyBackend::with_output(b"0000"));
    spy.add_repository(&config.storage_root.join("adam/project.git"));
    let app = create_test_app(config, spy.clone());

    let request = Request::builder()
        .method("GET")
        .uri("/adam/project.git/info/refs?service=git-upload-pack")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-git-upload-pack-advertisement"
    );
    assert!(response.headers().contains_key("x-request-id"));
    assert_no_cache(&response);

    let mut expected = encode_ref_advertisement(ServiceType::UploadPack);
    expected.extend_from_slice(b"0000");
    assert_eq!(body_bytes(response).await, expected);
    assert_eq!(spy.calls(), vec!["run git-upload-pack"]);
}

#[tokio::test]
async fn test_receive_pack_advertisement_creates_repository() {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig::new(dir.path())
        .unwrap()
        .with_pre_create(AllowCreate);
    let spy = Arc::new(SpyBackend::with_output(b"0000"));
    let app = create_test_app(config, spy.clone());

    let request = Request::builder()
        .uri("/adam/project.git/info/refs?service=git-receive-pack")
        .body(Body::empty())
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-git-receive-pack-advertisement"
    );
    assert_eq!(spy.calls(), vec!["init", "run git-receive-pack"]);
}

// ==================== Errors ====================

#[tokio::test]
async fn test_unclassifiable_requests() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(
        ServerConfig::new(dir.path()).unwrap(),
        Arc::new(SpyBackend::default()),
    );

    for uri in ["/adam/project.git", "/info/refs", "/git-upload-pack"] {
        let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), 500, "uri: {uri}");
        assert_no_cache(&response);
    }
}

#[tokio::test]
async fn test_fetch_from_missing_repository() {
    let dir = TempDir::new().unwrap();
    let spy = Arc::new(SpyBackend::default());
    let app = create_test_app(ServerConfig::new(dir.path()).unwrap(), spy.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/adam/missing.git/git-upload-pack")
        .body(Body::from("0000"))
        .unwrap();

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 404);
    assert_no_cache(&response);
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn test_oversized_body() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(
        ServerConfig::new(dir.path()).unwrap(),
        Arc::new(SpyBackend::default()),
    );

    let response = app
        .oneshot(receive_pack_request(
            "adam/project.git",
            vec![b'0'; 2 * 1024 * 1024],
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), 500);
}

// ==================== Push Hooks ====================

#[tokio::test]
async fn test_push_creation_denied() {
    let dir = TempDir::new().unwrap();
    let spy = Arc::new(SpyBackend::default());
    let app = create_test_app(ServerConfig::new(dir.path()).unwrap(), spy.clone());

    let response = app
        .oneshot(receive_pack_request(
            "adam/project.git",
            push_body("refs/heads/master"),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), 404);
    assert_eq!(
        response.headers()["content-type"],
        "application/x-git-receive-pack-result"
    );
    assert_no_cache(&response);

    let body = body_bytes(response).await;
    assert!(String::from_utf8_lossy(&body)
        .contains("\x03error: repository creation denied: adam/project.git\n"));
    assert!(body.ends_with(b"0000"));
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn test_push_rejected_by_branch_policy() {
    let dir = TempDir::new().unwrap();
    let config = ServerConfig::new(dir.path())
        .unwrap()
        .with_pre_create(AllowCreate)
        .with_pre_receive(OnlyBranch::master());
    let spy = Arc::new(SpyBackend::default());
    let app = create_test_app(config, spy.clone());

    let response = app
        .oneshot(receive_pack_request(
            "adam/project.git",
            push_body("refs/heads/dev"),
        ))
        .await
        .unwrap();

    // Hook output was streamed before the rejection.
    assert_eq!(response.status(), 200);

    let body = body_bytes(response).await;
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("\x02Only pushing to master is allowed.\n"));
    assert!(text.contains("\x02unpack ok\n"));
    assert_eq!(text.matches("ng refs/heads/dev").count(), 1);
    assert!(body.ends_with(b"0000"));
    assert!(spy.calls().is_empty());
}

#[tokio::test]
async fn test_push_accepted() {
    let dir = TempDir::new().unwrap();
    let seen_auth = Arc::new(Mutex::new(None));
    let record = seen_auth.clone();
    let config = ServerConfig::new(dir.path())
        .unwrap()
        .with_pre_create(AllowCreate)
        .with_pre_receive(OnlyBranch::master())
        .with_pre_receive(move |ctx: &mut HookContext| {
            *record.lock() = ctx.authorization.clone();
            let _ = ctx.writeln("Hello from pre-receive");
            Decision::Accept
        })
        .with_post_receive(
            |ctx: &mut HookContext, archive: Option<&[u8]>| -> anyhow::Result<()> {
                assert!(archive.is_none());
                ctx.writeln(&format!("deployed {}", ctx.commit))?;
                Ok(())
            },
        );
    let spy = Arc::new(SpyBackend::with_output(b"0000"));
    let app = create_test_app(config, spy.clone());

    let mut request = receive_pack_request("adam/project.git", push_body("refs/heads/master"));
    request
        .headers_mut()
        .insert("authorization", "Basic YWRhbTpzZWNyZXQ=".parse().unwrap());

    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), 200);

    let body = body_bytes(response).await;
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("\x02Hello from pre-receive\n"));
    assert!(text.contains(&format!("\x02deployed {NEW_ID}\n")));
    // git's own flush closes the response; no second one follows.
    assert!(body.ends_with(format!("deployed {NEW_ID}\n0000").as_bytes()));

    assert_eq!(seen_auth.lock().as_deref(), Some("Basic YWRhbTpzZWNyZXQ="));
    assert_eq!(
        spy.calls(),
        vec![
            "init".to_string(),
            "run git-receive-pack".to_string(),
            format!("archive {NEW_ID}"),
        ]
    );
}

#[tokio::test]
async fn test_health_check() {
    let dir = TempDir::new().unwrap();
    let app = create_test_app(
        ServerConfig::new(dir.path()).unwrap(),
        Arc::new(SpyBackend::default()),
    );

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = serde_json::from_slice(&body_bytes(response).await).unwrap();
    assert_eq!(body["status"], "ok");
}
