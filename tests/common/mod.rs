#![allow(dead_code)]

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::{json, Value};
use std::sync::Arc;

use vmhub::auth::TokenAuthenticator;
use vmhub::config::UserConfig;
use vmhub::metadata::{CachedMetadataStore, MemoryMetadataStore};
use vmhub::serve::routes::build_router;
use vmhub::serve::state::AppState;
use vmhub::session::MemorySessionStore;
use vmhub::storage::local::LocalStore;

pub const ALICE_TOKEN: &str = "alice-token";
pub const BOB_TOKEN: &str = "bob-token";
pub const ADMIN_TOKEN: &str = "admin-token";

pub const BOUNDARY: &str = "vmhubtestboundary";

pub fn test_users() -> Vec<UserConfig> {
    vec![
        UserConfig {
            username: "alice".into(),
            token: Some(ALICE_TOKEN.into()),
            password: None,
            admin: false,
        },
        UserConfig {
            username: "bob".into(),
            token: Some(BOB_TOKEN.into()),
            password: None,
            admin: false,
        },
        UserConfig {
            username: "root".into(),
            token: Some(ADMIN_TOKEN.into()),
            password: None,
            admin: true,
        },
    ]
}

pub fn build_app(store_dir: &std::path::Path) -> Router {
    let store = Arc::new(LocalStore::new(store_dir.to_path_buf()).unwrap());
    let sessions = Arc::new(MemorySessionStore::new());
    let metadata = Arc::new(CachedMetadataStore::new(Arc::new(
        MemoryMetadataStore::new(),
    )));
    let auth = Arc::new(TokenAuthenticator::new(&test_users()));
    build_router(AppState::new(store, sessions, metadata, auth))
}

pub fn multipart_body(data: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; \
             filename=\"image.img\"\r\nContent-Type: application/octet-stream\r\n\r\n"
        )
        .as_bytes(),
    );
    body.extend_from_slice(data);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    body
}

pub async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = tower::ServiceExt::oneshot(app.clone(), request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

pub async fn send_raw(app: &Router, request: Request<Body>) -> (StatusCode, Vec<u8>) {
    let response = tower::ServiceExt::oneshot(app.clone(), request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    (status, bytes.to_vec())
}

pub fn json_request(method: Method, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("Authorization", format!("Bearer {token}"))
        .header("Content-Type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn upload_request(uri: &str, token: &str, data: &[u8]) -> Request<Body> {
    Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("Authorization", format!("Bearer {token}"))
        .header(
            "Content-Type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(multipart_body(data)))
        .unwrap()
}

pub fn bare_request(method: Method, uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(token) = token {
        builder = builder.header("Authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

pub fn create_body(username: &str, name: &str, tag: &str, size: u64, digest: &str) -> Value {
    json!({
        "username": username,
        "name": name,
        "tag": tag,
        "size": size,
        "digest": digest,
        "format": "qcow2",
        "os": {"type": "linux", "distrib": "ubuntu", "version": "22.04", "arch": "amd64"},
    })
}
