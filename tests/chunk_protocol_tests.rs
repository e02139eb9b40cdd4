mod common;

use axum::http::{Method, StatusCode};
use common::*;
use vmhub::digest::sha256_hex;

fn chunk_payload(len: usize) -> Vec<u8> {
    vec![0x61u8; len]
}

async fn start_session(
    app: &axum::Router,
    payload: &[u8],
    chunk_size: usize,
    declared_digest: &str,
    force: bool,
) -> String {
    let n_chunks = payload.len().div_ceil(chunk_size);
    let uri = format!(
        "/api/v1/image/alice/img1/startChunkUpload?force={force}&chunkSize={chunk_size}&nChunks={n_chunks}"
    );
    let body = create_body("alice", "img1", "v1", payload.len() as u64, declared_digest);
    let (status, value) = send(app, json_request(Method::POST, &uri, ALICE_TOKEN, body)).await;
    assert_eq!(status, StatusCode::OK, "start failed: {value}");
    value["data"]["uploadID"].as_str().unwrap().to_string()
}

async fn upload_chunk(app: &axum::Router, upload_id: &str, idx: usize, data: &[u8]) -> StatusCode {
    let uri = format!("/api/v1/image/chunk/{idx}/upload?uploadID={upload_id}");
    let (status, _) = send(app, upload_request(&uri, ALICE_TOKEN, data)).await;
    status
}

async fn merge(app: &axum::Router, upload_id: &str) -> (StatusCode, serde_json::Value) {
    let uri = format!("/api/v1/image/chunk/merge?uploadID={upload_id}");
    send(app, bare_request(Method::POST, &uri, Some(ALICE_TOKEN))).await
}

#[tokio::test]
async fn chunked_upload_in_reverse_order_assembles_the_image() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());

    let chunk_size = 6 * 1024;
    let payload = chunk_payload(13 * 1024);
    let digest = sha256_hex(&payload);

    let upload_id = start_session(&app, &payload, chunk_size, &digest, false).await;

    for idx in [2usize, 1, 0] {
        let start = idx * chunk_size;
        let end = payload.len().min(start + chunk_size);
        let status = upload_chunk(&app, &upload_id, idx, &payload[start..end]).await;
        assert_eq!(status, StatusCode::OK, "chunk {idx} upload failed");
    }

    let (status, value) = merge(&app, &upload_id).await;
    assert_eq!(status, StatusCode::OK, "merge failed: {value}");

    // committed metadata carries the probed size and digest
    let (status, info) = send(
        &app,
        bare_request(Method::GET, "/api/v1/image/alice/img1/info?tag=v1", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(info["data"]["size"].as_u64().unwrap(), payload.len() as u64);
    assert_eq!(info["data"]["digest"].as_str().unwrap(), digest);

    // and the stored bytes round-trip
    let (status, bytes) = send_raw(
        &app,
        bare_request(Method::GET, "/api/v1/image/alice/img1/download?tag=v1", None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(sha256_hex(&bytes), digest);
}

#[tokio::test]
async fn merge_rejects_missing_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());

    let chunk_size = 4 * 1024;
    let payload = chunk_payload(3 * chunk_size);
    let digest = sha256_hex(&payload);

    let upload_id = start_session(&app, &payload, chunk_size, &digest, false).await;
    for idx in [0usize, 2] {
        let start = idx * chunk_size;
        upload_chunk(&app, &upload_id, idx, &payload[start..start + chunk_size]).await;
    }

    let (status, value) = merge(&app, &upload_id).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let error = value["error"].as_str().unwrap();
    assert!(error.contains("chunks"), "unexpected error: {error}");

    // the session survives a failed merge; the missing chunk can be filled in
    let start = chunk_size;
    let status = upload_chunk(&app, &upload_id, 1, &payload[start..start + chunk_size]).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = merge(&app, &upload_id).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn upload_rejects_out_of_range_index() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());

    let chunk_size = 1024;
    let payload = chunk_payload(2 * chunk_size);
    let digest = sha256_hex(&payload);
    let upload_id = start_session(&app, &payload, chunk_size, &digest, false).await;

    let status = upload_chunk(&app, &upload_id, 2, &payload[..chunk_size]).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn merge_with_wrong_declared_digest_leaves_image_unpublished() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());

    let chunk_size = 1024;
    let payload = chunk_payload(2 * chunk_size);
    let wrong_digest = sha256_hex(b"something else entirely");

    let upload_id = start_session(&app, &payload, chunk_size, &wrong_digest, false).await;
    for idx in 0..2 {
        let start = idx * chunk_size;
        upload_chunk(&app, &upload_id, idx, &payload[start..start + chunk_size]).await;
    }

    let (status, value) = merge(&app, &upload_id).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["error"].as_str().unwrap().contains("invalid digest"));

    let (status, _) = send(
        &app,
        bare_request(Method::GET, "/api/v1/image/alice/img1/info?tag=v1", None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn merge_without_session_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());

    let (status, value) = merge(&app, "no-such-upload").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["error"]
        .as_str()
        .unwrap()
        .contains("start chunk upload first"));
}

#[tokio::test]
async fn merge_is_single_shot_per_session() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());

    let chunk_size = 1024;
    let payload = chunk_payload(chunk_size);
    let digest = sha256_hex(&payload);

    let upload_id = start_session(&app, &payload, chunk_size, &digest, false).await;
    upload_chunk(&app, &upload_id, 0, &payload).await;

    let (status, _) = merge(&app, &upload_id).await;
    assert_eq!(status, StatusCode::OK);

    // the session is gone after a successful merge
    let (status, value) = merge(&app, &upload_id).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["error"]
        .as_str()
        .unwrap()
        .contains("start chunk upload first"));
}

#[tokio::test]
async fn start_requires_chunk_parameters() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());
    let digest = sha256_hex(b"x");

    let body = create_body("alice", "img1", "v1", 1, &digest);
    let (status, value) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/image/alice/img1/startChunkUpload?nChunks=2",
            ALICE_TOKEN,
            body.clone(),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["error"].as_str().unwrap().contains("chunkSize"));

    let (status, value) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/image/alice/img1/startChunkUpload?chunkSize=1M&nChunks=0",
            ALICE_TOKEN,
            body,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["error"].as_str().unwrap().contains("nChunks"));
}

#[tokio::test]
async fn start_accepts_iec_chunk_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());
    let payload = chunk_payload(100);
    let digest = sha256_hex(&payload);

    let body = create_body("alice", "img1", "v1", payload.len() as u64, &digest);
    let (status, value) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/image/alice/img1/startChunkUpload?chunkSize=50M&nChunks=1",
            ALICE_TOKEN,
            body,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "start failed: {value}");
    assert!(!value["data"]["uploadID"].as_str().unwrap().is_empty());
}

#[tokio::test]
async fn chunk_download_returns_ranges() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());

    // publish a 10 KiB image through the chunk path
    let chunk_size = 4 * 1024;
    let payload: Vec<u8> = (0..10 * 1024).map(|i| (i % 251) as u8).collect();
    let digest = sha256_hex(&payload);
    let upload_id = start_session(&app, &payload, chunk_size, &digest, false).await;
    for idx in 0..3 {
        let start = idx * chunk_size;
        let end = payload.len().min(start + chunk_size);
        upload_chunk(&app, &upload_id, idx, &payload[start..end]).await;
    }
    let (status, _) = merge(&app, &upload_id).await;
    assert_eq!(status, StatusCode::OK);

    // middle chunk
    let (status, bytes) = send_raw(
        &app,
        bare_request(
            Method::GET,
            "/api/v1/image/alice/img1/chunk/1/download?tag=v1&chunkSize=4096",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, payload[4096..8192].to_vec());

    // short tail chunk
    let (status, bytes) = send_raw(
        &app,
        bare_request(
            Method::GET,
            "/api/v1/image/alice/img1/chunk/2/download?tag=v1&chunkSize=4096",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bytes, payload[8192..].to_vec());

    // out of range
    let (status, value) = send(
        &app,
        bare_request(
            Method::GET,
            "/api/v1/image/alice/img1/chunk/9/download?tag=v1&chunkSize=4096",
            None,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["error"].as_str().unwrap().contains("out of range"));
}

#[tokio::test]
async fn per_chunk_digest_is_verified_when_supplied() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());

    let chunk_size = 1024;
    let payload = chunk_payload(chunk_size);
    let digest = sha256_hex(&payload);
    let upload_id = start_session(&app, &payload, chunk_size, &digest, false).await;

    let wrong = sha256_hex(b"not the chunk");
    let uri = format!("/api/v1/image/chunk/0/upload?uploadID={upload_id}&digest={wrong}");
    let (status, value) = send(&app, upload_request(&uri, ALICE_TOKEN, &payload)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(value["error"].as_str().unwrap().contains("invalid digest"));

    let good = &digest;
    let uri = format!("/api/v1/image/chunk/0/upload?uploadID={upload_id}&digest={good}");
    let (status, _) = send(&app, upload_request(&uri, ALICE_TOKEN, &payload)).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn force_is_checked_at_start_not_merge() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());

    let chunk_size = 1024;
    let payload = chunk_payload(chunk_size);
    let digest = sha256_hex(&payload);

    // first publish
    let upload_id = start_session(&app, &payload, chunk_size, &digest, false).await;
    upload_chunk(&app, &upload_id, 0, &payload).await;
    let (status, _) = merge(&app, &upload_id).await;
    assert_eq!(status, StatusCode::OK);

    // restarting the same tag without force conflicts at start
    let n_chunks = 1;
    let uri = format!(
        "/api/v1/image/alice/img1/startChunkUpload?force=false&chunkSize={chunk_size}&nChunks={n_chunks}"
    );
    let body = create_body("alice", "img1", "v1", payload.len() as u64, &digest);
    let (status, _) = send(&app, json_request(Method::POST, &uri, ALICE_TOKEN, body)).await;
    assert_eq!(status, StatusCode::CONFLICT);

    // with force the whole flow, including merge, goes through
    let upload_id = start_session(&app, &payload, chunk_size, &digest, true).await;
    upload_chunk(&app, &upload_id, 0, &payload).await;
    let (status, _) = merge(&app, &upload_id).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn chunk_endpoints_require_authentication() {
    let dir = tempfile::tempdir().unwrap();
    let app = build_app(dir.path());
    let digest = sha256_hex(b"payload");

    let body = create_body("alice", "img1", "v1", 7, &digest);
    let request = axum::http::Request::builder()
        .method(Method::POST)
        .uri("/api/v1/image/alice/img1/startChunkUpload?chunkSize=1M&nChunks=1")
        .header("Content-Type", "application/json")
        .body(axum::body::Body::from(body.to_string()))
        .unwrap();
    let (status, _) = send(&app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // bob cannot push into alice's namespace
    let body = create_body("alice", "img1", "v1", 7, &digest);
    let (status, _) = send(
        &app,
        json_request(
            Method::POST,
            "/api/v1/image/alice/img1/startChunkUpload?chunkSize=1M&nChunks=1",
            BOB_TOKEN,
            body,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
