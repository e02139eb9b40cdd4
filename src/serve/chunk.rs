//! The chunked upload state machine (`start → upload(i)×N → merge`) and the
//! random-access chunk download path.

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::collections::HashMap;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

use crate::api::models::{ImageCreateRequest, UploadStarted, FORMAT_RBD};
use crate::name::validate_repo_name;
use crate::serve::error::ApiError;
use crate::serve::handlers::{
    authenticate, descriptor_ref, descriptor_upsert, prepare_upload, query_bool, query_tag,
    repo_image, repo_with_perm, spool_upload_file, Perm,
};
use crate::serve::state::AppState;
use crate::session::SessionInfo;
use crate::storage::ChunkInfo;
use crate::units::parse_bytes;

const DEFAULT_DOWNLOAD_CHUNK_SIZE: &str = "50M";

pub async fn start_chunk_upload(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    axum::Json(request): axum::Json<ImageCreateRequest>,
) -> Result<Response, ApiError> {
    let force = query_bool(&params, "force");
    let chunk_size = params
        .get("chunkSize")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("empty chunkSize"))
        .and_then(|v| parse_bytes(v).map_err(|_| ApiError::bad_request("invalid chunk size")))?;
    let n_chunks: u32 = params
        .get("nChunks")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("empty nChunks"))
        .and_then(|v| {
            v.parse()
                .ok()
                .filter(|n| *n > 0)
                .ok_or_else(|| ApiError::bad_request(format!("invalid nChunks {v}")))
        })?;

    let descriptor = prepare_upload(&state, &headers, &username, &name, force, request).await?;
    let slice_name = descriptor_ref(&descriptor).slice_name();

    // The backend transaction id doubles as the public uploadID, which keeps
    // the staging object addressable from the session alone.
    let upload_id = state
        .store
        .create_chunk_write(&slice_name)
        .await
        .map_err(|err| ApiError::from_backend("create chunk write", err))?;

    let session = SessionInfo {
        digest: descriptor.digest.clone(),
        image: descriptor,
        force,
        chunk_size,
        n_chunks,
    };
    state
        .sessions
        .create(&upload_id, &session)
        .await
        .map_err(|err| ApiError::from_backend("create session", err))?;

    Ok(axum::Json(json!({ "data": UploadStarted { upload_id } })).into_response())
}

pub async fn upload_chunk(
    State(state): State<AppState>,
    Path(chunk_idx): Path<String>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers)
        .await?
        .ok_or_else(ApiError::unauthenticated)?;
    let upload_id = params
        .get("uploadID")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("empty uploadID"))?;
    let expected_digest = params.get("digest").cloned().unwrap_or_default();
    let chunk_idx: u32 = chunk_idx
        .parse()
        .map_err(|_| ApiError::bad_request("invalid chunk index"))?;

    let session = state
        .sessions
        .load(upload_id)
        .await
        .map_err(|err| ApiError::from_backend("load session", err))?
        .ok_or_else(|| ApiError::bad_request("you should start chunk upload first"))?;
    if chunk_idx >= session.n_chunks {
        return Err(ApiError::bad_request(format!(
            "Only need {} chunks, but got chunk index {}",
            session.n_chunks, chunk_idx
        )));
    }

    let (temp, size, digest) = spool_upload_file(multipart).await?;

    let slice_name = descriptor_ref(&session.image).slice_name();
    let mut info = ChunkInfo {
        idx: chunk_idx,
        size,
        chunk_size: session.chunk_size,
        digest: digest.clone(),
        receipt: None,
    };
    state
        .store
        .chunk_write(&slice_name, upload_id, &mut info, &temp)
        .await
        .map_err(|err| ApiError::from_backend("chunk write", err))?;

    if !expected_digest.is_empty() && expected_digest != digest {
        return Err(ApiError::bad_request(format!(
            "invalid digest: got: {digest}, user passed: {expected_digest}"
        )));
    }

    state
        .sessions
        .add_chunk(upload_id, &info)
        .await
        .map_err(|err| ApiError::from_backend("record chunk", err))?;

    Ok(axum::Json(json!({ "msg": "upload chunk successfully" })).into_response())
}

pub async fn merge_chunks(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    authenticate(&state, &headers)
        .await?
        .ok_or_else(ApiError::unauthenticated)?;
    let upload_id = params
        .get("uploadID")
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request("you must specify upload id"))?;

    let session = state
        .sessions
        .load(upload_id)
        .await
        .map_err(|err| ApiError::from_backend("load session", err))?
        .ok_or_else(|| ApiError::bad_request("you should start chunk upload first"))?;
    state
        .sessions
        .touch(upload_id)
        .await
        .map_err(|err| ApiError::from_backend("touch session", err))?;
    // The force flag is carried in the session but deliberately unused here;
    // the conflict gate lives at start time.
    let _force = session.force;

    let chunks = check_chunk_slices(&state, upload_id, session.n_chunks).await?;

    let reference = descriptor_ref(&session.image);
    let slice_name = reference.slice_name();
    let fullname = reference.fullname();

    state
        .store
        .complete_chunk_write(&slice_name, upload_id, &chunks)
        .await
        .map_err(|err| ApiError::from_backend("complete chunk write", err))?;

    let size = state
        .store
        .get_size(&slice_name)
        .await
        .map_err(|err| ApiError::from_backend("probe size", err))?;
    let digest = state
        .store
        .get_digest(&slice_name)
        .await
        .map_err(|err| ApiError::from_backend("probe digest", err))?;

    // A wrong digest fails the merge but keeps the session: the client may
    // re-upload the offending chunk and try again.
    if !session.digest.is_empty() && session.digest != digest {
        return Err(ApiError::bad_request(format!(
            "invalid digest: got: {digest}, user passed: {}",
            session.digest
        )));
    }

    state
        .store
        .move_object(&slice_name, &fullname)
        .await
        .map_err(|err| ApiError::from_backend("promote staging object", err))?;

    state
        .metadata
        .upsert(&descriptor_upsert(&session.image, size, &digest))
        .await
        .map_err(|err| ApiError::from_backend("commit image", err))?;

    if let Err(err) = state.sessions.delete(upload_id).await {
        tracing::error!(upload_id, error = ?err, "failed to delete upload session");
    }

    Ok(axum::Json(json!({ "msg": "merge success", "data": "" })).into_response())
}

/// The recorded chunk set must be exactly `{0, …, n_chunks-1}`: nothing
/// missing, nothing extra. Returns the chunks sorted by index.
async fn check_chunk_slices(
    state: &AppState,
    upload_id: &str,
    n_chunks: u32,
) -> Result<Vec<ChunkInfo>, ApiError> {
    let mut chunks = state
        .sessions
        .chunks(upload_id)
        .await
        .map_err(|err| ApiError::from_backend("load chunk records", err))?;

    if chunks.len() != n_chunks as usize {
        return Err(ApiError::bad_request(format!(
            "need {} chunks, but only got {} chunks",
            n_chunks,
            chunks.len()
        )));
    }
    chunks.sort_by_key(|chunk| chunk.idx);
    for (expected, chunk) in chunks.iter().enumerate() {
        if chunk.idx != expected as u32 {
            let present: Vec<u32> = chunks.iter().map(|c| c.idx).collect();
            return Err(ApiError::bad_request(format!(
                "miss chunks, current chunks {present:?}"
            )));
        }
    }
    Ok(chunks)
}

pub async fn download_chunk(
    State(state): State<AppState>,
    Path((username, name, chunk_idx)): Path<(String, String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tag = query_tag(&params);
    let chunk_idx: u64 = chunk_idx
        .parse()
        .map_err(|_| ApiError::bad_request("invalid chunk index"))?;
    validate_repo_name(&username, &name).map_err(|_| ApiError::bad_request("invalid name"))?;
    let chunk_size = params
        .get("chunkSize")
        .map(String::as_str)
        .unwrap_or(DEFAULT_DOWNLOAD_CHUNK_SIZE);
    let chunk_size = parse_bytes(chunk_size)
        .ok()
        .filter(|size| *size > 0)
        .ok_or_else(|| ApiError::bad_request("invalid chunk size"))?;

    let principal = authenticate(&state, &headers).await?;
    let repo = repo_with_perm(&state, &username, &name, Perm::Read, principal.as_ref()).await?;
    let image = repo_image(&state, &repo, &tag).await?;

    if image.format == FORMAT_RBD {
        return Err(ApiError::bad_request(
            "image created from system disk doesn't support download",
        ));
    }

    let offset = chunk_idx * chunk_size;
    if offset >= image.size {
        return Err(ApiError::bad_request(format!(
            "sliceIndex: {chunk_idx}, out of range"
        )));
    }

    let reference = image.reference(&repo);
    let reader = state
        .store
        .seek_read(&reference.fullname(), offset)
        .await
        .map_err(|err| ApiError::from_backend("seek read", err))?;

    let content_length = chunk_size.min(image.size - offset);
    let limited = reader.take(content_length);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={}", reference.slice_name()),
        )
        .header(header::CONTENT_LENGTH, content_length)
        .body(Body::from_stream(ReaderStream::new(limited)))
        .map_err(|err| ApiError::from_backend("build response", err.into()))
}
