//! Single-shot upload/download, image info, listing and delete handlers,
//! plus the request plumbing shared with the chunk protocol.

use axum::body::Body;
use axum::extract::{Multipart, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use rand::Rng;
use serde_json::json;
use std::collections::HashMap;
use tokio_util::io::ReaderStream;

use crate::api::models::{ImageCreateRequest, UploadStarted, FORMAT_RBD};
use crate::auth::{can_read, can_upload, can_write, Principal};
use crate::digest::HashingWriter;
use crate::error::{as_hub_error, HubError};
use crate::metadata::{repository_info, Image, ImageFilter, ImageUpsert, Repository};
use crate::name::{normalize_tag, validate_repo_name, ImageRef, DEFAULT_TAG, PLACEHOLDER_TAG};
use crate::serve::error::ApiError;
use crate::serve::state::AppState;
use crate::session::SessionInfo;
use crate::units::{GIB, MIB};

/// Images below this take the single PutObject path; larger ones go through
/// the store's internal multipart write.
const CHUNK_THRESHOLD: u64 = 4 * GIB;
const INTERNAL_CHUNK_SIZE: u64 = 300 * MIB;

pub(crate) enum Perm {
    Read,
    Write,
}

pub(crate) async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Option<Principal>, ApiError> {
    state
        .auth
        .authenticate(headers)
        .await
        .map_err(|_| ApiError::unauthenticated())
}

/// Loads the repository and applies the permission rules; missing repos are
/// indistinguishable from images that never existed.
pub(crate) async fn repo_with_perm(
    state: &AppState,
    username: &str,
    name: &str,
    perm: Perm,
    principal: Option<&Principal>,
) -> Result<Repository, ApiError> {
    let repo = state
        .metadata
        .get_repo(username, name)
        .await
        .map_err(|err| ApiError::from_backend("get repo", err))?
        .ok_or_else(|| ApiError::not_found("image doesn't exist"))?;

    let allowed = match perm {
        Perm::Read => can_read(principal, &repo),
        Perm::Write => can_write(principal, &repo),
    };
    if !allowed {
        return Err(ApiError::forbidden());
    }
    Ok(repo)
}

pub(crate) async fn repo_image(
    state: &AppState,
    repo: &Repository,
    tag: &str,
) -> Result<Image, ApiError> {
    state
        .metadata
        .get_image(repo, tag)
        .await
        .map_err(|err| ApiError::from_backend("get image", err))?
        .ok_or_else(|| ApiError::not_found("image doesn't exist"))
}

pub(crate) fn query_bool(params: &HashMap<String, String>, key: &str) -> bool {
    params
        .get(key)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

pub(crate) fn query_tag(params: &HashMap<String, String>) -> String {
    match params.get("tag") {
        Some(tag) if !tag.is_empty() => tag.clone(),
        _ => DEFAULT_TAG.to_string(),
    }
}

pub(crate) fn new_upload_id() -> String {
    let raw: [u8; 16] = rand::thread_rng().gen();
    raw.iter().map(|b| format!("{b:02x}")).collect()
}

pub(crate) fn descriptor_ref(image: &ImageCreateRequest) -> ImageRef {
    ImageRef::new(&image.username, &image.name, &image.tag)
}

pub(crate) fn descriptor_upsert(
    image: &ImageCreateRequest,
    size: u64,
    digest: &str,
) -> ImageUpsert {
    ImageUpsert {
        username: image.username.clone(),
        name: image.name.clone(),
        private: image.private,
        tag: image.tag.clone(),
        labels: image.labels.clone(),
        size,
        digest: digest.to_string(),
        format: image.format.clone(),
        os: image.os.clone(),
        description: image.description.clone(),
    }
}

/// Drains the multipart `file` field into a temp file, hashing on the way.
pub(crate) async fn spool_upload_file(
    mut multipart: Multipart,
) -> Result<(tempfile::TempPath, u64, String), ApiError> {
    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::bad_request(format!("get upload file failed: {err}")))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let temp = tempfile::NamedTempFile::new()
            .map_err(|err| ApiError::from_backend("create temp file", err.into()))?
            .into_temp_path();
        let mut writer = HashingWriter::create(&temp)
            .await
            .map_err(|err| ApiError::from_backend("open temp file", err))?;
        loop {
            let chunk = field
                .chunk()
                .await
                .map_err(|err| ApiError::bad_request(format!("bad upload stream: {err}")))?;
            let Some(chunk) = chunk else { break };
            writer
                .write(&chunk)
                .await
                .map_err(|err| ApiError::from_backend("spool upload", err))?;
        }
        let (size, digest) = writer
            .finish()
            .await
            .map_err(|err| ApiError::from_backend("finish spool", err))?;
        return Ok((temp, size, digest));
    }
    Err(ApiError::bad_request("missing file form field"))
}

/// Prepares an upload of `user/name`: authenticated caller, namespace
/// ownership, valid request body and conflict check. Returns the descriptor
/// with resolved identity and normalized tag.
pub(crate) async fn prepare_upload(
    state: &AppState,
    headers: &HeaderMap,
    username: &str,
    name: &str,
    force: bool,
    mut request: ImageCreateRequest,
) -> Result<ImageCreateRequest, ApiError> {
    request
        .check()
        .map_err(|err| ApiError::bad_request(err.to_string()))?;
    validate_repo_name(username, name).map_err(|_| ApiError::bad_request("invalid name"))?;

    let principal = authenticate(state, headers)
        .await?
        .ok_or_else(ApiError::unauthenticated)?;
    if !can_upload(&principal, username) {
        return Err(ApiError::forbidden());
    }

    request.username = username.to_string();
    request.name = name.to_string();
    request.tag = normalize_tag(&request.tag, &request.digest);

    if let Some(repo) = state
        .metadata
        .get_repo(username, name)
        .await
        .map_err(|err| ApiError::from_backend("get repo", err))?
    {
        let existing = state
            .metadata
            .get_image(&repo, &request.tag)
            .await
            .map_err(|err| ApiError::from_backend("get image", err))?;
        if existing.is_some() && !force {
            return Err(ApiError::conflict(
                "Upload failed, image already exists. You can use force upload to overwrite.",
            ));
        }
    }
    Ok(request)
}

/// Writes a spooled image to the blob store (single or internally chunked by
/// size) and commits the metadata rows.
pub(crate) async fn write_image_to_store(
    state: &AppState,
    descriptor: &ImageCreateRequest,
    data: &std::path::Path,
    size: u64,
) -> Result<(), ApiError> {
    let fullname = descriptor_ref(descriptor).fullname();
    let result = if size < CHUNK_THRESHOLD {
        state.store.put(&fullname, &descriptor.digest, data).await
    } else {
        state
            .store
            .put_with_chunk(&fullname, &descriptor.digest, size, INTERNAL_CHUNK_SIZE, data)
            .await
    };
    if let Err(err) = result {
        if matches!(as_hub_error(&err), Some(HubError::InvalidDigest { .. })) {
            return Err(ApiError::bad_request(err.to_string()));
        }
        return Err(ApiError::from_backend("write image", err));
    }

    state
        .metadata
        .upsert(&descriptor_upsert(descriptor, size, &descriptor.digest))
        .await
        .map_err(|err| ApiError::from_backend("commit image", err))?;
    Ok(())
}

pub async fn start_upload(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    axum::Json(request): axum::Json<ImageCreateRequest>,
) -> Result<Response, ApiError> {
    let force = query_bool(&params, "force");
    let descriptor = prepare_upload(&state, &headers, &username, &name, force, request).await?;

    if !descriptor.url.is_empty() {
        process_remote_image(&state, descriptor).await?;
        return Ok(axum::Json(json!({
            "msg": "upload remote file successfully",
            "data": { "uploadID": "" },
        }))
        .into_response());
    }

    let upload_id = new_upload_id();
    let session = SessionInfo {
        digest: descriptor.digest.clone(),
        image: descriptor,
        force,
        chunk_size: 0,
        n_chunks: 0,
    };
    state
        .sessions
        .create(&upload_id, &session)
        .await
        .map_err(|err| ApiError::from_backend("create session", err))?;

    Ok(axum::Json(json!({ "data": UploadStarted { upload_id } })).into_response())
}

pub async fn upload_image(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
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
    validate_repo_name(&username, &name).map_err(|_| ApiError::bad_request("invalid name"))?;

    let session = state
        .sessions
        .load(upload_id)
        .await
        .map_err(|err| ApiError::from_backend("load session", err))?
        .ok_or_else(|| ApiError::bad_request("you should start image upload first"))?;

    let (temp, size, _digest) = spool_upload_file(multipart).await?;
    write_image_to_store(&state, &session.image, &temp, size).await?;

    Ok(axum::Json(json!({ "msg": "upload image successfully" })).into_response())
}

/// `startUpload` with a remote URL: the server pulls the file itself through
/// a tee-hash, verifies it against the declared size/digest and commits in
/// the same request.
async fn process_remote_image(
    state: &AppState,
    mut descriptor: ImageCreateRequest,
) -> Result<(), ApiError> {
    let url = descriptor.url.clone();
    let resp = state
        .http
        .get(&url)
        .send()
        .await
        .map_err(|_| ApiError::bad_request(format!("failed to download remote file {url}")))?;
    if !resp.status().is_success() {
        return Err(ApiError::bad_request("failed to download url"));
    }

    let temp = tempfile::NamedTempFile::new()
        .map_err(|err| ApiError::from_backend("create temp file", err.into()))?
        .into_temp_path();
    let mut writer = HashingWriter::create(&temp)
        .await
        .map_err(|err| ApiError::from_backend("open temp file", err))?;
    let mut resp = resp;
    while let Some(chunk) = resp
        .chunk()
        .await
        .map_err(|_| ApiError::bad_request("failed to download url"))?
    {
        writer
            .write(&chunk)
            .await
            .map_err(|err| ApiError::from_backend("spool remote file", err))?;
    }
    let (size, digest) = writer
        .finish()
        .await
        .map_err(|err| ApiError::from_backend("finish spool", err))?;

    if descriptor.size == 0 {
        descriptor.size = size;
    }
    if descriptor.size != size {
        return Err(ApiError::bad_request("size mismatch"));
    }
    if descriptor.digest.is_empty() {
        descriptor.digest = digest.clone();
    }
    if descriptor.digest != digest {
        return Err(ApiError::bad_request("digest mismatch"));
    }
    if descriptor.tag == PLACEHOLDER_TAG {
        descriptor.tag = digest[..10].to_string();
    }

    write_image_to_store(state, &descriptor, &temp, size).await
}

pub async fn download_image(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tag = query_tag(&params);
    validate_repo_name(&username, &name).map_err(|_| ApiError::bad_request("invalid name"))?;

    let principal = authenticate(&state, &headers).await?;
    let repo = repo_with_perm(&state, &username, &name, Perm::Read, principal.as_ref()).await?;
    let image = repo_image(&state, &repo, &tag).await?;

    if image.format == FORMAT_RBD {
        return Err(ApiError::bad_request(
            "image created from system disk doesn't support download",
        ));
    }

    let fullname = image.reference(&repo).fullname();
    let reader = state
        .store
        .get(&fullname)
        .await
        .map_err(|err| ApiError::from_backend("get image file", err))?;

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .header(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename={fullname}"),
        )
        .header(header::CONTENT_LENGTH, image.size)
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|err| ApiError::from_backend("build response", err.into()))
}

pub async fn image_info(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tag = query_tag(&params);
    validate_repo_name(&username, &name).map_err(|_| ApiError::bad_request("invalid name"))?;

    let principal = authenticate(&state, &headers).await?;
    let repo = repo_with_perm(&state, &username, &name, Perm::Read, principal.as_ref()).await?;
    let image = repo_image(&state, &repo, &tag).await?;

    Ok(axum::Json(json!({ "msg": "success", "data": image.info(&repo) })).into_response())
}

pub async fn delete_image(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let tag = query_tag(&params);
    validate_repo_name(&username, &name).map_err(|_| ApiError::bad_request("invalid name"))?;

    let principal = authenticate(&state, &headers).await?;
    let repo = repo_with_perm(&state, &username, &name, Perm::Write, principal.as_ref()).await?;
    let image = repo_image(&state, &repo, &tag).await?;

    let fullname = image.reference(&repo).fullname();
    if let Err(err) = state.store.delete(&fullname, true).await {
        tracing::error!(fullname, error = ?err, "failed to remove image from storage");
    }
    state
        .metadata
        .delete_image(repo.id, &image.tag)
        .await
        .map_err(|err| ApiError::from_backend("delete image", err))?;

    Ok(axum::Json(json!({ "msg": "delete image successfully" })).into_response())
}

pub async fn delete_repository(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    validate_repo_name(&username, &name).map_err(|_| ApiError::bad_request("invalid name"))?;

    let principal = authenticate(&state, &headers).await?;
    let repo = repo_with_perm(&state, &username, &name, Perm::Write, principal.as_ref()).await?;

    let images = state
        .metadata
        .repo_images(repo.id)
        .await
        .map_err(|err| ApiError::from_backend("list repo images", err))?;
    for image in &images {
        let fullname = image.reference(&repo).fullname();
        if let Err(err) = state.store.delete(&fullname, true).await {
            tracing::error!(fullname, error = ?err, "failed to remove image from storage");
        }
    }
    state
        .metadata
        .delete_repository(repo.id)
        .await
        .map_err(|err| ApiError::from_backend("delete repository", err))?;

    Ok(axum::Json(json!({ "msg": "delete success", "data": "" })).into_response())
}

pub async fn list_repo_images(
    State(state): State<AppState>,
    Path((username, name)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    validate_repo_name(&username, &name).map_err(|_| ApiError::bad_request("invalid name"))?;

    let principal = authenticate(&state, &headers).await?;
    let repo = repo_with_perm(&state, &username, &name, Perm::Read, principal.as_ref()).await?;

    let images = state
        .metadata
        .repo_images(repo.id)
        .await
        .map_err(|err| ApiError::from_backend("list repo images", err))?;
    let infos: Vec<_> = images.iter().map(|img| img.info(&repo)).collect();
    Ok(axum::Json(json!({ "data": infos })).into_response())
}

fn parse_page(params: &HashMap<String, String>) -> Result<(usize, usize), ApiError> {
    let page = params
        .get("page")
        .map(|v| v.parse::<i64>())
        .transpose()
        .map_err(|_| ApiError::bad_request("invalid page or page size"))?
        .unwrap_or(1);
    let page_size = params
        .get("pageSize")
        .map(|v| v.parse::<i64>())
        .transpose()
        .map_err(|_| ApiError::bad_request("invalid page or page size"))?
        .unwrap_or(10);
    if page <= 0 || page_size <= 0 {
        return Err(ApiError::bad_request("invalid page or page size"));
    }
    Ok((page as usize, page_size as usize))
}

pub async fn list_images(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (page, page_size) = parse_page(&params)?;
    let keyword = params.get("keyword").cloned().unwrap_or_default();
    let mut username = params.get("username").cloned().unwrap_or_default();

    let principal = authenticate(&state, &headers).await?;
    if principal.is_none() && username.is_empty() {
        return Err(ApiError::bad_request(
            "you need login or provide a username as query parameter.",
        ));
    }
    if username.is_empty() {
        username = principal.as_ref().map(|p| p.username.clone()).unwrap_or_default();
    }
    let include_private = principal
        .as_ref()
        .map(|p| p.admin || p.username == username)
        .unwrap_or(false);

    let (entries, total) = state
        .metadata
        .list_images(&ImageFilter {
            username,
            keyword,
            page,
            page_size,
            include_private,
        })
        .await
        .map_err(|err| ApiError::from_backend("list images", err))?;
    let infos: Vec<_> = entries.iter().map(|(repo, img)| img.info(repo)).collect();
    Ok(axum::Json(json!({ "data": infos, "total": total })).into_response())
}

pub async fn list_repositories(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let (page, page_size) = parse_page(&params)?;
    let mut username = params.get("username").cloned().unwrap_or_default();

    let principal = authenticate(&state, &headers).await?;
    if principal.is_none() && username.is_empty() {
        return Err(ApiError::bad_request(
            "you need login or provide a username as query parameter.",
        ));
    }
    if username.is_empty() {
        username = principal.as_ref().map(|p| p.username.clone()).unwrap_or_default();
    }
    let include_private = principal
        .as_ref()
        .map(|p| p.admin || p.username == username)
        .unwrap_or(false);

    let repos = state
        .metadata
        .list_repositories(&username, include_private, page, page_size)
        .await
        .map_err(|err| ApiError::from_backend("list repositories", err))?;
    let infos: Vec<_> = repos.iter().map(repository_info).collect();
    Ok(axum::Json(json!({ "data": infos })).into_response())
}
