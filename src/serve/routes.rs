use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;

use crate::serve::chunk;
use crate::serve::handlers;
use crate::serve::state::AppState;

const MAX_REQUEST_BODY_BYTES: usize = 8 * 1024 * 1024 * 1024;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/v1/image/{username}/{name}/startChunkUpload",
            post(chunk::start_chunk_upload),
        )
        .route("/api/v1/image/chunk/{chunk_idx}/upload", post(chunk::upload_chunk))
        .route("/api/v1/image/chunk/merge", post(chunk::merge_chunks))
        .route(
            "/api/v1/image/{username}/{name}/chunk/{chunk_idx}/download",
            get(chunk::download_chunk),
        )
        .route(
            "/api/v1/image/{username}/{name}/startUpload",
            post(handlers::start_upload),
        )
        .route("/api/v1/image/{username}/{name}/upload", post(handlers::upload_image))
        .route(
            "/api/v1/image/{username}/{name}/download",
            get(handlers::download_image),
        )
        .route("/api/v1/image/{username}/{name}/info", get(handlers::image_info))
        .route("/api/v1/image/{username}/{name}", delete(handlers::delete_image))
        .route("/api/v1/images", get(handlers::list_images))
        .route("/api/v1/repositories", get(handlers::list_repositories))
        .route(
            "/api/v1/repository/{username}/{name}/images",
            get(handlers::list_repo_images),
        )
        .route(
            "/api/v1/repository/{username}/{name}",
            delete(handlers::delete_repository),
        )
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .with_state(state)
}
