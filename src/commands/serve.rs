use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use crate::auth::TokenAuthenticator;
use crate::config::ServeConfig;
use crate::metadata::{CachedMetadataStore, MemoryMetadataStore};
use crate::serve::routes::build_router;
use crate::serve::state::AppState;
use crate::session::MemorySessionStore;
use crate::storage::build_store;

pub async fn execute(config_path: PathBuf) -> Result<()> {
    let config = ServeConfig::load(&config_path)?;

    let store = build_store(&config.storage).await?;
    let sessions = Arc::new(MemorySessionStore::new());
    let metadata = Arc::new(CachedMetadataStore::new(Arc::new(
        MemoryMetadataStore::new(),
    )));
    let auth = Arc::new(TokenAuthenticator::new(&config.users));

    let state = AppState::new(store, sessions, metadata, auth);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen))?;
    tracing::info!(listen = %config.listen, "vmhub serving");
    axum::serve(listener, router).await.context("server exited")
}
