use std::sync::Arc;

use crate::auth::Authenticator;
use crate::metadata::MetadataStore;
use crate::session::SessionStore;
use crate::storage::BlobStore;

/// Everything a handler needs, wired once at startup and read-only after.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn BlobStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub metadata: Arc<dyn MetadataStore>,
    pub auth: Arc<dyn Authenticator>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(
        store: Arc<dyn BlobStore>,
        sessions: Arc<dyn SessionStore>,
        metadata: Arc<dyn MetadataStore>,
        auth: Arc<dyn Authenticator>,
    ) -> Self {
        Self {
            store,
            sessions,
            metadata,
            auth,
            http: reqwest::Client::new(),
        }
    }
}
