//! Upload sessions: TTL-bounded coordination records keyed by the backend's
//! multipart transaction id. The session info and its per-chunk records
//! share one lifetime; the store's TTL is the only cleanup path.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::api::models::ImageCreateRequest;
use crate::storage::ChunkInfo;

pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Image descriptor with resolved user/name and the normalized tag.
    pub image: ImageCreateRequest,
    pub force: bool,
    #[serde(default)]
    pub chunk_size: u64,
    #[serde(default)]
    pub n_chunks: u32,
    /// Expected digest of the assembled blob; empty when unknown.
    #[serde(default)]
    pub digest: String,
}

#[async_trait]
pub trait SessionStore: Send + Sync + 'static {
    async fn create(&self, upload_id: &str, info: &SessionInfo) -> Result<()>;

    /// Returns the session, or `None` once expired or deleted.
    async fn load(&self, upload_id: &str) -> Result<Option<SessionInfo>>;

    /// Extends the TTL of the session and its chunk records.
    async fn touch(&self, upload_id: &str) -> Result<()>;

    /// Records one uploaded chunk. Re-adding an index overwrites the prior
    /// record (last writer wins).
    async fn add_chunk(&self, upload_id: &str, chunk: &ChunkInfo) -> Result<()>;

    async fn chunks(&self, upload_id: &str) -> Result<Vec<ChunkInfo>>;

    async fn delete(&self, upload_id: &str) -> Result<()>;
}

struct SessionEntry {
    info: SessionInfo,
    chunks: HashMap<u32, ChunkInfo>,
    expires_at: Instant,
}

/// In-process session store with lazy expiry.
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::with_ttl(SESSION_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    fn purge(sessions: &mut HashMap<String, SessionEntry>) {
        let now = Instant::now();
        sessions.retain(|_, entry| entry.expires_at > now);
    }
}

impl Default for MemorySessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, upload_id: &str, info: &SessionInfo) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        Self::purge(&mut sessions);
        sessions.insert(
            upload_id.to_string(),
            SessionEntry {
                info: info.clone(),
                chunks: HashMap::new(),
                expires_at: Instant::now() + self.ttl,
            },
        );
        Ok(())
    }

    async fn load(&self, upload_id: &str) -> Result<Option<SessionInfo>> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        Self::purge(&mut sessions);
        Ok(sessions.get(upload_id).map(|entry| entry.info.clone()))
    }

    async fn touch(&self, upload_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        if let Some(entry) = sessions.get_mut(upload_id) {
            entry.expires_at = Instant::now() + self.ttl;
        }
        Ok(())
    }

    async fn add_chunk(&self, upload_id: &str, chunk: &ChunkInfo) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        Self::purge(&mut sessions);
        if let Some(entry) = sessions.get_mut(upload_id) {
            entry.chunks.insert(chunk.idx, chunk.clone());
            entry.expires_at = Instant::now() + self.ttl;
        }
        Ok(())
    }

    async fn chunks(&self, upload_id: &str) -> Result<Vec<ChunkInfo>> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        Self::purge(&mut sessions);
        Ok(sessions
            .get(upload_id)
            .map(|entry| entry.chunks.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, upload_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().expect("session store poisoned");
        sessions.remove(upload_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::models::ImageCreateRequest;

    fn info(n_chunks: u32) -> SessionInfo {
        SessionInfo {
            image: ImageCreateRequest {
                username: "alice".into(),
                name: "img".into(),
                tag: "v1".into(),
                ..Default::default()
            },
            force: false,
            chunk_size: 1024,
            n_chunks,
            digest: String::new(),
        }
    }

    fn chunk(idx: u32, size: u64) -> ChunkInfo {
        ChunkInfo {
            idx,
            size,
            chunk_size: 1024,
            digest: String::new(),
            receipt: None,
        }
    }

    #[tokio::test]
    async fn session_and_chunks_share_lifetime() {
        let store = MemorySessionStore::new();
        store.create("u1", &info(2)).await.unwrap();
        store.add_chunk("u1", &chunk(0, 1024)).await.unwrap();
        store.add_chunk("u1", &chunk(1, 512)).await.unwrap();

        assert!(store.load("u1").await.unwrap().is_some());
        assert_eq!(store.chunks("u1").await.unwrap().len(), 2);

        store.delete("u1").await.unwrap();
        assert!(store.load("u1").await.unwrap().is_none());
        assert!(store.chunks("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn re_adding_an_index_overwrites() {
        let store = MemorySessionStore::new();
        store.create("u1", &info(1)).await.unwrap();
        store.add_chunk("u1", &chunk(0, 100)).await.unwrap();
        store.add_chunk("u1", &chunk(0, 200)).await.unwrap();

        let chunks = store.chunks("u1").await.unwrap();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 200);
    }

    #[tokio::test]
    async fn expired_sessions_disappear() {
        let store = MemorySessionStore::with_ttl(Duration::from_millis(10));
        store.create("u1", &info(1)).await.unwrap();
        store.add_chunk("u1", &chunk(0, 100)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(store.load("u1").await.unwrap().is_none());
        assert!(store.chunks("u1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_extends_the_ttl() {
        let store = MemorySessionStore::with_ttl(Duration::from_millis(40));
        store.create("u1", &info(1)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        store.touch("u1").await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;

        assert!(store.load("u1").await.unwrap().is_some());
    }
}
