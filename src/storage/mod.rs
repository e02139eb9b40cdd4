//! Blob store abstraction: byte-addressable object CRUD plus native
//! multipart upload, seek reads and digest/size probes.

pub mod local;
pub mod s3;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncRead;

use crate::config::StorageConfig;

pub type BlobReader = Box<dyn AsyncRead + Send + Unpin>;

/// One uploaded part of a chunked write. `receipt` is whatever the backend
/// needs to re-identify the part at commit time (S3: part number + ETag);
/// it is opaque to everyone but the backend that wrote it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkInfo {
    pub idx: u32,
    pub size: u64,
    pub chunk_size: u64,
    #[serde(default)]
    pub digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt: Option<serde_json::Value>,
}

/// Capability set every backend implements. Writes that declare a digest
/// must leave no readable object behind on a mismatch; chunk writes across
/// distinct indices must be safe to run concurrently.
#[async_trait]
pub trait BlobStore: Send + Sync + 'static {
    /// Streams the full object. Fails with `HubError::NotFound` if absent.
    async fn get(&self, name: &str) -> Result<BlobReader>;

    async fn delete(&self, name: &str, ignore_missing: bool) -> Result<()>;

    /// Writes `src` under `name`; the stored bytes must hash to `digest`,
    /// otherwise the write fails with `HubError::InvalidDigest` and the
    /// object is not visible.
    async fn put(&self, name: &str, digest: &str, src: &Path) -> Result<()>;

    /// Same contract as `put`, but the upload is split into `chunk_size`
    /// parts written concurrently. Any part failure aborts the in-flight
    /// transaction.
    async fn put_with_chunk(
        &self,
        name: &str,
        digest: &str,
        size: u64,
        chunk_size: u64,
        src: &Path,
    ) -> Result<()>;

    /// Streams the object starting at `offset`.
    async fn seek_read(&self, name: &str, offset: u64) -> Result<BlobReader>;

    /// Opens a multipart-upload context and returns its transaction id.
    async fn create_chunk_write(&self, name: &str) -> Result<String>;

    /// Writes one part from the spooled file at `data`, filling
    /// `info.receipt`. Idempotent per `(transaction_id, idx)`.
    async fn chunk_write(
        &self,
        name: &str,
        transaction_id: &str,
        info: &mut ChunkInfo,
        data: &Path,
    ) -> Result<()>;

    /// Finalizes the object from parts ordered by index; afterwards the
    /// object is visible at `name`.
    async fn complete_chunk_write(
        &self,
        name: &str,
        transaction_id: &str,
        chunks: &[ChunkInfo],
    ) -> Result<()>;

    /// Atomic rename, or copy+delete where the backend has no rename.
    async fn move_object(&self, src: &str, dest: &str) -> Result<()>;

    async fn get_size(&self, name: &str) -> Result<u64>;

    async fn get_digest(&self, name: &str) -> Result<String>;
}

pub async fn build_store(config: &StorageConfig) -> Result<Arc<dyn BlobStore>> {
    match config {
        StorageConfig::Local { base_dir } => {
            Ok(Arc::new(local::LocalStore::new(base_dir.clone())?))
        }
        StorageConfig::S3 {
            endpoint,
            access_key,
            secret_key,
            bucket,
            base_dir,
        } => Ok(Arc::new(
            s3::S3Store::connect(endpoint, access_key, secret_key, bucket, base_dir).await?,
        )),
    }
}
