//! Filesystem-backed blob store. Chunk writes seek into the target file at
//! `idx * chunk_size`; completing a chunked write is a no-op because the
//! bytes are already in place.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{BlobReader, BlobStore, ChunkInfo};
use crate::digest::sha256_hex_file;
use crate::error::HubError;

pub struct LocalStore {
    base_dir: PathBuf,
}

impl LocalStore {
    pub fn new(base_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&base_dir)
            .with_context(|| format!("Failed to create store dir {}", base_dir.display()))?;
        Ok(Self { base_dir })
    }

    fn object_path(&self, name: &str) -> PathBuf {
        self.base_dir.join(name)
    }

    async fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create dir {}", parent.display()))?;
        }
        Ok(())
    }

    async fn verify_or_remove(&self, path: &Path, digest: &str) -> Result<()> {
        let actual = sha256_hex_file(path).await?;
        if actual != digest {
            let _ = tokio::fs::remove_file(path).await;
            return Err(HubError::digest_mismatch(digest, &actual).into());
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for LocalStore {
    async fn get(&self, name: &str) -> Result<BlobReader> {
        let path = self.object_path(name);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(HubError::NotFound(name.to_string()).into());
            }
            Err(err) => return Err(err.into()),
        };
        Ok(Box::new(file))
    }

    async fn delete(&self, name: &str, ignore_missing: bool) -> Result<()> {
        let path = self.object_path(name);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound && ignore_missing => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(HubError::NotFound(name.to_string()).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn put(&self, name: &str, digest: &str, src: &Path) -> Result<()> {
        let path = self.object_path(name);
        self.ensure_parent(&path).await?;
        tokio::fs::copy(src, &path)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        self.verify_or_remove(&path, digest).await
    }

    async fn put_with_chunk(
        &self,
        name: &str,
        digest: &str,
        size: u64,
        chunk_size: u64,
        src: &Path,
    ) -> Result<()> {
        let transaction_id = self.create_chunk_write(name).await?;
        let n_chunks = size.div_ceil(chunk_size);
        for idx in 0..n_chunks {
            let offset = idx * chunk_size;
            let mut info = ChunkInfo {
                idx: idx as u32,
                size: chunk_size.min(size - offset),
                chunk_size,
                digest: String::new(),
                receipt: None,
            };
            self.chunk_write_section(name, &transaction_id, &mut info, src, offset)
                .await?;
        }
        let path = self.object_path(name);
        self.verify_or_remove(&path, digest).await
    }

    async fn seek_read(&self, name: &str, offset: u64) -> Result<BlobReader> {
        let path = self.object_path(name);
        let mut file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(HubError::NotFound(name.to_string()).into());
            }
            Err(err) => return Err(err.into()),
        };
        file.seek(SeekFrom::Start(offset)).await?;
        Ok(Box::new(file))
    }

    async fn create_chunk_write(&self, _name: &str) -> Result<String> {
        // In-place writes need no transaction state; the id is only a handle.
        let raw: [u8; 16] = rand::thread_rng().gen();
        Ok(raw.iter().map(|b| format!("{b:02x}")).collect())
    }

    async fn chunk_write(
        &self,
        name: &str,
        transaction_id: &str,
        info: &mut ChunkInfo,
        data: &Path,
    ) -> Result<()> {
        self.chunk_write_section(name, transaction_id, info, data, 0)
            .await
    }

    async fn complete_chunk_write(
        &self,
        _name: &str,
        _transaction_id: &str,
        _chunks: &[ChunkInfo],
    ) -> Result<()> {
        Ok(())
    }

    async fn move_object(&self, src: &str, dest: &str) -> Result<()> {
        let src_path = self.object_path(src);
        let dest_path = self.object_path(dest);
        self.ensure_parent(&dest_path).await?;
        match tokio::fs::rename(&src_path, &dest_path).await {
            Ok(()) => Ok(()),
            Err(_) => {
                // rename fails across filesystems; fall back to copy+delete
                tokio::fs::copy(&src_path, &dest_path)
                    .await
                    .with_context(|| format!("Failed to copy {src} to {dest}"))?;
                tokio::fs::remove_file(&src_path).await?;
                Ok(())
            }
        }
    }

    async fn get_size(&self, name: &str) -> Result<u64> {
        let path = self.object_path(name);
        match tokio::fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Err(HubError::NotFound(name.to_string()).into())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn get_digest(&self, name: &str) -> Result<String> {
        let path = self.object_path(name);
        if !path.exists() {
            return Err(HubError::NotFound(name.to_string()).into());
        }
        sha256_hex_file(&path).await
    }
}

impl LocalStore {
    /// Writes `info.size` bytes from `data[data_offset..]` into the object
    /// at `info.idx * info.chunk_size`. Concurrent calls for distinct
    /// indices write disjoint ranges.
    async fn chunk_write_section(
        &self,
        name: &str,
        _transaction_id: &str,
        info: &mut ChunkInfo,
        data: &Path,
        data_offset: u64,
    ) -> Result<()> {
        let path = self.object_path(name);
        self.ensure_parent(&path).await?;

        let mut src = tokio::fs::File::open(data)
            .await
            .with_context(|| format!("Failed to open chunk source {}", data.display()))?;
        src.seek(SeekFrom::Start(data_offset)).await?;
        let mut limited = tokio::io::AsyncReadExt::take(src, info.size);

        let mut dest = tokio::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        dest.seek(SeekFrom::Start(info.idx as u64 * info.chunk_size))
            .await
            .context("Failed to seek to chunk offset")?;
        tokio::io::copy(&mut limited, &mut dest).await?;
        dest.flush().await?;
        Ok(())
    }
}
