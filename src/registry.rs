//! Local image registry: the on-disk tree `<base>/image/<user>/<name>:<tag>.img`
//! plus an embedded key/value sidecar holding per-image metadata. The sidecar
//! is authoritative about the expected digest; the file is authoritative
//! about the bytes.

use anyhow::{Context, Result};
use redb::{Database, TableDefinition};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncRead;

use crate::digest::sha256_hex_file;
use crate::name::{strip_digest_prefix, ImageRef};

const IMAGES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("images");
const METADATA_DB_NAME: &str = "metadata.db";
const IMAGE_DIR_NAME: &str = "image";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct LocalMetadata {
    pub digest: String,
    pub size: u64,
    #[serde(default)]
    pub actual_size: u64,
    #[serde(default)]
    pub virtual_size: u64,
}

#[derive(Clone)]
pub struct LocalRegistry {
    base_dir: PathBuf,
    db: Arc<Database>,
}

impl LocalRegistry {
    pub fn open(base_dir: &Path) -> Result<Self> {
        let image_dir = base_dir.join(IMAGE_DIR_NAME);
        std::fs::create_dir_all(&image_dir)
            .with_context(|| format!("Failed to create dir {}", image_dir.display()))?;

        let db = Database::create(base_dir.join(METADATA_DB_NAME))
            .context("Failed to open metadata.db")?;
        let write = db.begin_write()?;
        write.open_table(IMAGES_TABLE)?;
        write.commit()?;

        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            db: Arc::new(db),
        })
    }

    pub fn image_path(&self, reference: &ImageRef) -> PathBuf {
        self.base_dir
            .join(IMAGE_DIR_NAME)
            .join(&reference.user)
            .join(format!("{}:{}.img", reference.name, reference.tag))
    }

    /// Reassembly buffer used while a chunked pull is in flight.
    pub fn slice_path(&self, reference: &ImageRef) -> PathBuf {
        self.base_dir
            .join(IMAGE_DIR_NAME)
            .join(&reference.user)
            .join(format!("__slice_{}:{}.img", reference.name, reference.tag))
    }

    pub fn slice_part_path(&self, reference: &ImageRef, idx: u32) -> PathBuf {
        self.base_dir.join(IMAGE_DIR_NAME).join(&reference.user).join(format!(
            "__slice_{}:{}-{}.img",
            reference.name, reference.tag, idx
        ))
    }

    pub fn exists(&self, reference: &ImageRef) -> bool {
        self.image_path(reference).exists()
    }

    /// Loads the sidecar record for an image whose file exists; an image
    /// present on disk but unknown to the sidecar is probed and recorded.
    pub async fn load(&self, reference: &ImageRef) -> Result<Option<LocalMetadata>> {
        if !self.exists(reference) {
            return Ok(None);
        }
        if let Some(meta) = self.read_record(&reference.fullname())? {
            return Ok(Some(meta));
        }
        self.refresh(reference).await.map(Some)
    }

    /// Re-probes the local file (size, digest, qcow2 sizes) and rewrites the
    /// sidecar record.
    pub async fn refresh(&self, reference: &ImageRef) -> Result<LocalMetadata> {
        let path = self.image_path(reference);
        let size = tokio::fs::metadata(&path)
            .await
            .with_context(|| format!("Failed to stat {}", path.display()))?
            .len();
        let digest = sha256_hex_file(&path).await?;
        let (actual_size, virtual_size) = probe_image_sizes(&path).await.unwrap_or_default();

        let meta = LocalMetadata {
            digest,
            size,
            actual_size,
            virtual_size,
        };
        self.write_record(&reference.fullname(), &meta)?;
        Ok(meta)
    }

    /// Streams `reader` into the canonical file and refreshes the sidecar.
    pub async fn write_stream<R>(&self, reference: &ImageRef, reader: &mut R) -> Result<LocalMetadata>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let path = self.image_path(reference);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&path)
            .await
            .with_context(|| format!("Failed to create {}", path.display()))?;
        tokio::io::copy(reader, &mut file).await?;
        drop(file);
        self.refresh(reference).await
    }

    /// Atomically replaces the canonical file with `src` (same filesystem)
    /// and refreshes the sidecar.
    pub async fn promote(&self, reference: &ImageRef, src: &Path) -> Result<LocalMetadata> {
        let path = self.image_path(reference);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(src, &path)
            .await
            .with_context(|| format!("Failed to promote {} to {}", src.display(), path.display()))?;
        self.refresh(reference).await
    }

    /// `Cached(img)` holds when the file exists and its recorded digest
    /// matches the expected one.
    pub async fn cached(&self, reference: &ImageRef, expected_digest: &str) -> Result<bool> {
        if expected_digest.is_empty() {
            return Ok(false);
        }
        match self.load(reference).await? {
            Some(meta) => {
                Ok(strip_digest_prefix(expected_digest) == strip_digest_prefix(&meta.digest))
            }
            None => Ok(false),
        }
    }

    pub async fn remove(&self, reference: &ImageRef) -> Result<()> {
        self.delete_record(&reference.fullname())?;
        match tokio::fs::remove_file(self.image_path(reference)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Walks the image tree and returns every canonical image reference.
    pub fn list_local(&self) -> Result<Vec<ImageRef>> {
        let image_dir = self.base_dir.join(IMAGE_DIR_NAME);
        let mut refs = Vec::new();
        for user_entry in std::fs::read_dir(&image_dir)? {
            let user_entry = user_entry?;
            if !user_entry.file_type()?.is_dir() {
                continue;
            }
            let user = user_entry.file_name().to_string_lossy().to_string();
            for file_entry in std::fs::read_dir(user_entry.path())? {
                let file_name = file_entry?.file_name().to_string_lossy().to_string();
                let Some(stem) = file_name.strip_suffix(".img") else {
                    continue;
                };
                if stem.starts_with("__slice_") {
                    continue;
                }
                let Some((name, tag)) = stem.split_once(':') else {
                    continue;
                };
                refs.push(ImageRef::new(&user, name, tag));
            }
        }
        refs.sort_by_key(|r| r.fullname());
        Ok(refs)
    }

    fn read_record(&self, fullname: &str) -> Result<Option<LocalMetadata>> {
        let read = self.db.begin_read()?;
        let table = read.open_table(IMAGES_TABLE)?;
        match table.get(fullname)? {
            Some(guard) => Ok(Some(serde_json::from_slice(guard.value())?)),
            None => Ok(None),
        }
    }

    fn write_record(&self, fullname: &str, meta: &LocalMetadata) -> Result<()> {
        let encoded = serde_json::to_vec(meta)?;
        let write = self.db.begin_write()?;
        {
            let mut table = write.open_table(IMAGES_TABLE)?;
            table.insert(fullname, encoded.as_slice())?;
        }
        write.commit()?;
        Ok(())
    }

    fn delete_record(&self, fullname: &str) -> Result<()> {
        let write = self.db.begin_write()?;
        {
            let mut table = write.open_table(IMAGES_TABLE)?;
            table.remove(fullname)?;
        }
        write.commit()?;
        Ok(())
    }
}

/// Advisory qcow2 probe; a missing or failing `qemu-img` never affects
/// digest bookkeeping.
async fn probe_image_sizes(path: &Path) -> Option<(u64, u64)> {
    let output = tokio::process::Command::new("qemu-img")
        .args(["info", "--output", "json"])
        .arg(path)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let info: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    Some((
        info.get("actual-size")?.as_u64()?,
        info.get("virtual-size")?.as_u64()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::digest::sha256_hex;

    async fn registry() -> (tempfile::TempDir, LocalRegistry) {
        let dir = tempfile::tempdir().unwrap();
        let registry = LocalRegistry::open(dir.path()).unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn write_stream_records_metadata() {
        let (_dir, registry) = registry().await;
        let reference = ImageRef::new("alice", "img", "v1");
        let payload = b"image payload".to_vec();

        let meta = registry
            .write_stream(&reference, &mut payload.as_slice())
            .await
            .unwrap();

        assert_eq!(meta.size, payload.len() as u64);
        assert_eq!(meta.digest, sha256_hex(&payload));
        assert!(registry.exists(&reference));

        let loaded = registry.load(&reference).await.unwrap().unwrap();
        assert_eq!(loaded, meta);
    }

    #[tokio::test]
    async fn cached_tracks_digest_equality() {
        let (_dir, registry) = registry().await;
        let reference = ImageRef::new("alice", "img", "v1");
        let payload = b"cached bytes".to_vec();
        let digest = sha256_hex(&payload);

        assert!(!registry.cached(&reference, &digest).await.unwrap());

        registry
            .write_stream(&reference, &mut payload.as_slice())
            .await
            .unwrap();
        assert!(registry.cached(&reference, &digest).await.unwrap());
        assert!(registry
            .cached(&reference, &format!("sha256:{digest}"))
            .await
            .unwrap());
        assert!(!registry.cached(&reference, &sha256_hex(b"other")).await.unwrap());
        assert!(!registry.cached(&reference, "").await.unwrap());
    }

    #[tokio::test]
    async fn file_without_sidecar_record_is_probed_on_load() {
        let (_dir, registry) = registry().await;
        let reference = ImageRef::new("_", "stray", "v1");
        let path = registry.image_path(&reference);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, b"stray bytes").await.unwrap();

        let meta = registry.load(&reference).await.unwrap().unwrap();
        assert_eq!(meta.digest, sha256_hex(b"stray bytes"));
    }

    #[tokio::test]
    async fn promote_replaces_canonical_file() {
        let (dir, registry) = registry().await;
        let reference = ImageRef::new("alice", "img", "v1");
        registry
            .write_stream(&reference, &mut b"old".as_slice())
            .await
            .unwrap();

        let staged = dir.path().join("image/alice/__slice_img:v1.img");
        tokio::fs::write(&staged, b"new contents").await.unwrap();
        let meta = registry.promote(&reference, &staged).await.unwrap();

        assert_eq!(meta.digest, sha256_hex(b"new contents"));
        assert!(!staged.exists());
    }

    #[tokio::test]
    async fn list_local_skips_slice_files() {
        let (_dir, registry) = registry().await;
        registry
            .write_stream(&ImageRef::new("alice", "a", "v1"), &mut b"a".as_slice())
            .await
            .unwrap();
        registry
            .write_stream(&ImageRef::new("_", "b", "latest"), &mut b"b".as_slice())
            .await
            .unwrap();
        let slice = registry.slice_path(&ImageRef::new("alice", "a", "v1"));
        tokio::fs::write(&slice, b"partial").await.unwrap();

        let refs = registry.list_local().unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].fullname(), "_/b:latest");
        assert_eq!(refs[1].fullname(), "alice/a:v1");
    }

    #[tokio::test]
    async fn remove_deletes_file_and_record() {
        let (_dir, registry) = registry().await;
        let reference = ImageRef::new("alice", "img", "v1");
        registry
            .write_stream(&reference, &mut b"bytes".as_slice())
            .await
            .unwrap();

        registry.remove(&reference).await.unwrap();
        assert!(!registry.exists(&reference));
        assert!(registry.load(&reference).await.unwrap().is_none());
        // removing twice is fine
        registry.remove(&reference).await.unwrap();
    }
}
