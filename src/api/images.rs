//! Client transfer driver: push/pull with bounded worker pools, a shared
//! retry budget for chunk uploads and exponential backoff for chunk
//! downloads.

use anyhow::{anyhow, bail, Context, Result};
use futures_util::TryStreamExt;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::api::client::ApiClient;
use crate::api::models::{ImageCreateRequest, ImageInfo, OsInfo, UploadStarted, FORMAT_RBD};
use crate::error::HubError;
use crate::name::{ImageRef, DEFAULT_TAG};
use crate::registry::LocalRegistry;
use crate::transfer::{is_transient, retry_with_backoff, ExponentialBackoff};
use crate::units::{chunk_count, GIB, MIB};

pub const DEFAULT_CHUNK_SIZE: u64 = 100 * MIB;
pub const DEFAULT_THRESHOLD: u64 = GIB;

const TRANSFER_WORKERS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullPolicy {
    Always,
    IfNotPresent,
    Never,
}

/// An image as the client sees it: identity plus whatever metadata is known
/// from the server or the local sidecar.
#[derive(Debug, Clone)]
pub struct LocalImage {
    pub reference: ImageRef,
    pub size: u64,
    pub digest: String,
    pub format: String,
    pub os: OsInfo,
    pub private: bool,
    pub description: String,
    pub labels: HashMap<String, String>,
    /// Remote file for server-side pulls; empty for local pushes.
    pub url: String,
}

impl LocalImage {
    pub fn new(reference: ImageRef) -> Self {
        Self {
            reference,
            size: 0,
            digest: String::new(),
            format: String::new(),
            os: OsInfo::default(),
            private: false,
            description: String::new(),
            labels: HashMap::new(),
            url: String::new(),
        }
    }

    pub fn from_info(info: &ImageInfo) -> Self {
        Self {
            reference: ImageRef::new(&info.username, &info.name, &info.tag),
            size: info.size,
            digest: info.digest.clone(),
            format: info.format.clone(),
            os: info.os.clone(),
            private: info.private,
            description: info.description.clone(),
            labels: HashMap::new(),
            url: String::new(),
        }
    }

    fn create_request(&self) -> ImageCreateRequest {
        ImageCreateRequest {
            username: self.reference.user.clone(),
            name: self.reference.name.clone(),
            tag: self.reference.tag.clone(),
            labels: self.labels.clone(),
            size: self.size,
            private: self.private,
            digest: self.digest.clone(),
            format: self.format.clone(),
            os: self.os.clone(),
            description: self.description.clone(),
            url: self.url.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ImagesApi {
    api: ApiClient,
    registry: LocalRegistry,
    chunk_size: u64,
    threshold: u64,
}

struct ChunkResult {
    idx: u32,
    result: Result<()>,
}

impl ImagesApi {
    pub fn new(api: ApiClient, base_dir: &Path) -> Result<Self> {
        Ok(Self {
            api,
            registry: LocalRegistry::open(base_dir)?,
            chunk_size: DEFAULT_CHUNK_SIZE,
            threshold: DEFAULT_THRESHOLD,
        })
    }

    pub fn with_limits(mut self, chunk_size: u64, threshold: u64) -> Self {
        self.chunk_size = chunk_size;
        self.threshold = threshold;
        self
    }

    pub fn registry(&self) -> &LocalRegistry {
        &self.registry
    }

    pub async fn push(&self, image: &mut LocalImage, force: bool) -> Result<()> {
        if image.url.is_empty() {
            let path = self.registry.image_path(&image.reference);
            image.size = tokio::fs::metadata(&path)
                .await
                .with_context(|| format!("local image {} not found", path.display()))?
                .len();
            let meta = self
                .registry
                .load(&image.reference)
                .await?
                .ok_or_else(|| anyhow!("no local metadata for {}", image.reference))?;
            image.digest = meta.digest;
        }

        if image.size > self.threshold {
            self.push_chunked(image, force).await
        } else {
            self.push_single(image, force).await
        }
    }

    async fn push_single(&self, image: &LocalImage, force: bool) -> Result<()> {
        let endpoint = format!(
            "image/{}/{}/startUpload",
            image.reference.user, image.reference.name
        );
        let body = image.create_request();
        let started = retry_with_backoff(
            "start upload",
            ExponentialBackoff::brief(),
            is_transient,
            || async {
                let response = self
                    .api
                    .post(&endpoint)
                    .query(&[("force", force.to_string())])
                    .json(&body)
                    .send()
                    .await
                    .map_err(HubError::from)?;
                let (started, _) = self.api.parse_envelope::<UploadStarted>(response).await?;
                Ok(started)
            },
        )
        .await?;
        let upload_id = started.map(|s| s.upload_id).unwrap_or_default();

        // A remote-URL push is processed entirely inside startUpload; the
        // empty uploadID says there is nothing left to send.
        if !image.url.is_empty() {
            return Ok(());
        }

        let upload_endpoint = format!(
            "image/{}/{}/upload",
            image.reference.user, image.reference.name
        );
        let path = self.registry.image_path(&image.reference);
        let size = image.size;
        let response = self
            .api
            .transfer_post(&upload_endpoint)
            .query(&[("uploadID", upload_id.as_str())])
            .multipart(file_form(&path, 0, size).await?)
            .send()
            .await
            .context("Failed to upload image")?;
        self.api.expect_ok(response).await
    }

    async fn push_chunked(&self, image: &LocalImage, force: bool) -> Result<()> {
        let n_chunks = chunk_count(image.size, self.chunk_size);
        let endpoint = format!(
            "image/{}/{}/startChunkUpload",
            image.reference.user, image.reference.name
        );
        let body = image.create_request();
        let started = retry_with_backoff(
            "start chunk upload",
            ExponentialBackoff::brief(),
            is_transient,
            || async {
                let response = self
                    .api
                    .post(&endpoint)
                    .query(&[
                        ("force", force.to_string()),
                        ("chunkSize", self.chunk_size.to_string()),
                        ("nChunks", n_chunks.to_string()),
                    ])
                    .json(&body)
                    .send()
                    .await
                    .map_err(HubError::from)?;
                let (started, _) = self.api.parse_envelope::<UploadStarted>(response).await?;
                Ok(started)
            },
        )
        .await?;
        let upload_id = started
            .map(|s| s.upload_id)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| anyhow!("server returned no uploadID"))?;

        let semaphore = Arc::new(Semaphore::new(TRANSFER_WORKERS));
        let (tx, mut rx) = mpsc::channel::<ChunkResult>(n_chunks as usize);

        let spawn_chunk = |idx: u32| {
            let driver = self.clone();
            let image = image.clone();
            let upload_id = upload_id.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = driver.upload_chunk(&image, &upload_id, idx).await;
                let _ = tx.send(ChunkResult { idx, result }).await;
            });
        };
        for idx in 0..n_chunks {
            spawn_chunk(idx);
        }

        // One shared budget of nChunks extra attempts across all workers;
        // deliberately no backoff on this path.
        let mut retries = n_chunks;
        let mut succeeded = 0u32;
        while let Some(done) = rx.recv().await {
            match done.result {
                Ok(()) => {
                    succeeded += 1;
                    if succeeded == n_chunks {
                        break;
                    }
                }
                Err(err) => {
                    if retries == 0 {
                        return Err(err.context(format!("chunk {} failed", done.idx)));
                    }
                    retries -= 1;
                    spawn_chunk(done.idx);
                }
            }
        }

        retry_with_backoff(
            "merge chunks",
            ExponentialBackoff::brief(),
            is_transient,
            || async {
                let response = self
                    .api
                    .post("image/chunk/merge")
                    .query(&[("uploadID", upload_id.as_str())])
                    .send()
                    .await
                    .map_err(HubError::from)?;
                self.api.expect_ok(response).await
            },
        )
        .await
    }

    async fn upload_chunk(&self, image: &LocalImage, upload_id: &str, idx: u32) -> Result<()> {
        let offset = idx as u64 * self.chunk_size;
        let part_size = self.chunk_size.min(image.size - offset);
        let path = self.registry.image_path(&image.reference);

        let response = self
            .api
            .transfer_post(&format!("image/chunk/{idx}/upload"))
            .query(&[("uploadID", upload_id)])
            .multipart(file_form(&path, offset, part_size).await?)
            .send()
            .await
            .with_context(|| format!("Failed to upload chunk {idx}"))?;
        self.api.expect_ok(response).await
    }

    pub async fn get_info(&self, name: &str) -> Result<LocalImage> {
        let reference = ImageRef::parse(name)?;
        let endpoint = format!("image/{}/{}/info", reference.user, reference.name);
        let info = retry_with_backoff(
            "image info",
            ExponentialBackoff::brief(),
            is_transient,
            || async {
                let response = self
                    .api
                    .get(&endpoint)
                    .query(&[("tag", reference.tag.as_str())])
                    .send()
                    .await
                    .map_err(HubError::from)?;
                let (info, _) = self.api.parse_envelope::<ImageInfo>(response).await?;
                info.ok_or_else(|| anyhow!("info response carried no data"))
            },
        )
        .await?;
        Ok(LocalImage::from_info(&info))
    }

    pub async fn pull(&self, name: &str, policy: Option<PullPolicy>) -> Result<Option<LocalImage>> {
        let reference = ImageRef::parse(name)?;
        let policy = match policy {
            Some(PullPolicy::Never) => return Ok(None),
            Some(policy) => policy,
            None if reference.tag == DEFAULT_TAG => PullPolicy::Always,
            None => PullPolicy::IfNotPresent,
        };

        if policy == PullPolicy::IfNotPresent && self.registry.exists(&reference) {
            let mut image = LocalImage::new(reference.clone());
            if let Some(meta) = self.registry.load(&reference).await? {
                image.size = meta.size;
                image.digest = meta.digest;
            }
            return Ok(Some(image));
        }

        // "latest" may resolve to a different tag server-side, so the local
        // paths below use the reference the server answered with.
        let image = self.get_info(name).await?;
        if image.format == FORMAT_RBD {
            bail!("image in rbd format is not allowed to download");
        }
        if self.registry.cached(&image.reference, &image.digest).await? {
            return Ok(Some(image));
        }

        if image.size > self.threshold {
            self.pull_chunked(&image).await?;
        } else {
            self.pull_single(&image).await?;
        }

        // End-to-end verification: the file just written must hash to the
        // digest the server advertised.
        let meta = self
            .registry
            .load(&image.reference)
            .await?
            .ok_or_else(|| anyhow!("downloaded image is missing"))?;
        if meta.digest != image.digest {
            return Err(HubError::digest_mismatch(&image.digest, &meta.digest).into());
        }
        Ok(Some(image))
    }

    async fn pull_single(&self, image: &LocalImage) -> Result<()> {
        let endpoint = format!(
            "image/{}/{}/download",
            image.reference.user, image.reference.name
        );
        let response = retry_with_backoff(
            "image download",
            ExponentialBackoff::brief(),
            is_transient,
            || async {
                let response = self
                    .api
                    .transfer_get(&endpoint)
                    .query(&[("tag", image.reference.tag.as_str())])
                    .send()
                    .await
                    .map_err(HubError::from)?;
                let status = response.status();
                if !status.is_success() {
                    let body = response.text().await.unwrap_or_default();
                    return Err(HubError::http(status.as_u16(), body).into());
                }
                Ok(response)
            },
        )
        .await?;

        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::other(err));
        let mut reader = StreamReader::new(stream);
        self.registry
            .write_stream(&image.reference, &mut reader)
            .await?;
        Ok(())
    }

    async fn pull_chunked(&self, image: &LocalImage) -> Result<()> {
        let n_chunks = chunk_count(image.size, self.chunk_size);
        let semaphore = Arc::new(Semaphore::new(TRANSFER_WORKERS));
        let (tx, mut rx) = mpsc::channel::<ChunkResult>(n_chunks as usize);

        for idx in 0..n_chunks {
            let driver = self.clone();
            let image = image.clone();
            let semaphore = semaphore.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let result = driver.download_chunk_with_backoff(&image, idx).await;
                let _ = tx.send(ChunkResult { idx, result }).await;
            });
        }
        drop(tx);

        let mut errors = Vec::new();
        let mut finished = 0u32;
        while let Some(done) = rx.recv().await {
            finished += 1;
            if let Err(err) = done.result {
                errors.push(format!("chunk {}: {err:#}", done.idx));
            }
            if finished == n_chunks {
                break;
            }
        }
        if !errors.is_empty() {
            bail!("chunk download failed: {}", errors.join("; "));
        }

        // Reassemble in index order, then swap the canonical file in place.
        let slice_path = self.registry.slice_path(&image.reference);
        let mut dest = tokio::fs::File::create(&slice_path)
            .await
            .with_context(|| format!("Failed to create {}", slice_path.display()))?;
        for idx in 0..n_chunks {
            let part_path = self.registry.slice_part_path(&image.reference, idx);
            let mut part = tokio::fs::File::open(&part_path)
                .await
                .with_context(|| format!("Failed to open {}", part_path.display()))?;
            tokio::io::copy(&mut part, &mut dest).await?;
            drop(part);
            let _ = tokio::fs::remove_file(&part_path).await;
        }
        dest.flush().await?;
        drop(dest);

        self.registry.promote(&image.reference, &slice_path).await?;
        Ok(())
    }

    /// Retries a single chunk on any failure until the long schedule's
    /// deadline runs out; cancellation of the surrounding task aborts the
    /// sleep immediately.
    async fn download_chunk_with_backoff(&self, image: &LocalImage, idx: u32) -> Result<()> {
        retry_with_backoff(
            "chunk download",
            ExponentialBackoff::default(),
            |_| true,
            || self.download_chunk(image, idx),
        )
        .await
    }

    async fn download_chunk(&self, image: &LocalImage, idx: u32) -> Result<()> {
        let endpoint = format!(
            "image/{}/{}/chunk/{idx}/download",
            image.reference.user, image.reference.name
        );
        let response = self
            .api
            .transfer_get(&endpoint)
            .query(&[
                ("tag", image.reference.tag.clone()),
                ("chunkSize", self.chunk_size.to_string()),
            ])
            .send()
            .await
            .map_err(HubError::from)?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(HubError::http(status.as_u16(), body).into());
        }

        let part_path = self.registry.slice_part_path(&image.reference, idx);
        if let Some(parent) = part_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let stream = response
            .bytes_stream()
            .map_err(|err| std::io::Error::other(err));
        let mut reader = StreamReader::new(stream);
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .with_context(|| format!("Failed to create {}", part_path.display()))?;
        tokio::io::copy(&mut reader, &mut file).await?;
        file.flush().await?;
        Ok(())
    }

    pub async fn list_remote(
        &self,
        username: &str,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<ImageInfo>, i64)> {
        let response = self
            .api
            .get("images")
            .query(&[
                ("username", username.to_string()),
                ("page", page.to_string()),
                ("pageSize", page_size.to_string()),
            ])
            .send()
            .await
            .map_err(HubError::from)?;
        let (images, total) = self.api.parse_envelope::<Vec<ImageInfo>>(response).await?;
        Ok((images.unwrap_or_default(), total.unwrap_or_default()))
    }

    pub async fn remove_remote(&self, name: &str) -> Result<()> {
        let reference = ImageRef::parse(name)?;
        let response = self
            .api
            .delete(&format!("image/{}/{}", reference.user, reference.name))
            .query(&[("tag", reference.tag.as_str())])
            .send()
            .await
            .map_err(HubError::from)?;
        self.api.expect_ok(response).await
    }

    pub async fn remove_local(&self, name: &str) -> Result<()> {
        let reference = ImageRef::parse(name)?;
        self.registry.remove(&reference).await
    }
}

/// Builds the multipart `file` form for a section of a local file; a fresh
/// stream per call so retried requests start from the right offset.
async fn file_form(path: &Path, offset: u64, part_size: u64) -> Result<reqwest::multipart::Form> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(offset)).await?;
    let limited = tokio::io::AsyncReadExt::take(file, part_size);
    let stream = ReaderStream::new(limited);

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "image.img".to_string());
    let part = reqwest::multipart::Part::stream_with_length(
        reqwest::Body::wrap_stream(stream),
        part_size,
    )
    .file_name(file_name)
    .mime_str("application/octet-stream")?;
    Ok(reqwest::multipart::Form::new().part("file", part))
}
