//! S3-compatible blob store. Chunked writes map onto native multipart
//! uploads (`partNumber = idx + 1`); the expected digest travels as object
//! metadata so probes avoid re-hashing multi-GB blobs.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_types::byte_stream::Length;
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Semaphore;

use super::{BlobReader, BlobStore, ChunkInfo};
use crate::digest::sha256_hex_reader;
use crate::error::HubError;

const DIGEST_METADATA_KEY: &str = "sha256";

/// Single CopyObject tops out at 5 GiB; larger moves go through
/// UploadPartCopy.
const COPY_LIMIT: u64 = 5 * 1024 * 1024 * 1024 - 1;
const COPY_PART_SIZE: u64 = 100 * 1024 * 1024 - 1;

/// Worker bound for the internal chunked put.
const PUT_CONCURRENCY: usize = 30;

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    base_dir: String,
}

impl S3Store {
    pub async fn connect(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        bucket: &str,
        base_dir: &str,
    ) -> Result<Self> {
        let credentials = Credentials::new(access_key, secret_key, None, None, "vmhub");
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("default"))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();
        Ok(Self {
            client: aws_sdk_s3::Client::from_conf(config),
            bucket: bucket.to_string(),
            base_dir: base_dir.trim_matches('/').to_string(),
        })
    }

    fn key(&self, name: &str) -> String {
        if self.base_dir.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.base_dir, name)
        }
    }

    async fn abort_upload(&self, key: &str, transaction_id: &str) {
        let result = self
            .client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(transaction_id)
            .send()
            .await;
        if let Err(err) = result {
            tracing::warn!(key, transaction_id, error = %err, "failed to abort multipart upload");
        }
    }

    async fn head_size(&self, name: &str) -> Result<u64> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    anyhow!(HubError::NotFound(name.to_string()))
                } else {
                    anyhow!(err).context("head object")
                }
            })?;
        Ok(head.content_length().unwrap_or(0) as u64)
    }
}

#[async_trait]
impl BlobStore for S3Store {
    async fn get(&self, name: &str) -> Result<BlobReader> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    anyhow!(HubError::NotFound(name.to_string()))
                } else {
                    anyhow!(err).context("get object")
                }
            })?;
        Ok(Box::new(resp.body.into_async_read()))
    }

    async fn delete(&self, name: &str, ignore_missing: bool) -> Result<()> {
        if !ignore_missing {
            self.head_size(name).await?;
        }
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await
            .context("delete object")?;
        Ok(())
    }

    async fn put(&self, name: &str, digest: &str, src: &Path) -> Result<()> {
        let body = ByteStream::from_path(src)
            .await
            .with_context(|| format!("Failed to read {}", src.display()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .metadata(DIGEST_METADATA_KEY, digest)
            .body(body)
            .send()
            .await
            .context("put object")?;
        Ok(())
    }

    async fn put_with_chunk(
        &self,
        name: &str,
        digest: &str,
        size: u64,
        chunk_size: u64,
        src: &Path,
    ) -> Result<()> {
        let key = self.key(name);
        let transaction_id = self.create_chunk_write(name).await?;
        let n_chunks = size.div_ceil(chunk_size);

        let semaphore = Arc::new(Semaphore::new(PUT_CONCURRENCY));
        let mut tasks = Vec::with_capacity(n_chunks as usize);
        for idx in 0..n_chunks {
            let offset = idx * chunk_size;
            let part_size = chunk_size.min(size - offset);
            let part_number = (idx + 1) as i32;

            let client = self.client.clone();
            let bucket = self.bucket.clone();
            let key = key.clone();
            let transaction_id = transaction_id.clone();
            let src = src.to_path_buf();
            let semaphore = semaphore.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let body = ByteStream::read_from()
                    .path(&src)
                    .offset(offset)
                    .length(Length::Exact(part_size))
                    .build()
                    .await
                    .with_context(|| format!("Failed to open part {part_number}"))?;
                let resp = client
                    .upload_part()
                    .bucket(&bucket)
                    .key(&key)
                    .upload_id(&transaction_id)
                    .part_number(part_number)
                    .body(body)
                    .send()
                    .await
                    .with_context(|| format!("Failed to upload part {part_number}"))?;
                let etag = resp
                    .e_tag()
                    .ok_or_else(|| anyhow!("missing ETag for part {part_number}"))?
                    .to_string();
                Ok::<(i32, String), anyhow::Error>((part_number, etag))
            }));
        }

        let mut parts = Vec::with_capacity(tasks.len());
        let mut failure = None;
        for task in tasks {
            match task.await.context("upload task panicked") {
                Ok(Ok(part)) => parts.push(part),
                Ok(Err(err)) | Err(err) => failure = Some(err),
            }
        }
        if let Some(err) = failure {
            self.abort_upload(&key, &transaction_id).await;
            return Err(err);
        }

        parts.sort_by_key(|(part_number, _)| *part_number);
        let completed = parts
            .into_iter()
            .map(|(part_number, etag)| {
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(etag)
                    .build()
            })
            .collect();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(&transaction_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .context("complete multipart upload")?;

        // Multipart ETags are not content hashes; the merged object must be
        // re-hashed to honor the digest contract.
        let actual = self.get_digest(name).await?;
        if actual != digest {
            self.delete(name, true).await?;
            return Err(HubError::digest_mismatch(digest, &actual).into());
        }
        Ok(())
    }

    async fn seek_read(&self, name: &str, offset: u64) -> Result<BlobReader> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .range(format!("bytes={offset}-"))
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_no_such_key()) {
                    anyhow!(HubError::NotFound(name.to_string()))
                } else {
                    anyhow!(err).context("ranged get")
                }
            })?;
        Ok(Box::new(resp.body.into_async_read()))
    }

    async fn create_chunk_write(&self, name: &str) -> Result<String> {
        let resp = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await
            .context("create multipart upload")?;
        resp.upload_id()
            .map(str::to_string)
            .ok_or_else(|| anyhow!("backend returned no upload id"))
    }

    async fn chunk_write(
        &self,
        name: &str,
        transaction_id: &str,
        info: &mut ChunkInfo,
        data: &Path,
    ) -> Result<()> {
        let key = self.key(name);
        let part_number = (info.idx + 1) as i32;
        let body = match ByteStream::from_path(data).await {
            Ok(body) => body,
            Err(err) => {
                self.abort_upload(&key, transaction_id).await;
                return Err(anyhow!(err).context("open chunk spool"));
            }
        };
        let resp = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(&key)
            .upload_id(transaction_id)
            .part_number(part_number)
            .body(body)
            .send()
            .await;
        let resp = match resp {
            Ok(resp) => resp,
            Err(err) => {
                self.abort_upload(&key, transaction_id).await;
                return Err(anyhow!(err).context(format!("upload part {part_number}")));
            }
        };
        let etag = resp
            .e_tag()
            .ok_or_else(|| anyhow!("missing ETag for part {part_number}"))?;
        info.receipt = Some(json!({ "partNumber": part_number, "etag": etag }));
        Ok(())
    }

    async fn complete_chunk_write(
        &self,
        name: &str,
        transaction_id: &str,
        chunks: &[ChunkInfo],
    ) -> Result<()> {
        let mut parts = Vec::with_capacity(chunks.len());
        for chunk in chunks {
            let receipt = chunk
                .receipt
                .as_ref()
                .ok_or_else(|| anyhow!("chunk {} has no backend receipt", chunk.idx))?;
            let part_number = receipt
                .get("partNumber")
                .and_then(|v| v.as_i64())
                .ok_or_else(|| anyhow!("chunk {} receipt has no part number", chunk.idx))?;
            let etag = receipt
                .get("etag")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow!("chunk {} receipt has no etag", chunk.idx))?;
            parts.push(
                CompletedPart::builder()
                    .part_number(part_number as i32)
                    .e_tag(etag)
                    .build(),
            );
        }
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(self.key(name))
            .upload_id(transaction_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .context("complete multipart upload")?;
        Ok(())
    }

    async fn move_object(&self, src: &str, dest: &str) -> Result<()> {
        let size = self.head_size(src).await?;
        let copy_source = format!("{}/{}", self.bucket, self.key(src));

        if size <= COPY_LIMIT {
            self.client
                .copy_object()
                .bucket(&self.bucket)
                .copy_source(&copy_source)
                .key(self.key(dest))
                .send()
                .await
                .context("copy object")?;
        } else {
            let dest_key = self.key(dest);
            let transaction_id = self.create_chunk_write(dest).await?;
            let part_count = size.div_ceil(COPY_PART_SIZE);
            let mut parts = Vec::with_capacity(part_count as usize);
            for idx in 0..part_count {
                let start = idx * COPY_PART_SIZE;
                let stop = (size - 1).min((idx + 1) * COPY_PART_SIZE - 1);
                let part_number = (idx + 1) as i32;
                let resp = self
                    .client
                    .upload_part_copy()
                    .bucket(&self.bucket)
                    .copy_source(&copy_source)
                    .copy_source_range(format!("bytes={start}-{stop}"))
                    .key(&dest_key)
                    .part_number(part_number)
                    .upload_id(&transaction_id)
                    .send()
                    .await;
                let resp = match resp {
                    Ok(resp) => resp,
                    Err(err) => {
                        self.abort_upload(&dest_key, &transaction_id).await;
                        return Err(anyhow!(err).context(format!("copy part {part_number}")));
                    }
                };
                let etag = resp
                    .copy_part_result()
                    .and_then(|r| r.e_tag())
                    .ok_or_else(|| anyhow!("missing ETag for copied part {part_number}"))?
                    .trim_matches('"')
                    .to_string();
                parts.push(
                    CompletedPart::builder()
                        .part_number(part_number)
                        .e_tag(etag)
                        .build(),
                );
            }
            self.client
                .complete_multipart_upload()
                .bucket(&self.bucket)
                .key(&dest_key)
                .upload_id(&transaction_id)
                .multipart_upload(
                    CompletedMultipartUpload::builder()
                        .set_parts(Some(parts))
                        .build(),
                )
                .send()
                .await
                .context("complete multipart copy")?;
        }

        self.delete(src, true).await
    }

    async fn get_size(&self, name: &str) -> Result<u64> {
        self.head_size(name).await
    }

    async fn get_digest(&self, name: &str) -> Result<String> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(self.key(name))
            .send()
            .await
            .map_err(|err| {
                if err.as_service_error().is_some_and(|e| e.is_not_found()) {
                    anyhow!(HubError::NotFound(name.to_string()))
                } else {
                    anyhow!(err).context("head object")
                }
            })?;
        if let Some(digest) = head
            .metadata()
            .and_then(|meta| meta.get(DIGEST_METADATA_KEY))
        {
            return Ok(digest.clone());
        }
        // Objects written without metadata (merged multiparts) are re-hashed.
        let mut reader = self.get(name).await?;
        sha256_hex_reader(reader.as_mut()).await
    }
}
