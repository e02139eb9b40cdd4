//! SHA-256 helpers for files and streams.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

const HASH_BUF_SIZE: usize = 1024 * 1024;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex_string(&hasher.finalize())
}

pub async fn sha256_hex_file(path: &Path) -> Result<String> {
    let file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut reader = tokio::io::BufReader::with_capacity(HASH_BUF_SIZE, file);
    sha256_hex_reader(&mut reader).await
}

pub async fn sha256_hex_reader<R: AsyncRead + Unpin + ?Sized>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUF_SIZE];
    loop {
        let read = reader.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_string(&hasher.finalize()))
}

/// Tee-hashing writer: spools incoming chunks to a file while folding them
/// into a SHA-256 state, so upload bodies are hashed in one pass.
pub struct HashingWriter {
    file: tokio::fs::File,
    hasher: Sha256,
    written: u64,
}

impl HashingWriter {
    pub async fn create(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::create(path)
            .await
            .with_context(|| format!("Failed to create spool file {}", path.display()))?;
        Ok(Self {
            file,
            hasher: Sha256::new(),
            written: 0,
        })
    }

    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Flushes the spool and returns `(bytes_written, hex_digest)`.
    pub async fn finish(mut self) -> Result<(u64, String)> {
        self.file.flush().await?;
        Ok((self.written, hex_string(&self.hasher.finalize())))
    }
}

fn hex_string(digest: &[u8]) -> String {
    let mut output = String::with_capacity(digest.len() * 2);
    for byte in digest {
        use std::fmt::Write;
        let _ = write!(output, "{:02x}", byte);
    }
    output
}
