//! Wire types shared by the server handlers and the client driver.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::HubError;

pub const FORMAT_QCOW2: &str = "qcow2";
pub const FORMAT_RAW: &str = "raw";
pub const FORMAT_RBD: &str = "rbd";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OsInfo {
    #[serde(rename = "type", default = "default_os_type")]
    pub os_type: String,
    #[serde(default)]
    pub distrib: String,
    #[serde(default)]
    pub version: String,
    #[serde(default = "default_arch")]
    pub arch: String,
}

fn default_os_type() -> String {
    "linux".to_string()
}

fn default_arch() -> String {
    "amd64".to_string()
}

impl Default for OsInfo {
    fn default() -> Self {
        Self {
            os_type: default_os_type(),
            distrib: String::new(),
            version: String::new(),
            arch: default_arch(),
        }
    }
}

impl std::fmt::Display for OsInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.os_type.eq_ignore_ascii_case("linux") {
            write!(f, "{}:{} [{}]", self.distrib, self.version, self.arch)
        } else {
            write!(f, "{}:{} [{}]", self.os_type, self.version, self.arch)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageCreateRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_tag")]
    pub tag: String,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub digest: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub os: OsInfo,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub url: String,
}

fn default_tag() -> String {
    "latest".to_string()
}

impl Default for ImageCreateRequest {
    fn default() -> Self {
        Self {
            username: String::new(),
            name: String::new(),
            tag: default_tag(),
            labels: HashMap::new(),
            size: 0,
            private: false,
            digest: String::new(),
            format: String::new(),
            os: OsInfo::default(),
            description: String::new(),
            url: String::new(),
        }
    }
}

impl ImageCreateRequest {
    /// Request validation: the digest is mandatory (64 hex chars) unless a
    /// remote URL is given, and the OS/format descriptors must be filled.
    pub fn check(&mut self) -> Result<(), HubError> {
        if self.url.is_empty() && !is_hex_sha256(&self.digest) {
            return Err(HubError::InvalidRequestDigest);
        }
        if self.os.os_type.is_empty() {
            return Err(HubError::InvalidOs);
        }
        self.os.os_type = self.os.os_type.to_lowercase();
        if self.os.os_type == "linux" && self.os.distrib.is_empty() {
            return Err(HubError::InvalidDistrib);
        }
        if self.os.arch.is_empty() {
            return Err(HubError::InvalidArch);
        }
        if self.format.is_empty() {
            return Err(HubError::InvalidFormat);
        }
        Ok(())
    }
}

pub fn is_hex_sha256(digest: &str) -> bool {
    digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub id: i64,
    pub repo_id: i64,
    pub username: String,
    pub name: String,
    pub tag: String,
    pub format: String,
    pub os: OsInfo,
    pub private: bool,
    pub size: u64,
    pub digest: String,
    #[serde(default)]
    pub snapshot: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepositoryInfo {
    pub id: i64,
    pub username: String,
    pub name: String,
    pub private: bool,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// Envelope every JSON endpoint answers with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T> {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadStarted {
    #[serde(rename = "uploadID")]
    pub upload_id: String,
}
