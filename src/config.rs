use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

const CONFIG_DIR_NAME: &str = ".vmhub";
const CONFIG_FILE_NAME: &str = "config.json";
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:9091";

pub fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

/// Client credential: a bearer token, or a username/password pair sent as
/// Basic auth. Token wins when both are present.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Credential {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Credential {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.username.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub credential: Credential,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<PathBuf>,
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            credential: Credential::default(),
            base_dir: None,
        }
    }
}

impl Config {
    /// Environment wins over the config file; a missing file yields the
    /// defaults so read-only commands work without `auth`.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file().unwrap_or_default();

        if let Some(url) = env_var("VMHUB_API_URL") {
            config.api_url = url;
        }
        if let Some(token) = env_var("VMHUB_API_TOKEN") {
            config.credential.token = Some(token);
        }
        if let Some(dir) = env_var("VMHUB_BASE_DIR") {
            config.base_dir = Some(PathBuf::from(dir));
        }

        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let config_path = Self::config_path()?;
        let contents = fs::read_to_string(&config_path).context("Failed to read config file")?;
        serde_json::from_str(&contents).context("Failed to parse config file")
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;
        let config_dir = config_path
            .parent()
            .ok_or_else(|| anyhow::anyhow!("Invalid config path"))?;
        fs::create_dir_all(config_dir).context("Failed to create config directory")?;

        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&config_path)
                .context("Failed to open config file for writing")?;
            file.write_all(contents.as_bytes())
                .context("Failed to write config file")?;
        }

        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&config_path)
                .context("Failed to read config file metadata")?
                .permissions();
            perms.set_mode(0o600);
            fs::set_permissions(&config_path, perms)
                .context("Failed to set secure permissions on config file")?;
        }

        Ok(())
    }

    pub fn base_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.base_dir {
            return Ok(dir.clone());
        }
        Ok(home_dir()?.join(CONFIG_DIR_NAME))
    }

    fn config_path() -> Result<PathBuf> {
        Ok(home_dir()?.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }
}

pub fn home_dir() -> Result<PathBuf> {
    if let Ok(home) = std::env::var("HOME") {
        return Ok(PathBuf::from(home));
    }
    dirs::home_dir().context(
        "Could not determine home directory. Please ensure HOME environment variable is set.",
    )
}

/// A user known to the server-side token authenticator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    pub username: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub admin: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    Local {
        base_dir: PathBuf,
    },
    S3 {
        endpoint: String,
        access_key: String,
        secret_key: String,
        bucket: String,
        #[serde(default)]
        base_dir: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServeConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    pub storage: StorageConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

fn default_listen() -> String {
    "0.0.0.0:9091".to_string()
}

impl ServeConfig {
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read server config {}", path.display()))?;
        serde_json::from_str(&contents).context("Failed to parse server config")
    }
}
