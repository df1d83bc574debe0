use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{EngineError, EngineResult};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/api/v1/chat/";

const BASE_URL_ENV: &str = "CHATLINE_BASE_URL";
const TOKEN_ENV: &str = "CHATLINE_TOKEN";

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_connect_timeout() -> Option<u64> {
    Some(10)
}

fn default_upload_extensions() -> Vec<String> {
    ["txt", "pdf", "doc", "docx", "zip"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Connection settings handed to the engine at construction.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub token: String,
    /// Fail a stream whose next chunk takes longer than this.
    #[serde(default)]
    pub stream_idle_timeout_secs: Option<u64>,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: Option<u64>,
    /// Lowercase extensions accepted for upload. Empty allows everything.
    #[serde(default = "default_upload_extensions")]
    pub allowed_upload_extensions: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: String::new(),
            stream_idle_timeout_secs: None,
            connect_timeout_secs: default_connect_timeout(),
            allowed_upload_extensions: default_upload_extensions(),
        }
    }
}

// Keep the credential out of logs.
impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("base_url", &self.base_url)
            .field("token", &if self.token.is_empty() { "" } else { "<redacted>" })
            .field("stream_idle_timeout_secs", &self.stream_idle_timeout_secs)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("allowed_upload_extensions", &self.allowed_upload_extensions)
            .finish()
    }
}

impl EngineConfig {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            token: token.to_string(),
            ..Self::default()
        }
    }

    /// Default location: `<config_dir>/chatline/config.json`.
    pub fn default_path() -> EngineResult<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| EngineError::Config("Cannot determine config directory".into()))?;
        Ok(config_dir.join("chatline").join("config.json"))
    }

    /// Load from the default location, then apply environment overrides.
    pub fn load() -> EngineResult<Self> {
        let path = Self::default_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit file. A missing file yields the defaults.
    pub fn load_from(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        serde_json::from_str(&contents)
            .map_err(|e| EngineError::Config(format!("Invalid config {}: {}", path.display(), e)))
    }

    pub fn save_to(&self, path: &Path) -> EngineResult<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EngineError::Config(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| EngineError::Config(e.to_string()))?;
        }

        // Write atomically using temp file + rename
        let temp_path = path.with_extension("json.tmp");
        std::fs::write(&temp_path, &json).map_err(|e| EngineError::Config(e.to_string()))?;
        std::fs::rename(&temp_path, path).map_err(|e| EngineError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(std::env::var(BASE_URL_ENV).ok(), std::env::var(TOKEN_ENV).ok());
    }

    fn apply_overrides(&mut self, base_url: Option<String>, token: Option<String>) {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.base_url = url;
        }
        if let Some(token) = token.filter(|t| !t.trim().is_empty()) {
            self.token = token;
        }
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.token.trim().is_empty() {
            return Err(EngineError::Config(format!(
                "No API token configured (set {} or add \"token\" to the config file)",
                TOKEN_ENV
            )));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(EngineError::Config(format!(
                "Base URL must start with http:// or https://, got {}",
                self.base_url
            )));
        }
        Ok(())
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        self.stream_idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }

    pub fn is_upload_allowed(&self, file_name: &str) -> bool {
        if self.allowed_upload_extensions.is_empty() {
            return true;
        }
        let Some((_, ext)) = file_name.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_lowercase();
        self.allowed_upload_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(&ext))
    }
}
