use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ChatError;
use crate::prompts::{GREETING, SYSTEM_INSTRUCTION};
use crate::storage::SESSION_FILE;

pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// API key stored in the config file; the environment is consulted when unset
    pub api_key: Option<String>,

    /// Environment variable holding the API key
    pub api_key_env: String,

    /// Model used for chat replies
    pub model: String,

    /// Model used for `/image`
    pub image_model: String,

    /// Root of the Gemini REST API
    pub base_url: String,

    /// Instruction every remote session starts with
    pub system_instruction: String,

    /// First message of a fresh conversation
    pub greeting: String,

    /// Where the conversation snapshot lives
    pub data_dir: PathBuf,

    /// Default log filter when `RUST_LOG` is unset
    pub log_level: String,

    /// Connect timeout for API requests, seconds
    pub connect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            model: "gemini-3-pro-preview".to_string(),
            image_model: "gemini-2.5-flash-image".to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            system_instruction: SYSTEM_INSTRUCTION.to_string(),
            greeting: GREETING.to_string(),
            data_dir: default_home(),
            log_level: "warn".to_string(),
            connect_timeout_secs: 15,
        }
    }
}

/// `~/.memchat`, or `./.memchat` when there is no home directory.
pub fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memchat")
}

impl Config {
    /// Default location of `config.toml`
    pub fn default_path() -> PathBuf {
        default_home().join("config.toml")
    }

    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    fn validate(&self) -> std::result::Result<(), ChatError> {
        if self.model.trim().is_empty() {
            return Err(ChatError::Config("model must not be empty".to_string()));
        }
        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(ChatError::Config(format!(
                "base_url must be an http(s) URL, got '{}'",
                self.base_url
            )));
        }
        Ok(())
    }

    /// Path of the persisted conversation
    pub fn session_path(&self) -> PathBuf {
        self.data_dir.join(SESSION_FILE)
    }

    /// Get API key from config or environment
    pub fn get_api_key(&self) -> Option<String> {
        self.api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .or_else(|| std::env::var(&self.api_key_env).ok())
            .filter(|key| !key.trim().is_empty())
    }

    /// Like [`Config::get_api_key`], but a missing key is an initialization failure
    pub fn require_api_key(&self) -> std::result::Result<String, ChatError> {
        self.get_api_key().ok_or_else(|| {
            ChatError::Initialization(format!(
                "{} environment variable not set",
                self.api_key_env
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.toml")).unwrap();
        assert_eq!(config.api_key_env, DEFAULT_API_KEY_ENV);
        assert_eq!(config.greeting, GREETING);
    }

    #[test]
    fn partial_file_keeps_defaults_for_missing_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "model = \"gemini-2.5-flash\"\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.model, "gemini-2.5-flash");
        assert_eq!(config.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn save_then_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = Config {
            model: "gemini-2.5-pro".to_string(),
            data_dir: dir.path().to_path_buf(),
            ..Config::default()
        };
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.model, "gemini-2.5-pro");
        assert_eq!(loaded.session_path(), dir.path().join(SESSION_FILE));
    }

    #[test]
    fn rejects_non_http_base_url() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "base_url = \"ftp://example.com\"\n").unwrap();
        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn missing_api_key_is_initialization_error() {
        let config = Config {
            api_key: None,
            api_key_env: "MEMCHAT_TEST_KEY_THAT_IS_NEVER_SET".to_string(),
            ..Config::default()
        };
        match config.require_api_key() {
            Err(ChatError::Initialization(msg)) => {
                assert!(msg.contains("MEMCHAT_TEST_KEY_THAT_IS_NEVER_SET"))
            }
            other => panic!("expected initialization error, got {:?}", other),
        }
    }

    #[test]
    fn config_key_wins_over_environment() {
        let config = Config {
            api_key: Some("from-config".to_string()),
            ..Config::default()
        };
        assert_eq!(config.get_api_key().as_deref(), Some("from-config"));
    }
}
