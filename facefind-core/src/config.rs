use crate::matcher::MatchConfig;
use crate::threshold::Fallback;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Validation(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub provider: ProviderConfig,
    #[serde(default)]
    pub local: LocalConfig,
    pub matching: MatchingConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Face server reached over HTTP
    Remote,
    /// ONNX models on this machine
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub backend: Backend,
    pub url: String,
    #[serde(default = "default_provider_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_provider_timeout_ms() -> u64 {
    20_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalConfig {
    pub detection_model: PathBuf,
    pub embedding_model: PathBuf,
    pub confidence_threshold: f32,
    #[serde(default)]
    pub intra_threads: usize, // 0 = let ONNX Runtime decide
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            detection_model: PathBuf::from("models/scrfd_500m.onnx"),
            embedding_model: PathBuf::from("models/arcface_mobilefacenet.onnx"),
            confidence_threshold: 0.5,
            intra_threads: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    pub pool_ceiling: usize,
    pub top_k: usize,
    pub threshold: f32,
    #[serde(default)]
    pub fallback_when_empty: bool,
    #[serde(default = "default_fallback_count")]
    pub fallback_count: usize,
    pub timeout_ms: u64, // per descriptor resolution
}

fn default_fallback_count() -> usize {
    1
}

impl MatchingConfig {
    pub fn to_match_config(&self) -> MatchConfig {
        MatchConfig {
            batch_size: self.batch_size,
            concurrency: self.concurrency,
            pool_ceiling: self.pool_ceiling,
            top_k: self.top_k,
            threshold: self.threshold,
            fallback: Fallback::from_flag(self.fallback_when_empty, self.fallback_count),
            resolve_timeout: Duration::from_millis(self.timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub index_path: PathBuf,
    /// Index photos with no detectable face as deferred instead of rejecting them
    #[serde(default)]
    pub keep_faceless: bool,
}

impl Config {
    /// Load configuration with fallback chain:
    /// 1. /etc/facefind/facefind.toml (system-wide)
    /// 2. ~/.config/facefind/facefind.toml (user)
    /// 3. Compiled defaults
    pub fn load() -> Result<Self, ConfigError> {
        if let Ok(config) = Self::load_from_path("/etc/facefind/facefind.toml") {
            config.validate()?;
            return Ok(config);
        }

        if let Some(home) = std::env::var_os("HOME") {
            let user_config = PathBuf::from(home)
                .join(".config")
                .join("facefind")
                .join("facefind.toml");
            if let Ok(config) = Self::load_from_path(&user_config) {
                config.validate()?;
                return Ok(config);
            }
        }

        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.provider.backend == Backend::Remote && self.provider.url.trim().is_empty() {
            return Err(ConfigError::Validation(
                "Provider URL is required for the remote backend".to_string(),
            ));
        }

        if self.provider.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "Provider timeout must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.local.confidence_threshold) {
            return Err(ConfigError::Validation(
                "Detection confidence threshold must be between 0.0 and 1.0".to_string(),
            ));
        }

        let m = &self.matching;
        if m.batch_size == 0 || m.concurrency == 0 {
            return Err(ConfigError::Validation(
                "Batch size and concurrency must be greater than 0".to_string(),
            ));
        }

        if m.pool_ceiling == 0 || m.top_k == 0 {
            return Err(ConfigError::Validation(
                "Pool ceiling and top_k must be greater than 0".to_string(),
            ));
        }

        if !(-1.0..=1.0).contains(&m.threshold) {
            return Err(ConfigError::Validation(
                "Matching threshold must be between -1.0 and 1.0".to_string(),
            ));
        }

        if m.fallback_when_empty && m.fallback_count == 0 {
            return Err(ConfigError::Validation(
                "Fallback count must be greater than 0 when fallback is enabled".to_string(),
            ));
        }

        if m.timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "Matching timeout must be greater than 0".to_string(),
            ));
        }

        if self.storage.index_path.as_os_str().is_empty() {
            return Err(ConfigError::Validation(
                "Index path cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            provider: ProviderConfig {
                backend: Backend::Remote,
                url: "http://127.0.0.1:8000".to_string(),
                timeout_ms: default_provider_timeout_ms(),
            },
            local: LocalConfig::default(),
            matching: MatchingConfig {
                batch_size: 24,
                concurrency: 4,
                pool_ceiling: 2000,
                top_k: 60,
                threshold: 0.45,
                fallback_when_empty: false,
                fallback_count: default_fallback_count(),
                timeout_ms: 15_000,
            },
            storage: StorageConfig {
                index_path: PathBuf::from("/var/lib/facefind/events"),
                keep_faceless: false,
            },
        }
    }
}
