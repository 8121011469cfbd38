//! Configuration for treesync endpoints.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $TREESYNC_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/treesync/config.toml
//!   3. ~/.config/treesync/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreesyncConfig {
    pub tuning: TuningConfig,
    pub receive: ReceiveConfig,
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TuningConfig {
    /// Bytes per DATA packet when streaming file content.
    pub chunk_size: usize,
    /// Bounded queue between the blocking directory walk and the async side.
    pub walk_queue_depth: usize,
    /// Bounded queue carrying incoming records into the diff.
    pub feed_queue_depth: usize,
    /// Maximum concurrent content streams on the sending side.
    pub stream_workers: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiveConfig {
    pub diff: DiffMode,
    /// Keep destination entries the sender does not have.
    pub merge: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address `treesyncd serve` listens on.
    pub listen: String,
}

/// How the receiver decides whether an existing entry changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffMode {
    /// Every incoming entry is treated as changed.
    None,
    /// Compare size, mtime, mode, ownership, device numbers and link target.
    #[default]
    Metadata,
    /// Metadata first, then file content for regular files that match.
    Content,
}

impl FromStr for DiffMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, ConfigError> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(DiffMode::None),
            "metadata" => Ok(DiffMode::Metadata),
            "content" => Ok(DiffMode::Content),
            other => Err(ConfigError::InvalidValue {
                key: "diff",
                value: other.to_string(),
            }),
        }
    }
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            walk_queue_depth: 100,
            feed_queue_depth: 128,
            stream_workers: 4,
        }
    }
}

impl Default for ReceiveConfig {
    fn default() -> Self {
        Self {
            diff: DiffMode::Metadata,
            merge: false,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:7878".to_string(),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("treesync")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl TreesyncConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            TreesyncConfig::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("TREESYNC_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&TreesyncConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply TREESYNC_* overrides looked up through `get`.
    pub fn apply_overrides(
        &mut self,
        get: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(v) = get("TREESYNC_TUNING__CHUNK_SIZE") {
            self.tuning.chunk_size = parse_positive("chunk_size", &v)?;
        }
        if let Some(v) = get("TREESYNC_TUNING__STREAM_WORKERS") {
            self.tuning.stream_workers = parse_positive("stream_workers", &v)?;
        }
        if let Some(v) = get("TREESYNC_RECEIVE__DIFF") {
            self.receive.diff = v.parse()?;
        }
        if let Some(v) = get("TREESYNC_RECEIVE__MERGE") {
            self.receive.merge = v == "true" || v == "1";
        }
        if let Some(v) = get("TREESYNC_SERVER__LISTEN") {
            self.server.listen = v;
        }
        Ok(())
    }
}

fn parse_positive(key: &'static str, value: &str) -> Result<usize, ConfigError> {
    match value.parse::<usize>() {
        Ok(n) if n > 0 => Ok(n),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}
