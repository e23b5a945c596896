//! Configuration system for gust.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $GUST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/gust/config.toml
//!   3. ~/.config/gust/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire::DEFAULT_UDP_PORT;

/// Top-level configuration. Every field has a default and an env
/// override, so a daemon can run with no config file at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GustConfig {
    /// Directory holding index.json and the per-hash progress sidecars.
    pub catalogue_dir: PathBuf,
    /// Where registered downloads place their target files.
    pub downloads_dir: PathBuf,
    /// UDP port for all peer traffic. Every node on the LAN uses the same one.
    pub udp_port: u16,
    /// Unix socket path for the control plane.
    pub control_socket: PathBuf,
}

impl Default for GustConfig {
    fn default() -> Self {
        Self {
            catalogue_dir: data_dir().join("catalogue"),
            downloads_dir: data_dir().join("downloads"),
            udp_port: DEFAULT_UDP_PORT,
            control_socket: PathBuf::from("/tmp/gustd.sock"),
        }
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("gust")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("gust")
}

fn dirs_or_home() -> PathBuf {
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
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl GustConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            GustConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("GUST_CONFIG")
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
            let text = toml::to_string_pretty(&GustConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply GUST_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("GUST_CATALOGUE_DIR") {
            self.catalogue_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GUST_DOWNLOADS_DIR") {
            self.downloads_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("GUST_UDP_PORT") {
            if let Ok(p) = v.parse() {
                self.udp_port = p;
            }
        }
        if let Ok(v) = std::env::var("GUST_CONTROL_SOCKET") {
            self.control_socket = PathBuf::from(v);
        }
    }
}
