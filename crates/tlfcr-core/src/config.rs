use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{CrError, CrResult};

/// Top-level configuration (loaded from tlfcr.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlfcrConfig {
    pub resolver: ResolverConfig,
    pub storage: StorageConfig,
    pub attempt_log: AttemptLogConfig,
    pub logging: LoggingConfig,
}

impl TlfcrConfig {
    /// Read and parse a TOML config file.
    pub fn load(path: &Path) -> CrResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| CrError::Config(format!("reading {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> CrResult<Self> {
        toml::from_str(content).map_err(|e| CrError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> CrResult<String> {
        toml::to_string_pretty(self).map_err(|e| CrError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Failed attempts after which a folder is considered stuck (default: 10)
    pub max_attempts: usize,
    /// Unmerged revisions (or consecutive cancellations) before unmerged
    /// writes are blocked for one attempt (default: 500)
    pub max_revs_threshold: usize,
    /// Wall-clock bound for an attempt that blocks unmerged writes
    pub write_lock_timeout_secs: u64,
    /// Marker inserted into conflict copy names
    pub conflict_suffix: String,
}

impl ResolverConfig {
    pub fn write_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.write_lock_timeout_secs)
    }
}

impl Default for ResolverConfig {
    fn default() -> Self {
        ResolverConfig {
            max_attempts: 10,
            max_revs_threshold: 500,
            write_lock_timeout_secs: 10,
            conflict_suffix: "conflicted copy".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Fs,
    S3,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Block storage backend: memory, fs or s3
    pub backend: StorageBackend,
    /// Root directory for the fs backend
    pub root: PathBuf,
    /// S3-compatible endpoint
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket name
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig {
            backend: StorageBackend::Memory,
            root: PathBuf::from("/var/lib/tlfcr/blocks"),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "tlfcr".into(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AttemptLogConfig {
    /// `*.json` selects the JSON file backend; anything else opens RocksDB
    /// (requires the `full` feature)
    pub path: PathBuf,
}

impl Default for AttemptLogConfig {
    fn default() -> Self {
        AttemptLogConfig {
            path: PathBuf::from("~/.local/share/tlfcr/cr-attempts.json"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (default: info); RUST_LOG takes precedence
    pub level: String,
    /// Log format: "json" or "text"
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".into(),
            format: LogFormat::Text,
        }
    }
}

/// Expand a leading `~/` against $HOME.
pub fn expand_tilde(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(rest),
            None => path.to_path_buf(),
        },
        Err(_) => path.to_path_buf(),
    }
}
