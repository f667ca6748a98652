//! Configuration file.
//!
//! ```toml
//! log_level = "info"
//!
//! [source]
//! address = "10.0.0.1:6379"
//!
//! [target]
//! address = "10.0.0.2:6379"
//! cluster = true
//! tls = true
//!
//! [filter]
//! block_key_prefix = ["tmp:"]
//!
//! [advanced]
//! busy_key_policy = "rewrite"
//! ```
//!
//! Every key is optional. Command-line flags are applied on top in `main`.

use crate::connection::{Credentials, TlsOptions};
use crate::pipeline::{FilterConfig, TransformConfig};
use crate::rdb::{LoaderConfig, RestorePolicy};
use crate::replication::SessionConfig;
use crate::writer::{BusyKeyPolicy, WriterConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub source: SourceConfig,
    pub target: TargetConfig,
    pub filter: FilterConfig,
    pub transform: TransformConfig,
    pub advanced: AdvancedConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct SourceConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    pub tls: bool,
    /// Accept any certificate; for self-signed deployments.
    pub tls_insecure_skip_verify: bool,
    /// Replicate every master found through `CLUSTER NODES`.
    pub cluster: bool,
    /// Replay this RDB file instead of replicating.
    pub rdb_file: Option<PathBuf>,
    pub sync_rdb: bool,
    pub sync_aof: bool,
    /// Snapshot, AOF segments and checkpoints live here.
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct TargetConfig {
    pub address: String,
    pub username: String,
    pub password: String,
    pub tls: bool,
    pub tls_insecure_skip_verify: bool,
    pub cluster: bool,
    pub connections: usize,
    /// `major.minor` of the target server.
    pub version: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct AdvancedConfig {
    pub big_key_threshold: u64,
    pub busy_key_policy: BusyKeyPolicy,
    pub pipeline_count_limit: usize,
    pub target_max_querybuf_len: u64,
    pub ack_interval_ms: u64,
    pub replica_listening_port: u16,
    pub entry_channel_capacity: usize,
    pub aof_file_max_size: u64,
    pub checkpoint_interval_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub verify_checksum: bool,
    pub status_interval_secs: u64,
    /// RedisBloom version on the target as `major*10000 + minor*100 +
    /// patch`, e.g. 20206; 0 keeps the source's bloom header layout.
    pub target_mbbloom_version: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            source: SourceConfig::default(),
            target: TargetConfig::default(),
            filter: FilterConfig::default(),
            transform: TransformConfig::default(),
            advanced: AdvancedConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6379".to_string(),
            username: String::new(),
            password: String::new(),
            tls: false,
            tls_insecure_skip_verify: false,
            cluster: false,
            rdb_file: None,
            sync_rdb: true,
            sync_aof: true,
            work_dir: PathBuf::from("data"),
        }
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:6380".to_string(),
            username: String::new(),
            password: String::new(),
            tls: false,
            tls_insecure_skip_verify: false,
            cluster: false,
            connections: 1,
            version: "7.0".to_string(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            big_key_threshold: 500 * 1024 * 1024,
            busy_key_policy: BusyKeyPolicy::Panic,
            pipeline_count_limit: 1024,
            target_max_querybuf_len: 1024 * 1024 * 1024,
            ack_interval_ms: 100,
            replica_listening_port: 10007,
            entry_channel_capacity: 1024,
            aof_file_max_size: 1024 * 1024 * 1024,
            checkpoint_interval_ms: 1000,
            max_reconnect_attempts: 3,
            reconnect_backoff_ms: 1000,
            verify_checksum: true,
            status_interval_secs: 5,
            target_mbbloom_version: 0,
        }
    }
}

/// Parses `"7.2.4"` or `"6.0"` into `(major, minor)`.
pub fn parse_version(text: &str) -> Option<(u32, u32)> {
    let mut parts = text.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = match parts.next() {
        Some(p) => p.parse().ok()?,
        None => 0,
    };
    Some((major, minor))
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.source.rdb_file.is_none() && self.source.address.is_empty() {
            return Err(ConfigError::Invalid(
                "source.address or source.rdb_file is required".to_string(),
            ));
        }
        if self.target.address.is_empty() {
            return Err(ConfigError::Invalid("target.address is required".to_string()));
        }
        if self.target.connections == 0 {
            return Err(ConfigError::Invalid("target.connections must be at least 1".to_string()));
        }
        if parse_version(&self.target.version).is_none() {
            return Err(ConfigError::Invalid(format!(
                "target.version {:?} is not major.minor",
                self.target.version
            )));
        }
        if self.advanced.entry_channel_capacity == 0 || self.advanced.pipeline_count_limit == 0 {
            return Err(ConfigError::Invalid(
                "queue capacities must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn target_version(&self) -> (u32, u32) {
        parse_version(&self.target.version).unwrap_or((7, 0))
    }

    pub fn source_credentials(&self) -> Credentials {
        Credentials::new(&self.source.username, &self.source.password)
    }

    pub fn source_tls(&self) -> TlsOptions {
        TlsOptions::new(self.source.tls, self.source.tls_insecure_skip_verify)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            address: self.target.address.clone(),
            credentials: Credentials::new(&self.target.username, &self.target.password),
            tls: TlsOptions::new(self.target.tls, self.target.tls_insecure_skip_verify),
            cluster: self.target.cluster,
            connections: self.target.connections,
            pipeline_count_limit: self.advanced.pipeline_count_limit,
            target_max_querybuf_len: self.advanced.target_max_querybuf_len,
            busy_key_policy: self.advanced.busy_key_policy,
        }
    }

    pub fn loader_config(&self, name: &str) -> LoaderConfig {
        let replace = self.advanced.busy_key_policy == BusyKeyPolicy::Rewrite;
        LoaderConfig {
            name: name.to_string(),
            big_key_threshold: self.advanced.big_key_threshold,
            restore: RestorePolicy::for_target(self.target_version(), replace),
            verify_checksum: self.advanced.verify_checksum,
            target_mbbloom_version: self.advanced.target_mbbloom_version,
        }
    }

    /// Session settings for one source master. Cluster sources keep each
    /// master's files in its own subdirectory.
    pub fn session_config(&self, address: &str) -> SessionConfig {
        let mut session = SessionConfig::new(address, self.source.work_dir.clone());
        if self.source.cluster {
            session.work_dir = self.source.work_dir.join(address.replace(':', "_"));
        }
        session.credentials = self.source_credentials();
        session.tls = self.source_tls();
        session.sync_rdb = self.source.sync_rdb;
        session.sync_aof = self.source.sync_aof;
        session.listening_port = self.advanced.replica_listening_port;
        session.ack_interval = Duration::from_millis(self.advanced.ack_interval_ms);
        session.aof_segment_size = self.advanced.aof_file_max_size;
        session.checkpoint_interval = Duration::from_millis(self.advanced.checkpoint_interval_ms);
        session.max_reconnect_attempts = self.advanced.max_reconnect_attempts;
        session.reconnect_backoff = Duration::from_millis(self.advanced.reconnect_backoff_ms);
        session.loader = self.loader_config(&session.name);
        session
    }
}
