use serde::Deserialize;
use std::path::PathBuf;

use crate::error::{Result, SimutraceError};
use crate::types::SEGMENT_SIZE;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Store backend configuration.
    #[serde(default)]
    pub store: StoreConfig,
    /// Server-side memory management and session settings.
    #[serde(default)]
    pub server: ServerConfig,
    /// Settings requested on behalf of clients.
    #[serde(default)]
    pub client: ClientConfig,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    #[serde(default)]
    pub simtrace: SimtraceConfig,
}

/// Simtrace container settings.
#[derive(Debug, Deserialize, Clone)]
pub struct SimtraceConfig {
    /// Base directory against which relative store paths are resolved.
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
    /// Log a verbose per-stream summary when a store closes.
    #[serde(default)]
    pub log_stream_stats: bool,
}

impl Default for SimtraceConfig {
    fn default() -> Self {
        Self { root: default_store_root(), log_stream_stats: false }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub memmgmt: MemoryConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

/// Segment buffer pool behaviour.
#[derive(Debug, Deserialize, Clone)]
pub struct MemoryConfig {
    /// Disable the standby cache of decoded read-only segments.
    #[serde(default)]
    pub disable_cache: bool,
    /// Read-ahead window in segments for sequential scans.
    #[serde(default = "default_read_ahead")]
    pub read_ahead: u32,
    /// Allocation retries before a segment request fails under pressure.
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
    /// Sleep between allocation retries in milliseconds.
    #[serde(default = "default_retry_sleep")]
    pub retry_sleep_ms: u64,
    /// Server-private pool size in MiB, backing hidden streams and
    /// scratch segments.
    #[serde(default = "default_server_pool_size")]
    pub pool_size_mib: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            disable_cache: false,
            read_ahead: default_read_ahead(),
            retry_count: default_retry_count(),
            retry_sleep_ms: default_retry_sleep(),
            pool_size_mib: default_server_pool_size(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Grace period in milliseconds to drain pending segment work when a
    /// session or store closes. A store whose drain exceeds this is forced
    /// read-only.
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self { close_timeout_ms: default_close_timeout() }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub memmgmt: ClientMemoryConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClientMemoryConfig {
    /// Requested shared segment pool size in MiB per store.
    #[serde(default = "default_client_pool_size")]
    pub pool_size_mib: u64,
}

impl Default for ClientMemoryConfig {
    fn default() -> Self {
        Self { pool_size_mib: default_client_pool_size() }
    }
}

fn default_store_root() -> PathBuf {
    PathBuf::from(".")
}
fn default_read_ahead() -> u32 {
    4
}
fn default_retry_count() -> u32 {
    10
}
fn default_retry_sleep() -> u64 {
    250
}
fn default_server_pool_size() -> u64 {
    // Composite encoders keep one segment per hidden stream open, and two
    // hidden segment groups can overlap around a group boundary.
    (SEGMENT_SIZE as u64 / 1_048_576) * 24
}
fn default_client_pool_size() -> u64 {
    (SEGMENT_SIZE as u64 / 1_048_576) * 4
}
fn default_close_timeout() -> u64 {
    5000
}

impl Config {
    /// Load configuration from a TOML file at `path`.
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| SimutraceError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| SimutraceError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let segment_mib = SEGMENT_SIZE as u64 / 1_048_576;
        if self.client.memmgmt.pool_size_mib < segment_mib {
            return Err(SimutraceError::Config(format!(
                "client pool ({} MiB) must hold at least one {segment_mib} MiB segment",
                self.client.memmgmt.pool_size_mib
            )));
        }
        if self.server.memmgmt.pool_size_mib < segment_mib {
            return Err(SimutraceError::Config(format!(
                "server pool ({} MiB) must hold at least one {segment_mib} MiB segment",
                self.server.memmgmt.pool_size_mib
            )));
        }
        Ok(())
    }

    /// Number of segments backing the client pool of a store.
    pub fn client_pool_segments(&self) -> u32 {
        (self.client.memmgmt.pool_size_mib * 1_048_576 / SEGMENT_SIZE as u64) as u32
    }

    /// Number of segments backing the server-private pool.
    pub fn server_pool_segments(&self) -> u32 {
        (self.server.memmgmt.pool_size_mib * 1_048_576 / SEGMENT_SIZE as u64) as u32
    }
}
