//! Pool and connector configuration, with documented defaults.
//!
//! This crate never reads a configuration file itself; a host application deserializes
//! [`PoolConfig`] from whatever format it already uses.

use std::time::Duration;

use serde::Deserialize;

/// Per-role channel capacity, reaper cadence, and overflow/fatal thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Per-role channel capacity. Default 10.
    pub size: u32,
    /// Idle TTL and exec-age ceiling, in seconds. Default 8.
    pub max_idle_seconds: u64,
    /// Per-connection lifetime query ceiling. Default 1000.
    pub max_exec_count: u64,
    /// Reaper sweep cadence, in seconds. Fixed at 12 by default; kept as a field so tests
    /// can shrink it.
    pub reaper_interval_seconds: u64,
    /// Ceiling multiplier: live connections per role may reach `overflow_factor * size`
    /// before acquisition waits instead of growing. Default 3.
    pub overflow_factor: u32,
    /// Consecutive acquisition timeouts after which the pool is declared fatally down.
    /// Default 200.
    pub max_wait_timeout_count: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            size: 10,
            max_idle_seconds: 8,
            max_exec_count: 1000,
            reaper_interval_seconds: 12,
            overflow_factor: 3,
            max_wait_timeout_count: 200,
        }
    }
}

impl PoolConfig {
    /// Start from the documented defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-role channel capacity.
    pub fn size(mut self, size: u32) -> Self {
        assert!(size > 0, "size must be greater than zero");
        self.size = size;
        self
    }

    /// Set the idle TTL / exec-age ceiling.
    pub fn max_idle_seconds(mut self, seconds: u64) -> Self {
        self.max_idle_seconds = seconds;
        self
    }

    /// Set the per-connection lifetime query ceiling.
    pub fn max_exec_count(mut self, count: u64) -> Self {
        self.max_exec_count = count;
        self
    }

    /// Set the reaper sweep cadence.
    pub fn reaper_interval_seconds(mut self, seconds: u64) -> Self {
        assert!(seconds > 0, "reaper_interval_seconds must be greater than zero");
        self.reaper_interval_seconds = seconds;
        self
    }

    /// Set the overflow ceiling multiplier.
    pub fn overflow_factor(mut self, factor: u32) -> Self {
        assert!(factor >= 1, "overflow_factor must be at least 1");
        self.overflow_factor = factor;
        self
    }

    /// Set the consecutive-timeout fatal threshold.
    pub fn max_wait_timeout_count(mut self, count: u32) -> Self {
        self.max_wait_timeout_count = count;
        self
    }

    /// The hard ceiling on live connections for a single role: `overflow_factor * size`.
    pub fn overflow_ceiling(&self) -> u32 {
        self.overflow_factor * self.size
    }

    /// [`Self::max_idle_seconds`] as a [`Duration`].
    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_seconds)
    }

    /// [`Self::reaper_interval_seconds`] as a [`Duration`].
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_seconds)
    }
}

/// DSN parameters identifying a single MySQL session target.
#[derive(Debug, Clone, Deserialize)]
pub struct DsnConfig {
    /// Write-primary host.
    pub write_host: String,
    /// Write-primary port. Default 3306.
    #[serde(default = "default_port")]
    pub write_port: u16,
    /// Read-replica host. Falls back to `write_host` when absent (single-node setups).
    #[serde(default)]
    pub read_host: Option<String>,
    /// Read-replica port. Defaults to `write_port` when absent.
    #[serde(default)]
    pub read_port: Option<u16>,
    /// Username.
    pub user: String,
    /// Password.
    pub password: String,
    /// Schema/database name.
    pub database: String,
    /// Connect timeout, in seconds. Default 10.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Per-query timeout, in seconds. Default 180.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    /// Connection charset. Default "utf8mb4".
    #[serde(default = "default_charset")]
    pub charset: String,
}

fn default_port() -> u16 {
    3306
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_query_timeout_secs() -> u64 {
    180
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

impl DsnConfig {
    /// A stable identity for this DSN, used by [`crate::pool::PoolRegistry`] to deduplicate
    /// pools.
    pub fn key(&self) -> String {
        format!(
            "{}@{}:{}/{}",
            self.user, self.write_host, self.write_port, self.database
        )
    }

    /// Connect timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Query timeout as a [`Duration`].
    pub fn query_timeout(&self) -> Duration {
        Duration::from_secs(self.query_timeout_secs)
    }
}
