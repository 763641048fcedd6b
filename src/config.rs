use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime configuration for the model server core.
///
/// Every knob has a serde default so hosts can supply a partial config
/// (or none at all) and still get the documented behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// How long a synchronous operation may run before the caller gets a
    /// timeout failure. The handler itself is not interrupted.
    #[serde(default = "default_sync_timeout_ms")]
    pub sync_timeout_ms: u64,

    /// How long finished jobs are kept before the cleanup sweep removes them,
    /// measured from completion time.
    #[serde(default = "default_job_retention_ms")]
    pub job_retention_ms: u64,

    /// Interval between cleanup sweeps over the job table.
    #[serde(default = "default_job_sweep_interval_ms")]
    pub job_sweep_interval_ms: u64,

    /// Debounce window applied to subscriptions that do not request one.
    #[serde(default = "default_debounce_ms")]
    pub default_debounce_ms: u64,

    /// Hard ceiling on requested debounce windows; larger values are clamped.
    #[serde(default = "default_max_debounce_ms")]
    pub max_debounce_ms: u64,

    /// Maximum recursion depth for AST-to-tree conversion.
    #[serde(default = "default_max_convert_depth")]
    pub max_convert_depth: usize,
}

fn default_sync_timeout_ms() -> u64 {
    30_000
}

fn default_job_retention_ms() -> u64 {
    60 * 60 * 1000 // 1 hour
}

fn default_job_sweep_interval_ms() -> u64 {
    5 * 60 * 1000 // 5 minutes
}

fn default_debounce_ms() -> u64 {
    100
}

fn default_max_debounce_ms() -> u64 {
    500
}

fn default_max_convert_depth() -> usize {
    100
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            sync_timeout_ms: default_sync_timeout_ms(),
            job_retention_ms: default_job_retention_ms(),
            job_sweep_interval_ms: default_job_sweep_interval_ms(),
            default_debounce_ms: default_debounce_ms(),
            max_debounce_ms: default_max_debounce_ms(),
            max_convert_depth: default_max_convert_depth(),
        }
    }
}

impl ServerConfig {
    /// Synchronous execution timeout as a `Duration`.
    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    /// Job retention window as a `Duration`.
    pub fn job_retention(&self) -> Duration {
        Duration::from_millis(self.job_retention_ms)
    }

    /// Cleanup sweep interval as a `Duration`.
    pub fn job_sweep_interval(&self) -> Duration {
        Duration::from_millis(self.job_sweep_interval_ms)
    }

    /// Default subscription debounce window as a `Duration`.
    pub fn default_debounce(&self) -> Duration {
        Duration::from_millis(self.default_debounce_ms)
    }

    /// Maximum subscription debounce window as a `Duration`.
    pub fn max_debounce(&self) -> Duration {
        Duration::from_millis(self.max_debounce_ms)
    }
}
