//! Configuration types

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OspreyConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker pool tuning
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Pipe mode tuning
    #[serde(default)]
    pub pipe: PipeConfig,

    /// HTTP behaviour knobs
    #[serde(default)]
    pub http: HttpConfig,

    /// Origin backends
    #[serde(default)]
    pub backends: Vec<BackendConfig>,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_listen_addr() -> SocketAddr {
    "0.0.0.0:8080".parse().unwrap()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
            log_level: default_log_level(),
        }
    }
}

/// Worker pool tuning knobs
///
/// All of these are consulted on every decision point, so a config reload
/// takes effect without a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Minimum worker threads per pool
    #[serde(default = "default_min")]
    pub min: u32,

    /// Maximum worker threads per pool
    #[serde(default = "default_max")]
    pub max: u32,

    /// Number of scheduler pools
    #[serde(default = "default_pools")]
    pub pools: u32,

    /// Queue length above which the herder breeds another thread
    #[serde(default = "default_add_threshold")]
    pub add_threshold: u32,

    /// Pause after a successful thread creation (milliseconds)
    #[serde(default = "default_add_delay_ms")]
    pub add_delay_ms: u64,

    /// Pause after a failed thread creation (milliseconds)
    #[serde(default = "default_fail_delay_ms")]
    pub fail_delay_ms: u64,

    /// Herder wake-up interval for retirement checks (milliseconds)
    #[serde(default = "default_purge_delay_ms")]
    pub purge_delay_ms: u64,

    /// Idle time after which a worker may be retired (fractional seconds)
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: f64,

    /// Worker thread stack size in bytes, 0 = platform default
    #[serde(default)]
    pub stack_size: usize,

    /// Front-queue admission bound, percent of current thread count
    #[serde(default = "default_queue_max")]
    pub queue_max_percent: u32,

    /// Per-worker scratch workspace size in bytes
    #[serde(default = "default_workspace_size")]
    pub workspace_size: usize,
}

fn default_min() -> u32 {
    10
}

fn default_max() -> u32 {
    1000
}

fn default_pools() -> u32 {
    2
}

fn default_add_threshold() -> u32 {
    2
}

fn default_add_delay_ms() -> u64 {
    20
}

fn default_fail_delay_ms() -> u64 {
    200
}

fn default_purge_delay_ms() -> u64 {
    5000
}

fn default_idle_timeout() -> f64 {
    300.0
}

fn default_queue_max() -> u32 {
    100
}

fn default_workspace_size() -> usize {
    64 * 1024
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            min: default_min(),
            max: default_max(),
            pools: default_pools(),
            add_threshold: default_add_threshold(),
            add_delay_ms: default_add_delay_ms(),
            fail_delay_ms: default_fail_delay_ms(),
            purge_delay_ms: default_purge_delay_ms(),
            idle_timeout_secs: default_idle_timeout(),
            stack_size: 0,
            queue_max_percent: default_queue_max(),
            workspace_size: default_workspace_size(),
        }
    }
}

/// Pipe mode tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    /// Poll timeout for an idle pipe (fractional seconds)
    #[serde(default = "default_pipe_timeout")]
    pub timeout_secs: f64,
}

fn default_pipe_timeout() -> f64 {
    60.0
}

impl Default for PipeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_pipe_timeout(),
        }
    }
}

/// HTTP behaviour knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Whether gzip is handled on the fly, in which case Accept-Encoding
    /// never discriminates between cached variants
    #[serde(default = "default_true")]
    pub gzip_support: bool,
}

fn default_true() -> bool {
    true
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            gzip_support: default_true(),
        }
    }
}

/// Origin backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Display name for logging
    pub name: String,

    /// Backend address, "host:port"
    pub addr: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OspreyConfig::default();
        assert_eq!(config.server.listen.port(), 8080);
        assert_eq!(config.workers.pools, 2);
        assert_eq!(config.workers.queue_max_percent, 100);
        assert!(config.http.gzip_support);
        assert!(config.backends.is_empty());
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
[server]
listen = "127.0.0.1:3000"

[workers]
min = 2
max = 8

[[backends]]
name = "origin"
addr = "127.0.0.1:9001"
"#;

        let config: OspreyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.workers.min, 2);
        assert_eq!(config.workers.max, 8);
        // Unspecified knobs keep their defaults
        assert_eq!(config.workers.purge_delay_ms, 5000);
        assert_eq!(config.backends.len(), 1);
        assert_eq!(config.backends[0].name, "origin");
    }

    #[test]
    fn test_parse_fractional_timeouts() {
        let toml = r#"
[workers]
idle_timeout_secs = 0.25

[pipe]
timeout_secs = 1.5
"#;

        let config: OspreyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.workers.idle_timeout_secs, 0.25);
        assert_eq!(config.pipe.timeout_secs, 1.5);
    }
}
