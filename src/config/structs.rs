use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub mod prelude {
    pub use super::{ControllerConfig, HeartbeatConfig, HttpConfig, MonitorConfig, SupervisorConfig};
}

/// Top-level config loaded from `<base_dir>/config.toml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SupervisorConfig {
    /// Directory holding the config file, the durable store, and captured logs.
    pub base_dir: PathBuf,
    #[serde(default)]
    pub controller: ControllerConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Seconds the controller waits after a graceful stop signal before
    /// escalating to a forced kill.
    #[serde(default = "default_graceful_timeout")]
    pub graceful_timeout_secs: u64,
    /// Restart backoff ladder in seconds, capped at the last element.
    #[serde(default = "default_backoff")]
    pub backoff_secs: Vec<u64>,
    /// Shell used for `shell-command` processes, mirroring the runner's shell.
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default = "default_shell_args")]
    pub shell_args: Vec<String>,
    /// System default Python interpreter used when `ProcessConfig.interpreter` is unset.
    #[serde(default = "default_python")]
    pub default_python_interpreter: String,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            graceful_timeout_secs: default_graceful_timeout(),
            backoff_secs: default_backoff(),
            shell: default_shell(),
            shell_args: default_shell_args(),
            default_python_interpreter: default_python(),
        }
    }
}

fn default_graceful_timeout() -> u64 {
    10
}

fn default_backoff() -> Vec<u64> {
    vec![1, 2, 4, 8, 16, 30, 60]
}

#[cfg(unix)]
fn default_shell() -> String {
    "sh".into()
}

#[cfg(unix)]
fn default_shell_args() -> Vec<String> {
    vec!["-c".into()]
}

fn default_python() -> String {
    "python3".into()
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitorConfig {
    #[serde(default = "default_monitor_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_health_check_timeout")]
    pub health_check_timeout_secs: u64,
    /// Passed to `Registry::cleanup_stale` on every tick, matching the
    /// heartbeat tracker's own crash threshold.
    #[serde(default = "default_stale_timeout")]
    pub stale_timeout_secs: i64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            check_interval_secs: default_monitor_interval(),
            health_check_timeout_secs: default_health_check_timeout(),
            stale_timeout_secs: default_stale_timeout(),
        }
    }
}

fn default_monitor_interval() -> u64 {
    10
}

fn default_health_check_timeout() -> u64 {
    5
}

fn default_stale_timeout() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_heartbeat_interval")]
    pub check_interval_secs: u64,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold_secs: i64,
    #[serde(default = "default_crash_threshold")]
    pub crash_threshold_secs: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        HeartbeatConfig {
            check_interval_secs: default_heartbeat_interval(),
            warn_threshold_secs: default_warn_threshold(),
            crash_threshold_secs: default_crash_threshold(),
        }
    }
}

fn default_heartbeat_interval() -> u64 {
    5
}

fn default_warn_threshold() -> i64 {
    30
}

fn default_crash_threshold() -> i64 {
    60
}

/// The embedded Rocket instance that carries the heartbeat ingress.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_address")]
    pub address: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for HttpConfig {
    fn default() -> Self {
        HttpConfig {
            address: default_address(),
            port: default_port(),
        }
    }
}

fn default_address() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    8080
}

impl SupervisorConfig {
    pub fn default_at(base_dir: &Path) -> Self {
        SupervisorConfig {
            base_dir: base_dir.to_path_buf(),
            controller: ControllerConfig::default(),
            monitor: MonitorConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            http: HttpConfig::default(),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.base_dir.join("data").join("process_manager.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }
}
