//! The Monitor: one global loop that verifies OS-level liveness, collects
//! resource metrics, and runs HTTP health probes. Owns no per-process state
//! beyond a cache of the latest metrics it observed.

use crate::config::structs::MonitorConfig;
use crate::controller::cancel::CancelToken;
use crate::helpers::{format_duration, format_memory};
use crate::process_inspect::{self, ProcessMetrics};
use crate::registry::{ProcessState, Registry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq)]
pub struct HealthCheckResult {
    pub is_healthy: bool,
    pub checked_at: chrono::DateTime<chrono::Utc>,
}

pub type HealthCallback = Box<dyn Fn(&str, &HealthCheckResult) + Send + Sync>;

pub struct Monitor {
    registry: Arc<Registry>,
    config: MonitorConfig,
    metrics: RwLock<HashMap<String, ProcessMetrics>>,
    health: RwLock<HashMap<String, HealthCheckResult>>,
    callbacks: Mutex<Vec<HealthCallback>>,
    cancel: CancelToken,
    http: reqwest::blocking::Client,
}

impl HealthCheckResult {
    fn is_due(previous: Option<&HealthCheckResult>, interval_secs: i64) -> bool {
        match previous {
            Some(result) => (chrono::Utc::now() - result.checked_at).num_seconds() >= interval_secs,
            None => true,
        }
    }
}

impl Monitor {
    pub fn new(registry: Arc<Registry>, config: MonitorConfig) -> Self {
        let http = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.health_check_timeout_secs))
            .build()
            .expect("health probe client config is always valid");

        Monitor {
            registry,
            config,
            metrics: RwLock::new(HashMap::new()),
            health: RwLock::new(HashMap::new()),
            callbacks: Mutex::new(Vec::new()),
            cancel: CancelToken::new(),
            http,
        }
    }

    pub fn register_health_callback(&self, callback: HealthCallback) {
        self.callbacks.lock().unwrap().push(callback);
    }

    pub fn get_metrics(&self, id: &str) -> Option<ProcessMetrics> {
        self.metrics.read().unwrap().get(id).cloned()
    }

    pub fn get_all_metrics(&self) -> HashMap<String, ProcessMetrics> {
        self.metrics.read().unwrap().clone()
    }

    pub fn check_process_health(&self, id: &str) -> Option<HealthCheckResult> {
        self.health.read().unwrap().get(id).cloned()
    }

    /// Runs one tick: liveness check, metrics collection, health probes, and
    /// stale-heartbeat cleanup. Exposed standalone so tests and the spawned
    /// loop share one code path.
    pub fn tick(&self) {
        let records = match self.registry.list(None) {
            Ok(records) => records,
            Err(err) => {
                log::error!("monitor tick failed to list records: {err}");
                return;
            }
        };

        for record in records {
            // Records mid-termination are explicitly skipped so an in-flight
            // stop/restart is never overwritten by this loop.
            if matches!(record.state, ProcessState::Stopping | ProcessState::Stopped) {
                continue;
            }
            if record.state != ProcessState::Running {
                continue;
            }
            let Some(pid) = record.pid else { continue };

            if !process_inspect::is_alive(pid) {
                // Re-read before writing: the record may have moved to
                // STOPPING between the list() snapshot and here.
                if let Ok(Some(current)) = self.registry.get(&record.id) {
                    if current.state == ProcessState::Running {
                        if let Some(started_at) = current.started_at {
                            log::warn!(
                                "{} crashed after running for {}",
                                record.id,
                                format_duration(started_at)
                            );
                        }
                        let _ = self.registry.update_state(
                            &record.id,
                            ProcessState::Crashed,
                            None,
                            Some("process not found"),
                        );
                    }
                }
                self.metrics.write().unwrap().remove(&record.id);
                continue;
            }

            let metrics = process_inspect::collect_metrics(pid);
            let rss = metrics
                .rss_mb
                .map(|mb| format_memory(mb * 1024.0 * 1024.0))
                .unwrap_or_else(|| "?".to_string());
            log::debug!("{} using {rss} rss, {} child process(es)", record.id, metrics.child_count);
            self.metrics.write().unwrap().insert(record.id.clone(), metrics);

            if let Some(endpoint) = &record.config.health_check_endpoint {
                if let Some(port) = record.config.primary_port() {
                    // Per-process throttle: a process may ask to be probed
                    // less often than this tick's cadence via
                    // `health_check_interval`; skip the network round trip
                    // entirely when the last probe is still fresh enough.
                    let previous = self.health.read().unwrap().get(&record.id).cloned();
                    if HealthCheckResult::is_due(previous.as_ref(), record.config.health_check_interval as i64) {
                        let result = self.probe_health(port, endpoint);
                        if !result.is_healthy {
                            log::warn!("health probe for {} at {} is unhealthy", record.id, endpoint);
                        }
                        for callback in self.callbacks.lock().unwrap().iter() {
                            callback(&record.id, &result);
                        }
                        self.health.write().unwrap().insert(record.id.clone(), result);
                    }
                }
            }
        }

        if let Err(err) = self.registry.cleanup_stale(self.config.stale_timeout_secs) {
            log::error!("cleanup_stale failed: {err}");
        }
    }

    fn probe_health(&self, port: u16, endpoint: &str) -> HealthCheckResult {
        let url = format!("http://localhost:{port}{endpoint}");
        let is_healthy = match self.http.get(&url).send() {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        };
        HealthCheckResult {
            is_healthy,
            checked_at: chrono::Utc::now(),
        }
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Spawns the global monitor loop at the configured cadence.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let monitor = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.config.check_interval_secs);

        thread::spawn(move || {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                monitor.tick();
                if cancel.wait(interval) {
                    return;
                }
            }
        })
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
