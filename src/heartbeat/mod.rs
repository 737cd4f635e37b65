//! The Heartbeat tracker: one global loop that accepts liveness pings from
//! children and ages out processes whose last heartbeat is too old.

use crate::config::structs::HeartbeatConfig;
use crate::controller::cancel::CancelToken;
use crate::error::Result;
use crate::registry::{ProcessState, Registry};
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStatus {
    pub name: String,
    pub state: String,
    pub last_heartbeat: Option<chrono::DateTime<Utc>>,
    pub seconds_since_heartbeat: Option<i64>,
    pub is_healthy: bool,
}

pub struct HeartbeatTracker {
    registry: Arc<Registry>,
    config: HeartbeatConfig,
    cancel: CancelToken,
}

impl HeartbeatTracker {
    pub fn new(registry: Arc<Registry>, config: HeartbeatConfig) -> Self {
        HeartbeatTracker {
            registry,
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Resolves the sending id, rejects unknown ids via `NotFound`. A
    /// heartbeat arriving while the record is STARTING is taken as proof the
    /// child finished its own startup and finalizes it to RUNNING.
    pub fn register_heartbeat(&self, id: &str) -> Result<()> {
        self.registry.update_heartbeat(id)?;

        if let Some(record) = self.registry.get(id)? {
            if record.state == ProcessState::Starting {
                let _ = self
                    .registry
                    .update_state(id, ProcessState::Running, record.pid, None);
            }
        }
        Ok(())
    }

    /// One tick: ages out RUNNING records whose heartbeat has gone silent.
    pub fn tick(&self) {
        let records = match self.registry.list(Some(ProcessState::Running)) {
            Ok(records) => records,
            Err(err) => {
                log::error!("heartbeat tick failed to list records: {err}");
                return;
            }
        };

        let now = Utc::now();
        for record in records {
            let Some(last_heartbeat) = record.last_heartbeat else {
                continue;
            };
            let age = (now - last_heartbeat).num_seconds();

            if age > self.config.crash_threshold_secs {
                let message = format!("heartbeat timeout after {age}s");
                // Re-read immediately before writing: a controller-driven
                // stop may have raced this tick between list() and now.
                if let Ok(Some(current)) = self.registry.get(&record.id) {
                    if current.state == ProcessState::Running {
                        let _ = self.registry.update_state(&record.id, ProcessState::Crashed, None, Some(&message));
                    }
                }
            } else if age > self.config.warn_threshold_secs {
                log::warn!("process {} has not sent a heartbeat in {}s", record.id, age);
            }
        }
    }

    /// Per-record status: `{name, state, last_heartbeat, seconds_since_heartbeat, is_healthy}`.
    pub fn status(&self) -> Result<Vec<HeartbeatStatus>> {
        let records = self.registry.list(None)?;
        let now = Utc::now();

        Ok(records
            .into_iter()
            .map(|record| {
                let seconds_since_heartbeat = record.last_heartbeat.map(|ts| (now - ts).num_seconds());
                let is_healthy = record.state == ProcessState::Running
                    && seconds_since_heartbeat.map(|s| s < self.config.warn_threshold_secs).unwrap_or(false);

                HeartbeatStatus {
                    name: record.config.name,
                    state: record.state.as_str().to_string(),
                    last_heartbeat: record.last_heartbeat,
                    seconds_since_heartbeat,
                    is_healthy,
                }
            })
            .collect())
    }

    pub fn is_process_healthy(&self, id: &str) -> Result<bool> {
        let Some(record) = self.registry.get(id)? else {
            return Ok(false);
        };
        let healthy = record.state == ProcessState::Running
            && record
                .last_heartbeat
                .map(|ts| (Utc::now() - ts).num_seconds() < self.config.warn_threshold_secs)
                .unwrap_or(false);
        Ok(healthy)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        let cancel = self.cancel.clone();
        let interval = Duration::from_secs(self.config.check_interval_secs);

        thread::spawn(move || {
            loop {
                if cancel.is_cancelled() {
                    return;
                }
                tracker.tick();
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ProcessConfig, ProcessType, RestartPolicy};
    use std::collections::BTreeMap;

    fn config(name: &str) -> ProcessConfig {
        ProcessConfig {
            name: name.to_string(),
            command: "true".to_string(),
            process_type: ProcessType::ShellCommand,
            workdir: "/tmp".to_string(),
            env: BTreeMap::new(),
            ports: vec![],
            restart_policy: RestartPolicy::Never,
            max_retries: 0,
            health_check_endpoint: None,
            dependencies: vec![],
            interpreter: None,
            health_check_interval: 30,
        }
    }

    #[test]
    fn heartbeat_finalizes_starting_into_running() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let id = registry.register(config("w")).unwrap();
        registry.update_state(&id, ProcessState::Starting, None, None).unwrap();

        let tracker = HeartbeatTracker::new(Arc::clone(&registry), HeartbeatConfig::default());
        tracker.register_heartbeat(&id).unwrap();

        let info = registry.get(&id).unwrap().unwrap();
        assert_eq!(info.state, ProcessState::Running);
        assert!(info.last_heartbeat.is_some());
    }

    #[test]
    fn tick_ages_out_silent_running_record() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let id = registry.register(config("w")).unwrap();
        registry.update_state(&id, ProcessState::Starting, None, None).unwrap();
        registry.update_state(&id, ProcessState::Running, Some(1), None).unwrap();
        registry.update_heartbeat(&id).unwrap();

        let mut config = HeartbeatConfig::default();
        config.crash_threshold_secs = -1; // force every record to look stale

        let tracker = HeartbeatTracker::new(Arc::clone(&registry), config);
        tracker.tick();

        let info = registry.get(&id).unwrap().unwrap();
        assert_eq!(info.state, ProcessState::Crashed);
        assert!(info.error_message.unwrap().contains("heartbeat timeout"));
    }

    #[test]
    fn status_reports_is_healthy_for_fresh_heartbeat() {
        let registry = Arc::new(Registry::open_in_memory().unwrap());
        let id = registry.register(config("w")).unwrap();
        registry.update_state(&id, ProcessState::Starting, None, None).unwrap();
        registry.update_state(&id, ProcessState::Running, Some(1), None).unwrap();
        registry.update_heartbeat(&id).unwrap();

        let tracker = HeartbeatTracker::new(Arc::clone(&registry), HeartbeatConfig::default());
        let status = tracker.status().unwrap();
        let entry = status.iter().find(|s| s.name == "w").unwrap();
        assert!(entry.is_healthy);
    }
}
