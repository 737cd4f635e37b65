//! `SupervisorContext`: ties Registry, Controller, Monitor, and Heartbeat
//! tracker together. Constructed once at startup and threaded explicitly —
//! no module-level singletons for supervisor state (REDESIGN FLAGS: global
//! state).

use crate::config::structs::prelude::SupervisorConfig;
use crate::controller::{Controller, ControllerRestarter, Restarter};
use crate::error::Result;
use crate::heartbeat::HeartbeatTracker;
use crate::monitor::Monitor;
use crate::registry::{ProcessConfig, ProcessInfo, ProcessState, Registry};
use std::sync::Arc;
use std::thread::JoinHandle;

pub struct SupervisorContext {
    pub registry: Arc<Registry>,
    pub controller: Arc<Controller>,
    pub monitor: Arc<Monitor>,
    pub heartbeat: Arc<HeartbeatTracker>,
    monitor_thread: Option<JoinHandle<()>>,
    heartbeat_thread: Option<JoinHandle<()>>,
}

impl SupervisorContext {
    pub fn new(config: &SupervisorConfig) -> Result<Self> {
        let registry = Arc::new(Registry::open(&config.db_path())?);
        let controller = Arc::new(Controller::new(
            Arc::clone(&registry),
            config.controller.clone(),
            config.log_dir(),
        )?);
        let monitor = Arc::new(Monitor::new(Arc::clone(&registry), config.monitor.clone()));
        let heartbeat = Arc::new(HeartbeatTracker::new(Arc::clone(&registry), config.heartbeat.clone()));

        let monitor_thread = Some(monitor.spawn());
        let heartbeat_thread = Some(heartbeat.spawn());

        Ok(SupervisorContext {
            registry,
            controller,
            monitor,
            heartbeat,
            monitor_thread,
            heartbeat_thread,
        })
    }

    fn restarter(&self) -> Arc<dyn Restarter> {
        Arc::new(ControllerRestarter(Arc::clone(&self.controller)))
    }

    pub fn register(&self, config: ProcessConfig) -> Result<String> {
        self.registry.register(config)
    }

    pub fn unregister(&self, id: &str) -> Result<bool> {
        self.registry.unregister(id)
    }

    pub fn start(&self, id: &str) -> Result<()> {
        self.controller.start(id, self.restarter())
    }

    pub fn stop(&self, id: &str, force: bool) -> Result<()> {
        self.controller.stop(id, force)
    }

    pub fn restart(&self, id: &str) -> Result<()> {
        self.controller.restart(id, self.restarter())
    }

    pub fn get(&self, id: &str) -> Result<Option<ProcessInfo>> {
        self.registry.get(id)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<ProcessInfo>> {
        self.registry.get_by_name(name)
    }

    pub fn list(&self, state: Option<ProcessState>) -> Result<Vec<ProcessInfo>> {
        self.registry.list(state)
    }

    pub fn get_output(&self, id: &str, lines: usize) -> Result<(Vec<String>, Vec<String>)> {
        self.controller.get_output(id, lines)
    }

    /// Stops every tracked child and the global Monitor/Heartbeat loops,
    /// joining every supervision loop and the two global threads.
    pub fn shutdown(&mut self) {
        let _ = self.controller.cleanup();
        self.monitor.shutdown();
        self.heartbeat.shutdown();
        if let Some(thread) = self.monitor_thread.take() {
            let _ = thread.join();
        }
        if let Some(thread) = self.heartbeat_thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for SupervisorContext {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ProcessType, RestartPolicy};
    use std::collections::BTreeMap;

    #[test]
    fn register_start_stop_through_the_context() {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig::default_at(dir.path());
        let mut ctx = SupervisorContext::new(&config).unwrap();

        let id = ctx
            .register(ProcessConfig {
                name: "w".to_string(),
                command: "true".to_string(),
                process_type: ProcessType::ShellCommand,
                workdir: std::env::temp_dir().to_string_lossy().to_string(),
                env: BTreeMap::new(),
                ports: vec![],
                restart_policy: RestartPolicy::Never,
                max_retries: 0,
                health_check_endpoint: None,
                dependencies: vec![],
                interpreter: None,
                health_check_interval: 30,
            })
            .unwrap();

        ctx.start(&id).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(200));
        ctx.stop(&id, false).unwrap();

        let info = ctx.get(&id).unwrap().unwrap();
        assert_eq!(info.state, ProcessState::Stopped);

        ctx.shutdown();
    }
}
