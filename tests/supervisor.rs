//! End-to-end scenarios driven through `SupervisorContext`, covering the
//! S1-S6 scenarios and the quantified invariants spec.md describes.

use opm_supervisor::config::structs::{ControllerConfig, HeartbeatConfig, HttpConfig, MonitorConfig, SupervisorConfig};
use opm_supervisor::registry::ProcessState;
use opm_supervisor::{ProcessConfig, ProcessType, RestartPolicy, SupervisorContext};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

fn workdir() -> String {
    std::env::temp_dir().to_string_lossy().to_string()
}

fn shell_config(name: &str, command: &str, policy: RestartPolicy, max_retries: u32) -> ProcessConfig {
    ProcessConfig {
        name: name.to_string(),
        command: command.to_string(),
        process_type: ProcessType::ShellCommand,
        workdir: workdir(),
        env: BTreeMap::new(),
        ports: vec![],
        restart_policy: policy,
        max_retries,
        health_check_endpoint: None,
        dependencies: vec![],
        interpreter: None,
        health_check_interval: 30,
    }
}

/// Background Monitor/Heartbeat loops tick on an hour-long cadence so they
/// never interfere; tests that need a tick drive it directly via
/// `ctx.monitor.tick()` / `ctx.heartbeat.tick()` for determinism.
fn quiet_context(dir: &std::path::Path, controller: ControllerConfig, heartbeat: HeartbeatConfig) -> SupervisorContext {
    let config = SupervisorConfig {
        base_dir: dir.to_path_buf(),
        controller,
        monitor: MonitorConfig {
            check_interval_secs: 3600,
            health_check_timeout_secs: 5,
            stale_timeout_secs: 60,
        },
        heartbeat,
        http: HttpConfig::default(),
    };
    SupervisorContext::new(&config).unwrap()
}

/// S1 - register/start/stop happy path.
#[test]
fn s1_register_start_stop_happy_path() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = quiet_context(dir.path(), ControllerConfig::default(), HeartbeatConfig::default());

    let id = ctx.register(shell_config("w", "true", RestartPolicy::Never, 0)).unwrap();
    assert_eq!(ctx.get(&id).unwrap().unwrap().state, ProcessState::Registered);

    ctx.start(&id).unwrap();
    let info = ctx.get(&id).unwrap().unwrap();
    assert_eq!(info.state, ProcessState::Running);
    assert!(info.pid.is_some());

    std::thread::sleep(Duration::from_millis(300));
    ctx.stop(&id, false).unwrap();
    let info = ctx.get(&id).unwrap().unwrap();
    assert_eq!(info.state, ProcessState::Stopped);
    assert!(info.pid.is_none());
    assert!(info.stopped_at.is_some());

    ctx.shutdown();
}

/// S2 - crash with on-failure restart: two failing attempts exhaust
/// max_retries and the record settles into FAILED.
#[test]
fn s2_crash_with_on_failure_restart_settles_into_failed() {
    let dir = tempfile::tempdir().unwrap();
    let controller = ControllerConfig {
        backoff_secs: vec![1],
        ..ControllerConfig::default()
    };
    let mut ctx = quiet_context(dir.path(), controller, HeartbeatConfig::default());

    let id = ctx
        .register(shell_config("c", "false", RestartPolicy::OnFailure, 2))
        .unwrap();
    ctx.start(&id).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let info = ctx.get(&id).unwrap().unwrap();
        if info.state == ProcessState::Failed {
            assert_eq!(info.restart_count, 2);
            break;
        }
        assert!(Instant::now() < deadline, "process never reached FAILED: {:?}", info.state);
        std::thread::sleep(Duration::from_millis(100));
    }

    ctx.shutdown();
}

/// S3 - graceful stop escalates to forced kill when the child ignores
/// SIGTERM, and the final state is STOPPED within the graceful timeout's slack.
#[test]
fn s3_graceful_stop_escalates_to_forced_kill() {
    let dir = tempfile::tempdir().unwrap();
    let controller = ControllerConfig {
        graceful_timeout_secs: 1,
        ..ControllerConfig::default()
    };
    let mut ctx = quiet_context(dir.path(), controller, HeartbeatConfig::default());

    let id = ctx
        .register(shell_config("stubborn", "trap '' TERM; sleep 30", RestartPolicy::Never, 0))
        .unwrap();
    ctx.start(&id).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    let start = Instant::now();
    ctx.stop(&id, false).unwrap();
    assert!(start.elapsed() < Duration::from_secs(5));

    let info = ctx.get(&id).unwrap().unwrap();
    assert_eq!(info.state, ProcessState::Stopped);
    assert!(info.pid.is_none());

    ctx.shutdown();
}

/// S4 - a process that never sends a heartbeat is aged out to CRASHED once
/// the crash threshold elapses, with an error message mentioning the timeout.
#[test]
fn s4_heartbeat_timeout_crashes_a_silent_process() {
    let dir = tempfile::tempdir().unwrap();
    let heartbeat = HeartbeatConfig {
        crash_threshold_secs: -1, // force every RUNNING record to already look stale
        ..HeartbeatConfig::default()
    };
    let mut ctx = quiet_context(dir.path(), ControllerConfig::default(), heartbeat);

    let id = ctx
        .register(shell_config("silent", "sleep 30", RestartPolicy::Never, 0))
        .unwrap();
    ctx.start(&id).unwrap();
    assert_eq!(ctx.get(&id).unwrap().unwrap().state, ProcessState::Running);

    ctx.heartbeat.tick();

    let info = ctx.get(&id).unwrap().unwrap();
    assert_eq!(info.state, ProcessState::Crashed);
    assert!(info.error_message.unwrap().contains("heartbeat timeout"));

    ctx.shutdown();
}

/// S5 - a heartbeat arriving for a STARTING record (as if the child finished
/// its own startup before the controller observed the spawn) finalizes it to
/// RUNNING, and a later monitor tick observing the same live pid leaves the
/// state unchanged.
#[test]
fn s5_first_heartbeat_finalizes_startup() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = quiet_context(dir.path(), ControllerConfig::default(), HeartbeatConfig::default());

    let id = ctx.register(shell_config("w", "sleep 5", RestartPolicy::Never, 0)).unwrap();
    let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
    let pid = child.id() as i64;

    ctx.registry.update_state(&id, ProcessState::Starting, Some(pid), None).unwrap();

    ctx.heartbeat.register_heartbeat(&id).unwrap();
    let info = ctx.get(&id).unwrap().unwrap();
    assert_eq!(info.state, ProcessState::Running);
    assert_eq!(info.pid, Some(pid));

    ctx.monitor.tick();
    assert_eq!(ctx.get(&id).unwrap().unwrap().state, ProcessState::Running);

    let _ = child.kill();
    let _ = child.wait();
    ctx.shutdown();
}

/// S6 - an unhealthy health probe is recorded but does not change state.
#[test]
fn s6_unhealthy_probe_does_not_change_state() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = quiet_context(dir.path(), ControllerConfig::default(), HeartbeatConfig::default());

    let mut config = shell_config("probed", "sleep 5", RestartPolicy::Never, 0);
    config.health_check_endpoint = Some("/health".to_string());
    config.ports = vec![65000]; // no listener bound here

    let id = ctx.register(config).unwrap();
    ctx.start(&id).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    ctx.monitor.tick();

    let info = ctx.get(&id).unwrap().unwrap();
    assert_eq!(info.state, ProcessState::Running);
    let health = ctx.monitor.check_process_health(&id).unwrap();
    assert!(!health.is_healthy);

    ctx.stop(&id, true).unwrap();
    ctx.shutdown();
}

/// Boundary: `restart_policy = always, max_retries = 0` never restarts.
#[test]
fn always_with_zero_max_retries_never_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let controller = ControllerConfig {
        backoff_secs: vec![1],
        ..ControllerConfig::default()
    };
    let mut ctx = quiet_context(dir.path(), controller, HeartbeatConfig::default());

    let id = ctx.register(shell_config("w", "true", RestartPolicy::Always, 0)).unwrap();
    ctx.start(&id).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let info = ctx.get(&id).unwrap().unwrap();
        if info.state == ProcessState::Stopped {
            assert_eq!(info.restart_count, 0);
            break;
        }
        assert!(Instant::now() < deadline, "unexpected state: {:?}", info.state);
        std::thread::sleep(Duration::from_millis(100));
    }

    ctx.shutdown();
}

/// Boundary: `restart_policy = on-failure` with a clean exit never restarts.
#[test]
fn on_failure_with_clean_exit_does_not_restart() {
    let dir = tempfile::tempdir().unwrap();
    let controller = ControllerConfig {
        backoff_secs: vec![1],
        ..ControllerConfig::default()
    };
    let mut ctx = quiet_context(dir.path(), controller, HeartbeatConfig::default());

    let id = ctx
        .register(shell_config("w", "true", RestartPolicy::OnFailure, 3))
        .unwrap();
    ctx.start(&id).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let info = ctx.get(&id).unwrap().unwrap();
        if info.state == ProcessState::Stopped {
            assert_eq!(info.restart_count, 0);
            break;
        }
        assert!(Instant::now() < deadline, "unexpected state: {:?}", info.state);
        std::thread::sleep(Duration::from_millis(100));
    }

    ctx.shutdown();
}

/// `unregister` on a live record is refused; unregistering after a clean
/// stop succeeds, and the same name can be registered again afterward.
#[test]
fn unregister_requires_a_terminal_record() {
    let dir = tempfile::tempdir().unwrap();
    let mut ctx = quiet_context(dir.path(), ControllerConfig::default(), HeartbeatConfig::default());

    let id = ctx.register(shell_config("w", "sleep 5", RestartPolicy::Never, 0)).unwrap();
    ctx.start(&id).unwrap();
    std::thread::sleep(Duration::from_millis(200));

    assert!(ctx.unregister(&id).is_err());

    ctx.stop(&id, true).unwrap();
    assert!(ctx.unregister(&id).unwrap());
    assert!(ctx.get(&id).unwrap().is_none());

    ctx.register(shell_config("w", "true", RestartPolicy::Never, 0)).unwrap();

    ctx.shutdown();
}
