pub mod cancel;

use crate::config::structs::ControllerConfig;
use crate::error::{Result, SupervisorError};
use crate::registry::{ProcessState, ProcessType, Registry, RestartPolicy};
use cancel::CancelToken;
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Narrow interface a supervision loop uses to re-enter the controller,
/// avoiding a direct ownership cycle between the Controller and its loops.
pub trait Restarter: Send + Sync {
    fn start(&self, id: &str) -> Result<()>;
}

struct ChildHandle {
    child: Child,
    cancel: CancelToken,
    supervision_thread: Option<JoinHandle<()>>,
}

pub struct Controller {
    registry: Arc<Registry>,
    config: ControllerConfig,
    log_dir: PathBuf,
    handles: Arc<Mutex<HashMap<String, ChildHandle>>>,
}

impl Controller {
    pub fn new(registry: Arc<Registry>, config: ControllerConfig, log_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&log_dir)?;
        Ok(Controller {
            registry,
            config,
            log_dir,
            handles: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Builds the argv for a process per its `ProcessType` (one branch per
    /// variant, no stringly-typed dispatch) and the shell interpretation
    /// decision that goes with it.
    fn build_command(&self, id: &str, process_type: ProcessType, command: &str, interpreter: Option<&str>) -> Command {
        match process_type {
            ProcessType::ShellCommand => {
                let mut cmd = Command::new(&self.config.shell);
                cmd.args(&self.config.shell_args);
                cmd.arg(command);
                cmd
            }
            ProcessType::PythonScript => {
                let interp = interpreter.unwrap_or(&self.config.default_python_interpreter);
                let basename = Path::new(command)
                    .file_name()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| command.to_string());
                let mut cmd = Command::new(interp);
                cmd.arg("-u").arg(basename);
                cmd
            }
            ProcessType::NodejsScript => {
                let mut cmd = Command::new("node");
                cmd.arg(command);
                cmd
            }
            ProcessType::DockerInvocation => {
                let mut cmd = Command::new("docker");
                cmd.arg("run");
                cmd.args(command.split_whitespace());
                cmd
            }
            ProcessType::Custom => {
                let mut tokens = command.split_whitespace();
                let program = tokens.next().unwrap_or(id);
                let mut cmd = Command::new(program);
                cmd.args(tokens);
                cmd
            }
        }
    }

    /// `start(id)` — spawns the child and, if its restart policy warrants
    /// it, a supervision loop. `restarter` is the handle a freshly spawned
    /// loop re-enters `start` through; pass `Arc::clone` of the
    /// `Arc<Controller>` the caller already holds (typically the supervisor
    /// context), cast to `Arc<dyn Restarter>`.
    pub fn start(&self, id: &str, restarter: Arc<dyn Restarter>) -> Result<()> {
        let info = self
            .registry
            .get(id)?
            .ok_or_else(|| SupervisorError::NotFound { id: id.to_string() })?;

        // Legal-transition enforcement (REGISTERED/STOPPED/FAILED -> STARTING)
        // doubles as the "not in RUNNING" precondition from the spec.
        self.registry.update_state(id, ProcessState::Starting, None, None)?;

        let config = &info.config;
        let workdir = PathBuf::from(&config.workdir);
        let workdir = workdir.canonicalize().unwrap_or(workdir);

        let mut command = self.build_command(id, config.process_type, &config.command, config.interpreter.as_deref());
        command.current_dir(&workdir);
        command.envs(&config.env);
        if let Some(port) = config.primary_port() {
            command.env("PORT", port.to_string());
        }

        let out_path = self.log_dir.join(format!("{id}-out.log"));
        let err_path = self.log_dir.join(format!("{id}-error.log"));
        let stdout = File::create(&out_path).map(Stdio::from).unwrap_or(Stdio::null());
        let stderr = File::create(&err_path).map(Stdio::from).unwrap_or(Stdio::null());
        command.stdout(stdout).stderr(stderr);

        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => {
                let message = err.to_string();
                let _ = self
                    .registry
                    .update_state(id, ProcessState::Failed, None, Some(&message));
                return Err(SupervisorError::SpawnFailure { message });
            }
        };

        let pid = child.id() as i64;
        self.registry.update_state(id, ProcessState::Running, Some(pid), None)?;

        let cancel = CancelToken::new();
        let handle = ChildHandle {
            child,
            cancel: cancel.clone(),
            supervision_thread: None,
        };

        // Insert before spawning the supervision thread: that thread looks
        // itself up in `self.handles` on its first iteration, and if it ran
        // before this insert it would see nothing and exit without ever
        // supervising the child.
        self.handles.lock().unwrap().insert(id.to_string(), handle);

        if config.restart_policy != RestartPolicy::Never {
            let loop_id = id.to_string();
            let registry = Arc::clone(&self.registry);
            let handles = Arc::clone(&self.handles);
            let backoff = self.config.backoff_secs.clone();
            let restart_policy = config.restart_policy;
            let max_retries = config.max_retries;

            let join = thread::spawn(move || {
                supervision_loop(
                    loop_id,
                    registry,
                    handles,
                    restarter,
                    cancel,
                    backoff,
                    restart_policy,
                    max_retries,
                );
            });

            if let Some(existing) = self.handles.lock().unwrap().get_mut(id) {
                existing.supervision_thread = Some(join);
            }
        }

        Ok(())
    }

    /// `stop(id, force)` — idempotent for already-terminal records.
    pub fn stop(&self, id: &str, force: bool) -> Result<()> {
        let info = self
            .registry
            .get(id)?
            .ok_or_else(|| SupervisorError::NotFound { id: id.to_string() })?;

        if info.state.is_terminal_or_unstarted() {
            self.handles.lock().unwrap().remove(id);
            return Ok(());
        }

        // Cancel the supervision loop before signalling the child so its
        // exit-detection does not race the intentional termination.
        let handle = self.handles.lock().unwrap().remove(id);
        if let Some(handle) = &handle {
            handle.cancel.cancel();
        }

        if info.state == ProcessState::Running {
            self.registry.update_state(id, ProcessState::Stopping, None, None)?;
        }

        if let Some(mut handle) = handle {
            let pid = handle.child.id() as i64;
            if force {
                let _ = handle.child.kill();
            } else {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
                let exited = wait_for_exit(&mut handle.child, Duration::from_secs(self.config.graceful_timeout_secs));
                if !exited {
                    log::warn!("process {id} ignored graceful termination, escalating to forced kill");
                    let _ = handle.child.kill();
                }
            }
            let _ = handle.child.wait();
            if let Some(thread) = handle.supervision_thread {
                let _ = thread.join();
            }
        }

        self.registry.update_state(id, ProcessState::Stopped, None, None)?;
        Ok(())
    }

    /// `restart(id)` — stop (if running), brief pause to let the OS release
    /// the port, then start.
    pub fn restart(&self, id: &str, restarter: Arc<dyn Restarter>) -> Result<()> {
        self.stop(id, false)?;
        thread::sleep(Duration::from_secs(1));
        self.start(id, restarter)
    }

    /// Returns the last `lines` lines of captured stdout/stderr. Reads from
    /// the log files the child's output was redirected to rather than
    /// draining a live pipe, so a still-running child's future output is
    /// never discarded.
    pub fn get_output(&self, id: &str, lines: usize) -> Result<(Vec<String>, Vec<String>)> {
        let out = tail_lines(&self.log_dir.join(format!("{id}-out.log")), lines);
        let err = tail_lines(&self.log_dir.join(format!("{id}-error.log")), lines);
        Ok((out, err))
    }

    pub fn stop_all(&self) -> Result<()> {
        let ids: Vec<String> = self.handles.lock().unwrap().keys().cloned().collect();
        for id in ids {
            if let Err(err) = self.stop(&id, false) {
                log::error!("failed to stop {id} during stop_all: {err}");
            }
        }
        Ok(())
    }

    pub fn cleanup(&self) -> Result<()> {
        self.stop_all()
    }
}

/// Wraps an `Arc<Controller>` as a `Restarter`, re-wrapping itself on every
/// call so a chain of restarts never needs the Controller to hold a
/// back-reference to its own Arc.
pub struct ControllerRestarter(pub Arc<Controller>);

impl Restarter for ControllerRestarter {
    fn start(&self, id: &str) -> Result<()> {
        let next = Arc::new(ControllerRestarter(Arc::clone(&self.0)));
        self.0.start(id, next)
    }
}

fn wait_for_exit(child: &mut Child, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_)) => return true,
            Ok(None) => {
                if start.elapsed() >= timeout {
                    return false;
                }
                thread::sleep(Duration::from_millis(100));
            }
            Err(_) => return false,
        }
    }
}

fn tail_lines(path: &Path, n: usize) -> Vec<String> {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let all: Vec<&str> = contents.lines().collect();
            let start = all.len().saturating_sub(n);
            all[start..].iter().map(|s| s.to_string()).collect()
        }
        Err(_) => Vec::new(),
    }
}

/// `should_restart(policy, exit_code, attempt, max_retries)`.
///
/// `unless-stopped` restarts on any exit code, not just non-zero — the
/// resolved difference from `on-failure` (an exit-code-agnostic policy that
/// only manual `stop()` should defeat, since `stop()` cancels this loop
/// before the child ever reaches this check).
fn should_restart(policy: RestartPolicy, exit_code: i32, attempt: u32, max_retries: u32) -> bool {
    match policy {
        RestartPolicy::Never => false,
        RestartPolicy::Always => attempt < max_retries,
        RestartPolicy::OnFailure => exit_code != 0 && attempt < max_retries,
        RestartPolicy::UnlessStopped => attempt < max_retries,
    }
}

#[allow(clippy::too_many_arguments)]
fn supervision_loop(
    id: String,
    registry: Arc<Registry>,
    handles: Arc<Mutex<HashMap<String, ChildHandle>>>,
    restarter: Arc<dyn Restarter>,
    cancel: CancelToken,
    backoff: Vec<u64>,
    policy: RestartPolicy,
    max_retries: u32,
) {
    // Each restart spawns a fresh loop/thread, so the attempt count must be
    // seeded from the persisted restart_count rather than starting at 0
    // every time; otherwise max_retries would never bind across restarts.
    let mut attempt = registry
        .get(&id)
        .ok()
        .flatten()
        .map(|info| info.restart_count as u32)
        .unwrap_or(0);

    loop {
        if cancel.is_cancelled() {
            return;
        }

        let exit_status = {
            let mut guard = handles.lock().unwrap();
            match guard.get_mut(&id) {
                Some(handle) => handle.child.try_wait(),
                None => return,
            }
        };

        match exit_status {
            Ok(Some(status)) => {
                let code = status.code().unwrap_or(-1);

                if should_restart(policy, code, attempt, max_retries) {
                    let wait_secs = backoff[attempt.min(backoff.len() as u32 - 1) as usize];
                    if cancel.wait(Duration::from_secs(wait_secs)) {
                        return;
                    }
                    let _ = registry.increment_restart_count(&id);
                    attempt += 1;
                    handles.lock().unwrap().remove(&id);
                    if let Err(err) = restarter.start(&id) {
                        log::error!("restart of {id} failed: {err}");
                    }
                    return;
                }

                if cancel.is_cancelled() {
                    return;
                }

                let next_state = if code != 0 { ProcessState::Failed } else { ProcessState::Stopped };
                let _ = registry.update_state(&id, next_state, None, Some(&format!("exited with code {code}")));
                handles.lock().unwrap().remove(&id);
                return;
            }
            Ok(None) => {
                if cancel.wait(Duration::from_secs(2)) {
                    return;
                }
            }
            Err(err) => {
                log::error!("error polling child handle for {id}: {err}");
                if cancel.wait(Duration::from_secs(2)) {
                    return;
                }
            }
        }
    }
}
