//! The Registry: sole owner of the durable store. Every other component
//! reads and mutates process state only through it.

use crate::error::{Result, SupervisorError};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProcessType {
    PythonScript,
    NodejsScript,
    ShellCommand,
    DockerInvocation,
    Custom,
}

impl ProcessType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessType::PythonScript => "python-script",
            ProcessType::NodejsScript => "nodejs-script",
            ProcessType::ShellCommand => "shell-command",
            ProcessType::DockerInvocation => "docker-invocation",
            ProcessType::Custom => "custom",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Never,
    OnFailure,
    Always,
    UnlessStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
    Registered,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Crashed,
}

impl ProcessState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Registered => "REGISTERED",
            ProcessState::Starting => "STARTING",
            ProcessState::Running => "RUNNING",
            ProcessState::Stopping => "STOPPING",
            ProcessState::Stopped => "STOPPED",
            ProcessState::Failed => "FAILED",
            ProcessState::Crashed => "CRASHED",
        }
    }

    fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "REGISTERED" => ProcessState::Registered,
            "STARTING" => ProcessState::Starting,
            "RUNNING" => ProcessState::Running,
            "STOPPING" => ProcessState::Stopping,
            "STOPPED" => ProcessState::Stopped,
            "FAILED" => ProcessState::Failed,
            "CRASHED" => ProcessState::Crashed,
            _ => return None,
        })
    }

    /// States from which `unregister` is allowed without stopping a child
    /// first (resolves Open Question 2: a record with a live child must be
    /// stopped before it can vanish from the store).
    pub fn is_terminal_or_unstarted(&self) -> bool {
        matches!(
            self,
            ProcessState::Registered
                | ProcessState::Stopped
                | ProcessState::Failed
                | ProcessState::Crashed
        )
    }

    fn is_legal_transition(from: ProcessState, to: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (from, to),
            (Registered, Starting)
                | (Stopped, Starting)
                | (Failed, Starting)
                | (Starting, Running)
                | (Starting, Failed)
                | (Running, Stopping)
                | (Stopping, Stopped)
                | (Running, Crashed)
                | (Running, Failed)
                | (Running, Stopped)
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    pub name: String,
    pub command: String,
    #[serde(rename = "type")]
    pub process_type: ProcessType,
    pub workdir: String,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<u16>,
    pub restart_policy: RestartPolicy,
    pub max_retries: u32,
    #[serde(default)]
    pub health_check_endpoint: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    /// Explicit interpreter for `python-script`, replacing venv directory walking.
    #[serde(default)]
    pub interpreter: Option<String>,
    /// Per-process override of how often the Monitor re-probes this process's
    /// health endpoint; the Monitor still ticks globally at its own cadence.
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u32,
}

fn default_health_check_interval() -> u32 {
    30
}

impl ProcessConfig {
    pub fn primary_port(&self) -> Option<u16> {
        self.ports.first().copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessInfo {
    pub id: String,
    pub config: ProcessConfig,
    pub state: ProcessState,
    pub pid: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub restart_count: u64,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

fn row_to_process_info(row: &Row<'_>) -> rusqlite::Result<ProcessInfo> {
    let config_json: String = row.get("config")?;
    let config: ProcessConfig = serde_json::from_str(&config_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e)))?;
    let state_str: String = row.get("state")?;
    let state = ProcessState::from_str(&state_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(0, "state".into(), rusqlite::types::Type::Text)
    })?;

    Ok(ProcessInfo {
        id: row.get("id")?,
        config,
        state,
        pid: row.get("pid")?,
        started_at: row.get("started_at")?,
        stopped_at: row.get("stopped_at")?,
        restart_count: row.get("restart_count")?,
        last_heartbeat: row.get("last_heartbeat")?,
        error_message: row.get("error_message")?,
    })
}

pub struct Registry {
    conn: Mutex<Connection>,
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS processes (
    id TEXT PRIMARY KEY,
    name TEXT UNIQUE NOT NULL,
    config TEXT NOT NULL,
    state TEXT NOT NULL,
    pid INTEGER,
    started_at TEXT,
    stopped_at TEXT,
    restart_count INTEGER NOT NULL DEFAULT 0,
    last_heartbeat TEXT,
    error_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_processes_state ON processes(state);
CREATE INDEX IF NOT EXISTS idx_processes_name ON processes(name);
"#;

impl Registry {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Registry {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Registry {
            conn: Mutex::new(conn),
        })
    }

    /// Inserts a new REGISTERED record. Fails with `NameConflict` if the name
    /// is already taken.
    pub fn register(&self, config: ProcessConfig) -> Result<String> {
        let conn = self.conn.lock().unwrap();

        let exists: Option<String> = conn
            .query_row(
                "SELECT id FROM processes WHERE name = ?1",
                params![config.name],
                |row| row.get(0),
            )
            .optional()?;
        if exists.is_some() {
            return Err(SupervisorError::NameConflict { name: config.name });
        }

        let now = Utc::now();
        let id = format!("{}_{}", config.name, now.format("%Y%m%d_%H%M%S"));
        let config_json = serde_json::to_string(&config)
            .map_err(|e| SupervisorError::InvalidConfig(e.to_string()))?;

        conn.execute(
            "INSERT INTO processes (id, name, config, state, restart_count, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5, ?5)",
            params![id, config.name, config_json, ProcessState::Registered.as_str(), now],
        )?;

        log::info!("registered process {} ({})", id, config.name);
        Ok(id)
    }

    /// Removes the record, refusing while a child may still be alive under
    /// it (resolves Open Question 2 — see `ProcessState::is_terminal_or_unstarted`).
    pub fn unregister(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let state_str: Option<String> = conn
            .query_row("SELECT state FROM processes WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;

        let Some(state_str) = state_str else {
            return Ok(false);
        };
        let state = ProcessState::from_str(&state_str).unwrap_or(ProcessState::Registered);
        if !state.is_terminal_or_unstarted() {
            return Err(SupervisorError::NotTerminal {
                id: id.to_string(),
                state,
            });
        }

        let affected = conn.execute("DELETE FROM processes WHERE id = ?1", params![id])?;
        Ok(affected > 0)
    }

    pub fn get(&self, id: &str) -> Result<Option<ProcessInfo>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM processes WHERE id = ?1", params![id], row_to_process_info)
            .optional()
            .map_err(SupervisorError::from)
    }

    pub fn get_by_name(&self, name: &str) -> Result<Option<ProcessInfo>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT * FROM processes WHERE name = ?1", params![name], row_to_process_info)
            .optional()
            .map_err(SupervisorError::from)
    }

    /// Enumerates records in insertion order, optionally filtered by state.
    pub fn list(&self, state: Option<ProcessState>) -> Result<Vec<ProcessInfo>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = match state {
            Some(_) => conn.prepare("SELECT * FROM processes WHERE state = ?1 ORDER BY created_at ASC")?,
            None => conn.prepare("SELECT * FROM processes ORDER BY created_at ASC")?,
        };

        let rows = match state {
            Some(s) => stmt.query_map(params![s.as_str()], row_to_process_info)?,
            None => stmt.query_map([], row_to_process_info)?,
        };

        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Applies the state-entry side effects from the transition table:
    /// timestamps and pid clearing. Rejects illegal transitions without
    /// mutating the record. Idempotent with respect to a transition into the
    /// state the record is already in.
    pub fn update_state(
        &self,
        id: &str,
        new_state: ProcessState,
        pid: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let current: Option<String> = conn
            .query_row("SELECT state FROM processes WHERE id = ?1", params![id], |row| row.get(0))
            .optional()?;
        let Some(current_str) = current else {
            return Err(SupervisorError::NotFound { id: id.to_string() });
        };
        let current_state = ProcessState::from_str(&current_str).unwrap_or(ProcessState::Registered);

        if current_state == new_state {
            return Ok(());
        }

        if !ProcessState::is_legal_transition(current_state, new_state) {
            log::warn!(
                "rejected illegal transition for {}: {:?} -> {:?}",
                id,
                current_state,
                new_state
            );
            return Err(SupervisorError::IllegalTransition {
                from: current_state,
                to: new_state,
            });
        }

        let now = Utc::now();
        let (started_at_sql, stopped_at_sql, pid_sql): (Option<DateTime<Utc>>, Option<DateTime<Utc>>, Option<i64>) =
            match new_state {
                ProcessState::Running => (Some(now), None, pid),
                ProcessState::Stopped | ProcessState::Failed | ProcessState::Crashed => (None, Some(now), None),
                _ => (None, None, pid),
            };

        // Entering RUNNING also (re-)establishes the heartbeat clock baseline,
        // so a process that never sends a single heartbeat still ages out via
        // cleanup_stale/heartbeat tick instead of running forever unobserved.
        let entering_running = matches!(new_state, ProcessState::Running);

        conn.execute(
            "UPDATE processes SET
                state = ?1,
                pid = COALESCE(?2, pid),
                started_at = CASE WHEN ?3 = 1 THEN ?4 ELSE started_at END,
                stopped_at = CASE WHEN ?3 = 1 THEN NULL WHEN ?5 = 1 THEN ?6 ELSE stopped_at END,
                last_heartbeat = CASE WHEN ?3 = 1 THEN ?4 ELSE last_heartbeat END,
                error_message = COALESCE(?7, error_message),
                updated_at = ?8
             WHERE id = ?9",
            params![
                new_state.as_str(),
                pid_sql,
                entering_running as i64,
                started_at_sql,
                matches!(
                    new_state,
                    ProcessState::Stopped | ProcessState::Failed | ProcessState::Crashed
                ) as i64,
                stopped_at_sql,
                error,
                now,
                id,
            ],
        )?;

        // pid must be explicitly cleared on the terminal branch; COALESCE above
        // only protects RUNNING's pid write from being nulled accidentally.
        if matches!(
            new_state,
            ProcessState::Stopped | ProcessState::Failed | ProcessState::Crashed
        ) {
            conn.execute("UPDATE processes SET pid = NULL WHERE id = ?1", params![id])?;
        }

        log::info!("{} transitioned {:?} -> {:?}", id, current_state, new_state);
        Ok(())
    }

    pub fn update_heartbeat(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let affected = conn.execute(
            "UPDATE processes SET last_heartbeat = ?1, updated_at = ?1 WHERE id = ?2",
            params![now, id],
        )?;
        if affected == 0 {
            return Err(SupervisorError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    pub fn increment_restart_count(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let affected = conn.execute(
            "UPDATE processes SET restart_count = restart_count + 1, updated_at = ?1 WHERE id = ?2",
            params![Utc::now(), id],
        )?;
        if affected == 0 {
            return Err(SupervisorError::NotFound { id: id.to_string() });
        }
        Ok(())
    }

    /// Bulk-transitions RUNNING records whose heartbeat is older than `timeout_seconds`
    /// into CRASHED. Returns the ids transitioned.
    pub fn cleanup_stale(&self, timeout_seconds: i64) -> Result<Vec<String>> {
        let running = self.list(Some(ProcessState::Running))?;
        let now = Utc::now();
        let mut transitioned = Vec::new();

        for record in running {
            let Some(last_heartbeat) = record.last_heartbeat else {
                continue;
            };
            if (now - last_heartbeat).num_seconds() > timeout_seconds {
                if self
                    .update_state(&record.id, ProcessState::Crashed, None, Some("heartbeat timeout"))
                    .is_ok()
                {
                    transitioned.push(record.id);
                }
            }
        }

        Ok(transitioned)
    }
}
