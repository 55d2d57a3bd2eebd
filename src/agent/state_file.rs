//! The launcher wire contract.
//!
//! The external launcher maintains, for each agent, a JSON state file
//! at `<state_dir>/agent-<id>.json` and honours a shutdown-signal file
//! at `<state_dir>/shutdown-<id>`. The supervisor never writes the
//! state file; it reads it for readiness and health and writes the
//! shutdown marker for cooperative termination.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SupervisorError};

/// Counters the launcher reports in the state file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StateFileMetrics {
    pub commands_executed: u64,
    /// Seconds since the agent process started
    pub uptime: u64,
    /// Fraction of the agent's memory cap in use, 0..=100
    pub memory_usage: f64,
    pub cpu_usage: f64,
}

/// On-disk agent state as written by the launcher. Unknown keys are
/// tolerated.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentStateFile {
    pub id: String,
    #[serde(rename = "type")]
    pub agent_type: String,
    pub status: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub working_directory: PathBuf,
    pub log_file: PathBuf,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub metrics: StateFileMetrics,
}

impl AgentStateFile {
    /// An agent is ready when its state file exists, parses, and
    /// reports `running`.
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }
}

pub fn state_file_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join(format!("agent-{}.json", agent_id))
}

pub fn shutdown_file_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join(format!("shutdown-{}", agent_id))
}

pub fn log_file_path(log_dir: &Path, agent_id: &str) -> PathBuf {
    log_dir.join(format!("agent-{}.log", agent_id))
}

pub fn task_file_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join(format!("task-{}.json", agent_id))
}

/// Supervisor-side wrapper state, distinct from the launcher's file.
pub fn wrapper_state_path(state_dir: &Path, agent_id: &str) -> PathBuf {
    state_dir.join(format!("wrapper-{}.json", agent_id))
}

pub fn result_file_path(state_dir: &Path, agent_id: &str, task_id: &str) -> PathBuf {
    state_dir.join(format!("result-{}-{}.json", agent_id, task_id))
}

/// Read and parse an agent state file.
///
/// A missing file is `Ok(None)`; unparseable content is an
/// `ExternalFailure` so callers can distinguish "not started yet" from
/// "launcher wrote garbage".
pub fn load_state_file(state_dir: &Path, agent_id: &str) -> Result<Option<AgentStateFile>> {
    let path = state_file_path(state_dir, agent_id);
    let raw = match std::fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(SupervisorError::Io(e)),
    };

    serde_json::from_str(&raw).map(Some).map_err(|e| {
        SupervisorError::ExternalFailure(format!(
            "unparseable state file {}: {}",
            path.display(),
            e
        ))
    })
}

/// Health-probe TCP port for an agent: `8000 + fnv1a(id) % 1000`.
///
/// The hash covers the whole id so short ids do not collide any worse
/// than long ones. The endpoint is an enrichment; its absence is never
/// a probe failure.
pub fn probe_port(agent_id: &str) -> u16 {
    const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = FNV_OFFSET;
    for byte in agent_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    8000 + (hash % 1000) as u16
}
