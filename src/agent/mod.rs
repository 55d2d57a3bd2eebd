//! Agent records, configuration, and the lifecycle state machine.

pub mod state_file;
pub mod task;
pub mod wrapper;

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use state_file::{AgentStateFile, StateFileMetrics};
pub use task::{Task, TaskOutcome, TaskResult, TaskType};
pub use wrapper::{AgentStateSnapshot, AgentWrapper};

use crate::error::{Result, SupervisorError};
use crate::session::SessionId;

/// Checkpoints retained per agent; appending past this evicts the oldest.
pub const MAX_CHECKPOINTS: usize = 10;

/// The kinds of agent the supervisor knows how to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    CodingAssistant,
    Worker,
    Monitor,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::CodingAssistant => "coding-assistant",
            AgentType::Worker => "worker",
            AgentType::Monitor => "monitor",
        }
    }
}

impl std::str::FromStr for AgentType {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "coding-assistant" => Ok(AgentType::CodingAssistant),
            "worker" => Ok(AgentType::Worker),
            "monitor" => Ok(AgentType::Monitor),
            other => Err(SupervisorError::InvalidArgument(format!(
                "unknown agent type '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an agent.
///
/// The transition table is closed; anything outside
/// [`AgentStatus::can_transition_to`] is rejected with `Conflict`
/// unless the caller forces it at the external boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Pending,
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

impl AgentStatus {
    pub fn can_transition_to(&self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, to),
            (Pending, Starting)
                | (Pending, Stopped)
                | (Pending, Error)
                | (Starting, Running)
                | (Starting, Stopped)
                | (Starting, Error)
                | (Running, Paused)
                | (Running, Stopping)
                | (Running, Error)
                | (Paused, Running)
                | (Paused, Stopping)
                | (Paused, Error)
                | (Stopping, Stopped)
                | (Stopping, Error)
                | (Stopped, Starting)
                | (Error, Starting)
                | (Error, Stopped)
        )
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AgentStatus::Pending => "pending",
            AgentStatus::Starting => "starting",
            AgentStatus::Running => "running",
            AgentStatus::Paused => "paused",
            AgentStatus::Stopping => "stopping",
            AgentStatus::Stopped => "stopped",
            AgentStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Resource ceilings applied to a single agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimits {
    pub memory_mb: u64,
    pub cpu_weight: u32,
    pub task_timeout_ms: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 2_048,
            cpu_weight: 100,
            task_timeout_ms: 300_000,
        }
    }
}

/// Per-agent configuration supplied at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    pub capabilities: Vec<String>,
    pub max_concurrent_tasks: u32,
    #[serde(default)]
    pub resources: ResourceLimits,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_tasks == 0 {
            return Err(SupervisorError::InvalidArgument(
                "max_concurrent_tasks must be at least 1".into(),
            ));
        }
        if self.resources.task_timeout_ms == 0 {
            return Err(SupervisorError::InvalidArgument(
                "task_timeout_ms must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// Rolling health estimate maintained by the health monitor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HealthState {
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub response_time_ms: Option<u64>,
    pub consecutive_failures: u32,
    pub memory_percent: Option<f64>,
    pub cpu_percent: Option<f64>,
    pub last_error: Option<String>,
}

/// Execution counters. Cost is tracked in integer micro-USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub tasks_completed: u64,
    pub total_runtime_ms: u64,
    pub total_cost_micro_usd: u64,
    pub last_activity: DateTime<Utc>,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            total_runtime_ms: 0,
            total_cost_micro_usd: 0,
            last_activity: Utc::now(),
        }
    }
}

/// A named snapshot of a wrapper's state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub state: AgentStateSnapshot,
    pub description: String,
}

/// One registry entry per live agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    pub agent_type: AgentType,
    pub project_id: String,
    pub task_id: Option<String>,
    pub config: AgentConfig,
    pub session_id: Option<SessionId>,
    pub status: AgentStatus,
    pub health: HealthState,
    pub metrics: AgentMetrics,
    pub checkpoints: VecDeque<Checkpoint>,
}

impl AgentRecord {
    pub fn new(id: String, agent_type: AgentType, project_id: String, config: AgentConfig) -> Self {
        Self {
            id,
            agent_type,
            project_id,
            task_id: None,
            config,
            session_id: None,
            status: AgentStatus::Pending,
            health: HealthState::default(),
            metrics: AgentMetrics::default(),
            checkpoints: VecDeque::new(),
        }
    }

    /// Append a checkpoint, evicting the oldest past the cap.
    pub fn push_checkpoint(&mut self, checkpoint: Checkpoint) {
        self.checkpoints.push_back(checkpoint);
        while self.checkpoints.len() > MAX_CHECKPOINTS {
            self.checkpoints.pop_front();
        }
    }

    pub fn find_checkpoint(&self, checkpoint_id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|c| c.id == checkpoint_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_agent_type_round_trip() {
        for (s, t) in [
            ("coding-assistant", AgentType::CodingAssistant),
            ("worker", AgentType::Worker),
            ("monitor", AgentType::Monitor),
        ] {
            assert_eq!(s.parse::<AgentType>().unwrap(), t);
            assert_eq!(t.as_str(), s);
        }
        assert!("janitor".parse::<AgentType>().is_err());
    }

    #[test]
    fn test_transition_table() {
        use AgentStatus::*;
        let all = [Pending, Starting, Running, Paused, Stopping, Stopped, Error];

        let allowed = [
            (Pending, Starting),
            (Pending, Stopped),
            (Pending, Error),
            (Starting, Running),
            (Starting, Stopped),
            (Starting, Error),
            (Running, Paused),
            (Running, Stopping),
            (Running, Error),
            (Paused, Running),
            (Paused, Stopping),
            (Paused, Error),
            (Stopping, Stopped),
            (Stopping, Error),
            (Stopped, Starting),
            (Error, Starting),
            (Error, Stopped),
        ];

        for from in all {
            for to in all {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{} -> {}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_config_validation() {
        let mut config = AgentConfig {
            max_concurrent_tasks: 1,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        config.max_concurrent_tasks = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_checkpoint_eviction_is_fifo() {
        let mut record = AgentRecord::new(
            "a1".into(),
            AgentType::Worker,
            "p1".into(),
            AgentConfig {
                max_concurrent_tasks: 1,
                ..Default::default()
            },
        );

        for i in 0..15 {
            record.push_checkpoint(Checkpoint {
                id: format!("cp-{}", i),
                created_at: Utc::now(),
                state: AgentStateSnapshot::default(),
                description: format!("checkpoint {}", i),
            });
        }

        assert_eq!(record.checkpoints.len(), MAX_CHECKPOINTS);
        assert_eq!(record.checkpoints.front().unwrap().id, "cp-5");
        assert_eq!(record.checkpoints.back().unwrap().id, "cp-14");

        // Retained sequence stays chronological.
        let times: Vec<_> = record.checkpoints.iter().map(|c| c.created_at).collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }
}
