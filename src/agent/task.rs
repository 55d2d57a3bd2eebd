use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Work an agent can be asked to perform.
///
/// All types share the same execution lifecycle; the wrapper dispatches
/// on the type only to shape the launcher invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Code,
    Analysis,
    Documentation,
    Test,
    Deployment,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Code => "code",
            TaskType::Analysis => "analysis",
            TaskType::Documentation => "documentation",
            TaskType::Test => "test",
            TaskType::Deployment => "deployment",
        }
    }
}

/// A task to be executed by an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: String,

    /// Task description
    pub description: String,

    /// Additional task details
    pub details: Option<String>,

    /// Type of task
    pub task_type: TaskType,

    /// Per-task timeout override in milliseconds
    pub timeout_ms: Option<u64>,
}

impl Task {
    pub fn new(id: String, description: String, task_type: TaskType) -> Self {
        Self {
            id,
            description,
            details: None,
            task_type,
            timeout_ms: None,
        }
    }

    pub fn with_details(mut self, details: String) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }
}

/// How a task terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOutcome {
    Success,
    Failure,
    Timeout,
    Cancelled,
}

/// Result of task execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub outcome: TaskOutcome,

    /// Task output (JSON value)
    pub output: serde_json::Value,

    /// Error message if the task did not succeed
    pub error: Option<String>,

    /// Wall-clock duration of the execution
    pub duration: Duration,
}

impl TaskResult {
    pub fn success(output: serde_json::Value, duration: Duration) -> Self {
        Self {
            outcome: TaskOutcome::Success,
            output,
            error: None,
            duration,
        }
    }

    pub fn failure(error: String, duration: Duration) -> Self {
        Self {
            outcome: TaskOutcome::Failure,
            output: serde_json::json!({}),
            error: Some(error),
            duration,
        }
    }

    pub fn timeout(duration: Duration) -> Self {
        Self {
            outcome: TaskOutcome::Timeout,
            output: serde_json::json!({}),
            error: Some("task timed out".to_string()),
            duration,
        }
    }

    pub fn cancelled(duration: Duration) -> Self {
        Self {
            outcome: TaskOutcome::Cancelled,
            output: serde_json::json!({}),
            error: Some("task cancelled".to_string()),
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == TaskOutcome::Success
    }
}
