//! Per-agent execution context.
//!
//! One wrapper per agent: it owns the agent's working directory,
//! environment, current task, execution counters, and serializable
//! state, and translates typed task submissions into launcher
//! invocations inside the agent's session.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::agent::state_file::{
    load_state_file, result_file_path, shutdown_file_path, task_file_path, wrapper_state_path,
};
use crate::agent::task::{Task, TaskResult};
use crate::agent::AgentType;
use crate::error::{Result, SupervisorError};
use crate::events::{EventKind, EventStream};
use crate::session::{SessionId, SessionManager};
use crate::utils::atomic_write;

const MAX_COMMAND_LOG: usize = 100;
const MAX_CONVERSATION_LOG: usize = 50;
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One executed command line, for the recent-command log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandRecord {
    pub timestamp: DateTime<Utc>,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    Prompt,
    Response,
    System,
}

/// Entry in the wrapper's conversation log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub timestamp: DateTime<Utc>,
    pub role: ConversationRole,
    pub content: String,
    pub task_id: Option<String>,
}

/// The complete serializable wrapper state. Checkpoints store this
/// blob; `restore_state(capture_state())` must be lossless.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentStateSnapshot {
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
    pub current_task: Option<Task>,
    pub command_log: VecDeque<CommandRecord>,
    pub conversation_log: VecDeque<ConversationEntry>,
    pub tasks_completed: u64,
    pub total_runtime_ms: u64,
    pub total_cost_micro_usd: u64,
}

/// Execution context for a single agent.
pub struct AgentWrapper {
    id: String,
    agent_type: AgentType,
    state_dir: PathBuf,
    launcher: PathBuf,
    sessions: Arc<SessionManager>,
    session_id: RwLock<Option<SessionId>>,
    state: RwLock<AgentStateSnapshot>,
    busy: AtomicBool,
    paused: AtomicBool,
    started: AtomicBool,
    default_task_timeout: Duration,
    events: EventStream,
    cancel: CancellationToken,
}

impl AgentWrapper {
    /// Build a wrapper, loading any previously persisted state, and
    /// spawn its periodic persistence task.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        agent_type: AgentType,
        working_dir: PathBuf,
        env: HashMap<String, String>,
        state_dir: PathBuf,
        launcher: PathBuf,
        default_task_timeout: Duration,
        persist_interval: Duration,
        sessions: Arc<SessionManager>,
        events: EventStream,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let state = match Self::load_persisted(&state_dir, &id) {
            Some(snapshot) => snapshot,
            None => AgentStateSnapshot {
                working_dir,
                env,
                ..Default::default()
            },
        };

        let wrapper = Arc::new(Self {
            id,
            agent_type,
            state_dir,
            launcher,
            sessions,
            session_id: RwLock::new(None),
            state: RwLock::new(state),
            busy: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            started: AtomicBool::new(false),
            default_task_timeout,
            events,
            cancel: cancel.clone(),
        });

        let persister = Arc::clone(&wrapper);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(persist_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = persister.persist().await {
                            tracing::warn!(agent_id = %persister.id, error = %e, "state persistence failed");
                        }
                    }
                }
            }
        });

        wrapper
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn agent_type(&self) -> AgentType {
        self.agent_type
    }

    pub async fn attach_session(&self, session_id: SessionId) {
        *self.session_id.write().await = Some(session_id);
    }

    /// The exact command line that launches this agent inside a fresh
    /// session.
    pub fn start_command(&self) -> Result<String> {
        if !self.launcher.exists() {
            return Err(SupervisorError::Unavailable(format!(
                "launcher script missing: {}",
                self.launcher.display()
            )));
        }
        self.started.store(true, Ordering::SeqCst);
        Ok(format!(
            "{} {} {}",
            self.launcher.display(),
            self.id,
            self.agent_type.as_str()
        ))
    }

    /// Non-blocking readiness probe: the start command has been issued
    /// and the launcher's state file reports `running`.
    pub fn is_ready(&self) -> bool {
        if !self.started.load(Ordering::SeqCst) {
            return false;
        }
        matches!(
            load_state_file(&self.state_dir, &self.id),
            Ok(Some(state)) if state.is_running()
        )
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Execute one task to termination.
    ///
    /// The task is handed to the agent by writing a spool file and
    /// pushing a launcher invocation into the session; completion is
    /// the appearance of the matching result file. Fails immediately
    /// when another task is in flight or the wrapper is paused.
    pub async fn execute_task(&self, task: Task) -> Result<TaskResult> {
        if self.paused.load(Ordering::SeqCst) {
            return Err(SupervisorError::Conflict(format!(
                "agent {} is paused",
                self.id
            )));
        }
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SupervisorError::Busy(self.id.clone()));
        }

        let result = self.run_task(&task).await;
        self.busy.store(false, Ordering::SeqCst);

        match result {
            Ok(outcome) => {
                self.finish_task(&task, &outcome).await?;
                Ok(outcome)
            }
            Err(e) => {
                self.state.write().await.current_task = None;
                Err(e)
            }
        }
    }

    async fn run_task(&self, task: &Task) -> Result<TaskResult> {
        let session_id = self
            .session_id
            .read()
            .await
            .clone()
            .ok_or_else(|| SupervisorError::not_found("session", format!("agent {}", self.id)))?;

        let timeout = task
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_task_timeout);

        {
            let mut state = self.state.write().await;
            state.current_task = Some(task.clone());
            push_capped(
                &mut state.conversation_log,
                ConversationEntry {
                    timestamp: Utc::now(),
                    role: ConversationRole::Prompt,
                    content: task.description.clone(),
                    task_id: Some(task.id.clone()),
                },
                MAX_CONVERSATION_LOG,
            );
        }

        let spool = task_file_path(&self.state_dir, &self.id);
        atomic_write(&spool, &serde_json::to_vec(task)?)?;

        let command = format!(
            "{} task {} {}",
            self.launcher.display(),
            self.id,
            task.task_type.as_str()
        );
        self.sessions.exec_in_session(&session_id, &command).await?;
        {
            let mut state = self.state.write().await;
            push_capped(
                &mut state.command_log,
                CommandRecord {
                    timestamp: Utc::now(),
                    command,
                },
                MAX_COMMAND_LOG,
            );
        }

        let started = Instant::now();
        let result_path = result_file_path(&self.state_dir, &self.id, &task.id);

        loop {
            if self.cancel.is_cancelled() {
                return Ok(TaskResult::cancelled(started.elapsed()));
            }
            if result_path.exists() {
                let raw = std::fs::read_to_string(&result_path)?;
                let _ = std::fs::remove_file(&result_path);
                let _ = std::fs::remove_file(&spool);
                let reply: LauncherTaskReply = serde_json::from_str(&raw).map_err(|e| {
                    SupervisorError::ExternalFailure(format!(
                        "unparseable task result for {}: {}",
                        task.id, e
                    ))
                })?;
                return Ok(reply.into_result(started.elapsed()));
            }
            if started.elapsed() >= timeout {
                let _ = std::fs::remove_file(&spool);
                return Ok(TaskResult::timeout(started.elapsed()));
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }

    async fn finish_task(&self, task: &Task, result: &TaskResult) -> Result<()> {
        let mut state = self.state.write().await;
        state.current_task = None;
        push_capped(
            &mut state.conversation_log,
            ConversationEntry {
                timestamp: Utc::now(),
                role: ConversationRole::Response,
                content: result
                    .error
                    .clone()
                    .unwrap_or_else(|| result.output.to_string()),
                task_id: Some(task.id.clone()),
            },
            MAX_CONVERSATION_LOG,
        );
        if result.is_success() {
            state.tasks_completed += 1;
        }
        state.total_runtime_ms += result.duration.as_millis() as u64;
        let snapshot = state.clone();
        drop(state);

        self.write_snapshot(&snapshot)
    }

    /// Suspend arithmetic work. Idempotent.
    pub async fn pause(&self) -> Result<()> {
        if self.paused.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(pid) = self.launcher_pid()? {
            signal_process(pid, ProcessSignal::Stop);
        }
        tracing::info!(agent_id = %self.id, "agent paused");
        Ok(())
    }

    /// Resume after a pause. Idempotent.
    pub async fn resume(&self) -> Result<()> {
        if !self.paused.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(pid) = self.launcher_pid()? {
            signal_process(pid, ProcessSignal::Continue);
        }
        tracing::info!(agent_id = %self.id, "agent resumed");
        Ok(())
    }

    /// Graceful termination: request cooperative shutdown via the
    /// signal file, wait up to `grace`, then force-kill the process.
    pub async fn shutdown(&self, grace: Duration) -> Result<()> {
        let marker = shutdown_file_path(&self.state_dir, &self.id);
        std::fs::write(&marker, b"")?;

        let deadline = Instant::now() + grace;
        loop {
            match load_state_file(&self.state_dir, &self.id) {
                Ok(Some(state)) if state.is_running() => {}
                _ => break,
            }
            if Instant::now() >= deadline || self.cancel.is_cancelled() {
                if let Some(pid) = self.launcher_pid()? {
                    signal_process(pid, ProcessSignal::Kill);
                }
                break;
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }

        self.started.store(false, Ordering::SeqCst);
        self.persist().await
    }

    /// Serialize the complete wrapper state.
    pub async fn capture_state(&self) -> AgentStateSnapshot {
        self.state.read().await.clone()
    }

    /// Load a previously captured state. Afterwards the wrapper behaves
    /// as though it had accumulated the captured history.
    pub async fn restore_state(&self, snapshot: AgentStateSnapshot) -> Result<()> {
        {
            let mut state = self.state.write().await;
            *state = snapshot;
        }
        self.persist().await
    }

    /// True when the recent conversation volume is under `ceiling`
    /// entries per minute.
    pub async fn check_rate_limit(&self, ceiling: u32) -> bool {
        let cutoff = Utc::now() - chrono::Duration::seconds(60);
        let state = self.state.read().await;
        let recent = state
            .conversation_log
            .iter()
            .filter(|e| e.timestamp > cutoff)
            .count();
        (recent as u32) < ceiling
    }

    /// Record a billable operation against this agent.
    pub async fn track_cost(&self, operation: &str, micro_usd: u64) {
        {
            let mut state = self.state.write().await;
            state.total_cost_micro_usd += micro_usd;
        }
        self.events.emit(EventKind::CostTracked {
            agent_id: self.id.clone(),
            operation: operation.to_string(),
            micro_usd,
        });
    }

    pub async fn total_cost_micro_usd(&self) -> u64 {
        self.state.read().await.total_cost_micro_usd
    }

    /// Persist the current state atomically.
    pub async fn persist(&self) -> Result<()> {
        let snapshot = self.state.read().await.clone();
        self.write_snapshot(&snapshot)
    }

    fn write_snapshot(&self, snapshot: &AgentStateSnapshot) -> Result<()> {
        let path = wrapper_state_path(&self.state_dir, &self.id);
        atomic_write(&path, &serde_json::to_vec_pretty(snapshot)?)
    }

    /// Corrupted or missing persisted state is "no prior state".
    fn load_persisted(state_dir: &Path, id: &str) -> Option<AgentStateSnapshot> {
        let raw = std::fs::read_to_string(wrapper_state_path(state_dir, id)).ok()?;
        match serde_json::from_str(&raw) {
            Ok(snapshot) => Some(snapshot),
            Err(e) => {
                tracing::warn!(agent_id = %id, error = %e, "discarding corrupt wrapper state");
                None
            }
        }
    }

    fn launcher_pid(&self) -> Result<Option<u32>> {
        match load_state_file(&self.state_dir, &self.id) {
            Ok(Some(state)) => Ok(state.pid),
            Ok(None) => Ok(None),
            // A garbled state file should not block pause/shutdown.
            Err(_) => Ok(None),
        }
    }
}

fn push_capped<T>(log: &mut VecDeque<T>, entry: T, cap: usize) {
    log.push_back(entry);
    while log.len() > cap {
        log.pop_front();
    }
}

/// Result payload the launcher writes for a completed task.
#[derive(Debug, Deserialize)]
struct LauncherTaskReply {
    success: bool,
    #[serde(default)]
    output: serde_json::Value,
    #[serde(default)]
    error: Option<String>,
}

impl LauncherTaskReply {
    fn into_result(self, duration: Duration) -> TaskResult {
        if self.success {
            TaskResult::success(self.output, duration)
        } else {
            TaskResult::failure(
                self.error.unwrap_or_else(|| "task failed".to_string()),
                duration,
            )
        }
    }
}

enum ProcessSignal {
    Stop,
    Continue,
    Kill,
}

#[cfg(unix)]
fn signal_process(pid: u32, signal: ProcessSignal) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        ProcessSignal::Stop => Signal::SIGSTOP,
        ProcessSignal::Continue => Signal::SIGCONT,
        ProcessSignal::Kill => Signal::SIGKILL,
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        tracing::warn!(pid, signal = %signal, error = %e, "signal delivery failed");
    }
}

#[cfg(not(unix))]
fn signal_process(_pid: u32, _signal: ProcessSignal) {
    tracing::warn!("job-control signals unsupported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::state_file::state_file_path;
    use crate::agent::task::{TaskOutcome, TaskType};
    use crate::session::MockMultiplexer;
    use pretty_assertions::assert_eq;

    fn test_wrapper(dir: &Path) -> Arc<AgentWrapper> {
        let mut mux = MockMultiplexer::new();
        mux.expect_create().returning(|_, _, _| Ok(()));
        mux.expect_exec().returning(|_, _| Ok(()));
        mux.expect_kill().returning(|_| Ok(()));

        let events = EventStream::default();
        let sessions = SessionManager::new(
            Arc::new(mux),
            events.clone(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );

        let launcher = dir.join("launcher.sh");
        std::fs::write(&launcher, "#!/bin/sh\n").unwrap();

        AgentWrapper::new(
            "a1".to_string(),
            AgentType::Worker,
            dir.to_path_buf(),
            HashMap::new(),
            dir.to_path_buf(),
            launcher,
            Duration::from_millis(400),
            Duration::from_secs(3600),
            sessions,
            events,
            CancellationToken::new(),
        )
    }

    async fn attach_fresh_session(wrapper: &AgentWrapper, sessions: &Arc<SessionManager>) {
        let id = sessions
            .create_session("agent-a1", Path::new("/tmp"), &HashMap::new())
            .await
            .unwrap();
        wrapper.attach_session(id).await;
    }

    fn write_running_state(dir: &Path, id: &str) {
        let json = format!(
            r#"{{"id":"{id}","type":"worker","status":"running","pid":null,
                "startedAt":"2026-07-01T12:00:00Z","workingDirectory":"/w",
                "logFile":"/l/agent-{id}.log"}}"#
        );
        std::fs::write(state_file_path(dir, id), json).unwrap();
    }

    #[tokio::test]
    async fn test_start_command_and_readiness() {
        let dir = tempfile::TempDir::new().unwrap();
        let wrapper = test_wrapper(dir.path());

        assert!(!wrapper.is_ready());
        let command = wrapper.start_command().unwrap();
        assert_eq!(
            command,
            format!("{}/launcher.sh a1 worker", dir.path().display())
        );

        // Started but no state file yet.
        assert!(!wrapper.is_ready());

        write_running_state(dir.path(), "a1");
        assert!(wrapper.is_ready());
    }

    #[tokio::test]
    async fn test_missing_launcher_is_unavailable() {
        let dir = tempfile::TempDir::new().unwrap();
        let wrapper = test_wrapper(dir.path());
        std::fs::remove_file(dir.path().join("launcher.sh")).unwrap();

        let err = wrapper.start_command().unwrap_err();
        assert!(matches!(err, SupervisorError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_execute_task_success() {
        let dir = tempfile::TempDir::new().unwrap();
        let wrapper = test_wrapper(dir.path());
        attach_fresh_session(&wrapper, &wrapper.sessions.clone()).await;

        let result_path = result_file_path(dir.path(), "a1", "t1");
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            std::fs::write(
                result_path,
                r#"{"success": true, "output": {"lines": 12}}"#,
            )
            .unwrap();
        });

        let task = Task::new("t1".into(), "analyse module".into(), TaskType::Analysis);
        let result = wrapper.execute_task(task).await.unwrap();

        assert_eq!(result.outcome, TaskOutcome::Success);
        let state = wrapper.capture_state().await;
        assert_eq!(state.tasks_completed, 1);
        assert!(state.current_task.is_none());
        assert_eq!(state.conversation_log.len(), 2);
    }

    #[tokio::test]
    async fn test_second_task_rejected_while_busy() {
        let dir = tempfile::TempDir::new().unwrap();
        let wrapper = test_wrapper(dir.path());
        attach_fresh_session(&wrapper, &wrapper.sessions.clone()).await;

        let first = {
            let wrapper = Arc::clone(&wrapper);
            tokio::spawn(async move {
                let task = Task::new("slow".into(), "slow task".into(), TaskType::Code);
                wrapper.execute_task(task).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;

        let task = Task::new("t2".into(), "second task".into(), TaskType::Code);
        let err = wrapper.execute_task(task).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Busy(_)));

        // The in-flight task is unaffected; it times out on its own.
        let result = first.await.unwrap().unwrap();
        assert_eq!(result.outcome, TaskOutcome::Timeout);
    }

    #[tokio::test]
    async fn test_paused_rejects_tasks() {
        let dir = tempfile::TempDir::new().unwrap();
        let wrapper = test_wrapper(dir.path());

        wrapper.pause().await.unwrap();
        wrapper.pause().await.unwrap(); // idempotent

        let task = Task::new("t1".into(), "work".into(), TaskType::Test);
        let err = wrapper.execute_task(task).await.unwrap_err();
        assert!(matches!(err, SupervisorError::Conflict(_)));

        wrapper.resume().await.unwrap();
        wrapper.resume().await.unwrap(); // idempotent
        assert!(!wrapper.is_paused());
    }

    #[tokio::test]
    async fn test_capture_restore_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let wrapper = test_wrapper(dir.path());

        wrapper.track_cost("completion", 1_250).await;
        {
            let mut state = wrapper.state.write().await;
            state.conversation_log.push_back(ConversationEntry {
                timestamp: Utc::now(),
                role: ConversationRole::System,
                content: "warmup".into(),
                task_id: None,
            });
        }

        let captured = wrapper.capture_state().await;

        // Mutate past the checkpoint.
        wrapper.track_cost("completion", 9_999).await;

        wrapper.restore_state(captured.clone()).await.unwrap();
        let restored = wrapper.capture_state().await;
        assert_eq!(restored, captured);
        assert_eq!(restored.total_cost_micro_usd, 1_250);
    }

    #[tokio::test]
    async fn test_persisted_state_survives_reconstruction() {
        let dir = tempfile::TempDir::new().unwrap();
        {
            let wrapper = test_wrapper(dir.path());
            wrapper.track_cost("completion", 77).await;
            wrapper.persist().await.unwrap();
        }

        let wrapper = test_wrapper(dir.path());
        assert_eq!(wrapper.total_cost_micro_usd().await, 77);
    }

    #[tokio::test]
    async fn test_corrupt_persisted_state_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        std::fs::write(
            wrapper_state_path(dir.path(), "a1"),
            "<<definitely not json>>",
        )
        .unwrap();

        let wrapper = test_wrapper(dir.path());
        assert_eq!(wrapper.total_cost_micro_usd().await, 0);
    }

    #[tokio::test]
    async fn test_rate_limit_counts_recent_entries() {
        let dir = tempfile::TempDir::new().unwrap();
        let wrapper = test_wrapper(dir.path());

        assert!(wrapper.check_rate_limit(1).await);

        {
            let mut state = wrapper.state.write().await;
            for i in 0..3 {
                state.conversation_log.push_back(ConversationEntry {
                    timestamp: Utc::now(),
                    role: ConversationRole::Prompt,
                    content: format!("call {}", i),
                    task_id: None,
                });
            }
        }

        assert!(!wrapper.check_rate_limit(3).await);
        assert!(wrapper.check_rate_limit(10).await);
    }
}
