//! Lifecycle controller: the sole write path over the agent registry.
//!
//! Composes the session manager, agent wrappers, health monitor, and
//! message bus; enforces the agent state machine; owns recovery and
//! shutdown. Construct one controller at process start and pass it into
//! adapters explicitly.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::agent::state_file::{
    load_state_file, shutdown_file_path, state_file_path, wrapper_state_path,
};
use crate::agent::{
    AgentConfig, AgentRecord, AgentStatus, AgentType, AgentWrapper, Checkpoint, Task, TaskResult,
};
use crate::config::SupervisorConfig;
use crate::coordination::{Message, MessageBus, MessageKind};
use crate::error::{Result, SupervisorError};
use crate::events::{EventKind, EventStream, SupervisorEvent};
use crate::health::{HealthCheckConfig, HealthMonitor, Prober, StateFileProber};
use crate::session::{Multiplexer, SessionManager};
use crate::tmux::validate_session_name;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything needed to create an agent.
#[derive(Debug, Clone)]
pub struct CreateAgentSpec {
    pub id: String,
    pub agent_type: AgentType,
    pub project_id: String,
    pub config: AgentConfig,
    /// Defaults to `<state_dir>/workspaces/<id>`
    pub working_dir: Option<PathBuf>,
}

/// The supervisor core. One instance per process.
pub struct LifecycleController {
    weak_self: std::sync::Weak<LifecycleController>,
    config: SupervisorConfig,
    registry: DashMap<String, Arc<RwLock<AgentRecord>>>,
    wrappers: DashMap<String, Arc<AgentWrapper>>,
    inboxes: DashMap<String, async_channel::Receiver<Message>>,
    op_locks: DashMap<String, Arc<Mutex<()>>>,
    sessions: Arc<SessionManager>,
    health: Arc<HealthMonitor>,
    bus: Arc<MessageBus>,
    events: EventStream,
    cancel: CancellationToken,
    shutdown_latch: OnceCell<()>,
}

impl LifecycleController {
    /// Boot the supervisor core.
    ///
    /// Fatal failures here: the multiplexer being unavailable (checked
    /// by the caller constructing it) and state/log directory creation.
    pub async fn new(
        config: SupervisorConfig,
        mux: Arc<dyn Multiplexer>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        std::fs::create_dir_all(&config.state_dir)?;
        std::fs::create_dir_all(&config.log_dir)?;

        let events = EventStream::default();
        let cancel = CancellationToken::new();

        let sessions = SessionManager::new(
            mux,
            events.clone(),
            Duration::from_millis(config.session_reconcile_interval_ms),
            cancel.child_token(),
        );

        let prober: Arc<dyn Prober> = Arc::new(StateFileProber::new(config.state_dir.clone()));
        let health = HealthMonitor::new(
            prober,
            HealthCheckConfig::from(&config.health),
            Duration::from_millis(config.health_sweep_interval_ms),
            events.clone(),
            cancel.child_token(),
        );

        let bus = MessageBus::new((&config).into(), events.clone(), cancel.child_token());

        let controller = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            config,
            registry: DashMap::new(),
            wrappers: DashMap::new(),
            inboxes: DashMap::new(),
            op_locks: DashMap::new(),
            sessions,
            health,
            bus,
            events,
            cancel,
            shutdown_latch: OnceCell::new(),
        });

        controller.restore_from_disk()?;
        controller.spawn_recovery_loop();

        Ok(controller)
    }

    /// Subscribe to the ordered event stream.
    pub fn events(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.events.subscribe()
    }

    /// Create an agent: session, wrapper, health registration, and bus
    /// subscription. The record starts in `pending`.
    pub async fn create_agent(&self, spec: CreateAgentSpec) -> Result<String> {
        if spec.id.is_empty() {
            return Err(SupervisorError::InvalidArgument(
                "agent id cannot be empty".into(),
            ));
        }
        spec.config.validate()?;

        let session_name = session_name_for(&spec.id);
        validate_session_name(&session_name)?;

        let _guard = self.op_lock(&spec.id);
        let _guard = _guard.lock().await;

        if self.registry.contains_key(&spec.id) {
            return Err(SupervisorError::Conflict(format!(
                "agent {} already exists",
                spec.id
            )));
        }
        if self.registry.len() >= self.config.max_agents {
            return Err(SupervisorError::Conflict(format!(
                "agent ceiling reached ({})",
                self.config.max_agents
            )));
        }

        let working_dir = spec
            .working_dir
            .clone()
            .unwrap_or_else(|| self.config.state_dir.join("workspaces").join(&spec.id));
        std::fs::create_dir_all(&working_dir)?;

        let env = self.session_env(&spec);
        let session_id = self
            .sessions
            .create_session(&session_name, &working_dir, &env)
            .await?;

        if let Err(e) = self.health.register(
            &spec.id,
            Some(HealthCheckConfig::from(&self.config.health)),
        ) {
            let _ = self.sessions.kill_session(&session_id).await;
            return Err(e);
        }

        let wrapper = AgentWrapper::new(
            spec.id.clone(),
            spec.agent_type,
            working_dir,
            env,
            self.config.state_dir.clone(),
            self.config.resolved_launcher(),
            Duration::from_millis(spec.config.resources.task_timeout_ms),
            Duration::from_millis(self.config.persist_interval_ms),
            Arc::clone(&self.sessions),
            self.events.clone(),
            self.cancel.child_token(),
        );
        wrapper.attach_session(session_id.clone()).await;

        let inbox = self.bus.subscribe(&spec.id, &[spec.id.as_str()]);
        self.inboxes.insert(spec.id.clone(), inbox);

        let mut record = AgentRecord::new(
            spec.id.clone(),
            spec.agent_type,
            spec.project_id,
            spec.config,
        );
        record.session_id = Some(session_id);

        self.wrappers.insert(spec.id.clone(), wrapper);
        self.registry
            .insert(spec.id.clone(), Arc::new(RwLock::new(record)));

        tracing::info!(agent_id = %spec.id, "agent created");
        self.events.emit(EventKind::AgentCreated {
            agent_id: spec.id.clone(),
        });
        Ok(spec.id)
    }

    /// Launch the agent and wait for readiness (bounded at the
    /// configured start timeout, 30 s by default).
    pub async fn start_agent(&self, agent_id: &str) -> Result<()> {
        let _guard = self.op_lock(agent_id);
        let _guard = _guard.lock().await;

        let record = self.record(agent_id)?;
        let wrapper = self.wrapper(agent_id)?;

        self.transition(agent_id, &record, AgentStatus::Starting, false)
            .await?;

        match self.launch(agent_id, &record, &wrapper).await {
            Ok(()) => {
                self.events.emit(EventKind::AgentStarted {
                    agent_id: agent_id.to_string(),
                });
                self.transition(agent_id, &record, AgentStatus::Running, false)
                    .await?;
                if !self.bus.is_connected(agent_id) {
                    let inbox = self.bus.subscribe(agent_id, &[agent_id]);
                    self.inboxes.insert(agent_id.to_string(), inbox);
                }
                record.write().await.metrics.last_activity = Utc::now();
                Ok(())
            }
            Err(e) => {
                tracing::error!(agent_id = %agent_id, error = %e, "agent start failed");
                self.transition(agent_id, &record, AgentStatus::Error, true)
                    .await?;
                Err(e)
            }
        }
    }

    async fn launch(
        &self,
        agent_id: &str,
        record: &Arc<RwLock<AgentRecord>>,
        wrapper: &Arc<AgentWrapper>,
    ) -> Result<()> {
        // A stopped or reconstructed agent has no live session.
        let session_id = match record.read().await.session_id.clone() {
            Some(id) => id,
            None => {
                let session_name = session_name_for(agent_id);
                let working_dir = self
                    .config
                    .state_dir
                    .join("workspaces")
                    .join(agent_id);
                std::fs::create_dir_all(&working_dir)?;
                let env = record.read().await.config.env.clone();
                let id = self
                    .sessions
                    .create_session(&session_name, &working_dir, &env)
                    .await?;
                record.write().await.session_id = Some(id.clone());
                wrapper.attach_session(id.clone()).await;
                id
            }
        };

        if !self.health.is_registered(agent_id) {
            self.health.register(
                agent_id,
                Some(HealthCheckConfig::from(&self.config.health)),
            )?;
        }

        let command = wrapper.start_command()?;
        self.sessions.exec_in_session(&session_id, &command).await?;

        let deadline = Instant::now() + Duration::from_millis(self.config.start_timeout_ms);
        loop {
            if wrapper.is_ready() {
                return Ok(());
            }
            if self.cancel.is_cancelled() {
                return Err(SupervisorError::Cancelled("supervisor shutting down".into()));
            }
            if Instant::now() >= deadline {
                return Err(SupervisorError::Timeout(format!(
                    "agent {} not ready within {}ms",
                    agent_id, self.config.start_timeout_ms
                )));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }
    }

    /// Stop an agent. Graceful stops get the configured grace period
    /// (5 s by default) before the session is killed.
    pub async fn stop_agent(&self, agent_id: &str, graceful: bool) -> Result<()> {
        let _guard = self.op_lock(agent_id);
        let _guard = _guard.lock().await;
        self.stop_agent_locked(agent_id, graceful, false).await
    }

    async fn stop_agent_locked(&self, agent_id: &str, graceful: bool, force: bool) -> Result<()> {
        let record = self.record(agent_id)?;
        let wrapper = self.wrapper(agent_id)?;

        if record.read().await.status == AgentStatus::Stopped {
            return Ok(());
        }

        self.transition(agent_id, &record, AgentStatus::Stopping, force)
            .await?;

        if graceful {
            let grace = Duration::from_millis(self.config.stop_timeout_ms);
            if let Err(e) = wrapper.shutdown(grace).await {
                tracing::warn!(agent_id = %agent_id, error = %e, "graceful shutdown failed");
            }
        }

        if let Some(session_id) = record.write().await.session_id.take() {
            self.sessions.kill_session(&session_id).await?;
        }

        self.transition(agent_id, &record, AgentStatus::Stopped, force)
            .await?;

        self.health.unregister(agent_id);
        // Keep the queue and routes: messages to a stopped agent
        // accumulate and replay when it runs again.
        self.bus.disconnect(agent_id);
        self.inboxes.remove(agent_id);

        tracing::info!(agent_id = %agent_id, graceful, "agent stopped");
        self.events.emit(EventKind::AgentStopped {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// Valid only while running.
    pub async fn pause_agent(&self, agent_id: &str) -> Result<()> {
        let _guard = self.op_lock(agent_id);
        let _guard = _guard.lock().await;

        let record = self.record(agent_id)?;
        let wrapper = self.wrapper(agent_id)?;

        self.transition(agent_id, &record, AgentStatus::Paused, false)
            .await?;
        wrapper.pause().await
    }

    /// Valid only while paused.
    pub async fn resume_agent(&self, agent_id: &str) -> Result<()> {
        let _guard = self.op_lock(agent_id);
        let _guard = _guard.lock().await;

        let record = self.record(agent_id)?;
        let wrapper = self.wrapper(agent_id)?;

        let current = record.read().await.status;
        if current != AgentStatus::Paused {
            return Err(SupervisorError::InvalidTransition {
                from: current,
                to: AgentStatus::Running,
            });
        }

        self.transition(agent_id, &record, AgentStatus::Running, false)
            .await?;
        wrapper.resume().await
    }

    /// Remove an agent entirely. A non-stopped agent is force-stopped
    /// first.
    pub async fn remove_agent(&self, agent_id: &str) -> Result<()> {
        {
            let _guard = self.op_lock(agent_id);
            let _guard = _guard.lock().await;

            let record = self.record(agent_id)?;
            if record.read().await.status != AgentStatus::Stopped {
                self.stop_agent_locked(agent_id, false, true).await?;
            }

            self.registry.remove(agent_id);
            self.wrappers.remove(agent_id);
            self.inboxes.remove(agent_id);
            self.health.unregister(agent_id);
            self.bus.unsubscribe(agent_id, &[]);

            // Without this a removed agent would be resurrected by the
            // next boot-time scan.
            let _ = std::fs::remove_file(state_file_path(&self.config.state_dir, agent_id));
            let _ = std::fs::remove_file(wrapper_state_path(&self.config.state_dir, agent_id));
            let _ = std::fs::remove_file(shutdown_file_path(&self.config.state_dir, agent_id));
        }
        self.op_locks.remove(agent_id);

        tracing::info!(agent_id = %agent_id, "agent removed");
        self.events.emit(EventKind::AgentRemoved {
            agent_id: agent_id.to_string(),
        });
        Ok(())
    }

    /// Capture the wrapper's state as a new checkpoint. At most
    /// [`crate::agent::MAX_CHECKPOINTS`] are retained, oldest evicted.
    pub async fn create_checkpoint(&self, agent_id: &str, description: &str) -> Result<String> {
        let record = self.record(agent_id)?;
        let wrapper = self.wrapper(agent_id)?;

        let state = wrapper.capture_state().await;
        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            state,
            description: description.to_string(),
        };
        let checkpoint_id = checkpoint.id.clone();

        record.write().await.push_checkpoint(checkpoint);

        self.events.emit(EventKind::AgentCheckpoint {
            agent_id: agent_id.to_string(),
            checkpoint_id: checkpoint_id.clone(),
        });
        Ok(checkpoint_id)
    }

    /// Restore a previously captured checkpoint. The state-machine
    /// status is deliberately untouched.
    pub async fn rollback(&self, agent_id: &str, checkpoint_id: &str) -> Result<()> {
        let record = self.record(agent_id)?;
        let wrapper = self.wrapper(agent_id)?;

        let state = {
            let record = record.read().await;
            record
                .find_checkpoint(checkpoint_id)
                .map(|c| c.state.clone())
                .ok_or_else(|| SupervisorError::not_found("checkpoint", checkpoint_id))?
        };

        wrapper.restore_state(state).await?;

        self.events.emit(EventKind::AgentRollback {
            agent_id: agent_id.to_string(),
            checkpoint_id: checkpoint_id.to_string(),
        });
        Ok(())
    }

    /// Deliver a payload to an agent through the message bus.
    pub async fn send_message(&self, agent_id: &str, payload: serde_json::Value) -> Result<Uuid> {
        let message = Message::new(
            "supervisor",
            vec![agent_id.to_string()],
            MessageKind::Event,
            payload,
        )
        .with_max_attempts(self.config.message_retry_max);
        let message_id = message.id;

        self.bus.send(message).await?;
        self.events.emit(EventKind::AgentMessage {
            agent_id: agent_id.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(message_id)
    }

    /// Run a task on a running agent. The wrapper enforces the
    /// single-in-flight rule.
    pub async fn run_task(&self, agent_id: &str, task: Task) -> Result<TaskResult> {
        let record = self.record(agent_id)?;
        let wrapper = self.wrapper(agent_id)?;

        let status = record.read().await.status;
        if status != AgentStatus::Running {
            return Err(SupervisorError::Conflict(format!(
                "agent {} is {}, not running",
                agent_id, status
            )));
        }

        record.write().await.task_id = Some(task.id.clone());
        let result = wrapper.execute_task(task).await;

        let mut state = record.write().await;
        state.task_id = None;
        if let Ok(task_result) = &result {
            if task_result.is_success() {
                state.metrics.tasks_completed += 1;
            }
            state.metrics.total_runtime_ms += task_result.duration.as_millis() as u64;
            state.metrics.last_activity = Utc::now();
        }
        drop(state);

        result
    }

    /// Snapshot of one agent record, with the live health sample
    /// merged in.
    pub async fn get_agent(&self, agent_id: &str) -> Result<AgentRecord> {
        let record = self.record(agent_id)?;
        let mut snapshot = record.read().await.clone();
        if let Some(health) = self.health.health_state(agent_id).await {
            snapshot.health = health;
        }
        Ok(snapshot)
    }

    pub async fn list_agents(&self) -> Vec<AgentRecord> {
        let mut agents = Vec::with_capacity(self.registry.len());
        let records: Vec<Arc<RwLock<AgentRecord>>> =
            self.registry.iter().map(|e| e.value().clone()).collect();
        for record in records {
            agents.push(record.read().await.clone());
        }
        agents
    }

    pub fn agent_count(&self) -> usize {
        self.registry.len()
    }

    /// The agent's message inbox, for adapters that consume on its
    /// behalf.
    pub fn inbox(&self, agent_id: &str) -> Option<async_channel::Receiver<Message>> {
        self.inboxes.get(agent_id).map(|e| e.value().clone())
    }

    /// Add topic subscriptions for a created agent.
    pub fn subscribe_topics(&self, agent_id: &str, topics: &[&str]) -> Result<()> {
        if !self.registry.contains_key(agent_id) {
            return Err(SupervisorError::not_found("agent", agent_id));
        }
        let inbox = self.bus.subscribe(agent_id, topics);
        self.inboxes.insert(agent_id.to_string(), inbox);
        Ok(())
    }

    pub async fn broadcast(&self, from: &str, topic: &str, payload: serde_json::Value) -> Result<()> {
        self.bus.broadcast(from, topic, payload).await
    }

    pub async fn request(
        &self,
        from: &str,
        to: &str,
        payload: serde_json::Value,
        timeout_ms: u64,
    ) -> Result<Message> {
        self.bus.request(from, to, payload, timeout_ms).await
    }

    /// Idempotent, concurrency-safe shutdown: graceful stops in
    /// parallel, then sessions, health monitor, and bus, in that order.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown_latch
            .get_or_init(|| async {
                tracing::info!("supervisor shutting down");

                let ids: Vec<String> =
                    self.registry.iter().map(|e| e.key().clone()).collect();
                let mut stops = tokio::task::JoinSet::new();
                for agent_id in ids {
                    if let Some(controller) = self.weak_self.upgrade() {
                        stops.spawn(async move {
                            let _guard = controller.op_lock(&agent_id);
                            let _guard = _guard.lock().await;
                            if let Err(e) =
                                controller.stop_agent_locked(&agent_id, true, true).await
                            {
                                tracing::warn!(agent_id = %agent_id, error = %e, "stop during shutdown failed");
                            }
                        });
                    }
                }
                while stops.join_next().await.is_some() {}

                self.sessions.shutdown().await;
                self.health.shutdown().await;
                self.bus.shutdown().await;
                self.cancel.cancel();
            })
            .await;
        Ok(())
    }

    // ---- internals ----

    fn spawn_recovery_loop(&self) {
        let Some(controller) = self.weak_self.upgrade() else {
            return;
        };
        let mut events = self.events.subscribe();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(SupervisorEvent {
                            kind: EventKind::AgentUnhealthy { agent_id, .. },
                            ..
                        }) => {
                            controller.handle_unhealthy(&agent_id).await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "recovery loop lagged on event stream");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// React to an unhealthy agent: restart while the failure count is
    /// within bounds, otherwise stop it and declare failure. Only the
    /// controller has this authority.
    async fn handle_unhealthy(&self, agent_id: &str) {
        if !self.registry.contains_key(agent_id) {
            return;
        }

        let failures = self.health.failure_count(agent_id);
        if failures <= 3 {
            tracing::warn!(agent_id = %agent_id, failures, "restarting unhealthy agent");
            match self.restart_agent(agent_id).await {
                Ok(()) => {
                    self.events.emit(EventKind::AgentRecovered {
                        agent_id: agent_id.to_string(),
                    });
                }
                Err(e) => {
                    tracing::error!(agent_id = %agent_id, error = %e, "restart failed");
                    self.events.emit(EventKind::AgentFailed {
                        agent_id: agent_id.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        } else {
            tracing::error!(agent_id = %agent_id, failures, "giving up on unhealthy agent");
            let _guard = self.op_lock(agent_id);
            let _guard = _guard.lock().await;
            let _ = self.stop_agent_locked(agent_id, false, true).await;
            self.events.emit(EventKind::AgentFailed {
                agent_id: agent_id.to_string(),
                reason: format!("{} consecutive health failures", failures),
            });
        }
    }

    async fn restart_agent(&self, agent_id: &str) -> Result<()> {
        {
            let _guard = self.op_lock(agent_id);
            let _guard = _guard.lock().await;
            self.stop_agent_locked(agent_id, false, true).await?;
        }
        tokio::time::sleep(Duration::from_millis(self.config.restart_pause_ms)).await;
        self.start_agent(agent_id).await
    }

    /// Rebuild registry entries from agent state files left on disk by
    /// a previous run. Reconstructed agents come back in `error` (or
    /// `stopped`) awaiting an explicit start.
    fn restore_from_disk(&self) -> Result<()> {
        for entry in WalkDir::new(&self.config.state_dir)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let name = entry.file_name().to_string_lossy().to_string();
            let Some(agent_id) = name
                .strip_prefix("agent-")
                .and_then(|n| n.strip_suffix(".json"))
            else {
                continue;
            };

            let state = match load_state_file(&self.config.state_dir, agent_id) {
                Ok(Some(state)) => state,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(agent_id = %agent_id, error = %e, "skipping unreadable state file");
                    continue;
                }
            };

            let Ok(agent_type) = state.agent_type.parse::<AgentType>() else {
                tracing::warn!(agent_id = %agent_id, agent_type = %state.agent_type, "skipping unknown agent type");
                continue;
            };

            let mut record = AgentRecord::new(
                agent_id.to_string(),
                agent_type,
                String::new(),
                AgentConfig {
                    max_concurrent_tasks: 1,
                    env: state.environment.clone(),
                    ..Default::default()
                },
            );
            record.status = if state.status == "stopped" {
                AgentStatus::Stopped
            } else {
                AgentStatus::Error
            };

            let wrapper = AgentWrapper::new(
                agent_id.to_string(),
                agent_type,
                state.working_directory.clone(),
                state.environment.clone(),
                self.config.state_dir.clone(),
                self.config.resolved_launcher(),
                Duration::from_millis(record.config.resources.task_timeout_ms),
                Duration::from_millis(self.config.persist_interval_ms),
                Arc::clone(&self.sessions),
                self.events.clone(),
                self.cancel.child_token(),
            );

            // Error-state agents stay under health scan until removed.
            if record.status == AgentStatus::Error {
                let _ = self.health.register(
                    agent_id,
                    Some(HealthCheckConfig::from(&self.config.health)),
                );
            }

            tracing::info!(agent_id = %agent_id, status = %record.status, "agent restored from disk");
            self.wrappers.insert(agent_id.to_string(), wrapper);
            self.registry
                .insert(agent_id.to_string(), Arc::new(RwLock::new(record)));
        }
        Ok(())
    }

    /// Apply a state-machine transition, emitting `status_changed`.
    /// Rejections leave the record untouched and emit nothing.
    async fn transition(
        &self,
        agent_id: &str,
        record: &Arc<RwLock<AgentRecord>>,
        to: AgentStatus,
        force: bool,
    ) -> Result<AgentStatus> {
        let mut state = record.write().await;
        let from = state.status;
        if from == to {
            return Ok(from);
        }
        if !force && !from.can_transition_to(to) {
            return Err(SupervisorError::InvalidTransition { from, to });
        }
        state.status = to;
        drop(state);

        self.events.emit(EventKind::AgentStatusChanged {
            agent_id: agent_id.to_string(),
            status: to,
        });
        Ok(from)
    }

    fn session_env(&self, spec: &CreateAgentSpec) -> HashMap<String, String> {
        let mut env = spec.config.env.clone();
        env.insert("AGENT_ID".to_string(), spec.id.clone());
        env.insert("AGENT_TYPE".to_string(), spec.agent_type.to_string());
        env.insert(
            "STATE_DIR".to_string(),
            self.config.state_dir.to_string_lossy().to_string(),
        );
        env.insert(
            "LOG_DIR".to_string(),
            self.config.log_dir.to_string_lossy().to_string(),
        );
        env
    }

    fn record(&self, agent_id: &str) -> Result<Arc<RwLock<AgentRecord>>> {
        self.registry
            .get(agent_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SupervisorError::not_found("agent", agent_id))
    }

    fn wrapper(&self, agent_id: &str) -> Result<Arc<AgentWrapper>> {
        self.wrappers
            .get(agent_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SupervisorError::not_found("agent", agent_id))
    }

    fn op_lock(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.op_locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn session_name_for(agent_id: &str) -> String {
    format!("agent-{}", agent_id)
}
