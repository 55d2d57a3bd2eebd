//! Session management over an abstract terminal multiplexer.
//!
//! The supervisor depends on the [`Multiplexer`] seam, not on tmux
//! itself; [`crate::tmux::TmuxClient`] is the production
//! implementation. The [`SessionManager`] keeps its own map of known
//! sessions and reconciles it against the live set in the background,
//! emitting `session_terminated` when a session disappears underneath
//! it.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, SupervisorError};
use crate::events::{EventKind, EventStream};
use crate::tmux::TmuxClient;

/// Opaque, unique, stable handle for a managed session.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Multiplexer-side description of a session, as returned by `inspect`.
#[derive(Debug, Clone, PartialEq)]
pub struct MuxSessionInfo {
    pub name: String,
    /// Unix epoch seconds
    pub created: i64,
    /// Unix epoch seconds of last observed activity
    pub last_activity: Option<i64>,
    pub windows: u32,
}

/// The terminal-multiplexer operations the supervisor relies on.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Multiplexer: Send + Sync {
    /// Create a named detached session with `env` exported before any
    /// command runs in it.
    async fn create(
        &self,
        name: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<()>;

    /// Push a command to the session's primary shell; returns once the
    /// write is accepted.
    async fn exec(&self, name: &str, command: &str) -> Result<()>;

    /// Capture the session's visible output.
    async fn capture(&self, name: &str) -> Result<String>;

    /// Best-effort, idempotent kill.
    async fn kill(&self, name: &str) -> Result<()>;

    /// Names of all live sessions.
    async fn list(&self) -> Result<Vec<String>>;

    async fn inspect(&self, name: &str) -> Result<MuxSessionInfo>;
}

#[async_trait]
impl Multiplexer for TmuxClient {
    async fn create(
        &self,
        name: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        self.create_session(name, working_dir, env).await
    }

    async fn exec(&self, name: &str, command: &str) -> Result<()> {
        self.send_command(name, command).await
    }

    async fn capture(&self, name: &str) -> Result<String> {
        self.capture_pane(name).await
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.kill_session(name).await
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self
            .list_sessions()
            .await?
            .into_iter()
            .map(|s| s.name)
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<MuxSessionInfo> {
        let info = self.get_session_info(name).await?;
        Ok(MuxSessionInfo {
            name: info.name,
            created: info.created,
            last_activity: info.last_activity,
            windows: info.windows,
        })
    }
}

/// Supervisor-side record of a session it created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Pool of named, isolated process containers.
pub struct SessionManager {
    mux: Arc<dyn Multiplexer>,
    sessions: DashMap<SessionId, SessionRecord>,
    by_name: DashMap<String, SessionId>,
    events: EventStream,
    cancel: CancellationToken,
}

impl SessionManager {
    /// Build the manager and spawn its reconciliation loop.
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        events: EventStream,
        reconcile_interval: Duration,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            mux,
            sessions: DashMap::new(),
            by_name: DashMap::new(),
            events,
            cancel: cancel.clone(),
        });

        let scanner = Arc::clone(&manager);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick completes immediately; skip it so
            // a freshly booted manager scans after one full period.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = scanner.reconcile().await {
                            tracing::warn!(error = %e, "session reconciliation failed");
                        }
                    }
                }
            }
        });

        manager
    }

    /// Create an isolated session. Fails with `Conflict` when a live
    /// session of the same name exists.
    pub async fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<SessionId> {
        if self.by_name.contains_key(name) {
            return Err(SupervisorError::Conflict(format!(
                "session '{}' already managed",
                name
            )));
        }

        self.mux.create(name, working_dir, env).await?;

        let record = SessionRecord {
            id: SessionId::new(),
            name: name.to_string(),
            working_dir: working_dir.to_path_buf(),
            created_at: Utc::now(),
        };
        let id = record.id.clone();
        self.by_name.insert(name.to_string(), id.clone());
        self.sessions.insert(id.clone(), record);

        tracing::info!(session = %name, id = %id, "session created");
        Ok(id)
    }

    /// Push a command into a session. Transient multiplexer errors
    /// surface to the caller; there is no retry here.
    pub async fn exec_in_session(&self, id: &SessionId, command: &str) -> Result<()> {
        let name = self.name_of(id)?;
        self.mux.exec(&name, command).await
    }

    pub async fn capture_output(&self, id: &SessionId) -> Result<String> {
        let name = self.name_of(id)?;
        self.mux.capture(&name).await
    }

    /// Best-effort teardown. Idempotent: killing an unknown or
    /// already-dead session succeeds.
    pub async fn kill_session(&self, id: &SessionId) -> Result<()> {
        let Some((_, record)) = self.sessions.remove(id) else {
            return Ok(());
        };
        self.by_name.remove(&record.name);
        self.mux.kill(&record.name).await
    }

    pub fn list_sessions(&self) -> Vec<SessionRecord> {
        self.sessions.iter().map(|e| e.value().clone()).collect()
    }

    pub async fn inspect(&self, id: &SessionId) -> Result<MuxSessionInfo> {
        let name = self.name_of(id)?;
        self.mux.inspect(&name).await
    }

    pub fn find_by_name(&self, name: &str) -> Option<SessionId> {
        self.by_name.get(name).map(|e| e.value().clone())
    }

    /// Diff the local map against the live set; sessions that vanished
    /// out-of-band are dropped with a `session_terminated` event.
    async fn reconcile(&self) -> Result<()> {
        let live: std::collections::HashSet<String> =
            self.mux.list().await?.into_iter().collect();

        let dead: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| !live.contains(&e.value().name))
            .map(|e| e.key().clone())
            .collect();

        for id in dead {
            if let Some((_, record)) = self.sessions.remove(&id) {
                self.by_name.remove(&record.name);
                tracing::warn!(session = %record.name, "session disappeared");
                self.events.emit(EventKind::SessionTerminated {
                    session_id: id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Stop the reconciler and kill every remaining session.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            if let Err(e) = self.kill_session(&id).await {
                tracing::warn!(session_id = %id, error = %e, "failed to kill session");
            }
        }
    }

    fn name_of(&self, id: &SessionId) -> Result<String> {
        self.sessions
            .get(id)
            .map(|e| e.value().name.clone())
            .ok_or_else(|| SupervisorError::not_found("session", id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn manager_with(mux: MockMultiplexer) -> Arc<SessionManager> {
        SessionManager::new(
            Arc::new(mux),
            EventStream::default(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_create_and_exec() {
        let mut mux = MockMultiplexer::new();
        mux.expect_create().times(1).returning(|_, _, _| Ok(()));
        mux.expect_exec()
            .with(eq("agent-a1"), eq("echo hi"))
            .times(1)
            .returning(|_, _| Ok(()));

        let manager = manager_with(mux);
        let id = manager
            .create_session("agent-a1", Path::new("/tmp"), &HashMap::new())
            .await
            .unwrap();

        manager.exec_in_session(&id, "echo hi").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let mut mux = MockMultiplexer::new();
        mux.expect_create().times(1).returning(|_, _, _| Ok(()));

        let manager = manager_with(mux);
        manager
            .create_session("agent-a1", Path::new("/tmp"), &HashMap::new())
            .await
            .unwrap();

        let err = manager
            .create_session("agent-a1", Path::new("/tmp"), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SupervisorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_kill_is_idempotent() {
        let mut mux = MockMultiplexer::new();
        mux.expect_create().returning(|_, _, _| Ok(()));
        mux.expect_kill().times(1).returning(|_| Ok(()));

        let manager = manager_with(mux);
        let id = manager
            .create_session("agent-a1", Path::new("/tmp"), &HashMap::new())
            .await
            .unwrap();

        manager.kill_session(&id).await.unwrap();
        // Second kill: session unknown, still succeeds.
        manager.kill_session(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_emits_session_terminated() {
        let mut mux = MockMultiplexer::new();
        mux.expect_create().returning(|_, _, _| Ok(()));
        // The session is gone from the live set.
        mux.expect_list().returning(|| Ok(vec![]));

        let events = EventStream::default();
        let manager = SessionManager::new(
            Arc::new(mux),
            events.clone(),
            Duration::from_secs(3600),
            CancellationToken::new(),
        );
        let mut rx = events.subscribe();

        let id = manager
            .create_session("agent-a1", Path::new("/tmp"), &HashMap::new())
            .await
            .unwrap();

        manager.reconcile().await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event.kind,
            EventKind::SessionTerminated {
                session_id: id.to_string()
            }
        );
        assert!(manager.list_sessions().is_empty());
    }
}
