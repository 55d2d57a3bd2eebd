//! Shared fixtures: an in-memory multiplexer and a stub launcher that
//! answers through the real state-file contract.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use overseer::error::{Result, SupervisorError};
use overseer::session::MuxSessionInfo;
use overseer::{Multiplexer, SupervisorConfig};

/// Multiplexer double. Sessions live in a set; exec'ing a launcher
/// start command arms a delayed state-file write, exactly what the real
/// launcher would do, so readiness and health flow through the genuine
/// file contract.
pub struct FakeMultiplexer {
    state_dir: PathBuf,
    ready_delay: Duration,
    sessions: Mutex<HashSet<String>>,
    exec_log: Mutex<Vec<(String, String)>>,
}

impl FakeMultiplexer {
    pub fn new(state_dir: PathBuf, ready_delay: Duration) -> Self {
        Self {
            state_dir,
            ready_delay,
            sessions: Mutex::new(HashSet::new()),
            exec_log: Mutex::new(Vec::new()),
        }
    }

    // Not every test crate inspects the log.
    #[allow(dead_code)]
    pub async fn exec_count(&self) -> usize {
        self.exec_log.lock().await.len()
    }

    fn write_running_state(state_dir: &Path, agent_id: &str, agent_type: &str) {
        let body = serde_json::json!({
            "id": agent_id,
            "type": agent_type,
            "status": "running",
            "pid": null,
            "startedAt": chrono::Utc::now().to_rfc3339(),
            "workingDirectory": state_dir.join("workspaces").join(agent_id),
            "logFile": state_dir.join(format!("agent-{}.log", agent_id)),
            "environment": {},
            "metrics": {
                "commandsExecuted": 1,
                "uptime": 1,
                "memoryUsage": 25.0,
                "cpuUsage": 2.0
            }
        });
        std::fs::write(
            state_dir.join(format!("agent-{}.json", agent_id)),
            serde_json::to_vec_pretty(&body).unwrap(),
        )
        .unwrap();
    }

    fn complete_task(state_dir: &Path, agent_id: &str) {
        let spool = state_dir.join(format!("task-{}.json", agent_id));
        let Ok(raw) = std::fs::read_to_string(&spool) else {
            return;
        };
        let Ok(task) = serde_json::from_str::<serde_json::Value>(&raw) else {
            return;
        };
        let Some(task_id) = task["id"].as_str() else {
            return;
        };
        std::fs::write(
            state_dir.join(format!("result-{}-{}.json", agent_id, task_id)),
            serde_json::json!({
                "success": true,
                "output": { "task": task_id }
            })
            .to_string(),
        )
        .unwrap();
    }
}

#[async_trait]
impl Multiplexer for FakeMultiplexer {
    async fn create(
        &self,
        name: &str,
        _working_dir: &Path,
        _env: &std::collections::HashMap<String, String>,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        if !sessions.insert(name.to_string()) {
            return Err(SupervisorError::Conflict(format!(
                "session '{}' already exists",
                name
            )));
        }
        Ok(())
    }

    async fn exec(&self, name: &str, command: &str) -> Result<()> {
        self.exec_log
            .lock()
            .await
            .push((name.to_string(), command.to_string()));

        let words: Vec<&str> = command.split_whitespace().collect();
        match words.as_slice() {
            // "<launcher> task <agent_id> <task_type>": complete the
            // spooled task.
            [_, "task", agent_id, _] => {
                let state_dir = self.state_dir.clone();
                let agent_id = agent_id.to_string();
                let delay = self.ready_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::complete_task(&state_dir, &agent_id);
                });
            }
            // "<launcher> <agent_id> <agent_type>": come up as running.
            [_, agent_id, agent_type] => {
                let state_dir = self.state_dir.clone();
                let agent_id = agent_id.to_string();
                let agent_type = agent_type.to_string();
                let delay = self.ready_delay;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    Self::write_running_state(&state_dir, &agent_id, &agent_type);
                });
            }
            _ => {}
        }
        Ok(())
    }

    async fn capture(&self, _name: &str) -> Result<String> {
        Ok(String::new())
    }

    async fn kill(&self, name: &str) -> Result<()> {
        self.sessions.lock().await.remove(name);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>> {
        Ok(self.sessions.lock().await.iter().cloned().collect())
    }

    async fn inspect(&self, name: &str) -> Result<MuxSessionInfo> {
        if !self.sessions.lock().await.contains(name) {
            return Err(SupervisorError::not_found("session", name));
        }
        Ok(MuxSessionInfo {
            name: name.to_string(),
            created: 0,
            last_activity: None,
            windows: 1,
        })
    }
}

/// Config with contract semantics but millisecond timers, rooted in a
/// temp dir. Health probing is effectively off unless a test turns it
/// on.
pub fn test_config(root: &Path) -> SupervisorConfig {
    let mut config = SupervisorConfig {
        state_dir: root.join("state"),
        log_dir: root.join("logs"),
        ..Default::default()
    };
    config.health.health_interval_ms = 3_600_000;
    config.health.health_timeout_ms = 500;
    config.health.health_retry_delay_ms = 10;
    config.start_timeout_ms = 3_000;
    config.stop_timeout_ms = 200;
    config.restart_pause_ms = 50;
    config.session_reconcile_interval_ms = 3_600_000;
    config.health_sweep_interval_ms = 3_600_000;
    config.message_sweep_interval_ms = 50;
    config.message_retry_base_ms = 20;
    config
}

/// The launcher script has to exist for `start_command` to succeed.
pub fn install_stub_launcher(config: &SupervisorConfig) {
    std::fs::create_dir_all(&config.state_dir).unwrap();
    std::fs::write(config.resolved_launcher(), "#!/bin/sh\n").unwrap();
}
