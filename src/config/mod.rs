//! Supervisor configuration, loaded from the environment.
//!
//! Every timing knob defaults to its contractual value; embedding
//! processes override them through environment variables (`STATE_DIR`,
//! `MAX_AGENTS`, `HEALTH_INTERVAL_MS`, ...) picked up by the `config`
//! crate's `Environment` source.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{Result, SupervisorError};

/// Default probe settings applied to new health registrations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct HealthDefaults {
    /// Probe period per agent
    pub health_interval_ms: u64,
    /// Per-probe deadline
    pub health_timeout_ms: u64,
    /// Consecutive failures before an agent is declared unhealthy
    pub health_max_failures: u32,
    /// Wait before a recovery re-probe
    pub health_retry_delay_ms: u64,
}

impl Default for HealthDefaults {
    fn default() -> Self {
        Self {
            health_interval_ms: 30_000,
            health_timeout_ms: 10_000,
            health_max_failures: 3,
            health_retry_delay_ms: 5_000,
        }
    }
}

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Root for agent state files (`agent-<id>.json`, shutdown markers)
    pub state_dir: PathBuf,
    /// Root for agent log files
    pub log_dir: PathBuf,
    /// Launcher script invoked to start agents; resolved against
    /// `state_dir` when relative
    pub launcher_path: PathBuf,
    /// Hard ceiling enforced at agent creation
    pub max_agents: usize,

    #[serde(flatten)]
    pub health: HealthDefaults,

    /// Delivery attempts per message before giving up
    pub message_retry_max: u32,
    /// Queue depth that triggers a `queue_pressure` event
    pub message_queue_soft_limit: usize,
    /// Base delay for delivery retries (attempts x base)
    pub message_retry_base_ms: u64,
    /// Period of the queued-message sweep
    pub message_sweep_interval_ms: u64,
    /// Period of the conversation-history cleanup
    pub history_cleanup_interval_ms: u64,
    /// Conversations idle longer than this are discarded
    pub history_idle_ms: u64,

    /// Period of the session reconciliation scan
    pub session_reconcile_interval_ms: u64,
    /// Period of the wrapper state persistence
    pub persist_interval_ms: u64,
    /// Period of the global health sweep
    pub health_sweep_interval_ms: u64,

    /// Readiness wait bound for `start_agent`
    pub start_timeout_ms: u64,
    /// Graceful-shutdown bound before forcing termination
    pub stop_timeout_ms: u64,
    /// Pause between stop and start during automatic recovery
    pub restart_pause_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/var/lib/overseer/state"),
            log_dir: PathBuf::from("/var/lib/overseer/logs"),
            launcher_path: PathBuf::from("agent-launcher.sh"),
            max_agents: 32,
            health: HealthDefaults::default(),
            message_retry_max: 3,
            message_queue_soft_limit: 1_000,
            message_retry_base_ms: 5_000,
            message_sweep_interval_ms: 5_000,
            history_cleanup_interval_ms: 60_000,
            history_idle_ms: 24 * 60 * 60 * 1_000,
            session_reconcile_interval_ms: 10_000,
            persist_interval_ms: 30_000,
            health_sweep_interval_ms: 60_000,
            start_timeout_ms: 30_000,
            stop_timeout_ms: 5_000,
            restart_pause_ms: 2_000,
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from the process environment, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let loader = config::Config::builder()
            .add_source(config::Environment::default())
            .build()
            .map_err(|e| SupervisorError::InvalidArgument(e.to_string()))?;

        let mut cfg = SupervisorConfig::default();
        if let Ok(v) = loader.get_string("state_dir") {
            cfg.state_dir = PathBuf::from(v);
        }
        if let Ok(v) = loader.get_string("log_dir") {
            cfg.log_dir = PathBuf::from(v);
        }
        if let Ok(v) = loader.get_string("launcher_path") {
            cfg.launcher_path = PathBuf::from(v);
        }
        if let Ok(v) = loader.get_int("max_agents") {
            cfg.max_agents = usize::try_from(v)
                .map_err(|_| SupervisorError::InvalidArgument("MAX_AGENTS out of range".into()))?;
        }
        if let Ok(v) = loader.get_int("health_interval_ms") {
            cfg.health.health_interval_ms = parse_ms("HEALTH_INTERVAL_MS", v)?;
        }
        if let Ok(v) = loader.get_int("health_timeout_ms") {
            cfg.health.health_timeout_ms = parse_ms("HEALTH_TIMEOUT_MS", v)?;
        }
        if let Ok(v) = loader.get_int("health_max_failures") {
            cfg.health.health_max_failures = u32::try_from(v).map_err(|_| {
                SupervisorError::InvalidArgument("HEALTH_MAX_FAILURES out of range".into())
            })?;
        }
        if let Ok(v) = loader.get_int("message_retry_max") {
            cfg.message_retry_max = u32::try_from(v).map_err(|_| {
                SupervisorError::InvalidArgument("MESSAGE_RETRY_MAX out of range".into())
            })?;
        }
        if let Ok(v) = loader.get_int("message_queue_soft_limit") {
            cfg.message_queue_soft_limit = usize::try_from(v).map_err(|_| {
                SupervisorError::InvalidArgument("MESSAGE_QUEUE_SOFT_LIMIT out of range".into())
            })?;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_agents == 0 {
            return Err(SupervisorError::InvalidArgument(
                "max_agents must be at least 1".into(),
            ));
        }
        if self.health.health_interval_ms == 0 || self.health.health_timeout_ms == 0 {
            return Err(SupervisorError::InvalidArgument(
                "health intervals must be non-zero".into(),
            ));
        }
        if self.message_retry_max == 0 {
            return Err(SupervisorError::InvalidArgument(
                "message_retry_max must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Launcher path resolved against the state directory when relative.
    pub fn resolved_launcher(&self) -> PathBuf {
        if self.launcher_path.is_absolute() {
            self.launcher_path.clone()
        } else {
            self.state_dir.join(&self.launcher_path)
        }
    }
}

fn parse_ms(name: &str, v: i64) -> Result<u64> {
    u64::try_from(v)
        .map_err(|_| SupervisorError::InvalidArgument(format!("{} out of range", name)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_match_contract() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.health.health_interval_ms, 30_000);
        assert_eq!(cfg.health.health_timeout_ms, 10_000);
        assert_eq!(cfg.health.health_max_failures, 3);
        assert_eq!(cfg.message_retry_max, 3);
        assert_eq!(cfg.start_timeout_ms, 30_000);
        assert_eq!(cfg.stop_timeout_ms, 5_000);
    }

    #[test]
    fn test_validation_rejects_zero_ceiling() {
        let cfg = SupervisorConfig {
            max_agents: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_resolved_launcher() {
        let cfg = SupervisorConfig {
            state_dir: PathBuf::from("/tmp/state"),
            launcher_path: PathBuf::from("launch.sh"),
            ..Default::default()
        };
        assert_eq!(
            cfg.resolved_launcher(),
            PathBuf::from("/tmp/state/launch.sh")
        );

        let cfg = SupervisorConfig {
            launcher_path: PathBuf::from("/opt/bin/launch.sh"),
            ..cfg
        };
        assert_eq!(cfg.resolved_launcher(), PathBuf::from("/opt/bin/launch.sh"));
    }
}
