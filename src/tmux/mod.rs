//! Thin asynchronous client for tmux.
//!
//! The supervisor treats tmux as a pool of named, isolated, long-lived
//! process containers. This module owns the subprocess plumbing; the
//! session-level bookkeeping lives in [`crate::session`].

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::Command;

use crate::error::{Result, SupervisorError};

/// Point-in-time description of a live tmux session.
#[derive(Debug, Clone, PartialEq)]
pub struct TmuxSessionInfo {
    pub name: String,
    pub id: String,
    /// Unix epoch seconds
    pub created: i64,
    /// Unix epoch seconds of last activity, if any
    pub last_activity: Option<i64>,
    pub windows: u32,
}

/// Client for a local tmux server.
///
/// Construction probes `tmux -V`; a missing binary is a hard
/// `Unavailable` error and the supervisor refuses to come up.
#[derive(Debug, Clone)]
pub struct TmuxClient {
    binary: String,
}

impl TmuxClient {
    pub async fn new() -> Result<Self> {
        Self::with_binary("tmux").await
    }

    pub async fn with_binary(binary: &str) -> Result<Self> {
        let output = Command::new(binary)
            .arg("-V")
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|_| {
                SupervisorError::Unavailable(format!("{} not found on PATH", binary))
            })?;

        if !output.status.success() {
            return Err(SupervisorError::Unavailable(format!(
                "{} -V failed: {}",
                binary,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(Self {
            binary: binary.to_string(),
        })
    }

    /// Create a detached session rooted at `working_dir` with `env`
    /// exported session-wide before any command runs.
    ///
    /// The exports use `set-environment`, so they survive shell
    /// restarts inside the session. If any export fails the
    /// half-created session is killed and the whole call fails; env
    /// vars are never silently dropped.
    pub async fn create_session(
        &self,
        name: &str,
        working_dir: &Path,
        env: &HashMap<String, String>,
    ) -> Result<()> {
        validate_session_name(name)?;

        if self.has_session(name).await? {
            return Err(SupervisorError::Conflict(format!(
                "session '{}' already exists",
                name
            )));
        }

        let dir = working_dir.to_string_lossy();
        self.run(&["new-session", "-d", "-s", name, "-c", &dir])
            .await?;

        for (key, value) in env {
            if let Err(e) = self
                .run(&["set-environment", "-t", name, key, value])
                .await
            {
                let _ = self.kill_session(name).await;
                return Err(e);
            }
        }

        Ok(())
    }

    /// Push a command line to the session's primary shell. Returns when
    /// tmux has accepted the write, not when the command completes.
    pub async fn send_command(&self, name: &str, command: &str) -> Result<()> {
        self.run(&["send-keys", "-t", name, command, "Enter"]).await
    }

    /// Send raw keys without an implicit Enter (e.g. `C-c`).
    pub async fn send_keys(&self, name: &str, keys: &str) -> Result<()> {
        self.run(&["send-keys", "-t", name, keys]).await
    }

    /// Capture the visible contents of the session's active pane.
    pub async fn capture_pane(&self, name: &str) -> Result<String> {
        let output = self
            .run_with_output(&["capture-pane", "-t", name, "-p"])
            .await?;
        Ok(output)
    }

    /// Kill a session. Idempotent: a session that is already gone (or a
    /// server that is not running) is success.
    pub async fn kill_session(&self, name: &str) -> Result<()> {
        match self.run(&["kill-session", "-t", name]).await {
            Ok(()) => Ok(()),
            Err(SupervisorError::ExternalFailure(msg)) if is_gone(&msg) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn has_session(&self, name: &str) -> Result<bool> {
        let output = Command::new(&self.binary)
            .args(["has-session", "-t", name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_err(SupervisorError::Io)?;
        Ok(output.success())
    }

    /// List live sessions. A stopped server means no sessions.
    pub async fn list_sessions(&self) -> Result<Vec<TmuxSessionInfo>> {
        const FORMAT: &str =
            "#{session_name}|#{session_id}|#{session_created}|#{session_activity}|#{session_windows}";

        let output = match self
            .run_with_output(&["list-sessions", "-F", FORMAT])
            .await
        {
            Ok(out) => out,
            Err(SupervisorError::ExternalFailure(msg)) if is_gone(&msg) => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(output.lines().filter_map(parse_session_line).collect())
    }

    pub async fn get_session_info(&self, name: &str) -> Result<TmuxSessionInfo> {
        self.list_sessions()
            .await?
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| SupervisorError::not_found("session", name))
    }

    async fn run(&self, args: &[&str]) -> Result<()> {
        self.run_with_output(args).await.map(|_| ())
    }

    async fn run_with_output(&self, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.binary)
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(SupervisorError::Io)?;

        if !output.status.success() {
            return Err(SupervisorError::ExternalFailure(format!(
                "tmux {}: {}",
                args.first().unwrap_or(&""),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

fn parse_session_line(line: &str) -> Option<TmuxSessionInfo> {
    let parts: Vec<&str> = line.split('|').collect();
    if parts.len() < 5 {
        return None;
    }
    Some(TmuxSessionInfo {
        name: parts[0].to_string(),
        id: parts[1].to_string(),
        created: parts[2].parse().unwrap_or(0),
        last_activity: parts[3].parse().ok(),
        windows: parts[4].parse().unwrap_or(1),
    })
}

fn is_gone(stderr: &str) -> bool {
    stderr.contains("session not found")
        || stderr.contains("can't find session")
        || stderr.contains("no server running")
        || stderr.contains("error connecting")
}

/// Session names cannot be empty and cannot contain `:` or `.`, which
/// tmux interprets as target separators.
pub fn validate_session_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(SupervisorError::InvalidArgument(
            "session name cannot be empty".into(),
        ));
    }
    if name.contains(':') || name.contains('.') {
        return Err(SupervisorError::InvalidArgument(format!(
            "session name '{}' contains ':' or '.'",
            name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_name_validation() {
        assert!(validate_session_name("agent-a1").is_ok());
        assert!(validate_session_name("Agent_123").is_ok());

        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("a:b").is_err());
        assert!(validate_session_name("a.b").is_err());
    }

    #[test]
    fn test_parse_session_line() {
        let info = parse_session_line("agent-a1|$3|1700000000|1700000100|2").unwrap();
        assert_eq!(info.name, "agent-a1");
        assert_eq!(info.id, "$3");
        assert_eq!(info.created, 1_700_000_000);
        assert_eq!(info.last_activity, Some(1_700_000_100));
        assert_eq!(info.windows, 2);

        assert!(parse_session_line("short|line").is_none());
    }

    #[test]
    fn test_gone_detection() {
        assert!(is_gone("can't find session: agent-a1"));
        assert!(is_gone("no server running on /tmp/tmux-0/default"));
        assert!(!is_gone("invalid option"));
    }
}
