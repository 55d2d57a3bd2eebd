//! Periodic health probing, classification, and alerting.
//!
//! The monitor maintains a status estimate for every registered agent
//! and emits alerts and recovery requests. It never restarts or kills
//! anything itself; the lifecycle controller subscribes to the event
//! stream and decides.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::agent::state_file::{load_state_file, probe_port};
use crate::agent::HealthState;
use crate::config::HealthDefaults;
use crate::error::{Result, SupervisorError};
use crate::events::{EventKind, EventStream};

/// Externally visible health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Severity attached to health alerts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    Warning,
    Critical,
    Recovery,
}

/// Per-registration probe settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    pub interval_ms: u64,
    pub timeout_ms: u64,
    pub max_failures: u32,
    pub retry_delay_ms: u64,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            interval_ms: 30_000,
            timeout_ms: 10_000,
            max_failures: 3,
            retry_delay_ms: 5_000,
        }
    }
}

impl From<&HealthDefaults> for HealthCheckConfig {
    fn from(defaults: &HealthDefaults) -> Self {
        Self {
            interval_ms: defaults.health_interval_ms,
            timeout_ms: defaults.health_timeout_ms,
            max_failures: defaults.health_max_failures,
            retry_delay_ms: defaults.health_retry_delay_ms,
        }
    }
}

/// Classification thresholds, evaluated in order: critical first.
#[derive(Debug, Clone, PartialEq)]
pub struct HealthThresholds {
    pub warn_response_ms: u64,
    pub crit_response_ms: u64,
    pub warn_memory_pct: f64,
    pub crit_memory_pct: f64,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warn_response_ms: 5_000,
            crit_response_ms: 10_000,
            warn_memory_pct: 80.0,
            crit_memory_pct: 95.0,
        }
    }
}

impl HealthThresholds {
    /// Classify a successful probe reply.
    pub fn classify(&self, reply: &ProbeReply) -> HealthStatus {
        let memory = reply.memory_percent.unwrap_or(0.0);
        if reply.response_time_ms >= self.crit_response_ms || memory >= self.crit_memory_pct {
            HealthStatus::Unhealthy
        } else if reply.response_time_ms >= self.warn_response_ms || memory >= self.warn_memory_pct
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Data returned by a successful probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReply {
    pub response_time_ms: u64,
    pub memory_percent: Option<f64>,
    pub cpu_percent: Option<f64>,
}

/// The probe seam; tests script replies through this.
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self, agent_id: &str) -> Result<ProbeReply>;
}

/// Production prober: the agent state file is authoritative, a TCP
/// endpoint at the derived port enriches the sample when present.
pub struct StateFileProber {
    state_dir: PathBuf,
}

impl StateFileProber {
    pub fn new(state_dir: PathBuf) -> Self {
        Self { state_dir }
    }
}

#[async_trait]
impl Prober for StateFileProber {
    async fn probe(&self, agent_id: &str) -> Result<ProbeReply> {
        let started = Instant::now();

        let state = load_state_file(&self.state_dir, agent_id)?
            .ok_or_else(|| SupervisorError::not_found("agent state file", agent_id))?;
        if !state.is_running() {
            return Err(SupervisorError::ExternalFailure(format!(
                "agent {} reports status '{}'",
                agent_id, state.status
            )));
        }

        let mut reply = ProbeReply {
            response_time_ms: 0,
            memory_percent: Some(state.metrics.memory_usage),
            cpu_percent: Some(state.metrics.cpu_usage),
        };

        // Enrichment only; a missing endpoint is not a failure.
        let port = probe_port(agent_id);
        if let Ok(Ok(mut stream)) = tokio::time::timeout(
            Duration::from_millis(500),
            TcpStream::connect(("127.0.0.1", port)),
        )
        .await
        {
            let mut body = Vec::with_capacity(512);
            if tokio::time::timeout(
                Duration::from_millis(500),
                stream.read_to_end(&mut body),
            )
            .await
            .is_ok()
            {
                if let Ok(json) = serde_json::from_slice::<serde_json::Value>(&body) {
                    if let Some(mem) = json.get("memoryUsage").and_then(|v| v.as_f64()) {
                        reply.memory_percent = Some(mem);
                    }
                    if let Some(cpu) = json.get("cpuUsage").and_then(|v| v.as_f64()) {
                        reply.cpu_percent = Some(cpu);
                    }
                }
            }
        }

        reply.response_time_ms = started.elapsed().as_millis() as u64;
        Ok(reply)
    }
}

struct AgentEntry {
    config: HealthCheckConfig,
    status: RwLock<HealthStatus>,
    sample: RwLock<HealthState>,
    consecutive_failures: AtomicU32,
    recovery_attempts: AtomicU32,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct SweepTotals {
    probes: u64,
    failures: u64,
    response_time_sum_ms: u64,
    responses: u64,
}

/// Aggregate produced by the global sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSummary {
    pub registered: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub total_probes: u64,
    pub total_failures: u64,
    pub avg_response_time_ms: u64,
}

/// Health monitor over all registered agents.
pub struct HealthMonitor {
    agents: DashMap<String, Arc<AgentEntry>>,
    prober: Arc<dyn Prober>,
    thresholds: HealthThresholds,
    defaults: HealthCheckConfig,
    totals: Arc<Mutex<SweepTotals>>,
    events: EventStream,
    cancel: CancellationToken,
}

impl HealthMonitor {
    /// Build the monitor and spawn its global sweep.
    pub fn new(
        prober: Arc<dyn Prober>,
        defaults: HealthCheckConfig,
        sweep_interval: Duration,
        events: EventStream,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let monitor = Arc::new(Self {
            agents: DashMap::new(),
            prober,
            thresholds: HealthThresholds::default(),
            defaults,
            totals: Arc::new(Mutex::new(SweepTotals::default())),
            events,
            cancel: cancel.clone(),
        });

        let sweeper = Arc::clone(&monitor);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        sweeper.sweep_once().await;
                    }
                }
            }
        });

        monitor
    }

    /// Register an agent for periodic probing. Re-registering an id
    /// that is still registered is an error.
    pub fn register(&self, agent_id: &str, config: Option<HealthCheckConfig>) -> Result<()> {
        let config = config.unwrap_or_else(|| self.defaults.clone());
        let entry = Arc::new(AgentEntry {
            config,
            status: RwLock::new(HealthStatus::Healthy),
            sample: RwLock::new(HealthState::default()),
            consecutive_failures: AtomicU32::new(0),
            recovery_attempts: AtomicU32::new(0),
            cancel: self.cancel.child_token(),
        });

        match self.agents.entry(agent_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(SupervisorError::Conflict(format!(
                    "agent {} already registered with health monitor",
                    agent_id
                )));
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&entry));
            }
        }

        let agent_id = agent_id.to_string();
        let prober = Arc::clone(&self.prober);
        let thresholds = self.thresholds.clone();
        let events = self.events.clone();
        let totals = Arc::clone(&self.totals);

        tokio::spawn({
            let entry = Arc::clone(&entry);
            async move {
                let mut ticker =
                    tokio::time::interval(Duration::from_millis(entry.config.interval_ms));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                // The first interval tick fires immediately; skip it so
                // a freshly started agent gets a full interval to boot.
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = entry.cancel.cancelled() => break,
                        _ = ticker.tick() => {
                            probe_and_classify(
                                &agent_id,
                                &entry,
                                &prober,
                                &thresholds,
                                &events,
                                Some(&totals),
                            )
                            .await;
                        }
                    }
                }
            }
        });

        Ok(())
    }

    /// Remove an agent from monitoring. Idempotent.
    pub fn unregister(&self, agent_id: &str) {
        if let Some((_, entry)) = self.agents.remove(agent_id) {
            entry.cancel.cancel();
        }
    }

    pub fn is_registered(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// Run one probe cycle for an agent right now, outside its timer.
    pub async fn probe_now(&self, agent_id: &str) -> Result<HealthStatus> {
        let entry = self.entry(agent_id)?;
        probe_and_classify(
            agent_id,
            &entry,
            &self.prober,
            &self.thresholds,
            &self.events,
            Some(&self.totals),
        )
        .await;
        let status = *entry.status.read().await;
        Ok(status)
    }

    pub async fn status(&self, agent_id: &str) -> Option<HealthStatus> {
        let entry = self.agents.get(agent_id)?.value().clone();
        let status = *entry.status.read().await;
        Some(status)
    }

    /// Latest sample for the agent record's `health` field.
    pub async fn health_state(&self, agent_id: &str) -> Option<HealthState> {
        let entry = self.agents.get(agent_id)?.value().clone();
        let sample = entry.sample.read().await.clone();
        Some(sample)
    }

    pub fn failure_count(&self, agent_id: &str) -> u32 {
        self.agents
            .get(agent_id)
            .map(|e| e.consecutive_failures.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Wait `retry_delay_ms`, issue one fresh probe, and report whether
    /// the agent is healthy again. Consecutive attempts cap at 3;
    /// exceeding the cap emits `recovery_failed`.
    pub async fn attempt_recovery(&self, agent_id: &str) -> Result<bool> {
        let entry = self.entry(agent_id)?;

        let attempts = entry.recovery_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempts > 3 {
            self.events.emit(EventKind::RecoveryFailed {
                agent_id: agent_id.to_string(),
            });
            return Ok(false);
        }

        tokio::time::sleep(Duration::from_millis(entry.config.retry_delay_ms)).await;

        let status = self.probe_now(agent_id).await?;
        Ok(status == HealthStatus::Healthy)
    }

    /// Aggregate and publish global health once.
    pub async fn sweep_once(&self) -> HealthSummary {
        let registered = self.agents.len();
        let mut healthy = 0;
        let mut unhealthy = 0;

        let entries: Vec<Arc<AgentEntry>> =
            self.agents.iter().map(|e| e.value().clone()).collect();
        for entry in &entries {
            match *entry.status.read().await {
                HealthStatus::Healthy => healthy += 1,
                HealthStatus::Unhealthy => unhealthy += 1,
                HealthStatus::Degraded => {}
            }
        }

        let totals = self.totals.lock().await;
        let summary = HealthSummary {
            registered,
            healthy,
            unhealthy,
            total_probes: totals.probes,
            total_failures: totals.failures,
            avg_response_time_ms: if totals.responses > 0 {
                totals.response_time_sum_ms / totals.responses
            } else {
                0
            },
        };
        drop(totals);

        tracing::info!(
            registered,
            healthy,
            unhealthy,
            probes = summary.total_probes,
            "health sweep"
        );

        if registered > 1 && healthy * 2 < registered {
            self.events.emit(EventKind::SystemDegraded {
                healthy,
                registered,
            });
        }

        summary
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for entry in self.agents.iter() {
            entry.value().cancel.cancel();
        }
        self.agents.clear();
    }

    fn entry(&self, agent_id: &str) -> Result<Arc<AgentEntry>> {
        self.agents
            .get(agent_id)
            .map(|e| e.value().clone())
            .ok_or_else(|| SupervisorError::not_found("agent", agent_id))
    }
}

/// One probe cycle: run the probe under its deadline, classify, update
/// counters, and emit whatever the transition demands.
async fn probe_and_classify(
    agent_id: &str,
    entry: &Arc<AgentEntry>,
    prober: &Arc<dyn Prober>,
    thresholds: &HealthThresholds,
    events: &EventStream,
    totals: Option<&Mutex<SweepTotals>>,
) {
    let deadline = Duration::from_millis(entry.config.timeout_ms);
    let outcome = match tokio::time::timeout(deadline, prober.probe(agent_id)).await {
        Ok(Ok(reply)) => Ok(reply),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(SupervisorError::Timeout(format!(
            "probe for {} exceeded {}ms",
            agent_id, entry.config.timeout_ms
        ))),
    };

    if let Some(totals) = totals {
        let mut totals = totals.lock().await;
        totals.probes += 1;
        match &outcome {
            Ok(reply) => {
                totals.responses += 1;
                totals.response_time_sum_ms += reply.response_time_ms;
            }
            Err(_) => totals.failures += 1,
        }
    }

    match outcome {
        Ok(reply) => {
            let classified = thresholds.classify(&reply);
            {
                let mut sample = entry.sample.write().await;
                sample.last_heartbeat = Some(Utc::now());
                sample.response_time_ms = Some(reply.response_time_ms);
                sample.memory_percent = reply.memory_percent;
                sample.cpu_percent = reply.cpu_percent;
                sample.last_error = None;
                sample.consecutive_failures = 0;
            }

            let had_failures = entry.consecutive_failures.swap(0, Ordering::SeqCst) > 0;
            let previous = {
                let mut status = entry.status.write().await;
                std::mem::replace(&mut *status, classified)
            };

            if had_failures || previous == HealthStatus::Unhealthy {
                entry.recovery_attempts.store(0, Ordering::SeqCst);
            }
            if previous == HealthStatus::Unhealthy && classified != HealthStatus::Unhealthy {
                events.emit(EventKind::HealthAlert {
                    agent_id: agent_id.to_string(),
                    severity: AlertSeverity::Recovery,
                    message: format!("agent {} recovered", agent_id),
                });
                events.emit(EventKind::AgentRecovered {
                    agent_id: agent_id.to_string(),
                });
            }
        }
        Err(e) => {
            let failures = entry.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut sample = entry.sample.write().await;
                sample.consecutive_failures = failures;
                sample.last_error = Some(e.to_string());
            }

            let previous = *entry.status.read().await;

            if failures == 1 && previous == HealthStatus::Healthy {
                events.emit(EventKind::HealthAlert {
                    agent_id: agent_id.to_string(),
                    severity: AlertSeverity::Warning,
                    message: format!("agent {} degraded: {}", agent_id, e),
                });
            }

            if failures >= entry.config.max_failures && previous != HealthStatus::Unhealthy {
                *entry.status.write().await = HealthStatus::Unhealthy;
                events.emit(EventKind::HealthAlert {
                    agent_id: agent_id.to_string(),
                    severity: AlertSeverity::Critical,
                    message: format!(
                        "agent {} unhealthy after {} consecutive failures",
                        agent_id, failures
                    ),
                });
                events.emit(EventKind::AgentUnhealthy {
                    agent_id: agent_id.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::VecDeque;

    /// Prober that replays a scripted sequence of outcomes.
    struct ScriptedProber {
        script: Mutex<VecDeque<Result<ProbeReply>>>,
    }

    impl ScriptedProber {
        fn new(script: Vec<Result<ProbeReply>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
            })
        }
    }

    #[async_trait]
    impl Prober for ScriptedProber {
        async fn probe(&self, _agent_id: &str) -> Result<ProbeReply> {
            self.script
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(SupervisorError::ExternalFailure("script empty".into())))
        }
    }

    fn healthy_reply() -> Result<ProbeReply> {
        Ok(ProbeReply {
            response_time_ms: 20,
            memory_percent: Some(30.0),
            cpu_percent: Some(5.0),
        })
    }

    fn failure() -> Result<ProbeReply> {
        Err(SupervisorError::ExternalFailure("no state file".into()))
    }

    fn monitor_with(
        prober: Arc<dyn Prober>,
        events: EventStream,
    ) -> Arc<HealthMonitor> {
        HealthMonitor::new(
            prober,
            HealthCheckConfig {
                interval_ms: 3_600_000,
                timeout_ms: 1_000,
                max_failures: 3,
                retry_delay_ms: 1,
            },
            Duration::from_secs(3600),
            events,
            CancellationToken::new(),
        )
    }

    #[test]
    fn test_classification_order() {
        let thresholds = HealthThresholds::default();

        let critical_latency = ProbeReply {
            response_time_ms: 12_000,
            memory_percent: Some(10.0),
            cpu_percent: None,
        };
        assert_eq!(thresholds.classify(&critical_latency), HealthStatus::Unhealthy);

        let critical_memory = ProbeReply {
            response_time_ms: 10,
            memory_percent: Some(96.0),
            cpu_percent: None,
        };
        assert_eq!(thresholds.classify(&critical_memory), HealthStatus::Unhealthy);

        let warning = ProbeReply {
            response_time_ms: 6_000,
            memory_percent: Some(10.0),
            cpu_percent: None,
        };
        assert_eq!(thresholds.classify(&warning), HealthStatus::Degraded);

        let fine = ProbeReply {
            response_time_ms: 100,
            memory_percent: Some(50.0),
            cpu_percent: None,
        };
        assert_eq!(thresholds.classify(&fine), HealthStatus::Healthy);
    }

    #[tokio::test]
    async fn test_duplicate_registration_conflicts() {
        let monitor = monitor_with(
            ScriptedProber::new(vec![]),
            EventStream::default(),
        );
        monitor.register("d1", None).unwrap();
        let err = monitor.register("d1", None).unwrap_err();
        assert!(matches!(err, SupervisorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_unhealthy_emitted_once_then_recovered_once() {
        let events = EventStream::default();
        let mut rx = events.subscribe();

        let prober = ScriptedProber::new(vec![
            failure(),
            failure(),
            failure(),
            failure(), // past the cap: no second agent_unhealthy
            healthy_reply(),
        ]);
        let monitor = monitor_with(prober, events);
        monitor.register("d1", None).unwrap();

        for _ in 0..4 {
            monitor.probe_now("d1").await.unwrap();
        }
        monitor.probe_now("d1").await.unwrap();

        let mut unhealthy = 0;
        let mut recovered = 0;
        let mut warnings = 0;
        while let Ok(event) = rx.try_recv() {
            match event.kind {
                EventKind::AgentUnhealthy { .. } => unhealthy += 1,
                EventKind::AgentRecovered { .. } => recovered += 1,
                EventKind::HealthAlert {
                    severity: AlertSeverity::Warning,
                    ..
                } => warnings += 1,
                _ => {}
            }
        }

        assert_eq!(unhealthy, 1);
        assert_eq!(recovered, 1);
        assert_eq!(warnings, 1); // first failure after a healthy run
        assert_eq!(monitor.status("d1").await, Some(HealthStatus::Healthy));
        assert_eq!(monitor.failure_count("d1"), 0);
    }

    #[tokio::test]
    async fn test_attempt_recovery_caps_at_three() {
        let events = EventStream::default();
        let mut rx = events.subscribe();

        let prober = ScriptedProber::new(vec![failure(), failure(), failure()]);
        let monitor = monitor_with(prober, events);
        monitor.register("d1", None).unwrap();

        for _ in 0..3 {
            assert!(!monitor.attempt_recovery("d1").await.unwrap());
        }
        // Fourth consecutive attempt exceeds the cap.
        assert!(!monitor.attempt_recovery("d1").await.unwrap());

        let mut recovery_failed = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event.kind, EventKind::RecoveryFailed { .. }) {
                recovery_failed += 1;
            }
        }
        assert_eq!(recovery_failed, 1);
    }

    #[tokio::test]
    async fn test_sweep_emits_system_degraded() {
        let events = EventStream::default();
        let mut rx = events.subscribe();

        let prober = ScriptedProber::new(vec![
            failure(),
            failure(),
            failure(),
        ]);
        let monitor = monitor_with(prober, events);
        monitor.register("d1", None).unwrap();
        monitor.register("d2", None).unwrap();

        // Drive d1 unhealthy; d2 stays healthy by default.
        for _ in 0..3 {
            monitor.probe_now("d1").await.unwrap();
        }

        // 1 of 2 healthy: not a majority shortfall.
        let summary = monitor.sweep_once().await;
        assert_eq!(summary.healthy, 1);
        assert_eq!(summary.unhealthy, 1);

        monitor.register("d3", None).unwrap();
        // Make d3 unhealthy too: 1 of 3 healthy.
        let entry = monitor.entry("d3").unwrap();
        *entry.status.write().await = HealthStatus::Unhealthy;

        monitor.sweep_once().await;

        let mut degraded = 0;
        while let Ok(event) = rx.try_recv() {
            if let EventKind::SystemDegraded { healthy, registered } = event.kind {
                degraded += 1;
                assert_eq!(healthy, 1);
                assert_eq!(registered, 3);
            }
        }
        assert_eq!(degraded, 1);
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let monitor = monitor_with(ScriptedProber::new(vec![]), EventStream::default());
        monitor.register("d1", None).unwrap();
        monitor.unregister("d1");
        monitor.unregister("d1");
        assert!(!monitor.is_registered("d1"));
        // Id can be reused after unregistration.
        monitor.register("d1", None).unwrap();
    }
}
