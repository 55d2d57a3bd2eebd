//! Typed supervisor event stream.
//!
//! Every observable state change flows through one tagged variant on a
//! single ordered channel. Consumers receive a stream, not a snapshot;
//! initial state comes from the read API. On the wire an event is
//! `{ "type": ..., "timestamp": ms, "payload": { ... } }` and consumers
//! must tolerate unknown keys.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::agent::AgentStatus;
use crate::health::AlertSeverity;

/// Discriminated event payloads.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum EventKind {
    AgentCreated {
        agent_id: String,
    },
    AgentStarted {
        agent_id: String,
    },
    AgentStopped {
        agent_id: String,
    },
    AgentRemoved {
        agent_id: String,
    },
    AgentStatusChanged {
        agent_id: String,
        status: AgentStatus,
    },
    AgentMessage {
        agent_id: String,
        message_id: String,
    },
    AgentCheckpoint {
        agent_id: String,
        checkpoint_id: String,
    },
    AgentRollback {
        agent_id: String,
        checkpoint_id: String,
    },
    AgentUnhealthy {
        agent_id: String,
        reason: String,
    },
    AgentRecovered {
        agent_id: String,
    },
    AgentFailed {
        agent_id: String,
        reason: String,
    },
    RecoveryFailed {
        agent_id: String,
    },
    SystemDegraded {
        healthy: usize,
        registered: usize,
    },
    HealthAlert {
        agent_id: String,
        severity: AlertSeverity,
        message: String,
    },
    SessionTerminated {
        session_id: String,
    },
    MessageReceived {
        agent_id: String,
        message_id: String,
    },
    MessageExpired {
        agent_id: String,
        message_id: String,
    },
    RetryFailed {
        agent_id: String,
        message_id: String,
    },
    QueuePressure {
        agent_id: String,
        depth: usize,
    },
    CostTracked {
        agent_id: String,
        operation: String,
        micro_usd: u64,
    },
}

/// A timestamped event as delivered to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorEvent {
    #[serde(flatten)]
    pub kind: EventKind,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

/// Ordered fan-out channel for supervisor events.
///
/// Emission never blocks; a subscriber that falls behind sees
/// `RecvError::Lagged` and is responsible for re-reading state.
#[derive(Debug, Clone)]
pub struct EventStream {
    tx: broadcast::Sender<SupervisorEvent>,
}

impl EventStream {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.tx.subscribe()
    }

    /// Stamp and publish an event. Lack of subscribers is not an error.
    pub fn emit(&self, kind: EventKind) {
        let event = SupervisorEvent {
            kind,
            timestamp: Utc::now().timestamp_millis(),
        };
        tracing::debug!(event = ?event.kind, "event emitted");
        let _ = self.tx.send(event);
    }
}

impl Default for EventStream {
    fn default() -> Self {
        Self::new(1024)
    }
}
