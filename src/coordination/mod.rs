//! Inter-agent message bus.
//!
//! Routes messages between agents with prioritised delivery, offline
//! queuing, bounded retries, TTL expiry, request/response correlation,
//! and topic broadcast. Every agent id owns one priority-ordered queue;
//! an active connection drains it through a per-recipient pump task, an
//! offline agent accumulates until it subscribes again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::{Result, SupervisorError};
use crate::events::{EventKind, EventStream};

const MAX_CONVERSATION_HISTORY: usize = 100;

/// Message categories on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    Response,
    Event,
    Broadcast,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Request => "request",
            MessageKind::Response => "response",
            MessageKind::Event => "event",
            MessageKind::Broadcast => "broadcast",
        }
    }
}

/// Delivery priority. Lower rank drains first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessagePriority {
    Critical,
    High,
    Normal,
    Low,
}

impl MessagePriority {
    pub fn rank(&self) -> u8 {
        match self {
            MessagePriority::Critical => 0,
            MessagePriority::High => 1,
            MessagePriority::Normal => 2,
            MessagePriority::Low => 3,
        }
    }
}

/// A message in flight between agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub from: String,
    pub to: Vec<String>,
    pub kind: MessageKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub priority: MessagePriority,
    pub correlation_id: Option<Uuid>,
    pub ttl_ms: Option<u64>,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl Message {
    pub fn new(from: impl Into<String>, to: Vec<String>, kind: MessageKind, payload: Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to,
            kind,
            payload,
            created_at: Utc::now(),
            priority: MessagePriority::Normal,
            correlation_id: None,
            ttl_ms: None,
            attempts: 0,
            max_attempts: 3,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_ttl_ms(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Conversation key: correlation id when present, otherwise the
    /// message's own id.
    fn conversation_key(&self) -> String {
        self.correlation_id.unwrap_or(self.id).to_string()
    }
}

/// A message waiting in an agent's queue.
#[derive(Debug, Clone)]
struct QueuedMessage {
    message: Message,
    enqueued_at: DateTime<Utc>,
    next_retry_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.message.ttl_ms {
            Some(ttl) => now >= self.enqueued_at + chrono::Duration::milliseconds(ttl as i64),
            None => false,
        }
    }

    fn is_due(&self, now: DateTime<Utc>) -> bool {
        match self.next_retry_at {
            Some(at) => now >= at,
            None => true,
        }
    }
}

/// Pattern a route matches against a message's kind or payload.
#[derive(Debug, Clone)]
pub enum RoutePattern {
    Literal(String),
    Pattern(Regex),
}

impl RoutePattern {
    pub fn regex(pattern: &str) -> Result<Self> {
        Regex::new(pattern)
            .map(RoutePattern::Pattern)
            .map_err(|e| SupervisorError::InvalidArgument(format!("bad route pattern: {}", e)))
    }

    fn matches(&self, message: &Message) -> bool {
        let kind = message.kind.as_str();
        match self {
            RoutePattern::Literal(lit) => {
                kind == lit || message.payload.to_string().contains(lit.as_str())
            }
            RoutePattern::Pattern(re) => {
                re.is_match(kind) || re.is_match(&message.payload.to_string())
            }
        }
    }
}

/// Handler invoked when a route matches. Returning a value for a
/// `request` message triggers an automatic `response` with the same
/// correlation id.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &Message) -> Result<Option<Value>>;
}

/// Global middleware applied before delivery to an active connection.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn apply(&self, message: Message) -> Result<Message>;
}

struct Route {
    pattern: RoutePattern,
    handler: Arc<dyn MessageHandler>,
}

struct AgentQueue {
    items: Mutex<Vec<QueuedMessage>>,
    notify: Notify,
}

impl AgentQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(Vec::new()),
            notify: Notify::new(),
        })
    }
}

struct Connection {
    sender: async_channel::Sender<Message>,
    receiver: async_channel::Receiver<Message>,
    pump_cancel: CancellationToken,
}

struct ConversationLog {
    messages: Vec<Message>,
    last_activity: DateTime<Utc>,
}

/// Bus tuning. Defaults are the contractual values; tests shrink the
/// timers.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageBusConfig {
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub sweep_interval_ms: u64,
    pub history_cleanup_interval_ms: u64,
    pub history_idle_ms: u64,
    pub queue_soft_limit: usize,
}

impl Default for MessageBusConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_base_ms: 5_000,
            sweep_interval_ms: 5_000,
            history_cleanup_interval_ms: 60_000,
            history_idle_ms: 24 * 60 * 60 * 1_000,
            queue_soft_limit: 1_000,
        }
    }
}

impl From<&SupervisorConfig> for MessageBusConfig {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            max_attempts: config.message_retry_max,
            retry_base_ms: config.message_retry_base_ms,
            sweep_interval_ms: config.message_sweep_interval_ms,
            history_cleanup_interval_ms: config.history_cleanup_interval_ms,
            history_idle_ms: config.history_idle_ms,
            queue_soft_limit: config.message_queue_soft_limit,
        }
    }
}

/// Message bus between agents.
pub struct MessageBus {
    weak_self: std::sync::Weak<MessageBus>,
    config: MessageBusConfig,
    connections: DashMap<String, Connection>,
    topics: DashMap<String, HashSet<String>>,
    agent_topics: DashMap<String, HashSet<String>>,
    routes: DashMap<String, Vec<Route>>,
    queues: DashMap<String, Arc<AgentQueue>>,
    waiters: DashMap<Uuid, oneshot::Sender<Message>>,
    middleware: Mutex<Vec<Arc<dyn Middleware>>>,
    history: DashMap<String, Arc<Mutex<ConversationLog>>>,
    events: EventStream,
    cancel: CancellationToken,
}

impl MessageBus {
    /// Build the bus and spawn its queue sweep and history cleanup.
    pub fn new(
        config: MessageBusConfig,
        events: EventStream,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let bus = Arc::new_cyclic(|weak| Self {
            weak_self: weak.clone(),
            config: config.clone(),
            connections: DashMap::new(),
            topics: DashMap::new(),
            agent_topics: DashMap::new(),
            routes: DashMap::new(),
            queues: DashMap::new(),
            waiters: DashMap::new(),
            middleware: Mutex::new(Vec::new()),
            history: DashMap::new(),
            events,
            cancel: cancel.clone(),
        });

        let sweep_interval = Duration::from_millis(config.sweep_interval_ms);
        let cleanup_interval = Duration::from_millis(config.history_cleanup_interval_ms);

        let sweeper = Arc::clone(&bus);
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sweep_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = sweep_cancel.cancelled() => break,
                    _ = ticker.tick() => sweeper.sweep_queues().await,
                }
            }
        });

        let cleaner = Arc::clone(&bus);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => cleaner.cleanup_history().await,
                }
            }
        });

        bus
    }

    /// Register `agent_id` as an active connection subscribed to
    /// `topics` (`*` matches every topic) and return its inbox.
    ///
    /// Messages queued while the agent was offline are replayed in
    /// priority order; expired ones are dropped with an `expired`
    /// event.
    pub fn subscribe(&self, agent_id: &str, topics: &[&str]) -> async_channel::Receiver<Message> {
        for topic in topics {
            self.topics
                .entry((*topic).to_string())
                .or_default()
                .insert(agent_id.to_string());
            self.agent_topics
                .entry(agent_id.to_string())
                .or_default()
                .insert((*topic).to_string());
        }

        if let Some(existing) = self.connections.get(agent_id) {
            return existing.receiver.clone();
        }

        let (sender, receiver) = async_channel::unbounded();
        let pump_cancel = self.cancel.child_token();
        self.connections.insert(
            agent_id.to_string(),
            Connection {
                sender,
                receiver: receiver.clone(),
                pump_cancel: pump_cancel.clone(),
            },
        );

        let queue = self.queue_for(agent_id);
        let id = agent_id.to_string();
        if let Some(bus) = self.weak_self.upgrade() {
            let task_queue = queue.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = pump_cancel.cancelled() => break,
                        _ = task_queue.notify.notified() => bus.drain_queue(&id, &task_queue).await,
                    }
                }
            });
        }

        // Replay any backlog accumulated while offline.
        queue.notify.notify_one();
        receiver
    }

    /// Drop topic subscriptions. Called with an empty topic list this
    /// also tears down the agent's connection, queue, and routes.
    pub fn unsubscribe(&self, agent_id: &str, topics: &[&str]) {
        if topics.is_empty() {
            self.disconnect(agent_id);
            self.queues.remove(agent_id);
            self.routes.remove(agent_id);
            if let Some((_, subscribed)) = self.agent_topics.remove(agent_id) {
                for topic in subscribed {
                    if let Some(mut subscribers) = self.topics.get_mut(&topic) {
                        subscribers.remove(agent_id);
                    }
                }
            }
            return;
        }

        for topic in topics {
            if let Some(mut subscribers) = self.topics.get_mut(*topic) {
                subscribers.remove(agent_id);
            }
            if let Some(mut subscribed) = self.agent_topics.get_mut(agent_id) {
                subscribed.remove(*topic);
            }
        }
    }

    /// Sever the active connection, keeping queue, routes, and topic
    /// subscriptions so traffic accumulates for a later resubscribe.
    pub fn disconnect(&self, agent_id: &str) {
        if let Some((_, connection)) = self.connections.remove(agent_id) {
            connection.pump_cancel.cancel();
            connection.sender.close();
        }
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        self.connections.contains_key(agent_id)
    }

    /// Attach a route for a subscriber. Matching messages are handed to
    /// `handler` on delivery.
    pub fn register_route(
        &self,
        agent_id: &str,
        pattern: RoutePattern,
        handler: Arc<dyn MessageHandler>,
    ) {
        self.routes
            .entry(agent_id.to_string())
            .or_default()
            .push(Route { pattern, handler });
    }

    pub async fn add_middleware(&self, middleware: Arc<dyn Middleware>) {
        self.middleware.lock().await.push(middleware);
    }

    /// Send a message to each of its recipients.
    ///
    /// Active recipients are drained promptly by their pump; offline
    /// recipients accumulate the message at a priority-determined queue
    /// position. A `response` matching an outstanding request fulfils
    /// the waiter directly.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.record_history(&message).await;

        if message.kind == MessageKind::Response {
            if let Some(correlation_id) = message.correlation_id {
                if let Some((_, waiter)) = self.waiters.remove(&correlation_id) {
                    let _ = waiter.send(message);
                    return Ok(());
                }
            }
        }

        let recipients = message.to.clone();
        for recipient in recipients {
            self.enqueue(&recipient, message.clone()).await;
        }
        Ok(())
    }

    /// Send a `request` and await the matching `response`.
    ///
    /// A timeout is a failure for the caller only; the recipient still
    /// sees the request.
    pub async fn request(
        &self,
        from: &str,
        to: &str,
        payload: Value,
        timeout_ms: u64,
    ) -> Result<Message> {
        let correlation_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(correlation_id, tx);

        let message = Message::new(from, vec![to.to_string()], MessageKind::Request, payload)
            .with_correlation_id(correlation_id)
            .with_max_attempts(self.config.max_attempts);
        self.send(message).await?;

        match tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(SupervisorError::Cancelled(format!(
                "request to {} dropped",
                to
            ))),
            Err(_) => {
                self.waiters.remove(&correlation_id);
                Err(SupervisorError::Timeout(format!(
                    "no response from {} within {}ms",
                    to, timeout_ms
                )))
            }
        }
    }

    /// Deliver `payload` to every subscriber of `topic`, plus `*`
    /// subscribers.
    pub async fn broadcast(&self, from: &str, topic: &str, payload: Value) -> Result<()> {
        let mut recipients: HashSet<String> = HashSet::new();
        if let Some(subscribers) = self.topics.get(topic) {
            recipients.extend(subscribers.iter().cloned());
        }
        if let Some(subscribers) = self.topics.get("*") {
            recipients.extend(subscribers.iter().cloned());
        }
        recipients.remove(from);

        if recipients.is_empty() {
            return Ok(());
        }

        let message = Message::new(
            from,
            recipients.into_iter().collect(),
            MessageKind::Broadcast,
            payload,
        )
        .with_max_attempts(self.config.max_attempts);
        self.send(message).await
    }

    pub async fn queue_depth(&self, agent_id: &str) -> usize {
        match self.queues.get(agent_id) {
            Some(queue) => queue.items.lock().await.len(),
            None => 0,
        }
    }

    pub async fn history_len(&self, key: &str) -> usize {
        match self.history.get(key) {
            Some(log) => log.lock().await.messages.len(),
            None => 0,
        }
    }

    /// Stop pumps and background loops and drop all state.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        for connection in self.connections.iter() {
            connection.value().pump_cancel.cancel();
            connection.value().sender.close();
        }
        self.connections.clear();
        self.queues.clear();
        self.routes.clear();
        self.topics.clear();
        self.agent_topics.clear();
        self.waiters.clear();
    }

    fn queue_for(&self, agent_id: &str) -> Arc<AgentQueue> {
        self.queues
            .entry(agent_id.to_string())
            .or_insert_with(AgentQueue::new)
            .clone()
    }

    /// Insert at the priority-determined position: after everything of
    /// equal or higher priority, preserving FIFO within a priority.
    async fn enqueue(&self, recipient: &str, message: Message) {
        let now = Utc::now();
        let queued = QueuedMessage {
            message,
            enqueued_at: now,
            next_retry_at: None,
        };

        if queued.is_expired(now) {
            self.emit_expired(recipient, &queued.message);
            return;
        }

        let queue = self.queue_for(recipient);
        let depth = {
            let mut items = queue.items.lock().await;
            let rank = queued.message.priority.rank();
            let position = items.partition_point(|q| q.message.priority.rank() <= rank);
            items.insert(position, queued);
            items.len()
        };

        if depth > self.config.queue_soft_limit {
            tracing::warn!(agent_id = %recipient, depth, "message queue over soft limit");
            self.events.emit(EventKind::QueuePressure {
                agent_id: recipient.to_string(),
                depth,
            });
        }

        queue.notify.notify_one();
    }

    /// Drain everything currently deliverable for an active recipient.
    async fn drain_queue(&self, agent_id: &str, queue: &Arc<AgentQueue>) {
        let now = Utc::now();
        let mut deliverable = Vec::new();
        {
            let mut items = queue.items.lock().await;
            let mut i = 0;
            while i < items.len() {
                if items[i].is_expired(now) {
                    let dropped = items.remove(i);
                    self.emit_expired(agent_id, &dropped.message);
                } else if items[i].is_due(now) {
                    deliverable.push(items.remove(i));
                } else {
                    i += 1;
                }
            }
        }

        for queued in deliverable {
            self.deliver(agent_id, queued).await;
        }
    }

    /// One delivery attempt to an active connection. Failure goes back
    /// to the queue with exponential backoff until attempts are
    /// exhausted.
    async fn deliver(&self, agent_id: &str, mut queued: QueuedMessage) {
        queued.message.attempts += 1;

        match self.try_deliver(agent_id, &queued.message).await {
            Ok(()) => {}
            Err(e) => {
                tracing::warn!(
                    agent_id = %agent_id,
                    message_id = %queued.message.id,
                    attempt = queued.message.attempts,
                    error = %e,
                    "message delivery failed"
                );
                if queued.message.attempts >= queued.message.max_attempts {
                    self.events.emit(EventKind::RetryFailed {
                        agent_id: agent_id.to_string(),
                        message_id: queued.message.id.to_string(),
                    });
                    return;
                }

                let backoff = self.config.retry_base_ms * u64::from(queued.message.attempts);
                queued.next_retry_at =
                    Some(Utc::now() + chrono::Duration::milliseconds(backoff as i64));
                let queue = self.queue_for(agent_id);
                let mut items = queue.items.lock().await;
                let rank = queued.message.priority.rank();
                let position = items.partition_point(|q| q.message.priority.rank() <= rank);
                items.insert(position, queued);
            }
        }
    }

    async fn try_deliver(&self, agent_id: &str, message: &Message) -> Result<()> {
        let mut message = message.clone();
        {
            let middleware = self.middleware.lock().await;
            for mw in middleware.iter() {
                message = mw.apply(message).await?;
            }
        }

        // Run matching routes first; a failing handler is a delivery
        // failure and the message is not pushed to the inbox.
        let handlers: Vec<Arc<dyn MessageHandler>> = match self.routes.get(agent_id) {
            Some(routes) => routes
                .iter()
                .filter(|r| r.pattern.matches(&message))
                .map(|r| Arc::clone(&r.handler))
                .collect(),
            None => Vec::new(),
        };

        if handlers.is_empty() {
            self.events.emit(EventKind::MessageReceived {
                agent_id: agent_id.to_string(),
                message_id: message.id.to_string(),
            });
        }

        for handler in handlers {
            let reply = handler.handle(&message).await?;
            if message.kind == MessageKind::Request {
                if let Some(value) = reply {
                    let mut response = Message::new(
                        agent_id,
                        vec![message.from.clone()],
                        MessageKind::Response,
                        value,
                    );
                    response.correlation_id = message.correlation_id;
                    response.priority = message.priority;
                    // Responses ride the normal send path so waiter
                    // fulfilment and history apply.
                    self.send(response).await?;
                }
            }
        }

        let sender = self
            .connections
            .get(agent_id)
            .map(|c| c.sender.clone())
            .ok_or_else(|| SupervisorError::not_found("connection", agent_id))?;
        sender
            .send(message)
            .await
            .map_err(|_| SupervisorError::ExternalFailure(format!("inbox for {} closed", agent_id)))
    }

    /// Periodic pass over every queue: drop expired messages and wake
    /// pumps whose retries have come due.
    async fn sweep_queues(&self) {
        let now = Utc::now();
        let queues: Vec<(String, Arc<AgentQueue>)> = self
            .queues
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        for (agent_id, queue) in queues {
            let mut has_due = false;
            {
                let mut items = queue.items.lock().await;
                let mut i = 0;
                while i < items.len() {
                    if items[i].is_expired(now) {
                        let dropped = items.remove(i);
                        self.emit_expired(&agent_id, &dropped.message);
                    } else {
                        has_due |= items[i].is_due(now);
                        i += 1;
                    }
                }
            }
            if has_due && self.is_connected(&agent_id) {
                queue.notify.notify_one();
            }
        }
    }

    async fn record_history(&self, message: &Message) {
        let key = message.conversation_key();
        let log = self
            .history
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Mutex::new(ConversationLog {
                    messages: Vec::new(),
                    last_activity: Utc::now(),
                }))
            })
            .clone();

        let mut log = log.lock().await;
        log.last_activity = Utc::now();
        log.messages.push(message.clone());
        while log.messages.len() > MAX_CONVERSATION_HISTORY {
            log.messages.remove(0);
        }
    }

    /// Discard conversations with no activity inside the idle window.
    async fn cleanup_history(&self) {
        let cutoff = Utc::now() - chrono::Duration::milliseconds(self.config.history_idle_ms as i64);
        let keys: Vec<String> = self.history.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            let stale = match self.history.get(&key) {
                Some(log) => log.lock().await.last_activity < cutoff,
                None => false,
            };
            if stale {
                self.history.remove(&key);
            }
        }
    }

    fn emit_expired(&self, agent_id: &str, message: &Message) {
        tracing::debug!(agent_id = %agent_id, message_id = %message.id, "message expired");
        self.events.emit(EventKind::MessageExpired {
            agent_id: agent_id.to_string(),
            message_id: message.id.to_string(),
        });
    }
}
