//! Task hand-off channels, one logical topic per branch.
//!
//! The default transport is ephemeral, fire-and-forget publish/subscribe:
//! a message published while no subscriber is live is silently dropped.
//! That loss is deliberate in the best-effort design, so `publish` reports
//! failure only on transport-level errors, never on "no subscriber".
//!
//! [`DurableChannels`] is the stricter alternative, backing every branch
//! task topic with its own event-log stream and per-branch consumer group.
//! It trades the simplicity of fire-and-forget for guaranteed delivery and
//! is selected through [`DeliveryMode`] in configuration. Wake pings stay
//! advisory in both modes; only task messages are stored.

use crate::events::{Branch, EventId, TaskMessage};
use crate::log::{EventLog, LogError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

/// Buffer size for in-process topics; enough for bursts while keeping
/// memory bounded.
pub const DEFAULT_CHANNEL_BUFFER: usize = 256;

/// Task delivery topic for a branch.
pub fn task_topic(branch: Branch) -> String {
    format!("branch:{branch}:task")
}

/// Notification-only wake topic for a branch.
pub fn wake_topic(branch: Branch) -> String {
    format!("branch:{branch}:wake")
}

/// Which transport backs the task channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Fire-and-forget pub/sub; tasks published while a branch is down
    /// are lost.
    #[default]
    BestEffort,
    /// Log-backed topics with per-branch consumer groups; tasks wait for
    /// the branch to come back.
    Durable,
}

/// Errors that can occur while handing a message to the transport.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// The transport itself failed (e.g. broker unreachable)
    #[error("transport error on {topic}: {reason}")]
    Transport { topic: String, reason: String },

    /// The backing log failed (durable mode)
    #[error(transparent)]
    Log(#[from] LogError),

    /// A stored task message could not be decoded (durable mode)
    #[error("undecodable task message on {topic}: {reason}")]
    Decode { topic: String, reason: String },
}

/// What happened to an accepted publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// At least one live subscriber received it (or it was durably stored).
    Delivered,
    /// Accepted by the transport but no subscriber was live; the message
    /// is gone.
    Dropped,
}

/// Transport seam between the dispatcher and whatever carries tasks to
/// branch workers.
#[async_trait]
pub trait TaskTransport: Send + Sync {
    /// Deliver a task message to a branch's task topic.
    async fn publish(
        &self,
        branch: Branch,
        message: TaskMessage,
    ) -> Result<PublishOutcome, ChannelError>;

    /// Lightweight ping on the branch's wake topic; the payload just echoes
    /// the triggering event.
    async fn publish_wake(
        &self,
        branch: Branch,
        payload: Map<String, Value>,
    ) -> Result<PublishOutcome, ChannelError>;
}

// ---------------------------------------------------------------------------
// Best-effort in-process transport
// ---------------------------------------------------------------------------

/// In-process broadcast transport, one topic pair per branch.
///
/// Subscriptions are infinite and not restartable: a subscriber started
/// after a publish never sees it.
pub struct InProcessChannels {
    tasks: HashMap<Branch, broadcast::Sender<TaskMessage>>,
    wakes: HashMap<Branch, broadcast::Sender<Map<String, Value>>>,
}

impl InProcessChannels {
    pub fn new() -> Self {
        let mut tasks = HashMap::new();
        let mut wakes = HashMap::new();
        for branch in Branch::ALL {
            let (task_tx, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER);
            let (wake_tx, _) = broadcast::channel(DEFAULT_CHANNEL_BUFFER);
            tasks.insert(branch, task_tx);
            wakes.insert(branch, wake_tx);
        }
        Self { tasks, wakes }
    }

    /// Subscribe to a branch's task topic.
    pub fn subscribe(&self, branch: Branch) -> broadcast::Receiver<TaskMessage> {
        // Senders for every branch are created in `new`.
        self.tasks[&branch].subscribe()
    }

    /// Subscribe to a branch's task topic as a lazy stream.
    pub fn subscribe_stream(&self, branch: Branch) -> BroadcastStream<TaskMessage> {
        BroadcastStream::new(self.subscribe(branch))
    }

    /// Subscribe to a branch's wake topic.
    pub fn subscribe_wake(&self, branch: Branch) -> broadcast::Receiver<Map<String, Value>> {
        self.wakes[&branch].subscribe()
    }
}

impl Default for InProcessChannels {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskTransport for InProcessChannels {
    async fn publish(
        &self,
        branch: Branch,
        message: TaskMessage,
    ) -> Result<PublishOutcome, ChannelError> {
        let Some(sender) = self.tasks.get(&branch) else {
            return Err(ChannelError::Transport {
                topic: task_topic(branch),
                reason: "topic missing".to_string(),
            });
        };
        match sender.send(message) {
            Ok(subscribers) => {
                tracing::debug!(topic = %task_topic(branch), subscribers, "task published");
                Ok(PublishOutcome::Delivered)
            }
            Err(_) => {
                tracing::debug!(topic = %task_topic(branch), "no live subscriber, task dropped");
                Ok(PublishOutcome::Dropped)
            }
        }
    }

    async fn publish_wake(
        &self,
        branch: Branch,
        payload: Map<String, Value>,
    ) -> Result<PublishOutcome, ChannelError> {
        let Some(sender) = self.wakes.get(&branch) else {
            return Err(ChannelError::Transport {
                topic: wake_topic(branch),
                reason: "topic missing".to_string(),
            });
        };
        match sender.send(payload) {
            Ok(_) => Ok(PublishOutcome::Delivered),
            Err(_) => Ok(PublishOutcome::Dropped),
        }
    }
}

// ---------------------------------------------------------------------------
// Durable log-backed transport
// ---------------------------------------------------------------------------

/// Source recorded on durably stored task messages.
const DISPATCH_SOURCE: &str = "dispatcher";

/// Log-backed transport: every branch task topic is its own stream with a
/// per-branch consumer group, so tasks published while the branch is down
/// are delivered when it returns.
#[derive(Clone)]
pub struct DurableChannels {
    pool: SqlitePool,
}

impl DurableChannels {
    /// Create the per-branch consumer groups and return the transport.
    pub async fn new(pool: SqlitePool) -> Result<Self, ChannelError> {
        for branch in Branch::ALL {
            let log = EventLog::new(pool.clone(), task_topic(branch));
            log.create_group(branch.as_str()).await?;
        }
        Ok(Self { pool })
    }

    fn topic_log(&self, topic: String) -> EventLog {
        EventLog::new(self.pool.clone(), topic)
    }

    /// Branch-side receive: the next undelivered task messages, oldest
    /// first, waiting up to `max_wait`. Messages stay pending until
    /// [`DurableChannels::ack`] is called with their id (at-least-once).
    pub async fn receive(
        &self,
        branch: Branch,
        max_count: u32,
        max_wait: Duration,
    ) -> Result<Vec<(EventId, TaskMessage)>, ChannelError> {
        let log = self.topic_log(task_topic(branch));
        let events = log
            .consume(branch.as_str(), branch.as_str(), max_count, max_wait)
            .await?;
        let mut messages = Vec::with_capacity(events.len());
        for event in events {
            let message: TaskMessage = serde_json::from_value(Value::Object(event.payload))
                .map_err(|e| ChannelError::Decode {
                    topic: task_topic(branch),
                    reason: e.to_string(),
                })?;
            messages.push((event.id, message));
        }
        Ok(messages)
    }

    /// Acknowledge every task up to and including `id` for a branch.
    pub async fn ack(&self, branch: Branch, id: EventId) -> Result<(), ChannelError> {
        let log = self.topic_log(task_topic(branch));
        log.commit(branch.as_str(), id).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskTransport for DurableChannels {
    async fn publish(
        &self,
        branch: Branch,
        message: TaskMessage,
    ) -> Result<PublishOutcome, ChannelError> {
        let payload = match serde_json::to_value(&message) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                return Err(ChannelError::Decode {
                    topic: task_topic(branch),
                    reason: "task message did not serialize to an object".to_string(),
                });
            }
        };
        let log = self.topic_log(task_topic(branch));
        let id = log.append(DISPATCH_SOURCE, "TaskDispatched", &payload).await?;
        tracing::debug!(topic = %log.stream(), id, "task stored durably");
        Ok(PublishOutcome::Delivered)
    }

    /// Wake pings are advisory nudges for live subscribers. Durable
    /// branches poll [`DurableChannels::receive`] directly, so storing a
    /// ping would only accumulate unread wake streams; it is dropped
    /// instead.
    async fn publish_wake(
        &self,
        _branch: Branch,
        _payload: Map<String, Value>,
    ) -> Result<PublishOutcome, ChannelError> {
        Ok(PublishOutcome::Dropped)
    }
}
