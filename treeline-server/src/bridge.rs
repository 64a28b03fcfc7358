//! Producer adapter: bridges an external contract-event source onto the
//! context stream.
//!
//! The bridge polls a [`ChainSource`] on a fixed interval, appends every
//! raw event to the log, and pings the wake topic of each branch the event
//! kind routes to. Source failures are logged and retried after a longer
//! sleep; they never stop the loop. The dispatcher stays unaware of any of
//! this and only ever sees the log.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::watch;
use tracing::{debug, error, info};
use treeline_core::channels::{ChannelError, TaskTransport};
use treeline_core::events::EventKind;
use treeline_core::log::{EventLog, LogError};
use treeline_core::routing;

/// Sleep after a failed poll before trying the source again.
const ERROR_RETRY: Duration = Duration::from_secs(5);

/// One raw event emitted by the external contract.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ChainEvent {
    pub event_name: String,
    pub block_number: u64,
    pub tx_hash: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// Where raw contract events come from.
#[async_trait]
pub trait ChainSource: Send {
    /// Fetch the events emitted since the previous call.
    async fn poll(&mut self) -> anyhow::Result<Vec<ChainEvent>>;
}

#[derive(Debug, Error)]
enum BridgeError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
    #[error("timestamp formatting error: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// The bridge processor.
pub struct EventBridge<S> {
    source: S,
    log: EventLog,
    transport: Arc<dyn TaskTransport>,
    poll_interval: Duration,
}

impl<S: ChainSource> EventBridge<S> {
    pub fn new(
        source: S,
        log: EventLog,
        transport: Arc<dyn TaskTransport>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            source,
            log,
            transport,
            poll_interval,
        }
    }

    /// Run until the shutdown signal fires.
    pub async fn run(mut self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(stream = %self.log.stream(), "event bridge started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("event bridge received shutdown signal");
                        break;
                    }
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    match self.source.poll().await {
                        Ok(events) => {
                            for event in events {
                                if let Err(e) = self.sync_event(&event).await {
                                    error!(
                                        event = %event.event_name,
                                        tx_hash = %event.tx_hash,
                                        error = %e,
                                        "failed to sync chain event"
                                    );
                                }
                            }
                        }
                        Err(e) => {
                            error!(error = %e, "chain source poll failed");
                            tokio::time::sleep(ERROR_RETRY).await;
                        }
                    }
                }
            }
        }

        info!("event bridge stopped");
    }

    /// Append one raw event to the stream and wake the branches its kind
    /// routes to.
    async fn sync_event(&self, event: &ChainEvent) -> Result<(), BridgeError> {
        let mut payload = Map::new();
        payload.insert("source".to_string(), Value::String("blockchain".to_string()));
        payload.insert(
            "event_name".to_string(),
            Value::String(event.event_name.clone()),
        );
        payload.insert(
            "timestamp".to_string(),
            Value::String(OffsetDateTime::now_utc().format(&Rfc3339)?),
        );
        payload.insert("block_number".to_string(), Value::from(event.block_number));
        payload.insert("tx_hash".to_string(), Value::String(event.tx_hash.clone()));
        payload.insert("args".to_string(), Value::Object(event.args.clone()));

        let id = self
            .log
            .append("blockchain", &event.event_name, &payload)
            .await?;
        info!(id, event = %event.event_name, "chain event synced");

        let kind = EventKind::from(event.event_name.as_str());
        for route in routing::routes_for(&kind) {
            self.transport
                .publish_wake(route.branch, payload.clone())
                .await?;
            debug!(branch = %route.branch, "branch woken");
        }
        Ok(())
    }
}

/// Development stand-in for a real contract listener: tails a JSON-lines
/// feed file, one [`ChainEvent`] per line.
pub struct JsonFeedSource {
    path: PathBuf,
    offset: u64,
}

impl JsonFeedSource {
    pub fn new(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            offset: 0,
        }
    }
}

#[async_trait]
impl ChainSource for JsonFeedSource {
    async fn poll(&mut self) -> anyhow::Result<Vec<ChainEvent>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        // A shrunken file means truncation or rotation; the old offset
        // points past the end, so start over from the new content.
        if (content.len() as u64) < self.offset {
            tracing::warn!(path = %self.path.display(), "feed file shrank, re-reading from the start");
            self.offset = 0;
        }

        let new = match content.get(self.offset as usize..) {
            Some(rest) if !rest.is_empty() => rest,
            _ => return Ok(Vec::new()),
        };

        // Only consume complete lines; a partially written tail waits for
        // the next poll.
        let Some(complete_end) = new.rfind('\n') else {
            return Ok(Vec::new());
        };
        let complete = &new[..complete_end];
        self.offset += complete_end as u64 + 1;

        let mut events = Vec::new();
        for line in complete.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            events.push(serde_json::from_str::<ChainEvent>(line)?);
        }
        Ok(events)
    }
}
