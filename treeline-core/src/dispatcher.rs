//! The dispatcher: the orchestrator's main control loop.
//!
//! Reads batches from the event log under its consumer group, classifies
//! each event through the routing table, fans one task message per matched
//! branch out to the task channels, and advances the group cursor only
//! after every publish in the batch has succeeded. A publish or log failure
//! aborts the batch uncommitted; the delivered watermark is rewound so the
//! whole batch comes back on the next read. Delivery is at-least-once;
//! branches must de-duplicate by correlation id.

use crate::channels::{ChannelError, PublishOutcome, TaskTransport};
use crate::events::{Branch, Event, EventId};
use crate::log::{EventLog, LogError};
use crate::planner::TaskPlanner;
use crate::routing;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Exponential backoff delay for consecutive failures: 1s, 2s, 4s, then
/// capped at 5s. The attempt count is unbounded.
pub fn backoff_delay(failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures.min(3));
    (BACKOFF_BASE * factor).min(BACKOFF_CAP)
}

/// Errors that terminate the dispatcher.
///
/// Failed log reads, failed publishes, and malformed events are contained
/// inside the loop and reported via counters and logs.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The log never became reachable during startup
    #[error("event log unreachable after {attempts} startup attempts: {last}")]
    Init { attempts: u32, last: LogError },
}

#[derive(Debug, Error)]
enum BatchError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

/// Lifecycle states of the dispatcher loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
    Starting,
    Running,
    Backoff,
    ShuttingDown,
    Stopped,
}

impl DispatcherState {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatcherState::Starting => "starting",
            DispatcherState::Running => "running",
            DispatcherState::Backoff => "backoff",
            DispatcherState::ShuttingDown => "shutting_down",
            DispatcherState::Stopped => "stopped",
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => DispatcherState::Starting,
            1 => DispatcherState::Running,
            2 => DispatcherState::Backoff,
            3 => DispatcherState::ShuttingDown,
            _ => DispatcherState::Stopped,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            DispatcherState::Starting => 0,
            DispatcherState::Running => 1,
            DispatcherState::Backoff => 2,
            DispatcherState::ShuttingDown => 3,
            DispatcherState::Stopped => 4,
        }
    }
}

impl std::fmt::Display for DispatcherState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operational counters, exposed read-only for observability.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    events_processed: AtomicU64,
    malformed_events: AtomicU64,
    dropped_publishes: AtomicU64,
    published: [AtomicU64; Branch::ALL.len()],
    cursor: AtomicI64,
    state: AtomicU8,
}

impl DispatcherStats {
    pub fn events_processed(&self) -> u64 {
        self.events_processed.load(Ordering::Relaxed)
    }

    pub fn malformed_events(&self) -> u64 {
        self.malformed_events.load(Ordering::Relaxed)
    }

    /// Publishes accepted by the transport but received by no subscriber.
    pub fn dropped_publishes(&self) -> u64 {
        self.dropped_publishes.load(Ordering::Relaxed)
    }

    pub fn published_to(&self, branch: Branch) -> u64 {
        self.published[branch.index()].load(Ordering::Relaxed)
    }

    /// Last committed event id.
    pub fn cursor(&self) -> EventId {
        self.cursor.load(Ordering::Relaxed)
    }

    pub fn state(&self) -> DispatcherState {
        DispatcherState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: DispatcherState) {
        self.state.store(state.as_u8(), Ordering::Relaxed);
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Consumer group name on the log stream.
    pub group: String,
    /// This instance's member name within the group.
    pub consumer: String,
    /// Maximum events per consumed batch.
    pub batch_size: u32,
    /// Upper bound on how long one `consume` call waits for new events.
    pub max_wait: Duration,
    /// Connection attempts before startup fails fatally.
    pub startup_attempts: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            group: "orchestrator".to_string(),
            consumer: "orchestrator-1".to_string(),
            batch_size: 10,
            max_wait: Duration::from_secs(1),
            startup_attempts: 5,
        }
    }
}

/// The dispatcher instance. Single-threaded cooperative loop; the log read
/// is the sole suspension point, bounded by `max_wait`.
pub struct Dispatcher {
    log: EventLog,
    transport: Arc<dyn TaskTransport>,
    config: DispatcherConfig,
    planner: TaskPlanner,
    stats: Arc<DispatcherStats>,
}

impl Dispatcher {
    pub fn new(log: EventLog, transport: Arc<dyn TaskTransport>, config: DispatcherConfig) -> Self {
        Self {
            log,
            transport,
            config,
            planner: TaskPlanner::new(),
            stats: Arc::new(DispatcherStats::default()),
        }
    }

    /// Shared handle to the operational counters.
    pub fn stats(&self) -> Arc<DispatcherStats> {
        Arc::clone(&self.stats)
    }

    /// Run until the shutdown signal fires.
    ///
    /// Returns an error only when the log cannot be reached during startup
    /// within the configured attempt bound; the caller is expected to treat
    /// that as process-fatal.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), DispatchError> {
        self.stats.set_state(DispatcherState::Starting);
        self.start_up().await?;

        info!(
            group = %self.config.group,
            consumer = %self.config.consumer,
            stream = %self.log.stream(),
            "dispatcher running"
        );
        self.stats.set_state(DispatcherState::Running);

        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                biased;

                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("dispatcher received shutdown signal");
                        break;
                    }
                }

                batch = self.log.consume(
                    &self.config.group,
                    &self.config.consumer,
                    self.config.batch_size,
                    self.config.max_wait,
                ) => {
                    match batch {
                        Ok(events) if events.is_empty() => {}
                        Ok(events) => match self.dispatch_batch(&events).await {
                            Ok(()) => failures = 0,
                            Err(e) => {
                                warn!(error = %e, "batch aborted uncommitted");
                                if self.back_off(&mut failures, &mut shutdown_rx).await {
                                    info!("dispatcher received shutdown signal");
                                    break;
                                }
                            }
                        },
                        Err(e) => {
                            warn!(error = %e, "event log read failed");
                            if self.back_off(&mut failures, &mut shutdown_rx).await {
                                info!("dispatcher received shutdown signal");
                                break;
                            }
                        }
                    }
                }
            }
        }

        // The in-flight batch, if any, completed inside its select arm
        // before the shutdown arm could win; nothing is left to drain.
        self.stats.set_state(DispatcherState::ShuttingDown);
        info!(
            events_processed = self.stats.events_processed(),
            cursor = self.stats.cursor(),
            "dispatcher stopped"
        );
        self.stats.set_state(DispatcherState::Stopped);
        Ok(())
    }

    /// Bounded startup: ping the log, ensure the group exists, and rewind
    /// the delivered watermark so anything a crashed predecessor consumed
    /// but never committed is redelivered.
    async fn start_up(&self) -> Result<(), DispatchError> {
        let attempts = self.config.startup_attempts.max(1);
        let mut last = match self.try_connect().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        for attempt in 1..attempts {
            warn!(attempt, error = %last, "event log not reachable yet");
            tokio::time::sleep(backoff_delay(attempt - 1)).await;
            match self.try_connect().await {
                Ok(()) => return Ok(()),
                Err(e) => last = e,
            }
        }
        Err(DispatchError::Init { attempts, last })
    }

    async fn try_connect(&self) -> Result<(), LogError> {
        self.log.ping().await?;
        self.log.create_group(&self.config.group).await?;
        self.log.reset_delivered(&self.config.group).await?;
        Ok(())
    }

    /// Rewind the delivered watermark and sleep the backoff delay, leaving
    /// early if shutdown fires.
    ///
    /// Returns `true` when the shutdown signal fired during the wait. The
    /// select here consumes the watch notification, so the caller must act
    /// on the returned flag rather than wait for another change.
    async fn back_off(&self, failures: &mut u32, shutdown_rx: &mut watch::Receiver<bool>) -> bool {
        self.stats.set_state(DispatcherState::Backoff);
        if let Err(e) = self.log.reset_delivered(&self.config.group).await {
            warn!(error = %e, "could not rewind delivered watermark");
        }
        let delay = backoff_delay(*failures);
        *failures = failures.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.changed() => {}
        }
        if *shutdown_rx.borrow() {
            return true;
        }
        self.stats.set_state(DispatcherState::Running);
        false
    }

    /// Fan out one batch, then commit its last id. Commit is per-batch:
    /// skipped and unmatched events advance with it.
    async fn dispatch_batch(&self, events: &[Event]) -> Result<(), BatchError> {
        for event in events {
            self.dispatch_event(event).await?;
        }
        let Some(last_id) = events.last().map(|e| e.id) else {
            return Ok(());
        };
        self.log.commit(&self.config.group, last_id).await?;
        self.stats.cursor.store(last_id, Ordering::Relaxed);
        debug!(last_id, count = events.len(), "batch committed");
        Ok(())
    }

    async fn dispatch_event(&self, event: &Event) -> Result<(), ChannelError> {
        let routes = routing::routes_for(&event.kind);
        if routes.is_empty() {
            debug!(id = event.id, kind = %event.kind, "event matches no branch");
        } else if !routable_payload(event) {
            // Skipped, but still counted toward the batch's commit boundary.
            warn!(id = event.id, kind = %event.kind, "malformed payload, event skipped");
            self.stats.malformed_events.fetch_add(1, Ordering::Relaxed);
        } else {
            for route in routes {
                let message = routing::task_message(route, event);
                let planned_steps = self.planner.decompose(&message.task).len();
                debug!(
                    id = event.id,
                    branch = %route.branch,
                    task = %message.task,
                    correlation_id = %message.correlation_id,
                    planned_steps,
                    "dispatching task"
                );
                match self.transport.publish(route.branch, message).await? {
                    PublishOutcome::Delivered => {}
                    PublishOutcome::Dropped => {
                        self.stats.dropped_publishes.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.stats.published[route.branch.index()].fetch_add(1, Ordering::Relaxed);
            }
        }
        self.stats.events_processed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A routed event needs an `args` object for correlation; anything else is
/// malformed and must not block the rest of the batch.
fn routable_payload(event: &Event) -> bool {
    event
        .payload
        .get("args")
        .is_some_and(|args| args.is_object())
}
