//! Durable append-only event log with consumer-group checkpointing.
//!
//! The log is a SQLite-backed, strictly-ordered sequence of events. Several
//! named streams share one database; ids are assigned by the insert
//! statement itself and strictly increase within a stream (the log is
//! append-only, so ids are never reused).
//!
//! Consumer groups track two positions per stream:
//!
//! - a **committed cursor**, advanced only by [`EventLog::commit`] once a
//!   batch has been fully fanned out, and
//! - a **delivered watermark**, advanced by [`EventLog::consume`] inside the
//!   read transaction so that concurrent group members never receive the
//!   same undelivered event.
//!
//! [`EventLog::reset_delivered`] rewinds the watermark to the committed
//! cursor, which redelivers everything consumed but never committed. The
//! dispatcher calls it on startup and after an aborted batch, giving the
//! group at-least-once delivery across crashes.

use crate::events::{Event, EventId, EventKind};
use serde_json::{Map, Value};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

/// Interval between polls while a `consume` call waits for new events.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that can occur against the log substrate.
#[derive(Debug, Error)]
pub enum LogError {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// The consumer group was never created on this stream
    #[error("unknown consumer group: {0}")]
    UnknownGroup(String),

    /// A stored event could not be decoded
    #[error("corrupt stored event {id}: {reason}")]
    Corrupt { id: EventId, reason: String },

    /// Payload serialization error
    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Timestamp formatting error
    #[error("timestamp formatting error: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Read-only stream introspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogStats {
    pub length: u64,
    pub first_id: Option<EventId>,
    pub last_id: Option<EventId>,
}

/// Open a SQLite pool for the given database URL.
///
/// In-memory databases are pinned to a single connection so every handle
/// sees the same data.
pub async fn connect(url: &str) -> Result<SqlitePool, LogError> {
    let max_connections = if url.contains(":memory:") { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect(url)
        .await?;
    Ok(pool)
}

/// Create the log tables if they do not exist yet. Idempotent.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), LogError> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS events (
            stream    TEXT    NOT NULL,
            id        INTEGER NOT NULL,
            source    TEXT    NOT NULL,
            kind      TEXT    NOT NULL,
            timestamp TEXT    NOT NULL,
            payload   TEXT    NOT NULL,
            PRIMARY KEY (stream, id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cursors (
            stream       TEXT    NOT NULL,
            grp          TEXT    NOT NULL,
            committed_id INTEGER NOT NULL DEFAULT 0,
            delivered_id INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (stream, grp)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Handle to one named stream of the log.
///
/// Explicitly constructed and passed by reference or clone; there is no
/// process-wide connection state.
#[derive(Clone)]
pub struct EventLog {
    pool: SqlitePool,
    stream: String,
}

impl EventLog {
    pub fn new(pool: SqlitePool, stream: impl Into<String>) -> Self {
        Self {
            pool,
            stream: stream.into(),
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Append one event and return its log-assigned id.
    ///
    /// The id is computed and inserted in a single statement, so the append
    /// either fully succeeds or fails. With several pooled connections two
    /// producers can race to the same id; the loser retries with a fresh
    /// `MAX`, so concurrent appends serialize into one total order instead
    /// of surfacing the conflict.
    pub async fn append(
        &self,
        source: &str,
        kind: &str,
        payload: &Map<String, Value>,
    ) -> Result<EventId, LogError> {
        let timestamp = OffsetDateTime::now_utc().format(&Rfc3339)?;
        let payload_text = serde_json::to_string(payload)?;

        loop {
            match self
                .insert_event(source, kind, &timestamp, &payload_text)
                .await
            {
                Ok(id) => {
                    tracing::debug!(stream = %self.stream, id, source, kind, "event appended");
                    return Ok(id);
                }
                Err(e) if is_append_conflict(&e) => {
                    tracing::debug!(stream = %self.stream, "append raced a concurrent writer, retrying");
                    tokio::task::yield_now().await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn insert_event(
        &self,
        source: &str,
        kind: &str,
        timestamp: &str,
        payload_text: &str,
    ) -> Result<EventId, sqlx::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO events (stream, id, source, kind, timestamp, payload)
            SELECT ?1, COALESCE(MAX(id), 0) + 1, ?2, ?3, ?4, ?5
            FROM events WHERE stream = ?1
            RETURNING id
            "#,
        )
        .bind(&self.stream)
        .bind(source)
        .bind(kind)
        .bind(timestamp)
        .bind(payload_text)
        .fetch_one(&self.pool)
        .await?;

        row.try_get("id")
    }

    /// Read the next batch of events for a consumer group.
    ///
    /// Returns events strictly after the group's delivered watermark, in id
    /// order, at most `max_count` of them. Blocks up to `max_wait` when the
    /// stream has nothing new, then returns an empty batch (not an error).
    ///
    /// The `consumer` name is recorded in logs only; member-level delivery
    /// accounting is the watermark itself.
    pub async fn consume(
        &self,
        group: &str,
        consumer: &str,
        max_count: u32,
        max_wait: Duration,
    ) -> Result<Vec<Event>, LogError> {
        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let batch = self.read_batch(group, consumer, max_count).await?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn read_batch(
        &self,
        group: &str,
        consumer: &str,
        max_count: u32,
    ) -> Result<Vec<Event>, LogError> {
        let mut tx = self.pool.begin().await?;

        let cursor = sqlx::query(
            "SELECT delivered_id FROM cursors WHERE stream = ?1 AND grp = ?2",
        )
        .bind(&self.stream)
        .bind(group)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(cursor) = cursor else {
            return Err(LogError::UnknownGroup(group.to_string()));
        };
        let delivered: i64 = cursor.try_get("delivered_id")?;

        let rows = sqlx::query(
            r#"
            SELECT id, source, kind, timestamp, payload
            FROM events
            WHERE stream = ?1 AND id > ?2
            ORDER BY id
            LIMIT ?3
            "#,
        )
        .bind(&self.stream)
        .bind(delivered)
        .bind(i64::from(max_count))
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            events.push(decode_event(&row)?);
        }

        if let Some(last) = events.last() {
            sqlx::query(
                "UPDATE cursors SET delivered_id = ?3 WHERE stream = ?1 AND grp = ?2",
            )
            .bind(&self.stream)
            .bind(group)
            .bind(last.id)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        tracing::debug!(
            stream = %self.stream,
            group,
            consumer,
            count = events.len(),
            "batch delivered"
        );
        Ok(events)
    }

    /// Advance the group's committed cursor to `id`.
    ///
    /// Forward-only and idempotent: committing at or behind the current
    /// cursor is a no-op.
    pub async fn commit(&self, group: &str, id: EventId) -> Result<(), LogError> {
        let result = sqlx::query(
            r#"
            UPDATE cursors
            SET committed_id = ?3, delivered_id = MAX(delivered_id, ?3)
            WHERE stream = ?1 AND grp = ?2 AND committed_id <= ?3
            "#,
        )
        .bind(&self.stream)
        .bind(group)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 && !self.group_exists(group).await? {
            return Err(LogError::UnknownGroup(group.to_string()));
        }
        Ok(())
    }

    /// Rewind the delivered watermark to the committed cursor, so events
    /// consumed but never committed are delivered again.
    pub async fn reset_delivered(&self, group: &str) -> Result<(), LogError> {
        let result = sqlx::query(
            "UPDATE cursors SET delivered_id = committed_id WHERE stream = ?1 AND grp = ?2",
        )
        .bind(&self.stream)
        .bind(group)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LogError::UnknownGroup(group.to_string()));
        }
        Ok(())
    }

    /// Register a consumer group on this stream, starting at the beginning.
    /// Idempotent; never rolls an existing group back.
    pub async fn create_group(&self, group: &str) -> Result<(), LogError> {
        sqlx::query("INSERT OR IGNORE INTO cursors (stream, grp) VALUES (?1, ?2)")
            .bind(&self.stream)
            .bind(group)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn group_exists(&self, group: &str) -> Result<bool, LogError> {
        let row = sqlx::query("SELECT 1 FROM cursors WHERE stream = ?1 AND grp = ?2")
            .bind(&self.stream)
            .bind(group)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    /// Last committed event id for a group.
    pub async fn committed(&self, group: &str) -> Result<EventId, LogError> {
        let row = sqlx::query(
            "SELECT committed_id FROM cursors WHERE stream = ?1 AND grp = ?2",
        )
        .bind(&self.stream)
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;
        let Some(row) = row else {
            return Err(LogError::UnknownGroup(group.to_string()));
        };
        Ok(row.try_get("committed_id")?)
    }

    pub async fn stats(&self) -> Result<LogStats, LogError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS length, MIN(id) AS first_id, MAX(id) AS last_id \
             FROM events WHERE stream = ?1",
        )
        .bind(&self.stream)
        .fetch_one(&self.pool)
        .await?;
        let length: i64 = row.try_get("length")?;
        Ok(LogStats {
            length: length.unsigned_abs(),
            first_id: row.try_get("first_id")?,
            last_id: row.try_get("last_id")?,
        })
    }

    /// Liveness probe: one round trip to the database.
    pub async fn ping(&self) -> Result<(), LogError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// A lost id race shows up as a busy/snapshot error (SQLite codes 5 and
/// 517) or a primary-key conflict, depending on who holds the write lock.
fn is_append_conflict(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db) = error else {
        return false;
    };
    db.is_unique_violation() || matches!(db.code().as_deref(), Some("5" | "517"))
}

fn decode_event(row: &sqlx::sqlite::SqliteRow) -> Result<Event, LogError> {
    let id: EventId = row.try_get("id")?;
    let timestamp_text: String = row.try_get("timestamp")?;
    let timestamp =
        OffsetDateTime::parse(&timestamp_text, &Rfc3339).map_err(|e| LogError::Corrupt {
            id,
            reason: format!("bad timestamp: {e}"),
        })?;
    let payload_text: String = row.try_get("payload")?;
    let payload: Map<String, Value> =
        serde_json::from_str(&payload_text).map_err(|e| LogError::Corrupt {
            id,
            reason: format!("bad payload: {e}"),
        })?;
    let kind_text: String = row.try_get("kind")?;

    Ok(Event {
        id,
        source: row.try_get("source")?,
        kind: EventKind::from(kind_text.as_str()),
        timestamp,
        payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn memory_log(stream: &str) -> EventLog {
        let pool = connect("sqlite::memory:").await.unwrap();
        init_schema(&pool).await.unwrap();
        EventLog::new(pool, stream)
    }

    fn payload(args: Value) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("source".to_string(), json!("blockchain"));
        map.insert("args".to_string(), args);
        map
    }

    #[tokio::test]
    async fn append_ids_are_strictly_increasing() {
        let log = memory_log("context-stream").await;
        let mut last = 0;
        for n in 0..5 {
            let id = log
                .append("test", "ContributionSubmitted", &payload(json!({ "n": n })))
                .await
                .unwrap();
            assert!(id > last);
            last = id;
        }
    }

    #[tokio::test]
    async fn concurrent_appends_never_repeat_ids() {
        let log = memory_log("context-stream").await;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..10 {
                    ids.push(
                        log.append("test", "RewardDistributed", &payload(json!({})))
                            .await
                            .unwrap(),
                    );
                }
                ids
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        let expected: Vec<EventId> = (1..=40).collect();
        assert_eq!(all, expected);
    }

    #[tokio::test]
    async fn concurrent_appends_serialize_on_a_shared_file() {
        // A file-backed pool with several connections, so appends can
        // actually race each other instead of queueing on one handle.
        let path = std::env::temp_dir().join(format!("treeline-log-{}.db", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let url = format!("sqlite://{}?mode=rwc", path.display());
        let pool = connect(&url).await.unwrap();
        init_schema(&pool).await.unwrap();
        let log = EventLog::new(pool.clone(), "context-stream");

        let mut handles = Vec::new();
        for _ in 0..4 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                let mut ids = Vec::new();
                for _ in 0..10 {
                    ids.push(
                        log.append("test", "RewardDistributed", &payload(json!({})))
                            .await
                            .unwrap(),
                    );
                }
                ids
            }));
        }
        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        all.sort_unstable();
        let expected: Vec<EventId> = (1..=40).collect();
        assert_eq!(all, expected);

        pool.close().await;
        let _ = std::fs::remove_file(&path);
        let _ = std::fs::remove_file(format!("{}-wal", path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", path.display()));
    }

    #[tokio::test]
    async fn streams_have_independent_ids() {
        let log_a = memory_log("context-stream").await;
        let log_b = EventLog::new(log_a.pool.clone(), "branch:wealth:task");
        assert_eq!(log_a.append("a", "X", &Map::new()).await.unwrap(), 1);
        assert_eq!(log_b.append("b", "Y", &Map::new()).await.unwrap(), 1);
        assert_eq!(log_a.append("a", "X", &Map::new()).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn consume_requires_a_known_group() {
        let log = memory_log("context-stream").await;
        let err = log
            .consume("nobody", "c1", 10, Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, LogError::UnknownGroup(_)));
    }

    #[tokio::test]
    async fn consume_returns_events_after_the_cursor_in_order() {
        let log = memory_log("context-stream").await;
        log.create_group("orchestrator").await.unwrap();
        for n in 0..3 {
            log.append("test", "ContributionSubmitted", &payload(json!({ "n": n })))
                .await
                .unwrap();
        }

        let batch = log
            .consume("orchestrator", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(batch[0].kind, EventKind::ContributionSubmitted);

        // Delivered but uncommitted: the same handle sees nothing new.
        let empty = log
            .consume("orchestrator", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert!(empty.is_empty());
    }

    #[tokio::test]
    async fn commit_is_forward_only_and_idempotent() {
        let log = memory_log("context-stream").await;
        log.create_group("orchestrator").await.unwrap();
        for _ in 0..3 {
            log.append("test", "X", &Map::new()).await.unwrap();
        }

        log.commit("orchestrator", 2).await.unwrap();
        assert_eq!(log.committed("orchestrator").await.unwrap(), 2);

        // Behind the cursor: a no-op, not an error.
        log.commit("orchestrator", 1).await.unwrap();
        assert_eq!(log.committed("orchestrator").await.unwrap(), 2);

        log.commit("orchestrator", 2).await.unwrap();
        assert_eq!(log.committed("orchestrator").await.unwrap(), 2);

        let batch = log
            .consume("orchestrator", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn reset_delivered_redelivers_uncommitted_events() {
        let log = memory_log("context-stream").await;
        log.create_group("orchestrator").await.unwrap();
        for _ in 0..3 {
            log.append("test", "X", &Map::new()).await.unwrap();
        }

        let first = log
            .consume("orchestrator", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(first.len(), 3);

        // Crash before commit: rewinding the watermark replays the batch.
        log.reset_delivered("orchestrator").await.unwrap();
        let again = log
            .consume("orchestrator", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(again, first);

        // Committed events stay committed across a reset.
        log.commit("orchestrator", 2).await.unwrap();
        log.reset_delivered("orchestrator").await.unwrap();
        let tail = log
            .consume("orchestrator", "c1", 10, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(tail.iter().map(|e| e.id).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn group_existence_is_observable() {
        let log = memory_log("context-stream").await;
        assert!(!log.group_exists("orchestrator").await.unwrap());
        log.create_group("orchestrator").await.unwrap();
        assert!(log.group_exists("orchestrator").await.unwrap());
        // Re-creating never rolls the cursor back.
        log.append("test", "X", &Map::new()).await.unwrap();
        log.commit("orchestrator", 1).await.unwrap();
        log.create_group("orchestrator").await.unwrap();
        assert_eq!(log.committed("orchestrator").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn consume_with_bounded_wait_returns_empty() {
        let log = memory_log("context-stream").await;
        log.create_group("orchestrator").await.unwrap();
        let started = std::time::Instant::now();
        let batch = log
            .consume("orchestrator", "c1", 10, Duration::from_millis(150))
            .await
            .unwrap();
        assert!(batch.is_empty());
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn payload_round_trips_byte_for_byte() {
        let log = memory_log("context-stream").await;
        log.create_group("orchestrator").await.unwrap();
        let original = payload(json!({"contributionId": 42, "nested": {"k": [1, 2, 3]}}));
        log.append("blockchain", "ContributionVerified", &original)
            .await
            .unwrap();

        let batch = log
            .consume("orchestrator", "c1", 1, Duration::ZERO)
            .await
            .unwrap();
        assert_eq!(batch[0].payload, original);
        assert_eq!(batch[0].source, "blockchain");
    }

    #[tokio::test]
    async fn stats_reflect_the_stream() {
        let log = memory_log("context-stream").await;
        assert_eq!(
            log.stats().await.unwrap(),
            LogStats {
                length: 0,
                first_id: None,
                last_id: None
            }
        );
        for _ in 0..3 {
            log.append("test", "X", &Map::new()).await.unwrap();
        }
        assert_eq!(
            log.stats().await.unwrap(),
            LogStats {
                length: 3,
                first_id: Some(1),
                last_id: Some(3)
            }
        );
    }
}
