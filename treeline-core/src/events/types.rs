//! Event type definitions.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

/// Log-assigned event position. Strictly increasing within a stream,
/// never reused, never decreasing.
pub type EventId = i64;

/// The logical name of an event.
///
/// Known kinds are matched exhaustively by the routing table; everything
/// else is carried through as `Unknown` and routed nowhere.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    ContributionSubmitted,
    ContributionVerified,
    RewardDistributed,
    /// A completion record appended by a branch worker via the result sink.
    Result,
    Unknown(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::ContributionSubmitted => "ContributionSubmitted",
            EventKind::ContributionVerified => "ContributionVerified",
            EventKind::RewardDistributed => "RewardDistributed",
            EventKind::Result => "Result",
            EventKind::Unknown(name) => name,
        }
    }
}

impl From<&str> for EventKind {
    fn from(name: &str) -> Self {
        match name {
            "ContributionSubmitted" => EventKind::ContributionSubmitted,
            "ContributionVerified" => EventKind::ContributionVerified,
            "RewardDistributed" => EventKind::RewardDistributed,
            "Result" => EventKind::Result,
            other => EventKind::Unknown(other.to_string()),
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A downstream task executor specialized for one business domain.
///
/// Branches own no shared state; they only receive task messages over
/// their channel and report back through the result sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Branch {
    Verification,
    Marketing,
    Governance,
    Wealth,
}

impl Branch {
    pub const ALL: [Branch; 4] = [
        Branch::Verification,
        Branch::Marketing,
        Branch::Governance,
        Branch::Wealth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Branch::Verification => "verification",
            Branch::Marketing => "marketing",
            Branch::Governance => "governance",
            Branch::Wealth => "wealth",
        }
    }

    /// Stable index into per-branch counter arrays.
    pub const fn index(self) -> usize {
        match self {
            Branch::Verification => 0,
            Branch::Marketing => 1,
            Branch::Governance => 2,
            Branch::Wealth => 3,
        }
    }
}

impl std::fmt::Display for Branch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An immutable record read back from the event log.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Log-assigned position within the stream.
    pub id: EventId,
    /// Free-form producer identifier (e.g. `blockchain`).
    pub source: String,
    pub kind: EventKind,
    /// Producer-assigned creation time. Informational only; ordering is
    /// governed by `id`.
    pub timestamp: OffsetDateTime,
    /// Opaque payload, preserved byte-for-byte through routing.
    pub payload: Map<String, Value>,
}

impl Event {
    /// External contribution identifier embedded in the payload
    /// (`args.contributionId`), when present.
    pub fn contribution_id(&self) -> Option<String> {
        let args = self.payload.get("args")?.as_object()?;
        match args.get("contributionId")? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Identifier tying downstream task messages back to this event:
    /// the external contribution id when the payload carries one,
    /// otherwise the log-assigned event id.
    pub fn correlation_id(&self) -> String {
        self.contribution_id()
            .unwrap_or_else(|| self.id.to_string())
    }
}

/// Transient hand-off message published to a branch task channel.
///
/// Task messages are not persisted by the best-effort transport; one that
/// never reaches a live subscriber is permanently lost and can only be
/// regenerated by re-running the dispatcher from an earlier cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Action name the branch must perform.
    pub task: String,
    /// Ties the message back to the originating event.
    pub correlation_id: String,
    /// The slice of the originating event payload relevant to the branch.
    pub payload: Map<String, Value>,
}

/// Outcome reported by a branch worker for a completed task.
///
/// Stored verbatim on the result record; the core never interprets it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Completed,
    Rejected,
    Failed,
}

impl ResultStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ResultStatus::Completed => "completed",
            ResultStatus::Rejected => "rejected",
            ResultStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for ResultStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event_with_args(args: Value) -> Event {
        let mut payload = Map::new();
        payload.insert("args".to_string(), args);
        Event {
            id: 7,
            source: "blockchain".to_string(),
            kind: EventKind::ContributionSubmitted,
            timestamp: OffsetDateTime::UNIX_EPOCH,
            payload,
        }
    }

    #[test]
    fn kind_round_trips_through_strings() {
        for name in [
            "ContributionSubmitted",
            "ContributionVerified",
            "RewardDistributed",
            "Result",
        ] {
            assert_eq!(EventKind::from(name).as_str(), name);
        }
        assert_eq!(
            EventKind::from("SomethingElse"),
            EventKind::Unknown("SomethingElse".to_string())
        );
    }

    #[test]
    fn correlation_prefers_contribution_id() {
        let event = event_with_args(json!({"contributionId": 42}));
        assert_eq!(event.correlation_id(), "42");

        let event = event_with_args(json!({"contributionId": "abc"}));
        assert_eq!(event.correlation_id(), "abc");
    }

    #[test]
    fn correlation_falls_back_to_event_id() {
        let event = event_with_args(json!({}));
        assert_eq!(event.correlation_id(), "7");
    }
}
