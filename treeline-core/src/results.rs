//! Result sink: completion records from branch workers flow back onto the
//! event log for audit and downstream correlation.

use crate::events::{Branch, EventId, EventKind, ResultStatus};
use crate::log::{EventLog, LogError};
use serde_json::{Map, Value};

/// Accepts result records and appends them as `Result` events.
///
/// Results follow all event invariants; the core stores `status` without
/// interpreting it.
#[derive(Clone)]
pub struct ResultSink {
    log: EventLog,
}

impl ResultSink {
    pub fn new(log: EventLog) -> Self {
        Self { log }
    }

    /// Append one result record and return its event id.
    pub async fn submit_result(
        &self,
        branch: Branch,
        correlation_id: &str,
        status: ResultStatus,
        payload: Map<String, Value>,
    ) -> Result<EventId, LogError> {
        let mut record = Map::new();
        record.insert(
            "correlation_id".to_string(),
            Value::String(correlation_id.to_string()),
        );
        record.insert(
            "status".to_string(),
            Value::String(status.as_str().to_string()),
        );
        record.insert("result".to_string(), Value::Object(payload));

        let id = self
            .log
            .append(branch.as_str(), EventKind::Result.as_str(), &record)
            .await?;
        tracing::debug!(id, branch = %branch, correlation_id, status = %status, "result recorded");
        Ok(id)
    }
}
