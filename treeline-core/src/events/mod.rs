//! Event data model shared by the log, the dispatcher, and branch workers.
//!
//! Events are immutable once appended; their payloads are opaque JSON
//! mappings that the core carries through routing without interpretation,
//! except for the fields needed for correlation.

pub mod types;

pub use types::{Branch, Event, EventId, EventKind, ResultStatus, TaskMessage};
