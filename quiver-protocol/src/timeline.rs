use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One named milestone in a reconstructed timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineStep {
    pub name: String,
    pub response: i32,
    pub duration_ms: i64,
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

/// Reconstructed, request-scoped view of one invocation.
///
/// Never persisted: a pure function of the stored timeline rows for one
/// request id. `duration_ms` is the elapsed time since the most recent
/// recorded milestone, so it approximates zero for a completed request and
/// grows continuously for an in-flight one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub request_id: String,
    pub function_id: String,
    pub events: Vec<TimelineStep>,
    pub duration_ms: i64,
}
