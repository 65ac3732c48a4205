use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Enumerated lifecycle milestones a request moves through.
///
/// The set is informative at ingestion time: unknown values are logged and
/// stored anyway, so `TimelineLog::event_type` stays a plain string on the
/// wire and in storage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Created,
    Queued,
    Dequeued,
    Running,
    Finished,
    Failed,
    CallbackFailed,
    SystemError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Created => "created",
            EventKind::Queued => "queued",
            EventKind::Dequeued => "dequeued",
            EventKind::Running => "running",
            EventKind::Finished => "finished",
            EventKind::Failed => "failed",
            EventKind::CallbackFailed => "callback_failed",
            EventKind::SystemError => "system_error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "created" => Some(EventKind::Created),
            "queued" => Some(EventKind::Queued),
            "dequeued" => Some(EventKind::Dequeued),
            "running" => Some(EventKind::Running),
            "finished" => Some(EventKind::Finished),
            "failed" => Some(EventKind::Failed),
            "callback_failed" => Some(EventKind::CallbackFailed),
            "system_error" => Some(EventKind::SystemError),
            _ => None,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a response code counts as an error for timeline purposes.
pub fn is_error_status(code: i32) -> bool {
    code < 200 || code >= 400
}

/// One discrete milestone in the lifecycle of a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimelineLog {
    pub function_id: String,
    pub event_name: String,
    pub event_type: String,
    #[serde(default)]
    pub response: i32,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub duration: i64,
    pub created_at: DateTime<Utc>,
}

/// Generic multi-field log record associated with a request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventLog {
    #[serde(rename = "type")]
    pub log_type: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub function_id: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payload: Value,
    pub generated_at: DateTime<Utc>,
}

/// Two-shaped message published on the events topic.
///
/// Exactly one of `timeline_log` / `event_log` is present per message; the
/// other branch serialises as `null`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub user_id: String,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub timeline_log: Option<TimelineLog>,
    #[serde(default)]
    pub event_log: Option<EventLog>,
}

impl EventMessage {
    pub fn timeline(
        user_id: impl Into<String>,
        request_id: impl Into<String>,
        log: TimelineLog,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            request_id: request_id.into(),
            timestamp: Utc::now(),
            timeline_log: Some(log),
            event_log: None,
        }
    }

    pub fn log(
        user_id: impl Into<String>,
        request_id: impl Into<String>,
        log: EventLog,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            request_id: request_id.into(),
            timestamp: Utc::now(),
            timeline_log: None,
            event_log: Some(log),
        }
    }

    /// A message must carry exactly one of the two branches.
    pub fn is_well_formed(&self) -> bool {
        self.timeline_log.is_some() != self.event_log.is_some()
    }
}
