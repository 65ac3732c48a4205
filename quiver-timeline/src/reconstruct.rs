use chrono::{DateTime, Utc};
use quiver_protocol::{is_error_status, EventKind, Timeline, TimelineStep};
use tracing::warn;

use crate::repository::TimelineEventRow;

/// Name of the synthetic event covering the time a request spent queued.
pub const DWELL_TIME_EVENT: &str = "Dwell Time";

/// Reassembles the flat event rows of one request into a single ordered
/// narrative.
///
/// `rows` must be ordered by `(timestamp, id)`. Returns `None` when no rows
/// exist. The result is a pure function of `rows` and `now`: reconstructing
/// twice from the same stored rows yields the same timeline, except for the
/// `now`-relative durations of in-flight requests.
pub fn reconstruct(rows: &[TimelineEventRow], now: DateTime<Utc>) -> Option<Timeline> {
    let first = rows.first()?;
    let last = rows.last()?;

    let mut events = vec![TimelineStep {
        name: first.event_name.clone(),
        response: first.response,
        duration_ms: (last.timestamp - first.timestamp).num_milliseconds(),
        is_error: is_error_status(first.response),
        timestamp: first.timestamp,
    }];

    // Asynchronous requests open with a queued row; everything after the
    // queued/dequeued pair belongs to attempt groups.
    let mut remainder = &rows[1..];
    let mut dequeue_completed_at = first.timestamp;

    if EventKind::parse(&first.event_type) == Some(EventKind::Queued) {
        let dequeued = rows
            .get(1)
            .filter(|row| EventKind::parse(&row.event_type) == Some(EventKind::Dequeued));

        match dequeued {
            Some(row) => {
                events.push(TimelineStep {
                    name: DWELL_TIME_EVENT.to_string(),
                    response: row.response,
                    duration_ms: row.duration,
                    is_error: is_error_status(row.response),
                    timestamp: first.timestamp,
                });
                dequeue_completed_at = row.timestamp;
                remainder = &rows[2..];
            }
            None => {
                // Only the queued row exists: the request is still waiting
                // for a worker, so the dwell event stays pending.
                events.push(TimelineStep {
                    name: DWELL_TIME_EVENT.to_string(),
                    response: 0,
                    duration_ms: 0,
                    is_error: false,
                    timestamp: first.timestamp,
                });
            }
        }
    }

    for group in group_by_name(remainder) {
        events.push(assemble_group(group, dequeue_completed_at, now));
    }

    // Elapsed time since the most recent recorded milestone: approximates
    // zero for a settled request, grows continuously for an in-flight one.
    let duration_ms = (now - last.timestamp).num_milliseconds();

    Some(Timeline {
        request_id: first.request_id.clone(),
        function_id: first.function_id.clone(),
        events,
        duration_ms,
    })
}

/// Groups consecutive rows by event name, preserving first-seen order.
/// Each attempt number is its own group.
fn group_by_name(rows: &[TimelineEventRow]) -> Vec<Vec<&TimelineEventRow>> {
    let mut order: Vec<&str> = Vec::new();
    let mut groups: Vec<Vec<&TimelineEventRow>> = Vec::new();

    for row in rows {
        match order.iter().position(|name| *name == row.event_name) {
            Some(index) => groups[index].push(row),
            None => {
                order.push(&row.event_name);
                groups.push(vec![row]);
            }
        }
    }

    groups
}

fn assemble_group(
    group: Vec<&TimelineEventRow>,
    dequeue_completed_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> TimelineStep {
    match group.as_slice() {
        [row] => {
            let kind = EventKind::parse(&row.event_type);
            if matches!(kind, Some(EventKind::Failed) | Some(EventKind::CallbackFailed)) {
                TimelineStep {
                    name: row.event_name.clone(),
                    response: row.response,
                    duration_ms: row.duration,
                    is_error: is_error_status(row.response),
                    timestamp: row.timestamp,
                }
            } else {
                // Still running: synthesize an in-flight duration measured
                // from the moment the worker picked the request up.
                TimelineStep {
                    name: row.event_name.clone(),
                    response: row.response,
                    duration_ms: (now - dequeue_completed_at).num_milliseconds(),
                    is_error: false,
                    timestamp: row.timestamp,
                }
            }
        }
        [start, end] => TimelineStep {
            name: start.event_name.clone(),
            response: end.response,
            duration_ms: end.duration,
            is_error: is_error_status(end.response),
            timestamp: start.timestamp,
        },
        _ => {
            // At-least-once delivery can duplicate rows; the most recent
            // row wins.
            let start = group[0];
            let end = group[group.len() - 1];
            warn!(
                request_id = %start.request_id,
                event_name = %start.event_name,
                rows = group.len(),
                "attempt group larger than two rows, using most recent"
            );
            TimelineStep {
                name: start.event_name.clone(),
                response: end.response,
                duration_ms: end.duration,
                is_error: is_error_status(end.response),
                timestamp: start.timestamp,
            }
        }
    }
}
