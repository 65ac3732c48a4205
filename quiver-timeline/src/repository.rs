use chrono::{DateTime, Duration, Utc};
use quiver_core::config::CoreConfig;
use quiver_core::db::DatabasePool;
use quiver_core::errors::{QuiverError, Result};
use quiver_protocol::{EventLog, TimelineLog};
use serde::Serialize;
use serde_json::Value;
use sqlx::{FromRow, Postgres, QueryBuilder};

/// Timeline milestone as it comes out of storage.
///
/// Ordering key is `timestamp`, tie-broken by the insertion-ordered `id`.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TimelineEventRow {
    pub id: i64,
    pub request_id: String,
    pub user_id: String,
    pub function_id: String,
    pub event_name: String,
    pub event_type: String,
    pub response: i32,
    pub method: String,
    pub duration: i64,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Generic log record as it comes out of storage.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct EventLogRow {
    pub id: i64,
    pub request_id: String,
    pub user_id: String,
    pub log_type: String,
    pub is_error: bool,
    pub function_name: String,
    pub function_id: String,
    pub message: String,
    pub payload: Option<Value>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Insert shape for one timeline milestone.
#[derive(Debug, Clone)]
pub struct NewTimelineEvent {
    pub request_id: String,
    pub user_id: String,
    pub function_id: String,
    pub event_name: String,
    pub event_type: String,
    pub response: i32,
    pub method: String,
    pub duration: i64,
    pub timestamp: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewTimelineEvent {
    /// Builds the row for one `timeline_log` branch, stamping the expiry
    /// from the event timestamp plus the configured retention.
    pub fn from_wire(
        user_id: &str,
        request_id: &str,
        log: TimelineLog,
        retention: Duration,
    ) -> Self {
        Self {
            request_id: request_id.to_string(),
            user_id: user_id.to_string(),
            function_id: log.function_id,
            event_name: log.event_name,
            event_type: log.event_type,
            response: log.response,
            method: log.method,
            duration: log.duration,
            timestamp: log.created_at,
            expires_at: log.created_at + retention,
        }
    }
}

/// Insert shape for one generic log record.
#[derive(Debug, Clone)]
pub struct NewEventLog {
    pub request_id: String,
    pub user_id: String,
    pub log_type: String,
    pub is_error: bool,
    pub function_name: String,
    pub function_id: String,
    pub message: String,
    pub payload: Option<Value>,
    pub generated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl NewEventLog {
    pub fn from_wire(user_id: &str, request_id: &str, log: EventLog, retention: Duration) -> Self {
        Self {
            request_id: request_id.to_string(),
            user_id: user_id.to_string(),
            log_type: log.log_type,
            is_error: log.is_error,
            function_name: log.function_name,
            function_id: log.function_id,
            message: log.message,
            payload: match log.payload {
                Value::Null => None,
                other => Some(other),
            },
            generated_at: log.generated_at,
            expires_at: log.generated_at + retention,
        }
    }
}

/// Database-backed repository for timeline events and log records.
#[derive(Clone)]
pub struct TimelineRepository {
    pool: DatabasePool,
}

impl TimelineRepository {
    /// Connects using the supplied configuration and ensures migrations ran.
    pub async fn from_config(config: &CoreConfig) -> Result<Self> {
        let pool = DatabasePool::connect(config).await?;
        Self::from_pool(pool).await
    }

    /// Builds the repository from an existing database pool.
    pub async fn from_pool(pool: DatabasePool) -> Result<Self> {
        sqlx::migrate!("./migrations")
            .run(pool.inner())
            .await
            .map_err(|err| QuiverError::DatabaseError(err.to_string()))?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &DatabasePool {
        &self.pool
    }

    /// Persists one flush of the ingestion pipeline: a single bulk insert
    /// per event type, inside one transaction. A partial failure aborts the
    /// whole flush.
    pub async fn store_batch(
        &self,
        events: &[NewTimelineEvent],
        logs: &[NewEventLog],
    ) -> Result<()> {
        if events.is_empty() && logs.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.inner().begin().await?;

        if !events.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO timeline_events (request_id, user_id, function_id, event_name, \
                 event_type, response, method, duration, timestamp, expires_at) ",
            );
            builder.push_values(events, |mut b, row| {
                b.push_bind(&row.request_id)
                    .push_bind(&row.user_id)
                    .push_bind(&row.function_id)
                    .push_bind(&row.event_name)
                    .push_bind(&row.event_type)
                    .push_bind(row.response)
                    .push_bind(&row.method)
                    .push_bind(row.duration)
                    .push_bind(row.timestamp)
                    .push_bind(row.expires_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        if !logs.is_empty() {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO event_logs (request_id, user_id, log_type, is_error, \
                 function_name, function_id, message, payload, generated_at, expires_at) ",
            );
            builder.push_values(logs, |mut b, row| {
                b.push_bind(&row.request_id)
                    .push_bind(&row.user_id)
                    .push_bind(&row.log_type)
                    .push_bind(row.is_error)
                    .push_bind(&row.function_name)
                    .push_bind(&row.function_id)
                    .push_bind(&row.message)
                    .push_bind(&row.payload)
                    .push_bind(row.generated_at)
                    .push_bind(row.expires_at);
            });
            builder.build().execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// All live timeline rows for one request, in reconstruction order.
    ///
    /// Scoped by user id as well: rows of other users never leak into a
    /// reconstructed timeline.
    pub async fn request_events(
        &self,
        user_id: &str,
        request_id: &str,
    ) -> Result<Vec<TimelineEventRow>> {
        let rows = sqlx::query_as::<_, TimelineEventRow>(
            r#"
            SELECT id, request_id, user_id, function_id, event_name, event_type,
                   response, method, duration, timestamp, expires_at
            FROM timeline_events
            WHERE request_id = $1 AND user_id = $2 AND expires_at > NOW()
            ORDER BY timestamp, id
            "#,
        )
        .bind(request_id)
        .bind(user_id)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(rows)
    }

    /// All live log records for one request, oldest first.
    pub async fn request_logs(&self, user_id: &str, request_id: &str) -> Result<Vec<EventLogRow>> {
        let rows = sqlx::query_as::<_, EventLogRow>(
            r#"
            SELECT id, request_id, user_id, log_type, is_error, function_name,
                   function_id, message, payload, generated_at, expires_at
            FROM event_logs
            WHERE request_id = $1 AND user_id = $2 AND expires_at > NOW()
            ORDER BY generated_at, id
            "#,
        )
        .bind(request_id)
        .bind(user_id)
        .fetch_all(self.pool.inner())
        .await?;

        Ok(rows)
    }

    /// Deletes rows past their expiry. Returns how many were removed.
    pub async fn delete_expired(&self) -> Result<u64> {
        let events = sqlx::query("DELETE FROM timeline_events WHERE expires_at <= NOW()")
            .execute(self.pool.inner())
            .await?;
        let logs = sqlx::query("DELETE FROM event_logs WHERE expires_at <= NOW()")
            .execute(self.pool.inner())
            .await?;

        Ok(events.rows_affected() + logs.rows_affected())
    }
}
