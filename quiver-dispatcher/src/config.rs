use std::env;
use std::time::Duration;

use quiver_core::errors::ConfigError;

/// Configuration of the asynchronous dispatcher, loaded from the process
/// environment.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub queue_url: String,
    pub controller_url: String,
    pub workers: usize,
    pub max_attempts: u32,
    /// Linear backoff step: attempt k (k > 1) waits `(k-1) × step`.
    /// Sized for scale-from-zero cold starts, not network jitter.
    pub backoff_step: Duration,
    pub intake_capacity: usize,
    pub consumer_group: String,
    pub invocations_topic: String,
    pub events_topic: String,
    pub request_timeout: Duration,
    pub node_name: String,
    pub http_bind: String,
}

impl DispatcherConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let queue_url =
            env::var("QUEUE_URL").map_err(|_| ConfigError::MissingEnvVar("QUEUE_URL".into()))?;
        let controller_url = env::var("CONTROLLER_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CONTROLLER_URL".into()))?;

        let workers = read_number("DISPATCHER_WORKERS", 4)?;
        let max_attempts = read_number("DISPATCHER_MAX_ATTEMPTS", 3)?;
        let backoff_step =
            Duration::from_secs(read_number("DISPATCHER_BACKOFF_SECONDS", 180)?);
        let intake_capacity = read_number("DISPATCHER_INTAKE_CAPACITY", 64)?;
        let request_timeout =
            Duration::from_secs(read_number("DISPATCHER_REQUEST_TIMEOUT_SECONDS", 120)?);

        let consumer_group = env::var("DISPATCHER_CONSUMER_GROUP")
            .unwrap_or_else(|_| "dispatch-workers".to_string());
        let invocations_topic = env::var("QUIVER_INVOCATIONS_TOPIC")
            .unwrap_or_else(|_| quiver_protocol::INVOCATIONS_TOPIC.to_string());
        let events_topic = env::var("QUIVER_EVENTS_TOPIC")
            .unwrap_or_else(|_| quiver_protocol::EVENTS_TOPIC.to_string());
        let node_name =
            env::var("QUIVER_NODE_NAME").unwrap_or_else(|_| "quiver-dispatcher".to_string());
        let http_bind =
            env::var("DISPATCHER_HTTP_BIND").unwrap_or_else(|_| "0.0.0.0:8090".to_string());

        Ok(Self {
            queue_url,
            controller_url,
            workers,
            max_attempts,
            backoff_step,
            intake_capacity,
            consumer_group,
            invocations_topic,
            events_topic,
            request_timeout,
            node_name,
            http_bind,
        })
    }
}

fn read_number<T>(key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr + Copy,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidEnvVar {
            key,
            message: format!("{raw:?} is not a valid number"),
        }),
        Err(_) => Ok(default),
    }
}
