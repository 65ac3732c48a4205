use std::env;

use crate::errors::{ConfigError, QuiverError};

/// Runtime environment used by the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Staging,
    Production,
}

impl Environment {
    fn from_str(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            _ => Environment::Development,
        }
    }
}

/// Global configuration shared across the services.
#[derive(Debug, Clone)]
pub struct CoreConfig {
    pub database_url: String,
    pub queue_url: String,
    pub environment: Environment,
    pub node_name: String,
    pub http_bind: Option<String>,
    pub retention_hours: i64,
    pub invocations_topic: String,
    pub events_topic: String,
}

impl CoreConfig {
    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let database_url = env::var("DATABASE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("DATABASE_URL".into()))?;
        let queue_url =
            env::var("QUEUE_URL").map_err(|_| ConfigError::MissingEnvVar("QUEUE_URL".into()))?;

        let environment = env::var("QUIVER_ENV")
            .map(|raw| Environment::from_str(&raw))
            .unwrap_or_default();

        let node_name = env::var("QUIVER_NODE_NAME").unwrap_or_else(|_| "quiver-node".to_string());
        let http_bind = env::var("QUIVER_HTTP_BIND").ok();
        let retention_hours = read_retention("QUIVER_RETENTION_HOURS")?;

        Ok(Self {
            database_url,
            queue_url,
            environment,
            node_name,
            http_bind,
            retention_hours,
            invocations_topic: read_topic("QUIVER_INVOCATIONS_TOPIC", quiver_protocol::INVOCATIONS_TOPIC),
            events_topic: read_topic("QUIVER_EVENTS_TOPIC", quiver_protocol::EVENTS_TOPIC),
        })
    }

    /// Loads configuration from env vars prefixed with the provided value
    /// (e.g. `TIMELINE_`).
    pub fn from_env_with_prefix(prefix: &str) -> Result<Self, ConfigError> {
        let key = |suffix: &str| format!("{}{}", prefix, suffix);

        let db_key = key("DATABASE_URL");
        let database_url =
            env::var(&db_key).map_err(|_| ConfigError::MissingEnvVar(db_key.clone()))?;

        let queue_key = key("QUEUE_URL");
        let queue_url =
            env::var(&queue_key).map_err(|_| ConfigError::MissingEnvVar(queue_key.clone()))?;

        let environment = env::var(key("ENV"))
            .map(|raw| Environment::from_str(&raw))
            .unwrap_or_default();

        let node_name = env::var(key("NODE_NAME")).unwrap_or_else(|_| "quiver-node".to_string());
        let http_bind = env::var(key("HTTP_BIND")).ok();
        let retention_key = key("RETENTION_HOURS");
        let retention_hours = match env::var(&retention_key) {
            Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidEnvVar {
                key: "RETENTION_HOURS",
                message: format!("{raw:?} is not a number of hours"),
            })?,
            Err(_) => DEFAULT_RETENTION_HOURS,
        };

        Ok(Self {
            database_url,
            queue_url,
            environment,
            node_name,
            http_bind,
            retention_hours,
            invocations_topic: env::var(key("INVOCATIONS_TOPIC"))
                .unwrap_or_else(|_| quiver_protocol::INVOCATIONS_TOPIC.to_string()),
            events_topic: env::var(key("EVENTS_TOPIC"))
                .unwrap_or_else(|_| quiver_protocol::EVENTS_TOPIC.to_string()),
        })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn queue_url(&self) -> &str {
        &self.queue_url
    }

    /// Whether the service is running in production.
    pub fn is_production(&self) -> bool {
        matches!(self.environment, Environment::Production)
    }

    /// Retention window applied to every persisted event row.
    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours)
    }
}

const DEFAULT_RETENTION_HOURS: i64 = 72;

fn read_retention(key: &'static str) -> Result<i64, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|_| ConfigError::InvalidEnvVar {
            key,
            message: format!("{raw:?} is not a number of hours"),
        }),
        Err(_) => Ok(DEFAULT_RETENTION_HOURS),
    }
}

fn read_topic(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper that loads config and converts to the canonical Quiver error type.
pub fn load_core_config() -> Result<CoreConfig, QuiverError> {
    Ok(CoreConfig::from_env()?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_defaults_from_prefix() {
        std::env::set_var("CFGTEST_DATABASE_URL", "postgres://example");
        std::env::set_var("CFGTEST_QUEUE_URL", "redis://example");
        std::env::remove_var("CFGTEST_ENV");
        std::env::remove_var("CFGTEST_RETENTION_HOURS");

        let cfg = CoreConfig::from_env_with_prefix("CFGTEST_").expect("config should load");
        assert_eq!(cfg.environment, Environment::Development);
        assert_eq!(cfg.retention_hours, DEFAULT_RETENTION_HOURS);
        assert_eq!(cfg.events_topic, quiver_protocol::EVENTS_TOPIC);
        assert!(!cfg.is_production());
    }

    #[test]
    fn missing_queue_url_is_reported() {
        std::env::set_var("CFGMISS_DATABASE_URL", "postgres://example");
        std::env::remove_var("CFGMISS_QUEUE_URL");

        let err = CoreConfig::from_env_with_prefix("CFGMISS_").unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "CFGMISS_QUEUE_URL"));
    }
}
