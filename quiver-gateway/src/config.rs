use std::env;

use quiver_core::errors::ConfigError;

/// Global configuration of the gateway, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub bind_address: String,
    pub controller_url: String,
    pub queue_url: String,
    pub invocations_topic: String,
    pub events_topic: String,
    pub node_name: String,
}

impl GatewayConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_address = env::var("GATEWAY_BIND").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

        let controller_url = env::var("CONTROLLER_URL")
            .map_err(|_| ConfigError::MissingEnvVar("CONTROLLER_URL".to_string()))?;
        let queue_url = env::var("QUEUE_URL")
            .map_err(|_| ConfigError::MissingEnvVar("QUEUE_URL".to_string()))?;

        let invocations_topic = env::var("QUIVER_INVOCATIONS_TOPIC")
            .unwrap_or_else(|_| quiver_protocol::INVOCATIONS_TOPIC.to_string());
        let events_topic = env::var("QUIVER_EVENTS_TOPIC")
            .unwrap_or_else(|_| quiver_protocol::EVENTS_TOPIC.to_string());
        let node_name =
            env::var("QUIVER_NODE_NAME").unwrap_or_else(|_| "quiver-gateway".to_string());

        Ok(Self {
            bind_address,
            controller_url,
            queue_url,
            invocations_topic,
            events_topic,
            node_name,
        })
    }

    pub fn bind_address(&self) -> &str {
        &self.bind_address
    }
}
