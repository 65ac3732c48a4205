use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Immutable description of one function call.
///
/// Created by the ingress handler, owned by whichever dispatcher currently
/// processes it and discarded after the terminal outcome. The body travels
/// base64-encoded inside the JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub user_id: String,
    pub request_id: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    pub method: String,
    pub path: String,
    #[serde(default)]
    pub query: String,
    pub function_id: String,
    pub function_name: String,
    #[serde(default)]
    pub callback_url: Option<String>,
    pub queued_at: DateTime<Utc>,
}

impl InvocationRequest {
    /// Returns the name of the first required field that is empty, if any.
    ///
    /// Messages failing this precondition are dropped without retry.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.user_id.trim().is_empty() {
            Some("user_id")
        } else if self.request_id.trim().is_empty() {
            Some("request_id")
        } else if self.function_id.trim().is_empty() {
            Some("function_id")
        } else if self.function_name.trim().is_empty() {
            Some("function_name")
        } else {
            None
        }
    }

    /// Path plus query string, as sent to the backend.
    pub fn path_with_query(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }
}

/// Envelope published on the invocations topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedInvocation {
    pub payload: InvocationRequest,
}

impl QueuedInvocation {
    pub fn new(payload: InvocationRequest) -> Self {
        Self { payload }
    }

    pub fn into_inner(self) -> InvocationRequest {
        self.payload
    }
}

/// Serde shim encoding byte bodies as base64 strings inside JSON.
pub(crate) mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
