use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::invocation::base64_bytes;

/// Header a backend sets to signal the JSON invoke envelope encoding.
pub const ENVELOPE_HEADER: &str = "x-quiver-envelope";

/// Platform-internal request id, injected on every forwarded call.
pub const REQUEST_ID_HEADER: &str = "x-quiver-request-id";

/// Callback identity headers.
pub const FUNCTION_NAME_HEADER: &str = "x-quiver-function-name";
pub const FUNCTION_ID_HEADER: &str = "x-quiver-function-id";
pub const STATUS_HEADER: &str = "x-quiver-status";

/// Authenticated user identity, stamped by the ingress layer.
pub const USER_HEADER: &str = "x-quiver-user";

/// Caller-supplied callback URL for asynchronous invocations.
pub const CALLBACK_HEADER: &str = "x-callback-url";

/// Normalised backend response.
///
/// A backend either answers with a raw HTTP response, or with this JSON
/// envelope (signalled by [`ENVELOPE_HEADER`]) which additionally surfaces
/// captured process output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeEnvelope {
    pub status: u16,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, with = "base64_bytes")]
    pub body: Vec<u8>,
    #[serde(default)]
    pub stdout: Option<String>,
    #[serde(default)]
    pub stderr: Option<String>,
}

impl InvokeEnvelope {
    /// Wraps a raw response so both shapes share one downstream path.
    pub fn raw(status: u16, headers: HashMap<String, String>, body: Vec<u8>) -> Self {
        Self {
            status,
            headers,
            body,
            stdout: None,
            stderr: None,
        }
    }

    pub fn has_process_output(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_decodes_with_optional_output() {
        let json = serde_json::json!({
            "status": 200,
            "headers": {"content-type": "application/json"},
            "body": "eyJvayI6dHJ1ZX0=",
            "stdout": "booted in 12ms",
        });

        let envelope: InvokeEnvelope = serde_json::from_value(json).unwrap();
        assert_eq!(envelope.status, 200);
        assert_eq!(envelope.body, br#"{"ok":true}"#);
        assert!(envelope.has_process_output());
        assert!(envelope.stderr.is_none());
    }

    #[test]
    fn raw_wrapper_carries_no_output() {
        let envelope = InvokeEnvelope::raw(503, HashMap::new(), Vec::new());
        assert!(!envelope.has_process_output());
        assert_eq!(envelope.status, 503);
    }
}
