use async_trait::async_trait;
use quiver_core::cluster::{ClusterResolver, ScaleDecision, ScaleGate};
use quiver_core::errors::{QuiverError, Result};
use serde::Deserialize;
use url::Url;

/// Typed HTTP client for the platform controller, the external collaborator
/// owning cluster state.
///
/// Exposes the two operations the core needs: resolving a live instance
/// address and gating on scale-from-zero.
#[derive(Clone)]
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: Url,
}

impl ControllerClient {
    /// Creates a new client bound to the provided base URL.
    pub fn new(base_url: &str) -> Result<Self> {
        let mut url = Url::parse(base_url)
            .map_err(|err| QuiverError::ConfigError(format!("invalid controller url: {err}")))?;

        if !url.path().ends_with('/') {
            let mut path = url.path().trim_end_matches('/').to_string();
            path.push('/');
            url.set_path(&path);
        }

        Ok(Self {
            http: reqwest::Client::new(),
            base_url: url,
        })
    }

    fn endpoint(&self, function_id: &str, tail: &str) -> Result<Url> {
        self.base_url
            .join(&format!(
                "v1/functions/{}/{tail}",
                encode_path_segment(function_id)
            ))
            .map_err(|err| QuiverError::ConfigError(format!("invalid controller path: {err}")))
    }
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
}

#[derive(Debug, Deserialize)]
struct ScaleResponse {
    found: bool,
    available: bool,
    #[serde(default)]
    waited_ms: u64,
}

#[async_trait]
impl ClusterResolver for ControllerClient {
    async fn resolve(&self, function_id: &str) -> Result<String> {
        let url = self.endpoint(function_id, "address")?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| QuiverError::ResolutionError(err.to_string()))?;

        if !response.status().is_success() {
            return Err(QuiverError::ResolutionError(format!(
                "controller answered {} for function {function_id}",
                response.status()
            )));
        }

        let payload: AddressResponse = response
            .json()
            .await
            .map_err(|err| QuiverError::ResolutionError(err.to_string()))?;

        Ok(payload.address)
    }
}

#[async_trait]
impl ScaleGate for ControllerClient {
    async fn ensure_available(&self, function_id: &str) -> Result<ScaleDecision> {
        let url = self.endpoint(function_id, "scale-up")?;
        let response = self
            .http
            .post(url)
            .send()
            .await
            .map_err(|err| QuiverError::ScaleError(err.to_string()))?;

        if !response.status().is_success() {
            return Err(QuiverError::ScaleError(format!(
                "controller answered {} for function {function_id}",
                response.status()
            )));
        }

        let payload: ScaleResponse = response
            .json()
            .await
            .map_err(|err| QuiverError::ScaleError(err.to_string()))?;

        Ok(ScaleDecision {
            found: payload.found,
            available: payload.available,
            waited: std::time::Duration::from_millis(payload.waited_ms),
        })
    }
}

fn encode_path_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
