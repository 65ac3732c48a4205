use async_trait::async_trait;
use quiver_core::cluster::ClusterResolver;
use quiver_core::errors::{QuiverError, Result};
use serde::Deserialize;
use url::Url;

/// Typed HTTP client resolving function addresses via the platform
/// controller.
///
/// Fails fast: a function with no live instance is an error here, and the
/// synchronous path never retries it.
#[derive(Clone)]
pub struct ControllerResolver {
    http: reqwest::Client,
    base_url: Url,
}

impl ControllerResolver {
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
}

#[derive(Debug, Deserialize)]
struct AddressResponse {
    address: String,
}

#[async_trait]
impl ClusterResolver for ControllerResolver {
    async fn resolve(&self, function_id: &str) -> Result<String> {
        let url = self
            .base_url
            .join(&format!(
                "v1/functions/{}/address",
                encode_path_segment(function_id)
            ))
            .map_err(|err| QuiverError::ConfigError(format!("invalid controller path: {err}")))?;

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

fn encode_path_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
