use std::time::Duration;

use async_trait::async_trait;

use crate::errors::Result;

/// Outcome of asking the scale gate for at least one live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScaleDecision {
    /// Whether the function exists at all.
    pub found: bool,
    /// Whether an instance became available within the gate's bounded wait.
    pub available: bool,
    /// How long the gate waited before answering.
    pub waited: Duration,
}

/// Resolves a function identifier to a reachable network address for one
/// live instance.
///
/// Implementations must fail fast when no live instance exists — the
/// dispatcher's own retry loop owns retrying resolution.
#[async_trait]
pub trait ClusterResolver: Send + Sync + 'static {
    async fn resolve(&self, function_id: &str) -> Result<String>;
}

/// Ensures at least one instance of a function exists, waiting up to a
/// bounded duration for scale-from-zero to complete.
#[async_trait]
pub trait ScaleGate: Send + Sync + 'static {
    async fn ensure_available(&self, function_id: &str) -> Result<ScaleDecision>;
}
