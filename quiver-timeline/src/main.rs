use quiver_core::config::CoreConfig;
use quiver_core::errors::QuiverError;
use quiver_core::logging;

#[tokio::main]
async fn main() -> Result<(), QuiverError> {
    if let Err(err) = logging::init_tracing(None) {
        eprintln!("failed to initialise tracing: {err}");
    }

    let config = load_timeline_config()?;
    quiver_timeline::run(config).await
}

fn load_timeline_config() -> Result<CoreConfig, QuiverError> {
    CoreConfig::from_env_with_prefix("TIMELINE_")
        .or_else(|_| CoreConfig::from_env())
        .map_err(Into::into)
}
