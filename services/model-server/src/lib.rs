//! runmodel: serve model archives over HTTP through per-model pools of
//! worker threads or worker processes.

use std::sync::Arc;

use anyhow::{bail, Result};
use runmodel_core::{init_tracing, shutdown_signal, HealthState, LoggingConfig};
use tracing::{error, info};

pub mod archive;
pub mod cli;
pub mod error;
pub mod executor;
pub mod ipc;
pub mod metrics;
pub mod prediction;
pub mod predictor;
pub mod registry;
pub mod router;
pub mod server;
pub mod worker;

pub use archive::{Archive, LoadOptions, PredictorCatalog, PredictorFactory};
pub use error::{Error, ExecutionError, Result as ServerResult};
pub use executor::{Executor, WorkerType};
pub use prediction::{Prediction, PredictionOutput};
pub use predictor::{JsonObject, PredictError, Predictor};
pub use registry::{ModelConfig, ModelRegistry};

pub const NO_MODEL_MESSAGE: &str = "No model loaded, exiting ...";

pub fn logging_config(args: &cli::ServerArgs) -> Result<LoggingConfig> {
    match &args.logging_config {
        Some(path) => LoggingConfig::from_file(path),
        None => Ok(LoggingConfig::with_level(&args.logging_level)),
    }
}

/// Loads every configured model, serves until a shutdown signal, then
/// releases the pools.
pub async fn run(cli: cli::Cli, catalog: PredictorCatalog) -> Result<()> {
    init_tracing("runmodel", &logging_config(&cli.server)?)?;

    let config = cli::ServerConfig::load(cli.server.config.as_deref())?.merge_cli(&cli);
    if config.models.is_empty() {
        bail!(NO_MODEL_MESSAGE);
    }

    let mut registry = ModelRegistry::new(catalog)
        .with_worker_logging(cli.server.logging_config.clone(), &cli.server.logging_level);
    for model in config.models.iter().cloned() {
        if let Err(e) = registry.register(model).await {
            error!(error = %e, "model registration failed");
            registry.shutdown().await;
            return Err(e.into());
        }
    }
    let models = Arc::new(registry);

    let health = HealthState::new();
    let app = router::app(models.clone(), health.clone(), prometheus::Registry::new())?;
    let target = config.bind_target();
    health.mark_ready();
    info!(%target, models = ?models.names(), "runmodel serving");

    let served = server::serve(app, &target, shutdown_signal()).await;
    health.clear_ready();
    models.shutdown().await;
    info!("runmodel stopped");
    served
}
