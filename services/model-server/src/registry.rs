//! Named worker pools, built once at startup and shared read-only with the
//! router.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::archive::{Device, LoadError, LoadOptions, PredictorCatalog};
use crate::error::{Error, ExecutionError, Result};
use crate::executor::{default_max_workers, Executor, ProcessPool, ThreadPool, WorkerCommand, WorkerType};
use crate::prediction::{Prediction, PredictionOutput};
use crate::worker::WorkerArgs;

/// Name of the hidden subcommand worker processes run.
pub const WORKER_SUBCOMMAND: &str = "__worker";

/// How to load and run one model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub name: String,
    pub archive: PathBuf,
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub worker_type: WorkerType,
    #[serde(default = "cpu_selector")]
    pub cuda_device: i32,
    #[serde(default)]
    pub predictor_name: Option<String>,
    #[serde(default)]
    pub num_threads: Option<usize>,
}

fn cpu_selector() -> i32 { -1 }

impl ModelConfig {
    pub fn new(name: impl Into<String>, archive: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            archive: archive.into(),
            max_workers: None,
            worker_type: WorkerType::default(),
            cuda_device: -1,
            predictor_name: None,
            num_threads: None,
        }
    }

    pub fn worker_type(mut self, worker_type: WorkerType) -> Self {
        self.worker_type = worker_type;
        self
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers.unwrap_or_else(|| default_max_workers(self.num_threads))
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            device: Device::from_selector(self.cuda_device),
            num_threads: self.num_threads,
            predictor_name: self.predictor_name.clone(),
        }
    }
}

/// A registered model: its name and the executor that runs it.
pub struct ModelPool {
    name: String,
    archive: Option<PathBuf>,
    executor: Arc<dyn Executor>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelStatus {
    pub name: String,
    pub archive: Option<PathBuf>,
    pub worker_type: WorkerType,
    pub workers: usize,
}

impl ModelPool {
    pub fn name(&self) -> &str { &self.name }

    pub async fn submit(&self, work: Prediction) -> std::result::Result<PredictionOutput, ExecutionError> {
        self.executor.submit(work).await
    }

    pub fn describe(&self) -> ModelStatus {
        ModelStatus {
            name: self.name.clone(),
            archive: self.archive.clone(),
            worker_type: self.executor.worker_type(),
            workers: self.executor.workers(),
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerLogging {
    config: Option<PathBuf>,
    level: String,
}

pub struct ModelRegistry {
    catalog: PredictorCatalog,
    worker_program: Option<PathBuf>,
    worker_logging: WorkerLogging,
    pools: HashMap<String, Arc<ModelPool>>,
}

impl ModelRegistry {
    pub fn new(catalog: PredictorCatalog) -> Self {
        Self {
            catalog,
            worker_program: None,
            worker_logging: WorkerLogging { config: None, level: "info".into() },
            pools: HashMap::new(),
        }
    }

    /// Binary that process workers launch; the current executable by default.
    pub fn with_worker_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.worker_program = Some(program.into());
        self
    }

    /// Logging options handed down to worker processes.
    pub fn with_worker_logging(mut self, config: Option<PathBuf>, level: &str) -> Self {
        self.worker_logging = WorkerLogging { config, level: level.to_string() };
        self
    }

    /// Loads `config.archive` into a new pool under `config.name`. The name
    /// is checked before anything is loaded.
    pub async fn register(&mut self, config: ModelConfig) -> Result<Arc<ModelPool>> {
        if self.pools.contains_key(&config.name) {
            return Err(Error::duplicate(&config.name));
        }
        let workers = config.max_workers();
        if workers == 0 {
            return Err(Error::Configuration(format!("model {:?}: max_workers must be at least 1", config.name)));
        }
        info!(
            model = %config.name,
            archive = %config.archive.display(),
            worker_type = %config.worker_type,
            workers,
            "registering model"
        );

        let executor: Arc<dyn Executor> = match config.worker_type {
            WorkerType::Thread => {
                let catalog = self.catalog.clone();
                let archive = config.archive.clone();
                let options = config.load_options();
                let predictor = tokio::task::spawn_blocking(move || catalog.load(&archive, &options))
                    .await
                    .map_err(|e| LoadError::Pool(e.to_string()))??;
                Arc::new(ThreadPool::new(&config.name, predictor, workers)?)
            }
            WorkerType::Process => {
                let command = self.worker_command(&config)?;
                Arc::new(ProcessPool::start(&config.name, command, workers).await?)
            }
        };
        self.insert(config.name, Some(config.archive), executor)
    }

    /// Registers an already built executor, e.g. one wrapping an in-process
    /// predictor.
    pub fn register_executor(&mut self, name: &str, executor: Arc<dyn Executor>) -> Result<Arc<ModelPool>> {
        if self.pools.contains_key(name) {
            return Err(Error::duplicate(name));
        }
        self.insert(name.to_string(), None, executor)
    }

    fn insert(&mut self, name: String, archive: Option<PathBuf>, executor: Arc<dyn Executor>) -> Result<Arc<ModelPool>> {
        let pool = Arc::new(ModelPool { name: name.clone(), archive, executor });
        self.pools.insert(name, pool.clone());
        Ok(pool)
    }

    fn worker_command(&self, config: &ModelConfig) -> Result<WorkerCommand> {
        let program = match &self.worker_program {
            Some(p) => p.clone(),
            None => std::env::current_exe()
                .map_err(|e| Error::Configuration(format!("cannot locate the runmodel executable: {e}")))?,
        };
        // workers may not share our working directory assumptions
        let archive = absolute(&config.archive)?;
        let mut args = WorkerArgs::new(archive);
        args.model_name = config.name.clone();
        args.cuda_device = config.cuda_device;
        args.predictor_name = config.predictor_name.clone();
        args.num_threads = config.num_threads;
        args.logging_config = match &self.worker_logging.config {
            Some(path) => Some(absolute(path)?),
            None => None,
        };
        args.logging_level = self.worker_logging.level.clone();

        let mut argv = vec![WORKER_SUBCOMMAND.to_string()];
        argv.extend(args.to_args());
        Ok(WorkerCommand { program, args: argv })
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ModelPool>> {
        self.pools.get(name).cloned().ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn statuses(&self) -> Vec<ModelStatus> {
        let mut all: Vec<ModelStatus> = self.pools.values().map(|p| p.describe()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    pub fn len(&self) -> usize { self.pools.len() }

    pub fn is_empty(&self) -> bool { self.pools.is_empty() }

    /// Shuts every pool down. Pools stay registered but reject new work.
    pub async fn shutdown(&self) {
        let pools = self.pools.values().map(|p| {
            let pool = p.clone();
            async move {
                pool.executor.shutdown().await;
                info!(model = %pool.name, "model pool released");
            }
        });
        futures::future::join_all(pools).await;
        if self.pools.is_empty() {
            warn!("registry shut down with no models");
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    std::fs::canonicalize(path).map_err(|source| Error::Load(LoadError::Io { path: path.to_path_buf(), source }))
}
