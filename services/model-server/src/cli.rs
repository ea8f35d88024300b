//! Command line and server configuration.
//!
//! Precedence, lowest first: built-in defaults, the `--config` file (or
//! `RUNMODEL_CONFIG_FILE`), `RUNMODEL__*` environment variables, then flags.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde::Deserialize;

use crate::executor::WorkerType;
use crate::registry::ModelConfig;
use crate::server::BindTarget;
use crate::worker::WorkerArgs;

pub const ENV_PREFIX: &str = "RUNMODEL";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 8000;

#[derive(Debug, Parser)]
#[command(name = "runmodel", version, about = "Serve model archives over HTTP", args_conflicts_with_subcommands = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Command>,

    #[command(flatten)]
    pub server: ServerArgs,

    #[command(flatten)]
    pub model: ModelArgs,

    /// Model archive to serve
    pub archive: Option<PathBuf>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    #[command(name = "__worker", hide = true)]
    Worker(WorkerArgs),
}

#[derive(Debug, Clone, Args)]
#[command(next_help_heading = "Server")]
pub struct ServerArgs {
    /// Host to bind
    #[arg(short = 'H', long)]
    pub host: Option<String>,

    /// Port to bind
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Unix socket path; takes precedence over host and port
    #[arg(short = 'a', long)]
    pub path: Option<PathBuf>,

    /// Logging config file
    #[arg(short = 'l', long)]
    pub logging_config: Option<PathBuf>,

    /// Logging level, used when no logging config is given
    #[arg(short = 'v', long, default_value = "info", value_parser = parse_level)]
    pub logging_level: String,

    /// Server config file declaring further models
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
#[command(next_help_heading = "Model")]
pub struct ModelArgs {
    /// Name the model is served under
    #[arg(short = 'm', long, default_value = "")]
    pub model_name: String,

    /// Threads per worker
    #[arg(short = 't', long)]
    pub num_threads: Option<usize>,

    /// Worker count; defaults to ceil(cpus / num_threads)
    #[arg(short = 'w', long)]
    pub max_workers: Option<usize>,

    #[arg(short = 'k', long, default_value = "process", value_parser = parse_worker_type)]
    pub worker_type: WorkerType,

    /// CUDA device, negative for CPU
    #[arg(short = 'd', long, default_value_t = -1, allow_negative_numbers = true)]
    pub cuda_device: i32,

    /// Predictor to use instead of the archive's default
    #[arg(short = 'e', long)]
    pub predictor_name: Option<String>,
}

impl ModelArgs {
    fn into_config(self, archive: PathBuf) -> ModelConfig {
        let mut cfg = ModelConfig::new(self.model_name, archive);
        cfg.max_workers = self.max_workers;
        cfg.worker_type = self.worker_type;
        cfg.cuda_device = self.cuda_device;
        cfg.predictor_name = self.predictor_name;
        cfg.num_threads = self.num_threads;
        cfg
    }
}

fn parse_worker_type(s: &str) -> Result<WorkerType, String> { s.parse() }

/// Accepts the usual level names plus `warning`, `critical` and `fatal`.
fn parse_level(s: &str) -> Result<String, String> {
    let level = s.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" | "off" => Ok(level),
        "warning" => Ok("warn".into()),
        "critical" | "fatal" => Ok("error".into()),
        other => Err(format!("unknown logging level {other:?}")),
    }
}

/// Everything the server needs, after layering.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<PathBuf>,
    pub models: Vec<ModelConfig>,
}

impl ServerConfig {
    pub fn load(file: Option<&Path>) -> Result<Self> { runmodel_core::load_config(ENV_PREFIX, file) }

    /// Applies flags on top; the archive given on the command line goes first.
    pub fn merge_cli(mut self, cli: &Cli) -> Self {
        if let Some(host) = &cli.server.host {
            self.host = Some(host.clone());
        }
        if cli.server.port.is_some() {
            self.port = cli.server.port;
        }
        if let Some(path) = &cli.server.path {
            self.path = Some(path.clone());
        }
        if let Some(archive) = &cli.archive {
            self.models.insert(0, cli.model.clone().into_config(archive.clone()));
        }
        self
    }

    pub fn bind_target(&self) -> BindTarget {
        match &self.path {
            Some(path) => BindTarget::Unix(path.clone()),
            None => BindTarget::Tcp {
                host: self.host.clone().unwrap_or_else(|| DEFAULT_HOST.to_string()),
                port: self.port.unwrap_or(DEFAULT_PORT),
            },
        }
    }
}
