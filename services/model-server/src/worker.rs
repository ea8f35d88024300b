//! Hidden worker mode: `runmodel __worker <archive> ...`.
//!
//! A worker loads its own copy of the model, announces `ready` on stdout and
//! then answers one reply line per request line until stdin closes. stdout is
//! reserved for the codec, so logs always go to stderr.

use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use runmodel_core::{init_tracing, LoggingConfig};
use tracing::{debug, error, info};

use crate::archive::{Device, LoadOptions, PredictorCatalog};
use crate::error::ExecutionError;
use crate::ipc::{self, Reply};
use crate::prediction::Prediction;
use crate::predictor::Predictor;

#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct WorkerArgs {
    /// Model archive (manifest file)
    pub archive: PathBuf,

    #[arg(long, default_value = "")]
    pub model_name: String,

    /// Slot of this worker in its pool
    #[arg(long, default_value_t = 0)]
    pub index: usize,

    #[arg(long, default_value_t = -1, allow_negative_numbers = true)]
    pub cuda_device: i32,

    #[arg(long)]
    pub predictor_name: Option<String>,

    #[arg(long)]
    pub num_threads: Option<usize>,

    #[arg(long)]
    pub logging_config: Option<PathBuf>,

    #[arg(long, default_value = "info")]
    pub logging_level: String,
}

impl WorkerArgs {
    pub fn new(archive: PathBuf) -> Self {
        Self {
            archive,
            model_name: String::new(),
            index: 0,
            cuda_device: -1,
            predictor_name: None,
            num_threads: None,
            logging_config: None,
            logging_level: "info".into(),
        }
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions {
            device: Device::from_selector(self.cuda_device),
            num_threads: self.num_threads,
            predictor_name: self.predictor_name.clone(),
        }
    }

    /// Arguments after the subcommand name, without `--index`.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![self.archive.to_string_lossy().into_owned()];
        if !self.model_name.is_empty() {
            args.push(format!("--model-name={}", self.model_name));
        }
        args.push(format!("--cuda-device={}", self.cuda_device));
        if let Some(name) = &self.predictor_name {
            args.push(format!("--predictor-name={name}"));
        }
        if let Some(n) = self.num_threads {
            args.push(format!("--num-threads={n}"));
        }
        if let Some(path) = &self.logging_config {
            args.push(format!("--logging-config={}", path.display()));
        }
        args.push(format!("--logging-level={}", self.logging_level));
        args
    }

    fn logging(&self) -> Result<LoggingConfig> {
        let cfg = match &self.logging_config {
            Some(path) => LoggingConfig::from_file(path)?,
            None => LoggingConfig::with_level(&self.logging_level),
        };
        Ok(cfg.stderr())
    }
}

/// Entry point of a worker process. Returns an error after reporting
/// `failed` when the model cannot be loaded.
pub fn run(args: WorkerArgs, catalog: &PredictorCatalog) -> Result<()> {
    init_tracing("runmodel-worker", &args.logging()?)?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut output = stdout.lock();

    let predictor = match catalog.load(&args.archive, &args.load_options()) {
        Ok(p) => p,
        Err(e) => {
            error!(model = %args.model_name, index = args.index, error = %e, "worker failed to load model");
            ipc::write_message_blocking(&mut output, &Reply::Failed(e.to_string()))
                .context("reporting load failure")?;
            return Err(e.into());
        }
    };

    let pid = std::process::id();
    ipc::write_message_blocking(&mut output, &Reply::Ready { pid, model: args.model_name.clone() })
        .context("writing ready handshake")?;
    info!(model = %args.model_name, index = args.index, pid, "worker ready");

    let served = serve(predictor.as_ref(), stdin.lock(), &mut output)?;
    info!(model = %args.model_name, index = args.index, served, "stdin closed, worker exiting");
    Ok(())
}

/// Answers request lines until `input` ends. Returns how many were served.
/// An undecodable line is answered with `failed` and does not stop the loop.
pub fn serve<R: BufRead, W: Write>(predictor: &dyn Predictor, mut input: R, output: &mut W) -> Result<usize> {
    let mut served = 0;
    loop {
        let reply = match ipc::read_message_blocking::<_, Prediction>(&mut input) {
            Ok(Some(work)) => {
                debug!(kind = work.kind(), len = work.len(), "request");
                match work.run_guarded(predictor) {
                    Ok(out) => Reply::Output(out),
                    Err(ExecutionError::Predict(e)) if e.is_fatal() => {
                        error!(error = %e, "predictor broken, asking to be replaced");
                        Reply::Lost(e.message().to_string())
                    }
                    Err(ExecutionError::Predict(e)) => Reply::Failed(e.message().to_string()),
                    Err(e) => Reply::Failed(e.to_string()),
                }
            }
            Ok(None) => return Ok(served),
            Err(e) if e.kind() == io::ErrorKind::InvalidData => Reply::Failed(format!("bad request line: {e}")),
            Err(e) => return Err(e).context("reading request line"),
        };
        ipc::write_message_blocking(output, &reply).context("writing reply")?;
        served += 1;
    }
}
