//! Model archives and the factories that turn them into predictors.
//!
//! An archive is a manifest file naming a predictor and its params:
//!
//! ```yaml
//! predictor: command
//! params:
//!   program: ./bin/serve-model
//!   args: ["--weights", "model.bin"]
//! ```
//!
//! YAML unless the extension is `.json`. Relative program paths resolve
//! against the manifest directory, which is also the predictor's working dir.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::predictor::Predictor;

mod command;
mod echo;

pub use command::{CommandFactory, CommandPredictor};
pub use echo::{EchoFactory, EchoPredictor};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("cannot read archive {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid archive manifest {}: {reason}", .path.display())]
    Manifest { path: PathBuf, reason: String },

    #[error("unknown predictor {name:?} (known: {known})")]
    UnknownPredictor { name: String, known: String },

    #[error("invalid params for predictor {predictor:?}: {reason}")]
    Params { predictor: String, reason: String },

    #[error("predictor {predictor:?} failed to start: {reason}")]
    Startup { predictor: String, reason: String },

    #[error("worker {index} of model {model:?} failed to start: {reason}")]
    Worker { model: String, index: usize, reason: String },

    #[error("cannot build worker pool: {0}")]
    Pool(String),
}

/// Compute device selector. Negative CUDA ordinals mean CPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    Cpu,
    Cuda(u32),
}

impl Device {
    pub fn from_selector(selector: i32) -> Self {
        u32::try_from(selector).map(Self::Cuda).unwrap_or(Self::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Cuda(n) => write!(f, "cuda:{n}"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadOptions {
    pub device: Device,
    /// Threads a predictor may use internally
    pub num_threads: Option<usize>,
    /// Overrides the manifest's `predictor`
    pub predictor_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub predictor: Option<String>,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone)]
pub struct Archive {
    path: PathBuf,
    manifest: Manifest,
}

impl Archive {
    pub fn open(path: &Path) -> Result<Self, LoadError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| LoadError::Io { path: path.to_path_buf(), source })?;
        let is_json = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        let manifest: Manifest = if is_json {
            serde_json::from_str(&text).map_err(|e| e.to_string())
        } else {
            serde_yaml::from_str(&text).map_err(|e| e.to_string())
        }
        .map_err(|reason| LoadError::Manifest { path: path.to_path_buf(), reason })?;
        Ok(Self { path: path.to_path_buf(), manifest })
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn manifest(&self) -> &Manifest { &self.manifest }

    pub fn base_dir(&self) -> &Path {
        match self.path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        }
    }

    /// Bare names (`python3`) are left for `PATH` lookup; anything with a
    /// separator is taken relative to the manifest directory.
    pub fn resolve(&self, target: &str) -> PathBuf {
        let p = Path::new(target);
        if p.is_absolute() || p.components().count() == 1 {
            p.to_path_buf()
        } else {
            self.base_dir().join(p)
        }
    }

    /// Missing or `null` params decode as an empty map.
    pub fn params<T: DeserializeOwned>(&self, predictor: &str) -> Result<T, LoadError> {
        let raw = match &self.manifest.params {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        serde_json::from_value(raw)
            .map_err(|e| LoadError::Params { predictor: predictor.to_string(), reason: e.to_string() })
    }
}

pub trait PredictorFactory: Send + Sync {
    fn load(&self, archive: &Archive, options: &LoadOptions) -> Result<Box<dyn Predictor>, LoadError>;
}

impl<F> PredictorFactory for F
where
    F: Fn(&Archive, &LoadOptions) -> Result<Box<dyn Predictor>, LoadError> + Send + Sync,
{
    fn load(&self, archive: &Archive, options: &LoadOptions) -> Result<Box<dyn Predictor>, LoadError> {
        self(archive, options)
    }
}

/// Named predictor factories.
#[derive(Clone, Default)]
pub struct PredictorCatalog {
    factories: HashMap<String, Arc<dyn PredictorFactory>>,
}

impl PredictorCatalog {
    pub fn new() -> Self { Self::default() }

    /// `echo` and `command`.
    pub fn with_builtins() -> Self {
        Self::new().with("echo", EchoFactory).with("command", CommandFactory)
    }

    pub fn with(mut self, name: &str, factory: impl PredictorFactory + 'static) -> Self {
        self.insert(name, factory);
        self
    }

    pub fn insert(&mut self, name: &str, factory: impl PredictorFactory + 'static) {
        self.factories.insert(name.to_string(), Arc::new(factory));
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Reads the archive at `path` and loads it with the selected factory.
    pub fn load(&self, path: &Path, options: &LoadOptions) -> Result<Box<dyn Predictor>, LoadError> {
        let archive = Archive::open(path)?;
        let name = options
            .predictor_name
            .clone()
            .or_else(|| archive.manifest().predictor.clone())
            .ok_or_else(|| LoadError::Manifest {
                path: path.to_path_buf(),
                reason: "no `predictor` given and none selected".into(),
            })?;
        let factory = self.factories.get(&name).ok_or_else(|| LoadError::UnknownPredictor {
            name: name.clone(),
            known: self.names().join(", "),
        })?;
        info!(archive = %path.display(), predictor = %name, device = %options.device, "loading archive");
        factory.load(&archive, options)
    }
}

impl fmt::Debug for PredictorCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PredictorCatalog").field("factories", &self.names()).finish()
    }
}
