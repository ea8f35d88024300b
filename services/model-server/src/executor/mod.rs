//! Execution contexts that run predictions off the request-accepting loop.
//!
//! [`Executor::submit`] is the whole capability. Two variants back it:
//! [`ThreadPool`] shares one loaded predictor between pool threads, and
//! [`ProcessPool`] keeps one loaded predictor per worker process.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::ExecutionError;
use crate::prediction::{Prediction, PredictionOutput};

mod process;
mod thread;

pub use process::{ProcessPool, WorkerCommand};
pub use thread::ThreadPool;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerType {
    Thread,
    #[default]
    Process,
}

impl fmt::Display for WorkerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Thread => write!(f, "thread"),
            Self::Process => write!(f, "process"),
        }
    }
}

impl FromStr for WorkerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(Self::Thread),
            "process" => Ok(Self::Process),
            other => Err(format!("un-supported worker type {other:?}")),
        }
    }
}

impl<'de> Deserialize<'de> for WorkerType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs one unit of work to completion, without blocking the caller's
    /// thread.
    async fn submit(&self, work: Prediction) -> Result<PredictionOutput, ExecutionError>;

    fn worker_type(&self) -> WorkerType;

    /// Execution contexts currently available.
    fn workers(&self) -> usize;

    /// Graceful release. Dropping the executor releases resources too.
    async fn shutdown(&self);
}

/// `ceil(cpus / num_threads)`, at least 1. `num_threads` defaults to the
/// number of CPUs.
pub fn default_max_workers(num_threads: Option<usize>) -> usize {
    let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let per_worker = num_threads.unwrap_or(cpus).max(1);
    cpus.div_ceil(per_worker).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_type_parses_case_insensitively() {
        assert_eq!("THREAD".parse::<WorkerType>(), Ok(WorkerType::Thread));
        assert_eq!(" Process ".parse::<WorkerType>(), Ok(WorkerType::Process));
        assert!("fiber".parse::<WorkerType>().is_err());
        let t: WorkerType = serde_json::from_str("\"Thread\"").unwrap();
        assert_eq!(t, WorkerType::Thread);
        assert_eq!(serde_json::to_string(&WorkerType::Process).unwrap(), "\"process\"");
    }

    #[test]
    fn default_workers_divide_cpus() {
        let cpus = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        assert_eq!(default_max_workers(None), 1);
        assert_eq!(default_max_workers(Some(1)), cpus);
        assert_eq!(default_max_workers(Some(0)), cpus);
        assert_eq!(default_max_workers(Some(cpus * 4)), 1);
    }
}
