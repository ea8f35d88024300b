use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use super::{Executor, WorkerType};
use crate::archive::LoadError;
use crate::error::ExecutionError;
use crate::ipc::{self, Reply};
use crate::predictor::PredictError;
use crate::prediction::{Prediction, PredictionOutput};

const STOP_GRACE: Duration = Duration::from_secs(5);

/// How to launch one worker process. `--index <n>` is appended per worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

struct WorkerProcess {
    index: usize,
    pid: Option<u32>,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl WorkerProcess {
    /// Spawns the worker and waits for its `ready` line.
    async fn spawn(model: &str, command: &WorkerCommand, index: usize) -> Result<Self, LoadError> {
        let fail = |reason: String| LoadError::Worker { model: model.to_string(), index, reason };
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .arg("--index")
            .arg(index.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| fail(format!("spawn {}: {e}", command.program.display())))?;
        let pid = child.id();
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, BufReader::new(stdout)),
            _ => return Err(fail("worker pipes unavailable".into())),
        };
        let mut worker = Self { index, pid, child, stdin, stdout };

        match ipc::read_message::<_, Reply>(&mut worker.stdout).await {
            Ok(Some(Reply::Ready { pid, .. })) => {
                info!(model, index, pid, "worker process initialized");
                Ok(worker)
            }
            Ok(Some(Reply::Failed(reason))) => {
                worker.kill().await;
                Err(fail(reason))
            }
            Ok(Some(other)) => {
                worker.kill().await;
                Err(fail(format!("unexpected handshake {other:?}")))
            }
            Ok(None) => {
                let status = worker.child.wait().await.map(|s| s.to_string()).unwrap_or_default();
                Err(fail(format!("exited before ready ({status})")))
            }
            Err(e) => {
                worker.kill().await;
                Err(fail(format!("bad handshake: {e}")))
            }
        }
    }

    fn lost(&self, reason: impl Into<String>) -> ExecutionError {
        ExecutionError::WorkerLost { index: self.index, pid: self.pid, reason: reason.into() }
    }

    async fn call(&mut self, work: &Prediction) -> Result<PredictionOutput, ExecutionError> {
        if let Err(e) = ipc::write_message(&mut self.stdin, work).await {
            return Err(self.lost(format!("write failed: {e}")));
        }
        match ipc::read_message::<_, Reply>(&mut self.stdout).await {
            Ok(Some(Reply::Output(output))) if work.accepts(&output) => Ok(output),
            Ok(Some(Reply::Output(_))) => Err(ExecutionError::UnexpectedReply),
            Ok(Some(Reply::Failed(msg))) => Err(ExecutionError::Predict(PredictError::new(msg))),
            Ok(Some(Reply::Lost(msg))) => Err(ExecutionError::Predict(PredictError::fatal(msg))),
            Ok(Some(Reply::Ready { .. })) => Err(ExecutionError::Protocol("ready line mid-stream".into())),
            Ok(None) => Err(self.lost("worker exited")),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Err(ExecutionError::Protocol(e.to_string())),
            Err(e) => Err(self.lost(format!("read failed: {e}"))),
        }
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!(index = self.index, error = %e, "kill worker");
        }
    }

    /// Closes stdin so the worker exits on its own, then kills it after
    /// `grace`.
    async fn stop(self, grace: Duration) {
        let Self { index, mut child, stdin, .. } = self;
        drop(stdin);
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => debug!(index, %status, "worker exited"),
            Ok(Err(e)) => warn!(index, error = %e, "waiting for worker"),
            Err(_) => {
                warn!(index, "worker did not exit in time, killing");
                let _ = child.kill().await;
            }
        }
    }
}

struct Shared {
    model: String,
    command: WorkerCommand,
    idle: Mutex<Vec<WorkerProcess>>,
    /// One permit per live worker
    slots: Semaphore,
    live: AtomicUsize,
}

impl Shared {
    /// Returns a worker to the idle list, or stops it when shutdown already
    /// drained that list.
    async fn park(&self, worker: WorkerProcess) {
        if self.slots.is_closed() {
            debug!(model = %self.model, index = worker.index, "pool closed, stopping worker");
            worker.stop(STOP_GRACE).await;
        } else {
            self.idle.lock().push(worker);
        }
    }

    async fn dispatch(&self, work: Prediction) -> Result<PredictionOutput, ExecutionError> {
        let permit = self.slots.acquire().await.map_err(|_| ExecutionError::PoolClosed)?;
        let mut worker = self.idle.lock().pop().ok_or(ExecutionError::PoolClosed)?;
        let result = worker.call(&work).await;

        let faulted = matches!(&result, Err(e) if e.is_worker_fault());
        if !faulted {
            // the worker must be idle again before its permit is released
            self.park(worker).await;
            drop(permit);
            return result;
        }

        let index = worker.index;
        if let Err(e) = &result {
            warn!(model = %self.model, index, pid = ?worker.pid, error = %e, "worker lost, respawning");
        }
        worker.kill().await;
        match WorkerProcess::spawn(&self.model, &self.command, index).await {
            Ok(fresh) => {
                // shutdown may have run while the replacement was starting
                self.park(fresh).await;
                drop(permit);
            }
            Err(e) => {
                error!(model = %self.model, index, error = %e, "respawn failed, pool shrinks");
                permit.forget();
                if self.live.fetch_sub(1, Ordering::SeqCst) == 1 {
                    error!(model = %self.model, "no workers left");
                    self.slots.close();
                }
            }
        }
        result
    }
}

/// A fixed set of worker processes, each holding its own loaded model and
/// serving one request at a time.
pub struct ProcessPool {
    shared: Arc<Shared>,
}

impl ProcessPool {
    /// Starts `workers` processes concurrently. If any fails to initialize,
    /// the others are stopped and the error is returned.
    pub async fn start(model: &str, command: WorkerCommand, workers: usize) -> Result<Self, LoadError> {
        info!(model, workers, program = %command.program.display(), "starting worker processes");
        let spawns = (0..workers).map(|i| WorkerProcess::spawn(model, &command, i));
        let results = futures::future::join_all(spawns).await;

        let mut started = Vec::with_capacity(workers);
        let mut first_err = None;
        for result in results {
            match result {
                Ok(worker) => started.push(worker),
                Err(e) => {
                    error!(model, error = %e, "process failed on initializing");
                    first_err.get_or_insert(e);
                }
            }
        }
        if let Some(err) = first_err {
            futures::future::join_all(started.into_iter().map(|w| w.stop(STOP_GRACE))).await;
            return Err(err);
        }

        Ok(Self {
            shared: Arc::new(Shared {
                model: model.to_string(),
                command,
                idle: Mutex::new(started),
                slots: Semaphore::new(workers),
                live: AtomicUsize::new(workers),
            }),
        })
    }
}

#[async_trait]
impl Executor for ProcessPool {
    async fn submit(&self, work: Prediction) -> Result<PredictionOutput, ExecutionError> {
        // detached so a dropped caller never strands a worker mid-reply
        let shared = self.shared.clone();
        tokio::spawn(async move { shared.dispatch(work).await })
            .await
            .map_err(|e| ExecutionError::Join(e.to_string()))?
    }

    fn worker_type(&self) -> WorkerType { WorkerType::Process }

    fn workers(&self) -> usize { self.shared.live.load(Ordering::SeqCst) }

    async fn shutdown(&self) {
        self.shared.slots.close();
        let workers = std::mem::take(&mut *self.shared.idle.lock());
        let count = workers.len();
        futures::future::join_all(workers.into_iter().map(|w| w.stop(STOP_GRACE))).await;
        info!(model = %self.shared.model, stopped = count, "worker processes shut down");
    }
}
