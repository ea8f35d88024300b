use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tracing::info;

use super::{Executor, WorkerType};
use crate::archive::LoadError;
use crate::error::ExecutionError;
use crate::prediction::{Prediction, PredictionOutput};
use crate::predictor::Predictor;

/// A bounded rayon pool sharing one predictor. The predictor is read-only
/// after load, so pool threads never contend on it. Shutdown releases it.
pub struct ThreadPool {
    model: String,
    predictor: RwLock<Option<Arc<dyn Predictor>>>,
    pool: rayon::ThreadPool,
    size: usize,
}

impl ThreadPool {
    pub fn new(model: &str, predictor: Box<dyn Predictor>, workers: usize) -> Result<Self, LoadError> {
        let name = model.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(move |i| format!("predict[{name}]-{i}"))
            .build()
            .map_err(|e| LoadError::Pool(e.to_string()))?;
        info!(model, workers, "thread pool created");
        Ok(Self { model: model.to_string(), predictor: RwLock::new(Some(Arc::from(predictor))), pool, size: workers })
    }
}

#[async_trait]
impl Executor for ThreadPool {
    async fn submit(&self, work: Prediction) -> Result<PredictionOutput, ExecutionError> {
        let predictor = self.predictor.read().clone().ok_or(ExecutionError::PoolClosed)?;
        let (tx, rx) = oneshot::channel();
        self.pool.spawn(move || {
            // the receiver may be gone if the caller was dropped
            let _ = tx.send(work.run_guarded(predictor.as_ref()));
        });
        rx.await.map_err(|_| ExecutionError::PoolClosed)?
    }

    fn worker_type(&self) -> WorkerType { WorkerType::Thread }

    fn workers(&self) -> usize { self.size }

    async fn shutdown(&self) {
        // jobs already queued hold their own handle and still finish
        if self.predictor.write().take().is_some() {
            info!(model = %self.model, "thread pool shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predictor::{JsonObject, PredictError};
    use serde_json::{json, Value};
    use std::time::{Duration, Instant};

    struct Sleepy(Duration);

    impl Predictor for Sleepy {
        fn predict_json(&self, input: &JsonObject) -> Result<Value, PredictError> {
            std::thread::sleep(self.0);
            if input.contains_key("panic") {
                panic!("asked to panic");
            }
            Ok(json!(std::thread::current().name().map(str::to_string)))
        }
    }

    fn single(v: Value) -> Prediction { Prediction::from_json(v).unwrap() }

    #[tokio::test]
    async fn runs_on_named_pool_threads() {
        let pool = ThreadPool::new("m", Box::new(Sleepy(Duration::ZERO)), 1).unwrap();
        let out = pool.submit(single(json!({}))).await.unwrap();
        assert_eq!(out, PredictionOutput::Single(json!("predict[m]-0")));
        assert_eq!(pool.workers(), 1);
        assert_eq!(pool.worker_type(), WorkerType::Thread);
    }

    #[tokio::test]
    async fn submissions_run_in_parallel_up_to_pool_size() {
        let pool = ThreadPool::new("m", Box::new(Sleepy(Duration::from_millis(200))), 4).unwrap();
        let start = Instant::now();
        let calls = (0..4).map(|_| pool.submit(single(json!({}))));
        for r in futures::future::join_all(calls).await {
            r.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(600), "{:?}", start.elapsed());
    }

    #[tokio::test]
    async fn panic_does_not_poison_the_pool() {
        let pool = ThreadPool::new("m", Box::new(Sleepy(Duration::ZERO)), 1).unwrap();
        let err = pool.submit(single(json!({"panic": true}))).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Panicked(_)));
        assert!(pool.submit(single(json!({}))).await.is_ok());
    }

    #[tokio::test]
    async fn shutdown_releases_the_predictor() {
        use std::sync::atomic::{AtomicBool, Ordering};

        struct Tracked(Arc<AtomicBool>);

        impl Predictor for Tracked {
            fn predict_json(&self, input: &JsonObject) -> Result<Value, PredictError> { Ok(Value::Object(input.clone())) }
        }

        impl Drop for Tracked {
            fn drop(&mut self) { self.0.store(true, Ordering::SeqCst); }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let pool = ThreadPool::new("m", Box::new(Tracked(dropped.clone())), 2).unwrap();
        pool.submit(single(json!({}))).await.unwrap();

        pool.shutdown().await;
        // the pool thread lets go of its handle just after replying
        for _ in 0..100 {
            if dropped.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(dropped.load(Ordering::SeqCst));
        let err = pool.submit(single(json!({}))).await.unwrap_err();
        assert!(matches!(err, ExecutionError::PoolClosed), "{err}");
        pool.shutdown().await;
    }
}
