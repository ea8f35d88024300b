//! Registry rules: unique names, lookups, and independent pools.

use std::sync::Arc;
use std::time::{Duration, Instant};

use model_server::archive::EchoPredictor;
use model_server::executor::ThreadPool;
use model_server::{Error, ExecutionError, ModelConfig, ModelRegistry, Prediction, PredictorCatalog, WorkerType};
use serde_json::json;

fn echo_pool(name: &str, delay: Duration) -> Arc<ThreadPool> {
    Arc::new(ThreadPool::new(name, Box::new(EchoPredictor::new(delay)), 1).unwrap())
}

fn echo_manifest(dir: &tempfile::TempDir, file: &str, delay_ms: u64) -> std::path::PathBuf {
    let path = dir.path().join(file);
    std::fs::write(&path, format!("predictor: echo\nparams:\n  delay_ms: {delay_ms}\n")).unwrap();
    path
}

#[tokio::test]
async fn duplicate_names_are_a_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = ModelRegistry::new(PredictorCatalog::with_builtins());
    registry.register_executor("a", echo_pool("a", Duration::ZERO)).unwrap();

    let err = registry.register_executor("a", echo_pool("a", Duration::ZERO)).err().unwrap();
    assert!(matches!(err, Error::Configuration(_)), "{err}");

    // checked before the archive is even opened
    let cfg = ModelConfig::new("a", "/nonexistent/a.yaml").worker_type(WorkerType::Thread);
    let err = registry.register(cfg).await.err().unwrap();
    assert_eq!(err.to_string(), "configuration error: duplicated model name \"a\"");

    let cfg = ModelConfig::new("b", echo_manifest(&dir, "b.yaml", 0)).worker_type(WorkerType::Thread);
    registry.register(cfg).await.unwrap();
    assert_eq!(registry.names(), ["a", "b"]);
}

#[tokio::test]
async fn unknown_name_is_not_found() {
    let mut registry = ModelRegistry::new(PredictorCatalog::with_builtins());
    registry.register_executor("", echo_pool("", Duration::ZERO)).unwrap();
    assert!(registry.lookup("").is_ok());
    assert!(matches!(registry.lookup("missing"), Err(Error::NotFound(name)) if name == "missing"));
}

#[tokio::test]
async fn thread_model_from_archive() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ModelConfig::new("echo", echo_manifest(&dir, "echo.yaml", 0)).worker_type(WorkerType::Thread);
    cfg.max_workers = Some(2);
    let mut registry = ModelRegistry::new(PredictorCatalog::with_builtins());
    registry.register(cfg).await.unwrap();

    let status = &registry.statuses()[0];
    assert_eq!(status.worker_type, WorkerType::Thread);
    assert_eq!(status.workers, 2);

    let pool = registry.lookup("echo").unwrap();
    let out = pool.submit(Prediction::from_json(json!({"text": "hi"})).unwrap()).await.unwrap();
    assert_eq!(out.into_json(), json!({"text": "hi"}));
}

#[tokio::test]
async fn shut_down_thread_pool_rejects_work() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = ModelConfig::new("echo", echo_manifest(&dir, "echo.yaml", 0)).worker_type(WorkerType::Thread);
    let mut registry = ModelRegistry::new(PredictorCatalog::with_builtins());
    registry.register(cfg).await.unwrap();
    registry.shutdown().await;

    let err = registry.lookup("echo").unwrap().submit(Prediction::from_json(json!({})).unwrap()).await.unwrap_err();
    assert!(matches!(err, ExecutionError::PoolClosed), "{err}");
}

#[tokio::test]
async fn zero_workers_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = ModelConfig::new("z", echo_manifest(&dir, "z.yaml", 0)).worker_type(WorkerType::Thread);
    cfg.max_workers = Some(0);
    let mut registry = ModelRegistry::new(PredictorCatalog::with_builtins());
    assert!(matches!(registry.register(cfg).await, Err(Error::Configuration(_))));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn load_failure_leaves_no_entry() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bert.yaml");
    std::fs::write(&path, "predictor: bert\n").unwrap();
    let mut registry = ModelRegistry::new(PredictorCatalog::with_builtins());
    let err = registry.register(ModelConfig::new("bert", path).worker_type(WorkerType::Thread)).await.err().unwrap();
    assert!(matches!(err, Error::Load(_)), "{err}");
    assert!(registry.lookup("bert").is_err());
}

#[tokio::test]
async fn slow_models_do_not_wait_on_each_other() {
    let mut registry = ModelRegistry::new(PredictorCatalog::with_builtins());
    registry.register_executor("a", echo_pool("a", Duration::from_millis(400))).unwrap();
    registry.register_executor("b", echo_pool("b", Duration::from_millis(400))).unwrap();
    let registry = Arc::new(registry);

    let call = |name: &'static str| {
        let registry = registry.clone();
        async move {
            let work = Prediction::from_json(json!({"model": name})).unwrap();
            registry.lookup(name).unwrap().submit(work).await.unwrap().into_json()
        }
    };
    let started = Instant::now();
    let (a, b) = tokio::join!(call("a"), call("b"));
    assert_eq!(a, json!({"model": "a"}));
    assert_eq!(b, json!({"model": "b"}));
    assert!(started.elapsed() < Duration::from_millis(750), "took {:?}", started.elapsed());
}
