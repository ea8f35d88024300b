use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Per-model prediction counters, registered on an owned registry.
#[derive(Clone)]
pub struct PredictionMetrics {
    requests: IntCounterVec,
    latency: HistogramVec,
}

impl PredictionMetrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let requests = IntCounterVec::new(
            Opts::new("runmodel_predictions_total", "Prediction requests by model, shape and outcome"),
            &["model", "kind", "outcome"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new("runmodel_prediction_seconds", "Prediction latency by model and shape")
                .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            &["model", "kind"],
        )?;
        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(latency.clone()))?;
        Ok(Self { requests, latency })
    }

    pub fn observe(&self, model: &str, kind: &str, outcome: &str, elapsed: Duration) {
        self.requests.with_label_values(&[model, kind, outcome]).inc();
        self.latency.with_label_values(&[model, kind]).observe(elapsed.as_secs_f64());
    }
}
