use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use super::{Archive, LoadError, LoadOptions, PredictorFactory};
use crate::predictor::{JsonObject, PredictError, Predictor};

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct EchoParams {
    delay_ms: u64,
}

/// Returns every input object unchanged, optionally after a fixed delay.
#[derive(Debug, Clone, Default)]
pub struct EchoPredictor {
    delay: Duration,
}

impl EchoPredictor {
    pub fn new(delay: Duration) -> Self { Self { delay } }
}

impl Predictor for EchoPredictor {
    fn predict_json(&self, input: &JsonObject) -> Result<Value, PredictError> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        Ok(Value::Object(input.clone()))
    }
}

pub struct EchoFactory;

impl PredictorFactory for EchoFactory {
    fn load(&self, archive: &Archive, _options: &LoadOptions) -> Result<Box<dyn Predictor>, LoadError> {
        let params: EchoParams = archive.params("echo")?;
        Ok(Box::new(EchoPredictor::new(Duration::from_millis(params.delay_ms))))
    }
}
