//! Request and result shapes. The HTTP body decides single vs batch:
//! an object is one prediction, an array of objects is a batch.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, ExecutionError};
use crate::predictor::{JsonObject, Predictor};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Prediction {
    Single(JsonObject),
    Batch(Vec<JsonObject>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictionOutput {
    Single(Value),
    Batch(Vec<Value>),
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

impl Prediction {
    /// Decodes a parsed request body.
    pub fn from_json(value: Value) -> Result<Self, Error> {
        match value {
            Value::Object(input) => Ok(Self::Single(input)),
            Value::Array(items) => items
                .into_iter()
                .enumerate()
                .map(|(i, item)| match item {
                    Value::Object(input) => Ok(input),
                    other => Err(Error::Validation(format!(
                        "batch item {i} is {}, expected an object",
                        json_kind(&other)
                    ))),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Self::Batch),
            other => Err(Error::Validation(format!(
                "expected a JSON object or an array of objects, got {}",
                json_kind(&other)
            ))),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Single(_) => "single",
            Self::Batch(_) => "batch",
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Batch(inputs) => inputs.len(),
        }
    }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Whether `output` has the shape this request must produce.
    pub fn accepts(&self, output: &PredictionOutput) -> bool {
        match (self, output) {
            (Self::Single(_), PredictionOutput::Single(_)) => true,
            (Self::Batch(inputs), PredictionOutput::Batch(values)) => inputs.len() == values.len(),
            _ => false,
        }
    }

    pub fn run(&self, predictor: &dyn Predictor) -> Result<PredictionOutput, ExecutionError> {
        match self {
            Self::Single(input) => Ok(PredictionOutput::Single(predictor.predict_json(input)?)),
            Self::Batch(inputs) => {
                let values = predictor.predict_batch_json(inputs)?;
                if values.len() != inputs.len() {
                    return Err(ExecutionError::ShapeMismatch { expected: inputs.len(), got: values.len() });
                }
                Ok(PredictionOutput::Batch(values))
            }
        }
    }

    /// Like [`Prediction::run`], with a predictor panic turned into an error.
    pub fn run_guarded(&self, predictor: &dyn Predictor) -> Result<PredictionOutput, ExecutionError> {
        match catch_unwind(AssertUnwindSafe(|| self.run(predictor))) {
            Ok(result) => result,
            Err(payload) => Err(ExecutionError::Panicked(panic_message(payload.as_ref()))),
        }
    }
}

impl PredictionOutput {
    pub fn into_json(self) -> Value {
        match self {
            Self::Single(value) => value,
            Self::Batch(values) => Value::Array(values),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".into()
    }
}
