//! The prediction seam. A `Predictor` is whatever the loaded model exposes:
//! one JSON object in, one JSON value out, plus a batch form.

use serde_json::Value;
use thiserror::Error;

pub type JsonObject = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{message}")]
pub struct PredictError {
    message: String,
    fatal: bool,
}

impl PredictError {
    pub fn new(msg: impl Into<String>) -> Self { Self { message: msg.into(), fatal: false } }

    /// The predictor is broken, not just this input. Whoever hosts it should
    /// replace it before the next call.
    pub fn fatal(msg: impl Into<String>) -> Self { Self { message: msg.into(), fatal: true } }

    pub fn message(&self) -> &str { &self.message }

    pub fn is_fatal(&self) -> bool { self.fatal }
}

pub trait Predictor: Send + Sync {
    fn predict_json(&self, input: &JsonObject) -> Result<Value, PredictError>;

    /// Must return exactly one value per input, in order.
    fn predict_batch_json(&self, inputs: &[JsonObject]) -> Result<Vec<Value>, PredictError> {
        inputs.iter().map(|input| self.predict_json(input)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Len;

    impl Predictor for Len {
        fn predict_json(&self, input: &JsonObject) -> Result<Value, PredictError> {
            match input.get("text").and_then(Value::as_str) {
                Some(t) => Ok(json!(t.len())),
                None => Err(PredictError::new("missing text")),
            }
        }
    }

    fn obj(v: Value) -> JsonObject { v.as_object().cloned().unwrap() }

    #[test]
    fn default_batch_maps_single() {
        let out = Len.predict_batch_json(&[obj(json!({"text": "hi"})), obj(json!({"text": "four"}))]).unwrap();
        assert_eq!(out, vec![json!(2), json!(4)]);
    }

    #[test]
    fn default_batch_stops_at_first_error() {
        let err = Len.predict_batch_json(&[obj(json!({"text": "ok"})), obj(json!({}))]).unwrap_err();
        assert_eq!(err.to_string(), "missing text");
        assert!(!err.is_fatal());
    }

    #[test]
    fn fatal_errors_keep_their_message() {
        let err = PredictError::fatal("bridge exited");
        assert!(err.is_fatal());
        assert_eq!(err.message(), "bridge exited");
        assert_ne!(err, PredictError::new("bridge exited"));
    }
}
