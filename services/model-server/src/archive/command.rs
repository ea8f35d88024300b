//! Bridges to an external program that holds the real model. The program
//! reads one request line on stdin and writes one reply line on stdout, using
//! the same codec as worker processes (see [`crate::ipc`]). A `ready` line is
//! allowed but not required.

use std::collections::BTreeMap;
use std::io::BufReader;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use super::{Archive, Device, LoadError, LoadOptions, PredictorFactory};
use crate::ipc::{self, Reply};
use crate::prediction::{Prediction, PredictionOutput};
use crate::predictor::{JsonObject, PredictError, Predictor};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct CommandParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

/// A running child and its pipes.
struct Bridge {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl Bridge {
    fn start(mut command: Command, program: &str) -> std::io::Result<Self> {
        let mut child = command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "child pipes unavailable"));
            }
        };
        info!(program, pid = child.id(), "predictor command started");
        Ok(Self { child, stdin, stdout: BufReader::new(stdout) })
    }

    /// Fatal errors mean the pipes can no longer be trusted.
    fn exchange(&mut self, work: &Prediction, program: &str) -> Result<PredictionOutput, PredictError> {
        ipc::write_message_blocking(&mut self.stdin, work)
            .map_err(|e| PredictError::fatal(format!("{program}: write failed: {e}")))?;
        loop {
            match ipc::read_message_blocking::<_, Reply>(&mut self.stdout) {
                Ok(Some(Reply::Output(output))) => return Ok(output),
                Ok(Some(Reply::Failed(msg))) => return Err(PredictError::new(msg)),
                Ok(Some(Reply::Lost(msg))) => return Err(PredictError::fatal(msg)),
                Ok(Some(Reply::Ready { pid, .. })) => debug!(program, pid, "late ready line"),
                Ok(None) => return Err(PredictError::fatal(format!("{program} exited"))),
                Err(e) => return Err(PredictError::fatal(format!("{program}: bad reply: {e}"))),
            }
        }
    }

    fn stop(mut self, program: &str) {
        if let Err(e) = self.child.kill() {
            debug!(program, error = %e, "kill predictor command");
        }
        match self.child.wait() {
            Ok(status) => debug!(program, %status, "predictor command reaped"),
            Err(e) => warn!(program, error = %e, "reaping predictor command"),
        }
    }
}

type Launch = Box<dyn Fn() -> Command + Send + Sync>;

/// One child process at a time; calls are serialized on its pipes. When the
/// child dies the call fails with a fatal error and the next call starts a
/// new child from `launch`.
pub struct CommandPredictor {
    program: String,
    launch: Launch,
    bridge: Mutex<Option<Bridge>>,
}

impl CommandPredictor {
    pub fn spawn<F>(launch: F) -> std::io::Result<Self>
    where
        F: Fn() -> Command + Send + Sync + 'static,
    {
        let command = launch();
        let program = command.get_program().to_string_lossy().into_owned();
        let bridge = Bridge::start(command, &program)?;
        Ok(Self { program, launch: Box::new(launch), bridge: Mutex::new(Some(bridge)) })
    }

    fn call(&self, work: &Prediction) -> Result<PredictionOutput, PredictError> {
        let mut slot = self.bridge.lock();
        let bridge = match slot.take() {
            Some(bridge) => slot.insert(bridge),
            None => {
                info!(program = %self.program, "restarting predictor command");
                let bridge = Bridge::start((self.launch)(), &self.program)
                    .map_err(|e| PredictError::fatal(format!("{}: restart failed: {e}", self.program)))?;
                slot.insert(bridge)
            }
        };
        let result = bridge.exchange(work, &self.program);
        if let Err(e) = &result {
            if e.is_fatal() {
                warn!(program = %self.program, error = %e, "predictor command lost");
                if let Some(dead) = slot.take() {
                    dead.stop(&self.program);
                }
            }
        }
        result
    }
}

impl Predictor for CommandPredictor {
    fn predict_json(&self, input: &JsonObject) -> Result<Value, PredictError> {
        match self.call(&Prediction::Single(input.clone()))? {
            PredictionOutput::Single(value) => Ok(value),
            PredictionOutput::Batch(_) => Err(PredictError::new("batch reply to a single request")),
        }
    }

    fn predict_batch_json(&self, inputs: &[JsonObject]) -> Result<Vec<Value>, PredictError> {
        match self.call(&Prediction::Batch(inputs.to_vec()))? {
            PredictionOutput::Batch(values) => Ok(values),
            PredictionOutput::Single(_) => Err(PredictError::new("single reply to a batch request")),
        }
    }
}

impl Drop for CommandPredictor {
    fn drop(&mut self) {
        if let Some(bridge) = self.bridge.get_mut().take() {
            bridge.stop(&self.program);
        }
    }
}

pub struct CommandFactory;

impl CommandFactory {
    fn command(archive: &Archive, options: &LoadOptions, params: &CommandParams) -> Command {
        let mut cmd = Command::new(archive.resolve(&params.program));
        cmd.args(&params.args).current_dir(archive.base_dir()).envs(&params.env);
        cmd.env("RUNMODEL_DEVICE", options.device.to_string());
        cmd.env(
            "CUDA_VISIBLE_DEVICES",
            match options.device {
                Device::Cpu => String::new(),
                Device::Cuda(n) => n.to_string(),
            },
        );
        if let Some(n) = options.num_threads {
            cmd.env("OMP_NUM_THREADS", n.to_string());
        }
        cmd
    }
}

impl PredictorFactory for CommandFactory {
    fn load(&self, archive: &Archive, options: &LoadOptions) -> Result<Box<dyn Predictor>, LoadError> {
        let params: CommandParams = archive.params("command")?;
        let program = params.program.clone();
        let (archive, options) = (archive.clone(), options.clone());
        let launch = move || Self::command(&archive, &options, &params);
        let predictor = CommandPredictor::spawn(launch).map_err(|e| LoadError::Startup {
            predictor: "command".into(),
            reason: format!("{program}: {e}"),
        })?;
        Ok(Box::new(predictor))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use serde_json::json;

    fn sh(script: &str) -> CommandPredictor {
        let script = script.to_string();
        CommandPredictor::spawn(move || {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&script);
            cmd
        })
        .unwrap()
    }

    fn obj(v: Value) -> JsonObject { v.as_object().cloned().unwrap() }

    #[test]
    fn reads_single_reply_per_line() {
        let p = sh(r#"echo '{"ready":{"pid":1,"model":""}}'; while read -r line; do echo '{"output":{"single":{"label":"pos"}}}'; done"#);
        for _ in 0..3 {
            assert_eq!(p.predict_json(&obj(json!({"text": "hi"}))).unwrap(), json!({"label": "pos"}));
        }
    }

    #[test]
    fn failed_reply_is_a_predict_error() {
        let p = sh(r#"while read -r line; do echo '{"failed":"model refused"}'; done"#);
        assert_eq!(p.predict_json(&obj(json!({}))).unwrap_err(), PredictError::new("model refused"));
    }

    #[test]
    fn shape_mismatch_is_reported() {
        let p = sh(r#"while read -r line; do echo '{"output":{"single":1}}'; done"#);
        let err = p.predict_batch_json(&[obj(json!({}))]).unwrap_err();
        assert!(err.message().contains("single reply"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn exited_program_is_a_fatal_error() {
        let p = sh("exit 0");
        let err = p.predict_json(&obj(json!({}))).unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert!(err.message().contains("exited") || err.message().contains("write failed"), "{err}");
    }

    #[test]
    fn program_is_restarted_after_it_exits() {
        // answers one line, then quits
        let p = sh(r#"read -r line; echo '{"output":{"single":"up"}}'"#);
        assert_eq!(p.predict_json(&obj(json!({}))).unwrap(), json!("up"));
        let err = p.predict_json(&obj(json!({}))).unwrap_err();
        assert!(err.is_fatal(), "{err}");
        assert_eq!(p.predict_json(&obj(json!({}))).unwrap(), json!("up"));
    }

    #[test]
    fn lost_reply_is_fatal() {
        let p = sh(r#"while read -r line; do echo '{"lost":"gpu fell off"}'; done"#);
        assert_eq!(p.predict_json(&obj(json!({}))).unwrap_err(), PredictError::fatal("gpu fell off"));
    }

    #[test]
    fn factory_exports_device_and_threads() {
        use std::io::Write;
        let mut f = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            f,
            "predictor: command\nparams:\n  program: sh\n  args: ['-c', 'while read -r l; do printf \"{{\\\"output\\\":{{\\\"single\\\":\\\"%s/%s\\\"}}}}\\n\" \"$RUNMODEL_DEVICE\" \"$OMP_NUM_THREADS\"; done']\n"
        )
        .unwrap();
        let archive = Archive::open(f.path()).unwrap();
        let opts = LoadOptions { device: Device::Cuda(1), num_threads: Some(2), predictor_name: None };
        let p = CommandFactory.load(&archive, &opts).unwrap();
        assert_eq!(p.predict_json(&obj(json!({}))).unwrap(), json!("cuda:1/2"));
    }
}
