//! Layered configuration: optional file, then `<PREFIX>__*` environment
//! variables. Defaults belong to the target type (`#[serde(default)]`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tracing::debug;

/// `file` wins over `<PREFIX>_CONFIG_FILE`; a named file must exist.
pub fn load_config<T: DeserializeOwned>(env_prefix: &str, file: Option<&Path>) -> Result<T> {
    let file: Option<PathBuf> = file
        .map(Path::to_path_buf)
        .or_else(|| std::env::var(format!("{env_prefix}_CONFIG_FILE")).ok().map(PathBuf::from));

    let mut builder = config::Config::builder();
    if let Some(path) = &file {
        debug!(path = %path.display(), "loading config file");
        builder = builder.add_source(config::File::from(path.as_path()).required(true));
    }
    builder = builder.add_source(
        config::Environment::with_prefix(env_prefix)
            .separator("__")
            .try_parsing(true),
    );
    let cfg = builder.build().context("building configuration")?;
    cfg.try_deserialize().context("deserializing configuration")
}
