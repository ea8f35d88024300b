//! Tracing setup shared by the launcher and its worker processes.
//!
//! Filter sources, first match wins: `filter` directives from a logging
//! config file, `RUST_LOG`, then the plain `level`.

use std::path::Path;

use anyhow::{Context, Result};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Set to `1`/`true` to force JSON lines regardless of the configured format.
pub const JSON_LOG_ENV: &str = "RUNMODEL_JSON_LOG";

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogStream {
    #[default]
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// `EnvFilter` directives, e.g. `model_server=debug,tower_http=warn`.
    pub filter: Option<String>,
    pub format: LogFormat,
    pub stream: LogStream,
    pub target: bool,
    pub line_number: bool,
    pub thread_names: bool,
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            filter: None,
            format: LogFormat::Text,
            stream: LogStream::Stdout,
            target: true,
            line_number: false,
            thread_names: true,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    pub fn with_level(level: &str) -> Self {
        Self { level: level.trim().to_ascii_lowercase(), ..Self::default() }
    }

    /// Reads a logging config file. The format follows the extension
    /// (`.yaml`/`.yml`, `.json`, `.toml`, `.ini`).
    pub fn from_file(path: &Path) -> Result<Self> {
        let cfg = config::Config::builder()
            .add_source(config::File::from(path).required(true))
            .build()
            .with_context(|| format!("reading logging config {}", path.display()))?;
        cfg.try_deserialize()
            .with_context(|| format!("parsing logging config {}", path.display()))
    }

    pub fn stderr(mut self) -> Self {
        self.stream = LogStream::Stderr;
        self
    }

    fn env_filter(&self) -> EnvFilter {
        if let Some(directives) = &self.filter {
            return EnvFilter::new(directives);
        }
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level))
    }

    fn json(&self) -> bool {
        let forced = std::env::var(JSON_LOG_ENV)
            .ok()
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        forced || self.format == LogFormat::Json
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync + 'static>;

fn fmt_layer<W>(cfg: &LoggingConfig, writer: W) -> BoxedLayer
where
    W: for<'w> fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer::<Registry>()
        .with_writer(writer)
        .with_target(cfg.target)
        .with_line_number(cfg.line_number)
        .with_thread_names(cfg.thread_names);
    if cfg.json() {
        Box::new(layer.json().flatten_event(true).with_current_span(true).with_span_list(false))
    } else {
        Box::new(layer.with_ansi(cfg.ansi))
    }
}

/// Installs the global subscriber once; later calls are no-ops.
pub fn init_tracing(service: &str, cfg: &LoggingConfig) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let layer = match cfg.stream {
            LogStream::Stdout => fmt_layer(cfg, std::io::stdout),
            LogStream::Stderr => fmt_layer(cfg, std::io::stderr),
        };
        tracing_subscriber::registry()
            .with(layer)
            .with(cfg.env_filter())
            .try_init()?;
        Ok(())
    })?;
    info!(target: "runmodel", service, "tracing initialized");
    Ok(())
}
