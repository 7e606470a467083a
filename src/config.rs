use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::version::BuildInfo;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/chuanyun/esmeralda.toml";

/// Default port of the diagnostic (pprof) listener.
pub const DEFAULT_PPROF_PORT: u16 = 11011;

/// Top-level configuration loaded from esmeralda.toml.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
#[derive(Default)]
pub struct ServerConfig {
    pub exporter: ExporterConfig,
    pub profiling: ProfilingConfig,
    pub shutdown: ShutdownConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ExporterConfig {
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProfilingConfig {
    /// Directory the `trace.out` file is created in.
    pub trace_dir: PathBuf,
    /// Runtime sampling interval. Zero is rejected at load time.
    pub sample_interval_ms: u64,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ShutdownConfig {
    /// How long shutdown waits for background tasks before abandoning them.
    pub grace_period_secs: u64,
}

// --- Default implementations ---

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 9100,
        }
    }
}

impl Default for ProfilingConfig {
    fn default() -> Self {
        Self {
            trace_dir: PathBuf::from("."),
            sample_interval_ms: 1000,
        }
    }
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
        }
    }
}

impl ExporterConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

impl ProfilingConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

impl ShutdownConfig {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }
}

/// Errors that abort startup while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Load configuration from `path`.
///
/// An explicitly requested file must exist. When `path` is `None` the
/// default location is tried and a missing file falls back to defaults.
pub fn load_config(path: Option<&Path>) -> Result<ServerConfig, ConfigError> {
    let (path, required) = match path {
        Some(p) => (p.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
    };

    let contents = match std::fs::read_to_string(&path) {
        Ok(c) => c,
        Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(ServerConfig::default());
        }
        Err(source) => return Err(ConfigError::Read { path, source }),
    };

    let config: ServerConfig =
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
    config.validate()?;

    tracing::info!(path = %path.display(), "configuration loaded");
    Ok(config)
}

impl ServerConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.profiling.sample_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "profiling.sample_interval_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Everything the supervisor needs, resolved once at process entry.
#[derive(Debug, Clone)]
pub struct Settings {
    pub config: ServerConfig,
    pub pprof: bool,
    pub pprof_port: u16,
    pub build: BuildInfo,
}

impl Settings {
    pub fn new(config: ServerConfig, build: BuildInfo) -> Self {
        Self {
            config,
            pprof: false,
            pprof_port: DEFAULT_PPROF_PORT,
            build,
        }
    }

    pub fn with_pprof(mut self, enabled: bool, port: u16) -> Self {
        self.pprof = enabled;
        self.pprof_port = port;
        self
    }
}
