//! Batch configuration.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Default per-level solver timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path:?}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid instance limit {0:?}: expected \"all\" or a positive integer")]
    InvalidLimit(String),

    #[error("concurrency must be at least 1")]
    ZeroConcurrency,

    #[error("timeout must be non-zero")]
    ZeroTimeout,

    #[error("solver command is empty")]
    EmptySolver,
}

/// How many corpus levels to run. In JSON this is `"all"` or a positive
/// integer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InstanceLimit {
    #[default]
    All,
    Count(usize),
}

impl FromStr for InstanceLimit {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(InstanceLimit::All);
        }
        match s.parse::<usize>() {
            Ok(n) if n > 0 => Ok(InstanceLimit::Count(n)),
            _ => Err(ConfigError::InvalidLimit(s.to_string())),
        }
    }
}

impl Serialize for InstanceLimit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            InstanceLimit::All => serializer.serialize_str("all"),
            InstanceLimit::Count(n) => serializer.serialize_u64(*n as u64),
        }
    }
}

impl<'de> Deserialize<'de> for InstanceLimit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Count(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Count(n) => usize::try_from(n)
                .ok()
                .filter(|&n| n > 0)
                .map(InstanceLimit::Count)
                .ok_or_else(|| de::Error::custom(ConfigError::InvalidLimit(n.to_string()))),
            Raw::Text(text) => text.parse().map_err(de::Error::custom),
        }
    }
}

impl fmt::Display for InstanceLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceLimit::All => f.write_str("all"),
            InstanceLimit::Count(n) => write!(f, "{}", n),
        }
    }
}

/// External solver invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl SolverCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Run a shell snippet through `sh -c`
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }
}

impl fmt::Display for SolverCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Everything needed to run one batch
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchConfig {
    pub solver: SolverCommand,
    pub corpus: PathBuf,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_timeout_ms", rename = "timeoutMs", with = "millis")]
    pub timeout: Duration,
    #[serde(default)]
    pub limit: InstanceLimit,
}

impl BatchConfig {
    pub fn new(solver: SolverCommand, corpus: impl Into<PathBuf>) -> Self {
        Self {
            solver,
            corpus: corpus.into(),
            concurrency: default_concurrency(),
            timeout: DEFAULT_TIMEOUT,
            limit: InstanceLimit::All,
        }
    }

    /// Load a JSON config file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: BatchConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        if let InstanceLimit::Count(0) = self.limit {
            return Err(ConfigError::InvalidLimit("0".to_string()));
        }
        if self.solver.program.trim().is_empty() {
            return Err(ConfigError::EmptySolver);
        }
        Ok(())
    }
}

pub fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn default_timeout_ms() -> Duration {
    DEFAULT_TIMEOUT
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
