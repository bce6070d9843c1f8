/// Core types shared across the gradebox system
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

/// Errors that abort a run before (or while) checks execute.
///
/// Per-check assertion failures never surface here; those are captured
/// inside the check's own result record. This enum covers runner faults:
/// package load problems, staging problems, and child process plumbing.
#[derive(Error, Debug)]
pub enum GradeboxError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Package error: {0}")]
    Package(String),

    #[error("Stage error: {0}")]
    Stage(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, GradeboxError>;

/// How child execution units are started.
///
/// Fork-style children inherit the loaded package in memory; spawn-style
/// children re-exec the current binary and rebuild the package from its
/// source, so package load must be idempotent.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum StartMethod {
    Fork,
    Spawn,
}

impl FromStr for StartMethod {
    type Err = GradeboxError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fork" => Ok(Self::Fork),
            "spawn" => Ok(Self::Spawn),
            other => Err(GradeboxError::Config(format!(
                "unknown start method: {other} (expected fork or spawn)"
            ))),
        }
    }
}

/// Runner configuration.
#[derive(Clone, Debug)]
pub struct RunnerConfig {
    /// Child start method
    pub start_method: StartMethod,
    /// Upper bound on concurrently running checks (None = unbounded)
    pub max_parallel: Option<usize>,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        RunnerConfig {
            start_method: StartMethod::Fork,
            max_parallel: None,
        }
    }
}
