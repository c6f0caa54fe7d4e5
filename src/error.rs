use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("reference to unknown {kind} ({id})")]
    ReferenceMissing { kind: &'static str, id: String },

    #[error("circular workflow dependency detected: {0}")]
    CircularWorkflowDependency(String),

    #[error("failed to acquire step: {0}")]
    StepAcquireFailed(String),

    #[error("step dependency ({0}) is not available")]
    DependencyMissing(String),

    #[error("failed to evaluate template expression ({expression}): {message}")]
    TemplateEval { expression: String, message: String },

    #[error("step exited with code {0}")]
    StepExitedNonZero(i32),

    #[error("step execution timed out after {0:?}")]
    StepTimeout(Duration),

    #[error("step produced no output for {0:?}")]
    NoOutputTimeout(Duration),

    #[error("step execution cancelled")]
    Cancelled,

    #[error("env store error: {0}")]
    EnvStore(String),

    #[error("incompatible step override: {0}")]
    MergeConflict(String),

    #[error("no matching pipeline or workflow found for trigger params: {0}")]
    NoTriggerMatch(String),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// True for failures the engine attributes to a single step invocation
    /// rather than to the build setup. Per-step failures never abort the
    /// workflow loop directly.
    pub fn is_step_scoped(&self) -> bool {
        matches!(
            self,
            Error::StepAcquireFailed(_)
                | Error::DependencyMissing(_)
                | Error::TemplateEval { .. }
                | Error::StepExitedNonZero(_)
                | Error::StepTimeout(_)
                | Error::NoOutputTimeout(_)
                | Error::Cancelled
                | Error::EnvStore(_)
                | Error::MergeConflict(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
