//! Crate-wide error taxonomy. Validation errors are deliberately *not*
//! represented here — the validator returns `Vec<String>` directly and never
//! raises (§4.3 "Validation is pure and side-effect free").

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("workflow {0} not found")]
    WorkflowNotFound(String),

    #[error("run {0} not found")]
    RunNotFound(String),

    #[error("edge references unknown node: {0}")]
    UnknownNodeReference(String),

    #[error("workflow graph contains a cycle")]
    CycleDetected,

    #[error("unknown step type: {0}")]
    UnknownStepType(String),

    #[error("step {step_id} timed out after {timeout_seconds}s")]
    StepTimeout { step_id: String, timeout_seconds: f64 },

    #[error("run {0} timed out")]
    RunTimeout(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("expression error: {0}")]
    SafeEval(String),

    #[error("missing path '{0}' in context")]
    MissingPath(String),

    #[error("step {step_id} failed: {message}")]
    StepFailed { step_id: String, message: String },

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("{0}")]
    General(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
