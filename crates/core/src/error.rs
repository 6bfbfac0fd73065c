use crate::types::{ExecutionId, ExecutionStatus};
use thiserror::Error;

/// Definition-time failures; an execution never starts when parsing fails
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("document error: {0}")]
    Document(String),

    #[error("schema error: {0}")]
    Schema(String),

    #[error("reference error: step '{step}' references unknown {kind} '{target}' via {field}")]
    Reference {
        step: String,
        field: &'static str,
        kind: &'static str,
        target: String,
    },

    #[error("duplicate step id: {0}")]
    DuplicateId(String),

    #[error("cycle detected: {}", path.join(" -> "))]
    Cycle { path: Vec<String> },
}

/// Failure to evaluate a condition or resolve a `{{path}}`
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EvaluationError {
    #[error("unresolved path '{path}': segment '{segment}' not found")]
    UnresolvedPath { path: String, segment: String },

    #[error("malformed expression '{expression}': {reason}")]
    Malformed { expression: String, reason: String },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),
}

/// Step-local failure, captured into the step record rather than raised
#[derive(Debug, Error)]
pub enum StepError {
    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error("step timed out after {secs} seconds")]
    Timeout { secs: u64 },

    #[error("invocation failed: {0}")]
    Invocation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("step cancelled")]
    Cancelled,

    #[error("sub-workflow failed: {0}")]
    SubWorkflow(String),
}

impl StepError {
    /// Timeouts and invocation errors are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Invocation(_))
    }
}

/// Execution-level failures
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("deadlock: no ready steps while incomplete steps remain: {}", stuck.join(", "))]
    Deadlock { stuck: Vec<String> },

    #[error("step '{step_id}' failed and aborted the execution: {message}")]
    StepAborted { step_id: String, message: String },

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("execution {id} cannot be resumed from status {status}")]
    NotResumable {
        id: ExecutionId,
        status: ExecutionStatus,
    },

    #[error("sub-workflow depth {depth} exceeds maximum {max}")]
    SubWorkflowDepthExceeded { depth: u32, max: u32 },

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type ExecutorResult<T> = std::result::Result<T, ExecutorError>;
