use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::OperationId;
use crate::thought::{NodeId, StageKind};

/// Application-level errors
#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Inference error: {0}")]
    Inference(#[from] InferenceError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Errors raised by the inference service boundary.
///
/// `Timeout`, `RateLimited`, `Transport` and 429/5xx `Api` errors are
/// transient and retried by the adapter. Everything else surfaces as-is.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Request timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Inference failed after {attempts} attempt(s): {message}")]
    Permanent { attempts: u32, message: String },

    #[error("Malformed response: {message}")]
    ResponseFormat { message: String },
}

impl InferenceError {
    /// Whether a fresh request might succeed where this one failed.
    pub fn is_transient(&self) -> bool {
        match self {
            InferenceError::Timeout { .. }
            | InferenceError::RateLimited { .. }
            | InferenceError::Transport { .. } => true,
            InferenceError::Api { status, .. } => *status == 429 || *status >= 500,
            InferenceError::Permanent { .. } | InferenceError::ResponseFormat { .. } => false,
        }
    }
}

impl From<reqwest::Error> for InferenceError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            InferenceError::ResponseFormat {
                message: err.to_string(),
            }
        } else {
            InferenceError::Transport {
                message: err.to_string(),
            }
        }
    }
}

/// Graph construction and planning errors. Raised before any external call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum GraphError {
    #[error("Dependency {from} -> {to} would create a cycle")]
    Cycle { from: OperationId, to: OperationId },

    #[error("Unknown operation: {0}")]
    UnknownOperation(OperationId),

    #[error("Invalid configuration for {operation}: {message}")]
    Config { operation: String, message: String },
}

/// Errors produced while executing a single operation.
#[derive(Debug, Error)]
pub enum OperationError {
    #[error("Insufficient inputs: {required} required, {available} available")]
    InsufficientInputs { required: usize, available: usize },

    #[error(transparent)]
    Inference(#[from] InferenceError),

    #[error("No handler registered for operation kind '{kind}'")]
    UnknownKind { kind: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Thought Node Store errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("Node already exists: {0}")]
    DuplicateNode(NodeId),

    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Node {0} is resolved and cannot change")]
    Immutable(NodeId),
}

/// Kind of problem found at a document path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    Missing,
    Malformed,
}

/// One missing or malformed field in a stage document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldIssue {
    /// JSON pointer of the offending field, e.g. `/basic_info/time`.
    pub path: String,
    pub kind: IssueKind,
    pub message: String,
}

impl FieldIssue {
    /// Top-level document key this issue belongs to, if any.
    pub fn section(&self) -> Option<&str> {
        self.path
            .trim_start_matches('/')
            .split('/')
            .next()
            .filter(|s| !s.is_empty())
    }
}

/// A stage document failed validation against its expected shape.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("Schema violation in {stage}: {}", summarize_issues(.issues))]
pub struct SchemaViolation {
    pub stage: StageKind,
    pub issues: Vec<FieldIssue>,
}

fn summarize_issues(issues: &[FieldIssue]) -> String {
    issues
        .iter()
        .map(|i| match i.kind {
            IssueKind::Missing => format!("missing {}", i.path),
            IssueKind::Malformed => format!("malformed {} ({})", i.path, i.message),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

impl SchemaViolation {
    /// Distinct top-level sections implicated by the violation, in order.
    pub fn sections(&self) -> Vec<String> {
        let mut sections: Vec<String> = Vec::new();
        for issue in &self.issues {
            if let Some(section) = issue.section() {
                if !sections.iter().any(|s| s == section) {
                    sections.push(section.to_string());
                }
            }
        }
        sections
    }
}

/// Stage-level failures
#[derive(Debug, Error)]
pub enum StageError {
    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Operation {operation} ({label}) failed: {source}")]
    OperationFailed {
        operation: OperationId,
        label: String,
        #[source]
        source: OperationError,
    },

    #[error(transparent)]
    Schema(#[from] SchemaViolation),

    #[error("Stage execution cancelled")]
    Cancelled,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl StageError {
    /// Label of the operation that caused the failure, when one did.
    pub fn operation_label(&self) -> Option<&str> {
        match self {
            StageError::OperationFailed { label, .. } => Some(label),
            _ => None,
        }
    }
}

/// Run-level failures
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid input: {message}")]
    InvalidInput { message: String },

    #[error("Stage {stage} failed: {source}")]
    Stage {
        stage: StageKind,
        #[source]
        source: StageError,
    },

    #[error("Run cancelled before {stage} completed")]
    Cancelled { stage: StageKind },

    #[error("Report error: {message}")]
    Report { message: String },
}

impl PipelineError {
    /// Stage the failure is attributed to.
    pub fn stage(&self) -> Option<StageKind> {
        match self {
            PipelineError::Stage { stage, .. } | PipelineError::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }
}

/// Result type alias for application errors
pub type AppResult<T> = Result<T, AppError>;

/// Result type alias for inference calls
pub type InferenceResult<T> = Result<T, InferenceError>;

/// Result type alias for graph construction
pub type GraphResult<T> = Result<T, GraphError>;
