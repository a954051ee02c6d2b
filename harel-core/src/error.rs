//! Core error types.

use thiserror::Error;

/// Errors from the statechart core.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("structural model error: {reason}")]
    StructuralModel { reason: String },

    #[error("invalid target '{target}' for transition with event '{event}'")]
    UnresolvedTarget { event: String, target: String },

    #[error("model validation failed: {reason}")]
    Validation { reason: String },

    #[error("illegal configuration: {reason}")]
    IllegalConfiguration { reason: String },

    #[error("guard '{expr}' failed to evaluate: {reason}")]
    GuardEvaluation { expr: String, reason: String },

    #[error("expression '{expr}' failed to evaluate: {reason}")]
    Evaluation { expr: String, reason: String },

    #[error("invalid expression: {reason}")]
    InvalidExpression { reason: String },

    #[error("cannot {operation} while engine is {state}")]
    EngineState {
        operation: &'static str,
        state: String,
    },

    #[error("stabilization did not settle within {limit} microsteps")]
    StabilizationLimit { limit: usize },

    #[error("external event queue is closed")]
    QueueClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CoreError {
    pub(crate) fn structural(reason: impl Into<String>) -> Self {
        CoreError::StructuralModel {
            reason: reason.into(),
        }
    }

    pub(crate) fn validation(reason: impl Into<String>) -> Self {
        CoreError::Validation {
            reason: reason.into(),
        }
    }

    /// Returns whether this error aborts the model or the engine, as opposed
    /// to a rejected operation the caller can recover from.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            CoreError::GuardEvaluation { .. }
                | CoreError::Evaluation { .. }
                | CoreError::EngineState { .. }
                | CoreError::QueueClosed
        )
    }

    /// Returns a stable error code suitable for host reporting.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::StructuralModel { .. } => "STRUCTURAL_MODEL",
            CoreError::UnresolvedTarget { .. } => "VALIDATION",
            CoreError::Validation { .. } => "VALIDATION",
            CoreError::IllegalConfiguration { .. } => "ILLEGAL_CONFIGURATION",
            CoreError::GuardEvaluation { .. } => "GUARD_EVALUATION",
            CoreError::Evaluation { .. } => "EVALUATION",
            CoreError::InvalidExpression { .. } => "BAD_EXPRESSION",
            CoreError::EngineState { .. } => "ENGINE_STATE",
            CoreError::StabilizationLimit { .. } => "STABILIZATION_LIMIT",
            CoreError::QueueClosed => "QUEUE_CLOSED",
            CoreError::Io(_) => "IO_ERROR",
            CoreError::Json(_) => "BAD_DOCUMENT",
            CoreError::Yaml(_) => "BAD_DOCUMENT",
        }
    }
}
