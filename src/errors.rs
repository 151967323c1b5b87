//! Typed error hierarchy for the OntExtract orchestrator.
//!
//! Two top-level enums:
//! - `OrchestrationError`: stage, review, resume and store failures
//! - `LlmError`: provider client failures, surfaced through the
//!   Recommend and Synthesize stages

use thiserror::Error;

use crate::orchestration::models::{RunStage, ToolKind};

/// Errors from the orchestration subsystem.
#[derive(Debug, Error)]
pub enum OrchestrationError {
    /// Experiment has no documents, or a document cannot be read.
    #[error("Input error: {0}")]
    Input(String),

    /// An LLM response (or submitted strategy) does not match the required shape.
    #[error("Schema validation failed in {stage} stage: {message}")]
    SchemaValidation { stage: RunStage, message: String },

    #[error("Tool {tool} failed on document {document_id}: {message}")]
    ToolInvocation {
        document_id: i64,
        tool: ToolKind,
        message: String,
    },

    #[error("Execute stage made no progress: all {attempted} tool invocations failed")]
    ExecutionStalled { attempted: usize },

    #[error("Run {run_id} is not awaiting review (stage: {stage}, decision recorded: {decided})")]
    ReviewConflict {
        run_id: String,
        stage: RunStage,
        decided: bool,
    },

    #[error("Run {run_id} is already being driven by another task")]
    ResumeConflict { run_id: String },

    #[error("Run {run_id} expected stage {expected} but found {actual}")]
    StageConflict {
        run_id: String,
        expected: RunStage,
        actual: RunStage,
    },

    #[error("Invalid strategy: {0}")]
    InvalidStrategy(String),

    #[error("Run {run_id} not found")]
    RunNotFound { run_id: String },

    #[error("Experiment {id} not found")]
    ExperimentNotFound { id: i64 },

    #[error("LLM call failed: {0}")]
    Llm(#[from] LlmError),

    #[error("Database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestrationError {
    /// Recover a typed error that travelled through a `DbHandle::call`
    /// closure as `anyhow::Error`; anything else is a database failure.
    pub fn from_db(err: anyhow::Error) -> Self {
        match err.downcast::<OrchestrationError>() {
            Ok(typed) => typed,
            Err(other) => OrchestrationError::Database(other),
        }
    }

    pub fn schema(stage: RunStage, message: impl Into<String>) -> Self {
        OrchestrationError::SchemaValidation {
            stage,
            message: message.into(),
        }
    }

    /// Whether this error terminates the run when raised by a stage.
    pub fn is_stage_fatal(&self) -> bool {
        !matches!(
            self,
            OrchestrationError::ToolInvocation { .. }
                | OrchestrationError::ReviewConflict { .. }
                | OrchestrationError::ResumeConflict { .. }
                | OrchestrationError::StageConflict { .. }
        )
    }
}

/// Errors from LLM provider clients.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM client misconfigured: {0}")]
    Misconfiguration(String),

    #[error("LLM transport error: {0}")]
    Transport(String),

    #[error("LLM provider returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("LLM provider returned an empty response")]
    EmptyResponse,
}
