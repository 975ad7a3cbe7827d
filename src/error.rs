//! Error types for course-forge operations.
//!
//! Defines the error enums shared across subsystems:
//! - Generative backend calls
//! - Render strategies in the compilation engine
//! - Persistence collaborator calls
//! - Pipeline orchestration
//!
//! Checkpoint and configuration errors live next to their owners in
//! `storage::checkpoint` and `pipeline::config`.

use thiserror::Error;

/// Errors that can occur while talking to a generative backend.
#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Missing API key: OPENROUTER_API_KEY environment variable not set")]
    MissingApiKey,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Request timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Failed to parse LLM response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors produced by a single render strategy.
///
/// A strategy error never aborts a compile; the engine moves on to the
/// next strategy in the cascade.
#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("Strategy disabled by configuration")]
    Disabled,

    #[error("Toolchain unavailable: {0}")]
    Unavailable(String),

    #[error("Timed out after {seconds} seconds")]
    Timeout { seconds: u64 },

    #[error("Process exited with code {code}: {stderr}")]
    NonZeroExit {
        code: i64,
        command: String,
        stdout: String,
        stderr: String,
    },

    #[error("Renderer finished but produced no output file")]
    OutputMissing,

    #[error("Docker error: {0}")]
    Docker(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StrategyError {
    /// Whether the strategy was skipped rather than attempted.
    pub fn is_skip(&self) -> bool {
        matches!(self, StrategyError::Disabled | StrategyError::Unavailable(_))
    }
}

/// Errors that can occur when calling the persistence backend.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Persistence backend not configured")]
    NotConfigured,

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Backend error ({code}): {message}")]
    ApiError { code: u16, message: String },

    #[error("Unexpected backend response: {0}")]
    UnexpectedResponse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors that abort a course build.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Module task '{module_id}' failed: {reason}")]
    ModuleTask { module_id: String, reason: String },

    #[error("Invalid syllabus: {0}")]
    InvalidSyllabus(String),

    #[error("Stage '{stage}' was reached without its inputs: {reason}")]
    MissingStageInput { stage: String, reason: String },

    #[error("Execution engine '{engine}' failed: {reason}")]
    Engine { engine: String, reason: String },

    #[error("Compilation produced no media for module '{0}'")]
    CompileFailed(String),

    #[error("Persistence failed: {0}")]
    Persist(#[from] PersistError),

    #[error("Pipeline setup failed: {0}")]
    Setup(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] crate::storage::CheckpointError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
