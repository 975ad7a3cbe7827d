//! course-forge: animated course generation.
//!
//! This library plans a syllabus with a language model, writes lesson text,
//! Q&A and Manim scene code per module, renders the scenes in a sandbox
//! and persists the finished course.

// Core modules
pub mod agents;
pub mod cli;
pub mod error;
pub mod execution;
pub mod llm;
pub mod pipeline;
pub mod storage;
pub mod utils;

// Re-export commonly used error types
pub use error::{LlmError, PersistError, PipelineError, StrategyError};
