//! Error types for the generation agents.

use thiserror::Error;

/// Errors raised while interpreting model output.
///
/// Agents turn these into fallback content; they are returned by the
/// parsing helpers so tests can see why a response was rejected.
#[derive(Debug, Error)]
pub enum AgentError {
    /// The response contained no usable JSON.
    #[error("No JSON object found in response")]
    NoJson,

    /// The JSON did not match the expected shape.
    #[error("Failed to parse LLM response: {0}")]
    ResponseParseError(String),

    /// The syllabus parsed but breaks an invariant.
    #[error("Invalid syllabus: {0}")]
    InvalidSyllabus(String),

    /// The remote call failed.
    #[error("Remote call failed: {0}")]
    Remote(#[from] crate::llm::RemoteCallError),
}

/// Result type for agent helpers.
pub type AgentResult<T> = Result<T, AgentError>;

/// A violation of the scene source contract.
///
/// The display text doubles as feedback for the next synthesis attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodeValidationError {
    #[error("no Python source found in the response")]
    NoCode,

    #[error("imports `{module}`, which is not allowed; use only manim")]
    DeniedImport { module: String },

    #[error("syntax error on line {line}: {message}")]
    Syntax { line: usize, message: String },

    #[error("missing the entry import `from manim import *`")]
    MissingEntryImport,

    #[error("missing the scene class `class Lesson(Scene):`")]
    MissingEntryClass,

    #[error("missing the `construct(self)` method on Lesson")]
    MissingConstruct,

    #[error("`construct` must call at least one of self.play, self.add or self.wait")]
    MissingRenderCall,

    #[error("missing helper `def show_caption(self, text, duration=2.0):` with exactly that signature")]
    HelperSignature,

    #[error("the scene never calls self.play, so it produces no animation")]
    NoAnimation,
}

impl CodeValidationError {
    /// Violations that should not be retried.
    pub fn skips_retry(&self) -> bool {
        matches!(self, CodeValidationError::NoAnimation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feedback_text() {
        let err = CodeValidationError::DeniedImport {
            module: "numpy".to_string(),
        };
        assert!(err.to_string().contains("`numpy`"));

        let err = CodeValidationError::Syntax {
            line: 4,
            message: "unclosed '('".to_string(),
        };
        assert_eq!(err.to_string(), "syntax error on line 4: unclosed '('");
    }

    #[test]
    fn test_only_animation_skips_retry() {
        assert!(CodeValidationError::NoAnimation.skips_retry());
        assert!(!CodeValidationError::MissingEntryClass.skips_retry());
        assert!(!CodeValidationError::HelperSignature.skips_retry());
    }
}
