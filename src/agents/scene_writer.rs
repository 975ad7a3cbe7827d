//! Scene synthesis agent.
//!
//! Prompts the code model for a Manim scene, extracts the source from the
//! response and validates it. Violations are fed back into a bounded retry;
//! when retries run out, or the scene turns out to be static, a
//! deterministic fallback scene is returned instead. [`SceneSynthesizer::synthesize`]
//! always yields source that passes the validator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm::{RemoteCall, RemoteCallGateway};
use crate::pipeline::{ModuleSpec, SceneOrigin};
use crate::utils::{extract_code, preview};

use super::error::CodeValidationError;
use super::fallback_scenes::{minimal_scene, rich_scene};
use super::scene_validator::{SceneValidator, ENTRY_MARKERS};

/// Attempts per module, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 2;

/// Lesson text forwarded to the prompt as caption material.
pub const MAX_CAPTION_CHARS: usize = 600;

const SCENE_SYSTEM_PROMPT: &str = "Generate Python code for a single Manim Scene named `Lesson`.
- Use only Manim Community stable APIs.
- 16:9 aspect, minimal dependencies.
- Include helpful comments.
- One Scene only.
Hard requirements:
- The first line is `from manim import *`; import nothing else.
- Declare `class Lesson(Scene):` with a `construct(self)` method that animates with self.play(...).
- Define the helper `def show_caption(self, text, duration=2.0):` exactly with that signature and use it for captions.
- Reply with one ```python fenced block and no other prose.";

/// Result of synthesizing one module's scene.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynthesisOutcome {
    /// Source that passes every validator check.
    pub source: String,
    /// Model attempts made; 0 only when no attempt was allowed.
    pub attempts: u32,
    pub origin: SceneOrigin,
}

/// Turns a module description into validated scene source.
pub struct SceneSynthesizer {
    gateway: Arc<RemoteCallGateway>,
    model: String,
    validator: SceneValidator,
    max_attempts: u32,
}

impl std::fmt::Debug for SceneSynthesizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneSynthesizer")
            .field("model", &self.model)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

impl SceneSynthesizer {
    pub const AGENT_NAME: &'static str = "scene_writer";

    /// Create a synthesizer using `model` for code generation.
    pub fn new(gateway: Arc<RemoteCallGateway>, model: impl Into<String>) -> Result<Self, regex::Error> {
        Ok(Self {
            gateway,
            model: model.into(),
            validator: SceneValidator::new()?,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        })
    }

    /// Set the attempt budget.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn validator(&self) -> &SceneValidator {
        &self.validator
    }

    /// Produce validated scene source for `module`.
    ///
    /// `lesson_text` is the module's generated text, used as caption
    /// material in the prompt and in the rich fallback.
    pub async fn synthesize(
        &self,
        module: &ModuleSpec,
        language: &str,
        lesson_text: Option<&str>,
    ) -> SynthesisOutcome {
        let mut feedback: Vec<CodeValidationError> = Vec::new();
        let mut attempts = 0;

        while attempts < self.max_attempts {
            attempts += 1;
            let prompt = build_prompt(module, language, lesson_text, &feedback);
            let call = RemoteCall::new(&self.model, prompt).with_system(SCENE_SYSTEM_PROMPT);

            let content = match self.gateway.call(call).await {
                Ok(content) => content,
                Err(err) => {
                    tracing::warn!(
                        module_id = %module.id,
                        attempt = attempts,
                        error = %err,
                        "Scene generation call failed"
                    );
                    break;
                }
            };

            let source = extract_code(&content, ENTRY_MARKERS, self.validator.code_start());
            let violations = self.validator.validate(&source);

            if violations.is_empty() {
                tracing::info!(module_id = %module.id, attempt = attempts, "Scene validated");
                return SynthesisOutcome {
                    source,
                    attempts,
                    origin: SceneOrigin::Generated,
                };
            }

            let summary: Vec<String> = violations.iter().map(ToString::to_string).collect();
            tracing::warn!(
                module_id = %module.id,
                attempt = attempts,
                violations = ?summary,
                preview = %preview(&source, None),
                "Scene rejected"
            );

            if violations.iter().any(CodeValidationError::skips_retry) {
                tracing::info!(module_id = %module.id, "Static scene, using rich fallback");
                let caption = lesson_text.and_then(opening_sentence);
                return SynthesisOutcome {
                    source: rich_scene(module, caption.as_deref()),
                    attempts,
                    origin: SceneOrigin::RichFallback,
                };
            }

            feedback = violations;
        }

        tracing::warn!(module_id = %module.id, attempts, "Scene attempts exhausted, using minimal fallback");
        SynthesisOutcome {
            source: minimal_scene(module),
            attempts,
            origin: SceneOrigin::MinimalFallback,
        }
    }
}

/// Build the user prompt, appending feedback from the previous attempt.
pub fn build_prompt(
    module: &ModuleSpec,
    language: &str,
    lesson_text: Option<&str>,
    feedback: &[CodeValidationError],
) -> String {
    let mut prompt = format!(
        "Create Manim code for: {}\nOutline: {}\nObjectives: {}\nNarrative language: {}\nClass name must be Lesson.\n",
        module.title,
        module.outline.join("; "),
        module.objectives.join("; "),
        language,
    );

    if let Some(text) = lesson_text.map(str::trim).filter(|t| !t.is_empty()) {
        let excerpt: String = text.chars().take(MAX_CAPTION_CHARS).collect();
        prompt.push_str("Lesson text for captions:\n");
        prompt.push_str(&excerpt);
        prompt.push('\n');
    }

    if !feedback.is_empty() {
        prompt.push_str("\nPrevious attempt failed:\n");
        for violation in feedback {
            prompt.push_str("- ");
            prompt.push_str(&violation.to_string());
            prompt.push('\n');
        }
    }

    prompt
}

/// First prose sentence of a Markdown lesson, skipping headings.
fn opening_sentence(text: &str) -> Option<String> {
    let line = text
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty() && !l.starts_with('#') && !l.starts_with("```"))?;
    let line = line.trim_start_matches(['-', '*', '>', ' ']);
    let sentence = match line.find(". ") {
        Some(end) => &line[..=end],
        None => line,
    };
    let sentence = sentence.replace(['*', '`', '_'], "");
    let sentence = sentence.trim();
    (!sentence.is_empty()).then(|| sentence.to_string())
}
