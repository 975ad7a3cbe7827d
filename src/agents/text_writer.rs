//! Lesson text agent.

use std::sync::Arc;

use crate::llm::{RemoteCall, RemoteCallGateway};
use crate::pipeline::{CourseSpec, ModuleSpec};
use crate::utils::preview;

/// Text returned when the model produces nothing usable.
pub const FALLBACK_TEXT: &str = "# Lesson\n\nContent unavailable.";

const TEXT_SYSTEM_PROMPT: &str = "Write concise Markdown for a course lesson.
- Use headings matching the provided outline.
- Keep under 1000 words.
- Include exactly one worked example.
- End with a recap and 3 reflection questions.
";

/// Writes the Markdown body of one module.
pub struct TextWriter {
    gateway: Arc<RemoteCallGateway>,
    model: String,
}

impl std::fmt::Debug for TextWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextWriter")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl TextWriter {
    pub const AGENT_NAME: &'static str = "text_writer";

    pub fn new(gateway: Arc<RemoteCallGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }

    /// Write lesson text for `module`. Never fails; errors yield [`FALLBACK_TEXT`].
    pub async fn write(&self, module: &ModuleSpec, course: &CourseSpec) -> String {
        let call = RemoteCall::new(&self.model, build_prompt(module, course)).with_system(TEXT_SYSTEM_PROMPT);

        match self.gateway.call(call).await {
            Ok(text) if !text.trim().is_empty() => {
                tracing::info!(
                    module_id = %module.id,
                    chars = text.chars().count(),
                    preview = %preview(&text, Some(80)),
                    "Lesson text ok"
                );
                text
            }
            Ok(_) => {
                tracing::warn!(module_id = %module.id, "Empty lesson text, using fallback");
                FALLBACK_TEXT.to_string()
            }
            Err(err) => {
                tracing::warn!(module_id = %module.id, error = %err, "Lesson text failed, using fallback");
                FALLBACK_TEXT.to_string()
            }
        }
    }
}

/// User prompt for one module.
pub fn build_prompt(module: &ModuleSpec, course: &CourseSpec) -> String {
    let outline = module.outline.join("\n- ");
    format!(
        "Language: {}\n\
         Title: {}\n\
         Objectives: {}\n\
         Outline:\n- {}\n\
         Audience: {} Level: {}\n\
         Prerequisites: {}\n\
         Learning outcomes: {}\n",
        course.language(),
        module.title,
        module.objectives.join("; "),
        outline,
        course.constraint_list("audience"),
        course.constraint_list("level_label"),
        course.constraint_list("prerequisites"),
        course.constraint_list("learning_outcomes"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{GatewayConfig, GenerationRequest, GenerationResponse, LlmProvider};
    use crate::pipeline::Constraints;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    struct MockLlmProvider {
        response: Option<String>,
        requests: Mutex<Vec<GenerationRequest>>,
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(&self, request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            self.requests.lock().unwrap().push(request);
            match &self.response {
                Some(text) => Ok(GenerationResponse::from_text("mock", text.clone())),
                None => Err(LlmError::MissingApiKey),
            }
        }
    }

    fn module() -> ModuleSpec {
        ModuleSpec {
            id: "m1".to_string(),
            title: "Halving the range".to_string(),
            objectives: vec!["Explain invariants".to_string()],
            outline: vec!["Introduction".to_string(), "Loop".to_string()],
        }
    }

    fn course() -> CourseSpec {
        let constraints: Constraints = json!({
            "language": "es",
            "audience": "students",
            "prerequisites": ["arrays", "loops"],
        })
        .as_object()
        .cloned()
        .unwrap();
        CourseSpec::new("Binary Search", "beginner", constraints)
    }

    #[test]
    fn test_prompt_contents() {
        let prompt = build_prompt(&module(), &course());
        assert!(prompt.starts_with("Language: es\n"));
        assert!(prompt.contains("Outline:\n- Introduction\n- Loop\n"));
        assert!(prompt.contains("Audience: students Level: \n"));
        assert!(prompt.contains("Prerequisites: arrays, loops"));
    }

    #[tokio::test]
    async fn test_write_returns_model_text() {
        let provider = Arc::new(MockLlmProvider {
            response: Some("# Halving\n\nBody".to_string()),
            requests: Mutex::new(Vec::new()),
        });
        let gateway = Arc::new(RemoteCallGateway::new(provider.clone(), GatewayConfig::default()));
        let writer = TextWriter::new(gateway, "text-model");

        let text = writer.write(&module(), &course()).await;
        assert_eq!(text, "# Halving\n\nBody");

        let requests = provider.requests.lock().unwrap();
        assert_eq!(requests[0].model, "text-model");
        assert_eq!(requests[0].messages[0].role, "system");
    }

    #[tokio::test]
    async fn test_write_falls_back() {
        for response in [None, Some("  \n".to_string())] {
            let provider = Arc::new(MockLlmProvider {
                response,
                requests: Mutex::new(Vec::new()),
            });
            let gateway = Arc::new(RemoteCallGateway::new(provider, GatewayConfig::default()));
            let writer = TextWriter::new(gateway, "text-model");
            assert_eq!(writer.write(&module(), &course()).await, FALLBACK_TEXT);
        }
    }
}
