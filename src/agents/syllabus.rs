//! Syllabus generation agent.
//!
//! Asks the syllabus model for a JSON module list and validates it. Any
//! remote failure or malformed answer produces the deterministic fallback
//! syllabus instead, so the first stage never fails.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use crate::llm::{RemoteCall, RemoteCallGateway};
use crate::pipeline::{CourseSpec, ModuleSpec};
use crate::utils::{extract_json_object, preview, redact};

use super::error::{AgentError, AgentResult};

/// Module count used when the constraints do not request one.
pub const DEFAULT_MODULE_COUNT: i64 = 6;

/// Largest module count the fallback syllabus will produce.
pub const MAX_MODULE_COUNT: i64 = 10;

const SYLLABUS_SYSTEM_PROMPT: &str = r#"You are a course designer. Output ONLY valid JSON:
{
  "modules": [
    {
      "id": "m1",
      "title": "<title>",
      "objectives": ["<objective>", "..."],
      "outline": ["<section 1>", "<section 2>", "..."]
    }
  ]
}
Rules:
- 6-10 modules unless constraints specify otherwise.
- Titles must be specific and learner-facing.
- Objectives use measurable verbs (explain, derive, apply).
- Outline is 4-7 bullet points, sequenced for learning.
- No prose outside the JSON."#;

const FALLBACK_OBJECTIVES: &[&str] = &["Explain key ideas", "Apply basic methods"];

const FALLBACK_OUTLINE: &[&str] = &[
    "Introduction",
    "Core Concepts",
    "Worked Example",
    "Practice",
    "Recap",
];

/// Produces the module list for a course.
pub struct SyllabusGenerator {
    gateway: Arc<RemoteCallGateway>,
    model: String,
}

impl std::fmt::Debug for SyllabusGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyllabusGenerator")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl SyllabusGenerator {
    /// Agent name constant for identification.
    pub const AGENT_NAME: &'static str = "syllabus";

    pub fn new(gateway: Arc<RemoteCallGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }

    /// Generate a syllabus, substituting the fallback on any failure.
    pub async fn generate(&self, course: &CourseSpec) -> Vec<ModuleSpec> {
        tracing::info!(
            topic = %course.topic,
            level = %course.level,
            constraints = %serde_json::Value::Object(redact(&course.constraints)),
            "Syllabus start"
        );

        match self.try_generate(course).await {
            Ok(modules) => {
                let ids: Vec<&str> = modules.iter().map(|m| m.id.as_str()).collect();
                tracing::info!(modules = modules.len(), ids = ?ids, "Syllabus ok");
                modules
            }
            Err(err) => {
                let modules = fallback_syllabus(course);
                tracing::warn!(error = %err, count = modules.len(), "Syllabus fallback used");
                modules
            }
        }
    }

    /// Generate and validate a syllabus without falling back.
    pub async fn try_generate(&self, course: &CourseSpec) -> AgentResult<Vec<ModuleSpec>> {
        let call = RemoteCall::new(&self.model, build_prompt(course)).with_system(SYLLABUS_SYSTEM_PROMPT);
        let content = self.gateway.call(call).await?;
        tracing::debug!(preview = %preview(&content, None), "Syllabus raw response");
        parse_syllabus(&content)
    }
}

fn build_prompt(course: &CourseSpec) -> String {
    format!(
        "Topic: {}\nLevel: {}\nConstraints: {}",
        course.topic,
        course.level,
        Value::Object(course.constraints.clone())
    )
}

/// Parse and validate a syllabus response.
///
/// Fails when there is no JSON object, `modules` is missing or empty, a
/// module lacks an id or title, or ids repeat.
pub fn parse_syllabus(content: &str) -> AgentResult<Vec<ModuleSpec>> {
    let value = extract_json_object(content).ok_or(AgentError::NoJson)?;

    let entries = value
        .get("modules")
        .and_then(Value::as_array)
        .ok_or_else(|| AgentError::ResponseParseError("missing 'modules' array".to_string()))?;

    if entries.is_empty() {
        return Err(AgentError::InvalidSyllabus("module list is empty".to_string()));
    }

    let mut seen = HashSet::new();
    let mut modules = Vec::with_capacity(entries.len());

    for (index, entry) in entries.iter().enumerate() {
        let id = scalar_text(entry.get("id")).ok_or_else(|| {
            AgentError::InvalidSyllabus(format!("module {} has no id", index + 1))
        })?;
        let title = scalar_text(entry.get("title")).ok_or_else(|| {
            AgentError::InvalidSyllabus(format!("module '{}' has no title", id))
        })?;
        if !seen.insert(id.clone()) {
            return Err(AgentError::InvalidSyllabus(format!("duplicate module id '{}'", id)));
        }

        modules.push(ModuleSpec {
            id,
            title,
            objectives: text_list(entry.get("objectives")),
            outline: text_list(entry.get("outline")),
        });
    }

    Ok(modules)
}

/// Non-empty trimmed text from a string or number.
fn scalar_text(value: Option<&Value>) -> Option<String> {
    let text = match value? {
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        _ => return None,
    };
    (!text.is_empty()).then_some(text)
}

fn text_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().filter_map(|v| scalar_text(Some(v))).collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

/// Number of modules in the fallback syllabus.
///
/// Uses `count_modules` from the constraints when it is a non-zero number,
/// otherwise [`DEFAULT_MODULE_COUNT`], clamped to `[1, MAX_MODULE_COUNT]`.
pub fn fallback_module_count(course: &CourseSpec) -> usize {
    let requested = course
        .requested_module_count()
        .filter(|n| *n != 0)
        .unwrap_or(DEFAULT_MODULE_COUNT);
    requested.clamp(1, MAX_MODULE_COUNT) as usize
}

/// Deterministic syllabus used when generation fails.
pub fn fallback_syllabus(course: &CourseSpec) -> Vec<ModuleSpec> {
    (1..=fallback_module_count(course))
        .map(|i| ModuleSpec {
            id: format!("m{}", i),
            title: format!("Module {}: {}", i, course.topic),
            objectives: FALLBACK_OBJECTIVES.iter().map(|s| s.to_string()).collect(),
            outline: FALLBACK_OUTLINE.iter().map(|s| s.to_string()).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::{GatewayConfig, GenerationRequest, GenerationResponse, LlmProvider, RetryPolicy};
    use crate::pipeline::Constraints;
    use async_trait::async_trait;
    use serde_json::json;
    use std::time::Duration;

    struct MockLlmProvider {
        response: Result<String, u16>,
    }

    #[async_trait]
    impl LlmProvider for MockLlmProvider {
        async fn generate(&self, _request: GenerationRequest) -> Result<GenerationResponse, LlmError> {
            match &self.response {
                Ok(text) => Ok(GenerationResponse::from_text("mock", text.clone())),
                Err(code) => Err(LlmError::ApiError {
                    code: *code,
                    message: "mock failure".to_string(),
                }),
            }
        }
    }

    fn generator(response: Result<String, u16>) -> SyllabusGenerator {
        let config = GatewayConfig {
            retry: RetryPolicy {
                max_attempts: 2,
                base: Duration::ZERO,
                cap: Duration::ZERO,
                jitter: Duration::ZERO,
            },
            ..GatewayConfig::default()
        };
        let gateway = RemoteCallGateway::new(Arc::new(MockLlmProvider { response }), config);
        SyllabusGenerator::new(Arc::new(gateway), "mock-model")
    }

    fn course(constraints: Value) -> CourseSpec {
        CourseSpec::new(
            "Binary Search",
            "beginner",
            constraints.as_object().cloned().unwrap_or_else(Constraints::new),
        )
    }

    #[test]
    fn test_parse_valid_syllabus() {
        let content = r#"```json
{"modules": [
  {"id": "m1", "title": "Why search?", "objectives": ["Explain"], "outline": ["Intro", "Idea"]},
  {"id": 2, "title": "Halving", "outline": "Loop"}
]}
```"#;
        let modules = parse_syllabus(content).unwrap();
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[0].outline, vec!["Intro", "Idea"]);
        assert_eq!(modules[1].id, "2");
        assert!(modules[1].objectives.is_empty());
        assert_eq!(modules[1].outline, vec!["Loop"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(matches!(parse_syllabus("no json"), Err(AgentError::NoJson)));
        assert!(matches!(
            parse_syllabus(r#"{"lessons": []}"#),
            Err(AgentError::ResponseParseError(_))
        ));
        assert!(matches!(
            parse_syllabus(r#"{"modules": []}"#),
            Err(AgentError::InvalidSyllabus(_))
        ));
        assert!(matches!(
            parse_syllabus(r#"{"modules": [{"title": "x"}]}"#),
            Err(AgentError::InvalidSyllabus(_))
        ));
        assert!(matches!(
            parse_syllabus(r#"{"modules": [{"id": "m1", "title": " "}]}"#),
            Err(AgentError::InvalidSyllabus(_))
        ));
        let err = parse_syllabus(
            r#"{"modules": [{"id": "m1", "title": "a"}, {"id": "m1", "title": "b"}]}"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_fallback_module_count() {
        assert_eq!(fallback_module_count(&course(json!({}))), 6);
        assert_eq!(fallback_module_count(&course(json!({"count_modules": 3}))), 3);
        assert_eq!(fallback_module_count(&course(json!({"count_modules": "4"}))), 4);
        assert_eq!(fallback_module_count(&course(json!({"count_modules": 0}))), 6);
        assert_eq!(fallback_module_count(&course(json!({"count_modules": -2}))), 1);
        assert_eq!(fallback_module_count(&course(json!({"count_modules": 50}))), 10);
    }

    #[test]
    fn test_fallback_syllabus_shape() {
        let modules = fallback_syllabus(&course(json!({})));
        let ids: Vec<&str> = modules.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3", "m4", "m5", "m6"]);
        assert_eq!(modules[0].title, "Module 1: Binary Search");
        assert_eq!(modules[5].outline.len(), 5);
        assert_eq!(modules[2].objectives, vec!["Explain key ideas", "Apply basic methods"]);
    }

    #[tokio::test]
    async fn test_generate_uses_model_output() {
        let agent = generator(Ok(
            r#"{"modules": [{"id": "intro", "title": "Intro", "objectives": [], "outline": []}]}"#
                .to_string(),
        ));
        let modules = agent.generate(&course(json!({}))).await;
        assert_eq!(modules.len(), 1);
        assert_eq!(modules[0].id, "intro");
    }

    #[tokio::test]
    async fn test_generate_falls_back_on_remote_error() {
        let agent = generator(Err(401));
        let modules = agent.generate(&course(json!({"count_modules": 2}))).await;
        assert_eq!(modules.len(), 2);
        assert_eq!(modules[1].id, "m2");
    }

    #[tokio::test]
    async fn test_generate_falls_back_on_garbage() {
        let agent = generator(Ok("I cannot help with that.".to_string()));
        let modules = agent.generate(&course(json!({}))).await;
        assert_eq!(modules.len(), 6);
    }
}
