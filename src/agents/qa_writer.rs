//! Auxiliary Q&A agent.
//!
//! Produces a short Markdown Q&A sheet per module, stored on the artifact
//! as an [`AuxiliaryAsset`] of kind `qa`.

use std::sync::Arc;

use crate::llm::{RemoteCall, RemoteCallGateway};
use crate::pipeline::{AuxiliaryAsset, CourseSpec, ModuleSpec};
use crate::utils::preview;

/// Q&A used when the model produces nothing usable.
pub const FALLBACK_QA: &str = "- Q: What is the key idea?
  - A: A concise explanation.
- Q: When to use it?
  - A: In scenarios X and Y.
- Q: Common pitfall?
  - A: Missing assumptions.";

pub struct QaWriter {
    gateway: Arc<RemoteCallGateway>,
    model: String,
}

impl std::fmt::Debug for QaWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QaWriter")
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

impl QaWriter {
    pub const AGENT_NAME: &'static str = "qa_writer";

    pub fn new(gateway: Arc<RemoteCallGateway>, model: impl Into<String>) -> Self {
        Self {
            gateway,
            model: model.into(),
        }
    }

    /// Generate the Q&A asset for `module`. Never fails.
    pub async fn write(&self, module: &ModuleSpec, course: &CourseSpec) -> AuxiliaryAsset {
        tracing::info!(module_id = %module.id, "Q&A start");
        let call = RemoteCall::new(&self.model, build_prompt(module, course));

        let markdown = match self.gateway.call(call).await {
            Ok(text) if !text.trim().is_empty() => {
                tracing::info!(
                    module_id = %module.id,
                    len = text.len(),
                    preview = %preview(&text, None),
                    "Q&A ok"
                );
                text
            }
            Ok(_) => FALLBACK_QA.to_string(),
            Err(err) => {
                tracing::warn!(module_id = %module.id, error = %err, "Q&A failed, using fallback");
                FALLBACK_QA.to_string()
            }
        };

        AuxiliaryAsset::qa(markdown)
    }
}

pub fn build_prompt(module: &ModuleSpec, course: &CourseSpec) -> String {
    format!(
        "Produce 5 short Q&A pairs in Markdown about: {}.\nLevel: {} Audience: {} Language: {}.",
        module.title,
        course.constraint_list("level_label"),
        course.constraint_list("audience"),
        course.language(),
    )
}
