//! Records threaded through the course build.
//!
//! Each stage takes a [`PipelineState`] by value and returns the next one.
//! Module ids are fixed by the syllabus stage and used as the key of the
//! artifact map from then on.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

use crate::storage::PersistResult;

/// Free-form build constraints (`count_modules`, `language`, `audience`, ...).
pub type Constraints = serde_json::Map<String, serde_json::Value>;

/// What the caller asked for. Immutable once the build starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourseSpec {
    pub topic: String,
    pub level: String,
    pub constraints: Constraints,
}

impl CourseSpec {
    /// Create a course spec.
    pub fn new(topic: impl Into<String>, level: impl Into<String>, constraints: Constraints) -> Self {
        Self {
            topic: topic.into(),
            level: level.into(),
            constraints,
        }
    }

    /// String constraint, ignoring nulls and non-strings.
    pub fn constraint_str(&self, key: &str) -> Option<&str> {
        self.constraints.get(key).and_then(|v| v.as_str())
    }

    /// Narrative language, `en` unless the constraints say otherwise.
    pub fn language(&self) -> &str {
        self.constraint_str("language")
            .filter(|l| !l.trim().is_empty())
            .unwrap_or("en")
    }

    /// Requested module count, accepting integers and numeric strings.
    pub fn requested_module_count(&self) -> Option<i64> {
        match self.constraints.get("count_modules")? {
            serde_json::Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().map(|f| f as i64)),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Render a list-valued constraint as a comma separated string.
    pub fn constraint_list(&self, key: &str) -> String {
        match self.constraints.get(key) {
            Some(serde_json::Value::Array(items)) => items
                .iter()
                .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                .collect::<Vec<_>>()
                .join(", "),
            Some(serde_json::Value::String(s)) => s.clone(),
            _ => String::new(),
        }
    }
}

/// One syllabus entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub outline: Vec<String>,
}

/// Secondary asset generated next to the scene code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryAsset {
    /// Asset kind; currently always `qa`.
    pub kind: String,
    /// Markdown body.
    pub markdown: String,
}

impl AuxiliaryAsset {
    /// A markdown Q&A asset.
    pub fn qa(markdown: impl Into<String>) -> Self {
        Self {
            kind: "qa".to_string(),
            markdown: markdown.into(),
        }
    }
}

/// Where a module's scene source came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneOrigin {
    /// Model output that passed every check.
    Generated,
    /// Deterministic minimal scene after retries ran out.
    MinimalFallback,
    /// Deterministic richer scene used when the model produced no animation.
    RichFallback,
}

/// Accumulated output for one module.
///
/// Fields start empty and are filled in by the stage that owns them.
/// `video_path` may legitimately stay `None` after compilation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleArtifact {
    pub module_id: String,
    pub title: String,
    pub outline: Vec<String>,
    pub text: Option<String>,
    pub source_code: Option<String>,
    pub scene_origin: Option<SceneOrigin>,
    pub auxiliary: Option<AuxiliaryAsset>,
    pub video_path: Option<PathBuf>,
}

impl ModuleArtifact {
    /// An empty artifact for `spec`.
    pub fn new(spec: &ModuleSpec) -> Self {
        Self {
            module_id: spec.id.clone(),
            title: spec.title.clone(),
            outline: spec.outline.clone(),
            text: None,
            source_code: None,
            scene_origin: None,
            auxiliary: None,
            video_path: None,
        }
    }

    /// Whether there is source to compile.
    pub fn has_source(&self) -> bool {
        self.source_code
            .as_deref()
            .is_some_and(|s| !s.trim().is_empty())
    }
}

/// Position in the fixed stage sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Created,
    SyllabusGenerated,
    ModulesFannedOut,
    Compiled,
    Persisted,
    Ready,
}

impl PipelineStage {
    /// Progress percentage reported on entering this stage.
    pub fn percent(&self) -> u8 {
        match self {
            PipelineStage::Created => 0,
            PipelineStage::SyllabusGenerated => 20,
            PipelineStage::ModulesFannedOut => 60,
            PipelineStage::Compiled => 80,
            PipelineStage::Persisted => 95,
            PipelineStage::Ready => 100,
        }
    }

    /// Status label reported on entering this stage.
    pub fn status(&self) -> &'static str {
        match self {
            PipelineStage::Created | PipelineStage::SyllabusGenerated => "creating",
            PipelineStage::ModulesFannedOut => "rendering",
            PipelineStage::Compiled | PipelineStage::Persisted => "uploading",
            PipelineStage::Ready => "ready",
        }
    }

    /// The stage that follows on the forward path, if any.
    pub fn next(&self) -> Option<PipelineStage> {
        match self {
            PipelineStage::Created => Some(PipelineStage::SyllabusGenerated),
            PipelineStage::SyllabusGenerated => Some(PipelineStage::ModulesFannedOut),
            PipelineStage::ModulesFannedOut => Some(PipelineStage::Compiled),
            PipelineStage::Compiled => Some(PipelineStage::Persisted),
            PipelineStage::Persisted => Some(PipelineStage::Ready),
            PipelineStage::Ready => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Created => "created",
            PipelineStage::SyllabusGenerated => "syllabus_generated",
            PipelineStage::ModulesFannedOut => "modules_fanned_out",
            PipelineStage::Compiled => "compiled",
            PipelineStage::Persisted => "persisted",
            PipelineStage::Ready => "ready",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final output of a build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoursePackage {
    pub topic: String,
    pub level: String,
    pub count_modules: usize,
    /// Sorted by module id.
    pub modules: Vec<ModuleArtifact>,
    pub persistence: PersistResult,
}

/// Everything the orchestrator knows about one build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineState {
    /// Stable identity of the build inputs, used as the checkpoint key.
    pub build_key: Uuid,
    pub course: CourseSpec,
    pub existing_course_id: Option<String>,
    pub stage: PipelineStage,
    pub syllabus: Vec<ModuleSpec>,
    pub modules: BTreeMap<String, ModuleArtifact>,
    pub package: Option<CoursePackage>,
}

impl PipelineState {
    /// Fresh state for a build request.
    pub fn new(course: CourseSpec, existing_course_id: Option<String>) -> Self {
        let build_key = build_key(&course, existing_course_id.as_deref());
        Self {
            build_key,
            course,
            existing_course_id,
            stage: PipelineStage::Created,
            syllabus: Vec::new(),
            modules: BTreeMap::new(),
            package: None,
        }
    }

    /// Artifacts in module id order.
    pub fn ordered_modules(&self) -> Vec<ModuleArtifact> {
        self.modules.values().cloned().collect()
    }
}

/// Deterministic key for a set of build inputs.
///
/// `Constraints` is a sorted map, so equal inputs serialize identically.
pub fn build_key(course: &CourseSpec, existing_course_id: Option<&str>) -> Uuid {
    let material = serde_json::json!({
        "topic": course.topic,
        "level": course.level,
        "constraints": course.constraints,
        "existing_course_id": existing_course_id,
    });
    Uuid::new_v5(&Uuid::NAMESPACE_OID, material.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constraints(value: serde_json::Value) -> Constraints {
        value.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_language_default_and_override() {
        let spec = CourseSpec::new("Graphs", "beginner", Constraints::new());
        assert_eq!(spec.language(), "en");

        let spec = CourseSpec::new("Graphs", "beginner", constraints(json!({"language": "fr"})));
        assert_eq!(spec.language(), "fr");
    }

    #[test]
    fn test_requested_module_count_forms() {
        let int = CourseSpec::new("t", "l", constraints(json!({"count_modules": 4})));
        assert_eq!(int.requested_module_count(), Some(4));

        let text = CourseSpec::new("t", "l", constraints(json!({"count_modules": " 7 "})));
        assert_eq!(text.requested_module_count(), Some(7));

        let junk = CourseSpec::new("t", "l", constraints(json!({"count_modules": "many"})));
        assert_eq!(junk.requested_module_count(), None);
    }

    #[test]
    fn test_constraint_list() {
        let spec = CourseSpec::new(
            "t",
            "l",
            constraints(json!({"prerequisites": ["algebra", "logic"], "audience": "teens"})),
        );
        assert_eq!(spec.constraint_list("prerequisites"), "algebra, logic");
        assert_eq!(spec.constraint_list("audience"), "teens");
        assert_eq!(spec.constraint_list("missing"), "");
    }

    #[test]
    fn test_stage_progression() {
        let mut stage = PipelineStage::Created;
        let mut percents = vec![stage.percent()];
        while let Some(next) = stage.next() {
            percents.push(next.percent());
            stage = next;
        }
        assert_eq!(stage, PipelineStage::Ready);
        assert_eq!(percents, vec![0, 20, 60, 80, 95, 100]);
    }

    #[test]
    fn test_build_key_stable() {
        let a = CourseSpec::new("t", "l", constraints(json!({"b": 1, "a": 2})));
        let b = CourseSpec::new("t", "l", constraints(json!({"a": 2, "b": 1})));
        assert_eq!(build_key(&a, None), build_key(&b, None));
        assert_ne!(build_key(&a, None), build_key(&a, Some("c1")));
    }

    #[test]
    fn test_artifact_has_source() {
        let spec = ModuleSpec {
            id: "m1".to_string(),
            title: "Intro".to_string(),
            objectives: vec![],
            outline: vec![],
        };
        let mut artifact = ModuleArtifact::new(&spec);
        assert!(!artifact.has_source());
        artifact.source_code = Some("   ".to_string());
        assert!(!artifact.has_source());
        artifact.source_code = Some("from manim import *".to_string());
        assert!(artifact.has_source());
    }

    #[test]
    fn test_state_roundtrips_through_json() {
        let state = PipelineState::new(CourseSpec::new("t", "l", Constraints::new()), None);
        let json = serde_json::to_string(&state).unwrap();
        let back: PipelineState = serde_json::from_str(&json).unwrap();
        assert_eq!(back, state);
    }
}
