//! Generation agents: syllabus, lesson text, Q&A and scene synthesis.

pub mod error;
pub mod fallback_scenes;
pub mod qa_writer;
pub mod scene_validator;
pub mod scene_writer;
pub mod syllabus;
pub mod text_writer;

pub use error::{AgentError, AgentResult, CodeValidationError};
pub use fallback_scenes::{minimal_scene, rich_scene};
pub use qa_writer::{QaWriter, FALLBACK_QA};
pub use scene_validator::{check_syntax, SceneValidator, DENYLIST};
pub use scene_writer::{SceneSynthesizer, SynthesisOutcome};
pub use syllabus::{fallback_syllabus, parse_syllabus, SyllabusGenerator};
pub use text_writer::{TextWriter, FALLBACK_TEXT};
