//! Shared utility functions for course-forge.
//!
//! Extraction of JSON and source code from model responses, plus log
//! preview and redaction helpers.

pub mod extraction;
pub mod logging;

pub use extraction::{extract_code, extract_json_object, fenced_blocks, find_matching_brace, FencedBlock};
pub use logging::{preview, redact, DEFAULT_PREVIEW_CHARS};
