//! Course persistence and build checkpoints.
//!
//! # Overview
//!
//! - **Backend**: the [`PersistenceBackend`] trait and its HTTP client
//! - **Persist**: the upload/upsert/finalize flow for a finished course
//! - **Checkpoint**: SQLite store of in-progress [`PipelineState`]s
//!
//! # Usage
//!
//! ```rust,ignore
//! use course_forge::storage::{persist_course_and_modules, CoursePayload, HttpPersistenceBackend};
//!
//! let backend = HttpPersistenceBackend::new("https://example.convex.cloud", Some(key), None)?;
//! let payload = CoursePayload::new(&course, &modules);
//! let result = persist_course_and_modules(Some(&backend), &payload, &modules, None).await;
//! ```
//!
//! [`PipelineState`]: crate::pipeline::PipelineState

pub mod backend;
pub mod checkpoint;
pub mod persist;

pub use backend::{HttpPersistenceBackend, PersistenceBackend};
pub use checkpoint::{CheckpointError, CheckpointStore, MEMORY_DATABASE};
pub use persist::{
    persist_course_and_modules, upload, CoursePayload, ModuleRecord, PersistResult, StorageIds,
};
