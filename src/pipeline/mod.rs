//! Course build pipeline.
//!
//! # Architecture
//!
//! - **Types**: the records threaded through a build
//! - **Stages**: syllabus, module fan-out, compilation, persistence
//! - **Engine**: drives the stages, directly or with SQLite checkpoints
//! - **Progress**: monotonic percentage reporting
//! - **Orchestrator**: wires collaborators and runs builds
//! - **Config**: environment-driven settings
//!
//! # Pipeline Flow
//!
//! ```text
//! created ─▶ syllabus_generated ─▶ modules_fanned_out ─▶ compiled ─▶ persisted ─▶ ready
//!    5%            20%                   60%            60..80%        95%        100%
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use course_forge::llm::OpenRouterProvider;
//! use course_forge::pipeline::{CourseOrchestrator, ForgeConfig, Constraints};
//! use std::sync::Arc;
//!
//! let config = ForgeConfig::from_env()?;
//! let provider = Arc::new(OpenRouterProvider::new(config.require_api_key()?)?);
//! let orchestrator = CourseOrchestrator::from_config(provider, &config).await?;
//!
//! let package = orchestrator
//!     .build("Binary search", "beginner", Constraints::new(), None, None)
//!     .await?;
//! println!("{} modules", package.count_modules);
//! ```

pub mod config;
pub mod engine;
pub mod orchestrator;
pub mod progress;
pub mod stages;
pub mod types;

pub use config::{ConfigError, EngineConfig, ForgeConfig, ModelConfig, PersistConfig};
pub use engine::{select_engine, CheckpointedEngine, DirectExecutor, ExecutionEngine};
pub use orchestrator::{recompile_module, CourseOrchestrator, RecompileOutcome};
pub use progress::{BackendProgress, FnProgress, MonotonicProgress, ProgressError, ProgressReporter};
pub use stages::{
    advance, compile_modules, fan_out_modules, generate_syllabus, persist_course, StageContext,
};
pub use types::{
    build_key, AuxiliaryAsset, Constraints, CoursePackage, CourseSpec, ModuleArtifact, ModuleSpec,
    PipelineStage, PipelineState, SceneOrigin,
};
