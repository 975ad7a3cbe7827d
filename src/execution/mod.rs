//! Sandboxed compilation of scene source into video.
//!
//! The [`CompilationEngine`] runs each job in its own work directory and
//! walks an ordered cascade of [`RenderStrategy`] implementations:
//!
//! ```text
//! container (Docker, no network) → local runtime → placeholder card
//! ```
//!
//! # Example
//!
//! ```ignore
//! use course_forge::execution::{CompilationEngine, CompileConfig};
//!
//! let engine = CompilationEngine::new(CompileConfig::default());
//! if let Some(video) = engine.compile_titled("m1", "Binary Search", &source).await {
//!     println!("rendered {}", video.display());
//! }
//! ```

pub mod compile;
pub mod docker_client;
pub mod process;
pub mod resources;
pub mod strategies;

pub use compile::{
    ensure_entry_scene, safe_stem, CompilationEngine, CompilationJob, CompileConfig, JobOutcome,
    StrategyFailure, DEFAULT_COMPILE_CONCURRENCY,
};
pub use docker_client::{ContainerConfig, DockerClient};
pub use process::{run_process, which, ProcessOutput};
pub use resources::ExecutionLimits;
pub use strategies::{
    detect_local_runtime, ContainerStrategy, ContainerUser, LocalRuntime, LocalStrategy,
    PlaceholderStrategy, RenderJob, RenderStrategy, StrategyKind,
};
