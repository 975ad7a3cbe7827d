//! Course build orchestrator.
//!
//! This module provides the `CourseOrchestrator`, which coordinates:
//! - Collaborator wiring (gateway, writers, compiler, persistence)
//! - Progress fan-out to the caller and the course document
//! - Engine execution with a direct-executor fallback
//! - Single-module recompiles

use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::agents::{QaWriter, SceneSynthesizer, SyllabusGenerator, TextWriter};
use crate::error::PipelineError;
use crate::execution::CompilationEngine;
use crate::llm::{LlmProvider, RemoteCallGateway};
use crate::storage::{upload, ModuleRecord, PersistenceBackend};
use crate::utils::redact;

use super::config::ForgeConfig;
use super::engine::{select_engine, DirectExecutor, ExecutionEngine};
use super::progress::{BackendProgress, MonotonicProgress, ProgressReporter};
use super::stages::StageContext;
use super::types::{Constraints, CoursePackage, CourseSpec, PipelineStage, PipelineState};

/// Result of [`CourseOrchestrator::recompile_module`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecompileOutcome {
    pub media_path: PathBuf,
    /// Storage id of the uploaded video, when a backend is configured.
    pub storage_id: Option<String>,
}

/// Builds courses end to end.
pub struct CourseOrchestrator {
    syllabus: Arc<SyllabusGenerator>,
    text: Arc<TextWriter>,
    qa: Arc<QaWriter>,
    scenes: Arc<SceneSynthesizer>,
    compiler: Arc<CompilationEngine>,
    backend: Option<Arc<dyn PersistenceBackend>>,
    engine: Arc<dyn ExecutionEngine>,
}

impl std::fmt::Debug for CourseOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CourseOrchestrator")
            .field("engine", &self.engine.name())
            .field("compiler", &self.compiler)
            .field("backend", &self.backend.is_some())
            .finish_non_exhaustive()
    }
}

impl CourseOrchestrator {
    /// Wire collaborators from `config`, using the direct executor.
    pub fn new(provider: Arc<dyn LlmProvider>, config: &ForgeConfig) -> Result<Self, PipelineError> {
        let gateway = Arc::new(RemoteCallGateway::new(provider, config.gateway.clone()));
        let scenes = SceneSynthesizer::new(gateway.clone(), &config.models.scene)
            .map_err(|e| PipelineError::Setup(format!("scene validator: {e}")))?;
        let backend = config
            .persist
            .backend()?
            .map(|b| Arc::new(b) as Arc<dyn PersistenceBackend>);

        Ok(Self {
            syllabus: Arc::new(SyllabusGenerator::new(gateway.clone(), &config.models.syllabus)),
            text: Arc::new(TextWriter::new(gateway.clone(), &config.models.text)),
            qa: Arc::new(QaWriter::new(gateway, &config.models.text)),
            scenes: Arc::new(scenes),
            compiler: Arc::new(CompilationEngine::new(config.compile.clone())),
            backend,
            engine: Arc::new(DirectExecutor),
        })
    }

    /// Like [`CourseOrchestrator::new`], with the engine chosen by
    /// probing the configured checkpoint store.
    pub async fn from_config(
        provider: Arc<dyn LlmProvider>,
        config: &ForgeConfig,
    ) -> Result<Self, PipelineError> {
        let engine = select_engine(&config.engine).await;
        Ok(Self::new(provider, config)?.with_engine(engine))
    }

    pub fn with_engine(mut self, engine: Arc<dyn ExecutionEngine>) -> Self {
        self.engine = engine;
        self
    }

    pub fn with_compiler(mut self, compiler: CompilationEngine) -> Self {
        self.compiler = Arc::new(compiler);
        self
    }

    pub fn with_backend(mut self, backend: Option<Arc<dyn PersistenceBackend>>) -> Self {
        self.backend = backend;
        self
    }

    pub fn engine_name(&self) -> &'static str {
        self.engine.name()
    }

    pub fn compiler(&self) -> &CompilationEngine {
        &self.compiler
    }

    /// Build a course.
    ///
    /// Progress goes to `progress` and, when `existing_course_id` is set and
    /// a backend is configured, to that course document. If the selected
    /// engine itself fails, the build is rerun once through the direct
    /// executor from the initial state. On error the last percentage is
    /// reported again with status `failed`.
    pub async fn build(
        &self,
        topic: &str,
        level: &str,
        constraints: Constraints,
        progress: Option<Arc<dyn ProgressReporter>>,
        existing_course_id: Option<String>,
    ) -> Result<CoursePackage, PipelineError> {
        info!(
            topic,
            level,
            constraints = %serde_json::Value::Object(redact(&constraints)),
            engine = self.engine.name(),
            "Course build started"
        );

        let mut sinks: Vec<Arc<dyn ProgressReporter>> = progress.into_iter().collect();
        if let (Some(backend), Some(course_id)) = (&self.backend, &existing_course_id) {
            sinks.push(Arc::new(BackendProgress::new(backend.clone(), course_id.clone())));
        }
        let monitor = Arc::new(MonotonicProgress::new(sinks));

        let ctx = StageContext {
            syllabus: self.syllabus.clone(),
            text: self.text.clone(),
            qa: self.qa.clone(),
            scenes: self.scenes.clone(),
            compiler: self.compiler.clone(),
            backend: self.backend.clone(),
            progress: monitor.clone(),
        };

        let initial = PipelineState::new(CourseSpec::new(topic, level, constraints), existing_course_id);
        let outcome = match self.engine.run(initial.clone(), &ctx).await {
            Err(e @ (PipelineError::Engine { .. } | PipelineError::Checkpoint(_)))
                if self.engine.name() != DirectExecutor.name() =>
            {
                warn!(
                    engine = self.engine.name(),
                    error = %e,
                    "Engine failed, rerunning with direct executor"
                );
                DirectExecutor.run(initial, &ctx).await
            }
            other => other,
        };

        let mut state = match outcome {
            Ok(state) => state,
            Err(e) => {
                error!(topic, error = %e, "Course build failed");
                monitor.fail().await;
                return Err(e);
            }
        };

        let Some(package) = state.package.take() else {
            monitor.fail().await;
            return Err(PipelineError::MissingStageInput {
                stage: PipelineStage::Ready.to_string(),
                reason: "engine finished without a course package".to_string(),
            });
        };
        state.stage = PipelineStage::Ready;
        monitor
            .report(state.stage.percent(), state.stage.status())
            .await;

        info!(
            topic,
            modules = package.count_modules,
            course_id = ?package.persistence.course_id,
            "Course build ready"
        );
        Ok(package)
    }

    /// Recompile one module's scene and, with a backend, replace its video.
    pub async fn recompile_module(
        &self,
        course_id: &str,
        module_id: &str,
        source: &str,
        title: Option<&str>,
    ) -> Result<RecompileOutcome, PipelineError> {
        recompile_module(
            &self.compiler,
            self.backend.as_deref(),
            course_id,
            module_id,
            source,
            title,
        )
        .await
    }
}

/// Compile `source` for one module and replace its video in the backend.
///
/// No media is an error here, unlike during a build. Without a backend the
/// local media path is returned and nothing is uploaded.
pub async fn recompile_module(
    compiler: &CompilationEngine,
    backend: Option<&dyn PersistenceBackend>,
    course_id: &str,
    module_id: &str,
    source: &str,
    title: Option<&str>,
) -> Result<RecompileOutcome, PipelineError> {
    let title = title.filter(|t| !t.trim().is_empty()).unwrap_or(module_id);
    let media_path = compiler
        .compile_titled(module_id, title, source)
        .await
        .ok_or_else(|| PipelineError::CompileFailed(module_id.to_string()))?;

    let Some(backend) = backend else {
        info!(module_id, media = %media_path.display(), "Recompiled without persistence");
        return Ok(RecompileOutcome {
            media_path,
            storage_id: None,
        });
    };

    let bytes = tokio::fs::read(&media_path).await?;
    let storage_id = upload(backend, bytes, "video/mp4").await?;
    backend
        .upsert_module(&ModuleRecord::video_only(course_id, module_id, &storage_id))
        .await?;

    info!(course_id, module_id, storage_id = %storage_id, "Module video replaced");
    Ok(RecompileOutcome {
        media_path,
        storage_id: Some(storage_id),
    })
}
