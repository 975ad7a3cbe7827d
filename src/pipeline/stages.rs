//! The four build stages.
//!
//! Each stage consumes a [`PipelineState`] and returns the next one. A
//! stage only reads what earlier stages produced, so any execution engine
//! can run, checkpoint or replay them.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::agents::{QaWriter, SceneSynthesizer, SyllabusGenerator, TextWriter};
use crate::error::PipelineError;
use crate::execution::CompilationEngine;
use crate::storage::{persist_course_and_modules, CoursePayload, PersistenceBackend};

use super::progress::MonotonicProgress;
use super::types::{
    CoursePackage, CourseSpec, ModuleArtifact, ModuleSpec, PipelineStage, PipelineState,
};

/// Collaborators shared by every stage of a build.
#[derive(Clone)]
pub struct StageContext {
    pub syllabus: Arc<SyllabusGenerator>,
    pub text: Arc<TextWriter>,
    pub qa: Arc<QaWriter>,
    pub scenes: Arc<SceneSynthesizer>,
    pub compiler: Arc<CompilationEngine>,
    pub backend: Option<Arc<dyn PersistenceBackend>>,
    pub progress: Arc<MonotonicProgress>,
}

impl std::fmt::Debug for StageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContext")
            .field("compiler", &self.compiler)
            .field("backend", &self.backend.is_some())
            .finish_non_exhaustive()
    }
}

/// Run the stage that follows `state.stage`.
pub async fn advance(state: PipelineState, ctx: &StageContext) -> Result<PipelineState, PipelineError> {
    match state.stage {
        PipelineStage::Created => generate_syllabus(state, ctx).await,
        PipelineStage::SyllabusGenerated => fan_out_modules(state, ctx).await,
        PipelineStage::ModulesFannedOut => compile_modules(state, ctx).await,
        PipelineStage::Compiled => persist_course(state, ctx).await,
        other => Err(PipelineError::MissingStageInput {
            stage: other.to_string(),
            reason: "no stage follows".to_string(),
        }),
    }
}

fn expect_stage(state: &PipelineState, expected: PipelineStage, stage: &str) -> Result<(), PipelineError> {
    if state.stage == expected {
        Ok(())
    } else {
        Err(PipelineError::MissingStageInput {
            stage: stage.to_string(),
            reason: format!("expected state at '{expected}', found '{}'", state.stage),
        })
    }
}

/// Produce the syllabus. Never fails on model output; malformed output
/// yields the fallback syllabus.
pub async fn generate_syllabus(
    mut state: PipelineState,
    ctx: &StageContext,
) -> Result<PipelineState, PipelineError> {
    expect_stage(&state, PipelineStage::Created, "syllabus")?;
    ctx.progress.report(5, "creating").await;

    let syllabus = ctx.syllabus.generate(&state.course).await;
    check_syllabus(&syllabus)?;
    info!(
        topic = %state.course.topic,
        modules = syllabus.len(),
        "Syllabus ready"
    );

    state.syllabus = syllabus;
    state.modules.clear();
    state.stage = PipelineStage::SyllabusGenerated;
    ctx.progress
        .report(state.stage.percent(), state.stage.status())
        .await;
    Ok(state)
}

fn check_syllabus(syllabus: &[ModuleSpec]) -> Result<(), PipelineError> {
    if syllabus.is_empty() {
        return Err(PipelineError::InvalidSyllabus("no modules".to_string()));
    }
    let mut seen = std::collections::HashSet::new();
    for module in syllabus {
        if !seen.insert(module.id.as_str()) {
            return Err(PipelineError::InvalidSyllabus(format!(
                "duplicate module id '{}'",
                module.id
            )));
        }
    }
    Ok(())
}

/// Generate text, scene source and Q&A for every module concurrently.
///
/// Text is written first because the scene prompt quotes it; scene and Q&A
/// then run side by side. The first task that fails or panics cancels the
/// rest and fails the stage.
pub async fn fan_out_modules(
    mut state: PipelineState,
    ctx: &StageContext,
) -> Result<PipelineState, PipelineError> {
    expect_stage(&state, PipelineStage::SyllabusGenerated, "fan-out")?;
    if state.syllabus.is_empty() {
        return Err(PipelineError::MissingStageInput {
            stage: "fan-out".to_string(),
            reason: "empty syllabus".to_string(),
        });
    }

    let course = Arc::new(state.course.clone());
    let mut tasks = JoinSet::new();
    let mut task_modules = std::collections::HashMap::new();

    for spec in state.syllabus.iter().cloned() {
        let module_id = spec.id.clone();
        let handle = tasks.spawn(module_task(spec, course.clone(), ctx.clone()));
        task_modules.insert(handle.id(), module_id);
    }

    let mut modules = BTreeMap::new();
    while let Some(joined) = tasks.join_next().await {
        let artifact = match joined {
            Ok(Ok(artifact)) => artifact,
            Ok(Err(e)) => {
                tasks.abort_all();
                return Err(e);
            }
            Err(join_error) => {
                tasks.abort_all();
                let module_id = task_modules
                    .get(&join_error.id())
                    .cloned()
                    .unwrap_or_else(|| "<unknown>".to_string());
                return Err(PipelineError::ModuleTask {
                    module_id,
                    reason: join_error.to_string(),
                });
            }
        };

        debug!(module_id = %artifact.module_id, "Module generated");
        if modules.contains_key(&artifact.module_id) {
            tasks.abort_all();
            return Err(PipelineError::ModuleTask {
                module_id: artifact.module_id,
                reason: "module produced twice".to_string(),
            });
        }
        modules.insert(artifact.module_id.clone(), artifact);
    }

    info!(modules = modules.len(), "Module generation complete");
    state.modules = modules;
    state.stage = PipelineStage::ModulesFannedOut;
    ctx.progress
        .report(state.stage.percent(), state.stage.status())
        .await;
    Ok(state)
}

async fn module_task(
    spec: ModuleSpec,
    course: Arc<CourseSpec>,
    ctx: StageContext,
) -> Result<ModuleArtifact, PipelineError> {
    if spec.id.trim().is_empty() || spec.title.trim().is_empty() {
        return Err(PipelineError::ModuleTask {
            module_id: spec.id.clone(),
            reason: "module spec without id or title".to_string(),
        });
    }

    let text = ctx.text.write(&spec, &course).await;
    let (scene, qa) = tokio::join!(
        ctx.scenes.synthesize(&spec, course.language(), Some(&text)),
        ctx.qa.write(&spec, &course),
    );
    debug!(
        module_id = %spec.id,
        attempts = scene.attempts,
        origin = ?scene.origin,
        "Scene synthesized"
    );

    let mut artifact = ModuleArtifact::new(&spec);
    artifact.text = Some(text);
    artifact.source_code = Some(scene.source);
    artifact.scene_origin = Some(scene.origin);
    artifact.auxiliary = Some(qa);
    Ok(artifact)
}

/// Completion notice from one compile task.
#[derive(Debug)]
struct CompileEvent {
    module_id: String,
    media: Option<PathBuf>,
}

/// Compile every module that has source.
///
/// Jobs run concurrently, bounded by the engine's permit set. Progress
/// moves from 60 to 80 as jobs complete, in completion order. A module
/// whose compile yields nothing keeps `video_path = None`.
pub async fn compile_modules(
    mut state: PipelineState,
    ctx: &StageContext,
) -> Result<PipelineState, PipelineError> {
    expect_stage(&state, PipelineStage::ModulesFannedOut, "compile")?;

    let jobs: Vec<(String, String, String)> = state
        .modules
        .values()
        .filter(|a| a.has_source())
        .map(|a| {
            (
                a.module_id.clone(),
                a.title.clone(),
                a.source_code.clone().unwrap_or_default(),
            )
        })
        .collect();
    let total = jobs.len().max(1);

    let (tx, mut rx) = mpsc::channel::<CompileEvent>(total);
    let mut tasks = JoinSet::new();
    for (module_id, title, source) in jobs {
        let compiler = ctx.compiler.clone();
        let tx = tx.clone();
        tasks.spawn(async move {
            let media = compiler.compile_titled(&module_id, &title, &source).await;
            // receiver only goes away if the stage itself was dropped
            let _ = tx.send(CompileEvent { module_id, media }).await;
        });
    }
    drop(tx);

    let mut done = 0usize;
    let mut rendered = 0usize;
    while let Some(event) = rx.recv().await {
        done += 1;
        if let Some(artifact) = state.modules.get_mut(&event.module_id) {
            if event.media.is_some() {
                rendered += 1;
            } else {
                warn!(module_id = %event.module_id, "Module compiled to no media");
            }
            artifact.video_path = event.media;
        }
        let percent = 60 + (done * 20 / total) as u8;
        ctx.progress
            .report(percent, &format!("compiling {done}/{total}"))
            .await;
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Compile task did not finish");
        }
    }

    info!(compiled = done, rendered, "Compilation complete");
    state.stage = PipelineStage::Compiled;
    ctx.progress
        .report(state.stage.percent(), state.stage.status())
        .await;
    Ok(state)
}

/// Persist the course and assemble the final package.
pub async fn persist_course(
    mut state: PipelineState,
    ctx: &StageContext,
) -> Result<PipelineState, PipelineError> {
    expect_stage(&state, PipelineStage::Compiled, "persist")?;

    let modules = state.ordered_modules();
    let payload = CoursePayload::new(&state.course, &modules);
    let persistence = persist_course_and_modules(
        ctx.backend.as_deref(),
        &payload,
        &modules,
        state.existing_course_id.as_deref(),
    )
    .await;

    state.package = Some(CoursePackage {
        topic: state.course.topic.clone(),
        level: state.course.level.clone(),
        count_modules: modules.len(),
        modules,
        persistence,
    });
    state.stage = PipelineStage::Persisted;
    ctx.progress
        .report(state.stage.percent(), state.stage.status())
        .await;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> ModuleSpec {
        ModuleSpec {
            id: id.to_string(),
            title: format!("Module {id}"),
            objectives: vec![],
            outline: vec![],
        }
    }

    #[test]
    fn test_check_syllabus() {
        assert!(check_syllabus(&[spec("m1"), spec("m2")]).is_ok());
        assert!(matches!(
            check_syllabus(&[]),
            Err(PipelineError::InvalidSyllabus(_))
        ));
        assert!(matches!(
            check_syllabus(&[spec("m1"), spec("m1")]),
            Err(PipelineError::InvalidSyllabus(_))
        ));
    }

    #[test]
    fn test_expect_stage_mismatch() {
        let state = PipelineState::new(
            CourseSpec::new("t", "l", Default::default()),
            None,
        );
        assert!(expect_stage(&state, PipelineStage::Created, "syllabus").is_ok());
        let err = expect_stage(&state, PipelineStage::Compiled, "persist").unwrap_err();
        assert!(matches!(err, PipelineError::MissingStageInput { .. }));
    }
}
