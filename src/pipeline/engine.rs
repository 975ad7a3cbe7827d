//! Execution engines that drive the stage sequence.
//!
//! [`DirectExecutor`] runs the stages back to back. [`CheckpointedEngine`]
//! runs the same stages but saves the state after each one, so a build with
//! identical inputs resumes where the last attempt stopped.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::storage::CheckpointStore;

use super::config::EngineConfig;
use super::stages::{advance, StageContext};
use super::types::{PipelineStage, PipelineState};

/// Runs a build from its current stage through persistence.
#[async_trait]
pub trait ExecutionEngine: Send + Sync {
    fn name(&self) -> &'static str;

    /// Advance `state` until it is [`PipelineStage::Persisted`].
    async fn run(&self, state: PipelineState, ctx: &StageContext) -> Result<PipelineState, PipelineError>;
}

/// Plain in-order stage execution.
#[derive(Debug, Clone, Copy, Default)]
pub struct DirectExecutor;

#[async_trait]
impl ExecutionEngine for DirectExecutor {
    fn name(&self) -> &'static str {
        "direct"
    }

    async fn run(&self, mut state: PipelineState, ctx: &StageContext) -> Result<PipelineState, PipelineError> {
        while state.stage < PipelineStage::Persisted {
            state = advance(state, ctx).await?;
        }
        Ok(state)
    }
}

/// Stage execution with a SQLite checkpoint after every stage before
/// persistence.
#[derive(Debug, Clone)]
pub struct CheckpointedEngine {
    store: CheckpointStore,
}

impl CheckpointedEngine {
    pub fn new(store: CheckpointStore) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }
}

#[async_trait]
impl ExecutionEngine for CheckpointedEngine {
    fn name(&self) -> &'static str {
        "checkpointed"
    }

    async fn run(&self, state: PipelineState, ctx: &StageContext) -> Result<PipelineState, PipelineError> {
        let build_key = state.build_key;
        let mut state = match self.store.load(build_key).await? {
            Some(saved) if saved.stage > state.stage && saved.stage <= PipelineStage::Persisted => {
                info!(
                    build_key = %build_key,
                    stage = %saved.stage,
                    "Resuming build from checkpoint"
                );
                ctx.progress
                    .report(saved.stage.percent(), saved.stage.status())
                    .await;
                saved
            }
            _ => state,
        };

        while state.stage < PipelineStage::Persisted {
            state = advance(state, ctx).await?;
            if state.stage < PipelineStage::Persisted {
                self.store.save(&state).await?;
            }
        }

        // The course is persisted; checkpoint errors past this point must not cause a rerun.
        if let Err(e) = self.store.clear(build_key).await {
            warn!(build_key = %build_key, error = %e, "Failed to clear checkpoint after persistence");
        }
        Ok(state)
    }
}

/// Pick the engine for `config`.
///
/// The checkpointed engine is used when its store opens; otherwise, or
/// when no checkpoint database is configured, the direct executor.
pub async fn select_engine(config: &EngineConfig) -> Arc<dyn ExecutionEngine> {
    let Some(path) = config.checkpoint_db.as_deref() else {
        info!("Checkpoints disabled, using direct executor");
        return Arc::new(DirectExecutor);
    };

    match open_store(path).await {
        Ok(store) => {
            info!(path = %path.display(), "Using checkpointed engine");
            Arc::new(CheckpointedEngine::new(store))
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Checkpoint store unavailable, using direct executor");
            Arc::new(DirectExecutor)
        }
    }
}

async fn open_store(path: &Path) -> Result<CheckpointStore, PipelineError> {
    let path = path.to_str().ok_or_else(|| PipelineError::Engine {
        engine: "checkpointed".to_string(),
        reason: format!("non UTF-8 checkpoint path {}", path.display()),
    })?;
    Ok(CheckpointStore::open(path).await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MEMORY_DATABASE;
    use std::path::PathBuf;

    #[tokio::test]
    async fn test_select_direct_when_disabled() {
        let engine = select_engine(&EngineConfig { checkpoint_db: None }).await;
        assert_eq!(engine.name(), "direct");
    }

    #[tokio::test]
    async fn test_select_checkpointed_for_memory_db() {
        let engine = select_engine(&EngineConfig {
            checkpoint_db: Some(PathBuf::from(MEMORY_DATABASE)),
        })
        .await;
        assert_eq!(engine.name(), "checkpointed");
    }

    #[tokio::test]
    async fn test_select_checkpointed_for_file_db() {
        let dir = tempfile::tempdir().unwrap();
        let engine = select_engine(&EngineConfig {
            checkpoint_db: Some(dir.path().join("state.sqlite")),
        })
        .await;
        assert_eq!(engine.name(), "checkpointed");
        assert!(dir.path().join("state.sqlite").exists());
    }

    #[tokio::test]
    async fn test_unopenable_db_falls_back_to_direct() {
        let dir = tempfile::tempdir().unwrap();
        let engine = select_engine(&EngineConfig {
            checkpoint_db: Some(dir.path().join("missing").join("state.sqlite")),
        })
        .await;
        assert_eq!(engine.name(), "direct");
    }
}
