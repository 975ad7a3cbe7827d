//! Sandboxed compilation engine.
//!
//! Each job gets an exclusive work directory, the scene is written to disk,
//! and the strategy cascade runs until one strategy yields a media file.
//! A process-wide permit set bounds the number of jobs in flight.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::error::StrategyError;

use super::resources::ExecutionLimits;
use super::strategies::{
    ContainerStrategy, ContainerUser, LocalStrategy, PlaceholderStrategy, RenderJob,
    RenderStrategy, StrategyKind,
};

/// Default number of concurrent compile jobs.
pub const DEFAULT_COMPILE_CONCURRENCY: usize = 2;

/// Marker preceding an injected entry scene.
const STUB_MARKER: &str = "# course-forge: injected entry scene";

/// Compilation engine settings.
#[derive(Debug, Clone, PartialEq)]
pub struct CompileConfig {
    /// Capacity of the compile permit set.
    pub concurrency: usize,
    /// Parent directory for per-job work directories and traces.
    pub work_root: PathBuf,
    pub docker_image: String,
    pub docker_user: ContainerUser,
    pub disable_docker: bool,
    pub disable_local: bool,
    /// Try the local runtime before the container when it is available.
    pub prefer_local: bool,
    pub render_timeout: Duration,
    pub pull_timeout: Duration,
    pub placeholder_timeout: Duration,
    pub limits: ExecutionLimits,
}

impl Default for CompileConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_COMPILE_CONCURRENCY,
            work_root: PathBuf::from("./tmp/manim_runs"),
            docker_image: "manimcommunity/manim:stable".to_string(),
            docker_user: ContainerUser::Host,
            disable_docker: false,
            disable_local: false,
            prefer_local: false,
            render_timeout: Duration::from_secs(300),
            pull_timeout: Duration::from_secs(600),
            placeholder_timeout: Duration::from_secs(60),
            limits: ExecutionLimits::default(),
        }
    }
}

/// Why one strategy did not produce media.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrategyFailure {
    pub strategy: StrategyKind,
    /// Skipped at probe time rather than attempted.
    pub skipped: bool,
    pub error: String,
}

/// How a compile job ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobOutcome {
    Rendered { media: PathBuf },
    Exhausted { failures: Vec<StrategyFailure> },
    /// The job never reached the cascade.
    Aborted { reason: String },
}

/// Record of one compile attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompilationJob {
    pub module_id: String,
    /// Source as written to disk, stub included.
    pub source: String,
    /// Exclusive work directory; `None` once removed or if never created.
    pub workdir: Option<PathBuf>,
    /// Strategy that produced the media.
    pub strategy: Option<StrategyKind>,
    pub outcome: JobOutcome,
}

impl CompilationJob {
    pub fn media_path(&self) -> Option<&Path> {
        match &self.outcome {
            JobOutcome::Rendered { media } => Some(media),
            JobOutcome::Exhausted { .. } | JobOutcome::Aborted { .. } => None,
        }
    }

    pub fn into_media_path(self) -> Option<PathBuf> {
        match self.outcome {
            JobOutcome::Rendered { media } => Some(media),
            JobOutcome::Exhausted { .. } | JobOutcome::Aborted { .. } => None,
        }
    }
}

/// Turns scene source into video through the strategy cascade.
pub struct CompilationEngine {
    permits: Arc<Semaphore>,
    strategies: Vec<Arc<dyn RenderStrategy>>,
    config: CompileConfig,
}

impl std::fmt::Debug for CompilationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kinds: Vec<StrategyKind> = self.strategies.iter().map(|s| s.kind()).collect();
        f.debug_struct("CompilationEngine")
            .field("strategies", &kinds)
            .field("available_permits", &self.permits.available_permits())
            .field("config", &self.config)
            .finish()
    }
}

impl CompilationEngine {
    /// Engine with the container, local and placeholder strategies.
    pub fn new(config: CompileConfig) -> Self {
        let strategies: Vec<Arc<dyn RenderStrategy>> = vec![
            Arc::new(
                ContainerStrategy::new(
                    config.docker_image.clone(),
                    config.docker_user.clone(),
                    config.limits.clone(),
                    config.render_timeout,
                    config.pull_timeout,
                )
                .with_enabled(!config.disable_docker),
            ),
            Arc::new(LocalStrategy::new(config.render_timeout).with_enabled(!config.disable_local)),
            Arc::new(PlaceholderStrategy::new(config.placeholder_timeout)),
        ];
        Self::with_strategies(config, strategies)
    }

    /// Engine with a custom cascade, in order.
    pub fn with_strategies(config: CompileConfig, strategies: Vec<Arc<dyn RenderStrategy>>) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            strategies,
            config,
        }
    }

    pub fn config(&self) -> &CompileConfig {
        &self.config
    }

    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Compile `source` for `module_id`; `None` when no strategy succeeded.
    pub async fn compile(&self, module_id: &str, source: &str) -> Option<PathBuf> {
        self.compile_titled(module_id, module_id, source).await
    }

    /// Like [`compile`](Self::compile) with a title for placeholder cards.
    pub async fn compile_titled(&self, module_id: &str, title: &str, source: &str) -> Option<PathBuf> {
        self.compile_job(module_id, title, source).await.into_media_path()
    }

    /// Run one job through the cascade and return its full record.
    pub async fn compile_job(&self, module_id: &str, title: &str, source: &str) -> CompilationJob {
        let source = ensure_entry_scene(source);
        let mut job = CompilationJob {
            module_id: module_id.to_string(),
            source,
            workdir: None,
            strategy: None,
            outcome: JobOutcome::Exhausted { failures: Vec::new() },
        };

        let _permit = match self.permits.acquire().await {
            Ok(permit) => permit,
            Err(_) => {
                job.outcome = JobOutcome::Aborted {
                    reason: "compile permit set closed".to_string(),
                };
                return job;
            }
        };

        let render = match self.prepare(module_id, title, &job.source).await {
            Ok(render) => render,
            Err(e) => {
                tracing::error!(module_id, error = %e, "Failed to prepare work directory");
                job.outcome = JobOutcome::Aborted { reason: e.to_string() };
                return job;
            }
        };
        job.workdir = Some(render.workdir.clone());

        let mut failures = Vec::new();
        for strategy in self.ordered_strategies().await {
            let kind = strategy.kind();

            if let Err(e) = strategy.probe().await {
                tracing::debug!(module_id, strategy = %kind, reason = %e, "Strategy skipped");
                if !e.is_skip() {
                    self.write_trace(&render, kind, &e).await;
                }
                failures.push(StrategyFailure {
                    strategy: kind,
                    skipped: e.is_skip(),
                    error: e.to_string(),
                });
                continue;
            }

            tracing::info!(module_id, strategy = %kind, "Rendering");
            match strategy.render(&render).await {
                Ok(media) => {
                    tracing::info!(module_id, strategy = %kind, media = %media.display(), "Render ok");
                    job.strategy = Some(kind);
                    job.outcome = JobOutcome::Rendered { media };
                    return job;
                }
                Err(e) => {
                    tracing::warn!(module_id, strategy = %kind, error = %e, "Render failed");
                    self.write_trace(&render, kind, &e).await;
                    failures.push(StrategyFailure {
                        strategy: kind,
                        skipped: e.is_skip(),
                        error: e.to_string(),
                    });
                }
            }
        }

        tracing::warn!(module_id, attempted = failures.len(), "No strategy produced media");
        remove_workdir(render.workdir).await;
        job.workdir = None;
        job.outcome = JobOutcome::Exhausted { failures };
        job
    }

    /// Strategies in cascade order, with the local runtime promoted when
    /// preferred and available.
    async fn ordered_strategies(&self) -> Vec<Arc<dyn RenderStrategy>> {
        let mut ordered = self.strategies.clone();
        if !self.config.prefer_local {
            return ordered;
        }
        let Some(pos) = ordered.iter().position(|s| s.kind() == StrategyKind::Local) else {
            return ordered;
        };
        if pos > 0 && ordered[pos].probe().await.is_ok() {
            let local = ordered.remove(pos);
            ordered.insert(0, local);
        }
        ordered
    }

    /// Create the work directory and write the scene file.
    async fn prepare(&self, module_id: &str, title: &str, source: &str) -> Result<RenderJob, StrategyError> {
        let root = self.config.work_root.clone();
        let stem = safe_stem(module_id);
        let source = source.to_string();

        let (workdir, source_file) = tokio::task::spawn_blocking(move || -> std::io::Result<(PathBuf, PathBuf)> {
            std::fs::create_dir_all(&root)?;
            let dir = tempfile::Builder::new()
                .prefix(&format!("manim_{}_", stem))
                .tempdir_in(&root)?
                .keep();
            let dir = std::fs::canonicalize(&dir)?;
            let file = dir.join(format!("{}.py", stem));
            std::fs::write(&file, source)?;
            Ok((dir, file))
        })
        .await
        .map_err(|e| StrategyError::Io(std::io::Error::other(e)))??;

        Ok(RenderJob {
            module_id: module_id.to_string(),
            title: title.to_string(),
            output_name: format!("{}.mp4", safe_stem(module_id)),
            workdir,
            source_file,
        })
    }

    /// Record a strategy failure under `{work_root}/traces/`.
    async fn write_trace(&self, job: &RenderJob, kind: StrategyKind, error: &StrategyError) {
        let dir = self.config.work_root.join("traces");
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
        let path = dir.join(format!("{}_{}_{}.log", safe_stem(&job.module_id), kind, stamp));
        let body = trace_body(job, kind, error);

        let result = tokio::task::spawn_blocking(move || -> std::io::Result<PathBuf> {
            std::fs::create_dir_all(&dir)?;
            std::fs::write(&path, body)?;
            Ok(path)
        })
        .await;

        match result {
            Ok(Ok(path)) => tracing::debug!(trace = %path.display(), "Wrote strategy trace"),
            Ok(Err(e)) => tracing::warn!(error = %e, "Failed to write strategy trace"),
            Err(e) => tracing::warn!(error = %e, "Trace writer task failed"),
        }
    }
}

fn trace_body(job: &RenderJob, kind: StrategyKind, error: &StrategyError) -> String {
    let mut body = format!(
        "module: {}\nstrategy: {}\nworkdir: {}\nsource: {}\nerror: {}\n",
        job.module_id,
        kind,
        job.workdir.display(),
        job.source_file.display(),
        error
    );
    if let StrategyError::NonZeroExit {
        code,
        command,
        stdout,
        stderr,
    } = error
    {
        body.push_str(&format!(
            "command: {command}\nexit code: {code}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}\n"
        ));
    }
    body
}

async fn remove_workdir(dir: PathBuf) {
    let result = tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&dir)).await;
    if let Ok(Err(e)) = result {
        tracing::warn!(error = %e, "Failed to remove work directory");
    }
}

/// File-name-safe form of a module id.
pub fn safe_stem(module_id: &str) -> String {
    let stem: String = module_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();
    if stem.is_empty() {
        "module".to_string()
    } else {
        stem
    }
}

/// Append a minimal `Lesson` scene when the source does not define one.
pub fn ensure_entry_scene(source: &str) -> String {
    if source.contains("class Lesson(") {
        return source.to_string();
    }
    format!(
        "{}\n\n{}\nfrom manim import *\n\n\nclass Lesson(Scene):\n    def construct(self):\n        self.add(Text('Lesson'))\n        self.wait(1)\n",
        source.trim_end(),
        STUB_MARKER
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeStrategy {
        kind: StrategyKind,
        available: bool,
        succeed: bool,
        renders: AtomicUsize,
    }

    impl FakeStrategy {
        fn new(kind: StrategyKind, available: bool, succeed: bool) -> Arc<Self> {
            Arc::new(Self {
                kind,
                available,
                succeed,
                renders: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl RenderStrategy for FakeStrategy {
        fn kind(&self) -> StrategyKind {
            self.kind
        }

        async fn probe(&self) -> Result<(), StrategyError> {
            if self.available {
                Ok(())
            } else {
                Err(StrategyError::Unavailable("fake".to_string()))
            }
        }

        async fn render(&self, job: &RenderJob) -> Result<PathBuf, StrategyError> {
            self.renders.fetch_add(1, Ordering::SeqCst);
            if !self.succeed {
                return Err(StrategyError::NonZeroExit {
                    code: 1,
                    command: "manim -qL -o out.mp4 scene.py Lesson".to_string(),
                    stdout: "Rendering Lesson".to_string(),
                    stderr: "boom".to_string(),
                });
            }
            let out = job.workdir.join(&job.output_name);
            std::fs::write(&out, self.kind.as_str())?;
            Ok(out)
        }
    }

    fn config(root: &Path) -> CompileConfig {
        CompileConfig {
            work_root: root.to_path_buf(),
            ..CompileConfig::default()
        }
    }

    #[test]
    fn test_ensure_entry_scene() {
        let wrapped = ensure_entry_scene("x = 1\n");
        assert!(wrapped.starts_with("x = 1\n\n# course-forge"));
        assert!(wrapped.contains("class Lesson(Scene):"));

        let scene = "from manim import *\nclass Lesson(Scene):\n    pass\n";
        assert_eq!(ensure_entry_scene(scene), scene);
    }

    #[test]
    fn test_safe_stem() {
        assert_eq!(safe_stem("m1"), "m1");
        assert_eq!(safe_stem("../etc/passwd"), "___etc_passwd");
        assert_eq!(safe_stem(""), "module");
    }

    #[tokio::test]
    async fn test_first_successful_strategy_wins() {
        let root = tempfile::tempdir().unwrap();
        let container = FakeStrategy::new(StrategyKind::Container, true, true);
        let local = FakeStrategy::new(StrategyKind::Local, true, true);
        let engine = CompilationEngine::with_strategies(
            config(root.path()),
            vec![container.clone() as Arc<dyn RenderStrategy>, local.clone()],
        );

        let job = engine.compile_job("m1", "Intro", "from manim import *\n").await;
        assert_eq!(job.strategy, Some(StrategyKind::Container));
        let media = job.media_path().unwrap();
        assert!(media.ends_with("m1.mp4"));
        assert!(media.starts_with(std::fs::canonicalize(root.path()).unwrap()));
        assert_eq!(local.renders.load(Ordering::SeqCst), 0);

        let workdir = job.workdir.unwrap();
        let name = workdir.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("manim_m1_"));
        let written = std::fs::read_to_string(workdir.join("m1.py")).unwrap();
        assert!(written.contains("class Lesson(Scene):"));
    }

    #[tokio::test]
    async fn test_failure_cascades_and_writes_trace() {
        let root = tempfile::tempdir().unwrap();
        let engine = CompilationEngine::with_strategies(
            config(root.path()),
            vec![
                FakeStrategy::new(StrategyKind::Container, true, false) as Arc<dyn RenderStrategy>,
                FakeStrategy::new(StrategyKind::Placeholder, true, true),
            ],
        );

        let job = engine.compile_job("m2", "Two", "print(1)").await;
        assert_eq!(job.strategy, Some(StrategyKind::Placeholder));

        let traces: Vec<_> = std::fs::read_dir(root.path().join("traces"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(traces.len(), 1);
        assert!(traces[0].starts_with("m2_container_"));

        let body = std::fs::read_to_string(root.path().join("traces").join(&traces[0])).unwrap();
        assert!(body.contains("module: m2\n"));
        assert!(body.contains("command: manim -qL -o out.mp4 scene.py Lesson\n"));
        assert!(body.contains("exit code: 1\n"));
        assert!(body.contains("--- stdout ---\nRendering Lesson\n"));
        assert!(body.contains("--- stderr ---\nboom\n"));
    }

    #[tokio::test]
    async fn test_all_unavailable_returns_none_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let engine = CompilationEngine::with_strategies(
            config(root.path()),
            vec![
                FakeStrategy::new(StrategyKind::Container, false, true) as Arc<dyn RenderStrategy>,
                FakeStrategy::new(StrategyKind::Local, false, true),
                FakeStrategy::new(StrategyKind::Placeholder, false, true),
            ],
        );

        let job = engine.compile_job("m3", "Three", "print(1)").await;
        assert!(job.media_path().is_none());
        assert!(job.workdir.is_none());
        match &job.outcome {
            JobOutcome::Exhausted { failures } => {
                assert_eq!(failures.len(), 3);
                assert!(failures.iter().all(|f| f.skipped));
            }
            other => panic!("unexpected outcome {other:?}"),
        }

        let leftovers = std::fs::read_dir(root.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().starts_with("manim_"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
        assert_eq!(engine.compile("m3", "print(1)").await, None);
    }

    #[tokio::test]
    async fn test_prefer_local_promotes_available_runtime() {
        let root = tempfile::tempdir().unwrap();
        let container = FakeStrategy::new(StrategyKind::Container, true, true);
        let local = FakeStrategy::new(StrategyKind::Local, true, true);
        let engine = CompilationEngine::with_strategies(
            CompileConfig {
                prefer_local: true,
                ..config(root.path())
            },
            vec![container.clone() as Arc<dyn RenderStrategy>, local.clone()],
        );

        let job = engine.compile_job("m4", "Four", "print(1)").await;
        assert_eq!(job.strategy, Some(StrategyKind::Local));
        assert_eq!(container.renders.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_workdirs_are_exclusive() {
        let root = tempfile::tempdir().unwrap();
        let engine = CompilationEngine::with_strategies(
            config(root.path()),
            vec![FakeStrategy::new(StrategyKind::Placeholder, true, true) as Arc<dyn RenderStrategy>],
        );

        let a = engine.compile_job("m1", "A", "print(1)").await;
        let b = engine.compile_job("m1", "A", "print(1)").await;
        assert_ne!(a.workdir, b.workdir);
    }
}
