//! Render strategies tried in order by the compilation engine.
//!
//! - [`ContainerStrategy`]: the renderer inside an isolated Docker container
//! - [`LocalStrategy`]: the renderer from a local Python installation
//! - [`PlaceholderStrategy`]: an ffmpeg title card, the last resort

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::error::StrategyError;
use crate::utils::preview;

use super::docker_client::{ContainerConfig, DockerClient};
use super::process::{command_line, run_process, which};
use super::resources::ExecutionLimits;

/// Scene class every render invocation targets.
pub const ENTRY_SCENE: &str = "Lesson";

/// Mount point of the work directory inside the container.
const CONTAINER_WORKDIR: &str = "/manim";

/// Identifies a strategy in logs, traces and job records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    Container,
    Local,
    Placeholder,
}

impl StrategyKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyKind::Container => "container",
            StrategyKind::Local => "local",
            StrategyKind::Placeholder => "placeholder",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a strategy needs to render one module.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub module_id: String,
    /// Title shown on placeholder cards.
    pub title: String,
    /// Exclusive, absolute work directory.
    pub workdir: PathBuf,
    /// Scene file inside `workdir`.
    pub source_file: PathBuf,
    /// Output file name, e.g. `m1.mp4`.
    pub output_name: String,
}

impl RenderJob {
    fn source_stem(&self) -> String {
        self.source_file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.module_id.clone())
    }

    fn source_name(&self) -> String {
        self.source_file
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| format!("{}.py", self.module_id))
    }

    /// Rendered file, if present in one of the known layouts.
    ///
    /// Checks the renderer's nested `media/videos/{stem}/480p15/` layout
    /// first, then flat output in the work directory.
    pub fn discover_output(&self) -> Option<PathBuf> {
        let nested = self
            .workdir
            .join("media")
            .join("videos")
            .join(self.source_stem())
            .join("480p15")
            .join(&self.output_name);
        let flat = self.workdir.join(&self.output_name);
        [nested, flat].into_iter().find(|p| p.is_file())
    }

    /// Renderer arguments after the program (and any `-m manim` prefix).
    fn render_args(&self, source: String) -> Vec<String> {
        vec![
            "-qL".to_string(),
            "-o".to_string(),
            self.output_name.clone(),
            source,
            ENTRY_SCENE.to_string(),
        ]
    }
}

/// One way of turning a scene file into a video.
#[async_trait]
pub trait RenderStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Check availability. `Disabled`/`Unavailable` errors mean "skip".
    async fn probe(&self) -> Result<(), StrategyError>;

    /// Render `job`, returning the produced media file.
    async fn render(&self, job: &RenderJob) -> Result<PathBuf, StrategyError>;
}

/// Which user a render container runs as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerUser {
    /// The uid:gid owning the work directory.
    Host,
    /// Whatever the image declares.
    ImageDefault,
    /// An explicit `uid:gid` or user name.
    Explicit(String),
}

impl ContainerUser {
    /// Parse `MANIM_DOCKER_USER`: `host`, `none`/empty, or an explicit user.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "host" => ContainerUser::Host,
            "" | "none" | "default" => ContainerUser::ImageDefault,
            _ => ContainerUser::Explicit(value.trim().to_string()),
        }
    }

    fn resolve(&self, workdir: &Path) -> Option<String> {
        match self {
            ContainerUser::Host => owner_of(workdir),
            ContainerUser::ImageDefault => None,
            ContainerUser::Explicit(user) => Some(user.clone()),
        }
    }
}

#[cfg(unix)]
fn owner_of(path: &Path) -> Option<String> {
    use std::os::unix::fs::MetadataExt;
    let meta = std::fs::metadata(path).ok()?;
    Some(format!("{}:{}", meta.uid(), meta.gid()))
}

#[cfg(not(unix))]
fn owner_of(_path: &Path) -> Option<String> {
    None
}

/// Renders inside a network-isolated Docker container.
pub struct ContainerStrategy {
    image: String,
    user: ContainerUser,
    limits: ExecutionLimits,
    enabled: bool,
    render_timeout: Duration,
    pull_timeout: Duration,
    client: OnceCell<DockerClient>,
    /// Outcome of the one image check and pull, failures included.
    image_ready: OnceCell<Result<(), String>>,
}

impl std::fmt::Debug for ContainerStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerStrategy")
            .field("image", &self.image)
            .field("enabled", &self.enabled)
            .finish_non_exhaustive()
    }
}

impl ContainerStrategy {
    pub fn new(
        image: impl Into<String>,
        user: ContainerUser,
        limits: ExecutionLimits,
        render_timeout: Duration,
        pull_timeout: Duration,
    ) -> Self {
        Self {
            image: image.into(),
            user,
            limits,
            enabled: true,
            render_timeout,
            pull_timeout,
            client: OnceCell::new(),
            image_ready: OnceCell::new(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    async fn client(&self) -> Result<&DockerClient, StrategyError> {
        self.client
            .get_or_try_init(|| async {
                let client = DockerClient::new()?;
                client.ping().await?;
                Ok(client)
            })
            .await
    }

    /// Make sure the image is present, pulling it at most once per engine.
    ///
    /// A failed pull is remembered; later jobs skip the container without
    /// contacting the registry again.
    async fn ensure_image(&self, client: &DockerClient) -> Result<(), StrategyError> {
        fetch_once(&self.image_ready, &self.image, || async {
            if client.image_exists(&self.image).await {
                return Ok(());
            }
            tracing::info!(image = %self.image, "Pulling render image");
            tokio::time::timeout(self.pull_timeout, client.pull_image(&self.image))
                .await
                .map_err(|_| StrategyError::Timeout {
                    seconds: self.pull_timeout.as_secs(),
                })?
        })
        .await
    }

    async fn run_to_exit(&self, client: &DockerClient, id: &str) -> Result<i64, StrategyError> {
        client.start_container(id).await?;
        tokio::time::timeout(self.render_timeout, client.wait_container(id))
            .await
            .map_err(|_| StrategyError::Timeout {
                seconds: self.render_timeout.as_secs(),
            })?
    }
}

/// Run `fetch` once for the lifetime of `cell` and replay its outcome.
///
/// A cached failure comes back as [`StrategyError::Unavailable`] so the
/// cascade skips the container.
async fn fetch_once<F, Fut>(
    cell: &OnceCell<Result<(), String>>,
    image: &str,
    fetch: F,
) -> Result<(), StrategyError>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<(), StrategyError>>,
{
    let outcome = cell
        .get_or_init(|| async move {
            fetch().await.map_err(|e| {
                tracing::warn!(image, error = %e, "Render image unavailable");
                e.to_string()
            })
        })
        .await;
    outcome
        .clone()
        .map_err(|reason| StrategyError::Unavailable(format!("image {image}: {reason}")))
}

#[async_trait]
impl RenderStrategy for ContainerStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Container
    }

    async fn probe(&self) -> Result<(), StrategyError> {
        if !self.enabled {
            return Err(StrategyError::Disabled);
        }
        self.client().await.map(|_| ())
    }

    async fn render(&self, job: &RenderJob) -> Result<PathBuf, StrategyError> {
        let client = self.client().await?;
        self.ensure_image(client).await?;

        let short_id = Uuid::new_v4().simple().to_string();
        let name = format!("course-forge-{}-{}", job.source_stem(), &short_id[..8]);
        let args = job.render_args(format!("{}/{}", CONTAINER_WORKDIR, job.source_name()));
        let command = format!(
            "docker run --network none {} {}",
            self.image,
            command_line("manim", &args)
        );
        let cmd = std::iter::once("manim".to_string()).chain(args).collect();

        let mut config = ContainerConfig::new(name, &self.image)
            .with_cmd(cmd)
            .with_working_dir(CONTAINER_WORKDIR)
            .with_volumes(vec![format!("{}:{}", job.workdir.display(), CONTAINER_WORKDIR)])
            .with_limits(self.limits.clone())
            .with_network_mode("none");
        if let Some(user) = self.user.resolve(&job.workdir) {
            config = config.with_user(user);
        }

        let id = client.create_container(&config).await?;
        let exit = self.run_to_exit(client, &id).await;
        let logs = client.get_logs(&id).await.unwrap_or_default();
        if let Err(e) = client.remove_container(&id, true).await {
            tracing::warn!(container = %id, error = %e, "Failed to remove render container");
        }

        tracing::debug!(
            module_id = %job.module_id,
            stdout = %preview(&logs.stdout, None),
            stderr = %preview(&logs.stderr, None),
            "Container render finished"
        );

        match exit? {
            0 => job.discover_output().ok_or(StrategyError::OutputMissing),
            code => Err(StrategyError::NonZeroExit {
                code,
                command,
                stdout: preview(&logs.stdout, None),
                stderr: preview(&logs.stderr, None),
            }),
        }
    }
}

/// How to invoke a local renderer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRuntime {
    pub program: PathBuf,
    /// Arguments placed before the renderer's own, e.g. `-m manim`.
    pub prefix: Vec<String>,
}

/// Renders with a renderer installed on this machine.
pub struct LocalStrategy {
    enabled: bool,
    timeout: Duration,
    runtime: OnceCell<Option<LocalRuntime>>,
}

impl std::fmt::Debug for LocalStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStrategy")
            .field("enabled", &self.enabled)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl LocalStrategy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            enabled: true,
            timeout,
            runtime: OnceCell::new(),
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Use a fixed runtime instead of detecting one.
    pub fn with_runtime(self, runtime: LocalRuntime) -> Self {
        Self {
            runtime: OnceCell::new_with(Some(Some(runtime))),
            ..self
        }
    }

    async fn runtime(&self) -> Option<&LocalRuntime> {
        self.runtime.get_or_init(detect_local_runtime).await.as_ref()
    }
}

/// Find a local renderer.
///
/// Order: a project `.venv` interpreter, `python3` when it can import the
/// renderer, then a bare `manim` on `PATH`.
pub async fn detect_local_runtime() -> Option<LocalRuntime> {
    let module_prefix = vec!["-m".to_string(), "manim".to_string()];

    let venv = PathBuf::from(".venv").join("bin").join("python");
    if venv.is_file() {
        let program = std::fs::canonicalize(&venv).unwrap_or(venv);
        return Some(LocalRuntime {
            program,
            prefix: module_prefix,
        });
    }

    if let Some(python) = which("python3") {
        let check = vec!["-c".to_string(), "import manim".to_string()];
        match run_process(&python, &check, None, Duration::from_secs(30)).await {
            Ok(output) if output.success() => {
                return Some(LocalRuntime {
                    program: python,
                    prefix: module_prefix,
                });
            }
            _ => tracing::debug!("python3 cannot import manim"),
        }
    }

    which("manim").map(|program| LocalRuntime {
        program,
        prefix: Vec::new(),
    })
}

#[async_trait]
impl RenderStrategy for LocalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Local
    }

    async fn probe(&self) -> Result<(), StrategyError> {
        if !self.enabled {
            return Err(StrategyError::Disabled);
        }
        match self.runtime().await {
            Some(_) => Ok(()),
            None => Err(StrategyError::Unavailable(
                "no local manim runtime found".to_string(),
            )),
        }
    }

    async fn render(&self, job: &RenderJob) -> Result<PathBuf, StrategyError> {
        let runtime = self.runtime().await.ok_or_else(|| {
            StrategyError::Unavailable("no local manim runtime found".to_string())
        })?;

        let mut args = runtime.prefix.clone();
        args.extend(job.render_args(job.source_name()));

        let output = run_process(&runtime.program, &args, Some(&job.workdir), self.timeout).await?;
        if !output.success() {
            return Err(output.exit_error(command_line(&runtime.program.to_string_lossy(), &args)));
        }

        job.discover_output().ok_or(StrategyError::OutputMissing)
    }
}

/// Writes a plain title card with ffmpeg.
pub struct PlaceholderStrategy {
    timeout: Duration,
    ffmpeg: OnceCell<Option<PathBuf>>,
}

impl std::fmt::Debug for PlaceholderStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaceholderStrategy")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Card background, size and length.
const CARD_SOURCE: &str = "color=c=0x1e1e2e:s=854x480:d=5";

impl PlaceholderStrategy {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            ffmpeg: OnceCell::new(),
        }
    }

    async fn ffmpeg(&self) -> Option<&PathBuf> {
        self.ffmpeg.get_or_init(|| async { which("ffmpeg") }).await.as_ref()
    }

    async fn run_ffmpeg(&self, ffmpeg: &Path, args: Vec<String>) -> Result<(), StrategyError> {
        let output = run_process(ffmpeg, &args, None, self.timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(output.exit_error(command_line(&ffmpeg.to_string_lossy(), &args)))
        }
    }
}

/// Arguments for a card, with or without the title overlay.
pub fn placeholder_args(title: Option<&str>, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-y", "-f", "lavfi", "-i", CARD_SOURCE]
        .iter()
        .map(|s| s.to_string())
        .collect();
    if let Some(title) = title {
        args.push("-vf".to_string());
        args.push(format!(
            "drawtext=text='{}':fontcolor=white:fontsize=36:x=(w-text_w)/2:y=(h-text_h)/2",
            escape_drawtext(title)
        ));
    }
    args.extend(
        ["-c:v", "libx264", "-pix_fmt", "yuv420p", "-t", "5"]
            .iter()
            .map(|s| s.to_string()),
    );
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Escape text for a single-quoted drawtext value.
pub fn escape_drawtext(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            ':' => out.push_str("\\:"),
            '%' => out.push_str("\\%"),
            '\'' => out.push('\u{2019}'),
            c if c.is_control() => out.push(' '),
            c => out.push(c),
        }
    }
    out
}

#[async_trait]
impl RenderStrategy for PlaceholderStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Placeholder
    }

    async fn probe(&self) -> Result<(), StrategyError> {
        match self.ffmpeg().await {
            Some(_) => Ok(()),
            None => Err(StrategyError::Unavailable("ffmpeg not found on PATH".to_string())),
        }
    }

    async fn render(&self, job: &RenderJob) -> Result<PathBuf, StrategyError> {
        let ffmpeg = self
            .ffmpeg()
            .await
            .ok_or_else(|| StrategyError::Unavailable("ffmpeg not found on PATH".to_string()))?;
        let output = job.workdir.join(&job.output_name);

        let title = if job.title.trim().is_empty() {
            job.module_id.as_str()
        } else {
            job.title.as_str()
        };
        let titled = self.run_ffmpeg(ffmpeg, placeholder_args(Some(title), &output)).await;
        if let Err(e) = titled {
            tracing::warn!(module_id = %job.module_id, error = %e, "Title card failed, writing plain card");
            self.run_ffmpeg(ffmpeg, placeholder_args(None, &output)).await?;
        }

        if output.is_file() {
            Ok(output)
        } else {
            Err(StrategyError::OutputMissing)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn job(dir: &Path) -> RenderJob {
        RenderJob {
            module_id: "m1".to_string(),
            title: "Intro".to_string(),
            workdir: dir.to_path_buf(),
            source_file: dir.join("m1.py"),
            output_name: "m1.mp4".to_string(),
        }
    }

    #[test]
    fn test_discover_output_prefers_nested() {
        let dir = tempfile::tempdir().unwrap();
        let job = job(dir.path());
        assert!(job.discover_output().is_none());

        std::fs::write(dir.path().join("m1.mp4"), b"flat").unwrap();
        assert_eq!(job.discover_output(), Some(dir.path().join("m1.mp4")));

        let nested = dir.path().join("media/videos/m1/480p15");
        std::fs::create_dir_all(&nested).unwrap();
        std::fs::write(nested.join("m1.mp4"), b"nested").unwrap();
        assert_eq!(job.discover_output(), Some(nested.join("m1.mp4")));
    }

    #[test]
    fn test_render_args() {
        let dir = tempfile::tempdir().unwrap();
        let args = job(dir.path()).render_args("/manim/m1.py".to_string());
        assert_eq!(args, vec!["-qL", "-o", "m1.mp4", "/manim/m1.py", "Lesson"]);
    }

    #[test]
    fn test_container_user_parse() {
        assert_eq!(ContainerUser::parse("host"), ContainerUser::Host);
        assert_eq!(ContainerUser::parse("none"), ContainerUser::ImageDefault);
        assert_eq!(ContainerUser::parse(""), ContainerUser::ImageDefault);
        assert_eq!(
            ContainerUser::parse("1000:1000"),
            ContainerUser::Explicit("1000:1000".to_string())
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_host_user_resolves_to_owner() {
        let dir = tempfile::tempdir().unwrap();
        let user = ContainerUser::Host.resolve(dir.path()).unwrap();
        let parts: Vec<&str> = user.split(':').collect();
        assert_eq!(parts.len(), 2);
        assert!(parts.iter().all(|p| p.parse::<u32>().is_ok()));
    }

    #[test]
    fn test_escape_drawtext() {
        assert_eq!(escape_drawtext("Module 1: 50% of it's"), "Module 1\\: 50\\% of it\u{2019}s");
        assert_eq!(escape_drawtext("a\\b"), "a\\\\b");
    }

    #[test]
    fn test_placeholder_args() {
        let out = Path::new("/w/m1.mp4");
        let titled = placeholder_args(Some("Intro"), out);
        assert!(titled.contains(&"-vf".to_string()));
        assert!(titled.iter().any(|a| a.starts_with("drawtext=text='Intro'")));
        assert_eq!(titled.last().map(String::as_str), Some("/w/m1.mp4"));

        let plain = placeholder_args(None, out);
        assert!(!plain.contains(&"-vf".to_string()));
        assert!(plain.contains(&"libx264".to_string()));
    }

    #[tokio::test]
    async fn test_image_fetch_failure_is_cached() {
        let cell = OnceCell::new();
        let attempts = AtomicUsize::new(0);
        for _ in 0..3 {
            let err = fetch_once(&cell, "img", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(StrategyError::Timeout { seconds: 1 })
            })
            .await
            .unwrap_err();
            assert!(err.is_skip());
            assert!(err.to_string().contains("Timed out after 1 seconds"));
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_image_fetch_success_is_cached() {
        let cell = OnceCell::new();
        let attempts = AtomicUsize::new(0);
        for _ in 0..2 {
            fetch_once(&cell, "img", || async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Ok::<(), StrategyError>(())
            })
            .await
            .unwrap();
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_disabled_strategies_skip() {
        let container = ContainerStrategy::new(
            "img",
            ContainerUser::ImageDefault,
            ExecutionLimits::default(),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .with_enabled(false);
        assert!(matches!(container.probe().await, Err(StrategyError::Disabled)));

        let local = LocalStrategy::new(Duration::from_secs(1)).with_enabled(false);
        assert!(matches!(local.probe().await, Err(StrategyError::Disabled)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_strategy_with_fixed_runtime() {
        let dir = tempfile::tempdir().unwrap();
        let script = "out=\"$3\"; touch \"$out\"";
        let runtime = LocalRuntime {
            program: which("sh").unwrap(),
            prefix: vec!["-c".to_string(), script.to_string(), "renderer".to_string()],
        };
        let local = LocalStrategy::new(Duration::from_secs(10)).with_runtime(runtime);
        local.probe().await.unwrap();

        let media = local.render(&job(dir.path())).await.unwrap();
        assert_eq!(media, dir.path().join("m1.mp4"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_failure_reports_command_and_streams() {
        let dir = tempfile::tempdir().unwrap();
        let script = "echo 'Rendering Lesson'; echo 'NameError: foo' >&2; exit 2";
        let runtime = LocalRuntime {
            program: which("sh").unwrap(),
            prefix: vec!["-c".to_string(), script.to_string(), "renderer".to_string()],
        };
        let local = LocalStrategy::new(Duration::from_secs(10)).with_runtime(runtime);

        match local.render(&job(dir.path())).await.unwrap_err() {
            StrategyError::NonZeroExit {
                code,
                command,
                stdout,
                stderr,
            } => {
                assert_eq!(code, 2);
                assert!(command.ends_with("renderer -qL -o m1.mp4 m1.py Lesson"));
                assert_eq!(stdout.trim(), "Rendering Lesson");
                assert_eq!(stderr.trim(), "NameError: foo");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }
}
