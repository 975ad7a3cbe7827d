//! CLI command definitions for course-forge.
//!
//! `build` runs a full course build, `recompile` re-renders a single module
//! and `check` runs the scene validator on a local file.

use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::agents::SceneValidator;
use crate::execution::CompilationEngine;
use crate::llm::OpenRouterProvider;
use crate::pipeline::{
    recompile_module, Constraints, CourseOrchestrator, CoursePackage, FnProgress, ForgeConfig,
    ProgressReporter,
};

/// Generate animated courses from a topic.
#[derive(Parser)]
#[command(name = "course-forge")]
#[command(about = "Generate multi-module animated courses with LLMs and Manim")]
#[command(version)]
#[command(
    long_about = "course-forge plans a syllabus, writes lessons and Q&A, synthesizes Manim scenes,\nrenders them in a sandbox and persists the result.\n\nExample usage:\n  course-forge build --topic \"Binary search\" --level beginner --modules 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Build a complete course.
    Build(BuildArgs),

    /// Recompile one module's scene and replace its video.
    Recompile(RecompileArgs),

    /// Validate a scene source file.
    Check(CheckArgs),
}

/// Arguments for `course-forge build`.
#[derive(Parser, Debug)]
pub struct BuildArgs {
    /// Course topic.
    #[arg(short, long)]
    pub topic: String,

    /// Audience level.
    #[arg(long, default_value = "beginner")]
    pub level: String,

    /// Number of modules to request.
    #[arg(short = 'n', long)]
    pub modules: Option<u32>,

    /// Narrative language.
    #[arg(long)]
    pub language: Option<String>,

    /// Extra constraint as key=value; values that parse as JSON are kept typed.
    #[arg(short = 'c', long = "constraint", value_name = "KEY=VALUE")]
    pub constraints: Vec<String>,

    /// Existing course document to fill in.
    #[arg(long)]
    pub course_id: Option<String>,

    /// OpenRouter API key; falls back to `OPENROUTER_API_KEY`.
    #[arg(long)]
    pub api_key: Option<String>,

    /// Print the course package as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `course-forge recompile`.
#[derive(Parser, Debug)]
pub struct RecompileArgs {
    #[arg(long)]
    pub course_id: String,

    #[arg(long)]
    pub module_id: String,

    /// Scene source file.
    #[arg(short, long)]
    pub source: PathBuf,

    /// Title used by the placeholder renderer.
    #[arg(long)]
    pub title: Option<String>,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `course-forge check`.
#[derive(Parser, Debug)]
pub struct CheckArgs {
    /// Scene source file.
    pub file: PathBuf,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Build(args) => run_build_command(args).await,
        Commands::Recompile(args) => run_recompile_command(args).await,
        Commands::Check(args) => run_check_command(args),
    }
}

/// Turn CLI flags into a constraint map.
fn build_constraints(args: &BuildArgs) -> anyhow::Result<Constraints> {
    let mut constraints = Constraints::new();

    for raw in &args.constraints {
        let (key, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("Constraint '{}' is not KEY=VALUE", raw))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow::anyhow!("Constraint '{}' has an empty key", raw));
        }
        let value = serde_json::from_str(value.trim())
            .unwrap_or_else(|_| serde_json::Value::String(value.trim().to_string()));
        constraints.insert(key.to_string(), value);
    }

    if let Some(count) = args.modules {
        constraints.insert("count_modules".to_string(), count.into());
    }
    if let Some(language) = &args.language {
        constraints.insert("language".to_string(), language.clone().into());
    }

    Ok(constraints)
}

async fn run_build_command(args: BuildArgs) -> anyhow::Result<()> {
    let constraints = build_constraints(&args)?;
    let mut config = ForgeConfig::from_env()?;
    if let Some(key) = &args.api_key {
        config = config.with_api_key(key.clone());
    }

    let provider = OpenRouterProvider::with_base_url(config.require_api_key()?, &config.base_url)?
        .with_attribution(&config.app_url, &config.app_title);
    let orchestrator = CourseOrchestrator::from_config(Arc::new(provider), &config).await?;
    info!(engine = orchestrator.engine_name(), "Orchestrator ready");

    let progress: Option<Arc<dyn ProgressReporter>> = if args.json {
        None
    } else {
        Some(Arc::new(FnProgress::new(|percent, status: &str| {
            println!("[{:>3}%] {}", percent, status);
        })))
    };

    let package = orchestrator
        .build(
            &args.topic,
            &args.level,
            constraints,
            progress,
            args.course_id.clone(),
        )
        .await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&package)?);
    } else {
        print_package_summary(&package);
    }
    Ok(())
}

fn print_package_summary(package: &CoursePackage) {
    println!();
    println!("Course: {} ({})", package.topic, package.level);
    match &package.persistence.course_id {
        Some(id) => println!("Course id: {}", id),
        None => println!("Course id: (in memory)"),
    }
    println!("Modules: {}", package.count_modules);
    for module in &package.modules {
        let video = module
            .video_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "no video".to_string());
        let origin = module
            .scene_origin
            .map(|o| format!("{o:?}"))
            .unwrap_or_else(|| "-".to_string());
        println!("  {:<6} {:<40} {:<16} {}", module.module_id, module.title, origin, video);
    }
}

#[derive(Debug, Serialize)]
struct RecompileOutput {
    status: String,
    course_id: String,
    module_id: String,
    media_path: String,
    storage_id: Option<String>,
}

async fn run_recompile_command(args: RecompileArgs) -> anyhow::Result<()> {
    let source = tokio::fs::read_to_string(&args.source)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", args.source.display(), e))?;

    let config = ForgeConfig::from_env()?;
    let compiler = CompilationEngine::new(config.compile.clone());
    let backend = config.persist.backend()?;

    let outcome = recompile_module(
        &compiler,
        backend.as_ref().map(|b| b as &dyn crate::storage::PersistenceBackend),
        &args.course_id,
        &args.module_id,
        &source,
        args.title.as_deref(),
    )
    .await?;

    let output = RecompileOutput {
        status: "ready".to_string(),
        course_id: args.course_id,
        module_id: args.module_id,
        media_path: outcome.media_path.display().to_string(),
        storage_id: outcome.storage_id,
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Rendered {}", output.media_path);
        match &output.storage_id {
            Some(id) => println!("Uploaded as {}", id),
            None => println!("No persistence backend configured; video kept locally"),
        }
    }
    Ok(())
}

fn run_check_command(args: CheckArgs) -> anyhow::Result<()> {
    let source = std::fs::read_to_string(&args.file)
        .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", args.file.display(), e))?;
    let validator = SceneValidator::new()?;
    let violations = validator.validate(&source);

    if violations.is_empty() {
        println!("{}: ok", args.file.display());
        return Ok(());
    }

    println!("{}: {} violation(s)", args.file.display(), violations.len());
    for violation in &violations {
        println!("  - {}", violation);
    }
    Err(anyhow::anyhow!(
        "{} failed scene validation",
        args.file.display()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serde_json::json;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_build_command_with_options() {
        let args = vec![
            "course-forge",
            "build",
            "--topic",
            "Graphs",
            "-n",
            "4",
            "--language",
            "fr",
            "-c",
            "audience=teens",
            "-c",
            "duration_weeks=3",
            "--api-key",
            "sk-test",
            "-j",
        ];
        let cli = Cli::try_parse_from(args).expect("should parse");

        match cli.command {
            Commands::Build(args) => {
                assert_eq!(args.topic, "Graphs");
                assert_eq!(args.level, "beginner");
                assert_eq!(args.modules, Some(4));
                assert!(args.json);

                let constraints = build_constraints(&args).unwrap();
                assert_eq!(constraints["count_modules"], json!(4));
                assert_eq!(constraints["language"], json!("fr"));
                assert_eq!(constraints["audience"], json!("teens"));
                assert_eq!(constraints["duration_weeks"], json!(3));
            }
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_bad_constraint_rejected() {
        let cli = Cli::try_parse_from(vec![
            "course-forge",
            "build",
            "--topic",
            "Graphs",
            "-c",
            "novalue",
            "--api-key",
            "k",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Build(args) => assert!(build_constraints(&args).is_err()),
            _ => panic!("Expected Build command"),
        }
    }

    #[test]
    fn test_recompile_command() {
        let cli = Cli::try_parse_from(vec![
            "course-forge",
            "recompile",
            "--course-id",
            "c1",
            "--module-id",
            "m2",
            "--source",
            "scene.py",
        ])
        .expect("should parse");

        match cli.command {
            Commands::Recompile(args) => {
                assert_eq!(args.course_id, "c1");
                assert_eq!(args.module_id, "m2");
                assert_eq!(args.source, PathBuf::from("scene.py"));
                assert!(args.title.is_none());
            }
            _ => panic!("Expected Recompile command"),
        }
    }

    #[test]
    fn test_check_command_reports_violations() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scene.py");
        std::fs::write(&file, "import numpy\nprint('hi')\n").unwrap();

        let result = run_check_command(CheckArgs { file });
        assert!(result.is_err());
    }

    #[test]
    fn test_check_command_accepts_fallback_scene() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("scene.py");
        let module = crate::pipeline::ModuleSpec {
            id: "m1".to_string(),
            title: "Intro".to_string(),
            objectives: vec![],
            outline: vec!["Basics".to_string()],
        };
        std::fs::write(&file, crate::agents::minimal_scene(&module)).unwrap();

        assert!(run_check_command(CheckArgs { file }).is_ok());
    }
}
