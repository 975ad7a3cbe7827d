//! Build configuration.
//!
//! This module gathers every tunable of a course build: backend provider
//! credentials, gateway limits, model names, compilation settings,
//! persistence endpoint and checkpoint database.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::error::PersistError;
use crate::execution::{CompileConfig, ContainerUser};
use crate::llm::{GatewayConfig, OPENROUTER_BASE_URL};
use crate::storage::HttpPersistenceBackend;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Model used for each generation step.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelConfig {
    pub syllabus: String,
    /// Lesson text and Q&A.
    pub text: String,
    pub scene: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            syllabus: "openrouter/auto".to_string(),
            text: "google/gemini-2.5-flash".to_string(),
            scene: "deepseek/deepseek-coder".to_string(),
        }
    }
}

/// Persistence endpoint. No URL means in-memory mode.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistConfig {
    pub url: Option<String>,
    pub deploy_key: Option<String>,
    pub user_bearer: Option<String>,
}

impl PersistConfig {
    pub fn is_enabled(&self) -> bool {
        self.url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }

    /// HTTP backend for the configured URL, `None` in memory mode.
    pub fn backend(&self) -> Result<Option<HttpPersistenceBackend>, PersistError> {
        match self.url.as_deref().filter(|u| !u.trim().is_empty()) {
            Some(url) => Ok(Some(HttpPersistenceBackend::new(
                url,
                self.deploy_key.clone(),
                self.user_bearer.clone(),
            )?)),
            None => Ok(None),
        }
    }
}

/// Execution engine selection.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// SQLite file for checkpoints; `None` forces the direct executor.
    pub checkpoint_db: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_db: Some(PathBuf::from("ai_state.sqlite")),
        }
    }
}

/// Configuration for a course build.
#[derive(Debug, Clone)]
pub struct ForgeConfig {
    // Provider settings
    /// OpenRouter API key.
    pub api_key: Option<String>,
    pub base_url: String,
    /// Attribution sent as `HTTP-Referer`.
    pub app_url: String,
    /// Attribution sent as `X-Title`.
    pub app_title: String,

    pub gateway: GatewayConfig,
    pub models: ModelConfig,
    pub compile: CompileConfig,
    pub persist: PersistConfig,
    pub engine: EngineConfig,
}

impl Default for ForgeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: OPENROUTER_BASE_URL.to_string(),
            app_url: "http://localhost:8000".to_string(),
            app_title: "course-forge".to_string(),
            gateway: GatewayConfig::default(),
            models: ModelConfig::default(),
            compile: CompileConfig::default(),
            persist: PersistConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

impl ForgeConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `OPENROUTER_API_KEY`, `OPENROUTER_BASE_URL`, `APP_URL`, `APP_TITLE`
    /// - `LLM_CONCURRENCY` (3), `LLM_MAX_RETRIES` (5), `LLM_TIMEOUT_SECS` (60)
    /// - `SYLLABUS_MODEL`, `TEXT_MODEL`, `MANIM_MODEL`
    /// - `COMPILE_CONCURRENCY` (2), `MANIM_TMP_DIR`, `MANIM_DOCKER_IMAGE`,
    ///   `MANIM_DOCKER_USER` (`host`, `none` or `uid:gid`)
    /// - `MANIM_DISABLE_DOCKER`, `MANIM_DISABLE_LOCAL`, `MANIM_PREFER_LOCAL`
    /// - `MANIM_RENDER_TIMEOUT_SECS` (300), `MANIM_PULL_TIMEOUT_SECS` (600),
    ///   `MANIM_PLACEHOLDER_TIMEOUT_SECS` (60)
    /// - `CONVEX_URL`, `CONVEX_DEPLOY_KEY`, `CONVEX_USER_BEARER`
    /// - `CHECKPOINT_DB` (`ai_state.sqlite`; empty disables checkpoints)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Same as [`ForgeConfig::from_env`] with a custom variable source.
    pub fn from_vars<F>(var: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Provider settings
        config.api_key = var("OPENROUTER_API_KEY").filter(|k| !k.trim().is_empty());
        if let Some(val) = var("OPENROUTER_BASE_URL") {
            config.base_url = val;
        }
        if let Some(val) = var("APP_URL") {
            config.app_url = val;
        }
        if let Some(val) = var("APP_TITLE") {
            config.app_title = val;
        }

        // Gateway settings
        if let Some(val) = var("LLM_CONCURRENCY") {
            config.gateway.concurrency = parse_env_value(&val, "LLM_CONCURRENCY")?;
        }
        if let Some(val) = var("LLM_MAX_RETRIES") {
            config.gateway.retry.max_attempts = parse_env_value(&val, "LLM_MAX_RETRIES")?;
        }
        if let Some(val) = var("LLM_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "LLM_TIMEOUT_SECS")?;
            config.gateway.timeout = Duration::from_secs(secs);
        }

        // Models
        if let Some(val) = var("SYLLABUS_MODEL") {
            config.models.syllabus = val;
        }
        if let Some(val) = var("TEXT_MODEL") {
            config.models.text = val;
        }
        if let Some(val) = var("MANIM_MODEL") {
            config.models.scene = val;
        }

        // Compilation settings
        if let Some(val) = var("COMPILE_CONCURRENCY") {
            config.compile.concurrency = parse_env_value(&val, "COMPILE_CONCURRENCY")?;
        }
        if let Some(val) = var("MANIM_TMP_DIR") {
            config.compile.work_root = PathBuf::from(val);
        }
        if let Some(val) = var("MANIM_DOCKER_IMAGE") {
            config.compile.docker_image = val;
        }
        if let Some(val) = var("MANIM_DOCKER_USER") {
            config.compile.docker_user = ContainerUser::parse(&val);
        }
        if let Some(val) = var("MANIM_DISABLE_DOCKER") {
            config.compile.disable_docker = parse_env_bool(&val, "MANIM_DISABLE_DOCKER")?;
        }
        if let Some(val) = var("MANIM_DISABLE_LOCAL") {
            config.compile.disable_local = parse_env_bool(&val, "MANIM_DISABLE_LOCAL")?;
        }
        if let Some(val) = var("MANIM_PREFER_LOCAL") {
            config.compile.prefer_local = parse_env_bool(&val, "MANIM_PREFER_LOCAL")?;
        }
        if let Some(val) = var("MANIM_RENDER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "MANIM_RENDER_TIMEOUT_SECS")?;
            config.compile.render_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = var("MANIM_PULL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "MANIM_PULL_TIMEOUT_SECS")?;
            config.compile.pull_timeout = Duration::from_secs(secs);
        }
        if let Some(val) = var("MANIM_PLACEHOLDER_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "MANIM_PLACEHOLDER_TIMEOUT_SECS")?;
            config.compile.placeholder_timeout = Duration::from_secs(secs);
        }

        // Persistence settings
        config.persist.url = var("CONVEX_URL").filter(|u| !u.trim().is_empty());
        config.persist.deploy_key = var("CONVEX_DEPLOY_KEY").filter(|k| !k.is_empty());
        config.persist.user_bearer = var("CONVEX_USER_BEARER").filter(|t| !t.is_empty());

        // Engine settings
        if let Some(val) = var("CHECKPOINT_DB") {
            config.engine.checkpoint_db = if val.trim().is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::ValidationFailed(
                "base_url cannot be empty".to_string(),
            ));
        }

        // Gateway validation
        if self.gateway.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "gateway concurrency must be greater than 0".to_string(),
            ));
        }

        if self.gateway.retry.max_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_attempts must be greater than 0".to_string(),
            ));
        }

        if self.gateway.timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "gateway timeout must be greater than 0".to_string(),
            ));
        }

        if !(0.0..=2.0).contains(&self.gateway.temperature) {
            return Err(ConfigError::ValidationFailed(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        // Model validation
        for (name, model) in [
            ("syllabus", &self.models.syllabus),
            ("text", &self.models.text),
            ("scene", &self.models.scene),
        ] {
            if model.trim().is_empty() {
                return Err(ConfigError::ValidationFailed(format!(
                    "{name} model cannot be empty"
                )));
            }
        }

        // Compilation validation
        if self.compile.concurrency == 0 {
            return Err(ConfigError::ValidationFailed(
                "compile concurrency must be greater than 0".to_string(),
            ));
        }

        if self.compile.docker_image.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "docker_image cannot be empty".to_string(),
            ));
        }

        if self.compile.render_timeout.is_zero() || self.compile.placeholder_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "render timeouts must be greater than 0".to_string(),
            ));
        }

        if self.compile.limits.memory_mb < 256 {
            return Err(ConfigError::ValidationFailed(
                "render memory must be at least 256 MB".to_string(),
            ));
        }

        if self.compile.limits.cpu_cores <= 0.0 {
            return Err(ConfigError::ValidationFailed(
                "render cpu_cores must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// The provider API key.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` when no key was loaded or set.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))
    }

    /// Builder method to set the API key.
    pub fn with_api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    /// Builder method to set the provider base URL.
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Builder method to set the gateway settings.
    pub fn with_gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    /// Builder method to set the models.
    pub fn with_models(mut self, models: ModelConfig) -> Self {
        self.models = models;
        self
    }

    /// Builder method to set the compilation settings.
    pub fn with_compile(mut self, compile: CompileConfig) -> Self {
        self.compile = compile;
        self
    }

    /// Builder method to set the compile concurrency.
    pub fn with_compile_concurrency(mut self, concurrency: usize) -> Self {
        self.compile.concurrency = concurrency;
        self
    }

    /// Builder method to set the persistence endpoint.
    pub fn with_persist(mut self, persist: PersistConfig) -> Self {
        self.persist = persist;
        self
    }

    /// Builder method to set or clear the checkpoint database.
    pub fn with_checkpoint_db(mut self, path: Option<PathBuf>) -> Self {
        self.engine.checkpoint_db = path;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_map(pairs: &[(&str, &str)]) -> Result<ForgeConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ForgeConfig::from_vars(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_default_config() {
        let config = ForgeConfig::default();
        assert_eq!(config.base_url, "https://openrouter.ai/api/v1");
        assert_eq!(config.gateway.concurrency, 3);
        assert_eq!(config.gateway.retry.max_attempts, 5);
        assert_eq!(config.gateway.timeout, Duration::from_secs(60));
        assert_eq!(config.models.syllabus, "openrouter/auto");
        assert_eq!(config.compile.concurrency, 2);
        assert_eq!(config.compile.work_root, PathBuf::from("./tmp/manim_runs"));
        assert!(!config.persist.is_enabled());
        assert_eq!(
            config.engine.checkpoint_db,
            Some(PathBuf::from("ai_state.sqlite"))
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = from_map(&[
            ("OPENROUTER_API_KEY", "sk-test"),
            ("LLM_CONCURRENCY", "5"),
            ("LLM_MAX_RETRIES", "2"),
            ("LLM_TIMEOUT_SECS", "15"),
            ("MANIM_MODEL", "qwen/coder"),
            ("COMPILE_CONCURRENCY", "4"),
            ("MANIM_TMP_DIR", "/var/tmp/renders"),
            ("MANIM_DOCKER_USER", "none"),
            ("MANIM_DISABLE_DOCKER", "true"),
            ("MANIM_PREFER_LOCAL", "1"),
            ("MANIM_RENDER_TIMEOUT_SECS", "30"),
            ("CONVEX_URL", "https://x.convex.cloud"),
            ("CONVEX_DEPLOY_KEY", "prod:abc"),
        ])
        .unwrap();

        assert_eq!(config.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.gateway.concurrency, 5);
        assert_eq!(config.gateway.retry.max_attempts, 2);
        assert_eq!(config.gateway.timeout, Duration::from_secs(15));
        assert_eq!(config.models.scene, "qwen/coder");
        assert_eq!(config.compile.concurrency, 4);
        assert_eq!(config.compile.work_root, PathBuf::from("/var/tmp/renders"));
        assert_eq!(config.compile.docker_user, ContainerUser::ImageDefault);
        assert!(config.compile.disable_docker);
        assert!(!config.compile.disable_local);
        assert!(config.compile.prefer_local);
        assert_eq!(config.compile.render_timeout, Duration::from_secs(30));
        assert!(config.persist.is_enabled());
        assert_eq!(config.persist.deploy_key.as_deref(), Some("prod:abc"));
    }

    #[test]
    fn test_missing_api_key_is_reported() {
        let config = from_map(&[("OPENROUTER_API_KEY", " ")]).unwrap();
        let err = config.require_api_key().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref key) if key == "OPENROUTER_API_KEY"));

        let config = config.with_api_key("sk-test");
        assert_eq!(config.require_api_key().unwrap(), "sk-test");
    }

    #[test]
    fn test_empty_checkpoint_db_disables() {
        let config = from_map(&[("CHECKPOINT_DB", "")]).unwrap();
        assert!(config.engine.checkpoint_db.is_none());
    }

    #[test]
    fn test_empty_convex_url_is_memory_mode() {
        let config = from_map(&[("CONVEX_URL", "  ")]).unwrap();
        assert!(!config.persist.is_enabled());
        assert!(config.persist.backend().unwrap().is_none());
    }

    #[test]
    fn test_invalid_number_reports_key() {
        let err = from_map(&[("COMPILE_CONCURRENCY", "lots")]).unwrap_err();
        assert!(err.to_string().contains("COMPILE_CONCURRENCY"));
    }

    #[test]
    fn test_zero_concurrency_fails_validation() {
        let err = from_map(&[("LLM_CONCURRENCY", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::ValidationFailed(_)));

        let config = ForgeConfig::default().with_compile_concurrency(0);
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("compile concurrency"));
    }

    #[test]
    fn test_validation_empty_model() {
        let config = ForgeConfig::default().with_models(ModelConfig {
            text: String::new(),
            ..ModelConfig::default()
        });
        assert!(config.validate().unwrap_err().to_string().contains("text model"));
    }

    #[test]
    fn test_persist_backend_built_when_enabled() {
        let persist = PersistConfig {
            url: Some("https://x.convex.cloud/".to_string()),
            ..Default::default()
        };
        let backend = persist.backend().unwrap().unwrap();
        assert_eq!(backend.base_url(), "https://x.convex.cloud");
    }

    #[test]
    fn test_parse_env_bool() {
        assert!(parse_env_bool("true", "test").unwrap());
        assert!(parse_env_bool("1", "test").unwrap());
        assert!(parse_env_bool("YES", "test").unwrap());
        assert!(!parse_env_bool("off", "test").unwrap());
        assert!(!parse_env_bool("", "test").unwrap());
        assert!(parse_env_bool("maybe", "test").is_err());
    }
}
