//! Remote-call gateway.
//!
//! Every outbound generation request goes through [`RemoteCallGateway::call`],
//! which holds one permit of a process-wide semaphore for the whole call
//! (including retries) and retries transient failures with capped
//! exponential backoff plus jitter.

use rand::RngExt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

use crate::error::LlmError;
use crate::llm::{GenerationRequest, LlmProvider, Message};
use crate::utils::preview;

/// Default number of concurrent outbound calls.
pub const DEFAULT_CONCURRENCY: usize = 3;

/// Default number of attempts per call.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Message fragments that mark an otherwise unstructured error as transient.
const TRANSIENT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "too many requests",
    "quota",
    "overloaded",
    "timeout",
    "timed out",
    "server error",
    "502",
    "503",
    "504",
    "connection",
];

/// Error returned by the gateway once it gives up on a call.
#[derive(Debug, Error)]
pub enum RemoteCallError {
    /// Every attempt failed with a transient error; carries the last one.
    #[error("Remote call failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: LlmError,
    },

    /// A non-retryable error, propagated on first sight.
    #[error("Remote call failed: {0}")]
    Fatal(#[source] LlmError),
}

impl RemoteCallError {
    /// The underlying backend error.
    pub fn last_error(&self) -> &LlmError {
        match self {
            RemoteCallError::Exhausted { source, .. } => source,
            RemoteCallError::Fatal(source) => source,
        }
    }

    /// Whether the gateway retried before giving up.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteCallError::Exhausted { .. })
    }
}

/// Retry decision for a backend error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Fatal,
}

/// Classify a backend error as transient or fatal.
///
/// Typed signals (status codes, dedicated variants) win; free-form messages
/// fall back to marker matching.
pub fn classify(error: &LlmError) -> ErrorKind {
    match error {
        LlmError::RateLimited(_) | LlmError::Timeout { .. } => ErrorKind::Transient,
        LlmError::ApiError { code, message } => {
            if *code == 429 || *code == 408 || (500..600).contains(code) {
                ErrorKind::Transient
            } else if *code == 0 && has_transient_marker(message) {
                ErrorKind::Transient
            } else {
                ErrorKind::Fatal
            }
        }
        LlmError::RequestFailed(message) => {
            if has_transient_marker(message) {
                ErrorKind::Transient
            } else {
                ErrorKind::Fatal
            }
        }
        LlmError::MissingApiKey | LlmError::ParseError(_) | LlmError::Io(_) => ErrorKind::Fatal,
    }
}

fn has_transient_marker(message: &str) -> bool {
    let lower = message.to_lowercase();
    TRANSIENT_MARKERS.iter().any(|m| lower.contains(m))
}

/// Capped exponential backoff with additive jitter.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt, without jitter.
    pub base: Duration,
    /// Upper bound on any delay.
    pub cap: Duration,
    /// Maximum uniform jitter added to each delay.
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base: Duration::from_millis(800),
            cap: Duration::from_secs(20),
            jitter: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt` (1-based) for a given jitter
    /// fraction in `[0, 1]`.
    pub fn delay_with_jitter(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        let exponent = attempt.saturating_sub(1).min(30);
        let exp = self.base.as_secs_f64() * f64::from(1u32 << exponent);
        let jitter = self.jitter.as_secs_f64() * jitter_fraction.clamp(0.0, 1.0);
        Duration::from_secs_f64((exp + jitter).min(self.cap.as_secs_f64()))
    }

    /// Delay after failed attempt `attempt` with random jitter.
    pub fn delay(&self, attempt: u32) -> Duration {
        let fraction = if self.jitter.is_zero() {
            0.0
        } else {
            rand::rng().random_range(0.0..=1.0)
        };
        self.delay_with_jitter(attempt, fraction)
    }
}

/// Gateway settings fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Capacity of the outbound permit set.
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Default per-request timeout.
    pub timeout: Duration,
    pub temperature: f64,
    pub max_tokens: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            retry: RetryPolicy::default(),
            timeout: Duration::from_secs(60),
            temperature: 0.3,
            max_tokens: 2000,
        }
    }
}

/// One outbound call, built with `with_*` methods.
#[derive(Debug, Clone)]
pub struct RemoteCall {
    pub system: Option<String>,
    pub user: String,
    pub model: String,
    pub max_attempts: Option<u32>,
    pub timeout: Option<Duration>,
}

impl RemoteCall {
    /// A call with a user prompt against `model`.
    pub fn new(model: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: None,
            user: user.into(),
            model: model.into(),
            max_attempts: None,
            timeout: None,
        }
    }

    /// Set the system prompt.
    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    /// Override the attempt budget for this call.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Override the timeout for this call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Bounded-concurrency front door to a generative backend.
pub struct RemoteCallGateway {
    provider: Arc<dyn LlmProvider>,
    permits: Arc<Semaphore>,
    config: GatewayConfig,
}

impl std::fmt::Debug for RemoteCallGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCallGateway")
            .field("config", &self.config)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl RemoteCallGateway {
    /// Create a gateway owning a fresh permit set sized from `config`.
    pub fn new(provider: Arc<dyn LlmProvider>, config: GatewayConfig) -> Self {
        let capacity = config.concurrency.max(1);
        Self {
            provider,
            permits: Arc::new(Semaphore::new(capacity)),
            config,
        }
    }

    /// Gateway configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Permits currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }

    /// Issue a call and return the generated text.
    ///
    /// An empty or missing completion is returned as an empty string; callers
    /// decide whether that warrants a fallback.
    pub async fn call(&self, call: RemoteCall) -> Result<String, RemoteCallError> {
        let _permit = self.permits.acquire().await.map_err(|_| {
            RemoteCallError::Fatal(LlmError::RequestFailed("gateway permit set closed".to_string()))
        })?;

        let attempts = call
            .max_attempts
            .unwrap_or(self.config.retry.max_attempts)
            .max(1);
        let timeout = call.timeout.unwrap_or(self.config.timeout);

        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &call.system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(call.user.clone()));

        let request = GenerationRequest::new(call.model.clone(), messages)
            .with_temperature(self.config.temperature)
            .with_max_tokens(self.config.max_tokens)
            .with_timeout(timeout);

        let mut attempt = 1;
        loop {
            match self.provider.generate(request.clone()).await {
                Ok(response) => {
                    let text = response.first_content().unwrap_or_default().to_string();
                    tracing::debug!(
                        model = %call.model,
                        attempt,
                        preview = %preview(&text, None),
                        "Remote call succeeded"
                    );
                    return Ok(text);
                }
                Err(err) => {
                    if classify(&err) == ErrorKind::Fatal {
                        tracing::warn!(model = %call.model, attempt, error = %err, "Fatal remote error");
                        return Err(RemoteCallError::Fatal(err));
                    }
                    if attempt >= attempts {
                        tracing::warn!(
                            model = %call.model,
                            attempts,
                            error = %err,
                            "Retry budget exhausted"
                        );
                        return Err(RemoteCallError::Exhausted {
                            attempts,
                            source: err,
                        });
                    }

                    let delay = self.config.retry.delay(attempt);
                    tracing::warn!(
                        model = %call.model,
                        attempt,
                        max_attempts = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Transient error, will retry"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status_codes() {
        let transient = [429u16, 408, 500, 502, 503, 504];
        for code in transient {
            let err = LlmError::ApiError {
                code,
                message: "x".to_string(),
            };
            assert_eq!(classify(&err), ErrorKind::Transient, "code {code}");
        }

        let fatal = LlmError::ApiError {
            code: 400,
            message: "bad request: rate limit field invalid".to_string(),
        };
        assert_eq!(classify(&fatal), ErrorKind::Fatal);
    }

    #[test]
    fn test_classify_variants() {
        assert_eq!(
            classify(&LlmError::RateLimited("slow down".to_string())),
            ErrorKind::Transient
        );
        assert_eq!(
            classify(&LlmError::Timeout { seconds: 60 }),
            ErrorKind::Transient
        );
        assert_eq!(classify(&LlmError::MissingApiKey), ErrorKind::Fatal);
        assert_eq!(
            classify(&LlmError::ParseError("bad json".to_string())),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_classify_message_markers() {
        for msg in [
            "Quota exceeded",
            "model is overloaded",
            "operation timed out",
            "Too Many Requests",
            "connection reset by peer",
        ] {
            assert_eq!(
                classify(&LlmError::RequestFailed(msg.to_string())),
                ErrorKind::Transient,
                "{msg}"
            );
        }
        assert_eq!(
            classify(&LlmError::RequestFailed("invalid url".to_string())),
            ErrorKind::Fatal
        );
    }

    #[test]
    fn test_backoff_schedule_without_jitter() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_with_jitter(1, 0.0), Duration::from_millis(800));
        assert_eq!(policy.delay_with_jitter(2, 0.0), Duration::from_millis(1600));
        assert_eq!(policy.delay_with_jitter(3, 0.0), Duration::from_millis(3200));
        assert_eq!(policy.delay_with_jitter(6, 0.0), Duration::from_secs(20));
        assert_eq!(policy.delay_with_jitter(40, 1.0), Duration::from_secs(20));
    }

    #[test]
    fn test_backoff_non_decreasing() {
        let policy = RetryPolicy::default();
        let mut previous = Duration::ZERO;
        for attempt in 1..=10 {
            let base = policy.delay_with_jitter(attempt, 0.0);
            assert!(base >= previous);
            let jittered = policy.delay(attempt);
            assert!(jittered >= base);
            assert!(jittered <= (base + policy.jitter).min(policy.cap));
            previous = base;
        }
    }

    #[test]
    fn test_remote_call_builder() {
        let call = RemoteCall::new("model-x", "hello")
            .with_system("be brief")
            .with_max_attempts(2)
            .with_timeout(Duration::from_secs(5));
        assert_eq!(call.system.as_deref(), Some("be brief"));
        assert_eq!(call.max_attempts, Some(2));
        assert_eq!(call.timeout, Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_error_accessors() {
        let err = RemoteCallError::Exhausted {
            attempts: 5,
            source: LlmError::RateLimited("x".to_string()),
        };
        assert!(err.is_transient());
        assert!(matches!(err.last_error(), LlmError::RateLimited(_)));
        assert!(!RemoteCallError::Fatal(LlmError::MissingApiKey).is_transient());
    }
}
