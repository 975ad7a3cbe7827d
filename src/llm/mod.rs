//! Generative backend integration for course-forge.
//!
//! Provides the backend trait and request/response types, the OpenRouter
//! provider, and the [`RemoteCallGateway`] that every agent goes through.
//!
//! ```ignore
//! use course_forge::llm::{GatewayConfig, OpenRouterProvider, RemoteCall, RemoteCallGateway};
//! use std::sync::Arc;
//!
//! let provider = Arc::new(OpenRouterProvider::new(api_key)?);
//! let gateway = RemoteCallGateway::new(provider, GatewayConfig::default());
//!
//! let text = gateway
//!     .call(RemoteCall::new("openrouter/auto", "Summarize binary search").with_system("Be brief"))
//!     .await?;
//! ```

pub mod client;
pub mod gateway;
pub mod providers;

pub use client::{Choice, GenerationRequest, GenerationResponse, LlmProvider, Message, Usage};
pub use gateway::{
    classify, ErrorKind, GatewayConfig, RemoteCall, RemoteCallError, RemoteCallGateway,
    RetryPolicy, DEFAULT_CONCURRENCY, DEFAULT_MAX_ATTEMPTS,
};
pub use providers::{OpenRouterProvider, OPENROUTER_BASE_URL};
