//! Concrete generative backends.

pub mod openrouter;

pub use openrouter::{OpenRouterProvider, OPENROUTER_BASE_URL};
