//! Build progress reporting.
//!
//! Stages report `(percent, status)` pairs through [`MonotonicProgress`],
//! which fans them out to any number of [`ProgressReporter`] sinks and
//! guarantees the sequence they observe never decreases.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::PersistError;
use crate::storage::PersistenceBackend;

/// Errors raised by a progress sink. Never fatal to a build.
#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("Progress sink failed: {0}")]
    Sink(String),

    #[error("Progress update not persisted: {0}")]
    Persist(#[from] PersistError),
}

/// Receives progress updates.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, percent: u8, status: &str) -> Result<(), ProgressError>;
}

/// Adapts a plain closure into a [`ProgressReporter`].
pub struct FnProgress<F> {
    callback: F,
}

impl<F> FnProgress<F>
where
    F: Fn(u8, &str) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> ProgressReporter for FnProgress<F>
where
    F: Fn(u8, &str) + Send + Sync,
{
    async fn report(&self, percent: u8, status: &str) -> Result<(), ProgressError> {
        (self.callback)(percent, status);
        Ok(())
    }
}

/// Mirrors progress onto a course document in the persistence backend.
pub struct BackendProgress {
    backend: Arc<dyn PersistenceBackend>,
    course_id: String,
}

impl BackendProgress {
    pub fn new(backend: Arc<dyn PersistenceBackend>, course_id: impl Into<String>) -> Self {
        Self {
            backend,
            course_id: course_id.into(),
        }
    }
}

#[async_trait]
impl ProgressReporter for BackendProgress {
    async fn report(&self, percent: u8, status: &str) -> Result<(), ProgressError> {
        self.backend
            .update_progress(&self.course_id, status, percent)
            .await?;
        Ok(())
    }
}

/// Non-decreasing progress front end.
///
/// A report below the last forwarded percentage is dropped; equal values
/// pass so status text can change at the same percentage. Sink errors are
/// logged and swallowed. Reports are serialized, so concurrent callers
/// cannot reorder what a sink sees.
pub struct MonotonicProgress {
    sinks: Vec<Arc<dyn ProgressReporter>>,
    last: Mutex<Option<u8>>,
}

impl std::fmt::Debug for MonotonicProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MonotonicProgress")
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl Default for MonotonicProgress {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

impl MonotonicProgress {
    pub fn new(sinks: Vec<Arc<dyn ProgressReporter>>) -> Self {
        Self {
            sinks,
            last: Mutex::new(None),
        }
    }

    /// Add another sink.
    pub fn with_sink(mut self, sink: Arc<dyn ProgressReporter>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Last forwarded percentage, 0 before the first report.
    pub async fn last(&self) -> u8 {
        self.last.lock().await.unwrap_or(0)
    }

    /// Forward `(percent, status)` unless it would regress.
    ///
    /// Returns whether the update was forwarded.
    pub async fn report(&self, percent: u8, status: &str) -> bool {
        let percent = percent.min(100);
        let mut last = self.last.lock().await;
        if last.is_some_and(|prev| percent < prev) {
            debug!(percent, previous = ?*last, status, "Dropping regressing progress update");
            return false;
        }
        *last = Some(percent);

        for sink in &self.sinks {
            if let Err(e) = sink.report(percent, status).await {
                warn!(percent, status, error = %e, "Progress sink failed");
            }
        }
        true
    }

    /// Report a failed build at the current percentage.
    pub async fn fail(&self) {
        let current = self.last().await;
        self.report(current, "failed").await;
    }
}
