//! Failure-intercepting parser facade
//!
//! Call sites parse through [`HealingParser`]; inputs nothing recognizes
//! are queued for the next batch before the error is returned.

use chrono::{DateTime, Utc};
use mend_core::{NewFailure, NoMatchError};
use mend_queue::{FailureQueue, QueueError};
use mend_registry::{ParseOutcome, PluginRegistry};
use serde_json::json;
use std::sync::Arc;
use tracing::debug;

/// Error returned to call sites
#[derive(Debug, thiserror::Error)]
pub enum InterceptError {
    /// Not recognized; the input was queued
    #[error(transparent)]
    NoMatch(#[from] NoMatchError),

    /// Empty or whitespace-only input; nothing was queued
    #[error("blank input")]
    Blank,

    /// Not recognized, and queuing the failure also failed
    #[error("could not queue unparsed input: {0}")]
    Queue(#[from] QueueError),
}

/// Registry handle plus queue handle
#[derive(Debug, Clone)]
pub struct HealingParser {
    registry: Arc<PluginRegistry>,
    queue: Arc<FailureQueue>,
}

impl HealingParser {
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>, queue: Arc<FailureQueue>) -> Self {
        Self { registry, queue }
    }

    /// Parse relative to the current time
    ///
    /// # Errors
    /// See [`HealingParser::parse_at`].
    pub fn parse(&self, text: &str) -> Result<ParseOutcome, InterceptError> {
        self.parse_at(text, Utc::now())
    }

    /// Parse relative to `now`, queuing the input if nothing matches
    ///
    /// # Errors
    /// - `InterceptError::Blank` for blank input
    /// - `InterceptError::NoMatch` after the failure has been queued
    /// - `InterceptError::Queue` if it could not be queued
    pub fn parse_at(&self, text: &str, now: DateTime<Utc>) -> Result<ParseOutcome, InterceptError> {
        if text.trim().is_empty() {
            return Err(InterceptError::Blank);
        }
        match self.registry.parse_at(text, now) {
            Ok(outcome) => Ok(outcome),
            Err(no_match) => {
                let record = self.queue.append(
                    NewFailure::new(text)
                        .observed_at(now)
                        .with_context(json!({
                            "error_type": "parsing_failed",
                            "error_message": no_match.to_string(),
                            "original_timing": text,
                        })),
                )?;
                debug!("Queued unparsed input as {}", record.sequence_index);
                Err(no_match.into())
            }
        }
    }
}
