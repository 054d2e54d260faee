//! Pipeline trigger
//!
//! Runs a batch once enough failures have queued up. Batches never overlap:
//! a trigger that fires while one is running is skipped.

use crate::error::WorkflowError;
use crate::workflow::{blocking, BatchOutcome, UpdateWorkflow};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Threshold-triggered batch runner
#[derive(Debug)]
pub struct Pipeline {
    workflow: UpdateWorkflow,
}

impl Pipeline {
    #[must_use]
    pub fn new(workflow: UpdateWorkflow) -> Self {
        Self { workflow }
    }

    #[inline]
    #[must_use]
    pub fn workflow(&self) -> &UpdateWorkflow {
        &self.workflow
    }

    /// Whether the queue has reached the activation threshold
    ///
    /// # Errors
    /// `WorkflowError::Queue` if the queue cannot be read.
    pub async fn is_due(&self) -> Result<bool, WorkflowError> {
        let queue = Arc::clone(&self.workflow.stores().queue);
        let queued = blocking(move || queue.len()).await?;
        Ok(queued >= self.workflow.config().activation_threshold)
    }

    /// Run one batch if the threshold is reached and no batch is running
    ///
    /// `Ok(None)` means nothing ran.
    ///
    /// # Errors
    /// Any non-concurrency error from [`UpdateWorkflow::run_batch`].
    pub async fn run_if_due(&self) -> Result<Option<BatchOutcome>, WorkflowError> {
        if !self.is_due().await? {
            return Ok(None);
        }
        match self.workflow.run_batch().await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(WorkflowError::BatchInProgress) => {
                debug!("Trigger skipped: a batch is already running");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Check the trigger every `period` until a fatal error
    ///
    /// Non-fatal batch errors are logged and the loop continues. The task
    /// returns the fatal error that stopped it.
    pub fn spawn_periodic(self: Arc<Self>, period: Duration) -> JoinHandle<WorkflowError> {
        info!("Starting pipeline trigger (every {}s)", period.as_secs());
        tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                timer.tick().await;
                match self.run_if_due().await {
                    Ok(Some(outcome)) => {
                        debug!("Batch {} ended in {:?}", outcome.batch_id(), outcome.state());
                    }
                    Ok(None) => {}
                    Err(e) if e.is_fatal() => {
                        error!("Pipeline stopped: {}", e);
                        return e;
                    }
                    Err(e) => warn!("Batch failed: {}", e),
                }
            }
        })
    }
}
