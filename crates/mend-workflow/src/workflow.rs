//! Update workflow
//!
//! Drives one batch through REASON → PLAN → ACT → VALIDATE and ends it in
//! SUCCESS (registry reloaded, queue drained of the batch's records),
//! FAILURE (ledger entry, queue untouched) or IDLE (nothing to do).
//!
//! Only one batch runs at a time per [`UpdateWorkflow`].

use crate::collaborators::{
    ClusterAnalyzer, CodeGenerator, CollaboratorError, PlanRequest, TestRunner,
};
use crate::error::{AttemptError, AttemptFailure, WorkflowError};
use crate::run::WorkflowRun;
use crate::runner::RuleTestRunner;
use crate::selector::{normalize_clusters, select};
use crate::staging;
use crate::state_machine::{after_failure, StepOutcome, WorkflowState};
use chrono::Utc;
use futures::FutureExt;
use mend_core::{
    BatchId, ClusterId, CodeArtifact, ErrorCluster, FailedBatchEntry, Generation, MendConfig,
    QueueSnapshot,
};
use mend_queue::{FailedBatchLedger, FailureQueue};
use mend_registry::{PluginRegistry, PluginStore, RegistryError};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Storage the workflow reads and writes
#[derive(Debug, Clone)]
pub struct Stores {
    pub queue: Arc<FailureQueue>,
    pub ledger: Arc<FailedBatchLedger>,
    pub registry: Arc<PluginRegistry>,
    pub plugins: PluginStore,
}

impl Stores {
    /// Open every store named in `config` and load installed plugins
    ///
    /// # Errors
    /// Any store that cannot be opened.
    pub fn open(config: &MendConfig) -> Result<Self, WorkflowError> {
        let queue = FailureQueue::open(&config.paths.queue)?;
        let ledger = FailedBatchLedger::open(&config.paths.ledger)?;
        let plugins = PluginStore::open(&config.paths.plugins)?;
        let registry = PluginRegistry::open(&plugins)?;
        Ok(Self {
            queue: Arc::new(queue),
            ledger: Arc::new(ledger),
            registry: Arc::new(registry),
            plugins,
        })
    }
}

/// External services the workflow calls
#[derive(Clone)]
pub struct Collaborators {
    pub analyzer: Arc<dyn ClusterAnalyzer>,
    pub generator: Arc<dyn CodeGenerator>,
    pub runner: Arc<dyn TestRunner>,
}

impl Collaborators {
    /// Collaborators with the in-process [`RuleTestRunner`]
    #[must_use]
    pub fn new(analyzer: Arc<dyn ClusterAnalyzer>, generator: Arc<dyn CodeGenerator>) -> Self {
        Self {
            analyzer,
            generator,
            runner: Arc::new(RuleTestRunner::new()),
        }
    }

    #[must_use]
    pub fn with_runner(mut self, runner: Arc<dyn TestRunner>) -> Self {
        self.runner = runner;
        self
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}

/// How a batch ended
#[derive(Debug, Clone, PartialEq)]
pub enum BatchOutcome {
    /// Empty queue, or no cluster worth processing
    Idle { batch_id: BatchId },
    /// Tests passed, the registry swapped, the batch's records were removed
    Installed {
        batch_id: BatchId,
        generation: Generation,
        clusters: Vec<ClusterId>,
        removed: usize,
        retry_count: u32,
    },
    /// Retry budget spent; recorded in the ledger
    Exhausted { entry: FailedBatchEntry },
}

impl BatchOutcome {
    #[must_use]
    pub fn batch_id(&self) -> BatchId {
        match self {
            Self::Idle { batch_id } | Self::Installed { batch_id, .. } => *batch_id,
            Self::Exhausted { entry } => entry.batch_id,
        }
    }

    /// Terminal state the batch reached
    #[must_use]
    pub fn state(&self) -> WorkflowState {
        match self {
            Self::Idle { .. } => WorkflowState::Idle,
            Self::Installed { .. } => WorkflowState::Success,
            Self::Exhausted { .. } => WorkflowState::Failure,
        }
    }
}

/// Batch driver
#[derive(Debug)]
pub struct UpdateWorkflow {
    config: MendConfig,
    stores: Stores,
    collaborators: Collaborators,
    active: Mutex<()>,
}

impl UpdateWorkflow {
    #[must_use]
    pub fn new(config: MendConfig, stores: Stores, collaborators: Collaborators) -> Self {
        Self {
            config,
            stores,
            collaborators,
            active: Mutex::new(()),
        }
    }

    #[inline]
    #[must_use]
    pub fn config(&self) -> &MendConfig {
        &self.config
    }

    #[inline]
    #[must_use]
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Whether a batch is running right now
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.active.try_lock().is_err()
    }

    /// Process one batch to a terminal state
    ///
    /// # Workflow
    /// 1. REASON: snapshot the queue, cluster it, normalize and select
    /// 2. PLAN: ask the generator for per-cluster plans, with feedback from
    ///    the previous attempt
    /// 3. ACT: generate module and test source for every selected cluster
    /// 4. VALIDATE: stage, run tests under the timeout, reload the registry
    /// 5. Any failed attempt returns to PLAN until the retry budget is spent
    ///
    /// # Errors
    /// - `WorkflowError::BatchInProgress` if another batch is running
    /// - `WorkflowError::Clustering` if the analyzer fails; nothing is
    ///   written anywhere
    /// - `WorkflowError::Registry` if the registry is shut down, before or
    ///   during the batch; the queue and ledger are left untouched
    /// - storage errors, which abandon the batch with the queue untouched
    pub async fn run_batch(&self) -> Result<BatchOutcome, WorkflowError> {
        let Ok(_active) = self.active.try_lock() else {
            return Err(WorkflowError::BatchInProgress);
        };
        if self.stores.registry.is_closed() {
            return Err(RegistryError::Closed.into());
        }

        let queue = Arc::clone(&self.stores.queue);
        let snapshot = blocking(move || queue.snapshot()).await?;
        let mut run = WorkflowRun::new(BatchId::new(), snapshot);
        tracing::info!(
            batch_id = %run.batch_id,
            "Starting batch over {} queued failures (fence {:?})",
            run.snapshot.len(),
            run.snapshot.fence
        );

        // REASON
        if run.snapshot.is_empty() {
            return self.idle(&mut run, "queue is empty");
        }
        run.clusters = self.reason(&run.snapshot).await?;
        if run.clusters.is_empty() {
            return self.idle(&mut run, "no clusters selected");
        }
        tracing::info!(
            batch_id = %run.batch_id,
            "Selected {} clusters: {:?}",
            run.clusters.len(),
            run.cluster_ids()
        );
        run.advance(StepOutcome::Proceed)?;

        let result = self.attempts(&mut run).await;
        staging::clean(&self.config.paths.staging, run.batch_id).await;
        match result {
            Ok(generation) => self.install(&run, generation).await,
            Err(AttemptError::Failed(_)) => self.give_up(&run).await,
            Err(AttemptError::Fatal(e)) => {
                tracing::error!(batch_id = %run.batch_id, "Batch abandoned: {}", e);
                Err(e)
            }
        }
    }

    fn idle(&self, run: &mut WorkflowRun, why: &str) -> Result<BatchOutcome, WorkflowError> {
        run.advance(StepOutcome::Empty)?;
        tracing::info!(batch_id = %run.batch_id, "Nothing to do: {}", why);
        Ok(BatchOutcome::Idle {
            batch_id: run.batch_id,
        })
    }

    async fn reason(&self, snapshot: &QueueSnapshot) -> Result<Vec<ErrorCluster>, WorkflowError> {
        let raw = guarded(
            "cluster analyzer",
            self.collaborators.analyzer.cluster(&snapshot.records),
        )
        .await
        .map_err(WorkflowError::Clustering)?;

        let mut normalized = normalize_clusters(raw, snapshot);
        let selected = select(&normalized, self.config.cluster_batch_size);
        Ok(selected
            .iter()
            .filter_map(|id| {
                let pos = normalized.iter().position(|c| &c.cluster_id == id)?;
                Some(normalized.swap_remove(pos))
            })
            .collect())
    }

    /// Attempt loop. `Ok` carries the generation the registry swapped to;
    /// `Err(Failed)` means the retry budget is spent.
    async fn attempts(&self, run: &mut WorkflowRun) -> Result<Generation, AttemptError> {
        loop {
            let started_at = Utc::now();
            match self.attempt(run).await {
                Ok(generation) => {
                    let report = run.last_report.clone();
                    run.record_attempt(started_at, None, report.as_ref());
                    return Ok(generation);
                }
                Err(AttemptError::Failed(failure)) => {
                    tracing::warn!(
                        batch_id = %run.batch_id,
                        attempt = run.attempt(),
                        "Attempt failed: {}",
                        failure
                    );
                    let report = run.last_report.take();
                    run.record_attempt(started_at, Some(failure.clone()), report.as_ref());
                    run.retry_count += 1;
                    let outcome = after_failure(run.retry_count, self.config.max_retry_attempts);
                    if run.advance(outcome)? == WorkflowState::Failure {
                        return Err(failure.into());
                    }
                }
                Err(fatal) => return Err(fatal),
            }
        }
    }

    /// One PLAN → ACT → VALIDATE pass; leaves the run in SUCCESS on `Ok`
    async fn attempt(&self, run: &mut WorkflowRun) -> Result<Generation, AttemptError> {
        // PLAN
        let plugins = self.stores.plugins.clone();
        let existing_modules = blocking(move || plugins.summaries()).await?;
        let request = PlanRequest {
            batch_id: run.batch_id,
            attempt: run.attempt(),
            clusters: run.clusters.clone(),
            records: run.member_records(),
            existing_modules,
            feedback: run.feedback(),
        };
        let plans = guarded("code generator", self.collaborators.generator.plan(&request))
            .await
            .map_err(|e| AttemptFailure::Planning { message: e.message })?;
        if plans.is_empty() {
            return Err(AttemptFailure::Planning {
                message: "no plans produced".to_string(),
            }
            .into());
        }
        run.plans = plans;
        run.advance(StepOutcome::Proceed)?;

        // ACT
        let mut generated = guarded("code generator", self.collaborators.generator.generate(&run.plans))
            .await
            .map_err(|e| AttemptFailure::Generation { message: e.message })?;
        run.artifacts.clear();
        for cluster in &run.clusters {
            let artifact = generated.remove(&cluster.cluster_id).ok_or_else(|| {
                AttemptFailure::MissingArtifact {
                    cluster_id: cluster.cluster_id.clone(),
                }
            })?;
            check_sources(&artifact)?;
            run.artifacts.insert(cluster.cluster_id.clone(), artifact);
        }
        if !generated.is_empty() {
            tracing::debug!(
                batch_id = %run.batch_id,
                "Ignoring artifacts for unselected clusters: {:?}",
                generated.keys().collect::<Vec<_>>()
            );
        }
        run.advance(StepOutcome::Proceed)?;

        // VALIDATE
        let staged = staging::stage(
            &self.config.paths.staging,
            run.batch_id,
            run.attempt(),
            run.artifacts.values(),
        )
        .await?;
        let timeout = self.config.validation_timeout();
        let report = match tokio::time::timeout(
            timeout,
            guarded("test runner", self.collaborators.runner.run(&staged)),
        )
        .await
        {
            Err(_) => return Err(AttemptFailure::ValidationTimeout { timeout }.into()),
            Ok(Err(e)) => return Err(AttemptFailure::Runner { message: e.message }.into()),
            Ok(Ok(report)) => report,
        };
        let (all_passed, failed) = (report.all_passed, report.failed());
        run.last_report = Some(report);
        if !all_passed {
            return Err(AttemptFailure::TestsFailed { failed }.into());
        }

        let artifacts: Vec<CodeArtifact> = run.artifacts.values().cloned().collect();
        let generation = self.stores.registry.reload(&artifacts).map_err(|e| {
            // A closed registry aborts the batch instead of blaming the modules
            if e.is_rejection() {
                AttemptError::Failed(AttemptFailure::Reload {
                    message: e.to_string(),
                })
            } else {
                AttemptError::Fatal(e.into())
            }
        })?;
        run.advance(StepOutcome::Passed)?;
        Ok(generation)
    }

    async fn install(
        &self,
        run: &WorkflowRun,
        generation: Generation,
    ) -> Result<BatchOutcome, WorkflowError> {
        let artifacts: Vec<CodeArtifact> = run
            .artifacts
            .values()
            .map(|a| a.installed_in(generation))
            .collect();
        let plugins = self.stores.plugins.clone();
        blocking(move || plugins.persist(&artifacts)).await?;

        let queue = Arc::clone(&self.stores.queue);
        let (indices, fence) = (run.member_indices(), run.snapshot.fence);
        let report = blocking(move || queue.remove_fenced(&indices, fence)).await?;
        tracing::info!(
            batch_id = %run.batch_id,
            generation = %generation,
            retry_count = run.retry_count,
            "Batch installed; removed {} queued failures",
            report.removed
        );

        Ok(BatchOutcome::Installed {
            batch_id: run.batch_id,
            generation,
            clusters: run.cluster_ids(),
            removed: report.removed,
            retry_count: run.retry_count,
        })
    }

    async fn give_up(&self, run: &WorkflowRun) -> Result<BatchOutcome, WorkflowError> {
        let entry = run.ledger_entry();
        let (ledger, written) = (Arc::clone(&self.stores.ledger), entry.clone());
        blocking(move || ledger.append(&written)).await?;
        tracing::warn!(
            batch_id = %run.batch_id,
            retry_count = run.retry_count,
            "Retries exhausted; batch recorded for review ({} clusters, {} failures)",
            entry.clusters.len(),
            entry.error_count
        );
        Ok(BatchOutcome::Exhausted { entry })
    }
}

fn check_sources(artifact: &CodeArtifact) -> Result<(), AttemptFailure> {
    for (what, source) in [
        ("module", &artifact.module_source),
        ("test", &artifact.test_source),
    ] {
        if source.trim().is_empty() {
            return Err(AttemptFailure::EmptySource {
                cluster_id: artifact.cluster_id.clone(),
                what,
            });
        }
    }
    Ok(())
}

/// Run queue, ledger or plugin-store I/O on the blocking pool
///
/// These calls fsync and may wait on another process's file lock.
pub(crate) async fn blocking<T, E>(
    op: impl FnOnce() -> Result<T, E> + Send + 'static,
) -> Result<T, WorkflowError>
where
    T: Send + 'static,
    E: Send + 'static,
    WorkflowError: From<E>,
{
    Ok(tokio::task::spawn_blocking(op).await??)
}

/// Await a collaborator call, turning a panic into a `CollaboratorError`
async fn guarded<T>(
    who: &str,
    call: impl Future<Output = Result<T, CollaboratorError>>,
) -> Result<T, CollaboratorError> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(_) => Err(CollaboratorError::new(format!("{who} panicked"))),
    }
}
