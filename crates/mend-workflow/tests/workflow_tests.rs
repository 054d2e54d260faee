//! End-to-end batches over real storage with scripted collaborators

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use mend_core::{ErrorCluster, FailureRecord, Generation, Parsability, SequenceIndex};
use mend_registry::{MatchSource, RegistryError};
use mend_test_utils::{
    cluster_id, fixtures, seed_queue, Script, ScriptedGenerator, SingleClusterAnalyzer,
    StallingRunner, TestEnv,
};
use mend_workflow::{
    BatchOutcome, ClusterAnalyzer, CollaboratorError, Collaborators, Pipeline, StagedBatch,
    Stores, TestReport, TestRunner, UpdateWorkflow, WorkflowError,
};
use mockall::mock;
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

mock! {
    pub Analyzer {}

    #[async_trait]
    impl ClusterAnalyzer for Analyzer {
        async fn cluster(&self, records: &[FailureRecord]) -> Result<Vec<ErrorCluster>, CollaboratorError>;
    }
}

mock! {
    pub Runner {}

    #[async_trait]
    impl TestRunner for Runner {
        async fn run(&self, batch: &StagedBatch) -> Result<TestReport, CollaboratorError>;
    }
}

fn passed() -> TestReport {
    TestReport {
        all_passed: true,
        per_test_results: Vec::new(),
        raw_output: "4 passed, 0 failed".to_string(),
    }
}

fn workflow_with_runner(
    env: &TestEnv,
    stores: &Stores,
    generator: Arc<ScriptedGenerator>,
    runner: MockRunner,
) -> UpdateWorkflow {
    let collaborators = Collaborators::new(Arc::new(SingleClusterAnalyzer::new()), generator)
        .with_runner(Arc::new(runner));
    UpdateWorkflow::new(env.config.clone(), stores.clone(), collaborators)
}

fn workflow(env: &TestEnv, generator: Arc<ScriptedGenerator>) -> (UpdateWorkflow, Stores) {
    let stores = env.open_stores();
    let collaborators = Collaborators::new(Arc::new(SingleClusterAnalyzer::new()), generator);
    (
        UpdateWorkflow::new(env.config.clone(), stores.clone(), collaborators),
        stores,
    )
}

fn all_indices() -> BTreeSet<SequenceIndex> {
    (0..5).map(SequenceIndex).collect()
}

#[tokio::test]
async fn failing_attempt_then_passing_attempt_installs() {
    let env = TestEnv::new();
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Script::sources(fixtures::BROKEN_MODULE, fixtures::SUITE),
        Script::sources(fixtures::MODULE, fixtures::SUITE),
    ]));
    let (workflow, stores) = workflow(&env, Arc::clone(&generator));
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let outcome = workflow.run_batch().await.unwrap();

    let (generation, clusters, removed, retry_count) = match outcome {
        BatchOutcome::Installed {
            generation,
            clusters,
            removed,
            retry_count,
            ..
        } => (generation, clusters, removed, retry_count),
        other => panic!("expected install, got {other:?}"),
    };
    assert_eq!(generation, Generation(2));
    assert_eq!(clusters, vec![cluster_id()]);
    assert_eq!(removed, 5);
    assert_eq!(retry_count, 1);

    assert!(stores.queue.is_empty().unwrap());
    assert!(stores.ledger.is_empty().unwrap());
    assert_eq!(stores.registry.generation(), Generation(2));
    assert!(stores.plugins.module_path(&cluster_id()).exists());
    assert!(stores.plugins.test_path(&cluster_id()).exists());

    let now = Utc.with_ymd_and_hms(2025, 1, 6, 9, 0, 0).unwrap();
    let parsed = stores.registry.parse_at("Day after tomorrow.", now).unwrap();
    assert_eq!(parsed.value, Utc.with_ymd_and_hms(2025, 1, 8, 9, 0, 0).unwrap());
    assert_eq!(parsed.source, MatchSource::Plugin(cluster_id()));

    // Staging is cleaned up once the batch ends
    let staged = std::fs::read_dir(&env.config.paths.staging).unwrap().count();
    assert_eq!(staged, 0);
}

#[tokio::test]
async fn retry_feeds_previous_output_into_plan() {
    let env = TestEnv::new();
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Script::sources(fixtures::BROKEN_MODULE, fixtures::SUITE),
        Script::sources(fixtures::MODULE, fixtures::SUITE),
    ]));
    let (workflow, stores) = workflow(&env, Arc::clone(&generator));
    seed_queue(&stores.queue, &fixtures::INPUTS);

    workflow.run_batch().await.unwrap();

    let requests = generator.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].attempt, 1);
    assert_eq!(requests[0].feedback, None);
    assert_eq!(requests[0].records.len(), 5);
    assert_eq!(requests[1].attempt, 2);
    let feedback = requests[1].feedback.as_deref().unwrap();
    assert!(feedback.contains("test_relative_dates::day_after_tomorrow FAILED"));

    // Same clusters on every attempt
    assert_eq!(requests[0].clusters, requests[1].clusters);
}

#[tokio::test]
async fn never_passing_batch_goes_to_ledger() {
    let env = TestEnv::new();
    let generator = Arc::new(ScriptedGenerator::always(
        fixtures::BROKEN_MODULE,
        fixtures::SUITE,
    ));
    let (workflow, stores) = workflow(&env, Arc::clone(&generator));
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let outcome = workflow.run_batch().await.unwrap();

    let entry = match outcome {
        BatchOutcome::Exhausted { entry } => entry,
        other => panic!("expected exhaustion, got {other:?}"),
    };
    assert_eq!(entry.retry_count, 3);
    assert_eq!(entry.clusters, vec![cluster_id()]);
    assert_eq!(entry.error_count, 5);
    assert_eq!(entry.error_samples.len(), 3);
    assert!(entry.last_test_output.contains("3 passed, 1 failed"));

    let ledger = stores.ledger.entries().unwrap();
    assert_eq!(ledger, vec![entry]);
    assert_eq!(stores.queue.snapshot().unwrap().indices(), all_indices());
    assert_eq!(stores.registry.generation(), Generation::INITIAL);
    assert_eq!(generator.requests().len(), 3);
}

#[tokio::test]
async fn retry_budget_is_exact() {
    for max in 1..=4 {
        let env = TestEnv::new().with_config(|c| c.with_max_retry_attempts(max));
        let generator = Arc::new(ScriptedGenerator::always(
            fixtures::BROKEN_MODULE,
            fixtures::SUITE,
        ));
        let (workflow, stores) = workflow(&env, Arc::clone(&generator));
        seed_queue(&stores.queue, &fixtures::INPUTS);

        let outcome = workflow.run_batch().await.unwrap();

        assert!(matches!(outcome, BatchOutcome::Exhausted { ref entry } if entry.retry_count == max));
        assert_eq!(generator.requests().len(), max as usize);
        assert_eq!(stores.ledger.len().unwrap(), 1);
    }
}

#[tokio::test]
async fn generator_failures_consume_retries() {
    let env = TestEnv::new();
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Script::PlanError("model unavailable".to_string()),
        Script::EmptyPlan,
        Script::NoArtifacts,
    ]));
    let (workflow, stores) = workflow(&env, Arc::clone(&generator));
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let outcome = workflow.run_batch().await.unwrap();

    let entry = match outcome {
        BatchOutcome::Exhausted { entry } => entry,
        other => panic!("expected exhaustion, got {other:?}"),
    };
    assert_eq!(entry.retry_count, 3);
    assert!(entry
        .last_test_output
        .contains("no artifact generated for cluster relative_dates"));
    let requests = generator.requests();
    assert_eq!(
        requests[1].feedback.as_deref(),
        Some("planning failed: model unavailable")
    );
}

#[tokio::test]
async fn generator_recovers_after_plan_error() {
    let env = TestEnv::new();
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Script::PlanError("rate limited".to_string()),
        Script::sources(fixtures::MODULE, fixtures::SUITE),
    ]));
    let (workflow, stores) = workflow(&env, generator);
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let outcome = workflow.run_batch().await.unwrap();
    assert!(matches!(
        outcome,
        BatchOutcome::Installed { retry_count: 1, .. }
    ));
}

#[tokio::test]
async fn empty_test_source_fails_the_attempt() {
    let env = TestEnv::new().with_config(|c| c.with_max_retry_attempts(1));
    let generator = Arc::new(ScriptedGenerator::always(fixtures::MODULE, "  "));
    let (workflow, stores) = workflow(&env, generator);
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let BatchOutcome::Exhausted { entry } = workflow.run_batch().await.unwrap() else {
        panic!("expected exhaustion");
    };
    assert_eq!(
        entry.last_test_output,
        "empty test source generated for cluster relative_dates"
    );
    assert_eq!(stores.queue.len().unwrap(), 5);
}

#[tokio::test]
async fn uncompilable_module_fails_validation() {
    let env = TestEnv::new().with_config(|c| c.with_max_retry_attempts(1));
    let generator = Arc::new(ScriptedGenerator::always(
        fixtures::GARBAGE_MODULE,
        fixtures::SUITE,
    ));
    let (workflow, stores) = workflow(&env, generator);
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let BatchOutcome::Exhausted { entry } = workflow.run_batch().await.unwrap() else {
        panic!("expected exhaustion");
    };
    assert!(entry.last_test_output.contains("test_relative_dates::compile FAILED"));
    assert_eq!(stores.registry.generation(), Generation::INITIAL);
}

#[tokio::test]
async fn validation_timeout_counts_as_attempt() {
    let env = TestEnv::new().with_config(|c| {
        c.with_max_retry_attempts(1)
            .with_validation_timeout(Duration::from_secs(1))
    });
    let stores = env.open_stores();
    let generator = Arc::new(ScriptedGenerator::always(fixtures::MODULE, fixtures::SUITE));
    let collaborators = Collaborators::new(Arc::new(SingleClusterAnalyzer::new()), generator)
        .with_runner(Arc::new(StallingRunner {
            delay: Duration::from_secs(30),
        }));
    let workflow = UpdateWorkflow::new(env.config.clone(), stores.clone(), collaborators);
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let BatchOutcome::Exhausted { entry } = workflow.run_batch().await.unwrap() else {
        panic!("expected exhaustion");
    };
    assert_eq!(entry.retry_count, 1);
    assert_eq!(entry.last_test_output, "validation timed out after 1s");
    assert_eq!(stores.queue.len().unwrap(), 5);
}

#[tokio::test]
async fn clustering_error_leaves_everything_untouched() {
    let env = TestEnv::new();
    let stores = env.open_stores();
    let mut analyzer = MockAnalyzer::new();
    analyzer
        .expect_cluster()
        .times(1)
        .returning(|_| Err(CollaboratorError::new("clustering service down")));
    let generator = Arc::new(ScriptedGenerator::always(fixtures::MODULE, fixtures::SUITE));
    let workflow = UpdateWorkflow::new(
        env.config.clone(),
        stores.clone(),
        Collaborators::new(Arc::new(analyzer), generator.clone()),
    );
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let err = workflow.run_batch().await.unwrap_err();

    assert!(matches!(err, WorkflowError::Clustering(_)));
    assert!(!err.is_fatal());
    assert_eq!(stores.queue.snapshot().unwrap().indices(), all_indices());
    assert!(stores.ledger.is_empty().unwrap());
    assert!(generator.requests().is_empty());
}

#[tokio::test]
async fn empty_queue_is_idle() {
    let env = TestEnv::new();
    let generator = Arc::new(ScriptedGenerator::always(fixtures::MODULE, fixtures::SUITE));
    let (workflow, stores) = workflow(&env, Arc::clone(&generator));

    let outcome = workflow.run_batch().await.unwrap();

    assert!(matches!(outcome, BatchOutcome::Idle { .. }));
    assert!(stores.ledger.is_empty().unwrap());
    assert!(generator.requests().is_empty());
}

#[tokio::test]
async fn clusters_outside_snapshot_are_idle() {
    let env = TestEnv::new();
    let stores = env.open_stores();
    let mut analyzer = MockAnalyzer::new();
    analyzer.expect_cluster().returning(|_| {
        Ok(vec![ErrorCluster::new(
            cluster_id(),
            [SequenceIndex(40), SequenceIndex(41)],
            Parsability::Parsable,
        )])
    });
    let generator = Arc::new(ScriptedGenerator::always(fixtures::MODULE, fixtures::SUITE));
    let workflow = UpdateWorkflow::new(
        env.config.clone(),
        stores.clone(),
        Collaborators::new(Arc::new(analyzer), generator),
    );
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let outcome = workflow.run_batch().await.unwrap();

    assert!(matches!(outcome, BatchOutcome::Idle { .. }));
    assert_eq!(stores.queue.len().unwrap(), 5);
}

#[tokio::test]
async fn records_queued_during_a_batch_survive_it() {
    let env = TestEnv::new();
    let stores = env.open_stores();
    let generator = Arc::new(ScriptedGenerator::always(fixtures::MODULE, fixtures::SUITE));
    let collaborators = Collaborators::new(Arc::new(SingleClusterAnalyzer::new()), generator)
        .with_runner(Arc::new(StallingRunner {
            delay: Duration::from_millis(300),
        }));
    let workflow = Arc::new(UpdateWorkflow::new(
        env.config.clone(),
        stores.clone(),
        collaborators,
    ));
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let running = tokio::spawn({
        let workflow = Arc::clone(&workflow);
        async move { workflow.run_batch().await }
    });
    while !workflow.is_busy() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // A second batch is refused while the first runs
    assert!(matches!(
        workflow.run_batch().await,
        Err(WorkflowError::BatchInProgress)
    ));
    let late = seed_queue(&stores.queue, &["next thursday"]);

    let outcome = running.await.unwrap().unwrap();
    assert!(matches!(outcome, BatchOutcome::Installed { removed: 5, .. }));

    let left = stores.queue.snapshot().unwrap();
    assert_eq!(left.records, late);
}

#[tokio::test]
async fn pipeline_waits_for_threshold() {
    let env = TestEnv::new().with_config(|c| c.with_activation_threshold(5));
    let generator = Arc::new(ScriptedGenerator::always(fixtures::MODULE, fixtures::SUITE));
    let (workflow, stores) = workflow(&env, generator);
    let pipeline = Pipeline::new(workflow);

    seed_queue(&stores.queue, &fixtures::INPUTS[..4]);
    assert!(!pipeline.is_due().await.unwrap());
    assert_eq!(pipeline.run_if_due().await.unwrap(), None);

    seed_queue(&stores.queue, &fixtures::INPUTS[4..]);
    let outcome = pipeline.run_if_due().await.unwrap();
    assert!(matches!(outcome, Some(BatchOutcome::Installed { removed: 5, .. })));
    assert!(stores.queue.is_empty().unwrap());
}

#[tokio::test]
async fn rejected_reload_consumes_a_retry() {
    let env = TestEnv::new();
    let stores = env.open_stores();
    let generator = Arc::new(ScriptedGenerator::new(vec![
        Script::sources(fixtures::GARBAGE_MODULE, fixtures::SUITE),
        Script::sources(fixtures::MODULE, fixtures::SUITE),
    ]));
    let mut runner = MockRunner::new();
    runner.expect_run().times(2).returning(|_| Ok(passed()));
    let workflow = workflow_with_runner(&env, &stores, generator.clone(), runner);
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let outcome = workflow.run_batch().await.unwrap();

    let (generation, retry_count) = match outcome {
        BatchOutcome::Installed {
            generation,
            retry_count,
            ..
        } => (generation, retry_count),
        other => panic!("expected install, got {other:?}"),
    };
    assert_eq!(retry_count, 1);
    // The rejected reload never produced a generation
    assert_eq!(generation, Generation(2));
    let requests = generator.requests();
    assert!(requests[1]
        .feedback
        .as_deref()
        .unwrap()
        .starts_with("reload rejected:"));
    assert!(stores.queue.is_empty().unwrap());
}

#[tokio::test]
async fn rejected_reloads_exhaust_to_ledger() {
    let env = TestEnv::new().with_config(|c| c.with_max_retry_attempts(2));
    let stores = env.open_stores();
    let generator = Arc::new(ScriptedGenerator::always(
        fixtures::GARBAGE_MODULE,
        fixtures::SUITE,
    ));
    let mut runner = MockRunner::new();
    runner.expect_run().times(2).returning(|_| Ok(passed()));
    let workflow = workflow_with_runner(&env, &stores, generator, runner);
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let entry = match workflow.run_batch().await.unwrap() {
        BatchOutcome::Exhausted { entry } => entry,
        other => panic!("expected exhaustion, got {other:?}"),
    };
    assert_eq!(entry.retry_count, 2);
    assert!(entry.last_test_output.starts_with("reload rejected:"));
    assert_eq!(stores.registry.generation(), Generation::INITIAL);
    assert_eq!(stores.ledger.entries().unwrap(), vec![entry]);
    assert_eq!(stores.queue.snapshot().unwrap().indices(), all_indices());
}

#[tokio::test]
async fn shut_down_registry_refuses_batches() {
    let env = TestEnv::new();
    let generator = Arc::new(ScriptedGenerator::always(fixtures::MODULE, fixtures::SUITE));
    let (workflow, stores) = workflow(&env, Arc::clone(&generator));
    seed_queue(&stores.queue, &fixtures::INPUTS);
    stores.registry.shutdown();

    let err = workflow.run_batch().await.unwrap_err();

    assert!(matches!(err, WorkflowError::Registry(RegistryError::Closed)));
    assert!(err.is_fatal());
    assert!(generator.requests().is_empty());
    assert!(stores.ledger.is_empty().unwrap());
    assert_eq!(stores.queue.snapshot().unwrap().indices(), all_indices());
}

#[tokio::test]
async fn shutdown_during_validation_abandons_batch() {
    let env = TestEnv::new();
    let stores = env.open_stores();
    let generator = Arc::new(ScriptedGenerator::always(fixtures::MODULE, fixtures::SUITE));
    let mut runner = MockRunner::new();
    let registry = Arc::clone(&stores.registry);
    runner.expect_run().times(1).returning(move |_| {
        registry.shutdown();
        Ok(passed())
    });
    let workflow = workflow_with_runner(&env, &stores, generator.clone(), runner);
    seed_queue(&stores.queue, &fixtures::INPUTS);

    let err = workflow.run_batch().await.unwrap_err();

    assert!(matches!(err, WorkflowError::Registry(RegistryError::Closed)));
    assert_eq!(generator.requests().len(), 1);
    assert!(stores.ledger.is_empty().unwrap());
    assert_eq!(stores.queue.snapshot().unwrap().indices(), all_indices());
}
