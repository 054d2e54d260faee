//! Mend Workflow - turns queued parse failures into installed plugins
//!
//! - [`UpdateWorkflow`]: the REASON → PLAN → ACT → VALIDATE loop with a
//!   bounded retry budget
//! - [`state_machine`]: the typed transition table it runs on
//! - [`select`]: deterministic cluster selection
//! - collaborator traits for clustering, code generation and test runs,
//!   plus [`RuleTestRunner`] for rule modules
//! - [`Pipeline`]: threshold trigger
//! - [`HealingParser`]: call-site facade that queues what it cannot parse
//!
//! # Example
//!
//! ```rust,ignore
//! use mend_core::MendConfig;
//! use mend_workflow::{BatchOutcome, Collaborators, Stores, UpdateWorkflow};
//!
//! let config = MendConfig::load("mend.toml")?;
//! let stores = Stores::open(&config)?;
//! let workflow = UpdateWorkflow::new(config, stores, Collaborators::new(analyzer, generator));
//!
//! match workflow.run_batch().await? {
//!     BatchOutcome::Installed { generation, .. } => println!("now serving {generation}"),
//!     other => println!("{other:?}"),
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod collaborators;
pub mod error;
pub mod intercept;
pub mod pipeline;
pub mod run;
pub mod runner;
pub mod selector;
pub mod staging;
pub mod state_machine;
pub mod workflow;

pub use collaborators::{
    ClusterAnalyzer, ClusterPlan, CodeGenerator, CollaboratorError, PlanRequest, StagedBatch,
    StagedModule, TestCaseReport, TestReport, TestRunner,
};
pub use error::{AttemptFailure, WorkflowError};
pub use intercept::{HealingParser, InterceptError};
pub use pipeline::Pipeline;
pub use run::{AttemptRecord, WorkflowRun};
pub use runner::RuleTestRunner;
pub use selector::{normalize_clusters, select};
pub use state_machine::{StepOutcome, TransitionError, WorkflowState};
pub use workflow::{BatchOutcome, Collaborators, Stores, UpdateWorkflow};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
