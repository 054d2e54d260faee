//! Mend Core - shared vocabulary of the self-healing parser pipeline
//!
//! - Data model: failure records, snapshots, clusters, code artifacts,
//!   ledger entries
//! - Error taxonomy shared by the queue, registry and workflow crates
//! - Pipeline configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use mend_core::{ClusterId, MendConfig};
//!
//! let config = MendConfig::load("mend.toml")?;
//! let id = ClusterId::sanitize("Relative Dates");
//! assert_eq!(id.as_str(), "relative_dates");
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod error;
pub mod ids;
pub mod types;

pub use config::{MendConfig, PathsConfig};
pub use error::{ConfigError, ModuleLoadError, NoMatchError, QueueCorruption};
pub use ids::{BatchId, ClusterId, Generation, InvalidClusterId, SequenceIndex};
pub use types::{
    CodeArtifact, ErrorCluster, FailedBatchEntry, FailureRecord, ModuleSummary, NewFailure,
    Parsability, QueueSnapshot,
};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with mend
    pub use crate::{
        ClusterId, CodeArtifact, ErrorCluster, FailureRecord, Generation, MendConfig,
        NewFailure, Parsability, QueueSnapshot, SequenceIndex,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
