//! Mend Registry - hot-swappable parsing plugins
//!
//! - [`PluginRegistry`]: lock-free `parse()` over an immutable
//!   [`RegistryGeneration`], replaced wholesale by `reload()`
//! - [`TimeParserPlugin`]: the contract every installed module satisfies
//! - [`RuleModule`]: TOML rule modules, the source format generated code
//!   is written in
//! - [`PluginStore`]: module and test files on disk
//! - [`RuleSuite`]: per-module test suites
//!
//! # Example
//!
//! ```rust,ignore
//! use mend_registry::{PluginRegistry, PluginStore};
//!
//! let store = PluginStore::open("plugins")?;
//! let registry = PluginRegistry::open(&store)?;
//!
//! let outcome = registry.parse("in 3 days")?;
//! println!("{} (generation {})", outcome.value, outcome.generation);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod generation;
pub mod plugin;
pub mod registry;
pub mod rules;
pub mod store;
pub mod suite;

pub use error::{RegistryError, StoreError, SuiteError};
pub use generation::{PluginEntry, RegistryGeneration};
pub use plugin::{MatchSource, ParseOutcome, PluginError, TimeParserPlugin};
pub use registry::PluginRegistry;
pub use rules::{normalize, ModuleCompiler, RuleModule, RuleModuleCompiler};
pub use store::PluginStore;
pub use suite::{render_report, CaseResult, RuleSuite, SuiteCase};
