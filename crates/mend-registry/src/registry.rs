//! Plugin registry
//!
//! Readers load the current generation with a single atomic pointer load
//! and never take a lock. Writers (reload, shutdown) are serialized by a
//! mutex, build a complete successor generation off to the side, and
//! publish it with one pointer store. A retired generation is freed when
//! the last reader still holding it returns.

use crate::error::RegistryError;
use crate::generation::{Candidate, RegistryGeneration};
use crate::plugin::{call_guarded, CallResult, MatchSource, ParseOutcome, TimeParserPlugin};
use crate::rules::{normalize, ModuleCompiler, RuleModuleCompiler};
use crate::store::PluginStore;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use mend_core::{ClusterId, CodeArtifact, Generation, ModuleLoadError, ModuleSummary, NoMatchError};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Inputs every plugin is exercised with before it can be installed
const SMOKE_PROBES: &[&str] = &[
    "",
    " ",
    "now",
    "tomorrow",
    "in 2 days",
    "next monday at 5pm",
    "a week from friday",
    "12:00",
    "\u{1f642}",
    "\u{0}",
];

/// Keywords recognized after every plugin declines
const BUILTIN_KEYWORDS: &[&str] = &["now", "asap"];

/// Live set of parsing plugins, swapped a whole generation at a time
#[derive(Debug)]
pub struct PluginRegistry {
    current: ArcSwap<RegistryGeneration>,
    compiler: Arc<dyn ModuleCompiler>,
    writer: Mutex<()>,
    closed: AtomicBool,
}

impl PluginRegistry {
    /// Empty registry at generation 1 using the rule module compiler
    #[must_use]
    pub fn new() -> Self {
        Self::with_compiler(Arc::new(RuleModuleCompiler))
    }

    /// Empty registry at generation 1 using `compiler` for module source
    #[must_use]
    pub fn with_compiler(compiler: Arc<dyn ModuleCompiler>) -> Self {
        Self {
            current: ArcSwap::from_pointee(RegistryGeneration::empty(Generation::INITIAL)),
            compiler,
            writer: Mutex::new(()),
            closed: AtomicBool::new(false),
        }
    }

    /// Build generation 1 from the modules installed in `store`
    ///
    /// Modules that fail validation are skipped with a warning.
    ///
    /// # Errors
    /// `RegistryError::Store` if the plugin directory cannot be read.
    pub fn open(store: &PluginStore) -> Result<Self, RegistryError> {
        Self::open_with_compiler(store, Arc::new(RuleModuleCompiler))
    }

    /// [`PluginRegistry::open`] with a custom compiler
    ///
    /// # Errors
    /// Same as [`PluginRegistry::open`].
    pub fn open_with_compiler(
        store: &PluginStore,
        compiler: Arc<dyn ModuleCompiler>,
    ) -> Result<Self, RegistryError> {
        let registry = Self::with_compiler(compiler);

        let mut candidates = Vec::new();
        for artifact in store.discover()? {
            match registry.prepare(&artifact) {
                Ok(candidate) => candidates.push(candidate),
                Err(e) => warn!("Skipping plugin module {}: {}", artifact.cluster_id, e),
            }
        }

        let initial = RegistryGeneration::from_candidates(Generation::INITIAL, candidates);
        info!(
            "Loaded {} plugin modules from {}",
            initial.len(),
            store.root().display()
        );
        registry.current.store(Arc::new(initial));
        Ok(registry)
    }

    /// Check an artifact without touching the live registry
    ///
    /// # Errors
    /// `ModuleLoadError` if the module does not compile, breaks the plugin
    /// contract, or panics on a probe input.
    pub fn validate(&self, artifact: &CodeArtifact) -> Result<(), ModuleLoadError> {
        self.prepare(artifact).map(|_| ())
    }

    /// Install `artifacts` as a new generation, all or nothing
    ///
    /// Every artifact is validated before the swap. On any failure the
    /// live generation is left exactly as it was. Artifacts fully replace
    /// existing entries with the same cluster id; other entries carry over.
    ///
    /// # Errors
    /// - `RegistryError::Load` if any artifact fails validation, or two
    ///   artifacts share a cluster id
    /// - `RegistryError::Closed` after [`PluginRegistry::shutdown`]
    pub fn reload(&self, artifacts: &[CodeArtifact]) -> Result<Generation, RegistryError> {
        let _writer = self.writer.lock();
        self.ensure_open()?;

        let mut seen = BTreeSet::new();
        for artifact in artifacts {
            if !seen.insert(&artifact.cluster_id) {
                return Err(ModuleLoadError::DuplicateCluster(artifact.cluster_id.clone()).into());
            }
        }

        let candidates = artifacts
            .iter()
            .map(|a| self.prepare(a))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                warn!("Reload rejected, generation unchanged: {}", e);
                e
            })?;

        Ok(self.publish(candidates))
    }

    /// Install a native plugin as a new generation
    ///
    /// # Errors
    /// - `RegistryError::Load` if the plugin panics on a probe input
    /// - `RegistryError::Closed` after [`PluginRegistry::shutdown`]
    pub fn install_plugin(
        &self,
        cluster_id: ClusterId,
        plugin: Arc<dyn TimeParserPlugin>,
    ) -> Result<Generation, RegistryError> {
        let _writer = self.writer.lock();
        self.ensure_open()?;
        smoke_test(&cluster_id, plugin.as_ref())?;
        Ok(self.publish(vec![Candidate {
            cluster_id,
            plugin,
            artifact: None,
        }]))
    }

    /// Parse `input` relative to the current time
    ///
    /// # Errors
    /// `NoMatchError` if no plugin and no builtin keyword matches.
    pub fn parse(&self, input: &str) -> Result<ParseOutcome, NoMatchError> {
        self.parse_at(input, Utc::now())
    }

    /// Parse `input` relative to `now`
    ///
    /// Loads the current generation once and tries its entries in ascending
    /// cluster id order; the first match wins. A plugin that errors or
    /// panics is skipped.
    ///
    /// # Errors
    /// `NoMatchError` if no plugin and no builtin keyword matches.
    pub fn parse_at(&self, input: &str, now: DateTime<Utc>) -> Result<ParseOutcome, NoMatchError> {
        let generation = self.current.load_full();

        for entry in generation.entries() {
            match call_guarded(entry.plugin(), input, now) {
                CallResult::Matched(value) => {
                    return Ok(ParseOutcome {
                        value,
                        source: MatchSource::Plugin(entry.cluster_id().clone()),
                        generation: generation.generation(),
                    });
                }
                CallResult::Declined => {}
                CallResult::Failed(e) => {
                    debug!("Plugin {} failed on {:?}: {}", entry.cluster_id(), input, e);
                }
                CallResult::Panicked(msg) => {
                    warn!("Plugin {} panicked on {:?}: {}", entry.cluster_id(), input, msg);
                }
            }
        }

        let normalized = normalize(input);
        if BUILTIN_KEYWORDS.contains(&normalized.as_str()) {
            return Ok(ParseOutcome {
                value: now,
                source: MatchSource::Builtin,
                generation: generation.generation(),
            });
        }

        Err(NoMatchError::new(input))
    }

    /// Snapshot of the current generation
    #[must_use]
    pub fn current(&self) -> Arc<RegistryGeneration> {
        self.current.load_full()
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.current.load().generation()
    }

    /// Summaries of the live entries
    #[must_use]
    pub fn summaries(&self) -> Vec<ModuleSummary> {
        self.current.load().summaries()
    }

    #[inline]
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Retire the current generation and refuse further reloads
    ///
    /// Readers holding the old generation finish normally; new parses see
    /// an empty generation. Calling it twice is harmless.
    pub fn shutdown(&self) {
        let _writer = self.writer.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let retired = self.current.load().generation();
        self.current
            .store(Arc::new(RegistryGeneration::empty(retired.next())));
        info!("Plugin registry shut down (retired generation {})", retired);
    }

    fn ensure_open(&self) -> Result<(), RegistryError> {
        if self.is_closed() {
            Err(RegistryError::Closed)
        } else {
            Ok(())
        }
    }

    /// Compile and smoke-test one artifact
    fn prepare(&self, artifact: &CodeArtifact) -> Result<Candidate, ModuleLoadError> {
        let cluster_id = &artifact.cluster_id;
        let compiled = panic::catch_unwind(AssertUnwindSafe(|| {
            self.compiler.compile(cluster_id, &artifact.module_source)
        }))
        .map_err(|_| ModuleLoadError::Panicked {
            cluster_id: cluster_id.clone(),
            message: "compiler panicked".to_string(),
        })?;
        let plugin = compiled?;
        smoke_test(cluster_id, plugin.as_ref())?;

        Ok(Candidate {
            cluster_id: cluster_id.clone(),
            plugin,
            artifact: Some(artifact.clone()),
        })
    }

    /// Swap in the successor generation; caller holds the writer lock
    fn publish(&self, candidates: Vec<Candidate>) -> Generation {
        let ids: Vec<String> = candidates.iter().map(|c| c.cluster_id.to_string()).collect();
        let next = self.current.load().successor(candidates);
        let generation = next.generation();
        let total = next.len();
        self.current.store(Arc::new(next));
        info!(
            "Published registry generation {} ({} plugins, updated: {})",
            generation,
            total,
            ids.join(", ")
        );
        generation
    }
}

impl Default for PluginRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn smoke_test(cluster_id: &ClusterId, plugin: &dyn TimeParserPlugin) -> Result<(), ModuleLoadError> {
    let now = Utc::now();
    for probe in SMOKE_PROBES {
        if let CallResult::Panicked(msg) = call_guarded(plugin, probe, now) {
            return Err(ModuleLoadError::Panicked {
                cluster_id: cluster_id.clone(),
                message: format!("on probe {probe:?}: {msg}"),
            });
        }
    }
    Ok(())
}
