//! Immutable registry generations
//!
//! A [`RegistryGeneration`] is built once and never modified. Updating the
//! registry means building a successor generation and swapping the pointer.

use crate::plugin::TimeParserPlugin;
use mend_core::{ClusterId, CodeArtifact, Generation, ModuleSummary};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Maximum description length handed out in summaries
pub const SUMMARY_DESCRIPTION_LIMIT: usize = 150;

/// A loaded plugin bound to a cluster, tagged with its generation
#[derive(Clone)]
pub struct PluginEntry {
    cluster_id: ClusterId,
    generation: Generation,
    plugin: Arc<dyn TimeParserPlugin>,
    artifact: Option<CodeArtifact>,
}

impl PluginEntry {
    #[inline]
    #[must_use]
    pub fn cluster_id(&self) -> &ClusterId {
        &self.cluster_id
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn plugin(&self) -> &dyn TimeParserPlugin {
        self.plugin.as_ref()
    }

    /// Source this entry was compiled from; `None` for native plugins
    #[inline]
    #[must_use]
    pub fn artifact(&self) -> Option<&CodeArtifact> {
        self.artifact.as_ref()
    }

    /// Description truncated for code-generation context
    #[must_use]
    pub fn summary(&self) -> ModuleSummary {
        ModuleSummary {
            cluster_id: self.cluster_id.clone(),
            description: truncate(self.plugin.description(), SUMMARY_DESCRIPTION_LIMIT),
        }
    }

    /// Same plugin, re-tagged for a successor generation
    fn carried_into(&self, generation: Generation) -> Self {
        Self {
            cluster_id: self.cluster_id.clone(),
            generation,
            plugin: Arc::clone(&self.plugin),
            artifact: self.artifact.as_ref().map(|a| a.installed_in(generation)),
        }
    }
}

impl fmt::Debug for PluginEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginEntry")
            .field("cluster_id", &self.cluster_id)
            .field("generation", &self.generation)
            .field("native", &self.artifact.is_none())
            .finish_non_exhaustive()
    }
}

/// A validated plugin waiting to be placed in a generation
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) cluster_id: ClusterId,
    pub(crate) plugin: Arc<dyn TimeParserPlugin>,
    pub(crate) artifact: Option<CodeArtifact>,
}

/// Immutable `cluster_id → PluginEntry` mapping plus its generation number
#[derive(Debug, Clone)]
pub struct RegistryGeneration {
    generation: Generation,
    entries: BTreeMap<ClusterId, PluginEntry>,
}

impl RegistryGeneration {
    /// Generation with no plugins
    #[must_use]
    pub fn empty(generation: Generation) -> Self {
        Self {
            generation,
            entries: BTreeMap::new(),
        }
    }

    /// Build a generation directly from validated candidates
    pub(crate) fn from_candidates(
        generation: Generation,
        candidates: impl IntoIterator<Item = Candidate>,
    ) -> Self {
        let mut next = Self::empty(generation);
        next.insert_all(candidates);
        next
    }

    /// Next generation: every current entry not being replaced, plus the
    /// candidates. All entries are new objects tagged with the new number.
    pub(crate) fn successor(&self, candidates: impl IntoIterator<Item = Candidate>) -> Self {
        let generation = self.generation.next();
        let mut next = Self {
            generation,
            entries: self
                .entries
                .iter()
                .map(|(id, entry)| (id.clone(), entry.carried_into(generation)))
                .collect(),
        };
        next.insert_all(candidates);
        next
    }

    fn insert_all(&mut self, candidates: impl IntoIterator<Item = Candidate>) {
        for candidate in candidates {
            let entry = PluginEntry {
                cluster_id: candidate.cluster_id.clone(),
                generation: self.generation,
                plugin: candidate.plugin,
                artifact: candidate.artifact.map(|a| a.installed_in(self.generation)),
            };
            self.entries.insert(candidate.cluster_id, entry);
        }
    }

    #[inline]
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    #[inline]
    #[must_use]
    pub fn get(&self, cluster_id: &ClusterId) -> Option<&PluginEntry> {
        self.entries.get(cluster_id)
    }

    #[inline]
    #[must_use]
    pub fn contains(&self, cluster_id: &ClusterId) -> bool {
        self.entries.contains_key(cluster_id)
    }

    /// Entries in ascending `cluster_id` order
    pub fn entries(&self) -> impl Iterator<Item = &PluginEntry> {
        self.entries.values()
    }

    #[must_use]
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        self.entries.keys().cloned().collect()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn summaries(&self) -> Vec<ModuleSummary> {
        self.entries.values().map(PluginEntry::summary).collect()
    }
}

pub(crate) fn truncate(text: &str, limit: usize) -> String {
    match text.char_indices().nth(limit) {
        Some((cut, _)) => text[..cut].to_string(),
        None => text.to_string(),
    }
}
