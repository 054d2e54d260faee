//! Identifier types
//!
//! - [`ClusterId`]: filesystem-safe cluster/module name
//! - [`BatchId`]: ULID naming one workflow run
//! - [`SequenceIndex`]: position of a record in the failure queue
//! - [`Generation`]: monotonic registry generation counter

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

/// Words that cannot name a module on their own.
const RESERVED_WORDS: &[&str] = &[
    "abstract", "as", "async", "await", "become", "box", "break", "const", "continue", "crate",
    "do", "dyn", "else", "enum", "extern", "false", "final", "fn", "for", "if", "impl", "in",
    "let", "loop", "macro", "match", "mod", "move", "mut", "override", "priv", "pub", "ref",
    "return", "self", "static", "struct", "super", "trait", "true", "try", "type", "typeof",
    "unsafe", "unsized", "use", "virtual", "where", "while", "yield",
];

/// Rejected cluster identifier
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid cluster id {raw:?} (sanitized form would be {suggested:?})")]
pub struct InvalidClusterId {
    /// The rejected input
    pub raw: String,
    /// What [`ClusterId::sanitize`] would produce
    pub suggested: String,
}

/// Stable, filesystem-safe cluster identifier
///
/// A valid id is non-empty, uses only `[a-z0-9_]`, does not start with a
/// digit or underscore, has no doubled or trailing underscores and is not a
/// reserved word. Ordering is plain string ordering, which is the order the
/// registry consults plugins in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ClusterId(String);

impl ClusterId {
    /// Accept an already-sanitized id
    ///
    /// # Errors
    /// Returns [`InvalidClusterId`] when `raw` differs from its sanitized form.
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidClusterId> {
        let raw = raw.into();
        let suggested = sanitize(&raw);
        if suggested == raw {
            Ok(Self(raw))
        } else {
            Err(InvalidClusterId { raw, suggested })
        }
    }

    /// Turn any label into a valid id
    ///
    /// # Examples
    /// - `"Relative Dates!"` → `relative_dates`
    /// - `"3 day offsets"` → `cluster_3_day_offsets`
    /// - `"match"` → `match_cluster`
    /// - `"!!!"` → `cluster`
    #[must_use]
    pub fn sanitize(raw: &str) -> Self {
        Self(sanitize(raw))
    }

    /// Borrow as str
    #[inline]
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn sanitize(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_underscore = false;
    for ch in raw.to_lowercase().chars() {
        let ch = if ch.is_ascii_lowercase() || ch.is_ascii_digit() {
            ch
        } else {
            '_'
        };
        if ch == '_' {
            if last_was_underscore {
                continue;
            }
            last_was_underscore = true;
        } else {
            last_was_underscore = false;
        }
        out.push(ch);
    }

    let mut id = out.trim_matches('_').to_string();

    if id.starts_with(|c: char| c.is_ascii_digit()) {
        id = format!("cluster_{id}");
    }

    if id.is_empty() {
        return "cluster".to_string();
    }
    if RESERVED_WORDS.contains(&id.as_str()) {
        id.push_str("_cluster");
    }
    id
}

impl TryFrom<String> for ClusterId {
    type Error = InvalidClusterId;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ClusterId> for String {
    fn from(value: ClusterId) -> Self {
        value.0
    }
}

impl FromStr for ClusterId {
    type Err = InvalidClusterId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl AsRef<str> for ClusterId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unique workflow run identifier (ULID for sortability)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchId(pub Ulid);

impl BatchId {
    /// Generate new batch ID
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for BatchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position of a record in the failure log
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SequenceIndex(pub u64);

impl SequenceIndex {
    /// The index after this one
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SequenceIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Registry generation number
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    /// Generation a freshly constructed registry starts at
    pub const INITIAL: Self = Self(1);

    /// The generation after this one
    #[inline]
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl Default for Generation {
    fn default() -> Self {
        Self::INITIAL
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
