//! Content filters deciding which paths a walk must skip.
//!
//! A path is excluded when any filter in the [`FilterSet`] matches it. Filters
//! are built once and never mutated, so one set is shared by every walker.

use crate::error::Result;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Predicate over paths. Must be safe to call from several walkers at once.
pub trait ContentFilter: Send + Sync + std::fmt::Debug {
    /// `true` when `path` must be excluded.
    fn matches(&self, path: &Path) -> bool;
}

/// Glob ignore rules configured from a comma-separated list such as `*.tmp,Thumbs.db`.
///
/// Each pattern is tried against the full path and against the file name alone,
/// so `Thumbs.db` excludes that file in any directory.
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    patterns: Vec<String>,
    set: GlobSet,
}

impl IgnoreRules {
    /// Build from individual glob patterns.
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();
        for pattern in patterns {
            let pattern = pattern.as_ref().trim();
            if pattern.is_empty() {
                continue;
            }
            builder.add(Glob::new(pattern)?);
            kept.push(pattern.to_string());
        }
        Ok(Self {
            patterns: kept,
            set: builder.build()?,
        })
    }

    /// Build from a comma-separated list.
    pub fn from_list(list: &str) -> Result<Self> {
        Self::new(list.split(','))
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

impl ContentFilter for IgnoreRules {
    fn matches(&self, path: &Path) -> bool {
        if self.set.is_match(path) {
            return true;
        }
        path.file_name()
            .map(|name| self.set.is_match(Path::new(name)))
            .unwrap_or(false)
    }
}

/// Paths the user explicitly ignored. Descendants of an ignored directory are excluded too.
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    ignored: BTreeSet<PathBuf>,
}

impl PathFilter {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            ignored: paths.into_iter().map(Into::into).collect(),
        }
    }
}

impl ContentFilter for PathFilter {
    fn matches(&self, path: &Path) -> bool {
        path.ancestors().any(|p| self.ignored.contains(p))
    }
}

/// Logical OR over a list of filters.
#[derive(Debug, Clone, Default)]
pub struct FilterSet {
    filters: Vec<Arc<dyn ContentFilter>>,
}

impl FilterSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Filter set built from the configured ignore list.
    pub fn from_ignore_list(list: &str) -> Result<Self> {
        let rules = IgnoreRules::from_list(list)?;
        let mut set = Self::new();
        if !rules.is_empty() {
            set.push(rules);
        }
        Ok(set)
    }

    pub fn push(&mut self, filter: impl ContentFilter + 'static) {
        self.filters.push(Arc::new(filter));
    }

    /// A copy of this set with one more filter, leaving `self` untouched.
    pub fn with(&self, filter: impl ContentFilter + 'static) -> Self {
        let mut extended = self.clone();
        extended.push(filter);
        extended
    }

    /// `true` when any filter excludes `path`.
    pub fn excludes(&self, path: &Path) -> bool {
        self.filters.iter().any(|f| f.matches(path))
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }
}
