//! Tree walkers turning a selection into SIP previews.
//!
//! A walk is one-shot and runs on the caller's thread (rules run it on their
//! own worker). Three variants exist:
//!
//! - `SingleSip`: everything selected goes into one preview, one representation per root
//! - `PerFile`: every included file becomes its own preview
//! - `PerFolder { depth }`: every directory at exactly `depth` below a root becomes a preview
//!
//! Filters are applied at every visitation and the cancellation token is polled
//! there too. A failing entry is recorded and the walk continues with its siblings.

mod per_file;
mod per_folder;
mod progress;
mod single;

pub use progress::{ProgressThrottle, WalkProgress};

use crate::cancel::{CancellationToken, CancelledError};
use crate::config::WalkerConfig;
use crate::error::{Result, SipError};
use crate::filter::FilterSet;
use crate::sip::SipPreview;
use crate::tree::TreeNode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// How a selection is split into previews.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalkerKind {
    SingleSip,
    PerFile,
    PerFolder { depth: usize },
}

impl WalkerKind {
    /// Reject a selection this walker cannot handle, before any walk starts.
    pub fn validate(&self, roots: &[PathBuf], filters: &FilterSet) -> Result<()> {
        if roots.is_empty() {
            return Err(SipError::InvalidSelection {
                message: "no paths selected".to_string(),
            });
        }
        if let WalkerKind::PerFolder { depth } = *self {
            if let Some(file) = roots.iter().find(|r| !r.is_dir()) {
                return Err(SipError::InvalidSelection {
                    message: format!(
                        "folder rules need directories only, {} is not one",
                        file.display()
                    ),
                });
            }
            let max = max_folder_depth(roots, filters);
            if depth > max {
                return Err(SipError::DepthOutOfRange {
                    requested: depth,
                    max,
                });
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for WalkerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WalkerKind::SingleSip => write!(f, "single SIP"),
            WalkerKind::PerFile => write!(f, "SIP per file"),
            WalkerKind::PerFolder { depth } => write!(f, "SIP per folder (depth {})", depth),
        }
    }
}

/// Deepest directory level below any root (root = 0), excluded paths skipped.
///
/// Entries that cannot be read are ignored here; the walk records them.
pub fn max_folder_depth(roots: &[PathBuf], filters: &FilterSet) -> usize {
    roots
        .iter()
        .filter(|root| root.is_dir() && !filters.excludes(root))
        .flat_map(|root| {
            WalkDir::new(root)
                .into_iter()
                .filter_entry(|e| e.depth() == 0 || !filters.excludes(e.path()))
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_dir())
                .map(|e| e.depth())
        })
        .max()
        .unwrap_or(0)
}

/// Depth offered by default for a per-folder rule: half the observed maximum, rounded up.
pub fn suggested_depth(max_depth: usize) -> usize {
    max_depth.div_ceil(2)
}

/// An entry the walk could not read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraversalFailure {
    pub path: PathBuf,
    pub message: String,
}

impl std::fmt::Display for TraversalFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

impl From<&TraversalFailure> for SipError {
    fn from(failure: &TraversalFailure) -> Self {
        SipError::Traversal {
            path: failure.path.clone(),
            message: failure.message.clone(),
        }
    }
}

/// Result of a walk that ran to completion.
#[derive(Debug)]
pub struct WalkReport {
    /// Previews in discovery order.
    pub previews: Vec<SipPreview>,
    pub failures: Vec<TraversalFailure>,
    /// Final counters, identical to the last progress notification.
    pub progress: WalkProgress,
}

#[derive(Debug)]
pub enum WalkOutcome {
    Finished(WalkReport),
    /// Stopped on request. No previews survive.
    Cancelled,
}

/// A configured, not yet started walk.
#[derive(Debug, Clone)]
pub struct TreeWalker {
    kind: WalkerKind,
    roots: Vec<PathBuf>,
    filters: FilterSet,
    token: CancellationToken,
    progress_interval: Duration,
}

impl TreeWalker {
    /// Validate the selection and prepare a walk.
    ///
    /// Roots nested inside another selected root are dropped so nothing is visited twice.
    pub fn new(kind: WalkerKind, roots: Vec<PathBuf>, filters: FilterSet) -> Result<Self> {
        let roots = normalize_roots(roots);
        kind.validate(&roots, &filters)?;
        Ok(Self {
            kind,
            roots,
            filters,
            token: CancellationToken::new(),
            progress_interval: WalkerConfig::PROGRESS_INTERVAL,
        })
    }

    /// Use an existing token, e.g. one already registered elsewhere.
    pub fn with_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn kind(&self) -> WalkerKind {
        self.kind
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Token that cancels this walk.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Run the walk, calling `on_progress` at most once per interval plus once at the end.
    pub fn walk<F>(&self, mut on_progress: F) -> WalkOutcome
    where
        F: FnMut(&WalkProgress),
    {
        debug!(kind = %self.kind, roots = self.roots.len(), "Starting walk");
        let mut ctx = WalkContext {
            filters: &self.filters,
            token: &self.token,
            throttle: ProgressThrottle::new(self.progress_interval),
            progress: WalkProgress::default(),
            on_progress: &mut on_progress,
            failures: Vec::new(),
        };

        let walked = match self.kind {
            WalkerKind::SingleSip => single::walk(&mut ctx, &self.roots),
            WalkerKind::PerFile => per_file::walk(&mut ctx, &self.roots),
            WalkerKind::PerFolder { depth } => per_folder::walk(&mut ctx, &self.roots, depth),
        };

        match walked {
            Ok(previews) => {
                ctx.finish();
                debug!(
                    previews = previews.len(),
                    failures = ctx.failures.len(),
                    "Walk finished"
                );
                WalkOutcome::Finished(WalkReport {
                    previews,
                    progress: ctx.progress.clone(),
                    failures: std::mem::take(&mut ctx.failures),
                })
            }
            Err(CancelledError) => {
                debug!(visited = ctx.progress.visited, "Walk cancelled");
                WalkOutcome::Cancelled
            }
        }
    }
}

fn normalize_roots(mut roots: Vec<PathBuf>) -> Vec<PathBuf> {
    roots.sort();
    roots.dedup();
    let mut kept: Vec<PathBuf> = Vec::with_capacity(roots.len());
    for root in roots {
        if !kept.iter().any(|k| root.starts_with(k)) {
            kept.push(root);
        }
    }
    kept
}

/// State shared by the walker variants during one walk.
pub(crate) struct WalkContext<'a> {
    filters: &'a FilterSet,
    token: &'a CancellationToken,
    throttle: ProgressThrottle,
    progress: WalkProgress,
    on_progress: &'a mut dyn FnMut(&WalkProgress),
    failures: Vec<TraversalFailure>,
}

impl WalkContext<'_> {
    fn excluded(&self, path: &Path) -> bool {
        self.filters.excludes(path)
    }

    /// Visitation checkpoint: polls cancellation and maybe reports progress.
    fn visit(&mut self, is_file: bool) -> std::result::Result<(), CancelledError> {
        self.token.check()?;
        self.progress.visited += 1;
        if is_file {
            self.progress.files += 1;
        }
        if self.throttle.ready() {
            (self.on_progress)(&self.progress);
        }
        Ok(())
    }

    fn preview_added(&mut self) {
        self.progress.previews += 1;
    }

    fn fail(&mut self, path: &Path, message: impl ToString) {
        let failure = TraversalFailure {
            path: path.to_path_buf(),
            message: message.to_string(),
        };
        warn!("Skipping unreadable entry {}", failure);
        self.failures.push(failure);
    }

    fn finish(&mut self) {
        (self.on_progress)(&self.progress);
    }

    /// Included children of `dir`, sorted by path, with their directory flag.
    fn list(&mut self, dir: &Path) -> Vec<(PathBuf, bool)> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                self.fail(dir, e);
                return Vec::new();
            }
        };
        let mut children = Vec::new();
        for entry in entries {
            match entry {
                Ok(entry) => {
                    let path = entry.path();
                    if self.excluded(&path) {
                        continue;
                    }
                    let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
                    children.push((path, is_dir));
                }
                Err(e) => self.fail(dir, e),
            }
        }
        children.sort();
        children
    }

    /// Capture the subtree at `path` into a node with its listing filled in.
    ///
    /// `Ok(None)` when the entry cannot be read (recorded as a failure).
    fn capture(&mut self, path: &Path) -> std::result::Result<Option<TreeNode>, CancelledError> {
        let metadata = match fs::symlink_metadata(path) {
            Ok(m) => m,
            Err(e) => {
                self.token.check()?;
                self.fail(path, e);
                return Ok(None);
            }
        };
        if !metadata.is_dir() {
            self.visit(true)?;
            return Ok(Some(TreeNode::file(path)));
        }

        self.visit(false)?;
        let mut children = Vec::new();
        for (child, _) in self.list(path) {
            if let Some(node) = self.capture(&child)? {
                children.push(node);
            }
        }
        Ok(Some(TreeNode::with_children(path, children)))
    }
}

/// Title derived from a path's last component.
fn title_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    /// root/
    ///   a/ x.tmp, y.txt, deep/ z.txt
    ///   b/ c.txt
    ///   loose.txt
    fn fixture() -> TempDir {
        let temp = TempDir::new().unwrap();
        let root = temp.path();
        fs::create_dir_all(root.join("a/deep")).unwrap();
        fs::create_dir_all(root.join("b")).unwrap();
        fs::write(root.join("a/x.tmp"), "x").unwrap();
        fs::write(root.join("a/y.txt"), "y").unwrap();
        fs::write(root.join("a/deep/z.txt"), "z").unwrap();
        fs::write(root.join("b/c.txt"), "c").unwrap();
        fs::write(root.join("loose.txt"), "l").unwrap();
        temp
    }

    fn tmp_filter() -> FilterSet {
        FilterSet::from_ignore_list("*.tmp").unwrap()
    }

    fn finished(outcome: WalkOutcome) -> WalkReport {
        match outcome {
            WalkOutcome::Finished(report) => report,
            WalkOutcome::Cancelled => panic!("walk was cancelled"),
        }
    }

    #[test]
    fn test_normalize_drops_nested_roots() {
        let roots = normalize_roots(vec![
            PathBuf::from("/r/a/x.txt"),
            PathBuf::from("/r/a"),
            PathBuf::from("/r/b"),
            PathBuf::from("/r/a"),
        ]);
        assert_eq!(roots, vec![PathBuf::from("/r/a"), PathBuf::from("/r/b")]);
    }

    #[test]
    fn test_max_depth_and_suggestion() {
        let temp = fixture();
        let depth = max_folder_depth(&[temp.path().to_path_buf()], &FilterSet::new());
        assert_eq!(depth, 2);
        assert_eq!(suggested_depth(depth), 1);
        assert_eq!(suggested_depth(3), 2);
        assert_eq!(suggested_depth(0), 0);
    }

    #[test]
    fn test_single_sip_matches_filtered_expansion() {
        let temp = fixture();
        let root = temp.path();
        let walker = TreeWalker::new(
            WalkerKind::SingleSip,
            vec![root.join("a"), root.join("b/c.txt")],
            tmp_filter(),
        )
        .unwrap();

        let report = finished(walker.walk(|_| {}));
        assert_eq!(report.previews.len(), 1);
        let sip = &report.previews[0];
        assert_eq!(sip.representations.len(), 2);

        let paths = sip.full_tree_paths();
        let unique: HashSet<_> = paths.iter().collect();
        assert_eq!(unique.len(), paths.len());
        assert!(paths.contains(&root.join("a")));
        assert!(paths.contains(&root.join("b/c.txt")));
        assert!(paths.contains(&root.join("a/deep/z.txt")));
        assert!(!paths.contains(&root.join("a/x.tmp")));
        assert_eq!(sip.file_count(), 3);
    }

    #[test]
    fn test_per_file_one_preview_per_included_file() {
        let temp = fixture();
        let walker = TreeWalker::new(
            WalkerKind::PerFile,
            vec![temp.path().to_path_buf()],
            tmp_filter(),
        )
        .unwrap();

        let report = finished(walker.walk(|_| {}));
        let files: Vec<PathBuf> = report
            .previews
            .iter()
            .flat_map(|s| s.file_paths())
            .collect();
        assert_eq!(
            files,
            vec![
                temp.path().join("a/deep/z.txt"),
                temp.path().join("a/y.txt"),
                temp.path().join("b/c.txt"),
                temp.path().join("loose.txt"),
            ]
        );
        assert_eq!(report.progress.previews, 4);
    }

    #[test]
    fn test_per_folder_partitions_selection() {
        let temp = fixture();
        let walker = TreeWalker::new(
            WalkerKind::PerFolder { depth: 1 },
            vec![temp.path().to_path_buf()],
            tmp_filter(),
        )
        .unwrap();

        let report = finished(walker.walk(|_| {}));
        let titles: Vec<&str> = report.previews.iter().map(|s| s.title.as_str()).collect();
        assert_eq!(titles, vec!["a", "b", "loose.txt"]);

        let mut all: Vec<PathBuf> = report
            .previews
            .iter()
            .flat_map(|s| s.file_paths())
            .collect();
        let count = all.len();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), count);
        assert_eq!(count, 4);
    }

    #[test]
    fn test_per_folder_rejects_mixed_selection() {
        let temp = fixture();
        let err = TreeWalker::new(
            WalkerKind::PerFolder { depth: 0 },
            vec![temp.path().join("a"), temp.path().join("loose.txt")],
            FilterSet::new(),
        )
        .unwrap_err();
        assert!(err.is_selection_error());
    }

    #[test]
    fn test_per_folder_depth_out_of_range() {
        let temp = fixture();
        let err = TreeWalker::new(
            WalkerKind::PerFolder { depth: 5 },
            vec![temp.path().to_path_buf()],
            FilterSet::new(),
        )
        .unwrap_err();
        assert!(matches!(err, SipError::DepthOutOfRange { requested: 5, max: 2 }));
    }

    #[test]
    fn test_missing_root_is_recorded_and_siblings_continue() {
        let temp = fixture();
        let walker = TreeWalker::new(
            WalkerKind::PerFile,
            vec![temp.path().join("b"), temp.path().join("gone")],
            FilterSet::new(),
        )
        .unwrap();

        let report = finished(walker.walk(|_| {}));
        assert_eq!(report.previews.len(), 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, temp.path().join("gone"));
    }

    #[test]
    fn test_cancel_discards_previews() {
        let temp = fixture();
        let walker = TreeWalker::new(
            WalkerKind::PerFile,
            vec![temp.path().to_path_buf()],
            FilterSet::new(),
        )
        .unwrap()
        .with_progress_interval(Duration::ZERO);

        let token = walker.token();
        let mut ticks = 0;
        let outcome = walker.walk(|_| {
            ticks += 1;
            if ticks == 2 {
                token.cancel();
            }
        });
        assert!(matches!(outcome, WalkOutcome::Cancelled));
        assert_eq!(ticks, 2);
    }

    #[test]
    fn test_final_progress_is_unconditional() {
        let temp = fixture();
        let walker = TreeWalker::new(
            WalkerKind::PerFile,
            vec![temp.path().to_path_buf()],
            FilterSet::new(),
        )
        .unwrap()
        .with_progress_interval(Duration::from_secs(3600));

        let mut seen = Vec::new();
        let report = finished(walker.walk(|p| seen.push(p.clone())));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0], report.progress);
        assert_eq!(seen[0].previews, 5);
    }
}
