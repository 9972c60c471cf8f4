//! In-memory mirror of a selected filesystem subtree.
//!
//! Walkers hand over nodes whose children were captured during the walk, with
//! the content filters applied. Nodes created without a listing list their
//! directory on first access. Either way the listing is cached and never
//! re-scanned, and a known listing is persisted so a reload keeps the same
//! membership.

use crate::filter::FilterSet;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

/// Kind of filesystem entry a node stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
}

/// One file or directory included in a package.
///
/// A directory's listing is persisted once known; the flattened path cache is not.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "StoredNode", from = "StoredNode")]
pub struct TreeNode {
    path: PathBuf,
    kind: NodeKind,
    children: OnceLock<Vec<TreeNode>>,
    flattened: OnceLock<Vec<PathBuf>>,
}

/// Persisted form of a [`TreeNode`].
#[derive(Serialize, Deserialize)]
struct StoredNode {
    path: PathBuf,
    kind: NodeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    children: Option<Vec<TreeNode>>,
}

impl From<TreeNode> for StoredNode {
    fn from(node: TreeNode) -> Self {
        let children = node.children.get().cloned();
        StoredNode {
            path: node.path,
            kind: node.kind,
            children,
        }
    }
}

impl From<StoredNode> for TreeNode {
    fn from(stored: StoredNode) -> Self {
        match (stored.kind, stored.children) {
            (NodeKind::Directory, Some(children)) => TreeNode::with_children(stored.path, children),
            (kind, _) => TreeNode::new(stored.path, kind),
        }
    }
}

impl PartialEq for TreeNode {
    fn eq(&self, other: &Self) -> bool {
        self.path == other.path && self.kind == other.kind
    }
}

impl Eq for TreeNode {}

impl TreeNode {
    /// A file node.
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into(), NodeKind::File)
    }

    /// A directory node whose children are listed on first access.
    pub fn directory(path: impl Into<PathBuf>) -> Self {
        Self::new(path.into(), NodeKind::Directory)
    }

    /// A directory node with an already captured listing.
    pub fn with_children(path: impl Into<PathBuf>, children: Vec<TreeNode>) -> Self {
        let node = Self::directory(path);
        let _ = node.children.set(children);
        node
    }

    /// Node for an existing path, kind taken from the filesystem.
    pub fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let metadata = fs::metadata(&path)?;
        let kind = if metadata.is_dir() {
            NodeKind::Directory
        } else {
            NodeKind::File
        };
        Ok(Self::new(path, kind))
    }

    /// Node for an existing path with every descendant `filters` excludes left out.
    ///
    /// Returns `Ok(None)` when `path` itself is excluded.
    pub fn capture(path: impl Into<PathBuf>, filters: &FilterSet) -> std::io::Result<Option<Self>> {
        let path = path.into();
        if filters.excludes(&path) {
            return Ok(None);
        }
        if !fs::metadata(&path)?.is_dir() {
            return Ok(Some(Self::file(path)));
        }

        let mut children = Vec::new();
        for entry in fs::read_dir(&path)? {
            if let Some(child) = Self::capture(entry?.path(), filters)? {
                children.push(child);
            }
        }
        children.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(Some(Self::with_children(path, children)))
    }

    fn new(path: PathBuf, kind: NodeKind) -> Self {
        Self {
            path,
            kind,
            children: OnceLock::new(),
            flattened: OnceLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Directory
    }

    /// Last path component, or the whole path for roots.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Direct children, sorted by name. Empty for files.
    ///
    /// A directory that cannot be listed is logged and treated as empty.
    pub fn children(&self) -> &[TreeNode] {
        if !self.is_dir() {
            return &[];
        }
        self.children.get_or_init(|| list_directory(&self.path))
    }

    /// This node's path followed by every descendant path, depth-first.
    pub fn full_tree_paths(&self) -> &[PathBuf] {
        self.flattened.get_or_init(|| {
            let mut paths = Vec::new();
            self.collect_paths(&mut paths);
            paths
        })
    }

    fn collect_paths(&self, out: &mut Vec<PathBuf>) {
        out.push(self.path.clone());
        for child in self.children() {
            child.collect_paths(out);
        }
    }

    /// Number of files in this subtree (1 for a file node).
    pub fn file_count(&self) -> usize {
        match self.kind {
            NodeKind::File => 1,
            NodeKind::Directory => self.children().iter().map(TreeNode::file_count).sum(),
        }
    }

    /// Paths of every file in this subtree.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        self.collect_files(&mut files);
        files
    }

    fn collect_files(&self, out: &mut Vec<PathBuf>) {
        match self.kind {
            NodeKind::File => out.push(self.path.clone()),
            NodeKind::Directory => {
                for child in self.children() {
                    child.collect_files(out);
                }
            }
        }
    }
}

fn list_directory(path: &Path) -> Vec<TreeNode> {
    let entries = match fs::read_dir(path) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to list {}: {}", path.display(), e);
            return Vec::new();
        }
    };

    let mut children: Vec<TreeNode> = entries
        .filter_map(|entry| entry.ok())
        .map(|entry| {
            let child = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => TreeNode::directory(child),
                _ => TreeNode::file(child),
            }
        })
        .collect();
    children.sort_by(|a, b| a.path.cmp(&b.path));
    children
}
