//! SIP previews: candidate packages produced by rules.

use crate::config::{PackagingConfig, WalkerConfig};
use crate::metadata::DescObjMetadata;
use crate::tree::TreeNode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// A preview shared between its rule and consumers once the walk has finished.
pub type SharedSip = Arc<RwLock<SipPreview>>;

/// Named group of nodes that becomes one payload unit of a package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Representation {
    pub name: String,
    pub files: Vec<TreeNode>,
}

impl Representation {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            files: Vec::new(),
        }
    }

    pub fn with_files(name: impl Into<String>, files: Vec<TreeNode>) -> Self {
        Self {
            name: name.into(),
            files,
        }
    }

    /// Add a node unless one with the same path is already a member.
    pub fn add(&mut self, node: TreeNode) -> bool {
        if self.files.iter().any(|n| n.path() == node.path()) {
            return false;
        }
        self.files.push(node);
        true
    }

    /// Remove the top-level member with this path.
    pub fn remove(&mut self, path: &Path) -> bool {
        let before = self.files.len();
        self.files.retain(|n| n.path() != path);
        before != self.files.len()
    }

    pub fn file_count(&self) -> usize {
        self.files.iter().map(TreeNode::file_count).sum()
    }

    /// Every member path and descendant path, depth-first.
    pub fn full_tree_paths(&self) -> Vec<PathBuf> {
        self.files
            .iter()
            .flat_map(|n| n.full_tree_paths().iter().cloned())
            .collect()
    }
}

/// A candidate package, under construction or finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SipPreview {
    pub id: String,
    /// Destination classification node.
    #[serde(default)]
    pub parent_id: Option<String>,
    pub title: String,
    pub content_type: String,
    #[serde(default)]
    pub metadata: Vec<DescObjMetadata>,
    #[serde(default)]
    pub representations: Vec<Representation>,
    #[serde(default)]
    pub documentation: Vec<TreeNode>,
    #[serde(default)]
    pub removed: bool,
    /// Rule that produced this preview (lookup key, not ownership).
    #[serde(default)]
    pub rule_id: Option<String>,
    /// Selected file or directory this preview was derived from.
    #[serde(default)]
    pub source_path: Option<PathBuf>,
    /// Errors recorded against this preview (metadata resolution and the like).
    #[serde(default)]
    pub issues: Vec<String>,
}

impl SipPreview {
    /// New preview with a generated identifier.
    pub fn new(title: impl Into<String>, source_path: Option<PathBuf>) -> Self {
        Self {
            id: generate_sip_id(),
            parent_id: None,
            title: title.into(),
            content_type: PackagingConfig::DEFAULT_CONTENT_TYPE.to_string(),
            metadata: Vec::new(),
            representations: Vec::new(),
            documentation: Vec::new(),
            removed: false,
            rule_id: None,
            source_path,
            issues: Vec::new(),
        }
    }

    /// Preview holding a single representation.
    pub fn with_representation(
        title: impl Into<String>,
        source_path: Option<PathBuf>,
        representation: Representation,
    ) -> Self {
        let mut sip = Self::new(title, source_path);
        sip.representations.push(representation);
        sip
    }

    pub fn into_shared(self) -> SharedSip {
        Arc::new(RwLock::new(self))
    }

    /// Every path in every representation.
    pub fn full_tree_paths(&self) -> Vec<PathBuf> {
        self.representations
            .iter()
            .flat_map(Representation::full_tree_paths)
            .collect()
    }

    /// Files in every representation.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        self.representations
            .iter()
            .flat_map(|r| r.files.iter().flat_map(TreeNode::file_paths))
            .collect()
    }

    pub fn file_count(&self) -> usize {
        self.representations.iter().map(Representation::file_count).sum()
    }

    pub fn add_documentation(&mut self, node: TreeNode) {
        if !self.documentation.iter().any(|n| n.path() == node.path()) {
            self.documentation.push(node);
        }
    }

    /// Move under another classification node. Rule ownership is unchanged.
    pub fn reparent(&mut self, parent_id: impl Into<String>) {
        self.parent_id = Some(parent_id.into());
    }

    pub fn has_issues(&self) -> bool {
        !self.issues.is_empty() || self.metadata.iter().any(|m| !m.is_resolved())
    }
}

/// Cursor over previews in discovery order.
///
/// Each preview is handed out once; [`PreviewCursor::reset`] starts over.
#[derive(Debug, Clone, Default)]
pub struct PreviewCursor {
    previews: Vec<SharedSip>,
    position: usize,
}

impl PreviewCursor {
    pub fn new(previews: Vec<SharedSip>) -> Self {
        Self {
            previews,
            position: 0,
        }
    }

    pub fn has_next(&self) -> bool {
        self.position < self.previews.len()
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    /// Total number of previews, consumed or not.
    pub fn len(&self) -> usize {
        self.previews.len()
    }

    pub fn is_empty(&self) -> bool {
        self.previews.is_empty()
    }
}

impl Iterator for PreviewCursor {
    type Item = SharedSip;

    fn next(&mut self) -> Option<SharedSip> {
        let sip = self.previews.get(self.position).cloned()?;
        self.position += 1;
        Some(sip)
    }
}

fn generate_sip_id() -> String {
    format!("{}{}", WalkerConfig::SIP_ID_PREFIX, uuid::Uuid::new_v4())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_prefixed() {
        let a = SipPreview::new("a", None);
        let b = SipPreview::new("b", None);
        assert!(a.id.starts_with("sip_"));
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_representation_rejects_duplicates() {
        let mut rep = Representation::new("rep1");
        assert!(rep.add(TreeNode::file("/a/x.txt")));
        assert!(!rep.add(TreeNode::file("/a/x.txt")));
        assert!(rep.remove(Path::new("/a/x.txt")));
        assert!(rep.files.is_empty());
    }

    #[test]
    fn test_cursor_hands_out_each_once_until_reset() {
        let sips: Vec<SharedSip> = ["a", "b"]
            .iter()
            .map(|t| SipPreview::new(*t, None).into_shared())
            .collect();
        let mut cursor = PreviewCursor::new(sips);

        let mut titles = Vec::new();
        while cursor.has_next() {
            let sip = cursor.next().unwrap();
            titles.push(sip.read().unwrap().title.clone());
        }
        assert_eq!(titles, vec!["a", "b"]);
        assert!(cursor.next().is_none());

        cursor.reset();
        assert!(cursor.has_next());
        assert_eq!(cursor.count(), 2);
    }

    #[test]
    fn test_reparent_keeps_rule() {
        let mut sip = SipPreview::new("letters", None);
        sip.rule_id = Some("rule_1".to_string());
        sip.reparent("node_2");
        assert_eq!(sip.parent_id.as_deref(), Some("node_2"));
        assert_eq!(sip.rule_id.as_deref(), Some("rule_1"));
    }

    #[test]
    fn test_paths_across_representations() {
        let sip = SipPreview::with_representation(
            "x",
            None,
            Representation::with_files(
                "rep1",
                vec![
                    TreeNode::with_children("/a", vec![TreeNode::file("/a/1.txt")]),
                    TreeNode::file("/b.txt"),
                ],
            ),
        );
        assert_eq!(sip.file_count(), 2);
        assert_eq!(
            sip.full_tree_paths(),
            vec![
                PathBuf::from("/a"),
                PathBuf::from("/a/1.txt"),
                PathBuf::from("/b.txt")
            ]
        );
        assert_eq!(
            sip.file_paths(),
            vec![PathBuf::from("/a/1.txt"), PathBuf::from("/b.txt")]
        );
    }
}
