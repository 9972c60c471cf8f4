//! Classification scheme: the tree of destination nodes rules attach to.

use crate::error::{Result, SipError};
use crate::metadata::DescObjMetadata;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One classification node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemeNode {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub parent_id: Option<String>,
    /// Archival description level, e.g. `fonds`, `series`.
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub metadata: Vec<DescObjMetadata>,
}

fn default_level() -> String {
    "series".to_string()
}

impl SchemeNode {
    pub fn new(title: impl Into<String>, parent_id: Option<String>) -> Self {
        Self {
            id: format!("node_{}", uuid::Uuid::new_v4()),
            title: title.into(),
            parent_id,
            level: default_level(),
            metadata: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }
}

/// All classification nodes, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationScheme {
    nodes: BTreeMap<String, SchemeNode>,
}

impl ClassificationScheme {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Its parent, if any, must already exist.
    pub fn add_node(&mut self, node: SchemeNode) -> Result<String> {
        if let Some(parent) = &node.parent_id {
            if !self.nodes.contains_key(parent) {
                return Err(SipError::UnknownNode(parent.clone()));
            }
        }
        let id = node.id.clone();
        self.nodes.insert(id.clone(), node);
        Ok(id)
    }

    /// Remove a node and its descendants; returns every removed id.
    pub fn remove_node(&mut self, id: &str) -> Result<Vec<String>> {
        if !self.nodes.contains_key(id) {
            return Err(SipError::UnknownNode(id.to_string()));
        }
        let mut removed = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < removed.len() {
            let current = removed[cursor].clone();
            removed.extend(self.children(&current).into_iter().map(|n| n.id.clone()));
            cursor += 1;
        }
        for node_id in &removed {
            self.nodes.remove(node_id);
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<&SchemeNode> {
        self.nodes.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut SchemeNode> {
        self.nodes.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn children(&self, id: &str) -> Vec<&SchemeNode> {
        self.nodes
            .values()
            .filter(|n| n.parent_id.as_deref() == Some(id))
            .collect()
    }

    pub fn roots(&self) -> Vec<&SchemeNode> {
        self.nodes.values().filter(|n| n.parent_id.is_none()).collect()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &SchemeNode> {
        self.nodes.values()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Pretty JSON export of the whole scheme.
    pub fn to_json(&self) -> Result<String> {
        let nodes: Vec<&SchemeNode> = self.nodes.values().collect();
        Ok(serde_json::to_string_pretty(&nodes)?)
    }

    /// Rebuild from a node list, parents before children or not.
    pub fn from_nodes(nodes: Vec<SchemeNode>) -> Self {
        Self {
            nodes: nodes.into_iter().map(|n| (n.id.clone(), n)).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ClassificationScheme {
        let mut scheme = ClassificationScheme::new();
        scheme
            .add_node(SchemeNode::new("Fonds", None).with_id("n1").with_level("fonds"))
            .unwrap();
        scheme
            .add_node(SchemeNode::new("Series A", Some("n1".into())).with_id("n2"))
            .unwrap();
        scheme
            .add_node(SchemeNode::new("File 1", Some("n2".into())).with_id("n3"))
            .unwrap();
        scheme
            .add_node(SchemeNode::new("Other", None).with_id("n4"))
            .unwrap();
        scheme
    }

    #[test]
    fn test_add_requires_known_parent() {
        let mut scheme = ClassificationScheme::new();
        let err = scheme
            .add_node(SchemeNode::new("Orphan", Some("missing".into())))
            .unwrap_err();
        assert!(matches!(err, SipError::UnknownNode(id) if id == "missing"));
    }

    #[test]
    fn test_remove_node_takes_descendants() {
        let mut scheme = sample();
        let mut removed = scheme.remove_node("n1").unwrap();
        removed.sort();
        assert_eq!(removed, vec!["n1", "n2", "n3"]);
        assert_eq!(scheme.len(), 1);
        assert!(scheme.contains("n4"));
    }

    #[test]
    fn test_roots_and_children() {
        let scheme = sample();
        let roots: Vec<&str> = scheme.roots().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(roots, vec!["n1", "n4"]);
        assert_eq!(scheme.children("n2")[0].title, "File 1");
    }

    #[test]
    fn test_json_export() {
        let scheme = sample();
        let json: serde_json::Value = serde_json::from_str(&scheme.to_json().unwrap()).unwrap();
        assert_eq!(json.as_array().unwrap().len(), 4);
        assert_eq!(json[0]["level"], "fonds");
    }
}
