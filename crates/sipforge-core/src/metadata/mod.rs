//! Descriptive metadata attached to SIP previews and classification nodes.
//!
//! - `DescObjMetadata`: one metadata entry with lazily loaded, cached content
//! - `MetadataOption`: where a rule takes metadata from
//! - `TemplateStore`: named templates and their schemas
//! - `MetadataResolver`: turns an option into an entry for one preview

mod resolver;
mod template;

pub use resolver::{common_ancestor, MetadataResolver};
pub use template::{TemplateFields, TemplateInfo, TemplateStore};

use crate::error::{Result, SipError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How a metadata entry came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetadataSource {
    Template,
    SingleFile,
    SameDirectory,
    DiffDirectory,
    NewFile,
}

/// Metadata option of a rule, with its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MetadataOption {
    /// Instantiate a named template for every preview.
    Template {
        name: String,
        #[serde(default)]
        version: Option<String>,
    },
    /// Attach one file verbatim to every preview.
    SingleFile {
        path: PathBuf,
        #[serde(default)]
        metadata_type: Option<String>,
    },
    /// Find the file matching `pattern` in the directory that produced each preview.
    SameDirectory {
        pattern: String,
        #[serde(default)]
        metadata_type: Option<String>,
    },
    /// Find the file at the mirrored relative location under `root`.
    DiffDirectory {
        root: PathBuf,
        #[serde(default)]
        metadata_type: Option<String>,
    },
    /// Empty entry for the user to fill in.
    NewFile {
        #[serde(default)]
        metadata_type: Option<String>,
    },
}

impl MetadataOption {
    pub fn source(&self) -> MetadataSource {
        match self {
            MetadataOption::Template { .. } => MetadataSource::Template,
            MetadataOption::SingleFile { .. } => MetadataSource::SingleFile,
            MetadataOption::SameDirectory { .. } => MetadataSource::SameDirectory,
            MetadataOption::DiffDirectory { .. } => MetadataSource::DiffDirectory,
            MetadataOption::NewFile { .. } => MetadataSource::NewFile,
        }
    }
}

impl Default for MetadataOption {
    fn default() -> Self {
        MetadataOption::NewFile {
            metadata_type: None,
        }
    }
}

/// Metadata type as declared in a package manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptiveType {
    Dc,
    Ead,
    Other(Option<String>),
}

impl DescriptiveType {
    /// `dc` maps to DC, `ead`/`ead3` to EAD, anything else to OTHER.
    pub fn from_metadata_type(metadata_type: Option<&str>) -> Self {
        match metadata_type.map(str::to_lowercase).as_deref() {
            Some("dc") => DescriptiveType::Dc,
            Some("ead") | Some("ead3") => DescriptiveType::Ead,
            other => DescriptiveType::Other(other.map(str::to_string)),
        }
    }

    /// METS `MDTYPE` value.
    pub fn mdtype(&self) -> &'static str {
        match self {
            DescriptiveType::Dc => "DC",
            DescriptiveType::Ead => "EAD",
            DescriptiveType::Other(_) => "OTHER",
        }
    }

    /// METS `OTHERMDTYPE` value, only for OTHER.
    pub fn other_mdtype(&self) -> Option<String> {
        match self {
            DescriptiveType::Other(name) => name.clone(),
            _ => None,
        }
    }
}

/// One descriptive metadata entry.
///
/// Content is read from `path` at most once and cached. Editing the content
/// detaches the entry from its backing file, so packaging stages a fresh copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DescObjMetadata {
    /// File name of the entry inside a package, e.g. `dc.xml`.
    pub id: String,
    pub source: MetadataSource,
    #[serde(default)]
    pub metadata_type: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    /// Template the entry was instantiated from.
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    edited: bool,
    /// Resolution error, if the entry could not be resolved.
    #[serde(default)]
    pub error: Option<String>,
}

impl DescObjMetadata {
    /// Entry backed by a file on disk, loaded on first access.
    pub fn from_file(
        source: MetadataSource,
        path: impl Into<PathBuf>,
        metadata_type: Option<String>,
    ) -> Self {
        let path = path.into();
        let id = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "metadata.xml".to_string());
        Self {
            id,
            source,
            metadata_type,
            version: None,
            template: None,
            path: Some(path),
            content: None,
            edited: false,
            error: None,
        }
    }

    /// Entry generated from a template; content is already known.
    pub fn from_template(name: &str, version: Option<String>, content: String) -> Self {
        Self {
            id: format!("{}.xml", name),
            source: MetadataSource::Template,
            metadata_type: Some(name.to_string()),
            version,
            template: Some(name.to_string()),
            path: None,
            content: Some(content),
            edited: false,
            error: None,
        }
    }

    /// Empty editable entry without a disk source.
    pub fn new_empty(metadata_type: Option<String>) -> Self {
        let id = metadata_type
            .as_deref()
            .map(|t| format!("{}.xml", t))
            .unwrap_or_else(|| "metadata.xml".to_string());
        Self {
            id,
            source: MetadataSource::NewFile,
            metadata_type,
            version: None,
            template: None,
            path: None,
            content: Some(String::new()),
            edited: false,
            error: None,
        }
    }

    /// Placeholder recording a resolution failure.
    pub fn unresolved(source: MetadataSource, error: &SipError) -> Self {
        Self {
            id: "unresolved.xml".to_string(),
            source,
            metadata_type: None,
            version: None,
            template: None,
            path: None,
            content: None,
            edited: false,
            error: Some(error.to_string()),
        }
    }

    /// Attach already known content (e.g. a single file shared by many previews).
    pub fn with_content(mut self, content: String) -> Self {
        self.content = Some(content);
        self
    }

    pub fn is_loaded(&self) -> bool {
        self.content.is_some()
    }

    pub fn is_resolved(&self) -> bool {
        self.error.is_none()
    }

    /// Cached content without touching the disk.
    pub fn cached_content(&self) -> Option<&str> {
        self.content.as_deref()
    }

    /// Content, loading it from the backing file on first call.
    pub fn content(&mut self) -> Result<&str> {
        if self.content.is_none() {
            let loaded = match &self.path {
                Some(path) => fs::read_to_string(path).map_err(|e| SipError::io_with_path(e, path))?,
                None => String::new(),
            };
            self.content = Some(loaded);
        }
        Ok(self.content.as_deref().unwrap_or_default())
    }

    /// Replace the content with a user edit.
    pub fn set_content(&mut self, content: impl Into<String>) {
        self.content = Some(content.into());
        self.edited = true;
    }

    /// File that can be packaged as-is: present and not superseded by an edit.
    pub fn backing_file(&self) -> Option<&Path> {
        if self.edited {
            None
        } else {
            self.path.as_deref()
        }
    }

    /// Schema lookup key: the metadata type, else the file stem.
    pub fn schema_name(&self) -> Option<String> {
        if let Some(t) = &self.metadata_type {
            return Some(t.clone());
        }
        self.path
            .as_ref()
            .and_then(|p| p.file_stem())
            .map(|s| s.to_string_lossy().into_owned())
    }

    pub fn descriptive_type(&self) -> DescriptiveType {
        DescriptiveType::from_metadata_type(self.metadata_type.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_content_loaded_once_and_cached() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("ead.xml");
        fs::write(&path, "<ead/>").unwrap();

        let mut entry = DescObjMetadata::from_file(MetadataSource::SingleFile, &path, None);
        assert!(!entry.is_loaded());
        assert_eq!(entry.content().unwrap(), "<ead/>");

        fs::write(&path, "<changed/>").unwrap();
        assert_eq!(entry.content().unwrap(), "<ead/>");
    }

    #[test]
    fn test_missing_backing_file_is_error() {
        let mut entry =
            DescObjMetadata::from_file(MetadataSource::SingleFile, "/nonexistent/dc.xml", None);
        assert!(matches!(entry.content(), Err(SipError::FileNotFound(_))));
    }

    #[test]
    fn test_edit_detaches_backing_file() {
        let mut entry =
            DescObjMetadata::from_file(MetadataSource::SameDirectory, "/src/box1/dc.xml", None);
        assert!(entry.backing_file().is_some());

        entry.set_content("<dc>edited</dc>");

        assert!(entry.backing_file().is_none());
        assert_eq!(entry.cached_content(), Some("<dc>edited</dc>"));
    }

    #[test]
    fn test_schema_name_prefers_type() {
        let typed = DescObjMetadata::from_file(
            MetadataSource::SingleFile,
            "/m/record.xml",
            Some("ead".to_string()),
        );
        assert_eq!(typed.schema_name().as_deref(), Some("ead"));

        let untyped = DescObjMetadata::from_file(MetadataSource::SingleFile, "/m/dc.xml", None);
        assert_eq!(untyped.schema_name().as_deref(), Some("dc"));
    }

    #[test]
    fn test_descriptive_type_mapping() {
        assert_eq!(DescriptiveType::from_metadata_type(Some("dc")), DescriptiveType::Dc);
        assert_eq!(DescriptiveType::from_metadata_type(Some("EAD3")), DescriptiveType::Ead);
        let other = DescriptiveType::from_metadata_type(Some("premis"));
        assert_eq!(other.mdtype(), "OTHER");
        assert_eq!(other.other_mdtype().as_deref(), Some("premis"));
    }

    #[test]
    fn test_option_serde_is_tagged() {
        let option = MetadataOption::SameDirectory {
            pattern: "*.xml".to_string(),
            metadata_type: None,
        };
        let json = serde_json::to_value(&option).unwrap();
        assert_eq!(json["kind"], "same_directory");
        assert_eq!(option.source(), MetadataSource::SameDirectory);
    }
}
