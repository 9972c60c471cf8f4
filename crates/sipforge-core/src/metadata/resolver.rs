//! Resolves a rule's metadata option into one entry per SIP preview.
//!
//! Resolution never fails as a whole: a preview whose metadata cannot be found
//! gets an unresolved entry carrying the error, and its siblings carry on.

use super::{DescObjMetadata, MetadataOption, MetadataSource, TemplateFields, TemplateStore};
use crate::error::{Result, SipError};
use crate::persist::atomic_write;
use crate::sip::SipPreview;
use globset::{Glob, GlobMatcher};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Deepest directory containing the parent of every root.
///
/// `{/data/fonds/a, /data/fonds/b.txt}` gives `/data/fonds`; a single root
/// `/data/fonds` gives `/data`.
pub fn common_ancestor(roots: &[PathBuf]) -> Option<PathBuf> {
    let mut parents = roots.iter().map(|r| r.parent().unwrap_or(r.as_path()));
    let first = parents.next()?;
    let mut common: Vec<Component<'_>> = first.components().collect();
    for parent in parents {
        let shared = common
            .iter()
            .zip(parent.components())
            .take_while(|(a, b)| *a == b)
            .count();
        common.truncate(shared);
    }
    Some(common.iter().collect())
}

/// Resolves metadata for the previews of one rule application.
#[derive(Debug)]
pub struct MetadataResolver<'a> {
    option: &'a MetadataOption,
    templates: &'a TemplateStore,
    ancestor: Option<PathBuf>,
    staging_dir: Option<PathBuf>,
    single_file: OnceLock<std::result::Result<String, String>>,
    matcher: Option<std::result::Result<GlobMatcher, String>>,
}

impl<'a> MetadataResolver<'a> {
    /// # Arguments
    ///
    /// * `option` - The rule's metadata option
    /// * `templates` - Template store for the template option
    /// * `roots` - The rule's selected roots, for different-directory matching
    pub fn new(option: &'a MetadataOption, templates: &'a TemplateStore, roots: &[PathBuf]) -> Self {
        let matcher = match option {
            MetadataOption::SameDirectory { pattern, .. } => Some(
                Glob::new(pattern)
                    .map(|g| g.compile_matcher())
                    .map_err(|e| e.to_string()),
            ),
            _ => None,
        };
        Self {
            option,
            templates,
            ancestor: common_ancestor(roots),
            staging_dir: None,
            single_file: OnceLock::new(),
            matcher,
        }
    }

    /// Write template instances under `dir/<sip id>/` so they have a backing file.
    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }

    /// Metadata entry for `sip`. Failures come back as an unresolved entry.
    pub fn resolve(&self, sip: &SipPreview) -> DescObjMetadata {
        match self.try_resolve(sip) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(sip_id = %sip.id, "Metadata resolution failed: {}", e);
                DescObjMetadata::unresolved(self.option.source(), &e)
            }
        }
    }

    /// Resolve and attach to `sip`, recording any error as an issue of that preview.
    pub fn attach(&self, sip: &mut SipPreview) {
        let entry = self.resolve(sip);
        if let Some(error) = &entry.error {
            sip.issues.push(error.clone());
        }
        sip.metadata.push(entry);
    }

    fn try_resolve(&self, sip: &SipPreview) -> Result<DescObjMetadata> {
        match self.option {
            MetadataOption::Template { name, version } => self.resolve_template(sip, name, version),
            MetadataOption::SingleFile {
                path,
                metadata_type,
            } => self.resolve_single_file(path, metadata_type),
            MetadataOption::SameDirectory {
                pattern,
                metadata_type,
            } => self.resolve_same_directory(sip, pattern, metadata_type),
            MetadataOption::DiffDirectory {
                root,
                metadata_type,
            } => self.resolve_diff_directory(sip, root, metadata_type),
            MetadataOption::NewFile { metadata_type } => {
                Ok(DescObjMetadata::new_empty(metadata_type.clone()))
            }
        }
    }

    fn resolve_template(
        &self,
        sip: &SipPreview,
        name: &str,
        version: &Option<String>,
    ) -> Result<DescObjMetadata> {
        let fields = TemplateFields {
            id: sip.id.clone(),
            title: sip.title.clone(),
            parent_id: sip.parent_id.clone(),
            level: None,
        };
        let content = self.templates.render(name, &fields)?;
        let mut entry = DescObjMetadata::from_template(name, version.clone(), content);

        if let Some(staging) = &self.staging_dir {
            let staged = staging.join(&sip.id).join(&entry.id);
            atomic_write(&staged, entry.cached_content().unwrap_or_default().as_bytes())?;
            debug!(sip_id = %sip.id, "Staged template metadata at {}", staged.display());
            entry.path = Some(staged);
        }
        Ok(entry)
    }

    fn resolve_single_file(
        &self,
        path: &Path,
        metadata_type: &Option<String>,
    ) -> Result<DescObjMetadata> {
        let content = self
            .single_file
            .get_or_init(|| fs::read_to_string(path).map_err(|e| SipError::io_with_path(e, path).to_string()))
            .clone()
            .map_err(SipError::Other)?;
        Ok(
            DescObjMetadata::from_file(MetadataSource::SingleFile, path, metadata_type.clone())
                .with_content(content),
        )
    }

    fn resolve_same_directory(
        &self,
        sip: &SipPreview,
        pattern: &str,
        metadata_type: &Option<String>,
    ) -> Result<DescObjMetadata> {
        let matcher = match &self.matcher {
            Some(Ok(matcher)) => matcher,
            Some(Err(message)) => {
                return Err(SipError::InvalidPattern {
                    pattern: pattern.to_string(),
                    message: message.clone(),
                })
            }
            None => return Err(SipError::Other("missing metadata pattern".to_string())),
        };
        let source = origin(sip)?;
        let dir = if source.is_dir() {
            source.to_path_buf()
        } else {
            source.parent().unwrap_or(source).to_path_buf()
        };

        let candidates = list_files(&dir, |name| matcher.is_match(name))?;
        let path = single_candidate(dir, pattern, candidates)?;
        Ok(DescObjMetadata::from_file(
            MetadataSource::SameDirectory,
            path,
            metadata_type.clone(),
        ))
    }

    fn resolve_diff_directory(
        &self,
        sip: &SipPreview,
        metadata_root: &Path,
        metadata_type: &Option<String>,
    ) -> Result<DescObjMetadata> {
        let source = origin(sip)?;
        let relative = match &self.ancestor {
            Some(ancestor) => source.strip_prefix(ancestor).unwrap_or(source),
            None => source,
        };
        let target_dir = match relative.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => metadata_root.join(parent),
            _ => metadata_root.to_path_buf(),
        };
        let stem = if source.is_dir() {
            source.file_name()
        } else {
            source.file_stem()
        }
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| SipError::Other(format!("No name for {}", source.display())))?;

        let candidates = list_files(&target_dir, |name| {
            Path::new(name)
                .file_stem()
                .map(|s| s.to_string_lossy() == stem)
                .unwrap_or(false)
        })?;
        let path = single_candidate(target_dir, &format!("{}.*", stem), candidates)?;
        Ok(DescObjMetadata::from_file(
            MetadataSource::DiffDirectory,
            path,
            metadata_type.clone(),
        ))
    }
}

fn origin(sip: &SipPreview) -> Result<&Path> {
    sip.source_path
        .as_deref()
        .ok_or_else(|| SipError::Other(format!("SIP {} has no source path", sip.id)))
}

/// Files directly inside `dir` whose name satisfies `accept`, sorted.
fn list_files(dir: &Path, accept: impl Fn(&str) -> bool) -> Result<Vec<PathBuf>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(SipError::io_with_path(e, dir)),
    };
    let mut found: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|e| accept(&e.file_name().to_string_lossy()))
        .map(|e| e.path())
        .collect();
    found.sort();
    Ok(found)
}

fn single_candidate(dir: PathBuf, pattern: &str, mut candidates: Vec<PathBuf>) -> Result<PathBuf> {
    match candidates.len() {
        0 => Err(SipError::MetadataNotFound {
            dir,
            pattern: pattern.to_string(),
        }),
        1 => Ok(candidates.remove(0)),
        _ => Err(SipError::MetadataAmbiguous { dir, candidates }),
    }
}
