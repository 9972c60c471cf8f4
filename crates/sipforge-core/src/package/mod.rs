//! Package building: finished previews to archival packages on disk.
//!
//! For every SIP the builder stages its metadata, plans the payload (directories
//! first, then files, reporting each file), and hands the plan to the format
//! writer. A failing SIP is recorded and the batch moves on; cancellation is
//! checked between SIPs.

mod bagit;
mod eark;

use crate::cancel::CancellationToken;
use crate::config::PathsConfig;
use crate::error::{Result, SipError};
use crate::events::{ExportEvent, ExportEventKind, FailedSip, Subscribers};
use crate::metadata::{DescriptiveType, TemplateStore};
use crate::persist::atomic_write;
use crate::sip::{SharedSip, SipPreview};
use crate::tree::TreeNode;
use serde::{Deserialize, Serialize};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// Archival package layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageFormat {
    /// Zip archive with a METS manifest.
    #[default]
    Eark,
    /// BagIt directory with a SHA-256 manifest.
    Bagit,
}

impl PackageFormat {
    /// Output path of a SIP in this format.
    pub fn output_path(&self, output_dir: &Path, sip_id: &str) -> PathBuf {
        match self {
            PackageFormat::Eark => eark::output_path(output_dir, sip_id),
            PackageFormat::Bagit => bagit::output_path(output_dir, sip_id),
        }
    }
}

impl std::fmt::Display for PackageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PackageFormat::Eark => write!(f, "eark"),
            PackageFormat::Bagit => write!(f, "bagit"),
        }
    }
}

impl std::str::FromStr for PackageFormat {
    type Err = SipError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "eark" | "e-ark" => Ok(PackageFormat::Eark),
            "bagit" => Ok(PackageFormat::Bagit),
            other => Err(SipError::Config {
                message: format!("Unknown package format: {}", other),
            }),
        }
    }
}

/// Outcome of an export batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportReport {
    pub batch_id: String,
    pub created: usize,
    pub outputs: Vec<PathBuf>,
    pub failed: Vec<FailedSip>,
    /// Stopped before every SIP was attempted.
    pub cancelled: bool,
}

/// Metadata entry with a file ready to be packaged.
#[derive(Debug, Clone)]
pub(crate) struct StagedMetadata {
    pub id: String,
    pub path: PathBuf,
    pub descriptive_type: DescriptiveType,
    pub version: Option<String>,
    pub schema: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub(crate) struct PlannedFile {
    pub source: PathBuf,
    pub relative: PathBuf,
}

/// Payload unit (a representation or the documentation) laid out for writing.
#[derive(Debug, Clone, Default)]
pub(crate) struct PlannedTree {
    pub name: String,
    /// Relative directories, parents before children.
    pub directories: Vec<PathBuf>,
    pub files: Vec<PlannedFile>,
}

impl PlannedTree {
    /// Two passes over `nodes`: count files, then add directories and files,
    /// calling `on_file(processed, total)` after each file.
    fn collect(name: &str, nodes: &[TreeNode], on_file: &mut dyn FnMut(usize, usize)) -> Self {
        let total: usize = nodes.iter().map(TreeNode::file_count).sum();
        let mut tree = PlannedTree {
            name: name.to_string(),
            ..Default::default()
        };
        for node in nodes {
            tree.add_directories(node, Path::new(""));
        }
        let mut processed = 0;
        for node in nodes {
            tree.add_files(node, Path::new(""), &mut processed, total, on_file);
        }
        tree
    }

    fn add_directories(&mut self, node: &TreeNode, prefix: &Path) {
        if !node.is_dir() {
            return;
        }
        let relative = prefix.join(node.name());
        self.directories.push(relative.clone());
        for child in node.children() {
            self.add_directories(child, &relative);
        }
    }

    fn add_files(
        &mut self,
        node: &TreeNode,
        prefix: &Path,
        processed: &mut usize,
        total: usize,
        on_file: &mut dyn FnMut(usize, usize),
    ) {
        let relative = prefix.join(node.name());
        if node.is_dir() {
            for child in node.children() {
                self.add_files(child, &relative, processed, total, on_file);
            }
            return;
        }
        self.files.push(PlannedFile {
            source: node.path().to_path_buf(),
            relative,
        });
        *processed += 1;
        on_file(*processed, total);
    }

    pub fn entry_count(&self) -> usize {
        self.directories.len() + self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directories.is_empty() && self.files.is_empty()
    }
}

/// Everything a format writer needs for one SIP.
#[derive(Debug, Clone)]
pub(crate) struct SipPlan {
    pub sip_id: String,
    pub title: String,
    pub parent_id: Option<String>,
    pub content_type: String,
    pub metadata: Vec<StagedMetadata>,
    pub representations: Vec<PlannedTree>,
    pub documentation: PlannedTree,
}

impl SipPlan {
    /// Distinct schema files, in metadata order.
    pub fn schemas(&self) -> Vec<&Path> {
        let mut schemas: Vec<&Path> = Vec::new();
        for schema in self.metadata.iter().filter_map(|m| m.schema.as_deref()) {
            if !schemas.contains(&schema) {
                schemas.push(schema);
            }
        }
        schemas
    }

    /// Payload entries: directories and files of all representations and documentation.
    pub fn payload_entries(&self) -> usize {
        self.representations
            .iter()
            .map(PlannedTree::entry_count)
            .sum::<usize>()
            + self.documentation.entry_count()
    }
}

/// Zip/relative path with `/` separators whatever the platform.
pub(crate) fn archive_name(parts: &[&Path]) -> String {
    parts
        .iter()
        .flat_map(|p| p.components())
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Builds one batch of SIPs in a given format.
#[derive(Debug, Clone)]
pub struct PackageBuilder {
    batch_id: String,
    format: PackageFormat,
    output_dir: PathBuf,
    staging_dir: PathBuf,
    templates: Option<Arc<TemplateStore>>,
    token: CancellationToken,
}

impl PackageBuilder {
    /// # Arguments
    ///
    /// * `format` - Package layout to produce
    /// * `output_dir` - Directory receiving one package per SIP
    /// * `work_dir` - Work directory; edited metadata is staged below it
    pub fn new(format: PackageFormat, output_dir: impl Into<PathBuf>, work_dir: &Path) -> Self {
        let batch_id = format!("batch_{}", uuid::Uuid::new_v4());
        let staging_dir = work_dir
            .join(PathsConfig::EXPORT_STAGING_DIR_NAME)
            .join(&batch_id);
        Self {
            batch_id,
            format,
            output_dir: output_dir.into(),
            staging_dir,
            templates: None,
            token: CancellationToken::new(),
        }
    }

    /// Look up metadata schemas in this store.
    pub fn with_templates(mut self, templates: Arc<TemplateStore>) -> Self {
        self.templates = Some(templates);
        self
    }

    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    pub fn format(&self) -> PackageFormat {
        self.format
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Build every SIP in order on the calling thread.
    pub fn build<F>(&self, sips: &[SharedSip], mut on_event: F) -> ExportReport
    where
        F: FnMut(ExportEvent),
    {
        let mut emit = |kind: ExportEventKind| {
            on_event(ExportEvent {
                batch_id: self.batch_id.clone(),
                kind,
            })
        };
        let mut report = ExportReport {
            batch_id: self.batch_id.clone(),
            ..Default::default()
        };
        info!(
            batch_id = %self.batch_id,
            format = %self.format,
            sips = sips.len(),
            "Starting export to {}",
            self.output_dir.display()
        );

        for (index, shared) in sips.iter().enumerate() {
            if self.token.is_cancelled() {
                info!(batch_id = %self.batch_id, remaining = sips.len() - index, "Export cancelled");
                report.cancelled = true;
                break;
            }

            let sip = match shared.read() {
                Ok(guard) => guard.clone(),
                Err(poisoned) => poisoned.into_inner().clone(),
            };
            if sip.removed {
                debug!(batch_id = %self.batch_id, sip_id = %sip.id, "Skipping removed SIP");
                continue;
            }

            emit(ExportEventKind::SipStarted {
                sip_id: sip.id.clone(),
                index,
                total: sips.len(),
            });
            let built = panic::catch_unwind(AssertUnwindSafe(|| self.build_one(&sip, &mut emit)));
            let result = match built {
                Ok(result) => result,
                Err(payload) => Err(SipError::from_panic(payload.as_ref())),
            };

            match result {
                Ok(output) => {
                    debug!(batch_id = %self.batch_id, sip_id = %sip.id, "Created {}", output.display());
                    report.created += 1;
                    report.outputs.push(output.clone());
                    emit(ExportEventKind::SipDone {
                        sip_id: sip.id.clone(),
                        output,
                    });
                }
                Err(e) => {
                    error!(batch_id = %self.batch_id, sip_id = %sip.id, "SIP failed: {}", e);
                    let failed = FailedSip {
                        sip_id: sip.id.clone(),
                        error: e.to_string(),
                    };
                    report.failed.push(failed.clone());
                    emit(ExportEventKind::SipFailed(failed));
                }
            }
        }

        info!(
            batch_id = %self.batch_id,
            created = report.created,
            failed = report.failed.len(),
            "Export finished"
        );
        emit(ExportEventKind::BatchDone {
            created: report.created,
            failed: report.failed.clone(),
            cancelled: report.cancelled,
        });
        report
    }

    /// Build on a dedicated worker thread, notifying `subscribers`.
    pub fn spawn(
        self,
        sips: Vec<SharedSip>,
        subscribers: Arc<Subscribers<ExportEvent>>,
    ) -> Result<ExportHandle> {
        let batch_id = self.batch_id.clone();
        let token = self.token.clone();
        let handle = thread::Builder::new()
            .name(format!("export-{}", &batch_id))
            .spawn(move || self.build(&sips, |event| subscribers.emit(&event)))
            .map_err(|e| SipError::Io {
                message: format!("Failed to spawn export thread: {}", e),
                path: None,
                source: Some(e),
            })?;
        Ok(ExportHandle {
            batch_id,
            token,
            handle,
        })
    }

    fn build_one(
        &self,
        sip: &SipPreview,
        emit: &mut dyn FnMut(ExportEventKind),
    ) -> Result<PathBuf> {
        let plan = self.plan(sip, emit)?;
        fs::create_dir_all(&self.output_dir)
            .map_err(|e| SipError::io_with_path(e, &self.output_dir))?;

        let sip_id = sip.id.clone();
        let mut on_entry = |current: usize, total: usize| {
            emit(ExportEventKind::PackagingProgress {
                sip_id: sip_id.clone(),
                current,
                total,
            })
        };
        match self.format {
            PackageFormat::Eark => eark::write(&plan, &self.output_dir, &mut on_entry),
            PackageFormat::Bagit => bagit::write(&plan, &self.output_dir, &mut on_entry),
        }
    }

    fn plan(&self, sip: &SipPreview, emit: &mut dyn FnMut(ExportEventKind)) -> Result<SipPlan> {
        let metadata = sip
            .metadata
            .iter()
            .map(|entry| self.stage_metadata(sip, entry.clone()))
            .collect::<Result<Vec<_>>>()?;

        let mut on_file = |processed: usize, total: usize| {
            emit(ExportEventKind::RepresentationProgress {
                sip_id: sip.id.clone(),
                processed,
                total,
            })
        };
        let representations = sip
            .representations
            .iter()
            .map(|rep| PlannedTree::collect(&rep.name, &rep.files, &mut on_file))
            .collect();
        let documentation = PlannedTree::collect("documentation", &sip.documentation, &mut on_file);

        Ok(SipPlan {
            sip_id: sip.id.clone(),
            title: sip.title.clone(),
            parent_id: sip.parent_id.clone(),
            content_type: sip.content_type.clone(),
            metadata,
            representations,
            documentation,
        })
    }

    /// Backing file when untouched, otherwise a fresh staging file with the content.
    fn stage_metadata(
        &self,
        sip: &SipPreview,
        mut entry: crate::metadata::DescObjMetadata,
    ) -> Result<StagedMetadata> {
        if let Some(error) = &entry.error {
            return Err(SipError::Packaging {
                sip_id: sip.id.clone(),
                message: format!("unresolved metadata: {}", error),
            });
        }

        let path = match entry.backing_file() {
            Some(path) if path.is_file() => path.to_path_buf(),
            Some(path) => return Err(SipError::FileNotFound(path.to_path_buf())),
            None => {
                let staged = self.staging_dir.join(&sip.id).join(&entry.id);
                let content = entry.content()?;
                atomic_write(&staged, content.as_bytes())?;
                staged
            }
        };
        let schema = match (&self.templates, entry.schema_name()) {
            (Some(templates), Some(name)) => templates.schema_path(&name),
            _ => None,
        };
        if schema.is_none() {
            debug!(sip_id = %sip.id, metadata = %entry.id, "No schema for metadata entry");
        }

        Ok(StagedMetadata {
            id: entry.id.clone(),
            descriptive_type: entry.descriptive_type(),
            version: entry.version.clone(),
            path,
            schema,
        })
    }
}

/// A running export batch.
#[derive(Debug)]
pub struct ExportHandle {
    batch_id: String,
    token: CancellationToken,
    handle: JoinHandle<ExportReport>,
}

impl ExportHandle {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Stop before the next SIP. SIPs not yet attempted are not reported as failed.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the batch to finish.
    pub fn wait(self) -> Result<ExportReport> {
        self.handle.join().map_err(|payload| {
            warn!(batch_id = %self.batch_id, "Export thread panicked");
            SipError::from_panic(payload.as_ref())
        })
    }
}

/// Replace `target` with the finished `partial` output.
pub(crate) fn replace_output(partial: &Path, target: &Path) -> Result<()> {
    if target.is_dir() {
        fs::remove_dir_all(target).map_err(|e| SipError::io_with_path(e, target))?;
    } else if target.exists() {
        fs::remove_file(target).map_err(|e| SipError::io_with_path(e, target))?;
    }
    fs::rename(partial, target).map_err(|e| SipError::io_with_path(e, target))
}
