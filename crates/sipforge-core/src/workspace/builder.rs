//! Builder for configuring a [`SipWorkspace`].

use super::SipWorkspace;
use crate::config::{default_work_dir, ForgeSettings, PathsConfig, WalkerConfig};
use crate::error::{Result, SipError};
use crate::filter::FilterSet;
use crate::metadata::TemplateStore;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Builder for a workspace rooted at a work directory.
///
/// # Example
///
/// ```rust,no_run
/// use sipforge_core::SipWorkspace;
///
/// let workspace = SipWorkspace::builder("/tmp/sipforge")
///     .auto_create_dirs(true)
///     .build()?;
/// # Ok::<(), sipforge_core::SipError>(())
/// ```
#[derive(Debug, Clone)]
pub struct SipWorkspaceBuilder {
    work_dir: PathBuf,
    auto_create_dirs: bool,
    settings: Option<ForgeSettings>,
    progress_interval: Duration,
}

impl Default for SipWorkspaceBuilder {
    fn default() -> Self {
        Self::new(default_work_dir())
    }
}

impl SipWorkspaceBuilder {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            auto_create_dirs: true,
            settings: None,
            progress_interval: WalkerConfig::PROGRESS_INTERVAL,
        }
    }

    /// Create the work directory layout if missing.
    ///
    /// Default: `true`. When disabled the work directory must already exist.
    pub fn auto_create_dirs(mut self, enable: bool) -> Self {
        self.auto_create_dirs = enable;
        self
    }

    /// Use these settings instead of `sipforge.json`.
    pub fn settings(mut self, settings: ForgeSettings) -> Self {
        self.settings = Some(settings);
        self
    }

    /// Spacing of walk progress notifications.
    ///
    /// Default: [`WalkerConfig::PROGRESS_INTERVAL`]
    pub fn progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    fn create_directory_structure(work_dir: &Path, settings: &ForgeSettings) -> Result<()> {
        let dirs = [
            work_dir.to_path_buf(),
            settings.resolved_templates_dir(work_dir),
            settings.resolved_schemas_dir(work_dir),
            work_dir.join(PathsConfig::STAGING_DIR_NAME),
            work_dir.join(PathsConfig::EXPORT_STAGING_DIR_NAME),
            work_dir.join(PathsConfig::LOGS_DIR_NAME),
        ];

        for dir in &dirs {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| SipError::Io {
                    message: format!("Failed to create directory: {}", dir.display()),
                    path: Some(dir.clone()),
                    source: Some(e),
                })?;
            }
        }
        Ok(())
    }

    pub fn build(self) -> Result<SipWorkspace> {
        if !self.auto_create_dirs && !self.work_dir.is_dir() {
            return Err(SipError::Config {
                message: format!("Work directory does not exist: {}", self.work_dir.display()),
            });
        }

        let settings = match self.settings {
            Some(settings) => settings,
            None => ForgeSettings::load(&self.work_dir)?,
        };
        if self.auto_create_dirs {
            Self::create_directory_structure(&self.work_dir, &settings)?;
        }

        let filters = FilterSet::from_ignore_list(&settings.ignored_files)?;
        let templates = TemplateStore::new(
            settings.resolved_templates_dir(&self.work_dir),
            settings.resolved_schemas_dir(&self.work_dir),
        );
        info!(
            work_dir = %self.work_dir.display(),
            ignore_patterns = settings.ignore_patterns().len(),
            "Opened SIP workspace"
        );

        Ok(SipWorkspace::assemble(
            self.work_dir,
            settings,
            filters,
            templates,
            self.progress_interval,
        ))
    }
}
