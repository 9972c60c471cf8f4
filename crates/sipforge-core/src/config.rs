//! Centralized configuration for SIP Forge.
//!
//! Constant groups for walkers, packaging and paths, plus `ForgeSettings`, the
//! user-editable settings file stored in the work directory.

use crate::error::Result;
use crate::package::PackageFormat;
use crate::persist::{atomic_read_json, atomic_write_json};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application-level configuration.
pub struct AppConfig;

impl AppConfig {
    pub const APP_NAME: &'static str = "SIP Forge";
    /// Software agent recorded in package manifests.
    pub const AGENT_NAME: &'static str = "sipforge";
}

/// Tree walker tuning.
pub struct WalkerConfig;

impl WalkerConfig {
    /// Minimum spacing between progress notifications of a walk.
    pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(500);
    /// Prefix of identifiers generated for SIP previews.
    pub const SIP_ID_PREFIX: &'static str = "sip_";
}

/// Package building constants.
pub struct PackagingConfig;

impl PackagingConfig {
    pub const EARK_EXTENSION: &'static str = "zip";
    pub const BAGIT_VERSION: &'static str = "1.0";
    pub const COPY_BUFFER_SIZE: usize = 64 * 1024;
    pub const DEFAULT_CONTENT_TYPE: &'static str = "MIXED";
}

/// Directory and file names inside the work directory.
pub struct PathsConfig;

impl PathsConfig {
    pub const WORK_DIR_NAME: &'static str = "sipforge";
    pub const SETTINGS_FILENAME: &'static str = "sipforge.json";
    pub const RECOVERY_FILENAME: &'static str = "recovery.json";
    pub const TEMPLATES_DIR_NAME: &'static str = "templates";
    pub const SCHEMAS_DIR_NAME: &'static str = "schemas";
    pub const STAGING_DIR_NAME: &'static str = "staging";
    pub const EXPORT_STAGING_DIR_NAME: &'static str = "export-staging";
    pub const LOGS_DIR_NAME: &'static str = "logs";
}

/// Default work directory: `<data dir>/sipforge`, falling back to the current directory.
pub fn default_work_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(PathsConfig::WORK_DIR_NAME)
}

/// User-editable settings persisted as `sipforge.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForgeSettings {
    /// Comma-separated glob patterns excluded from every walk (e.g. `*.tmp,Thumbs.db`).
    pub ignored_files: String,
    /// Template directory; relative paths resolve against the work dir.
    pub templates_dir: PathBuf,
    /// Schema directory; relative paths resolve against the work dir.
    pub schemas_dir: PathBuf,
    pub default_format: PackageFormat,
    /// Write a recovery file on shutdown.
    pub recovery_enabled: bool,
}

impl Default for ForgeSettings {
    fn default() -> Self {
        Self {
            ignored_files: ".DS_Store,Thumbs.db,desktop.ini".to_string(),
            templates_dir: PathBuf::from(PathsConfig::TEMPLATES_DIR_NAME),
            schemas_dir: PathBuf::from(PathsConfig::SCHEMAS_DIR_NAME),
            default_format: PackageFormat::Eark,
            recovery_enabled: true,
        }
    }
}

impl ForgeSettings {
    /// Load settings from `<work_dir>/sipforge.json`, or defaults when the file is absent.
    pub fn load(work_dir: &Path) -> Result<Self> {
        let path = work_dir.join(PathsConfig::SETTINGS_FILENAME);
        Ok(atomic_read_json(&path)?.unwrap_or_default())
    }

    /// Save settings to `<work_dir>/sipforge.json`.
    pub fn save(&self, work_dir: &Path) -> Result<()> {
        let path = work_dir.join(PathsConfig::SETTINGS_FILENAME);
        atomic_write_json(&path, self, true)
    }

    /// Individual ignore patterns, trimmed, empties dropped.
    pub fn ignore_patterns(&self) -> Vec<String> {
        self.ignored_files
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    pub fn resolved_templates_dir(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.templates_dir)
    }

    pub fn resolved_schemas_dir(&self, work_dir: &Path) -> PathBuf {
        work_dir.join(&self.schemas_dir)
    }
}
