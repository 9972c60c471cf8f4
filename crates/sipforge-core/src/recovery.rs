//! Recovery file: classification nodes, rules and their previews, written on
//! shutdown and offered for reload at the next start.

use crate::error::{Result, SipError};
use crate::persist::{atomic_read_json, atomic_write_json};
use crate::rule::{RuleDefinition, RuleState};
use crate::scheme::SchemeNode;
use crate::sip::SipPreview;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Current recovery file layout.
pub const RECOVERY_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveredRule {
    pub id: String,
    pub definition: RuleDefinition,
    /// State at save time; rules still pending or applying have no previews.
    pub state: RuleState,
    #[serde(default)]
    pub sips: Vec<SipPreview>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryFile {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    pub nodes: Vec<SchemeNode>,
    pub rules: Vec<RecoveredRule>,
}

/// Counts shown before offering a reload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub nodes: usize,
    pub rules: usize,
    pub unresolved_rules: usize,
    pub sips: usize,
    pub removed_sips: usize,
    pub files: usize,
}

impl RecoveryFile {
    pub fn new(nodes: Vec<SchemeNode>, rules: Vec<RecoveredRule>) -> Self {
        Self {
            version: RECOVERY_VERSION,
            saved_at: Utc::now(),
            nodes,
            rules,
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        atomic_write_json(path, self, false)?;
        info!(
            nodes = self.nodes.len(),
            rules = self.rules.len(),
            "Wrote recovery file {}",
            path.display()
        );
        Ok(())
    }

    /// `Ok(None)` when there is nothing to recover.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let Some(file) = atomic_read_json::<RecoveryFile>(path)? else {
            return Ok(None);
        };
        if file.version > RECOVERY_VERSION {
            return Err(SipError::Config {
                message: format!(
                    "Recovery file {} has version {}, newest supported is {}",
                    path.display(),
                    file.version,
                    RECOVERY_VERSION
                ),
            });
        }
        Ok(Some(file))
    }

    pub fn summary(&self) -> RecoverySummary {
        let mut summary = RecoverySummary {
            nodes: self.nodes.len(),
            rules: self.rules.len(),
            ..Default::default()
        };
        for rule in &self.rules {
            if matches!(rule.state, RuleState::Pending | RuleState::Applying) {
                summary.unresolved_rules += 1;
            }
            for sip in &rule.sips {
                summary.sips += 1;
                if sip.removed {
                    summary.removed_sips += 1;
                } else {
                    summary.files += sip.file_count();
                }
            }
        }
        summary
    }
}
