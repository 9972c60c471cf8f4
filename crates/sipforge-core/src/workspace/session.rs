//! Recovery file handling and shutdown for [`SipWorkspace`].

use super::SipWorkspace;
use crate::config::PathsConfig;
use crate::error::Result;
use crate::recovery::{RecoveredRule, RecoveryFile, RecoverySummary};
use crate::rule::{Rule, RuleState};
use crate::scheme::ClassificationScheme;
use std::path::PathBuf;
use tracing::{info, warn};

impl SipWorkspace {
    pub fn recovery_path(&self) -> PathBuf {
        self.work_dir.join(PathsConfig::RECOVERY_FILENAME)
    }

    /// Write the scheme and every rule that is not removed to the recovery file.
    ///
    /// Rules still walking are saved without previews and come back pending.
    pub fn save_recovery(&self) -> Result<PathBuf> {
        let nodes = self.scheme().nodes().cloned().collect();
        let rules = self
            .rules()
            .iter()
            .filter(|r| !matches!(r.state(), RuleState::Removing | RuleState::Removed))
            .map(|r| {
                let (state, sips) = r.snapshot();
                RecoveredRule {
                    id: r.id().to_string(),
                    definition: r.definition().clone(),
                    state,
                    sips,
                }
            })
            .collect();

        let path = self.recovery_path();
        RecoveryFile::new(nodes, rules).save(&path)?;
        Ok(path)
    }

    /// Summary of the recovery file without loading it, `None` when there is none.
    pub fn peek_recovery(&self) -> Result<Option<RecoverySummary>> {
        Ok(RecoveryFile::load(&self.recovery_path())?.map(|f| f.summary()))
    }

    /// Replace the scheme and rules with the recovery file content.
    ///
    /// Walks of the current rules are cancelled first. Returns `None` when
    /// there is nothing to recover.
    pub fn load_recovery(&self) -> Result<Option<RecoverySummary>> {
        let Some(file) = RecoveryFile::load(&self.recovery_path())? else {
            return Ok(None);
        };
        let summary = file.summary();

        self.registry.cancel_all();
        for rule in self.rules() {
            rule.wait();
        }

        let staging_root = self.work_dir.join(PathsConfig::STAGING_DIR_NAME);
        let restored: Vec<_> = file
            .rules
            .into_iter()
            .map(|r| {
                let rule = Rule::restored(r.id, r.definition, r.sips);
                rule.adopt_staging(&staging_root);
                rule
            })
            .collect();
        *self.scheme.write().expect("workspace scheme lock poisoned") =
            ClassificationScheme::from_nodes(file.nodes);
        *self.rules.write().expect("workspace rules lock poisoned") = restored;

        info!(
            nodes = summary.nodes,
            rules = summary.rules,
            sips = summary.sips,
            "Loaded recovery file"
        );
        Ok(Some(summary))
    }

    /// Cancel every walk, wait for the workers, then write the recovery file
    /// when enabled. Returns the recovery file path if one was written.
    pub fn shutdown(&self) -> Result<Option<PathBuf>> {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            warn!(walks = cancelled, "Cancelled running walks on shutdown");
        }
        for rule in self.rules() {
            rule.wait();
        }

        if !self.settings.recovery_enabled {
            return Ok(None);
        }
        self.save_recovery().map(Some)
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ForgeSettings;
    use crate::metadata::MetadataOption;
    use crate::rule::{RuleDefinition, RuleState};
    use crate::scheme::SchemeNode;
    use crate::walker::WalkerKind;
    use crate::SipWorkspace;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_shutdown_then_reload() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        fs::write(src.join("b.txt"), "b").unwrap();
        let work = temp.path().join("work");

        let first = SipWorkspace::builder(&work).build().unwrap();
        let node = first
            .add_node(SchemeNode::new("Fonds", None).with_id("n1"))
            .unwrap();
        let rule = first
            .create_rule(RuleDefinition {
                roots: vec![src.clone()],
                walker: WalkerKind::PerFile,
                metadata: MetadataOption::default(),
                destination: node,
            })
            .unwrap();
        first.apply_rule(rule.id()).unwrap();
        rule.wait();
        let sip_id = first.all_description_objects()[0].read().unwrap().id.clone();
        first.remove_sip(&sip_id).unwrap();
        assert!(first.shutdown().unwrap().is_some());

        let second = SipWorkspace::builder(&work).build().unwrap();
        let summary = second.load_recovery().unwrap().unwrap();
        assert_eq!(summary.sips, 2);
        assert_eq!(summary.removed_sips, 1);
        assert!(second.scheme().contains("n1"));
        assert_eq!(second.rules()[0].id(), rule.id());
        assert_eq!(second.rules()[0].state(), RuleState::Applied);
        assert_eq!(second.all_description_objects().len(), 1);
    }

    #[test]
    fn test_reload_keeps_ignored_files_out() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(src.join("a")).unwrap();
        fs::write(src.join("a/keep.txt"), "k").unwrap();
        fs::write(src.join("a/x.tmp"), "t").unwrap();
        let work = temp.path().join("work");
        let settings = ForgeSettings {
            ignored_files: "*.tmp".to_string(),
            ..Default::default()
        };

        let first = SipWorkspace::builder(&work)
            .settings(settings.clone())
            .build()
            .unwrap();
        let node = first.add_node(SchemeNode::new("Fonds", None)).unwrap();
        let rule = first
            .create_rule(RuleDefinition {
                roots: vec![src.join("a")],
                walker: WalkerKind::SingleSip,
                metadata: MetadataOption::default(),
                destination: node,
            })
            .unwrap();
        first.apply_rule(rule.id()).unwrap();
        rule.wait();
        let before = first.all_description_objects()[0].read().unwrap().file_paths();
        assert_eq!(before, vec![src.join("a/keep.txt")]);
        first.shutdown().unwrap();

        let second = SipWorkspace::builder(&work).settings(settings).build().unwrap();
        second.load_recovery().unwrap();
        let after = second.all_description_objects()[0].read().unwrap().file_paths();
        assert_eq!(after, before);
    }

    #[test]
    fn test_removing_reloaded_template_rule_deletes_staging() {
        let temp = TempDir::new().unwrap();
        let src = temp.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("a.txt"), "a").unwrap();
        let work = temp.path().join("work");
        fs::create_dir_all(work.join("templates")).unwrap();
        fs::write(work.join("templates/dc.xml"), "<dc>{{title}}</dc>").unwrap();

        let first = SipWorkspace::builder(&work).build().unwrap();
        let node = first.add_node(SchemeNode::new("Fonds", None)).unwrap();
        let rule = first
            .create_rule(RuleDefinition {
                roots: vec![src.clone()],
                walker: WalkerKind::PerFile,
                metadata: MetadataOption::Template {
                    name: "dc".to_string(),
                    version: None,
                },
                destination: node,
            })
            .unwrap();
        first.apply_rule(rule.id()).unwrap();
        assert_eq!(rule.wait(), RuleState::Applied);
        let staged = work.join("staging").join(rule.id());
        assert!(staged.is_dir());
        first.shutdown().unwrap();

        let second = SipWorkspace::builder(&work).build().unwrap();
        second.load_recovery().unwrap();
        second.remove_rule(rule.id()).unwrap();
        assert!(!staged.exists());
    }

    #[test]
    fn test_shutdown_skips_recovery_when_disabled() {
        let temp = TempDir::new().unwrap();
        let ws = SipWorkspace::builder(temp.path())
            .settings(ForgeSettings {
                recovery_enabled: false,
                ..Default::default()
            })
            .build()
            .unwrap();
        assert!(ws.shutdown().unwrap().is_none());
        assert!(!ws.recovery_path().exists());
        assert!(ws.load_recovery().unwrap().is_none());
    }
}
