//! Workspace facade owning the classification scheme, the rules and the
//! collaborators they share.
//!
//! The struct definition lives here; recovery and shutdown are in `session`.

mod builder;
mod session;

pub use builder::SipWorkspaceBuilder;

use crate::config::{ForgeSettings, PathsConfig};
use crate::error::{Result, SipError};
use crate::events::{ExportEvent, SubscriptionId, Subscribers};
use crate::filter::{FilterSet, PathFilter};
use crate::metadata::TemplateStore;
use crate::package::{ExportHandle, PackageBuilder, PackageFormat};
use crate::registry::WalkerRegistry;
use crate::rule::{ApplyContext, Rule, RuleDefinition, RuleState};
use crate::scheme::{ClassificationScheme, SchemeNode};
use crate::sip::SharedSip;
use crate::tree::TreeNode;
use crate::walker::{max_folder_depth, suggested_depth};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Main entry point of the engine.
///
/// Rules and classification nodes live here; walks and exports run on their
/// own threads and report through subscriptions.
pub struct SipWorkspace {
    work_dir: PathBuf,
    settings: ForgeSettings,
    filters: RwLock<FilterSet>,
    templates: Arc<TemplateStore>,
    registry: Arc<WalkerRegistry>,
    scheme: RwLock<ClassificationScheme>,
    rules: RwLock<Vec<Arc<Rule>>>,
    export_events: Arc<Subscribers<ExportEvent>>,
    progress_interval: Duration,
}

impl std::fmt::Debug for SipWorkspace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SipWorkspace")
            .field("work_dir", &self.work_dir)
            .field("rules", &self.rules.read().map(|r| r.len()).unwrap_or(0))
            .finish_non_exhaustive()
    }
}

impl SipWorkspace {
    pub fn builder(work_dir: impl Into<PathBuf>) -> SipWorkspaceBuilder {
        SipWorkspaceBuilder::new(work_dir)
    }

    pub(crate) fn assemble(
        work_dir: PathBuf,
        settings: ForgeSettings,
        filters: FilterSet,
        templates: TemplateStore,
        progress_interval: Duration,
    ) -> Self {
        Self {
            work_dir,
            settings,
            filters: RwLock::new(filters),
            templates: Arc::new(templates),
            registry: Arc::new(WalkerRegistry::new()),
            scheme: RwLock::new(ClassificationScheme::new()),
            rules: RwLock::new(Vec::new()),
            export_events: Arc::new(Subscribers::new()),
            progress_interval,
        }
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn settings(&self) -> &ForgeSettings {
        &self.settings
    }

    pub fn templates(&self) -> &TemplateStore {
        &self.templates
    }

    pub fn registry(&self) -> &WalkerRegistry {
        &self.registry
    }

    /// Exclude these paths (and everything below them) from later walks.
    pub fn ignore_paths<I, P>(&self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let filter = PathFilter::new(paths);
        self.filters
            .write()
            .expect("workspace filters lock poisoned")
            .push(filter);
    }

    /// `(max depth, suggested depth)` for a per-folder rule over `roots`.
    pub fn folder_depths(&self, roots: &[PathBuf]) -> (usize, usize) {
        let filters = self.filters.read().expect("workspace filters lock poisoned");
        let max = max_folder_depth(roots, &filters);
        (max, suggested_depth(max))
    }

    // ---- classification scheme ----

    /// Add a classification node; returns its id.
    pub fn add_node(&self, node: SchemeNode) -> Result<String> {
        self.scheme
            .write()
            .expect("workspace scheme lock poisoned")
            .add_node(node)
    }

    /// Remove a node, its descendants, and every rule targeting any of them.
    ///
    /// Returns the ids of the removed nodes.
    pub fn remove_node(&self, node_id: &str) -> Result<Vec<String>> {
        let removed_nodes = self
            .scheme
            .write()
            .expect("workspace scheme lock poisoned")
            .remove_node(node_id)?;

        let doomed: Vec<Arc<Rule>> = self
            .rules()
            .into_iter()
            .filter(|r| removed_nodes.iter().any(|n| n == r.destination()))
            .collect();
        for rule in &doomed {
            self.remove_rule(rule.id())?;
        }
        info!(
            node_id,
            nodes = removed_nodes.len(),
            rules = doomed.len(),
            "Removed classification node"
        );
        Ok(removed_nodes)
    }

    /// Copy of the current scheme.
    pub fn scheme(&self) -> ClassificationScheme {
        self.scheme
            .read()
            .expect("workspace scheme lock poisoned")
            .clone()
    }

    /// Move a preview under another node. The owning rule does not change.
    pub fn reparent_sip(&self, sip_id: &str, node_id: &str) -> Result<()> {
        if !self.has_node(node_id) {
            return Err(SipError::UnknownNode(node_id.to_string()));
        }
        let sip = self
            .rules()
            .iter()
            .find_map(|r| r.find_sip(sip_id))
            .ok_or_else(|| SipError::SipNotFound(sip_id.to_string()))?;
        sip.write().expect("sip lock poisoned").reparent(node_id);
        Ok(())
    }

    /// Attach a file or directory as documentation of a preview. Ignored
    /// files below `path` are left out.
    pub fn add_documentation(&self, sip_id: &str, path: impl Into<PathBuf>) -> Result<()> {
        let path = path.into();
        let node = {
            let filters = self.filters.read().expect("workspace filters lock poisoned");
            TreeNode::capture(&path, &filters).map_err(|e| SipError::io_with_path(e, &path))?
        };
        let node = node.ok_or_else(|| SipError::InvalidSelection {
            message: format!("{} is excluded by the ignore filters", path.display()),
        })?;
        let sip = self
            .rules()
            .iter()
            .find_map(|r| r.find_sip(sip_id))
            .ok_or_else(|| SipError::SipNotFound(sip_id.to_string()))?;
        sip.write()
            .expect("sip lock poisoned")
            .add_documentation(node);
        Ok(())
    }

    fn has_node(&self, node_id: &str) -> bool {
        self.scheme
            .read()
            .expect("workspace scheme lock poisoned")
            .contains(node_id)
    }

    // ---- rules ----

    /// Register a pending rule. Its destination node must exist.
    pub fn create_rule(&self, definition: RuleDefinition) -> Result<Arc<Rule>> {
        if !self.has_node(&definition.destination) {
            return Err(SipError::UnknownNode(definition.destination));
        }
        let rule = Rule::new(definition);
        self.rules
            .write()
            .expect("workspace rules lock poisoned")
            .push(Arc::clone(&rule));
        info!(rule_id = %rule.id(), walker = %rule.definition().walker, "Created rule");
        Ok(rule)
    }

    /// Start the rule's walk; returns once the worker is running.
    pub fn apply_rule(&self, rule_id: &str) -> Result<()> {
        let rule = self.rule(rule_id)?;
        let filters = self
            .filters
            .read()
            .expect("workspace filters lock poisoned")
            .clone();
        let ctx = ApplyContext::new(
            filters,
            Arc::clone(&self.templates),
            Arc::clone(&self.registry),
            self.work_dir.join(PathsConfig::STAGING_DIR_NAME),
        )
        .with_progress_interval(self.progress_interval);
        rule.apply(ctx)
    }

    /// Remove a rule and forget it. Returns the ids of the previews it flagged removed.
    pub fn remove_rule(&self, rule_id: &str) -> Result<Vec<String>> {
        let rule = self.rule(rule_id)?;
        let removed = rule.remove()?;
        self.rules
            .write()
            .expect("workspace rules lock poisoned")
            .retain(|r| r.id() != rule_id);
        Ok(removed)
    }

    /// Flag one preview removed, whichever rule owns it.
    pub fn remove_sip(&self, sip_id: &str) -> Result<()> {
        let owner = self
            .rules()
            .into_iter()
            .find(|r| r.find_sip(sip_id).is_some())
            .ok_or_else(|| SipError::SipNotFound(sip_id.to_string()))?;
        owner.remove_sip(sip_id)
    }

    pub fn rule(&self, rule_id: &str) -> Result<Arc<Rule>> {
        self.rules
            .read()
            .expect("workspace rules lock poisoned")
            .iter()
            .find(|r| r.id() == rule_id)
            .cloned()
            .ok_or_else(|| SipError::RuleNotFound(rule_id.to_string()))
    }

    /// Rules in creation order.
    pub fn rules(&self) -> Vec<Arc<Rule>> {
        self.rules
            .read()
            .expect("workspace rules lock poisoned")
            .clone()
    }

    /// Every live preview of every rule, in rule order.
    pub fn all_description_objects(&self) -> Vec<SharedSip> {
        self.rules()
            .iter()
            .filter(|r| r.state() != RuleState::Removed)
            .flat_map(|r| r.live_sips())
            .collect()
    }

    // ---- export ----

    pub fn subscribe_exports<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&ExportEvent) + Send + Sync + 'static,
    {
        self.export_events.subscribe(callback)
    }

    pub fn subscribe_exports_channel(&self) -> mpsc::UnboundedReceiver<ExportEvent> {
        self.export_events.subscribe_channel()
    }

    pub fn unsubscribe_exports(&self, id: SubscriptionId) -> bool {
        self.export_events.unsubscribe(id)
    }

    /// Build every live preview into `output_dir` on a background thread.
    ///
    /// `format` defaults to the configured one.
    pub fn export(
        &self,
        format: Option<PackageFormat>,
        output_dir: impl Into<PathBuf>,
    ) -> Result<ExportHandle> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|e| SipError::io_with_path(e, &output_dir))?;

        let sips = self.all_description_objects();
        let format = format.unwrap_or(self.settings.default_format);
        if sips.is_empty() {
            warn!("Export requested with no previews");
        }
        let builder = PackageBuilder::new(format, output_dir, &self.work_dir)
            .with_templates(Arc::clone(&self.templates));
        info!(batch_id = %builder.batch_id(), %format, sips = sips.len(), "Starting export");
        builder.spawn(sips, Arc::clone(&self.export_events))
    }
}
