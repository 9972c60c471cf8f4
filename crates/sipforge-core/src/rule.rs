//! Rules: a selection, a walker variant and a metadata option bound to a
//! destination node.
//!
//! Lifecycle:
//!
//! ```text
//! PENDING -> APPLYING -> APPLIED
//!            APPLYING -> CANCELLED | FAILED
//! any non-removed state -> REMOVING -> REMOVED
//! ```
//!
//! `apply` spawns one worker thread and returns immediately. State changes and
//! their notifications happen under one gate, so observers see transitions in
//! order and the walk's terminal event exactly once. Subscriber callbacks run on
//! the emitting thread while that gate is held: they may read the rule or call
//! [`Rule::cancel`], but must not call `apply`, `remove` or `remove_sip`.

use crate::cancel::CancellationToken;
use crate::config::WalkerConfig;
use crate::error::{Result, SipError};
use crate::events::{RuleEvent, RuleEventKind, SubscriptionId, Subscribers};
use crate::filter::FilterSet;
use crate::metadata::{MetadataOption, MetadataResolver, TemplateStore};
use crate::registry::WalkerRegistry;
use crate::sip::{PreviewCursor, SharedSip, SipPreview};
use crate::walker::{TreeWalker, WalkOutcome, WalkProgress, WalkerKind};
use serde::{Deserialize, Serialize};
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Lifecycle state of a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleState {
    Pending,
    Applying,
    Applied,
    Cancelled,
    /// The worker panicked; recorded as the rule's error.
    Failed,
    Removing,
    Removed,
}

impl RuleState {
    pub fn can_transition_to(self, next: RuleState) -> bool {
        use RuleState::*;
        matches!(
            (self, next),
            (Pending, Applying)
                | (Applying, Applied)
                | (Applying, Cancelled)
                | (Applying, Failed)
                | (Pending | Applying | Applied | Cancelled | Failed, Removing)
                | (Removing, Removed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RuleState::Pending => "pending",
            RuleState::Applying => "applying",
            RuleState::Applied => "applied",
            RuleState::Cancelled => "cancelled",
            RuleState::Failed => "failed",
            RuleState::Removing => "removing",
            RuleState::Removed => "removed",
        }
    }
}

impl std::fmt::Display for RuleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a rule applies to and how.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDefinition {
    /// Selected absolute paths.
    pub roots: Vec<PathBuf>,
    pub walker: WalkerKind,
    #[serde(default)]
    pub metadata: MetadataOption,
    /// Classification node receiving the previews.
    pub destination: String,
}

/// Collaborators a rule needs while applying.
#[derive(Debug, Clone)]
pub struct ApplyContext {
    pub filters: FilterSet,
    pub templates: Arc<TemplateStore>,
    pub registry: Arc<WalkerRegistry>,
    /// Parent of the per-rule directory holding template instances.
    pub staging_dir: PathBuf,
    pub progress_interval: Duration,
}

impl ApplyContext {
    pub fn new(
        filters: FilterSet,
        templates: Arc<TemplateStore>,
        registry: Arc<WalkerRegistry>,
        staging_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            filters,
            templates,
            registry,
            staging_dir: staging_dir.into(),
            progress_interval: WalkerConfig::PROGRESS_INTERVAL,
        }
    }

    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }
}

#[derive(Debug, Clone)]
struct ActiveWalk {
    walk_id: String,
    token: CancellationToken,
    registry: Arc<WalkerRegistry>,
}

/// Previews and aggregated errors of a finished walk.
struct Produced {
    sips: Vec<SipPreview>,
    errors: Vec<String>,
}

/// A classification rule. Always handled through `Arc<Rule>`.
#[derive(Debug)]
pub struct Rule {
    id: String,
    definition: RuleDefinition,
    gate: Mutex<()>,
    state: Mutex<RuleState>,
    sips: RwLock<Vec<SharedSip>>,
    errors: Mutex<Vec<String>>,
    active: Mutex<Option<ActiveWalk>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    staged_dir: Mutex<Option<PathBuf>>,
    subscribers: Subscribers<RuleEvent>,
}

impl Rule {
    /// New pending rule with a generated id.
    pub fn new(definition: RuleDefinition) -> Arc<Self> {
        let id = format!("rule_{}", uuid::Uuid::new_v4());
        Arc::new(Self::with_state(id, definition, RuleState::Pending, Vec::new()))
    }

    /// Rule rebuilt from a recovery file: applied if it has previews, pending otherwise.
    pub fn restored(id: String, definition: RuleDefinition, sips: Vec<SipPreview>) -> Arc<Self> {
        let state = if sips.is_empty() {
            RuleState::Pending
        } else {
            RuleState::Applied
        };
        Arc::new(Self::with_state(id, definition, state, sips))
    }

    fn with_state(
        id: String,
        definition: RuleDefinition,
        state: RuleState,
        sips: Vec<SipPreview>,
    ) -> Self {
        Self {
            id,
            definition,
            gate: Mutex::new(()),
            state: Mutex::new(state),
            sips: RwLock::new(sips.into_iter().map(SipPreview::into_shared).collect()),
            errors: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            worker: Mutex::new(None),
            staged_dir: Mutex::new(None),
            subscribers: Subscribers::new(),
        }
    }

    /// Take back the staged metadata directory of a restored template rule
    /// under `staging_root`, so removing the rule deletes it.
    pub fn adopt_staging(&self, staging_root: &Path) {
        if !matches!(self.definition.metadata, MetadataOption::Template { .. }) {
            return;
        }
        let dir = staging_root.join(&self.id);
        if dir.is_dir() {
            *self.staged_dir.lock().expect("rule staging lock poisoned") = Some(dir);
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn definition(&self) -> &RuleDefinition {
        &self.definition
    }

    pub fn destination(&self) -> &str {
        &self.definition.destination
    }

    pub fn state(&self) -> RuleState {
        *self.state.lock().expect("rule state lock poisoned")
    }

    /// Traversal and resolution errors of the last finished walk.
    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("rule errors lock poisoned").clone()
    }

    /// Every preview this rule owns, removed ones included. Empty until applied.
    pub fn sips(&self) -> Vec<SharedSip> {
        self.sips.read().expect("rule sips lock poisoned").clone()
    }

    /// Previews not flagged removed.
    pub fn live_sips(&self) -> Vec<SharedSip> {
        self.sips()
            .into_iter()
            .filter(|s| !s.read().expect("sip lock poisoned").removed)
            .collect()
    }

    /// Cursor over live previews in discovery order.
    pub fn cursor(&self) -> PreviewCursor {
        PreviewCursor::new(self.live_sips())
    }

    pub fn find_sip(&self, sip_id: &str) -> Option<SharedSip> {
        self.sips()
            .into_iter()
            .find(|s| s.read().expect("sip lock poisoned").id == sip_id)
    }

    pub fn subscribe<F>(&self, callback: F) -> SubscriptionId
    where
        F: Fn(&RuleEvent) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(callback)
    }

    pub fn subscribe_channel(&self) -> mpsc::UnboundedReceiver<RuleEvent> {
        self.subscribers.subscribe_channel()
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.subscribers.unsubscribe(id)
    }

    /// Start the walk on a worker thread and return.
    ///
    /// Selection errors are returned here and leave the rule pending.
    pub fn apply(self: &Arc<Self>, ctx: ApplyContext) -> Result<()> {
        let _gate = self.gate();
        let current = self.state();
        if current != RuleState::Pending {
            return Err(self.invalid(current, RuleState::Applying));
        }

        let walker = TreeWalker::new(
            self.definition.walker,
            self.definition.roots.clone(),
            ctx.filters.clone(),
        )?
        .with_progress_interval(ctx.progress_interval);

        let token = walker.token();
        let walk_id = ctx.registry.register(&self.id, token.clone());
        *self.active.lock().expect("rule walk lock poisoned") = Some(ActiveWalk {
            walk_id: walk_id.clone(),
            token,
            registry: Arc::clone(&ctx.registry),
        });
        self.set_state(RuleState::Applying)?;
        info!(rule_id = %self.id, walker = %self.definition.walker, "Applying rule");
        self.emit(RuleEventKind::Started);

        let rule = Arc::clone(self);
        let registry = Arc::clone(&ctx.registry);
        let spawned = thread::Builder::new()
            .name(format!("rule-{}", &self.id))
            .spawn(move || rule.run(walker, ctx, walk_id));

        match spawned {
            Ok(handle) => {
                *self.worker.lock().expect("rule worker lock poisoned") = Some(handle);
                Ok(())
            }
            Err(e) => {
                if let Some(active) = self.active.lock().expect("rule walk lock poisoned").take() {
                    registry.deregister(&active.walk_id);
                }
                self.set_state(RuleState::Failed)?;
                self.emit(RuleEventKind::Error {
                    message: e.to_string(),
                });
                Err(SipError::Io {
                    message: format!("Failed to spawn walker thread: {}", e),
                    path: None,
                    source: Some(e),
                })
            }
        }
    }

    /// Request cancellation of an in-flight walk. `false` if nothing is running.
    pub fn cancel(&self) -> bool {
        match self.active.lock().expect("rule walk lock poisoned").as_ref() {
            Some(active) => {
                active.token.cancel();
                debug!(rule_id = %self.id, walk_id = %active.walk_id, "Cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Block until the worker thread (if any) has finished, then return the state.
    pub fn wait(&self) -> RuleState {
        let handle = self.worker.lock().expect("rule worker lock poisoned").take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Called from our own worker: joining would never return.
                *self.worker.lock().expect("rule worker lock poisoned") = Some(handle);
            } else if handle.join().is_err() {
                warn!(rule_id = %self.id, "Rule worker ended with a panic");
            }
        }
        self.state()
    }

    /// Remove the rule: cancel its walk, flag its previews removed and delete
    /// the metadata files it staged. Returns the ids of newly removed previews.
    pub fn remove(&self) -> Result<Vec<String>> {
        {
            let _gate = self.gate();
            self.set_state(RuleState::Removing)?;
            self.emit(RuleEventKind::Removing);
            if let Some(active) = self.active.lock().expect("rule walk lock poisoned").as_ref() {
                active.token.cancel();
                active.registry.deregister(&active.walk_id);
            }
        }

        // The worker needs the gate to finish, so wait outside of it.
        self.wait();

        let _gate = self.gate();
        let removed = self.flag_removed(|_| true);
        if !removed.is_empty() {
            self.emit(RuleEventKind::SipsRemoved {
                sip_ids: removed.clone(),
            });
        }
        self.delete_staged();
        self.set_state(RuleState::Removed)?;
        info!(rule_id = %self.id, sips = removed.len(), "Rule removed");
        self.emit(RuleEventKind::Removed);
        Ok(removed)
    }

    /// Flag one preview removed.
    pub fn remove_sip(&self, sip_id: &str) -> Result<()> {
        let _gate = self.gate();
        if self.find_sip(sip_id).is_none() {
            return Err(SipError::SipNotFound(sip_id.to_string()));
        }
        let removed = self.flag_removed(|id| id == sip_id);
        if !removed.is_empty() {
            self.emit(RuleEventKind::SipsRemoved { sip_ids: removed });
        }
        Ok(())
    }

    fn flag_removed(&self, select: impl Fn(&str) -> bool) -> Vec<String> {
        let sips = self.sips.read().expect("rule sips lock poisoned");
        let mut removed = Vec::new();
        for sip in sips.iter() {
            let mut sip = sip.write().expect("sip lock poisoned");
            if !sip.removed && select(&sip.id) {
                sip.removed = true;
                removed.push(sip.id.clone());
            }
        }
        removed
    }

    fn delete_staged(&self) {
        let staged = self.staged_dir.lock().expect("rule staging lock poisoned").take();
        if let Some(dir) = staged {
            match fs::remove_dir_all(&dir) {
                Ok(()) => debug!(rule_id = %self.id, "Deleted staged metadata {}", dir.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!(rule_id = %self.id, "Failed to delete {}: {}", dir.display(), e),
            }
        }
    }

    /// Serializable copy for the recovery file.
    pub fn snapshot(&self) -> (RuleState, Vec<SipPreview>) {
        let sips = self
            .sips()
            .iter()
            .map(|s| s.read().expect("sip lock poisoned").clone())
            .collect();
        (self.state(), sips)
    }

    fn run(self: Arc<Self>, walker: TreeWalker, ctx: ApplyContext, walk_id: String) {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.produce(&walker, &ctx)));

        ctx.registry.deregister(&walk_id);
        *self.active.lock().expect("rule walk lock poisoned") = None;

        match outcome {
            Ok(Some(produced)) => self.finish_applied(produced),
            Ok(None) => self.finish_cancelled(),
            Err(payload) => self.finish_failed(SipError::from_panic(payload.as_ref())),
        }
    }

    /// Walk, then resolve metadata for each preview. `None` when cancelled.
    fn produce(&self, walker: &TreeWalker, ctx: &ApplyContext) -> Option<Produced> {
        let report = match walker.walk(|progress| self.emit_progress(progress)) {
            WalkOutcome::Finished(report) => report,
            WalkOutcome::Cancelled => return None,
        };

        let mut resolver = MetadataResolver::new(
            &self.definition.metadata,
            &ctx.templates,
            walker.roots(),
        );
        if matches!(self.definition.metadata, MetadataOption::Template { .. }) {
            let dir = ctx.staging_dir.join(&self.id);
            *self.staged_dir.lock().expect("rule staging lock poisoned") = Some(dir.clone());
            resolver = resolver.with_staging_dir(dir);
        }

        let token = walker.token();
        let mut errors: Vec<String> = report.failures.iter().map(ToString::to_string).collect();
        let mut sips = report.previews;
        for sip in &mut sips {
            if token.is_cancelled() {
                return None;
            }
            sip.rule_id = Some(self.id.clone());
            sip.parent_id = Some(self.definition.destination.clone());
            resolver.attach(sip);
            errors.extend(sip.issues.iter().map(|issue| format!("{}: {}", sip.id, issue)));
        }
        if token.is_cancelled() {
            return None;
        }
        Some(Produced { sips, errors })
    }

    fn finish_applied(&self, produced: Produced) {
        let _gate = self.gate();
        if self.state() != RuleState::Applying {
            debug!(rule_id = %self.id, "Discarding walk result of a rule being removed");
            return;
        }
        let sip_count = produced.sips.len();
        *self.sips.write().expect("rule sips lock poisoned") =
            produced.sips.into_iter().map(SipPreview::into_shared).collect();
        *self.errors.lock().expect("rule errors lock poisoned") = produced.errors.clone();
        if self.set_state(RuleState::Applied).is_ok() {
            info!(rule_id = %self.id, sip_count, errors = produced.errors.len(), "Rule applied");
            self.emit(RuleEventKind::Applied {
                sip_count,
                errors: produced.errors,
            });
        }
    }

    fn finish_cancelled(&self) {
        let _gate = self.gate();
        self.delete_staged();
        if self.state() != RuleState::Applying {
            return;
        }
        if self.set_state(RuleState::Cancelled).is_ok() {
            info!(rule_id = %self.id, "Rule walk cancelled");
            self.emit(RuleEventKind::Cancelled);
        }
    }

    fn finish_failed(&self, err: SipError) {
        let _gate = self.gate();
        error!(rule_id = %self.id, "Rule worker failed: {}", err);
        let message = err.to_string();
        self.errors
            .lock()
            .expect("rule errors lock poisoned")
            .push(message.clone());
        if self.state() != RuleState::Applying {
            return;
        }
        if self.set_state(RuleState::Failed).is_ok() {
            self.emit(RuleEventKind::Error { message });
        }
    }

    fn emit_progress(&self, progress: &WalkProgress) {
        let _gate = self.gate();
        if self.state() == RuleState::Applying {
            self.emit(RuleEventKind::Progress(progress.clone()));
        }
    }

    fn emit(&self, kind: RuleEventKind) {
        self.subscribers.emit(&RuleEvent {
            rule_id: self.id.clone(),
            kind,
        });
    }

    /// A panicking subscriber poisons the gate; the rule keeps working regardless.
    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, next: RuleState) -> Result<()> {
        let mut state = self.state.lock().expect("rule state lock poisoned");
        if !state.can_transition_to(next) {
            return Err(self.invalid(*state, next));
        }
        debug!(rule_id = %self.id, from = %*state, to = %next, "Rule transition");
        *state = next;
        Ok(())
    }

    fn invalid(&self, from: RuleState, to: RuleState) -> SipError {
        SipError::InvalidTransition {
            rule_id: self.id.clone(),
            from: from.to_string(),
            to: to.to_string(),
        }
    }
}
