//! SIP Forge Core - Headless engine for classifying filesystem selections into
//! archival packages (SIPs) and building them.
//!
//! Rules bind a selection of paths, a walker variant and a metadata option to a
//! classification node. Applying a rule walks the selection on a worker thread
//! and produces SIP previews; exporting turns the live previews into E-ARK
//! archives or BagIt bags.
//!
//! # Example
//!
//! ```rust,no_run
//! use sipforge_core::{MetadataOption, RuleDefinition, SchemeNode, SipWorkspace, WalkerKind};
//!
//! fn main() -> sipforge_core::Result<()> {
//!     let workspace = SipWorkspace::builder("/tmp/sipforge").build()?;
//!     let fonds = workspace.add_node(SchemeNode::new("Fonds", None))?;
//!
//!     let rule = workspace.create_rule(RuleDefinition {
//!         roots: vec!["/data/minutes".into()],
//!         walker: WalkerKind::PerFolder { depth: 1 },
//!         metadata: MetadataOption::default(),
//!         destination: fonds,
//!     })?;
//!     workspace.apply_rule(rule.id())?;
//!     rule.wait();
//!
//!     let report = workspace.export(None, "/tmp/out")?.wait()?;
//!     println!("Created {} packages", report.created);
//!
//!     workspace.shutdown()?;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod metadata;
pub mod package;
pub mod persist;
pub mod recovery;
pub mod registry;
pub mod rule;
pub mod scheme;
pub mod sip;
pub mod tree;
pub mod walker;

mod workspace;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::ForgeSettings;
pub use error::{Result, SipError};
pub use events::{
    ExportEvent, ExportEventKind, FailedSip, RuleEvent, RuleEventKind, SubscriptionId,
};
pub use filter::{ContentFilter, FilterSet, IgnoreRules, PathFilter};
pub use metadata::{DescObjMetadata, MetadataOption, MetadataSource, TemplateStore};
pub use package::{ExportHandle, ExportReport, PackageBuilder, PackageFormat};
pub use recovery::{RecoveryFile, RecoverySummary};
pub use registry::WalkerRegistry;
pub use rule::{Rule, RuleDefinition, RuleState};
pub use scheme::{ClassificationScheme, SchemeNode};
pub use sip::{PreviewCursor, Representation, SharedSip, SipPreview};
pub use tree::TreeNode;
pub use walker::{TreeWalker, WalkOutcome, WalkProgress, WalkerKind};
pub use workspace::{SipWorkspace, SipWorkspaceBuilder};
