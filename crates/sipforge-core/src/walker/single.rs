//! One preview for the whole selection.

use super::{title_of, WalkContext};
use crate::cancel::CancelledError;
use crate::metadata::common_ancestor;
use crate::sip::{Representation, SipPreview};
use std::path::PathBuf;

pub(super) fn walk(
    ctx: &mut WalkContext<'_>,
    roots: &[PathBuf],
) -> Result<Vec<SipPreview>, CancelledError> {
    let source = match roots {
        [only] => Some(only.clone()),
        _ => common_ancestor(roots),
    };
    let title = source
        .as_deref()
        .map(title_of)
        .unwrap_or_else(|| "SIP".to_string());
    let mut sip = SipPreview::new(title, source);

    for root in roots {
        if ctx.excluded(root) {
            continue;
        }
        if let Some(node) = ctx.capture(root)? {
            let name = format!("rep{}", sip.representations.len() + 1);
            sip.representations
                .push(Representation::with_files(name, vec![node]));
        }
    }

    if sip.representations.is_empty() {
        return Ok(Vec::new());
    }
    ctx.preview_added();
    Ok(vec![sip])
}
