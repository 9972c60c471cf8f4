//! One preview per included file.

use super::{title_of, WalkContext};
use crate::cancel::CancelledError;
use crate::sip::{Representation, SipPreview};
use crate::tree::TreeNode;
use std::path::PathBuf;
use walkdir::WalkDir;

pub(super) fn walk(
    ctx: &mut WalkContext<'_>,
    roots: &[PathBuf],
) -> Result<Vec<SipPreview>, CancelledError> {
    let filters = ctx.filters;
    let mut previews = Vec::new();

    for root in roots {
        if filters.excludes(root) {
            continue;
        }
        let entries = WalkDir::new(root)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !filters.excludes(e.path()));

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    ctx.token.check()?;
                    let path = e.path().map(PathBuf::from).unwrap_or_else(|| root.clone());
                    ctx.fail(&path, e);
                    continue;
                }
            };

            if entry.file_type().is_dir() {
                ctx.visit(false)?;
                continue;
            }
            ctx.visit(true)?;

            let path = entry.into_path();
            let rep = Representation::with_files("rep1", vec![TreeNode::file(&path)]);
            previews.push(SipPreview::with_representation(
                title_of(&path),
                Some(path),
                rep,
            ));
            ctx.preview_added();
        }
    }

    Ok(previews)
}
