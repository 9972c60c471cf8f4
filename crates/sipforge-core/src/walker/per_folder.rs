//! One preview per directory at a fixed depth.
//!
//! Files lying above the target depth (not inside any depth-`d` directory)
//! each become their own preview, so every included file lands in exactly one.

use super::{title_of, WalkContext};
use crate::cancel::CancelledError;
use crate::sip::{Representation, SipPreview};
use crate::tree::TreeNode;
use std::path::{Path, PathBuf};

pub(super) fn walk(
    ctx: &mut WalkContext<'_>,
    roots: &[PathBuf],
    depth: usize,
) -> Result<Vec<SipPreview>, CancelledError> {
    let mut previews = Vec::new();
    for root in roots {
        if ctx.excluded(root) {
            continue;
        }
        descend(ctx, root, 0, depth, &mut previews)?;
    }
    Ok(previews)
}

fn descend(
    ctx: &mut WalkContext<'_>,
    dir: &Path,
    level: usize,
    target: usize,
    out: &mut Vec<SipPreview>,
) -> Result<(), CancelledError> {
    if level == target {
        if let Some(node) = ctx.capture(dir)? {
            push_preview(ctx, out, dir, node);
        }
        return Ok(());
    }

    if !dir.exists() {
        ctx.fail(dir, "directory no longer exists");
        return Ok(());
    }
    ctx.visit(false)?;

    for (child, is_dir) in ctx.list(dir) {
        if is_dir {
            descend(ctx, &child, level + 1, target, out)?;
        } else {
            ctx.visit(true)?;
            let node = TreeNode::file(&child);
            push_preview(ctx, out, &child, node);
        }
    }
    Ok(())
}

fn push_preview(ctx: &mut WalkContext<'_>, out: &mut Vec<SipPreview>, path: &Path, node: TreeNode) {
    let rep = Representation::with_files("rep1", vec![node]);
    out.push(SipPreview::with_representation(
        title_of(path),
        Some(path.to_path_buf()),
        rep,
    ));
    ctx.preview_added();
}
