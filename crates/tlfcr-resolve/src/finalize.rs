//! Building the resolved revision.
//!
//! The rewritten merged directories are written back up to a new root,
//! the surviving unmerged ops are reverted into a form that replays on
//! the merged branch, and a trailing resolution op collects the pointer
//! bookkeeping. The same ops with local pointers become the notification
//! list handed to local observers.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use tlfcr_core::types::{Block, DirBlock, DirEntry, EntryType};
use tlfcr_core::{BlockPointer, BranchId, CrError, CrResult, WriterInfo};
use tlfcr_storage::{BlockPutState, BlockStore};

use crate::chains::Chains;
use crate::execute::Executed;
use crate::folder::{RequestContext, RevisionMetadata};
use crate::merge_paths::MergedPaths;
use crate::ops::{BlockUpdate, Op, OpKind};
use crate::path::{find_paths, sort_paths, NodePath, PathNode};

/// A resolution ready to commit.
#[derive(Debug)]
pub struct Resolved {
    pub md: RevisionMetadata,
    pub local_ops: Vec<Op>,
    /// Blocks to write before committing `md`.
    pub put_state: BlockPutState,
}

// ── Dirty tree ───────────────────────────────────────────────────────────────

/// Write every rewritten merged directory, and each of its ancestors, into
/// `put_state`, deepest first. Returns the new root and the `old -> new`
/// pointer of every directory written.
pub async fn sync_tree(
    store: &BlockStore,
    merged: &Chains,
    merged_paths: &MergedPaths,
    mut dirs: HashMap<BlockPointer, DirBlock>,
    put_state: &mut BlockPutState,
) -> CrResult<(BlockPointer, Vec<BlockUpdate>)> {
    let root = merged.head_root;
    if dirs.is_empty() {
        return Ok((root, Vec::new()));
    }

    let mut parent_of: HashMap<BlockPointer, (BlockPointer, String)> = HashMap::new();
    for path in merged_paths.values() {
        for pair in path.nodes.windows(2) {
            parent_of
                .entry(pair[1].ptr)
                .or_insert_with(|| (pair[0].ptr, pair[1].name.clone()));
        }
    }

    let mut depth: HashMap<BlockPointer, usize> = HashMap::new();
    for ptr in dirs.keys() {
        let mut chain = vec![*ptr];
        let mut current = *ptr;
        while let Some((parent, _)) = parent_of.get(&current) {
            if chain.contains(parent) {
                return Err(CrError::inconsistent(format!("merged paths loop at {parent}")));
            }
            chain.push(*parent);
            current = *parent;
        }
        if current != root {
            return Err(CrError::inconsistent(format!(
                "rewritten directory {ptr} has no merged path to the root"
            )));
        }
        let n = chain.len();
        for (i, p) in chain.into_iter().enumerate() {
            depth.insert(p, n - 1 - i);
        }
    }

    let mut order: Vec<BlockPointer> = depth.keys().copied().collect();
    order.sort_by_key(|p| (std::cmp::Reverse(depth[p]), *p));

    let mut children: HashMap<BlockPointer, Vec<(BlockPointer, String)>> = HashMap::new();
    for ptr in &order {
        if let Some((parent, name)) = parent_of.get(ptr) {
            children.entry(*parent).or_default().push((*ptr, name.clone()));
        }
    }

    let mut rewritten: HashMap<BlockPointer, BlockPointer> = HashMap::new();
    let mut updates = Vec::new();
    for ptr in order {
        let mut block = match dirs.remove(&ptr) {
            Some(block) => block,
            None => crate::execute::load_merged_dir(store, merged, ptr).await?,
        };
        for (child, name) in children.get(&ptr).into_iter().flatten() {
            let Some(new_child) = rewritten.get(child) else {
                continue;
            };
            // The entry follows the node if an action renamed it.
            let name = block
                .find_by_ptr(*child)
                .map(|(n, _)| n.to_string())
                .unwrap_or_else(|| name.clone());
            let mut entry = block
                .get(&name)
                .cloned()
                .unwrap_or_else(|| DirEntry::new(*new_child, EntryType::Dir));
            entry.ptr = *new_child;
            entry.entry_type = EntryType::Dir;
            let _ = block.set_entry(&name, entry);
        }
        let new_ptr = put_state.add(&Block::Dir(block))?;
        rewritten.insert(ptr, new_ptr);
        updates.push(BlockUpdate::new(ptr, new_ptr));
    }

    let new_root = rewritten
        .get(&root)
        .copied()
        .ok_or_else(|| CrError::inconsistent("root was not rewritten"))?;
    Ok((new_root, updates))
}

// ── Reverted ops ─────────────────────────────────────────────────────────────

/// An op for the resolved revision paired with its local counterpart.
#[derive(Debug, Clone)]
pub struct RevertedOp {
    pub md: Op,
    pub local: Op,
}

/// Turn the unmerged chains on `sorted_paths` (deepest first) into ops for
/// the merged branch, starting nearest the root. Rename halves are joined
/// back into renames; every other op has its unrefs reverted to originals.
pub fn make_reverted_ops(
    unmerged: &Chains,
    merged: &Chains,
    sorted_paths: &[NodePath],
) -> CrResult<Vec<RevertedOp>> {
    let renames: HashMap<(BlockPointer, &str), BlockPointer> = unmerged
        .renamed_originals
        .iter()
        .map(|(original, ri)| ((ri.original_new_parent, ri.new_name.as_str()), *original))
        .collect();

    let mut ops: Vec<RevertedOp> = Vec::new();
    for path in sorted_paths.iter().rev() {
        let ptr = path.tail_ptr();
        let Some(chain) = unmerged.chain_by_most_recent(ptr) else {
            debug!(%ptr, "no unmerged chain left for path");
            continue;
        };

        'ops: for op in &chain.ops {
            match &op.kind {
                // The rm half of a rename.
                OpKind::Rm { .. } if op.unrefs.is_empty() => continue,
                OpKind::Resolution | OpKind::Gc { .. } => continue,
                OpKind::Create {
                    new_name,
                    renamed: true,
                    entry_type,
                    cr_sym_path,
                    ..
                } => {
                    let Some(&renamed_original) = renames.get(&(chain.original, new_name.as_str()))
                    else {
                        if cr_sym_path.is_none() && *entry_type != EntryType::Sym {
                            debug!(name = %new_name, "renamed create has no rename info, keeping as create");
                            ops.push(RevertedOp {
                                md: unmerged.copy_op_and_revert_unrefs_to_originals(op),
                                local: op.clone(),
                            });
                        }
                        continue;
                    };
                    if merged.is_deleted(renamed_original) || unmerged.is_created(renamed_original) {
                        ops.push(RevertedOp {
                            md: unmerged.copy_op_and_revert_unrefs_to_originals(op),
                            local: op.clone(),
                        });
                        continue;
                    }
                    let ri = unmerged.renamed_originals.get(&renamed_original).ok_or_else(|| {
                        CrError::inconsistent(format!("no rename info for {renamed_original}"))
                    })?;

                    let mut rename = Op::rename(
                        ri.old_name.clone(),
                        ri.original_old_parent,
                        ri.new_name.clone(),
                        ri.original_new_parent,
                        renamed_original,
                        *entry_type,
                    )
                    .with_writer(op.writer.clone());
                    for update in rename.all_updates_mut() {
                        update.ref_ = update.unref;
                    }
                    for ptr in &op.unrefs {
                        rename.add_unref(unmerged.original_from_most_recent_or_same(*ptr));
                    }
                    rename.final_path = op.final_path.clone();

                    let mut local = Op::rename(
                        ri.old_name.clone(),
                        unmerged.most_recent_from_original_or_same(ri.original_old_parent),
                        ri.new_name.clone(),
                        unmerged.most_recent_from_original_or_same(ri.original_new_parent),
                        unmerged.most_recent_from_original_or_same(renamed_original),
                        *entry_type,
                    )
                    .with_writer(op.writer.clone());
                    local.unrefs = op.unrefs.clone();
                    local.final_path = op.final_path.clone();

                    // A rename out of a directory replaces an earlier rm
                    // of the same entry.
                    if let OpKind::Rename {
                        old_name, old_dir, ..
                    } = &rename.kind
                    {
                        for prev in ops.iter_mut() {
                            if let OpKind::Rm {
                                old_name: rm_name,
                                dir,
                                ..
                            } = &prev.md.kind
                            {
                                if dir.unref == old_dir.unref && rm_name == old_name {
                                    *prev = RevertedOp {
                                        md: rename.clone(),
                                        local: local.clone(),
                                    };
                                    continue 'ops;
                                }
                            }
                        }
                    }
                    ops.push(RevertedOp { md: rename, local });
                }
                _ => {
                    let mut md = unmerged.copy_op_and_revert_unrefs_to_originals(op);
                    // A setAttr on a node the merged branch moved belongs
                    // to the node's new parent.
                    if let OpKind::SetAttr { dir, file, .. } = &mut md.kind {
                        if let Some((new_dir, _)) = merged.renamed_parent_and_name(*file) {
                            dir.unref = new_dir;
                        }
                    }
                    ops.push(RevertedOp {
                        md,
                        local: op.clone(),
                    });
                }
            }
        }
    }
    Ok(ops)
}

// ── Pointer rebasing ─────────────────────────────────────────────────────────

/// Rewrites the pointers of reverted ops onto the merged branch: each
/// update starts at the node's current merged pointer and ends at the
/// pointer the resolved tree holds for it.
struct Rebaser<'a> {
    unmerged: &'a Chains,
    merged: &'a Chains,
    rewritten: HashMap<BlockPointer, BlockPointer>,
    rewrite_targets: HashSet<BlockPointer>,
    current: HashMap<BlockPointer, BlockPointer>,
    covered: HashSet<BlockPointer>,
}

impl<'a> Rebaser<'a> {
    fn new(unmerged: &'a Chains, merged: &'a Chains, rewrites: &[BlockUpdate]) -> Self {
        Rebaser {
            unmerged,
            merged,
            rewritten: rewrites.iter().map(|u| (u.unref, u.ref_)).collect(),
            rewrite_targets: rewrites.iter().map(|u| u.ref_).collect(),
            current: HashMap::new(),
            covered: HashSet::new(),
        }
    }

    fn current(&self, ptr: BlockPointer) -> BlockPointer {
        let original = self.unmerged.revert_to_original(ptr);
        match self.current.get(&original) {
            Some(p) => *p,
            None => self.merged.most_recent_from_original_or_same(original),
        }
    }

    fn rebase_update(&mut self, update: &mut BlockUpdate) {
        if !update.unref.is_initialized() {
            return;
        }
        let original = self.unmerged.revert_to_original(update.unref);
        let start = self.current(update.unref);
        let target = if let Some(new) = self.rewritten.get(&start) {
            self.covered.insert(start);
            *new
        } else if self.rewrite_targets.contains(&start) || !update.ref_.is_initialized() {
            start
        } else {
            update.ref_
        };
        update.unref = start;
        update.ref_ = target;
        self.current.insert(original, target);
    }

    fn rebase(&mut self, op: &mut Op) {
        let unrefs: Vec<BlockPointer> = op.unrefs.iter().map(|p| self.current(*p)).collect();
        op.unrefs = unrefs;
        match &mut op.kind {
            OpKind::Rename { renamed, .. } => *renamed = self.current(*renamed),
            OpKind::SetAttr { file, .. } => *file = self.current(*file),
            _ => {}
        }
        for update in op.all_updates_mut() {
            self.rebase_update(update);
        }
    }

    /// Directory rewrites no op accounted for.
    fn leftover_updates(&self, rewrites: &[BlockUpdate]) -> Vec<BlockUpdate> {
        rewrites
            .iter()
            .filter(|u| !self.covered.contains(&u.unref))
            .copied()
            .collect()
    }
}

/// Point a merged path at the rewritten directories.
fn resolved_path(path: &NodePath, rewrites: &HashMap<BlockPointer, BlockPointer>) -> NodePath {
    NodePath::new(
        BranchId::Master,
        path.nodes
            .iter()
            .map(|n| PathNode::new(rewrites.get(&n.ptr).copied().unwrap_or(n.ptr), n.name.clone()))
            .collect(),
    )
}

// ── Finalize ─────────────────────────────────────────────────────────────────

/// Build the resolved revision on top of `base`, the newest merged
/// revision, from the executed actions. `put_state` already holds the
/// file copies made while executing.
#[allow(clippy::too_many_arguments)]
pub async fn finalize(
    ctx: &RequestContext,
    store: &BlockStore,
    base: &RevisionMetadata,
    unmerged: &Chains,
    merged: &Chains,
    unmerged_paths: &[NodePath],
    merged_paths: &MergedPaths,
    executed: Executed,
    mut put_state: BlockPutState,
) -> CrResult<Resolved> {
    ctx.check_canceled()?;
    let (root, rewrites) =
        sync_tree(store, merged, merged_paths, executed.dirs, &mut put_state).await?;
    let rewrite_map: HashMap<BlockPointer, BlockPointer> =
        rewrites.iter().map(|u| (u.unref, u.ref_)).collect();

    // Paths to revert, deepest first; directories created in the unmerged
    // branch go last so their parents' creates come before their own.
    let mut seen = HashSet::new();
    let mut sorted: Vec<NodePath> = unmerged_paths
        .iter()
        .filter(|p| seen.insert(p.tail_ptr()))
        .cloned()
        .collect();
    sort_paths(&mut sorted);
    let mut created_dirs = Vec::new();
    for chain in unmerged.iter() {
        if seen.contains(&chain.most_recent)
            || !unmerged.is_created(chain.original)
            || merged.is_created(chain.original)
            || !chain.ops.iter().any(|op| matches!(op.kind, OpKind::Create { .. }))
        {
            continue;
        }
        seen.insert(chain.most_recent);
        created_dirs.push(NodePath::new(
            unmerged.branch.clone(),
            vec![PathNode::new(chain.most_recent, "")],
        ));
    }
    let created_targets: HashSet<BlockPointer> =
        created_dirs.iter().map(NodePath::tail_ptr).collect();
    let created_paths = find_paths(store, &unmerged.branch, unmerged.head_root, &created_targets).await?;
    created_dirs.extend(sorted);
    let sorted = created_dirs;

    let reverted = make_reverted_ops(unmerged, merged, &sorted)?;

    let mut rebaser = Rebaser::new(unmerged, merged, &rewrites);
    let mut md_ops = Vec::with_capacity(reverted.len() + 1);
    let mut local_ops = Vec::with_capacity(reverted.len() + 1);
    for RevertedOp { mut md, mut local } in reverted {
        let local_path = local.final_path.clone().filter(NodePath::is_valid);
        let chain_ptr = local_path
            .as_ref()
            .map(NodePath::tail_ptr)
            .unwrap_or(BlockPointer::ZERO);
        let final_path = match merged_paths.get(&chain_ptr) {
            Some(path) => {
                let mut path = resolved_path(path, &rewrite_map);
                // File chains map to their parent once actions are
                // collapsed; the op itself is about the file.
                if let (Some(chain), Some(lp)) = (unmerged.chain_by_most_recent(chain_ptr), &local_path) {
                    let merged_ptr = merged.most_recent_from_original_or_same(chain.original);
                    if chain.is_file() && path.tail_ptr() != merged_ptr {
                        path = path.child_path(lp.tail_name(), chain_ptr);
                    }
                }
                path
            }
            None => created_paths
                .get(&chain_ptr)
                .cloned()
                .or(local_path)
                .unwrap_or_else(|| NodePath::new(BranchId::Master, vec![PathNode::new(root, "")])),
        };
        rebaser.rebase(&mut md);
        md.final_path = Some(final_path.clone());
        local.final_path = Some(final_path);
        md_ops.push(md);
        local_ops.push(local);
    }

    // Merged-side changes the local view hasn't seen.
    for chain in merged.iter() {
        for op in &chain.ops {
            if matches!(op.kind, OpKind::Resolution | OpKind::Gc { .. }) {
                continue;
            }
            let mut op = op.clone();
            chain.ensure_path(&mut op, chain.most_recent);
            local_ops.push(op);
        }
    }

    let mut resolution = Op::resolution().with_writer(WriterInfo::new(
        unmerged.head_writer.writer.clone(),
        base.revision.next(),
    ));
    resolution.refs = put_state.ptrs();
    let mut unrefs: Vec<BlockPointer> = executed
        .unrefs
        .into_iter()
        .chain(unmerged.to_unref.iter().copied())
        .filter(|p| p.is_initialized() && !unmerged.do_not_unref.contains(p))
        .collect();
    unrefs.sort();
    unrefs.dedup();
    resolution.unrefs = unrefs;
    resolution.updates = rebaser.leftover_updates(&rewrites);
    resolution.final_path = Some(NodePath::new(
        BranchId::Master,
        vec![PathNode::new(root, "")],
    ));
    md_ops.push(resolution.clone());
    local_ops.push(resolution);

    debug!(
        ops = md_ops.len(),
        local_ops = local_ops.len(),
        blocks = put_state.len(),
        %root,
        "built resolved revision"
    );
    Ok(Resolved {
        md: RevisionMetadata {
            revision: base.revision.next(),
            branch: BranchId::Master,
            root,
            writer: unmerged.head_writer.writer.clone(),
            ops: md_ops,
        },
        local_ops,
        put_state,
    })
}

/// Commit the unmerged branch as-is: nothing happened on the merged
/// branch since `branch_point`.
pub fn fast_forward(
    branch_point: &RevisionMetadata,
    revisions: &[RevisionMetadata],
) -> CrResult<Resolved> {
    let head = revisions
        .last()
        .ok_or_else(|| CrError::inconsistent("fast-forward with no unmerged revisions"))?;
    let revision = branch_point.revision.next();
    let mut ops: Vec<Op> = revisions
        .iter()
        .flat_map(|md| {
            let writer = md.writer_info();
            md.ops
                .iter()
                .filter(|op| !matches!(op.kind, OpKind::Resolution | OpKind::Gc { .. }))
                .map(move |op| op.clone().with_writer(writer.clone()))
        })
        .collect();
    let resolution = Op::resolution().with_writer(WriterInfo::new(head.writer.clone(), revision));
    ops.push(resolution.clone());
    Ok(Resolved {
        md: RevisionMetadata {
            revision,
            branch: BranchId::Master,
            root: head.root,
            writer: head.writer.clone(),
            ops,
        },
        local_ops: vec![resolution],
        put_state: BlockPutState::new(),
    })
}
