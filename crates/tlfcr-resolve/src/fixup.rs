//! Structural fixes applied to the chains before actions are computed:
//! recreating merged-deleted ancestors, breaking rename conflicts, and
//! keeping nodes that the unmerged branch removed but the merged branch
//! changed.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::{debug, info};

use tlfcr_core::types::EntryType;
use tlfcr_core::{BlockPointer, CrError, CrResult, WriterInfo};
use tlfcr_storage::BlockStore;

use crate::chains::{Chain, Chains, RenameInfo};
use crate::merge_paths::MergedPaths;
use crate::ops::{Op, OpKind};
use crate::path::{find_paths, NodePath, PathNode};

// ── Recreates ────────────────────────────────────────────────────────────────

/// Put the recreate ops from path resolution at the front of their
/// unmerged parent chains, and give each such chain a merged path.
/// Returns paths of parents that had no unmerged ops before.
pub fn add_recreate_ops_to_unmerged_chains(
    recreate_ops: Vec<Op>,
    unmerged: &mut Chains,
    merged: &Chains,
    merged_paths: &mut MergedPaths,
) -> CrResult<Vec<NodePath>> {
    if recreate_ops.is_empty() {
        return Ok(Vec::new());
    }

    // Any node on a known merged path -> the key of that path.
    let mut keys: HashMap<BlockPointer, BlockPointer> = HashMap::new();
    for (ptr, path) in merged_paths.iter() {
        for node in &path.nodes {
            keys.insert(node.ptr, *ptr);
        }
    }

    let mut new_paths = Vec::new();
    for op in recreate_ops {
        let OpKind::Create { dir, .. } = &op.kind else {
            continue;
        };
        let target = merged.original_from_most_recent_or_same(dir.unref);
        let final_path = op.final_path.clone();
        let chain = unmerged.chain_mut(target).ok_or_else(|| {
            CrError::inconsistent(format!("recreate op for {target} has no chain"))
        })?;
        if chain.ops.is_empty() {
            new_paths.extend(final_path);
        }
        chain.ops.insert(0, op);
        let (chain_most_recent, chain_original) = (chain.most_recent, chain.original);

        if merged_paths.contains_key(&chain_most_recent) {
            continue;
        }
        let mut merged_most_recent = chain_original;
        if !merged.is_deleted(chain_original) {
            if let Some(merged_chain) = merged.chain(chain_original) {
                merged_most_recent = merged_chain.most_recent;
            }
        }
        let key = keys.get(&merged_most_recent).ok_or_else(|| {
            CrError::inconsistent(format!(
                "no merged path contains recreate target {merged_most_recent}"
            ))
        })?;
        let mut path = merged_paths[key].clone();
        while path.tail_ptr() != merged_most_recent && path.len() > 1 {
            path = path.parent_path();
        }
        merged_paths.insert(chain_most_recent, path);
    }
    Ok(new_paths)
}

/// For every node the unmerged branch removed but the merged branch
/// changed, drop the unmerged rm and record a create of the merged node
/// in its merged parent, so the node survives the resolution.
pub fn add_merged_recreates(
    unmerged: &mut Chains,
    merged: &mut Chains,
    merged_writer: &WriterInfo,
) -> CrResult<()> {
    for chain_original in unmerged.originals() {
        let rms: Vec<(usize, String)> = match unmerged.chain(chain_original) {
            Some(chain) => chain
                .ops
                .iter()
                .enumerate()
                .filter_map(|(i, op)| match &op.kind {
                    OpKind::Rm { old_name, .. } => Some((i, old_name.clone())),
                    _ => None,
                })
                .collect(),
            None => continue,
        };

        for (i, old_name) in rms {
            // An rm that undid a rename in the same batch carries no
            // unrefs; the renamed node is the one being removed.
            let needs_unref = unmerged
                .chain(chain_original)
                .and_then(|c| c.ops.get(i))
                .is_some_and(|op| op.unrefs.is_empty());
            let renamed_away = if needs_unref {
                unmerged
                    .renamed_originals
                    .iter()
                    .find(|(original, info)| {
                        info.original_old_parent == chain_original
                            && info.old_name == old_name
                            && unmerged.is_deleted(**original)
                    })
                    .map(|(original, _)| *original)
            } else {
                None
            };
            let Some(op) = unmerged
                .chain_mut(chain_original)
                .and_then(|c| c.ops.get_mut(i))
            else {
                continue;
            };
            op.unrefs.extend(renamed_away);
            let unrefs = op.unrefs.clone();

            let mut keep = false;
            for ptr in unrefs {
                let unref_original = unmerged.original_from_most_recent_or_same(ptr);
                let Some(changed) = merged.chain(unref_original) else {
                    continue;
                };
                let (changed_most_recent, changed_is_file) = (changed.most_recent, changed.is_file());
                keep = true;

                let (parent_original, name) = merged
                    .renamed_parent_and_name(unref_original)
                    .or_else(|| {
                        unmerged
                            .renamed_originals
                            .get(&unref_original)
                            .map(|ri| (ri.original_old_parent, ri.old_name.clone()))
                    })
                    .unwrap_or((chain_original, old_name.clone()));
                let parent = merged.chain_mut(parent_original).ok_or_else(|| {
                    CrError::inconsistent(format!(
                        "no merged chain for parent {parent_original} of {unref_original}"
                    ))
                })?;
                let entry_type = if changed_is_file {
                    EntryType::File
                } else {
                    EntryType::Dir
                };
                let mut create = Op::create(name, parent.original, entry_type)
                    .with_writer(merged_writer.clone());
                create.add_update(parent.original, parent.original);
                create.add_ref(changed_most_recent);
                parent.ensure_path(&mut create, parent.most_recent);
                debug!(node = %unref_original, parent = %parent_original, "keeping node changed in merged branch");
                parent.ops.insert(0, create);
            }

            if keep {
                if let Some(OpKind::Rm { drop_this, .. }) = unmerged
                    .chain_mut(chain_original)
                    .and_then(|c| c.ops.get_mut(i))
                    .map(|op| &mut op.kind)
                {
                    *drop_this = true;
                }
            }
        }
    }
    Ok(())
}

// ── Rename conflicts ─────────────────────────────────────────────────────────

/// Both branches changed the contents (or the same kind of attribute) of
/// one node.
pub fn quick_conflict(unmerged: Option<&Chain>, merged: Option<&Chain>) -> bool {
    let (Some(u), Some(m)) = (unmerged, merged) else {
        return false;
    };
    (u.has_sync_op() && m.has_sync_op()) || (u.has_set_attr_op() && m.has_set_attr_op())
}

/// Turn the unmerged renamed create described by `info` into a symlink
/// to `sym_path` (directories) or a forced copy (files), and make the
/// merged branch record the move back.
pub fn convert_create_into_symlink_or_copy(
    ptr: BlockPointer,
    info: &RenameInfo,
    unmerged: &mut Chains,
    merged: &mut Chains,
    sym_path: &str,
) -> CrResult<()> {
    let chain = unmerged
        .chain_mut(info.original_new_parent)
        .ok_or(CrError::NoChainFound(info.original_new_parent))?;
    let op = chain
        .ops
        .iter_mut()
        .find(|op| {
            matches!(&op.kind, OpKind::Create { renamed: true, new_name, .. } if *new_name == info.new_name)
        })
        .ok_or_else(|| {
            CrError::inconsistent(format!(
                "no rename op for {ptr} named {}",
                info.new_name
            ))
        })?;

    let mut new_type = EntryType::File;
    let mut clear_refs = false;
    if let OpKind::Create {
        entry_type,
        renamed,
        force_copy,
        cr_sym_path,
        ..
    } = &mut op.kind
    {
        if *entry_type == EntryType::Dir {
            *entry_type = EntryType::Sym;
            *cr_sym_path = Some(sym_path.to_string());
            clear_refs = true;
        } else {
            *force_copy = true;
        }
        *renamed = false;
        new_type = *entry_type;
    }
    if clear_refs {
        op.refs.clear();
    }

    let new_info = match merged.renamed_originals.get(&ptr) {
        Some(merged_info) => RenameInfo {
            original_old_parent: info.original_new_parent,
            old_name: info.new_name.clone(),
            ..merged_info.clone()
        },
        None => {
            // The merged branch sees the node move back where it was.
            let mut invert_create = Op::rm(info.new_name.clone(), info.original_new_parent);
            invert_create.add_update(info.original_new_parent, info.original_new_parent);
            let mut invert_rm = Op::create(info.old_name.clone(), info.original_old_parent, new_type);
            invert_rm.add_update(info.original_old_parent, info.original_old_parent);
            if let OpKind::Create { renamed, .. } = &mut invert_rm.kind {
                *renamed = true;
            }
            invert_rm.add_ref(ptr);

            let new_most_recent = merged.most_recent_from_original_or_same(info.original_new_parent);
            let old_most_recent = merged.most_recent_from_original_or_same(info.original_old_parent);
            merged.prepend_ops(old_most_recent, vec![invert_rm])?;
            merged.prepend_ops(new_most_recent, vec![invert_create])?;
            RenameInfo {
                original_old_parent: info.original_new_parent,
                old_name: info.new_name.clone(),
                original_new_parent: info.original_old_parent,
                new_name: info.old_name.clone(),
            }
        }
    };
    debug!(%ptr, sym_path, "converted renamed create");
    merged.renamed_originals.insert(ptr, new_info);

    if let Some(old_parent) = unmerged.chain_mut(info.original_old_parent) {
        old_parent.drop_rm(&info.old_name);
    }
    Ok(())
}

/// The unmerged path of a node, searched for in the unmerged head.
async fn single_unmerged_path(
    store: &BlockStore,
    unmerged: &Chains,
    most_recent: BlockPointer,
) -> CrResult<NodePath> {
    let targets = HashSet::from([most_recent]);
    let mut found = find_paths(store, &unmerged.branch, unmerged.head_root, &targets).await?;
    found
        .remove(&most_recent)
        .ok_or_else(|| CrError::inconsistent(format!("no unmerged path for {most_recent}")))
}

/// Resolve renames that can't be replayed as-is.
///
/// * A node renamed in both branches to different places stays where the
///   merged branch put it; the unmerged location gets a symlink (dirs) or
///   a copy (files).
/// * An unmerged rename that would put a directory inside itself in the
///   merged tree becomes a symlink back up the tree.
/// * A renamed node both branches wrote to is forked: each branch keeps
///   its own copy.
///
/// Returns extra unmerged paths that now need actions.
pub async fn fix_rename_conflicts(
    store: &BlockStore,
    unmerged: &mut Chains,
    merged: &mut Chains,
    merged_paths: &mut MergedPaths,
) -> CrResult<Vec<NodePath>> {
    let mut new_paths = Vec::new();
    let mut remove_renames = Vec::new();
    let mut double_renames = Vec::new();

    let renames: Vec<(BlockPointer, RenameInfo)> = unmerged
        .renamed_originals
        .iter()
        .map(|(p, i)| (*p, i.clone()))
        .collect();
    for (ptr, info) in renames {
        if unmerged.is_deleted(ptr) {
            continue;
        }
        if let Some(merged_info) = merged.renamed_originals.get(&ptr) {
            if merged_info.original_new_parent != info.original_new_parent
                || merged_info.new_name != info.new_name
            {
                double_renames.push(merged.most_recent_from_original_or_same(ptr));
                continue;
            }
        }

        if quick_conflict(unmerged.chain(ptr), merged.chain(ptr)) {
            info!(%ptr, from = %info.old_name, to = %info.new_name, "renamed node has conflicting edits; forking");
            let unmerged_most_recent = unmerged.most_recent_from_original(ptr)?;
            if let Some(old_parent) = unmerged.chain_mut(info.original_old_parent) {
                old_parent.drop_rm(&info.old_name);
            }
            let mut forked = false;
            if let Some(new_parent) = unmerged.chain_mut(info.original_new_parent) {
                for op in new_parent.ops.iter_mut() {
                    let OpKind::Create {
                        new_name,
                        renamed,
                        force_copy,
                        ..
                    } = &mut op.kind
                    else {
                        continue;
                    };
                    if *new_name != info.new_name || !*renamed {
                        continue;
                    }
                    *force_copy = true;
                    *renamed = false;
                    op.add_ref(unmerged_most_recent);
                    if let Some(i) = op.refs.iter().position(|r| *r == ptr) {
                        op.refs.remove(i);
                    }
                    forked = true;
                    break;
                }
            }
            if forked {
                if let Some(chain) = unmerged.chain_mut(ptr) {
                    chain.ops.clear();
                }
            }
            if ptr != unmerged_most_recent {
                unmerged.change_original(ptr, unmerged_most_recent)?;
                unmerged.mark_created(unmerged_most_recent);
            }
            continue;
        }

        let parent = unmerged.most_recent_from_original(info.original_new_parent)?;
        let mut unmerged_walk_back = 0;
        let mut unmerged_path = None;
        let merged_path = match merged_paths.get(&parent) {
            Some(path) => path.clone(),
            None => {
                if !unmerged.is_created(info.original_new_parent) {
                    return Err(CrError::inconsistent(format!(
                        "no merged path for rename parent {parent}"
                    )));
                }
                let path = single_unmerged_path(store, unmerged, parent).await?;
                let n = path.len() - 1;
                let mut found = None;
                for i in (0..=n).rev() {
                    if let Some(mp) = merged_paths.get(&path.nodes[i].ptr) {
                        unmerged_walk_back = n - i;
                        found = Some(mp.clone());
                        break;
                    }
                }
                let mp = found.ok_or_else(|| {
                    CrError::inconsistent(format!("no merged path for any parent of {parent}"))
                })?;
                unmerged_path = Some(path);
                mp
            }
        };

        for (x, node) in merged_path.nodes.iter().enumerate() {
            if merged.original_from_most_recent_or_same(node.ptr) != ptr {
                continue;
            }
            // The rename would put `ptr` under itself.
            if !unmerged.has_most_recent(parent) {
                return Err(CrError::NoChainFound(parent));
            }
            let merged_walk_back = merged_path.len() - 1 - x;
            let walk_back = unmerged_walk_back + merged_walk_back;
            let sym_path = format!("./{}", "../".repeat(walk_back));
            info!(%ptr, sym_path, "breaking rename cycle with a symlink");
            convert_create_into_symlink_or_copy(ptr, &info, unmerged, merged, &sym_path)?;

            if unmerged_walk_back > 0 {
                if let Some(up) = &unmerged_path {
                    new_paths.push(up.clone());
                    let mut nodes = merged_path.nodes.clone();
                    nodes.extend_from_slice(&up.nodes[up.len() - unmerged_walk_back..]);
                    merged_paths.insert(up.tail_ptr(), NodePath::new(merged_path.branch.clone(), nodes));
                }
            }
            remove_renames.push(ptr);
        }
    }

    // Merged renames of nodes the unmerged branch also edited.
    let mut forked_from_merged: BTreeMap<BlockPointer, Vec<PathNode>> = BTreeMap::new();
    let merged_renames: Vec<(BlockPointer, RenameInfo)> = merged
        .renamed_originals
        .iter()
        .map(|(p, i)| (*p, i.clone()))
        .collect();
    for (ptr, info) in merged_renames {
        if merged.is_deleted(ptr) {
            continue;
        }
        if let Some(unmerged_info) = unmerged.renamed_originals.get(&ptr) {
            if info.original_new_parent != unmerged_info.original_new_parent
                || info.new_name != unmerged_info.new_name
            {
                continue;
            }
        }
        if !quick_conflict(unmerged.chain(ptr), merged.chain(ptr)) {
            continue;
        }
        info!(%ptr, from = %info.old_name, to = %info.new_name, "merged rename has conflicting edits; forking");

        let Some(chain) = unmerged.chain_mut(ptr) else {
            continue;
        };
        let unmerged_most_recent = chain.most_recent;
        let mut parent_path = None;
        for op in chain.ops.iter_mut() {
            match &mut op.kind {
                OpKind::Sync {
                    keep_unmerged_tail_name,
                    ..
                }
                | OpKind::SetAttr {
                    keep_unmerged_tail_name,
                    ..
                } => {
                    *keep_unmerged_tail_name = true;
                    parent_path = op.final_path.as_ref().map(NodePath::parent_path);
                }
                _ => {}
            }
        }
        let Some(parent_path) = parent_path.filter(NodePath::is_valid) else {
            continue;
        };
        let unmerged_parent = parent_path.tail_ptr();
        if merged_paths.contains_key(&unmerged_parent) {
            continue;
        }
        let merged_parent =
            merged.most_recent_from_original_or_same(unmerged.original_of(unmerged_parent));
        forked_from_merged
            .entry(merged_parent)
            .or_default()
            .push(PathNode::new(unmerged_most_recent, info.old_name.clone()));
        new_paths.push(parent_path);
    }

    for ptr in remove_renames {
        unmerged.renamed_originals.remove(&ptr);
    }

    if double_renames.is_empty() && forked_from_merged.is_empty() {
        return Ok(new_paths);
    }

    let mut targets: HashSet<BlockPointer> = double_renames.iter().copied().collect();
    targets.extend(forked_from_merged.keys().copied());
    let found = find_paths(store, &merged.branch, merged.head_root, &targets).await?;

    for ptr in double_renames {
        let new_parent_path = found.get(&ptr).ok_or_else(|| {
            CrError::inconsistent(format!("no merged path for doubly-renamed {ptr}"))
        })?;
        let original = merged.original_from_most_recent_or_same(ptr);
        let unmerged_info = unmerged
            .renamed_originals
            .get(&original)
            .cloned()
            .ok_or_else(|| CrError::inconsistent(format!("no unmerged rename info for {original}")))?;
        let merged_info = merged
            .renamed_originals
            .get(&original)
            .cloned()
            .ok_or_else(|| CrError::inconsistent(format!("no merged rename info for {original}")))?;
        let chain_most_recent = unmerged
            .chain(unmerged_info.original_new_parent)
            .ok_or(CrError::NoChainFound(unmerged_info.original_new_parent))?
            .most_recent;
        let old_parent_path = merged_paths.get(&chain_most_recent).ok_or_else(|| {
            CrError::inconsistent(format!("no merged path for old parent {chain_most_recent}"))
        })?;

        // Walk up from the unmerged destination until reaching a node on
        // the merged path, then down to the merged destination.
        let mut sym_path = String::from("./");
        let mut new_parent_start = 0;
        for node in old_parent_path.nodes.iter().rev() {
            let node_original = unmerged.original_from_most_recent_or_same(node.ptr);
            let merged_most_recent = merged.most_recent_from_original_or_same(node_original);
            if let Some(j) = new_parent_path
                .nodes
                .iter()
                .position(|p| p.ptr == merged_most_recent)
            {
                new_parent_start = j;
                break;
            }
            sym_path.push_str("../");
        }
        let end = new_parent_path.len().saturating_sub(1);
        for node in new_parent_path
            .nodes
            .get(new_parent_start + 1..end)
            .unwrap_or_default()
        {
            sym_path.push_str(&node.name);
            sym_path.push('/');
        }
        sym_path.push_str(&merged_info.new_name);

        info!(%original, sym_path, "node renamed in both branches");
        convert_create_into_symlink_or_copy(original, &unmerged_info, unmerged, merged, &sym_path)?;
    }

    for (ptr, nodes) in forked_from_merged {
        let parent_path = found.get(&ptr).ok_or_else(|| {
            CrError::inconsistent(format!("no merged path for forked parent {ptr}"))
        })?;
        for node in nodes {
            merged_paths.insert(node.ptr, parent_path.child_path(node.name, node.ptr));
        }
    }
    Ok(new_paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::RevisionMetadata;
    use tlfcr_core::types::{Block, DirBlock, DirEntry};
    use tlfcr_core::{BranchId, Revision};

    fn ptr(tag: &str) -> BlockPointer {
        BlockPointer::derive(tag.as_bytes(), b"")
    }

    fn md(branch: BranchId, root: BlockPointer, ops: Vec<Op>) -> RevisionMetadata {
        RevisionMetadata {
            revision: Revision(2),
            branch,
            root,
            writer: "bob".into(),
            ops,
        }
    }

    fn unmerged_branch() -> BranchId {
        BranchId::Unmerged("local".into())
    }

    #[test]
    fn test_quick_conflict() {
        let (r0, r1) = (ptr("r0"), ptr("r1"));
        let f = ptr("f");
        let mut sync = Op::sync(f);
        sync.add_update(f, ptr("f1"));
        sync.add_update(r0, r1);
        let a = Chains::build(BranchId::Master, &[md(BranchId::Master, r1, vec![sync.clone()])]).unwrap();
        let b = Chains::build(unmerged_branch(), &[md(unmerged_branch(), r1, vec![sync])]).unwrap();
        assert!(quick_conflict(a.chain(f), b.chain(f)));
        assert!(!quick_conflict(a.chain(f), b.chain(r0)));
        assert!(!quick_conflict(None, b.chain(f)));
    }

    #[test]
    fn test_convert_dir_create_into_symlink() {
        let (r0, r1) = (ptr("r0"), ptr("r1"));
        let (a0, a1) = (ptr("a0"), ptr("a1"));
        let x = ptr("x");
        let mut ren = Op::rename("x", r0, "x", a0, x, EntryType::Dir);
        ren.add_update(r0, r1);
        ren.add_update(a0, a1);
        let mut unmerged = Chains::build(unmerged_branch(), &[md(unmerged_branch(), r1, vec![ren])]).unwrap();
        let mut merged = Chains::empty(BranchId::Master);
        let info = unmerged.renamed_originals[&x].clone();

        convert_create_into_symlink_or_copy(x, &info, &mut unmerged, &mut merged, "./../").unwrap();

        let create = &unmerged.chain(a0).unwrap().ops[0];
        match &create.kind {
            OpKind::Create {
                entry_type,
                renamed,
                cr_sym_path,
                ..
            } => {
                assert_eq!(*entry_type, EntryType::Sym);
                assert!(!renamed);
                assert_eq!(cr_sym_path.as_deref(), Some("./../"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(create.refs.is_empty());
        assert!(matches!(
            unmerged.chain(r0).unwrap().ops[0].kind,
            OpKind::Rm { drop_this: true, .. }
        ));
        // The merged side records the move back.
        let back = &merged.renamed_originals[&x];
        assert_eq!(back.original_new_parent, r0);
        assert_eq!(back.old_name, "x");
        assert!(merged.chain(r0).is_some());
        assert!(merged.chain(a0).is_some());
    }

    #[test]
    fn test_add_merged_recreates_keeps_changed_node() {
        let (r0, u1, m1) = (ptr("r0"), ptr("u1"), ptr("m1"));
        let (f0, f1) = (ptr("f0"), ptr("f1"));
        let mut rm = Op::rm("f", r0);
        rm.add_update(r0, u1);
        rm.add_unref(f0);
        let mut unmerged = Chains::build(unmerged_branch(), &[md(unmerged_branch(), u1, vec![rm])]).unwrap();

        let mut sync = Op::sync(f0);
        sync.add_update(f0, f1);
        sync.add_update(r0, m1);
        let mut merged = Chains::build(BranchId::Master, &[md(BranchId::Master, m1, vec![sync])]).unwrap();

        let writer = WriterInfo::new("carol", Revision(3));
        add_merged_recreates(&mut unmerged, &mut merged, &writer).unwrap();

        assert!(matches!(
            unmerged.chain(r0).unwrap().ops[0].kind,
            OpKind::Rm { drop_this: true, .. }
        ));
        let create = &merged.chain(r0).unwrap().ops[0];
        assert!(matches!(&create.kind, OpKind::Create { new_name, .. } if new_name == "f"));
        assert_eq!(create.refs, vec![f1]);
        assert_eq!(create.writer, writer);
    }

    #[tokio::test]
    async fn test_rename_into_own_child_becomes_symlink() {
        // Base: /a and /b. Unmerged: mv /a /b/a. Merged: mv /b /a/b.
        let store = BlockStore::memory().unwrap();
        let a0 = store.put(&Block::Dir(DirBlock::new())).await.unwrap();
        let b0 = store.put(&Block::Dir(DirBlock::new())).await.unwrap();
        let r0 = ptr("r0");

        // Merged tree: /a/b
        let mut ma = DirBlock::new();
        ma.set_entry("b", DirEntry::new(b0, EntryType::Dir));
        let a1 = store.put(&Block::Dir(ma)).await.unwrap();
        let mut mroot = DirBlock::new();
        mroot.set_entry("a", DirEntry::new(a1, EntryType::Dir));
        let m1 = store.put(&Block::Dir(mroot)).await.unwrap();
        let mut merged_ren = Op::rename("b", r0, "b", a0, b0, EntryType::Dir);
        merged_ren.add_update(r0, m1);
        merged_ren.add_update(a0, a1);
        let mut merged = Chains::build(BranchId::Master, &[md(BranchId::Master, m1, vec![merged_ren])]).unwrap();

        // Unmerged tree: /b/a
        let mut ub = DirBlock::new();
        ub.set_entry("a", DirEntry::new(a0, EntryType::Dir));
        let b1 = store.put(&Block::Dir(ub)).await.unwrap();
        let mut uroot = DirBlock::new();
        uroot.set_entry("b", DirEntry::new(b1, EntryType::Dir));
        let u1 = store.put(&Block::Dir(uroot)).await.unwrap();
        let mut unmerged_ren = Op::rename("a", r0, "a", b0, a0, EntryType::Dir);
        unmerged_ren.add_update(r0, u1);
        unmerged_ren.add_update(b0, b1);
        let mut unmerged =
            Chains::build(unmerged_branch(), &[md(unmerged_branch(), u1, vec![unmerged_ren])]).unwrap();

        // Unmerged /b maps to merged /a/b.
        let mut merged_paths = MergedPaths::new();
        merged_paths.insert(
            b1,
            NodePath::new(
                BranchId::Master,
                vec![
                    PathNode::new(m1, ""),
                    PathNode::new(a1, "a"),
                    PathNode::new(b0, "b"),
                ],
            ),
        );
        merged_paths.insert(u1, NodePath::new(BranchId::Master, vec![PathNode::new(m1, "")]));

        fix_rename_conflicts(&store, &mut unmerged, &mut merged, &mut merged_paths)
            .await
            .unwrap();

        let create = &unmerged.chain(b0).unwrap().ops[0];
        match &create.kind {
            OpKind::Create {
                entry_type,
                cr_sym_path,
                ..
            } => {
                assert_eq!(*entry_type, EntryType::Sym);
                assert_eq!(cr_sym_path.as_deref(), Some("./../"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!unmerged.renamed_originals.contains_key(&a0));
    }
}
