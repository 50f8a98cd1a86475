//! Mapping changed unmerged nodes onto the merged tree.
//!
//! Two passes run before any conflict is looked at. The first merges
//! directories (and empty files) that both branches created under the
//! same name, so their contents are treated as one node. The second
//! finds, for every changed unmerged node, the path of the matching node
//! in the merged tree. When the merged branch deleted an ancestor, the
//! missing part of the path is recreated from the unmerged tree.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use tlfcr_core::types::EntryType;
use tlfcr_core::{BlockPointer, CrError, CrResult, WriterInfo};
use tlfcr_storage::BlockStore;

use crate::chains::Chains;
use crate::ops::{write_ranges_equivalent, Op, OpKind, WriteRange};
use crate::path::{find_paths, NodePath, PathNode};

/// Unmerged most-recent pointer -> path of the same node in the merged
/// tree.
pub type MergedPaths = HashMap<BlockPointer, NodePath>;

// ── Merging same-name creates ────────────────────────────────────────────────

/// Whether two same-name files created by both branches carry writes that
/// really conflict. Equivalent writes and writes that only truncate to
/// zero are dropped along the way.
pub fn created_file_with_conflicting_write(
    unmerged: &mut Chains,
    merged: &mut Chains,
    unmerged_original: BlockPointer,
    merged_original: BlockPointer,
) -> bool {
    let (Some(u_chain), Some(m_chain)) = (
        unmerged.chain(unmerged_original),
        merged.chain(merged_original),
    ) else {
        return false;
    };
    let u_range = u_chain.collapsed_write_range();
    let m_range = m_chain.collapsed_write_range();
    let zero_truncate =
        |r: &[WriteRange]| matches!(r, [w] if w.is_truncate() && w.off == 0);

    if write_ranges_equivalent(&u_range, &m_range) || zero_truncate(&u_range) {
        if let Some(chain) = unmerged.chain_mut(unmerged_original) {
            chain.remove_sync_ops();
        }
        return false;
    }
    if zero_truncate(&m_range) {
        if let Some(chain) = merged.chain_mut(merged_original) {
            chain.remove_sync_ops();
        }
        return false;
    }
    true
}

/// Whether `name` has a non-empty file in both parent directories.
pub async fn created_file_with_nonzero_sizes(
    store: &BlockStore,
    unmerged_parent: BlockPointer,
    merged_parent: BlockPointer,
    name: &str,
) -> CrResult<bool> {
    let merged_dir = store.get_dir(merged_parent).await?;
    let Some(merged_entry) = merged_dir.get(name) else {
        return Ok(false);
    };
    let unmerged_dir = store.get_dir(unmerged_parent).await?;
    let Some(unmerged_entry) = unmerged_dir.get(name) else {
        return Ok(false);
    };
    if merged_entry.size > 0 && unmerged_entry.size > 0 {
        debug!(
            name = %name,
            merged_size = merged_entry.size,
            unmerged_size = unmerged_entry.size,
            "both branches created a non-empty file"
        );
        return Ok(true);
    }
    Ok(false)
}

/// Merge the creates under the unmerged directory `original` (at `path`)
/// with same-name, same-type creates the merged branch made there.
/// Merged directories are descended into. Returns the unmerged paths of
/// every node that now shares an original with a merged node.
pub async fn check_path_for_merge(
    store: &BlockStore,
    unmerged: &mut Chains,
    merged: &mut Chains,
    original: BlockPointer,
    path: NodePath,
) -> CrResult<Vec<NodePath>> {
    let mut new_paths = Vec::new();
    let mut work = vec![(original, path)];

    while let Some((original, path)) = work.pop() {
        let Some(merged_chain) = merged.chain(original) else {
            continue;
        };
        let merged_parent = merged_chain.most_recent;
        let merged_creates: HashMap<String, (EntryType, BlockPointer)> = merged_chain
            .ops
            .iter()
            .filter_map(|op| match &op.kind {
                OpKind::Create {
                    new_name,
                    entry_type,
                    renamed: false,
                    ..
                } => op.refs.first().map(|r| (new_name.clone(), (*entry_type, *r))),
                _ => None,
            })
            .collect();
        if merged_creates.is_empty() {
            continue;
        }

        let Some(unmerged_chain) = unmerged.chain(original) else {
            continue;
        };
        let unmerged_parent = unmerged_chain.most_recent;
        let candidates: Vec<(usize, String, EntryType, BlockPointer)> = unmerged_chain
            .ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match &op.kind {
                OpKind::Create {
                    new_name,
                    entry_type,
                    renamed: false,
                    ..
                } => op
                    .refs
                    .first()
                    .map(|r| (i, new_name.clone(), *entry_type, *r)),
                _ => None,
            })
            .collect();

        let mut to_drop = HashSet::new();
        for (i, name, entry_type, unmerged_original) in candidates {
            let Some((merged_type, merged_original)) = merged_creates.get(&name).copied() else {
                continue;
            };
            if merged_type != entry_type {
                continue;
            }
            if entry_type != EntryType::Dir {
                if created_file_with_conflicting_write(
                    unmerged,
                    merged,
                    unmerged_original,
                    merged_original,
                ) {
                    continue;
                }
                if created_file_with_nonzero_sizes(store, unmerged_parent, merged_parent, &name)
                    .await?
                {
                    continue;
                }
            }

            to_drop.insert(i);
            debug!(%unmerged_original, %merged_original, name = %name, "merging same-name creates");
            match unmerged.change_original(unmerged_original, merged_original) {
                Ok(()) => {}
                Err(CrError::NoChainFound(_)) => {
                    // Nothing happened to the node after its create.
                    unmerged.to_unref.insert(unmerged_original);
                    continue;
                }
                Err(e) => return Err(e),
            }

            let chain = unmerged.chain_mut(merged_original).ok_or_else(|| {
                CrError::inconsistent(format!(
                    "changing original {unmerged_original} -> {merged_original} didn't stick"
                ))
            })?;
            let new_path = path.child_path(name, chain.most_recent);
            if entry_type == EntryType::Dir {
                work.push((merged_original, new_path.clone()));
            } else {
                let mut synced = false;
                for op in chain.ops.iter_mut() {
                    op.final_path = Some(new_path.clone());
                    synced |= op.is_sync();
                }
                if synced {
                    unmerged.unmark_created(merged_original);
                }
            }
            new_paths.push(new_path);
        }

        if !to_drop.is_empty() {
            if let Some(chain) = unmerged.chain_mut(original) {
                let ops = std::mem::take(&mut chain.ops);
                chain.ops = ops
                    .into_iter()
                    .enumerate()
                    .filter(|(i, _)| !to_drop.contains(i))
                    .map(|(_, op)| op)
                    .collect();
            }
        }
    }
    Ok(new_paths)
}

/// Run [`check_path_for_merge`] for every unmerged path.
pub async fn find_created_dirs_to_merge(
    store: &BlockStore,
    unmerged_paths: &[NodePath],
    unmerged: &mut Chains,
    merged: &mut Chains,
) -> CrResult<Vec<NodePath>> {
    let mut new_paths = Vec::new();
    for path in unmerged_paths {
        let tail = path.tail_ptr();
        let original = unmerged
            .chain_by_most_recent(tail)
            .map(|c| c.original)
            .ok_or(CrError::NoChainFound(tail))?;
        new_paths
            .extend(check_path_for_merge(store, unmerged, merged, original, path.clone()).await?);
    }
    Ok(new_paths)
}

// ── Resolving merged paths ───────────────────────────────────────────────────

/// Work out the part of the merged path of `unmerged_path` that doesn't
/// exist in the merged tree, plus the deepest merged pointer the rest of
/// the path hangs from.
///
/// Ancestors the merged branch deleted are recreated: the returned creates
/// put them back, and the merged rms that deleted them are dropped.
/// Returned nodes carry original pointers; the caller prefixes them with
/// the merged path of the returned pointer.
pub async fn resolve_merged_path_tail(
    store: &BlockStore,
    unmerged_path: &NodePath,
    unmerged: &mut Chains,
    merged: &mut Chains,
    writer: &WriterInfo,
) -> CrResult<(NodePath, BlockPointer, Vec<Op>)> {
    let unmerged_original = unmerged.original_from_most_recent(unmerged_path.tail_ptr())?;
    let mut recreate_ops = Vec::new();
    let mut merged_nodes = Vec::new();
    let mut curr_original = unmerged_original;
    let mut curr_path = unmerged_path.clone();

    while merged.is_deleted(curr_original) {
        debug!(original = %curr_original, path = %curr_path, "recreating node deleted in merged branch");
        if curr_path.len() < 2 {
            return Err(CrError::inconsistent(format!(
                "no valid merged parent path for {unmerged_original}"
            )));
        }
        let name = curr_path.tail_name().to_string();
        merged_nodes.push(PathNode::new(curr_original, name.clone()));
        let parent_path = curr_path.parent_path();
        let parent_original = unmerged.original_from_most_recent(parent_path.tail_ptr())?;

        let merged_most_recent = merged.most_recent_from_original_or_same(curr_original);
        match merged.chain_mut(parent_original) {
            Some(chain) => {
                if let Some(i) = chain.ops.iter().position(|op| {
                    matches!(op.kind, OpKind::Rm { .. }) && op.unrefs.contains(&merged_most_recent)
                }) {
                    chain.ops.remove(i);
                }
            }
            None => debug!(parent = %parent_original, "no merged chain for parent; skipping rm removal"),
        }

        let parent_dir = store.get_dir(parent_path.tail_ptr()).await?;
        let entry = parent_dir.lookup(parent_path.tail_ptr(), &name)?;
        let mut create =
            Op::create(name, parent_original, entry.entry_type).with_writer(writer.clone());
        create.add_update(parent_original, parent_original);
        create.final_path = Some(parent_path.clone());
        create.add_ref(curr_original);

        if entry.entry_type != EntryType::Dir {
            if let Some(mr) = merged.chain(curr_original).map(|c| c.most_recent) {
                merged.remove_chain(mr);
            }
        }

        match unmerged.renamed_originals.get(&curr_original).cloned() {
            Some(info) => {
                // The node got here by a rename; its renamed create
                // becomes the recreate and the old rm goes away.
                unmerged
                    .chain_mut(info.original_old_parent)
                    .ok_or(CrError::NoChainFound(info.original_old_parent))?
                    .drop_rm(&info.old_name);
                let new_parent = unmerged
                    .chain_mut(info.original_new_parent)
                    .ok_or(CrError::NoChainFound(info.original_new_parent))?;
                if let Some(slot) = new_parent.ops.iter_mut().find(
                    |op| matches!(&op.kind, OpKind::Create { new_name, .. } if *new_name == info.new_name),
                ) {
                    *slot = create;
                }
            }
            None => recreate_ops.push(create),
        }

        curr_original = parent_original;
        curr_path = parent_path;
    }

    let mut most_recent = BlockPointer::ZERO;
    for node in curr_path.nodes.iter().rev() {
        let original = unmerged.original_from_most_recent(node.ptr)?;
        if let Ok(mr) = merged.most_recent_from_original(original) {
            most_recent = mr;
            break;
        }
        merged_nodes.push(PathNode::new(original, node.name.clone()));
        if let Some((parent, new_name)) = merged.renamed_parent_and_name(original) {
            most_recent = merged.most_recent_from_original(parent)?;
            if let Some(last) = merged_nodes.last_mut() {
                last.name = new_name;
            }
            break;
        }
    }

    merged_nodes.reverse();
    recreate_ops.reverse();
    Ok((
        NodePath::new(merged.branch.clone(), merged_nodes),
        most_recent,
        recreate_ops,
    ))
}

/// Find the merged path of every unmerged path.
///
/// Also returns the recreate ops for merged-deleted ancestors (deduped by
/// parent and name), and extra unmerged paths for directories the
/// unmerged branch deleted while the merged branch changed them; only the
/// rms in those directories are kept.
pub async fn resolve_merged_paths(
    store: &BlockStore,
    unmerged_paths: &[NodePath],
    unmerged: &mut Chains,
    merged: &mut Chains,
    writer: &WriterInfo,
) -> CrResult<(MergedPaths, Vec<Op>, Vec<NodePath>)> {
    let mut merged_paths = MergedPaths::new();
    let mut to_search: HashMap<BlockPointer, Vec<BlockPointer>> = HashMap::new();
    let mut new_unmerged_paths = Vec::new();

    for original in unmerged.originals() {
        let Some(chain) = unmerged.chain(original) else {
            continue;
        };
        if !unmerged.is_deleted(original) || chain.ops.is_empty() || chain.is_file() {
            continue;
        }
        let Some(merged_chain) = merged.chain(original) else {
            continue;
        };
        if merged_chain.ops.is_empty() || merged.is_deleted(original) {
            continue;
        }
        let merged_most_recent = merged_chain.most_recent;
        debug!(%original, "unmerged branch deleted a directory the merged branch changed");
        let Some(chain) = unmerged.chain_mut(original) else {
            continue;
        };
        chain.ops.retain(|op| matches!(op.kind, OpKind::Rm { .. }));
        let unmerged_most_recent = chain.most_recent;
        new_unmerged_paths.push(NodePath::new(
            unmerged.branch.clone(),
            vec![PathNode::new(unmerged_most_recent, "")],
        ));
        to_search
            .entry(merged_most_recent)
            .or_default()
            .push(unmerged_most_recent);
    }

    if unmerged_paths.is_empty() && to_search.is_empty() {
        return Ok((merged_paths, Vec::new(), Vec::new()));
    }

    let mut recreate_ops = Vec::new();
    let mut creates_seen: HashSet<(BlockPointer, String)> = HashSet::new();
    for path in unmerged_paths {
        let (merged_path, most_recent, ops) =
            resolve_merged_path_tail(store, path, unmerged, merged, writer).await?;
        for op in ops {
            if let OpKind::Create { dir, new_name, .. } = &op.kind {
                if !creates_seen.insert((dir.unref, new_name.clone())) {
                    continue;
                }
            }
            recreate_ops.push(op);
        }
        if !merged_path.is_valid() {
            debug!(ptr = %path.tail_ptr(), "no merged path tail yet");
        }
        merged_paths.insert(path.tail_ptr(), merged_path);
        if most_recent.is_initialized() {
            to_search.entry(most_recent).or_default().push(path.tail_ptr());
        }
    }

    if to_search.is_empty() {
        return Ok((merged_paths, recreate_ops, new_unmerged_paths));
    }

    let targets: HashSet<BlockPointer> = to_search.keys().copied().collect();
    let mut found = find_paths(store, &merged.branch, merged.head_root, &targets).await?;
    for (ptr, unmerged_most_recents) in to_search {
        let prefix = found.remove(&ptr).ok_or(CrError::NodeNotFound(ptr))?;
        for unmerged_most_recent in unmerged_most_recents {
            let merged_path = merged_paths
                .entry(unmerged_most_recent)
                .or_insert_with(|| NodePath::new(prefix.branch.clone(), Vec::new()));
            let mut nodes = prefix.nodes.clone();
            nodes.append(&mut merged_path.nodes);
            merged_path.nodes = nodes;

            let full = merged_path.clone();
            if let Some(chain) = merged.chain_by_most_recent_mut(full.tail_ptr()) {
                for op in chain.ops.iter_mut() {
                    op.final_path = Some(full.clone());
                }
            }
        }
    }
    Ok((merged_paths, recreate_ops, new_unmerged_paths))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::RevisionMetadata;
    use tlfcr_core::types::{Block, DirBlock, DirEntry, FileBlock};
    use tlfcr_core::{BranchId, Revision};

    fn ptr(tag: &str) -> BlockPointer {
        BlockPointer::derive(tag.as_bytes(), b"")
    }

    fn md(branch: BranchId, rev: u64, root: BlockPointer, ops: Vec<Op>) -> RevisionMetadata {
        RevisionMetadata {
            revision: Revision(rev),
            branch,
            root,
            writer: "alice".into(),
            ops,
        }
    }

    fn unmerged_branch() -> BranchId {
        BranchId::Unmerged("local".into())
    }

    fn create(name: &str, dir: BlockPointer, new_dir: BlockPointer, node: BlockPointer, t: EntryType) -> Op {
        let mut op = Op::create(name, dir, t);
        op.add_update(dir, new_dir);
        op.add_ref(node);
        op
    }

    async fn put_dir(store: &BlockStore, entries: &[(&str, DirEntry)]) -> BlockPointer {
        let mut dir = DirBlock::new();
        for (name, entry) in entries {
            dir.set_entry(name, entry.clone());
        }
        store.put(&Block::Dir(dir)).await.unwrap()
    }

    #[test]
    fn test_zero_truncate_is_not_a_conflicting_write() {
        let (r0, u1, m1) = (ptr("r0"), ptr("u1"), ptr("m1"));
        let (uf, mf) = (ptr("uf"), ptr("mf"));
        let mut u_sync = Op::sync(uf).with_writes(vec![WriteRange::truncate(0)]);
        u_sync.add_update(uf, ptr("uf2"));
        let mut unmerged = Chains::build(
            unmerged_branch(),
            &[md(unmerged_branch(), 2, u1, vec![create("f", r0, u1, uf, EntryType::File), u_sync])],
        )
        .unwrap();
        let mut m_sync = Op::sync(mf).with_writes(vec![WriteRange::write(0, 4)]);
        m_sync.add_update(mf, ptr("mf2"));
        let mut merged = Chains::build(
            BranchId::Master,
            &[md(BranchId::Master, 2, m1, vec![create("f", r0, m1, mf, EntryType::File), m_sync])],
        )
        .unwrap();

        assert!(!created_file_with_conflicting_write(&mut unmerged, &mut merged, uf, mf));
        assert!(!unmerged.chain(uf).unwrap().has_sync_op());
        assert!(merged.chain(mf).unwrap().has_sync_op());
        assert!(!created_file_with_conflicting_write(&mut unmerged, &mut merged, ptr("x"), mf));
    }

    #[tokio::test]
    async fn test_same_name_empty_dirs_merge() {
        let store = BlockStore::memory().unwrap();
        let (r0, u1, m1) = (ptr("r0"), ptr("u1"), ptr("m1"));
        let (ud, md_) = (ptr("ud"), ptr("md"));
        let mut unmerged = Chains::build(
            unmerged_branch(),
            &[md(unmerged_branch(), 2, u1, vec![create("d", r0, u1, ud, EntryType::Dir)])],
        )
        .unwrap();
        let mut merged = Chains::build(
            BranchId::Master,
            &[md(BranchId::Master, 2, m1, vec![create("d", r0, m1, md_, EntryType::Dir)])],
        )
        .unwrap();

        let root = NodePath::new(unmerged_branch(), vec![PathNode::new(u1, "")]);
        let paths = check_path_for_merge(&store, &mut unmerged, &mut merged, r0, root)
            .await
            .unwrap();
        assert!(paths.is_empty());
        assert!(unmerged.to_unref.contains(&ud));
        assert!(unmerged.chain(r0).unwrap().ops.is_empty());
    }

    #[tokio::test]
    async fn test_nonzero_same_name_files_stay_apart() {
        let store = BlockStore::memory().unwrap();
        let r0 = ptr("r0");
        let (uf, mf) = (ptr("uf"), ptr("mf"));
        let sized = |p, size| DirEntry {
            size,
            ..DirEntry::new(p, EntryType::File)
        };
        let u1 = put_dir(&store, &[("f", sized(uf, 3))]).await;
        let m1 = put_dir(&store, &[("f", sized(mf, 5))]).await;
        let mut unmerged = Chains::build(
            unmerged_branch(),
            &[md(unmerged_branch(), 2, u1, vec![create("f", r0, u1, uf, EntryType::File)])],
        )
        .unwrap();
        let mut merged = Chains::build(
            BranchId::Master,
            &[md(BranchId::Master, 2, m1, vec![create("f", r0, m1, mf, EntryType::File)])],
        )
        .unwrap();

        let root = NodePath::new(unmerged_branch(), vec![PathNode::new(u1, "")]);
        check_path_for_merge(&store, &mut unmerged, &mut merged, r0, root)
            .await
            .unwrap();
        assert_eq!(unmerged.chain(r0).unwrap().ops.len(), 1);
        assert!(unmerged.to_unref.is_empty());
    }

    #[tokio::test]
    async fn test_zero_size_same_name_files_merge() {
        let store = BlockStore::memory().unwrap();
        let r0 = ptr("r0");
        let (uf, mf) = (ptr("uf"), ptr("mf"));
        let u1 = put_dir(&store, &[("f", DirEntry::new(uf, EntryType::File))]).await;
        let m1 = put_dir(&store, &[("f", DirEntry::new(mf, EntryType::File))]).await;
        let mut unmerged = Chains::build(
            unmerged_branch(),
            &[md(unmerged_branch(), 2, u1, vec![create("f", r0, u1, uf, EntryType::File)])],
        )
        .unwrap();
        let mut merged = Chains::build(
            BranchId::Master,
            &[md(BranchId::Master, 2, m1, vec![create("f", r0, m1, mf, EntryType::File)])],
        )
        .unwrap();

        let root = NodePath::new(unmerged_branch(), vec![PathNode::new(u1, "")]);
        check_path_for_merge(&store, &mut unmerged, &mut merged, r0, root)
            .await
            .unwrap();
        assert!(unmerged.chain(r0).unwrap().ops.is_empty());
        assert!(unmerged.to_unref.contains(&uf));
    }

    #[tokio::test]
    async fn test_resolve_merged_path_through_untouched_dirs() {
        let store = BlockStore::memory().unwrap();
        let f0 = store.put(&Block::File(FileBlock::default())).await.unwrap();
        let a0 = put_dir(&store, &[("f", DirEntry::new(f0, EntryType::File))]).await;
        let r0 = put_dir(&store, &[("a", DirEntry::new(a0, EntryType::Dir))]).await;

        let f1 = store
            .put(&Block::File(FileBlock { contents: b"x".to_vec() }))
            .await
            .unwrap();
        let a1 = put_dir(&store, &[("f", DirEntry::new(f1, EntryType::File))]).await;
        let u1 = put_dir(&store, &[("a", DirEntry::new(a1, EntryType::Dir))]).await;

        let g = store.put(&Block::File(FileBlock::default())).await.unwrap();
        let m1 = put_dir(
            &store,
            &[
                ("a", DirEntry::new(a0, EntryType::Dir)),
                ("g", DirEntry::new(g, EntryType::File)),
            ],
        )
        .await;

        let mut sync = Op::sync(f0).with_writes(vec![WriteRange::write(0, 1)]);
        sync.add_update(f0, f1);
        sync.add_update(a0, a1);
        sync.add_update(r0, u1);
        let mut unmerged = Chains::build(unmerged_branch(), &[md(unmerged_branch(), 2, u1, vec![sync])])
            .unwrap();
        let mut merged = Chains::build(
            BranchId::Master,
            &[md(BranchId::Master, 2, m1, vec![create("g", r0, m1, g, EntryType::File)])],
        )
        .unwrap();

        let paths = unmerged.get_paths(&store).await.unwrap();
        assert_eq!(paths.len(), 1);
        let writer = WriterInfo::new("alice", Revision(2));
        let (merged_paths, recreates, extra) =
            resolve_merged_paths(&store, &paths, &mut unmerged, &mut merged, &writer)
                .await
                .unwrap();
        assert!(recreates.is_empty());
        assert!(extra.is_empty());
        let mp = &merged_paths[&f1];
        assert_eq!(mp.to_string(), "/a/f");
        assert_eq!(mp.nodes[0].ptr, m1);
        assert_eq!(mp.tail_ptr(), f0);
    }

    #[tokio::test]
    async fn test_deleted_merged_parent_is_recreated() {
        let store = BlockStore::memory().unwrap();
        let f0 = store.put(&Block::File(FileBlock::default())).await.unwrap();
        let d0 = put_dir(&store, &[("f", DirEntry::new(f0, EntryType::File))]).await;
        let r0 = put_dir(&store, &[("d", DirEntry::new(d0, EntryType::Dir))]).await;

        let f1 = store.put(&Block::File(FileBlock::default())).await.unwrap();
        let d1 = put_dir(&store, &[("f", DirEntry::new(f1, EntryType::File))]).await;
        let u1 = put_dir(&store, &[("d", DirEntry::new(d1, EntryType::Dir))]).await;
        let m1 = put_dir(&store, &[]).await;

        let mut sync = Op::sync(f0).with_writes(vec![WriteRange::write(0, 1)]);
        sync.add_update(f0, f1);
        sync.add_update(d0, d1);
        sync.add_update(r0, u1);
        let mut unmerged = Chains::build(unmerged_branch(), &[md(unmerged_branch(), 2, u1, vec![sync])])
            .unwrap();
        let mut rm_f = Op::rm("f", d0);
        rm_f.add_update(d0, ptr("d-tmp"));
        rm_f.add_update(r0, ptr("r-tmp"));
        rm_f.add_unref(f0);
        let mut rm_d = Op::rm("d", ptr("r-tmp"));
        rm_d.add_update(ptr("r-tmp"), m1);
        rm_d.add_unref(ptr("d-tmp"));
        let mut merged = Chains::build(
            BranchId::Master,
            &[md(BranchId::Master, 2, m1, vec![rm_f, rm_d])],
        )
        .unwrap();
        assert!(merged.is_deleted(d0));

        let paths = unmerged.get_paths(&store).await.unwrap();
        let writer = WriterInfo::new("alice", Revision(2));
        let (merged_paths, recreates, _) =
            resolve_merged_paths(&store, &paths, &mut unmerged, &mut merged, &writer)
                .await
                .unwrap();
        let names: Vec<String> = recreates
            .iter()
            .map(|op| match &op.kind {
                OpKind::Create { new_name, .. } => new_name.clone(),
                _ => String::new(),
            })
            .collect();
        assert_eq!(names, vec!["d".to_string(), "f".to_string()]);
        let mp = &merged_paths[&f1];
        assert_eq!(mp.to_string(), "/d/f");
        assert_eq!(mp.nodes[0].ptr, m1);
        // The merged rms of the recreated nodes are gone.
        let root_ops = &merged.chain(r0).unwrap().ops;
        assert!(root_ops.iter().all(|op| !matches!(op.kind, OpKind::Rm { .. })));
    }
}
