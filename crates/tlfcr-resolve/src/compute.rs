//! Turning the fixed-up chains into per-directory action lists.

use std::collections::HashMap;

use tracing::{debug, warn};

use tlfcr_core::{BlockPointer, CrError, CrResult};

use crate::actions::{collapse_actions, Action, ActionKind, ActionMap};
use crate::chains::{Chain, Chains};
use crate::merge_paths::MergedPaths;
use crate::ops::{write_ranges_equivalent, AttrChange};
use crate::path::NodePath;
use crate::renamer::ConflictRenamer;

/// Unmerged parent directory of a chain's node: from its unmerged path
/// when it has one, else from the final path of its first op.
fn unmerged_parent(by_tail: &HashMap<BlockPointer, &NodePath>, chain: &Chain) -> Option<BlockPointer> {
    if let Some(path) = by_tail.get(&chain.most_recent) {
        if path.len() > 1 {
            return Some(path.parent_path().tail_ptr());
        }
    }
    chain
        .ops
        .iter()
        .filter_map(|op| op.final_path.as_ref())
        .find(|p| p.len() > 1)
        .map(|p| p.parent_path().tail_ptr())
}

/// The actions one unmerged chain needs against its merged counterpart.
pub fn chain_actions(
    renamer: &dyn ConflictRenamer,
    chain: &Chain,
    merged_chain: Option<&Chain>,
    merged_path: &NodePath,
) -> CrResult<Vec<ActionKind>> {
    let mut actions = Vec::new();
    for op in &chain.ops {
        let mut conflict = false;
        if let Some(merged_chain) = merged_chain {
            for merged_op in &merged_chain.ops {
                if let Some(action) = op.check_conflict(renamer, merged_op, chain.is_file())? {
                    conflict = true;
                    actions.push(action);
                }
            }
        }
        if !conflict {
            actions.extend(op.default_action(merged_path)?);
        }
    }
    Ok(actions)
}

/// Build the action map: merged directory (or file, before collapsing)
/// pointer -> actions to apply there.
pub fn get_actions_to_merge(
    renamer: &dyn ConflictRenamer,
    unmerged: &mut Chains,
    merged: &Chains,
    unmerged_paths: &[NodePath],
    merged_paths: &MergedPaths,
) -> CrResult<ActionMap> {
    let by_tail: HashMap<BlockPointer, &NodePath> =
        unmerged_paths.iter().map(|p| (p.tail_ptr(), p)).collect();
    let mut most_recents = unmerged.most_recents();
    most_recents.sort();

    let mut action_map = ActionMap::new();
    for most_recent in most_recents {
        let Some(merged_path) = merged_paths.get(&most_recent) else {
            continue;
        };
        if !merged_path.is_valid() {
            warn!(%most_recent, "ignoring invalid merged path");
            continue;
        }
        let Some(chain) = unmerged.chain_by_most_recent_mut(most_recent) else {
            continue;
        };
        let merged_chain = merged.chain(chain.original);

        // Identical writes on both sides need no action.
        if chain.is_file() {
            if let Some(merged_chain) = merged_chain {
                if write_ranges_equivalent(
                    &chain.collapsed_write_range(),
                    &merged_chain.collapsed_write_range(),
                ) {
                    chain.remove_sync_ops();
                }
            }
        }

        let chain = &*chain;
        let kinds = chain_actions(renamer, chain, merged_chain, merged_path)?;
        if kinds.is_empty() {
            continue;
        }
        let unmerged_dir = if chain.is_file() {
            unmerged_parent(&by_tail, chain).ok_or_else(|| {
                CrError::inconsistent(format!("no unmerged parent for file {most_recent}"))
            })?
        } else {
            most_recent
        };
        action_map.insert(
            merged_path.tail_ptr(),
            kinds
                .into_iter()
                .map(|kind| Action::new(kind, most_recent, unmerged_dir))
                .collect(),
        );
    }
    Ok(action_map)
}

/// Move file actions (and directory mtime actions) up to the parent
/// directory, where they are applied, then collapse every list. Returns
/// unmerged parent paths that now have actions of their own.
pub fn collapse_action_map(
    unmerged: &Chains,
    unmerged_paths: &[NodePath],
    merged_paths: &mut MergedPaths,
    action_map: &mut ActionMap,
) -> Vec<NodePath> {
    let by_tail: HashMap<BlockPointer, &NodePath> =
        unmerged_paths.iter().map(|p| (p.tail_ptr(), p)).collect();
    let mut new_paths = Vec::new();

    for chain in unmerged.iter() {
        let most_recent = chain.most_recent;
        let Some(path) = merged_paths.get(&most_recent).cloned() else {
            continue;
        };
        if path.len() < 2 {
            continue;
        }
        let merged_tail = path.tail_ptr();

        let hoisted = if chain.is_file() {
            let mut actions = action_map.remove(&merged_tail).unwrap_or_default();
            for action in actions.iter_mut() {
                if let ActionKind::CopyUnmergedAttr { moved, .. } = &mut action.kind {
                    *moved = true;
                }
            }
            actions
        } else {
            let Some(actions) = action_map.get_mut(&merged_tail) else {
                continue;
            };
            let mut to_parent = Vec::new();
            let mut stay = Vec::new();
            for mut action in actions.drain(..) {
                let moved_up = match &mut action.kind {
                    ActionKind::CopyUnmergedAttr { attrs, moved, .. }
                        if attrs.first() == Some(&AttrChange::Mtime) && !*moved =>
                    {
                        *moved = true;
                        true
                    }
                    ActionKind::RenameUnmerged {
                        caused_by_attr: Some(AttrChange::Mtime),
                        moved,
                        ..
                    } if !*moved => {
                        *moved = true;
                        true
                    }
                    _ => false,
                };
                if moved_up {
                    to_parent.push(action);
                } else {
                    stay.push(action);
                }
            }
            if to_parent.is_empty() {
                *actions = stay;
                continue;
            }
            if stay.is_empty() {
                action_map.remove(&merged_tail);
            } else {
                action_map.insert(merged_tail, stay);
            }
            // The entry now lives in the parent on both sides.
            if let Some(parent) = unmerged_parent(&by_tail, chain) {
                for action in to_parent.iter_mut() {
                    action.source = parent;
                    action.unmerged_dir = parent;
                }
            }
            to_parent
        };

        let parent_path = path.parent_path();
        let merged_parent = parent_path.tail_ptr();
        let had_parent_actions = action_map.contains_key(&merged_parent);
        action_map.entry(merged_parent).or_default().extend(hoisted);
        if chain.is_file() {
            merged_paths.insert(most_recent, parent_path.clone());
        }
        if had_parent_actions {
            continue;
        }
        if let Some(unmerged_path) = by_tail.get(&most_recent) {
            let unmerged_parent_path = unmerged_path.parent_path();
            let unmerged_parent_ptr = unmerged_parent_path.tail_ptr();
            let parent_has_ops = unmerged
                .chain_by_most_recent(unmerged_parent_ptr)
                .is_some_and(|c| !c.ops.is_empty());
            if !chain.is_file() || parent_has_ops {
                new_paths.push(unmerged_parent_path);
            }
            if !chain.is_file() {
                merged_paths.insert(unmerged_parent_ptr, parent_path);
            }
        }
    }

    for actions in action_map.values_mut() {
        *actions = collapse_actions(std::mem::take(actions));
    }
    action_map.retain(|_, actions| !actions.is_empty());
    new_paths
}

/// Compute and collapse the action map for chains that already went
/// through the structural fixups. Returns the map and the unmerged parent
/// paths that collapsing gave actions to.
pub fn compute_actions(
    renamer: &dyn ConflictRenamer,
    unmerged: &mut Chains,
    merged: &Chains,
    unmerged_paths: &[NodePath],
    merged_paths: &mut MergedPaths,
) -> CrResult<(ActionMap, Vec<NodePath>)> {
    let mut action_map =
        get_actions_to_merge(renamer, unmerged, merged, unmerged_paths, merged_paths)?;
    let new_paths = collapse_action_map(unmerged, unmerged_paths, merged_paths, &mut action_map);
    debug!(
        dirs = action_map.len(),
        actions = action_map.values().map(Vec::len).sum::<usize>(),
        "computed actions"
    );
    Ok((action_map, new_paths))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::folder::RevisionMetadata;
    use crate::ops::{Op, WriteRange};
    use crate::path::PathNode;
    use crate::renamer::WriterRevisionRenamer;
    use tlfcr_core::types::EntryType;
    use tlfcr_core::{BranchId, Revision};
    use tlfcr_storage::BlockStore;

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

    fn path(branch: BranchId, nodes: &[(BlockPointer, &str)]) -> NodePath {
        NodePath::new(
            branch,
            nodes.iter().map(|(p, n)| PathNode::new(*p, *n)).collect(),
        )
    }

    #[test]
    fn test_unconflicted_create_copies_entry() {
        let (r0, u1, m1) = (ptr("r0"), ptr("u1"), ptr("m1"));
        let mut create = Op::create("new", r0, EntryType::File);
        create.add_update(r0, u1);
        create.add_ref(ptr("new"));
        let mut unmerged = Chains::build(unmerged_branch(), &[md(unmerged_branch(), u1, vec![create])]).unwrap();
        let mut other = Op::create("other", r0, EntryType::File);
        other.add_update(r0, m1);
        other.add_ref(ptr("other"));
        let merged = Chains::build(BranchId::Master, &[md(BranchId::Master, m1, vec![other])]).unwrap();

        let unmerged_paths = vec![path(unmerged_branch(), &[(u1, "")])];
        let mut merged_paths = MergedPaths::new();
        merged_paths.insert(u1, path(BranchId::Master, &[(m1, "")]));

        let renamer = WriterRevisionRenamer::default();
        let map = get_actions_to_merge(&renamer, &mut unmerged, &merged, &unmerged_paths, &merged_paths)
            .unwrap();
        let actions = &map[&m1];
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].source, u1);
        assert_eq!(actions[0].unmerged_dir, u1);
        assert!(matches!(
            &actions[0].kind,
            ActionKind::CopyUnmergedEntry { from, to, unique: false, .. } if from == "new" && to == "new"
        ));
    }

    #[tokio::test]
    async fn test_file_actions_move_to_parent() {
        let store = BlockStore::memory().unwrap();
        let (r0, u1, m1) = (ptr("r0"), ptr("u1"), ptr("m1"));
        let (f0, f1, mf1) = (ptr("f0"), ptr("f1"), ptr("mf1"));
        let mut sync = Op::sync(f0).with_writes(vec![WriteRange::write(0, 3)]);
        sync.add_update(f0, f1);
        sync.add_update(r0, u1);
        let mut unmerged =
            Chains::from_revisions(unmerged_branch(), &[md(unmerged_branch(), u1, vec![sync])], &store)
                .await
                .unwrap();
        assert!(unmerged.chain(f0).unwrap().is_file());
        let up = path(unmerged_branch(), &[(u1, ""), (f1, "f")]);
        for op in unmerged.chain_mut(f0).unwrap().ops.iter_mut() {
            op.final_path = Some(up.clone());
        }
        let mut msync = Op::sync(f0).with_writes(vec![WriteRange::write(5, 3)]);
        msync.add_update(f0, mf1);
        msync.add_update(r0, m1);
        let mut merged =
            Chains::from_revisions(BranchId::Master, &[md(BranchId::Master, m1, vec![msync])], &store)
                .await
                .unwrap();
        let mp = path(BranchId::Master, &[(m1, ""), (mf1, "f")]);
        for op in merged.chain_mut(f0).unwrap().ops.iter_mut() {
            op.final_path = Some(mp.clone());
        }

        let unmerged_paths = vec![up];
        let mut merged_paths = MergedPaths::new();
        merged_paths.insert(f1, mp);

        let renamer = WriterRevisionRenamer::default();
        let mut map =
            get_actions_to_merge(&renamer, &mut unmerged, &merged, &unmerged_paths, &merged_paths).unwrap();
        assert!(map.contains_key(&mf1));
        collapse_action_map(&unmerged, &unmerged_paths, &mut merged_paths, &mut map);

        assert!(!map.contains_key(&mf1));
        let actions = &map[&m1];
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].source, f1);
        assert_eq!(actions[0].unmerged_dir, u1);
        assert!(matches!(&actions[0].kind, ActionKind::RenameUnmerged { from, .. } if from == "f"));
        assert_eq!(merged_paths[&f1].tail_ptr(), m1);
    }

    #[test]
    fn test_dir_mtime_conflict_moves_to_parent() {
        let (r0, u1, m1) = (ptr("r0"), ptr("u1"), ptr("m1"));
        let d = ptr("d");
        let mut u_attr = Op::set_attr("d", r0, AttrChange::Mtime, d);
        u_attr.add_update(r0, u1);
        let mut unmerged = Chains::build(unmerged_branch(), &[md(unmerged_branch(), u1, vec![u_attr])]).unwrap();
        let up = path(unmerged_branch(), &[(u1, ""), (d, "d")]);
        for op in unmerged.chain_mut(d).unwrap().ops.iter_mut() {
            op.final_path = Some(up.clone());
        }
        let mut m_attr = Op::set_attr("d", r0, AttrChange::Mtime, d);
        m_attr.add_update(r0, m1);
        let mut merged = Chains::build(BranchId::Master, &[md(BranchId::Master, m1, vec![m_attr])]).unwrap();
        let mp = path(BranchId::Master, &[(m1, ""), (d, "d")]);
        for op in merged.chain_mut(d).unwrap().ops.iter_mut() {
            op.final_path = Some(mp.clone());
        }

        let unmerged_paths = vec![up];
        let mut merged_paths = MergedPaths::new();
        merged_paths.insert(d, mp);
        let renamer = WriterRevisionRenamer::default();
        let mut map =
            get_actions_to_merge(&renamer, &mut unmerged, &merged, &unmerged_paths, &merged_paths).unwrap();
        let new_paths = collapse_action_map(&unmerged, &unmerged_paths, &mut merged_paths, &mut map);

        let actions = &map[&m1];
        assert_eq!(actions.len(), 1);
        assert_eq!(actions[0].source, u1);
        assert_eq!(actions[0].unmerged_dir, u1);
        match &actions[0].kind {
            ActionKind::RenameUnmerged {
                sym_path, moved, ..
            } => {
                assert_eq!(sym_path.as_deref(), Some("d"));
                assert!(*moved);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(new_paths.len(), 1);
        assert_eq!(new_paths[0].tail_ptr(), u1);
        assert_eq!(merged_paths[&u1].tail_ptr(), m1);
        assert!(unmerged.chain(d).unwrap().ops.iter().all(|op| op.is_set_attr()));
    }
}
