//! Merge actions.
//!
//! An [`Action`] is one change to a merged directory block that lets an
//! unmerged change survive on top of the merged branch. Executing it
//! edits the directory; [`Action::update_ops`] then rewrites the op
//! chains of both branches so the resolved revision and the local
//! notifications describe what actually happened.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tlfcr_core::types::{Block, DirBlock, DirEntry, EntryType};
use tlfcr_core::{BlockPointer, CrError, CrResult};
use tlfcr_storage::{BlockPutState, BlockStore};

use crate::chains::Chains;
use crate::ops::{AttrChange, Op, OpId, OpKind};
use crate::renamer::uniquify_name;

/// Actions to run against each merged directory, keyed by the merged
/// directory's pointer.
pub type ActionMap = HashMap<BlockPointer, Vec<Action>>;

#[derive(Debug, Clone)]
pub enum ActionKind {
    /// Copy the unmerged entry `from` into the merged directory as `to`.
    CopyUnmergedEntry {
        from: String,
        to: String,
        sym_path: Option<String>,
        /// Only the size and pointer change; other merged attributes stay.
        size_only: bool,
        /// Pick a free name if `to` is taken.
        unique: bool,
        /// Real unmerged entry, when the source block was swapped.
        unmerged_entry: Option<DirEntry>,
        attrs: Vec<AttrChange>,
    },
    /// Copy the given attributes of `from` onto the merged entry `to`.
    CopyUnmergedAttr {
        from: String,
        to: String,
        attrs: Vec<AttrChange>,
        moved: bool,
    },
    RmMergedEntry { name: String },
    /// Copy the unmerged entry under a new name, keeping the merged one.
    RenameUnmerged {
        from: String,
        to: String,
        sym_path: Option<String>,
        caused_by_attr: Option<AttrChange>,
        moved: bool,
        unmerged_parent_most_recent: BlockPointer,
        merged_parent_most_recent: BlockPointer,
    },
    /// Move the merged entry out of the way and put the unmerged one in
    /// its place.
    RenameMerged {
        from: String,
        to: String,
        sym_path: Option<String>,
    },
    /// Forget an unmerged op.
    DropUnmerged { op: Box<Op> },
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionKind::CopyUnmergedEntry { from, to, .. } => {
                write!(f, "copyUnmergedEntry: {from} -> {to}")
            }
            ActionKind::CopyUnmergedAttr {
                from, to, attrs, ..
            } => write!(f, "copyUnmergedAttr: {from} -> {to} ({attrs:?})"),
            ActionKind::RmMergedEntry { name } => write!(f, "rmMergedEntry: {name}"),
            ActionKind::RenameUnmerged { from, to, .. } => {
                write!(f, "renameUnmerged: {from} -> {to}")
            }
            ActionKind::RenameMerged { from, to, .. } => {
                write!(f, "renameMerged: {from} -> {to}")
            }
            ActionKind::DropUnmerged { op } => write!(f, "dropUnmerged: {op}"),
        }
    }
}

/// An action plus the unmerged context it came from.
#[derive(Debug, Clone)]
pub struct Action {
    pub kind: ActionKind,
    /// Most recent pointer of the unmerged chain whose ops get rewritten.
    pub source: BlockPointer,
    /// Unmerged directory that `from` names are looked up in.
    pub unmerged_dir: BlockPointer,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.kind.fmt(f)
    }
}

/// Which block an action reads its unmerged entries from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceDir {
    Unmerged,
    /// The merged directory the action is applied to.
    Merged,
    /// A clean merged block somewhere else in the tree.
    Other(BlockPointer),
}

/// Copies file blocks into the pending put set, for entries that enter
/// the merged branch under a new identity.
pub struct FileCopier<'a> {
    store: &'a BlockStore,
    put_state: &'a mut BlockPutState,
}

impl<'a> FileCopier<'a> {
    pub fn new(store: &'a BlockStore, put_state: &'a mut BlockPutState) -> Self {
        FileCopier { store, put_state }
    }

    pub async fn copy(&mut self, ptr: BlockPointer) -> CrResult<BlockPointer> {
        let block = match self.put_state.get(ptr) {
            Some(block) => block?,
            None => self.store.get(ptr).await?,
        };
        let file = block.into_file(ptr)?;
        self.put_state.add(&Block::File(file))
    }
}

impl Action {
    pub fn new(kind: ActionKind, source: BlockPointer, unmerged_dir: BlockPointer) -> Self {
        Action {
            kind,
            source,
            unmerged_dir,
        }
    }

    /// Decide where the action's unmerged entry really lives. An entry
    /// that the unmerged branch only touched through setAttrs, and that
    /// the merged branch changed, is read from the merged branch instead.
    pub fn swap_unmerged_block(
        &mut self,
        unmerged: &Chains,
        merged: &Chains,
        unmerged_dir: &DirBlock,
    ) -> CrResult<SourceDir> {
        let ActionKind::CopyUnmergedEntry {
            from,
            sym_path,
            size_only,
            unmerged_entry,
            attrs,
            ..
        } = &mut self.kind
        else {
            return Ok(SourceDir::Unmerged);
        };
        if sym_path.is_some() {
            return Ok(SourceDir::Unmerged);
        }

        let entry = unmerged_dir.lookup(self.unmerged_dir, from)?.clone();
        let mut ptr = entry.ptr;
        if let Some(chain) = unmerged.chain_by_most_recent(ptr) {
            for op in &chain.ops {
                match &op.kind {
                    OpKind::SetAttr { attr, .. } => attrs.push(*attr),
                    _ => return Ok(SourceDir::Unmerged),
                }
            }
            ptr = chain.original;
        }
        if merged.chain(ptr).is_none() || merged.is_deleted(ptr) {
            return Ok(SourceDir::Unmerged);
        }

        *unmerged_entry = Some(entry);
        *size_only = true;
        let (parent_original, name) = match merged.renamed_parent_and_name(ptr) {
            Some(found) => found,
            None => match unmerged.renamed_originals.get(&ptr) {
                // Same place in both branches.
                None => return Ok(SourceDir::Merged),
                Some(ri) => (ri.original_old_parent, ri.old_name.clone()),
            },
        };
        *from = name;
        Ok(SourceDir::Other(
            merged.most_recent_from_original_or_same(parent_original),
        ))
    }

    /// Apply the action to `merged_dir`. Returns pointers the merged
    /// directory no longer references.
    pub async fn apply(
        &mut self,
        files: &mut FileCopier<'_>,
        unmerged_dir: &DirBlock,
        merged_dir: &mut DirBlock,
    ) -> CrResult<Vec<BlockPointer>> {
        let dir_ptr = self.unmerged_dir;
        match &mut self.kind {
            ActionKind::CopyUnmergedEntry {
                from,
                to,
                sym_path,
                size_only,
                unique,
                unmerged_entry,
                attrs,
            } => {
                let mut entry = unmerged_dir.lookup(dir_ptr, from)?.clone();
                if let Some(target) = sym_path {
                    entry = DirEntry {
                        mtime: entry.mtime,
                        ..DirEntry::symlink(target.clone())
                    };
                }
                if *unique {
                    *to = uniquify_name(merged_dir, to)?;
                }

                if *size_only {
                    if let Some(mut merged_entry) = merged_dir.get(to).cloned() {
                        merged_entry.size = entry.size;
                        merged_entry.ptr = entry.ptr;
                        if let Some(real) = unmerged_entry {
                            for attr in attrs.iter() {
                                match attr {
                                    AttrChange::Exec => merged_entry.entry_type = real.entry_type,
                                    AttrChange::Mtime => merged_entry.mtime = real.mtime,
                                    AttrChange::Size => {}
                                }
                            }
                        }
                        return Ok(merged_dir.set_entry(to, merged_entry).into_iter().collect());
                    }
                }
                Ok(merged_dir.set_entry(to, entry).into_iter().collect())
            }
            ActionKind::CopyUnmergedAttr {
                from, to, attrs, ..
            } => {
                let unmerged_entry = unmerged_dir.lookup(dir_ptr, from)?;
                let mut merged_entry = merged_dir.lookup(BlockPointer::ZERO, to)?.clone();
                for attr in attrs.iter() {
                    match attr {
                        AttrChange::Exec => merged_entry.entry_type = unmerged_entry.entry_type,
                        AttrChange::Mtime => merged_entry.mtime = unmerged_entry.mtime,
                        AttrChange::Size => {
                            merged_entry.size = unmerged_entry.size;
                            merged_entry.ptr = unmerged_entry.ptr;
                        }
                    }
                }
                Ok(merged_dir.set_entry(to, merged_entry).into_iter().collect())
            }
            ActionKind::RmMergedEntry { name } => Ok(merged_dir
                .remove_entry(name)
                .map(|e| e.ptr)
                .filter(|p| p.is_initialized())
                .into_iter()
                .collect()),
            ActionKind::RenameUnmerged {
                from, to, sym_path, ..
            } => {
                let mut entry = unmerged_dir.lookup(dir_ptr, from)?.clone();
                if let Some(target) = sym_path {
                    entry = DirEntry {
                        mtime: entry.mtime,
                        ..DirEntry::symlink(target.clone())
                    };
                }
                if entry.entry_type == EntryType::Dir {
                    return Err(CrError::NotFileBlock(entry.ptr));
                }
                *to = uniquify_name(merged_dir, to)?;
                if sym_path.is_none() && entry.ptr.is_initialized() {
                    entry.ptr = files.copy(entry.ptr).await?;
                }
                Ok(merged_dir.set_entry(to, entry).into_iter().collect())
            }
            ActionKind::RenameMerged { from, to, sym_path } => {
                let merged_entry = merged_dir.lookup(BlockPointer::ZERO, from)?.clone();
                *to = uniquify_name(merged_dir, to)?;
                let unrefs: Vec<BlockPointer> =
                    merged_dir.set_entry(to, merged_entry).into_iter().collect();
                let mut entry = unmerged_dir.lookup(dir_ptr, from)?.clone();
                if let Some(target) = sym_path {
                    entry = DirEntry {
                        mtime: entry.mtime,
                        ..DirEntry::symlink(target.clone())
                    };
                }
                // The merged entry now lives under `to`; overwriting
                // `from` doesn't drop it.
                let _ = merged_dir.set_entry(from, entry);
                Ok(unrefs)
            }
            ActionKind::DropUnmerged { .. } => Ok(Vec::new()),
        }
    }

    /// Rewrite the chains of both branches after the action ran.
    /// `merged_dir` is the merged directory after every action in its
    /// list was applied.
    pub fn update_ops(
        &self,
        unmerged_dir: &DirBlock,
        merged_dir: &DirBlock,
        unmerged: &mut Chains,
        merged: &mut Chains,
    ) -> CrResult<()> {
        let source = self.source;
        let is_file = unmerged
            .chain_by_most_recent(source)
            .ok_or(CrError::NoChainFound(source))?
            .is_file();
        let merged_most_recent =
            merged.most_recent_from_original_or_same(unmerged.original_from_most_recent_or_same(source));

        match &self.kind {
            ActionKind::CopyUnmergedEntry {
                from,
                to,
                sym_path,
                unique,
                ..
            } => {
                if sym_path.is_some() && !is_file {
                    add_symlink_create(merged, merged_most_recent, to)?;
                }
                if from != to {
                    fixup_names_in_ops(unmerged, source, from, to);
                    if *unique || sym_path.is_some() {
                        let entry = merged_dir.lookup(merged_most_recent, to)?;
                        let rename = Op::rename(
                            from.clone(),
                            merged_most_recent,
                            to.clone(),
                            merged_most_recent,
                            entry.ptr,
                            entry.entry_type,
                        );
                        merged.prepend_ops(merged_most_recent, vec![rename])?;
                    }
                }
                let target = merged_dir.lookup(merged_most_recent, to)?.ptr;
                track_sync_ptr_changes_in_create(unmerged, target, source, to);
                Ok(())
            }
            ActionKind::CopyUnmergedAttr { from, to, .. } => {
                if from != to {
                    fixup_names_in_ops(unmerged, source, from, to);
                }
                Ok(())
            }
            ActionKind::RmMergedEntry { .. } => Ok(()),
            ActionKind::RenameUnmerged {
                from,
                to,
                sym_path,
                unmerged_parent_most_recent,
                merged_parent_most_recent,
                ..
            } => {
                let unmerged_entry = unmerged_dir.lookup(self.unmerged_dir, from)?.clone();
                let original = unmerged.original_from_most_recent_or_same(unmerged_entry.ptr);
                if sym_path.is_some() && !is_file {
                    add_symlink_create(merged, merged_most_recent, to)?;
                }
                fixup_names_in_ops(unmerged, source, from, to);
                let new_entry = merged_dir.lookup(merged_most_recent, to)?.clone();

                let mut chain_ptr = source;
                let mut merged_ptr = merged_most_recent;
                if is_file {
                    redirect_file_ops(unmerged, source, original, new_entry.ptr);
                    if !unmerged_parent_most_recent.is_initialized() {
                        return Ok(());
                    }
                    if !unmerged.has_most_recent(*unmerged_parent_most_recent) {
                        return Err(CrError::NoChainFound(*unmerged_parent_most_recent));
                    }
                    chain_ptr = *unmerged_parent_most_recent;
                    merged_ptr = *merged_parent_most_recent;
                }

                let merged_entry = merged_dir.lookup(merged_ptr, from)?.clone();
                let merged_rename = merged.renamed_originals.contains_key(&original);
                if to == from && merged_rename {
                    // The merged copy is the one that moved: its rename
                    // becomes a plain create.
                    let chain_original = unmerged.original_from_most_recent_or_same(chain_ptr);
                    remove_rm_op_from_chain(merged, chain_original, to);
                    if sym_path.is_none() {
                        let mut sync = Op::sync(unmerged_entry.ptr);
                        sync.add_update(unmerged_entry.ptr, new_entry.ptr);
                        merged.prepend_ops(unmerged_entry.ptr, vec![sync])?;
                    }
                } else {
                    let mut rename = Op::rename(
                        from.clone(),
                        merged_ptr,
                        to.clone(),
                        merged_ptr,
                        new_entry.ptr,
                        new_entry.entry_type,
                    );
                    if sym_path.is_none() {
                        rename.add_update(unmerged_entry.ptr, new_entry.ptr);
                    }
                    let create = Op::create(from.clone(), merged_ptr, merged_entry.entry_type);
                    merged.prepend_ops(merged_ptr, vec![rename, create])?;
                }

                let chain = unmerged
                    .chain_by_most_recent_mut(chain_ptr)
                    .ok_or(CrError::NoChainFound(chain_ptr))?;
                let existing = chain.ops.iter().position(
                    |op| matches!(&op.kind, OpKind::Create { new_name, .. } if new_name == to),
                );
                let create_idx = match existing {
                    Some(idx) => {
                        if let Some(first) = chain.ops[idx].refs.first_mut() {
                            *first = new_entry.ptr;
                        }
                        idx
                    }
                    None => {
                        let mut create = Op::create(to.clone(), chain_ptr, merged_entry.entry_type);
                        if sym_path.is_none() {
                            create.add_ref(new_entry.ptr);
                        }
                        unmerged.prepend_ops(chain_ptr, vec![create])?;
                        0
                    }
                };
                // A copy under a new name leaves the old block behind.
                if unmerged_entry.ptr != new_entry.ptr && from != to && sym_path.is_none() {
                    if let Some(chain) = unmerged.chain_by_most_recent_mut(chain_ptr) {
                        if let Some(create) = chain.ops.get_mut(create_idx) {
                            create.add_unref(unmerged_entry.ptr);
                        }
                    }
                    let orig = unmerged.original_of(unmerged_entry.ptr);
                    unmerged.mark_deleted(orig);
                }
                Ok(())
            }
            ActionKind::RenameMerged { from, to, sym_path } => {
                if sym_path.is_some() && !is_file {
                    add_symlink_create(merged, merged_most_recent, from)?;
                }
                let has_merged_chain = merged.has_most_recent(merged_most_recent);
                if has_merged_chain {
                    fixup_names_in_ops(merged, merged_most_recent, from, to);
                }
                if is_file {
                    return Ok(());
                }
                let merged_entry = merged_dir.lookup(merged_most_recent, to)?.clone();
                let rename = Op::rename(
                    from.clone(),
                    source,
                    to.clone(),
                    source,
                    merged_entry.ptr,
                    merged_entry.entry_type,
                );
                unmerged.prepend_ops(source, vec![rename])?;

                let found = merged.chain_by_most_recent(merged_most_recent).is_some_and(|c| {
                    c.ops.iter().any(
                        |op| matches!(&op.kind, OpKind::Create { new_name, .. } if new_name == to),
                    )
                });
                if !found {
                    let create = Op::create(to.clone(), merged_most_recent, merged_entry.entry_type);
                    merged.prepend_ops(merged_most_recent, vec![create])?;
                }
                Ok(())
            }
            ActionKind::DropUnmerged { op } => {
                let chain = unmerged
                    .chain_by_most_recent_mut(source)
                    .ok_or(CrError::NoChainFound(source))?;
                let Some(idx) = chain.ops.iter().position(|o| o.same_op(op)) else {
                    return Ok(());
                };
                chain.ops.remove(idx);
                let inverted = op.invert_for_local_notifications();
                merged.prepend_ops(merged_most_recent, vec![inverted])
            }
        }
    }
}

// ── Chain rewriting helpers ──────────────────────────────────────────────────

/// Rename creates and setAttrs of `from` to `to` in one chain, keeping
/// the rename bookkeeping of renamed creates in step.
pub fn fixup_names_in_ops(chains: &mut Chains, most_recent: BlockPointer, from: &str, to: &str) {
    let mut renamed = Vec::new();
    if let Some(chain) = chains.chain_by_most_recent_mut(most_recent) {
        for op in chain.ops.iter_mut() {
            match &mut op.kind {
                OpKind::Create {
                    new_name,
                    renamed: was_renamed,
                    ..
                } if new_name == from => {
                    *new_name = to.to_string();
                    if *was_renamed {
                        renamed.extend(op.refs.first().copied());
                    }
                }
                OpKind::SetAttr { name, .. } if name == from => *name = to.to_string(),
                _ => {}
            }
        }
    }
    for ptr in renamed {
        let original = chains.original_of(ptr);
        if let Some(info) = chains.renamed_originals.get_mut(&original) {
            info.new_name = to.to_string();
        }
    }
}

/// Record a symlink create at the end of a merged chain.
fn add_symlink_create(merged: &mut Chains, most_recent: BlockPointer, name: &str) -> CrResult<()> {
    let mut create = Op::create(name, most_recent, EntryType::Sym);
    match merged.chain_by_most_recent_mut(most_recent) {
        Some(chain) => {
            chain.ensure_path(&mut create, most_recent);
            chain.ops.push(create);
            Ok(())
        }
        None => merged.prepend_ops(most_recent, vec![create]),
    }
}

/// Point the syncs and setAttrs of `original` at the copied file.
fn redirect_file_ops(
    unmerged: &mut Chains,
    most_recent: BlockPointer,
    original: BlockPointer,
    new_ptr: BlockPointer,
) {
    let targets: Vec<(usize, bool)> = match unmerged.chain_by_most_recent(most_recent) {
        Some(chain) => chain
            .ops
            .iter()
            .enumerate()
            .filter_map(|(i, op)| match &op.kind {
                OpKind::Sync { file, .. } => {
                    (unmerged.original_of(file.ref_) == original).then_some((i, true))
                }
                OpKind::SetAttr { file, .. } => {
                    (unmerged.original_of(*file) == original).then_some((i, false))
                }
                _ => None,
            })
            .collect(),
        None => return,
    };
    let Some(chain) = unmerged.chain_by_most_recent_mut(most_recent) else {
        return;
    };
    for (i, is_sync) in targets {
        let op = &mut chain.ops[i];
        match &mut op.kind {
            OpKind::Sync { file, .. } if is_sync => {
                file.unref = new_ptr;
                file.ref_ = new_ptr;
                op.refs.clear();
            }
            OpKind::SetAttr { file, .. } => *file = new_ptr,
            _ => {}
        }
    }
}

/// Drop every rm of `name` from the chain of `original`.
fn remove_rm_op_from_chain(chains: &mut Chains, original: BlockPointer, name: &str) {
    if let Some(chain) = chains.chain_mut(original) {
        chain
            .ops
            .retain(|op| !matches!(&op.kind, OpKind::Rm { old_name, .. } if old_name == name));
    }
}

/// A create for a file the branch also wrote must carry the blocks its
/// syncs referenced.
fn track_sync_ptr_changes_in_create(
    unmerged: &mut Chains,
    target: BlockPointer,
    chain_ptr: BlockPointer,
    name: &str,
) {
    let mut refs = Vec::new();
    let mut unrefs = Vec::new();
    if let Some(target_chain) = unmerged.chain_by_most_recent(target) {
        if target_chain.is_file() {
            for op in &target_chain.ops {
                let OpKind::Sync { file, .. } = &op.kind else {
                    continue;
                };
                refs.extend(op.refs.iter().copied().filter(|r| !unmerged.is_deleted(*r)));
                unrefs.extend(op.unrefs.iter().copied());
                if unmerged.has_most_recent(file.ref_) && !unmerged.is_deleted(file.ref_) {
                    refs.push(file.ref_);
                }
            }
        }
    }
    if refs.is_empty() {
        return;
    }
    let Some(chain) = unmerged.chain_by_most_recent_mut(chain_ptr) else {
        return;
    };
    if let Some(create) = chain
        .ops
        .iter_mut()
        .find(|op| matches!(&op.kind, OpKind::Create { new_name, .. } if new_name == name))
    {
        create.refs.extend(refs);
        create.unrefs.extend(unrefs);
    }
}

// ── Collapsing ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CollapseKey {
    Unmerged(String),
    Merged(String),
}

/// Reduce an action list so each entry name is handled by at most one
/// effective action. Per unmerged name, a rename of the unmerged entry
/// beats a copy of it, which beats an attribute copy; later actions of
/// the same rank replace earlier ones and attribute copies merge.
/// Removals are always kept.
pub fn collapse_actions(actions: Vec<Action>) -> Vec<Action> {
    let mut slots: Vec<Option<Action>> = actions.into_iter().map(Some).collect();
    let mut top: HashMap<CollapseKey, usize> = HashMap::new();

    for i in 0..slots.len() {
        let (key, new_attrs) = match slots[i].as_ref().map(|a| &a.kind) {
            Some(ActionKind::RenameUnmerged { from, .. }) => {
                let key = CollapseKey::Unmerged(from.clone());
                set_top(&mut slots, &mut top, key, i);
                continue;
            }
            Some(ActionKind::RenameMerged { from, .. }) => {
                let key = CollapseKey::Merged(from.clone());
                set_top(&mut slots, &mut top, key, i);
                continue;
            }
            Some(ActionKind::CopyUnmergedEntry { from, .. }) => {
                (CollapseKey::Unmerged(from.clone()), None)
            }
            Some(ActionKind::CopyUnmergedAttr { from, attrs, .. }) => {
                (CollapseKey::Unmerged(from.clone()), Some(attrs.clone()))
            }
            _ => continue,
        };

        let prev = top.get(&key).copied();
        let prev_rank = prev
            .and_then(|p| slots[p].as_ref())
            .map(|a| match a.kind {
                ActionKind::RenameUnmerged { .. } => Rank::Rename,
                ActionKind::CopyUnmergedEntry { .. } => Rank::Copy,
                _ => Rank::Attr,
            });
        match (prev_rank, new_attrs) {
            (Some(Rank::Rename), _) | (Some(Rank::Copy), Some(_)) => slots[i] = None,
            (Some(Rank::Attr), Some(new_attrs)) => {
                if let Some(ActionKind::CopyUnmergedAttr { attrs, .. }) =
                    prev.and_then(|p| slots[p].as_mut()).map(|a| &mut a.kind)
                {
                    for attr in new_attrs {
                        if !attrs.contains(&attr) {
                            attrs.push(attr);
                        }
                    }
                }
                slots[i] = None;
            }
            _ => set_top(&mut slots, &mut top, key, i),
        }
    }

    let mut seen_drops: HashSet<OpId> = HashSet::new();
    slots
        .into_iter()
        .flatten()
        .filter(|a| match &a.kind {
            ActionKind::DropUnmerged { op } => seen_drops.insert(op.id()),
            _ => true,
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rank {
    Rename,
    Copy,
    Attr,
}

fn set_top(
    slots: &mut [Option<Action>],
    top: &mut HashMap<CollapseKey, usize>,
    key: CollapseKey,
    index: usize,
) {
    if let Some(prev) = top.insert(key, index) {
        slots[prev] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfcr_core::types::FileBlock;
    use tlfcr_core::BranchId;

    fn ptr(tag: &str) -> BlockPointer {
        BlockPointer::derive(tag.as_bytes(), b"")
    }

    fn copy(from: &str, to: &str) -> ActionKind {
        ActionKind::CopyUnmergedEntry {
            from: from.into(),
            to: to.into(),
            sym_path: None,
            size_only: false,
            unique: false,
            unmerged_entry: None,
            attrs: Vec::new(),
        }
    }

    fn attr(from: &str, a: AttrChange) -> ActionKind {
        ActionKind::CopyUnmergedAttr {
            from: from.into(),
            to: from.into(),
            attrs: vec![a],
            moved: false,
        }
    }

    fn action(kind: ActionKind) -> Action {
        Action::new(kind, ptr("d"), ptr("d"))
    }

    fn file_entry(tag: &str, size: u64) -> DirEntry {
        DirEntry {
            size,
            ..DirEntry::new(ptr(tag), EntryType::File)
        }
    }

    #[tokio::test]
    async fn test_copy_entry_with_unique_name() {
        let store = BlockStore::memory().unwrap();
        let mut puts = BlockPutState::new();
        let mut files = FileCopier::new(&store, &mut puts);

        let mut unmerged = DirBlock::new();
        unmerged.set_entry("a", file_entry("ua", 3));
        let mut merged = DirBlock::new();
        merged.set_entry("a", file_entry("ma", 5));

        let mut act = action(ActionKind::CopyUnmergedEntry {
            from: "a".into(),
            to: "a".into(),
            sym_path: None,
            size_only: false,
            unique: true,
            unmerged_entry: None,
            attrs: Vec::new(),
        });
        let unrefs = act.apply(&mut files, &unmerged, &mut merged).await.unwrap();
        assert!(unrefs.is_empty());
        assert_eq!(merged.get("a").unwrap().ptr, ptr("ma"));
        assert_eq!(merged.get("a (2)").unwrap().ptr, ptr("ua"));
        assert!(matches!(act.kind, ActionKind::CopyUnmergedEntry { ref to, .. } if to == "a (2)"));
    }

    #[tokio::test]
    async fn test_rm_merged_entry_ignores_missing() {
        let store = BlockStore::memory().unwrap();
        let mut puts = BlockPutState::new();
        let mut files = FileCopier::new(&store, &mut puts);
        let mut merged = DirBlock::new();
        merged.set_entry("x", file_entry("x", 1));

        let mut rm = action(ActionKind::RmMergedEntry { name: "x".into() });
        let unrefs = rm.apply(&mut files, &DirBlock::new(), &mut merged).await.unwrap();
        assert_eq!(unrefs, vec![ptr("x")]);
        let unrefs = rm.apply(&mut files, &DirBlock::new(), &mut merged).await.unwrap();
        assert!(unrefs.is_empty());
    }

    #[tokio::test]
    async fn test_rename_unmerged_copies_file_block() {
        let store = BlockStore::memory().unwrap();
        let file = store
            .put(&Block::File(FileBlock {
                contents: b"mine".to_vec(),
            }))
            .await
            .unwrap();
        let mut puts = BlockPutState::new();
        let mut unmerged = DirBlock::new();
        unmerged.set_entry("f", DirEntry::new(file, EntryType::File));
        let mut merged = DirBlock::new();
        merged.set_entry("f", file_entry("theirs", 4));

        let mut act = action(ActionKind::RenameUnmerged {
            from: "f".into(),
            to: "f.conflict".into(),
            sym_path: None,
            caused_by_attr: None,
            moved: false,
            unmerged_parent_most_recent: BlockPointer::ZERO,
            merged_parent_most_recent: BlockPointer::ZERO,
        });
        {
            let mut files = FileCopier::new(&store, &mut puts);
            act.apply(&mut files, &unmerged, &mut merged).await.unwrap();
        }
        let copied = merged.get("f.conflict").unwrap().ptr;
        assert_ne!(copied, file);
        assert_eq!(puts.ptrs(), vec![copied]);
        assert_eq!(merged.get("f").unwrap().ptr, ptr("theirs"));
    }

    #[tokio::test]
    async fn test_rename_unmerged_rejects_directories() {
        let store = BlockStore::memory().unwrap();
        let mut puts = BlockPutState::new();
        let mut files = FileCopier::new(&store, &mut puts);
        let mut unmerged = DirBlock::new();
        unmerged.set_entry("d", DirEntry::new(ptr("d"), EntryType::Dir));
        let mut act = action(ActionKind::RenameUnmerged {
            from: "d".into(),
            to: "d2".into(),
            sym_path: None,
            caused_by_attr: None,
            moved: false,
            unmerged_parent_most_recent: BlockPointer::ZERO,
            merged_parent_most_recent: BlockPointer::ZERO,
        });
        let err = act.apply(&mut files, &unmerged, &mut DirBlock::new()).await.unwrap_err();
        assert!(matches!(err, CrError::NotFileBlock(_)));
    }

    #[tokio::test]
    async fn test_rename_merged_makes_room() {
        let store = BlockStore::memory().unwrap();
        let mut puts = BlockPutState::new();
        let mut files = FileCopier::new(&store, &mut puts);
        let mut unmerged = DirBlock::new();
        unmerged.set_entry("x", DirEntry::new(ptr("udir"), EntryType::Dir));
        let mut merged = DirBlock::new();
        merged.set_entry("x", file_entry("mfile", 2));

        let mut act = action(ActionKind::RenameMerged {
            from: "x".into(),
            to: "x.conflict".into(),
            sym_path: None,
        });
        act.apply(&mut files, &unmerged, &mut merged).await.unwrap();
        assert_eq!(merged.get("x").unwrap().entry_type, EntryType::Dir);
        assert_eq!(merged.get("x.conflict").unwrap().ptr, ptr("mfile"));
    }

    #[test]
    fn test_copy_attr_applies_only_named_attrs() {
        let mut unmerged = DirBlock::new();
        unmerged.set_entry(
            "f",
            DirEntry {
                mtime: 99,
                ..DirEntry::new(ptr("uf"), EntryType::Exec)
            },
        );
        let mut merged = DirBlock::new();
        merged.set_entry("f", file_entry("mf", 7));
        let mut act = action(attr("f", AttrChange::Exec));
        let store = BlockStore::memory().unwrap();
        let mut puts = BlockPutState::new();
        let mut files = FileCopier::new(&store, &mut puts);
        tokio_test::block_on(act.apply(&mut files, &unmerged, &mut merged)).unwrap();
        let entry = merged.get("f").unwrap();
        assert_eq!(entry.entry_type, EntryType::Exec);
        assert_eq!(entry.mtime, 0);
        assert_eq!(entry.ptr, ptr("mf"));
    }

    #[test]
    fn test_collapse_later_copy_wins() {
        let out = collapse_actions(vec![action(copy("a", "a")), action(copy("a", "b"))]);
        assert_eq!(out.len(), 1);
        assert!(matches!(&out[0].kind, ActionKind::CopyUnmergedEntry { to, .. } if to == "b"));
    }

    #[test]
    fn test_collapse_copy_subsumes_attrs() {
        let out = collapse_actions(vec![
            action(copy("a", "a")),
            action(attr("a", AttrChange::Exec)),
            action(ActionKind::RmMergedEntry { name: "a".into() }),
        ]);
        assert_eq!(out.len(), 2);
        assert!(matches!(out[0].kind, ActionKind::CopyUnmergedEntry { .. }));
        assert!(matches!(out[1].kind, ActionKind::RmMergedEntry { .. }));
    }

    #[test]
    fn test_collapse_merges_attr_copies() {
        let out = collapse_actions(vec![
            action(attr("a", AttrChange::Exec)),
            action(attr("a", AttrChange::Mtime)),
            action(attr("a", AttrChange::Exec)),
        ]);
        assert_eq!(out.len(), 1);
        match &out[0].kind {
            ActionKind::CopyUnmergedAttr { attrs, .. } => {
                assert_eq!(attrs, &vec![AttrChange::Exec, AttrChange::Mtime])
            }
            other => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn test_collapse_copy_replaces_attr() {
        let out = collapse_actions(vec![action(attr("a", AttrChange::Exec)), action(copy("a", "a"))]);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].kind, ActionKind::CopyUnmergedEntry { .. }));
    }

    #[test]
    fn test_collapse_rename_unmerged_absorbs_copy() {
        let rename = ActionKind::RenameUnmerged {
            from: "a".into(),
            to: "a.c".into(),
            sym_path: None,
            caused_by_attr: None,
            moved: false,
            unmerged_parent_most_recent: BlockPointer::ZERO,
            merged_parent_most_recent: BlockPointer::ZERO,
        };
        let out = collapse_actions(vec![action(rename), action(copy("a", "a"))]);
        assert_eq!(out.len(), 1);
        assert!(matches!(out[0].kind, ActionKind::RenameUnmerged { .. }));
    }

    #[test]
    fn test_collapse_dedups_drops() {
        let rm = Op::rm("x", ptr("d"));
        let drop = || {
            action(ActionKind::DropUnmerged {
                op: Box::new(rm.clone()),
            })
        };
        assert_eq!(collapse_actions(vec![drop(), drop()]).len(), 1);
    }

    #[test]
    fn test_fixup_names_updates_rename_info() {
        let (r0, r1) = (ptr("r0"), ptr("r1"));
        let x = ptr("x");
        let mut ren = Op::rename("a", r0, "b", r0, x, EntryType::File);
        ren.add_update(r0, r1);
        let md = crate::folder::RevisionMetadata {
            revision: tlfcr_core::Revision(2),
            branch: BranchId::Master,
            root: r1,
            writer: "u".into(),
            ops: vec![ren],
        };
        let mut chains = Chains::build(BranchId::Master, &[md]).unwrap();
        fixup_names_in_ops(&mut chains, r1, "b", "c");
        assert_eq!(chains.renamed_originals[&x].new_name, "c");
        let names: Vec<String> = chains
            .chain(r0)
            .unwrap()
            .ops
            .iter()
            .filter_map(|op| match &op.kind {
                OpKind::Create { new_name, .. } => Some(new_name.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(names, vec!["c".to_string()]);
    }

    #[test]
    fn test_drop_unmerged_moves_inverse_to_merged() {
        let (r0, r1) = (ptr("r0"), ptr("r1"));
        let mut rm = Op::rm("x", r0);
        rm.add_update(r0, r1);
        rm.add_unref(ptr("x"));
        let md = crate::folder::RevisionMetadata {
            revision: tlfcr_core::Revision(2),
            branch: BranchId::Unmerged("b".into()),
            root: r1,
            writer: "u".into(),
            ops: vec![rm],
        };
        let mut unmerged = Chains::build(BranchId::Unmerged("b".into()), &[md]).unwrap();
        let mut merged = Chains::empty(BranchId::Master);
        let held = unmerged.chain(r0).unwrap().ops[0].clone();

        let act = Action::new(ActionKind::DropUnmerged { op: Box::new(held) }, r1, r1);
        act.update_ops(&DirBlock::new(), &DirBlock::new(), &mut unmerged, &mut merged)
            .unwrap();
        assert!(unmerged.chain(r0).unwrap().ops.is_empty());
        let inverse = &merged.chain(r0).unwrap().ops[0];
        assert!(matches!(&inverse.kind, OpKind::Create { new_name, .. } if new_name == "x"));

        // Running it again finds nothing left to drop.
        act.update_ops(&DirBlock::new(), &DirBlock::new(), &mut unmerged, &mut merged)
            .unwrap();
        assert_eq!(merged.chain(r0).unwrap().ops.len(), 1);
    }
}
