//! Per-branch op chains.
//!
//! A [`Chain`] is the ordered history of one node since the branch point,
//! keyed by the node's original pointer. [`Chains`] indexes every chain of
//! a branch by original and by most-recent pointer, and tracks which nodes
//! the branch created, deleted or renamed.
//!
//! Chains only refer to each other through pointer keys; paths hold plain
//! pointer values, so nothing here is reference-counted.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use tlfcr_core::types::EntryType;
use tlfcr_core::{BlockPointer, BranchId, CrError, CrResult, Revision, WriterInfo};
use tlfcr_storage::{search_for_paths, BlockStore};

use crate::folder::RevisionMetadata;
use crate::ops::{collapse_write_range, AttrChange, BlockUpdate, Op, OpKind, WriteRange};
use crate::path::{sort_paths, NodePath, PathNode};

/// Where a renamed node came from and went to, by original pointers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameInfo {
    pub original_old_parent: BlockPointer,
    pub old_name: String,
    pub original_new_parent: BlockPointer,
    pub new_name: String,
}

#[derive(Debug, Clone)]
pub struct Chain {
    pub original: BlockPointer,
    pub most_recent: BlockPointer,
    pub ops: Vec<Op>,
    file: bool,
}

impl Chain {
    fn new(original: BlockPointer, most_recent: BlockPointer) -> Self {
        Chain {
            original,
            most_recent,
            ops: Vec::new(),
            file: false,
        }
    }

    pub fn is_file(&self) -> bool {
        self.file
    }

    pub fn has_sync_op(&self) -> bool {
        self.ops.iter().any(Op::is_sync)
    }

    pub fn has_set_attr_op(&self) -> bool {
        self.ops.iter().any(Op::is_set_attr)
    }

    pub fn remove_sync_ops(&mut self) {
        self.ops.retain(|op| !op.is_sync());
    }

    /// Mark the first rm of `name` as not to be replayed. Returns whether
    /// one was found.
    pub fn drop_rm(&mut self, name: &str) -> bool {
        for op in self.ops.iter_mut() {
            if let OpKind::Rm {
                old_name, drop_this, ..
            } = &mut op.kind
            {
                if old_name == name {
                    *drop_this = true;
                    return true;
                }
            }
        }
        false
    }

    /// Net dirty ranges of every sync in the chain (files only).
    pub fn collapsed_write_range(&self) -> Vec<WriteRange> {
        if !self.file {
            return Vec::new();
        }
        self.ops.iter().fold(Vec::new(), |acc, op| match &op.kind {
            OpKind::Sync { writes, .. } => collapse_write_range(&acc, writes),
            _ => acc,
        })
    }

    /// Give `op` a final path if it lacks one: the path of the first op
    /// in the chain, else a single node for `ptr`.
    pub fn ensure_path(&self, op: &mut Op, ptr: BlockPointer) {
        if op.final_path.as_ref().is_some_and(NodePath::is_valid) {
            return;
        }
        if let Some(path) = self
            .ops
            .first()
            .and_then(|first| first.final_path.as_ref())
            .filter(|p| p.is_valid())
        {
            op.final_path = Some(path.clone());
            return;
        }
        op.final_path = Some(NodePath::new(
            BranchId::Master,
            vec![PathNode::new(ptr, "")],
        ));
    }

    /// Drop ops that cancel out. Returns pointers that only the dropped
    /// ops referenced and that must be unreferenced by the resolution.
    fn collapse(
        &mut self,
        born_in_branch: &dyn Fn(BlockPointer) -> bool,
        originals: &HashMap<BlockPointer, BlockPointer>,
    ) -> Vec<BlockPointer> {
        let mut creates_seen: HashMap<String, usize> = HashMap::new();
        let mut last_set_attr: HashMap<AttrChange, usize> = HashMap::new();
        let mut to_remove: HashSet<usize> = HashSet::new();
        let mut to_unref = Vec::new();
        let mut wr: Vec<WriteRange> = Vec::new();
        let mut last_sync = None;
        let mut sync_refs = Vec::new();
        let mut sync_unrefs = Vec::new();

        for (i, op) in self.ops.iter().enumerate() {
            match &op.kind {
                OpKind::Create {
                    new_name, renamed, ..
                } => {
                    // A rename papered over the earlier create.
                    if *renamed {
                        if let Some(prev) = creates_seen.get(new_name) {
                            to_remove.insert(*prev);
                        }
                    }
                    creates_seen.insert(new_name.clone(), i);
                }
                OpKind::Rm { old_name, .. } => {
                    if let Some(prev) = creates_seen.remove(old_name) {
                        to_remove.insert(prev);
                        let only_branch_blocks = op.unrefs.iter().all(|unref| {
                            let original = originals.get(unref).copied().unwrap_or(*unref);
                            born_in_branch(original)
                        });
                        if only_branch_blocks {
                            to_remove.insert(i);
                            to_unref.extend(op.unrefs.iter().copied());
                        }
                    }
                }
                OpKind::SetAttr { attr, .. } => {
                    if let Some(prev) = last_set_attr.insert(*attr, i) {
                        to_remove.insert(prev);
                    }
                }
                OpKind::Sync { writes, .. } => {
                    wr = collapse_write_range(&wr, writes);
                    to_remove.insert(i);
                    last_sync = Some(i);
                    sync_refs.extend(op.refs.iter().copied());
                    sync_unrefs.extend(op.unrefs.iter().copied());
                }
                _ => {}
            }
        }

        if to_remove.is_empty() {
            return to_unref;
        }
        let ops = std::mem::take(&mut self.ops);
        for (i, mut op) in ops.into_iter().enumerate() {
            if Some(i) == last_sync {
                if let OpKind::Sync { writes, .. } = &mut op.kind {
                    *writes = wr.clone();
                }
                op.refs = sync_refs.clone();
                op.unrefs = sync_unrefs.clone();
                self.ops.push(op);
            } else if !to_remove.contains(&i) {
                self.ops.push(op);
            }
        }
        to_unref
    }
}

// ── Chains ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Chains {
    pub branch: BranchId,
    by_original: BTreeMap<BlockPointer, Chain>,
    /// most-recent pointer -> original pointer
    by_most_recent: HashMap<BlockPointer, BlockPointer>,
    /// any later pointer -> the original it descends from
    originals: HashMap<BlockPointer, BlockPointer>,
    created: HashSet<BlockPointer>,
    created_then_deleted: HashSet<BlockPointer>,
    deleted: HashSet<BlockPointer>,
    pub renamed_originals: BTreeMap<BlockPointer, RenameInfo>,
    pub do_not_unref: HashSet<BlockPointer>,
    pub to_unref: HashSet<BlockPointer>,
    pub res_ops: Vec<Op>,
    pub original_root: BlockPointer,
    /// Root of the newest revision the chains were built from.
    pub head_root: BlockPointer,
    pub head_writer: WriterInfo,
}

impl Chains {
    pub fn empty(branch: BranchId) -> Self {
        Chains {
            branch,
            by_original: BTreeMap::new(),
            by_most_recent: HashMap::new(),
            originals: HashMap::new(),
            created: HashSet::new(),
            created_then_deleted: HashSet::new(),
            deleted: HashSet::new(),
            renamed_originals: BTreeMap::new(),
            do_not_unref: HashSet::new(),
            to_unref: HashSet::new(),
            res_ops: Vec::new(),
            original_root: BlockPointer::ZERO,
            head_root: BlockPointer::ZERO,
            head_writer: WriterInfo::default(),
        }
    }

    /// Build the chains of one branch from its revisions, oldest first.
    /// An empty list yields empty chains.
    pub async fn from_revisions(
        branch: BranchId,
        revisions: &[RevisionMetadata],
        store: &BlockStore,
    ) -> CrResult<Self> {
        let mut chains = Chains::build(branch, revisions)?;
        chains.identify_types(store).await?;
        Ok(chains)
    }

    /// Build and collapse without reading any blocks.
    pub fn build(branch: BranchId, revisions: &[RevisionMetadata]) -> CrResult<Self> {
        let mut chains = Chains::empty(branch);
        for md in revisions {
            let writer = md.writer_info();
            for op in &md.ops {
                let mut op = op.clone();
                op.writer = writer.clone();
                chains.make_chain_for_op(op)?;
            }
            if !chains.original_root.is_initialized() {
                if let Some(orig) = chains.by_most_recent.get(&md.root) {
                    chains.original_root = *orig;
                }
            }
            chains.head_root = md.root;
            chains.head_writer = writer;
        }

        let born: HashSet<BlockPointer> = chains
            .created
            .union(&chains.created_then_deleted)
            .copied()
            .collect();
        let born_in_branch = |ptr: BlockPointer| born.contains(&ptr);
        let mut to_unref = Vec::new();
        for chain in chains.by_original.values_mut() {
            to_unref.extend(chain.collapse(&born_in_branch, &chains.originals));
        }
        chains.to_unref.extend(to_unref);
        debug!(
            branch = %chains.branch,
            chains = chains.by_original.len(),
            revisions = revisions.len(),
            "built chains"
        );
        Ok(chains)
    }

    pub fn is_empty(&self) -> bool {
        self.by_original.is_empty()
    }

    pub fn head_revision(&self) -> Revision {
        self.head_writer.revision
    }

    // ── Building ─────────────────────────────────────────────────────────

    fn add_op(&mut self, ptr: BlockPointer, op: Op) -> CrResult<()> {
        let original = *self
            .by_most_recent
            .get(&ptr)
            .ok_or(CrError::NoChainFound(ptr))?;
        let chain = self
            .by_original
            .get_mut(&original)
            .ok_or(CrError::NoChainFound(original))?;
        chain.ops.push(op);
        Ok(())
    }

    fn apply_update(&mut self, update: BlockUpdate) {
        let original = match self.by_most_recent.remove(&update.unref) {
            Some(original) => original,
            None => {
                self.by_original
                    .insert(update.unref, Chain::new(update.unref, BlockPointer::ZERO));
                update.unref
            }
        };
        if let Some(chain) = self.by_original.get_mut(&original) {
            chain.most_recent = update.ref_;
        }
        self.by_most_recent.insert(update.ref_, original);
        if original != update.ref_ {
            self.originals.insert(update.ref_, original);
        }
    }

    fn mark_refs_and_unrefs(&mut self, op: &Op) {
        for ptr in &op.refs {
            if ptr.is_initialized() {
                self.created.insert(*ptr);
            }
        }
        for ptr in &op.unrefs {
            if !ptr.is_initialized() {
                continue;
            }
            let original = self.originals.get(ptr).copied().unwrap_or(*ptr);
            // Stale unrefs of an already-updated node are ignored.
            if let Some(chain) = self.by_original.get(&original) {
                if *ptr != chain.most_recent {
                    continue;
                }
            }
            self.mark_deleted(original);
        }
    }

    pub fn mark_deleted(&mut self, original: BlockPointer) {
        if self.created.remove(&original) {
            self.created_then_deleted.insert(original);
        } else {
            self.deleted.insert(original);
        }
    }

    /// Fold one op into the chains. Renames are split into a remove in
    /// the old parent and a renamed create in the new parent.
    pub fn make_chain_for_op(&mut self, op: Op) -> CrResult<()> {
        if matches!(op.kind, OpKind::Gc { .. }) {
            return Ok(());
        }
        for update in op.all_updates() {
            if update.unref.is_initialized() {
                self.apply_update(update);
            }
        }
        self.mark_refs_and_unrefs(&op);

        match &op.kind {
            OpKind::Create { dir, .. } => {
                let target = dir.ref_;
                self.add_op(target, op)
            }
            OpKind::Rm { old_name, dir, .. } => {
                let target = dir.ref_;
                let name = old_name.clone();
                let no_unrefs = op.unrefs.is_empty();
                self.add_op(target, op)?;
                if no_unrefs {
                    // A node renamed here earlier and then removed in the
                    // same batch carries no unrefs; it is still gone.
                    let parent = self.original_from_most_recent(target)?;
                    let renamed_away = self
                        .renamed_originals
                        .iter()
                        .find(|(_, ri)| ri.original_new_parent == parent && ri.new_name == name)
                        .map(|(original, _)| *original);
                    if let Some(original) = renamed_away {
                        self.mark_deleted(original);
                    }
                }
                Ok(())
            }
            OpKind::Rename {
                old_name,
                old_dir,
                new_name,
                new_dir,
                renamed,
                renamed_type,
            } => {
                let mut rm = Op::rm(old_name.clone(), old_dir.unref).with_writer(op.writer.clone());
                if let OpKind::Rm { dir, .. } = &mut rm.kind {
                    dir.ref_ = old_dir.ref_;
                }
                self.add_op(old_dir.ref_, rm)?;

                let nd = new_dir.unwrap_or(*old_dir);
                if !op.unrefs.is_empty() {
                    // Something was overwritten; an explicit rm lets
                    // conflict checks see it.
                    let mut overwrite =
                        Op::rm(new_name.clone(), nd.unref).with_writer(op.writer.clone());
                    if let OpKind::Rm { dir, .. } = &mut overwrite.kind {
                        dir.ref_ = nd.ref_;
                    }
                    overwrite.unrefs = op.unrefs.clone();
                    self.add_op(nd.ref_, overwrite)?;
                }

                let mut create =
                    Op::create(new_name.clone(), nd.unref, *renamed_type).with_writer(op.writer.clone());
                if let OpKind::Create {
                    dir, renamed: r, ..
                } = &mut create.kind
                {
                    dir.ref_ = nd.ref_;
                    *r = true;
                }

                if renamed.is_initialized() {
                    let new_parent = *self.by_most_recent.get(&nd.ref_).ok_or_else(|| {
                        CrError::inconsistent(format!("no chain for new rename parent {}", nd.ref_))
                    })?;
                    let old_parent = *self.by_most_recent.get(&old_dir.ref_).ok_or_else(|| {
                        CrError::inconsistent(format!("no chain for old rename parent {}", old_dir.ref_))
                    })?;
                    let renamed_original = self.by_most_recent.get(renamed).copied().unwrap_or(*renamed);
                    let info = self
                        .renamed_originals
                        .entry(renamed_original)
                        .or_insert_with(|| RenameInfo {
                            original_old_parent: old_parent,
                            old_name: old_name.clone(),
                            original_new_parent: BlockPointer::ZERO,
                            new_name: String::new(),
                        });
                    info.original_new_parent = new_parent;
                    info.new_name = new_name.clone();
                    create.add_ref(renamed_original);
                }
                self.add_op(nd.ref_, create)
            }
            OpKind::Sync { file, .. } => {
                let target = file.ref_;
                self.add_op(target, op)
            }
            OpKind::SetAttr { file, .. } => {
                let target = *file;
                if !self.by_most_recent.contains_key(&target) {
                    self.by_original.insert(target, Chain::new(target, target));
                    self.by_most_recent.insert(target, target);
                }
                self.add_op(target, op)
            }
            OpKind::Resolution => {
                self.res_ops.push(op);
                Ok(())
            }
            OpKind::Gc { .. } => Ok(()),
        }
    }

    /// Add an op produced during resolution to the chain of `target`,
    /// starting an empty chain there if needed. Renames are not split.
    pub fn make_chain_for_new_op(&mut self, target: BlockPointer, op: Op) -> CrResult<()> {
        if !self.by_most_recent.contains_key(&target) {
            self.by_original
                .entry(target)
                .or_insert_with(|| Chain::new(target, target))
                .most_recent = target;
            self.by_most_recent.insert(target, target);
        }
        self.mark_refs_and_unrefs(&op);
        self.add_op(target, op)
    }

    /// Put `ops` at the front of the chain whose most recent pointer is
    /// `most_recent`, creating the chain if it doesn't exist.
    pub fn prepend_ops(&mut self, most_recent: BlockPointer, mut ops: Vec<Op>) -> CrResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        if !self.by_most_recent.contains_key(&most_recent) {
            let first = ops[0].clone();
            self.make_chain_for_new_op(most_recent, first)?;
            if let Some(chain) = self.chain_by_most_recent_mut(most_recent) {
                chain.ops.clear();
            }
        }
        let chain = self
            .chain_by_most_recent_mut(most_recent)
            .ok_or(CrError::NoChainFound(most_recent))?;
        for op in ops.iter_mut() {
            chain.ensure_path(op, most_recent);
        }
        ops.append(&mut chain.ops);
        chain.ops = ops;
        Ok(())
    }

    // ── Type identification ──────────────────────────────────────────────

    async fn identify_types(&mut self, store: &BlockStore) -> CrResult<()> {
        let originals: Vec<BlockPointer> = self.by_original.keys().copied().collect();
        for original in originals {
            if let Some(file) = self.identify_type(original, store).await? {
                if let Some(chain) = self.by_original.get_mut(&original) {
                    chain.file = file;
                }
            }
        }
        Ok(())
    }

    /// `Some(true)` for files, `Some(false)` for directories, `None` when
    /// the chain's ops don't say and it doesn't matter.
    async fn identify_type(
        &self,
        original: BlockPointer,
        store: &BlockStore,
    ) -> CrResult<Option<bool>> {
        let Some(chain) = self.by_original.get(&original) else {
            return Ok(None);
        };
        if chain.ops.is_empty() {
            return Ok(None);
        }
        // Any sync or non-mtime setAttr settles it; mtime alone means the
        // parent directory has to be read.
        let mut parent_dir = BlockPointer::ZERO;
        for op in &chain.ops {
            match &op.kind {
                OpKind::Sync { .. } => return Ok(Some(true)),
                OpKind::SetAttr { attr, dir, .. } => {
                    if *attr != AttrChange::Mtime {
                        return Ok(Some(true));
                    }
                    parent_dir = dir.ref_;
                }
                _ => return Ok(Some(false)),
            }
        }

        let mut parent_original = match self.originals.get(&parent_dir) {
            Some(orig) => *orig,
            None if self.created.contains(&parent_dir) || self.by_original.contains_key(&parent_dir) => {
                parent_dir
            }
            None if self.is_deleted(parent_dir) => return Ok(None),
            None => return Err(CrError::NoChainFound(parent_dir)),
        };
        if let Some((new_parent, _)) = self.renamed_parent_and_name(original) {
            parent_original = new_parent;
        }
        let parent_most_recent = self.most_recent_from_original_or_same(parent_original);
        let dir = store.get_dir(parent_most_recent).await?;
        match dir.find_by_ptr(chain.most_recent) {
            Some((_, entry)) => match entry.entry_type {
                EntryType::Dir => Ok(Some(false)),
                EntryType::File | EntryType::Exec => Ok(Some(true)),
                EntryType::Sym => Err(CrError::inconsistent(format!(
                    "unexpected symlink {} with an mtime change",
                    chain.most_recent
                ))),
            },
            None if self.is_deleted(original) => Ok(None),
            None => Err(CrError::inconsistent(format!(
                "no entry for {} in parent {}",
                chain.most_recent, parent_most_recent
            ))),
        }
    }

    // ── Lookups ──────────────────────────────────────────────────────────

    pub fn chain(&self, original: BlockPointer) -> Option<&Chain> {
        self.by_original.get(&original)
    }

    pub fn chain_mut(&mut self, original: BlockPointer) -> Option<&mut Chain> {
        self.by_original.get_mut(&original)
    }

    pub fn chain_by_most_recent(&self, ptr: BlockPointer) -> Option<&Chain> {
        self.by_most_recent
            .get(&ptr)
            .and_then(|orig| self.by_original.get(orig))
    }

    pub fn chain_by_most_recent_mut(&mut self, ptr: BlockPointer) -> Option<&mut Chain> {
        let original = *self.by_most_recent.get(&ptr)?;
        self.by_original.get_mut(&original)
    }

    pub fn has_most_recent(&self, ptr: BlockPointer) -> bool {
        self.by_most_recent.contains_key(&ptr)
    }

    /// Every chain, ordered by original pointer.
    pub fn iter(&self) -> impl Iterator<Item = &Chain> {
        self.by_original.values()
    }

    pub fn originals(&self) -> Vec<BlockPointer> {
        self.by_original.keys().copied().collect()
    }

    pub fn most_recents(&self) -> Vec<BlockPointer> {
        self.by_most_recent.keys().copied().collect()
    }

    pub fn most_recent_from_original(&self, original: BlockPointer) -> CrResult<BlockPointer> {
        self.by_original
            .get(&original)
            .map(|c| c.most_recent)
            .ok_or(CrError::NoChainFound(original))
    }

    pub fn most_recent_from_original_or_same(&self, original: BlockPointer) -> BlockPointer {
        self.most_recent_from_original(original).unwrap_or(original)
    }

    pub fn original_from_most_recent(&self, ptr: BlockPointer) -> CrResult<BlockPointer> {
        self.by_most_recent
            .get(&ptr)
            .copied()
            .ok_or(CrError::NoChainFound(ptr))
    }

    pub fn original_from_most_recent_or_same(&self, ptr: BlockPointer) -> BlockPointer {
        self.original_from_most_recent(ptr).unwrap_or(ptr)
    }

    /// One step of the original mapping: the original `ptr` was updated
    /// from, or `ptr` itself.
    pub fn original_of(&self, ptr: BlockPointer) -> BlockPointer {
        self.originals.get(&ptr).copied().unwrap_or(ptr)
    }

    /// Follow the original mapping transitively (it grows a link each
    /// time [`Chains::change_original`] runs).
    pub fn revert_to_original(&self, ptr: BlockPointer) -> BlockPointer {
        let mut current = ptr;
        for _ in 0..=self.originals.len() {
            match self.originals.get(&current) {
                Some(next) if *next != current => current = *next,
                _ => break,
            }
        }
        current
    }

    /// Created in this branch and still alive.
    pub fn is_created(&self, original: BlockPointer) -> bool {
        self.created.contains(&original)
    }

    /// Deleted in this branch, including nodes the branch both created
    /// and deleted.
    pub fn is_deleted(&self, original: BlockPointer) -> bool {
        self.deleted.contains(&original) || self.created_then_deleted.contains(&original)
    }

    pub fn mark_created(&mut self, original: BlockPointer) {
        self.deleted.remove(&original);
        self.created.insert(original);
    }

    pub fn unmark_created(&mut self, original: BlockPointer) {
        self.created.remove(&original);
    }

    /// New parent (original pointer) and name of a renamed node.
    pub fn renamed_parent_and_name(&self, original: BlockPointer) -> Option<(BlockPointer, String)> {
        self.renamed_originals
            .get(&original)
            .map(|ri| (ri.original_new_parent, ri.new_name.clone()))
    }

    // ── Mutation ─────────────────────────────────────────────────────────

    /// Forget the chain whose most recent pointer is `ptr`.
    pub fn remove_chain(&mut self, ptr: BlockPointer) {
        if let Some(original) = self.by_most_recent.remove(&ptr) {
            self.by_original.remove(&original);
        }
    }

    /// Re-key a chain under an original pointer from the other branch.
    pub fn change_original(&mut self, old: BlockPointer, new: BlockPointer) -> CrResult<()> {
        if old == new {
            return Ok(());
        }
        if self.by_original.contains_key(&new) {
            return Err(CrError::inconsistent(format!(
                "chain with original {new} already exists"
            )));
        }
        let mut chain = self.by_original.remove(&old).ok_or(CrError::NoChainFound(old))?;
        chain.original = new;
        self.by_most_recent.insert(chain.most_recent, new);
        self.by_original.insert(new, chain);
        self.originals.insert(old, new);

        if self.deleted.remove(&old) {
            self.deleted.insert(new);
        }
        if self.created_then_deleted.remove(&old) {
            self.deleted.insert(new);
        }
        // The new original was made on another branch.
        self.created.remove(&old);
        if let Some(ri) = self.renamed_originals.remove(&old) {
            self.renamed_originals.insert(new, ri);
        }
        for info in self.renamed_originals.values_mut() {
            if info.original_old_parent == old {
                info.original_old_parent = new;
            }
            if info.original_new_parent == old {
                info.original_new_parent = new;
            }
        }
        Ok(())
    }

    /// Copy `op` with every unref-side pointer mapped back to its original.
    pub fn copy_op_and_revert_unrefs_to_originals(&self, op: &Op) -> Op {
        let mut copy = op.clone();
        copy.renew_id();
        match &mut copy.kind {
            OpKind::Create { dir, .. } | OpKind::Rm { dir, .. } => {
                dir.unref = self.revert_to_original(dir.unref);
            }
            OpKind::Rename {
                old_dir,
                new_dir,
                renamed,
                ..
            } => {
                old_dir.unref = self.revert_to_original(old_dir.unref);
                if let Some(nd) = new_dir {
                    nd.unref = self.revert_to_original(nd.unref);
                }
                *renamed = self.revert_to_original(*renamed);
            }
            OpKind::Sync { file, .. } => {
                file.unref = self.revert_to_original(file.unref);
            }
            OpKind::SetAttr { dir, file, .. } => {
                dir.unref = self.revert_to_original(dir.unref);
                *file = self.revert_to_original(*file);
            }
            OpKind::Resolution | OpKind::Gc { .. } => {}
        }
        copy
    }

    /// Put split renames back together: for each rename in `ops`, drop
    /// the matching rm from the old parent chain and replace the renamed
    /// create in the new parent chain with the rename itself.
    pub fn revert_renames(&mut self, ops: &[Op]) {
        for op in ops {
            let OpKind::Rename {
                old_name,
                old_dir,
                new_name,
                new_dir,
                ..
            } = &op.kind
            else {
                continue;
            };
            let Some(old_chain) = self.chain_by_most_recent_mut(old_dir.ref_) else {
                continue;
            };
            let Some(rm_idx) = old_chain
                .ops
                .iter()
                .position(|o| matches!(&o.kind, OpKind::Rm { old_name: n, .. } if n == old_name))
            else {
                continue;
            };
            let rm = old_chain.ops.remove(rm_idx);
            if !rm.final_path.as_ref().is_some_and(NodePath::is_valid) {
                // Created and renamed within one batch: nothing to revert.
                continue;
            }

            let new_ptr = new_dir.map(|nd| nd.ref_).unwrap_or(old_dir.ref_);
            let Some(new_chain) = self.chain_by_most_recent_mut(new_ptr) else {
                continue;
            };
            if let Some(slot) = new_chain.ops.iter_mut().find(|o| {
                matches!(&o.kind, OpKind::Create { new_name: n, renamed: true, .. } if n == new_name)
            }) {
                let mut rename = op.clone();
                rename.final_path = slot.final_path.clone();
                *slot = rename;
            }
        }
    }

    /// Search the branch head for every chain that still has ops and
    /// whose node existed at the branch point. Chains whose node can't be
    /// found are dropped; every op of a found chain gets the node's path
    /// as its final path. Deepest paths come first.
    pub async fn get_paths(&mut self, store: &BlockStore) -> CrResult<Vec<NodePath>> {
        let targets: HashSet<BlockPointer> = self
            .by_original
            .values()
            .filter(|c| !c.ops.is_empty() && !self.is_created(c.original) && !self.is_deleted(c.original))
            .map(|c| c.most_recent)
            .collect();
        let mut found = search_for_paths(store, self.head_root, &targets).await?;

        let mut paths = Vec::new();
        for ptr in targets {
            let Some(fp) = found.remove(&ptr) else {
                debug!(branch = %self.branch, %ptr, "dropping chain with no path");
                self.remove_chain(ptr);
                continue;
            };
            let path = NodePath::from_found(self.branch.clone(), fp);
            if let Some(chain) = self.chain_by_most_recent_mut(ptr) {
                for op in chain.ops.iter_mut() {
                    op.final_path = Some(path.clone());
                }
            }
            paths.push(path);
        }
        sort_paths(&mut paths);
        Ok(paths)
    }
}
