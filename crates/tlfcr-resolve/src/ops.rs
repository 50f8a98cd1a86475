//! Filesystem-level operations recorded in each revision, and the per-op
//! conflict rules used when replaying unmerged ops onto the merged branch.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tlfcr_core::types::EntryType;
use tlfcr_core::{BlockPointer, CrError, CrResult, Revision, WriterInfo};

use crate::actions::ActionKind;
use crate::path::NodePath;
use crate::renamer::ConflictRenamer;

// ── Block updates ────────────────────────────────────────────────────────────

/// A pointer change `unref -> ref` carried by an op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockUpdate {
    pub unref: BlockPointer,
    #[serde(rename = "ref")]
    pub ref_: BlockPointer,
}

impl BlockUpdate {
    pub fn new(unref: BlockPointer, ref_: BlockPointer) -> Self {
        BlockUpdate { unref, ref_ }
    }

    /// An update whose new pointer is not known yet.
    pub fn unref_only(unref: BlockPointer) -> Self {
        BlockUpdate {
            unref,
            ref_: BlockPointer::ZERO,
        }
    }

    pub fn same(ptr: BlockPointer) -> Self {
        BlockUpdate {
            unref: ptr,
            ref_: ptr,
        }
    }
}

// ── Attributes and write ranges ──────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttrChange {
    Exec,
    Mtime,
    /// Only produced during resolution, when a sync meets a merged setAttr.
    Size,
}

impl fmt::Display for AttrChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AttrChange::Exec => "ex",
            AttrChange::Mtime => "mtime",
            AttrChange::Size => "size",
        };
        f.write_str(s)
    }
}

/// One dirty region of a file. `len == 0` is a truncate at `off`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteRange {
    pub off: u64,
    pub len: u64,
}

impl WriteRange {
    pub fn write(off: u64, len: u64) -> Self {
        WriteRange { off, len }
    }

    pub fn truncate(off: u64) -> Self {
        WriteRange { off, len: 0 }
    }

    pub fn is_truncate(&self) -> bool {
        self.len == 0
    }

    /// One past the last byte written. Truncates end where they start.
    pub fn end(&self) -> u64 {
        self.off + self.len
    }

    /// Whether the two ranges touch: overlapping or adjacent writes, a
    /// truncate at or before a write's end, or two truncates.
    pub fn affects(&self, other: &WriteRange) -> bool {
        match (self.is_truncate(), other.is_truncate()) {
            (true, true) => true,
            (true, false) => other.end() > self.off,
            (false, true) => self.end() > other.off,
            (false, false) => {
                (self.off <= other.end() && other.end() <= self.end())
                    || (other.off <= self.end() && self.end() <= other.end())
            }
        }
    }
}

/// Merge `w_new` with the affected run `existing`. A trailing truncate in
/// the run moves to the end of the merged write.
fn coalesce_writes(existing: &[WriteRange], w_new: WriteRange) -> Vec<WriteRange> {
    let (Some(head), Some(tail)) = (existing.first(), existing.last()) else {
        return vec![w_new];
    };
    let mut new_off = w_new.off;
    let mut new_end = w_new.end();
    if !tail.is_truncate() && tail.end() > new_end {
        new_end = tail.end();
    }
    if !head.is_truncate() && head.off < new_off {
        new_off = head.off;
    }
    let mut ret = vec![WriteRange::write(new_off, new_end - new_off)];
    if tail.is_truncate() {
        ret.push(WriteRange::truncate(new_end));
    }
    ret
}

/// Fold one range into an already-collapsed list: non-overlapping writes
/// with increasing offsets, optionally followed by one truncate.
pub fn add_to_collapsed_write_range(writes: &[WriteRange], w_new: WriteRange) -> Vec<WriteRange> {
    let head_end = writes
        .iter()
        .position(|w_old| w_old.off >= w_new.off || w_new.affects(w_old))
        .unwrap_or(writes.len());
    let mut head = writes[..head_end].to_vec();

    if w_new.is_truncate() {
        let Some(first) = writes.get(head_end) else {
            head.push(w_new);
            return head;
        };
        if first.is_truncate() {
            if first.off < w_new.off {
                // Growing truncate zero-fills the gap.
                let zero_len = w_new.off - first.off;
                if let Some(last) = head.last_mut() {
                    if last.end() == first.off {
                        last.len += zero_len;
                        head.push(w_new);
                        return head;
                    }
                }
                head.push(WriteRange::write(first.off, zero_len));
            }
        } else if first.off < w_new.off {
            head.push(WriteRange::write(first.off, w_new.off - first.off));
        }
        head.push(w_new);
        return head;
    }

    let mid_end = writes[head_end..]
        .iter()
        .position(|w_old| !w_new.affects(w_old))
        .map(|i| head_end + i)
        .unwrap_or(writes.len());
    head.extend(coalesce_writes(&writes[head_end..mid_end], w_new));
    head.extend_from_slice(&writes[mid_end..]);
    head
}

/// Collapse `new_writes` in order on top of `existing`.
pub fn collapse_write_range(existing: &[WriteRange], new_writes: &[WriteRange]) -> Vec<WriteRange> {
    new_writes
        .iter()
        .fold(existing.to_vec(), |acc, w| add_to_collapsed_write_range(&acc, *w))
}

/// Two collapsed ranges are equivalent if both are empty or both are the
/// same single truncate.
pub fn write_ranges_equivalent(a: &[WriteRange], b: &[WriteRange]) -> bool {
    match (a, b) {
        ([], []) => true,
        ([x], [y]) => x.is_truncate() && y.is_truncate() && x.off == y.off,
        _ => false,
    }
}

// ── Ops ──────────────────────────────────────────────────────────────────────

static NEXT_OP_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique op identity; survives clones so a cloned op can still be
/// matched against the copy held in a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpId(u64);

impl OpId {
    pub fn fresh() -> Self {
        OpId(NEXT_OP_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for OpId {
    fn default() -> Self {
        OpId::fresh()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    Create {
        new_name: String,
        dir: BlockUpdate,
        entry_type: EntryType,
        /// Second half of a split rename
        #[serde(skip)]
        renamed: bool,
        /// Copy the entry into the merged branch under a new identity
        #[serde(skip)]
        force_copy: bool,
        /// Create a symlink with this target instead of the entry
        #[serde(skip)]
        cr_sym_path: Option<String>,
    },
    Rm {
        old_name: String,
        dir: BlockUpdate,
        #[serde(skip)]
        drop_this: bool,
    },
    Rename {
        old_name: String,
        old_dir: BlockUpdate,
        new_name: String,
        /// `None` when the rename stays within `old_dir`
        new_dir: Option<BlockUpdate>,
        renamed: BlockPointer,
        renamed_type: EntryType,
    },
    Sync {
        file: BlockUpdate,
        writes: Vec<WriteRange>,
        #[serde(skip)]
        keep_unmerged_tail_name: bool,
    },
    SetAttr {
        name: String,
        dir: BlockUpdate,
        attr: AttrChange,
        file: BlockPointer,
        #[serde(skip)]
        keep_unmerged_tail_name: bool,
    },
    /// Catch-all carrier for the pointer bookkeeping of a resolution.
    Resolution,
    Gc {
        latest_rev: Revision,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Op {
    #[serde(flatten)]
    pub kind: OpKind,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub refs: Vec<BlockPointer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unrefs: Vec<BlockPointer>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub updates: Vec<BlockUpdate>,
    #[serde(default)]
    pub writer: WriterInfo,
    #[serde(skip)]
    pub final_path: Option<NodePath>,
    #[serde(skip)]
    id: OpId,
}

impl Op {
    fn from_kind(kind: OpKind) -> Self {
        Op {
            kind,
            refs: Vec::new(),
            unrefs: Vec::new(),
            updates: Vec::new(),
            writer: WriterInfo::default(),
            final_path: None,
            id: OpId::fresh(),
        }
    }

    pub fn create(name: impl Into<String>, dir: BlockPointer, entry_type: EntryType) -> Self {
        Op::from_kind(OpKind::Create {
            new_name: name.into(),
            dir: BlockUpdate::unref_only(dir),
            entry_type,
            renamed: false,
            force_copy: false,
            cr_sym_path: None,
        })
    }

    pub fn rm(name: impl Into<String>, dir: BlockPointer) -> Self {
        Op::from_kind(OpKind::Rm {
            old_name: name.into(),
            dir: BlockUpdate::unref_only(dir),
            drop_this: false,
        })
    }

    pub fn rename(
        old_name: impl Into<String>,
        old_dir: BlockPointer,
        new_name: impl Into<String>,
        new_dir: BlockPointer,
        renamed: BlockPointer,
        renamed_type: EntryType,
    ) -> Self {
        let new_dir = (new_dir != old_dir).then(|| BlockUpdate::unref_only(new_dir));
        Op::from_kind(OpKind::Rename {
            old_name: old_name.into(),
            old_dir: BlockUpdate::unref_only(old_dir),
            new_name: new_name.into(),
            new_dir,
            renamed,
            renamed_type,
        })
    }

    pub fn sync(file: BlockPointer) -> Self {
        Op::from_kind(OpKind::Sync {
            file: BlockUpdate::unref_only(file),
            writes: Vec::new(),
            keep_unmerged_tail_name: false,
        })
    }

    pub fn set_attr(
        name: impl Into<String>,
        dir: BlockPointer,
        attr: AttrChange,
        file: BlockPointer,
    ) -> Self {
        Op::from_kind(OpKind::SetAttr {
            name: name.into(),
            dir: BlockUpdate::unref_only(dir),
            attr,
            file,
            keep_unmerged_tail_name: false,
        })
    }

    pub fn resolution() -> Self {
        Op::from_kind(OpKind::Resolution)
    }

    pub fn gc(latest_rev: Revision) -> Self {
        Op::from_kind(OpKind::Gc { latest_rev })
    }

    pub fn id(&self) -> OpId {
        self.id
    }

    /// Whether `other` is this op or a clone of it.
    pub fn same_op(&self, other: &Op) -> bool {
        self.id == other.id
    }

    /// Give a copied op its own identity.
    pub fn renew_id(&mut self) {
        self.id = OpId::fresh();
    }

    pub fn with_writer(mut self, writer: WriterInfo) -> Self {
        self.writer = writer;
        self
    }

    pub fn with_writes(mut self, ranges: Vec<WriteRange>) -> Self {
        if let OpKind::Sync { writes, .. } = &mut self.kind {
            *writes = ranges;
        }
        self
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            OpKind::Create { .. } => "create",
            OpKind::Rm { .. } => "rm",
            OpKind::Rename { .. } => "rename",
            OpKind::Sync { .. } => "sync",
            OpKind::SetAttr { .. } => "setattr",
            OpKind::Resolution => "resolution",
            OpKind::Gc { .. } => "gc",
        }
    }

    pub fn is_sync(&self) -> bool {
        matches!(self.kind, OpKind::Sync { .. })
    }

    pub fn is_set_attr(&self) -> bool {
        matches!(self.kind, OpKind::SetAttr { .. })
    }

    pub fn add_ref(&mut self, ptr: BlockPointer) {
        self.refs.push(ptr);
    }

    pub fn del_ref(&mut self, ptr: BlockPointer) {
        self.refs.retain(|r| *r != ptr);
    }

    pub fn add_unref(&mut self, ptr: BlockPointer) {
        self.unrefs.push(ptr);
    }

    /// Record `old -> new`, filling in the op's own directory/file update
    /// when it matches, otherwise as an extra update.
    pub fn add_update(&mut self, old: BlockPointer, new: BlockPointer) {
        match &mut self.kind {
            OpKind::Create { dir, .. } | OpKind::Rm { dir, .. } | OpKind::SetAttr { dir, .. }
                if dir.unref == old =>
            {
                dir.ref_ = new;
                return;
            }
            OpKind::Rename {
                old_dir, new_dir, ..
            } => {
                if old_dir.unref == old {
                    old_dir.ref_ = new;
                    return;
                }
                if let Some(nd) = new_dir {
                    if nd.unref == old {
                        nd.ref_ = new;
                        return;
                    }
                }
            }
            OpKind::Sync { file, .. } if file.unref == old => {
                file.ref_ = new;
                return;
            }
            _ => {}
        }
        self.updates.push(BlockUpdate::new(old, new));
    }

    /// Every pointer update this op carries, extra updates first.
    pub fn all_updates(&self) -> Vec<BlockUpdate> {
        let mut all = self.updates.clone();
        match &self.kind {
            OpKind::Create { dir, .. } | OpKind::Rm { dir, .. } | OpKind::SetAttr { dir, .. } => {
                all.push(*dir)
            }
            OpKind::Rename {
                old_dir, new_dir, ..
            } => {
                if let Some(nd) = new_dir {
                    all.push(*nd);
                }
                all.push(*old_dir);
            }
            OpKind::Sync { file, .. } => all.push(*file),
            OpKind::Resolution | OpKind::Gc { .. } => {}
        }
        all
    }

    /// Mutable access to every pointer update, for pointer rewriting.
    pub fn all_updates_mut(&mut self) -> Vec<&mut BlockUpdate> {
        let mut all: Vec<&mut BlockUpdate> = self.updates.iter_mut().collect();
        match &mut self.kind {
            OpKind::Create { dir, .. } | OpKind::Rm { dir, .. } | OpKind::SetAttr { dir, .. } => {
                all.push(dir)
            }
            OpKind::Rename {
                old_dir, new_dir, ..
            } => {
                if let Some(nd) = new_dir {
                    all.push(nd);
                }
                all.push(old_dir);
            }
            OpKind::Sync { file, .. } => all.push(file),
            OpKind::Resolution | OpKind::Gc { .. } => {}
        }
        all
    }

    fn require_final_path(&self) -> CrResult<&NodePath> {
        self.final_path
            .as_ref()
            .filter(|p| p.is_valid())
            .ok_or_else(|| CrError::inconsistent(format!("{self} has no final path")))
    }

    // ── Conflict rules ───────────────────────────────────────────────────

    /// The action needed when this unmerged op meets `merged_op` on the
    /// same node, or `None` if they don't conflict.
    pub fn check_conflict(
        &self,
        renamer: &dyn ConflictRenamer,
        merged_op: &Op,
        is_file: bool,
    ) -> CrResult<Option<ActionKind>> {
        match &self.kind {
            OpKind::Create {
                new_name,
                entry_type,
                renamed,
                cr_sym_path,
                ..
            } => {
                let OpKind::Create {
                    new_name: merged_name,
                    entry_type: merged_type,
                    renamed: merged_renamed,
                    ..
                } = &merged_op.kind
                else {
                    return Ok(None);
                };
                if merged_name != new_name {
                    return Ok(None);
                }
                if *entry_type != EntryType::Dir || *merged_type != EntryType::Dir {
                    if *merged_type != EntryType::Dir
                        && (*entry_type == EntryType::Dir || cr_sym_path.is_some())
                    {
                        // Only the unmerged side is (or becomes) a
                        // directory: move the merged file out of the way.
                        return Ok(Some(ActionKind::RenameMerged {
                            from: new_name.clone(),
                            to: renamer.conflict_rename(merged_op, new_name)?,
                            sym_path: cr_sym_path.clone(),
                        }));
                    }
                    return Ok(Some(ActionKind::RenameUnmerged {
                        from: new_name.clone(),
                        to: renamer.conflict_rename(self, new_name)?,
                        sym_path: cr_sym_path.clone(),
                        caused_by_attr: None,
                        moved: false,
                        unmerged_parent_most_recent: BlockPointer::ZERO,
                        merged_parent_most_recent: BlockPointer::ZERO,
                    }));
                }
                if *renamed || *merged_renamed {
                    return Ok(Some(ActionKind::CopyUnmergedEntry {
                        from: new_name.clone(),
                        to: renamer.conflict_rename(self, new_name)?,
                        sym_path: cr_sym_path.clone(),
                        size_only: false,
                        unique: true,
                        unmerged_entry: None,
                        attrs: Vec::new(),
                    }));
                }
                Ok(None)
            }
            OpKind::Rm { old_name, .. } => match &merged_op.kind {
                OpKind::Create { new_name, .. } if new_name == old_name => {
                    Ok(Some(ActionKind::DropUnmerged {
                        op: Box::new(self.clone()),
                    }))
                }
                OpKind::Rm {
                    old_name: merged_name,
                    ..
                } if merged_name == old_name => Ok(Some(ActionKind::DropUnmerged {
                    op: Box::new(self.clone()),
                })),
                _ => Ok(None),
            },
            OpKind::Rename { .. } => Err(CrError::inconsistent(
                "renames must be split before conflict checks",
            )),
            OpKind::Sync {
                keep_unmerged_tail_name,
                ..
            } => match &merged_op.kind {
                OpKind::Sync { .. } => {
                    let path = self.require_final_path()?;
                    let merged_path = merged_op.require_final_path()?;
                    let to = if *keep_unmerged_tail_name {
                        path.tail_name().to_string()
                    } else {
                        renamer.conflict_rename(self, merged_path.tail_name())?
                    };
                    Ok(Some(ActionKind::RenameUnmerged {
                        from: path.tail_name().to_string(),
                        to,
                        sym_path: None,
                        caused_by_attr: None,
                        moved: false,
                        unmerged_parent_most_recent: path.parent_path().tail_ptr(),
                        merged_parent_most_recent: merged_path.parent_path().tail_ptr(),
                    }))
                }
                OpKind::SetAttr { .. } => {
                    let path = self.require_final_path()?;
                    let merged_path = merged_op.require_final_path()?;
                    Ok(Some(ActionKind::CopyUnmergedAttr {
                        from: path.tail_name().to_string(),
                        to: merged_path.tail_name().to_string(),
                        attrs: vec![AttrChange::Size],
                        moved: false,
                    }))
                }
                _ => Ok(None),
            },
            OpKind::SetAttr {
                attr,
                keep_unmerged_tail_name,
                ..
            } => {
                let OpKind::SetAttr {
                    attr: merged_attr, ..
                } = &merged_op.kind
                else {
                    return Ok(None);
                };
                if merged_attr != attr {
                    return Ok(None);
                }
                let path = self.require_final_path()?;
                let merged_path = merged_op.require_final_path()?;
                // A directory mtime conflict leaves a symlink carrying the
                // unmerged mtime that points at the merged entry.
                let (sym_path, caused_by_attr) = if is_file {
                    (None, None)
                } else {
                    (Some(merged_path.tail_name().to_string()), Some(*attr))
                };
                let from = path.tail_name().to_string();
                let to = if *keep_unmerged_tail_name {
                    from.clone()
                } else {
                    renamer.conflict_rename(self, &from)?
                };
                Ok(Some(ActionKind::RenameUnmerged {
                    from,
                    to,
                    sym_path,
                    caused_by_attr,
                    moved: false,
                    unmerged_parent_most_recent: path.parent_path().tail_ptr(),
                    merged_parent_most_recent: merged_path.parent_path().tail_ptr(),
                }))
            }
            OpKind::Resolution | OpKind::Gc { .. } => Ok(None),
        }
    }

    /// The action that replays this op when nothing in the merged branch
    /// conflicts with it.
    pub fn default_action(&self, merged_path: &NodePath) -> CrResult<Option<ActionKind>> {
        let action = match &self.kind {
            OpKind::Create {
                new_name,
                force_copy,
                cr_sym_path,
                ..
            } => {
                if *force_copy {
                    ActionKind::RenameUnmerged {
                        from: new_name.clone(),
                        to: new_name.clone(),
                        sym_path: cr_sym_path.clone(),
                        caused_by_attr: None,
                        moved: false,
                        unmerged_parent_most_recent: BlockPointer::ZERO,
                        merged_parent_most_recent: BlockPointer::ZERO,
                    }
                } else {
                    ActionKind::CopyUnmergedEntry {
                        from: new_name.clone(),
                        to: new_name.clone(),
                        sym_path: cr_sym_path.clone(),
                        size_only: false,
                        unique: false,
                        unmerged_entry: None,
                        attrs: Vec::new(),
                    }
                }
            }
            OpKind::Rm {
                old_name,
                drop_this,
                ..
            } => {
                if *drop_this {
                    ActionKind::DropUnmerged {
                        op: Box::new(self.clone()),
                    }
                } else {
                    ActionKind::RmMergedEntry {
                        name: old_name.clone(),
                    }
                }
            }
            OpKind::Sync { .. } => ActionKind::CopyUnmergedEntry {
                from: self.require_final_path()?.tail_name().to_string(),
                to: merged_path.tail_name().to_string(),
                sym_path: None,
                size_only: false,
                unique: false,
                unmerged_entry: None,
                attrs: Vec::new(),
            },
            OpKind::SetAttr { attr, .. } => ActionKind::CopyUnmergedAttr {
                from: self.require_final_path()?.tail_name().to_string(),
                to: merged_path.tail_name().to_string(),
                attrs: vec![*attr],
                moved: false,
            },
            OpKind::Rename { .. } | OpKind::Resolution | OpKind::Gc { .. } => return Ok(None),
        };
        Ok(Some(action))
    }

    /// The op that undoes this one from a local observer's point of view,
    /// with every pointer update reversed.
    pub fn invert_for_local_notifications(&self) -> Op {
        let mut inverted = match &self.kind {
            OpKind::Create { new_name, dir, .. } => Op::rm(new_name.clone(), dir.ref_),
            // The type is a guess; observers only need the name.
            OpKind::Rm { old_name, dir, .. } => {
                Op::create(old_name.clone(), dir.ref_, EntryType::File)
            }
            OpKind::Rename {
                old_name,
                old_dir,
                new_name,
                new_dir,
                renamed,
                renamed_type,
            } => {
                let new_dir_ref = new_dir.map(|nd| nd.ref_).unwrap_or(old_dir.ref_);
                Op::rename(
                    new_name.clone(),
                    new_dir_ref,
                    old_name.clone(),
                    old_dir.ref_,
                    *renamed,
                    *renamed_type,
                )
            }
            OpKind::Sync { file, writes, .. } => Op::sync(file.ref_).with_writes(writes.clone()),
            OpKind::SetAttr {
                name,
                dir,
                attr,
                file,
                ..
            } => Op::set_attr(name.clone(), dir.ref_, *attr, *file),
            OpKind::Gc { latest_rev } => Op::gc(*latest_rev),
            OpKind::Resolution => Op::resolution(),
        };
        inverted.final_path = self.final_path.clone();
        for update in self.all_updates() {
            inverted.add_update(update.ref_, update.unref);
        }
        inverted
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            OpKind::Create {
                new_name,
                entry_type,
                ..
            } => write!(f, "create {new_name} ({entry_type})"),
            OpKind::Rm { old_name, .. } => write!(f, "rm {old_name}"),
            OpKind::Rename {
                old_name, new_name, ..
            } => write!(f, "rename {old_name} -> {new_name}"),
            OpKind::Sync { file, writes, .. } => {
                write!(f, "sync {} ({} ranges)", file.unref, writes.len())
            }
            OpKind::SetAttr { name, attr, .. } => write!(f, "setAttr {name} {attr}"),
            OpKind::Resolution => f.write_str("resolution"),
            OpKind::Gc { latest_rev } => write!(f, "gc {latest_rev}"),
        }
    }
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    fn arb_range() -> impl Strategy<Value = WriteRange> {
        (0u64..64, 0u64..16).prop_map(|(off, len)| WriteRange { off, len })
    }

    /// Dirty-byte map of a list of plain writes.
    fn apply(ranges: &[WriteRange]) -> Vec<bool> {
        let mut dirty = vec![false; 160];
        for r in ranges {
            for b in dirty.iter_mut().skip(r.off as usize).take(r.len as usize) {
                *b = true;
            }
        }
        dirty
    }

    proptest! {
        #[test]
        fn collapsed_ranges_are_sorted_and_disjoint(ranges in proptest::collection::vec(arb_range(), 0..12)) {
            let collapsed = collapse_write_range(&[], &ranges);
            let truncates = collapsed.iter().filter(|r| r.is_truncate()).count();
            prop_assert!(truncates <= 1);
            if truncates == 1 {
                prop_assert!(collapsed.last().map(|r| r.is_truncate()).unwrap_or(false));
            }
            for pair in collapsed.windows(2) {
                prop_assert!(pair[0].end() < pair[1].off || pair[1].is_truncate());
            }
        }

        #[test]
        fn collapse_covers_every_dirty_byte(ranges in proptest::collection::vec(
            (0u64..64, 1u64..16).prop_map(|(off, len)| WriteRange { off, len }), 0..12)
        ) {
            // Writes only: every byte dirtied by the input stays dirty.
            let collapsed = collapse_write_range(&[], &ranges);
            let expected = apply(&ranges);
            let got = apply(&collapsed);
            for (i, (e, g)) in expected.iter().zip(got.iter()).enumerate() {
                prop_assert!(*g || !*e, "byte {} lost", i);
            }
        }
    }
}
