//! An in-memory [`Folder`]: a merged branch plus at most one unmerged
//! branch, both stored in a [`BlockStore`]. Edits are applied the way a
//! writing client would, so every revision carries realistic ops with
//! full pointer-update bookkeeping. Used by the integration tests and the
//! CLI demo.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use tlfcr_core::types::{Block, DirBlock, DirEntry, EntryType, FileBlock};
use tlfcr_core::{BlockPointer, BranchId, CrError, CrResult, Revision};
use tlfcr_storage::BlockStore;

use crate::folder::{ConflictInput, Folder, RequestContext, RevisionMetadata, UnmergedBranch};
use crate::ops::{AttrChange, Op, WriteRange};

/// One client-side filesystem change. Paths are `/`-separated and
/// relative to the folder root.
#[derive(Debug, Clone)]
pub enum Edit {
    Mkdir(String),
    Create(String, Vec<u8>),
    Symlink(String, String),
    Write {
        path: String,
        offset: u64,
        data: Vec<u8>,
    },
    Truncate(String, u64),
    Rm(String),
    Rename(String, String),
    SetMtime(String, i64),
    SetExec(String, bool),
}

/// A node in a flattened tree listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Dir,
    File(Vec<u8>),
    Exec(Vec<u8>),
    Symlink(String),
}

type SyncHook = Box<dyn Fn(&RequestContext) + Send + Sync>;

#[derive(Default)]
struct FolderState {
    merged: Vec<RevisionMetadata>,
    unmerged: Option<UnmergedBranch>,
    local_ops: Vec<Vec<Op>>,
    rejected: Vec<RevisionMetadata>,
    errors: Vec<String>,
    stuck_changes: Vec<bool>,
    writes_blocked: bool,
    blocked_history: Vec<bool>,
    fail_next_commits: usize,
    syncs: usize,
}

impl FolderState {
    fn merged_head(&self) -> &RevisionMetadata {
        // Never empty: `MemoryFolder::new` writes revision 1.
        &self.merged[self.merged.len() - 1]
    }
}

pub struct MemoryFolder {
    id: String,
    store: BlockStore,
    unmerged_branch_id: BranchId,
    state: Mutex<FolderState>,
    on_sync: Mutex<Option<SyncHook>>,
}

impl MemoryFolder {
    /// A folder whose merged branch holds one revision with an empty root.
    pub async fn new(id: impl Into<String>) -> CrResult<Self> {
        let store = BlockStore::memory()?;
        Self::with_store(id, store).await
    }

    pub async fn with_store(id: impl Into<String>, store: BlockStore) -> CrResult<Self> {
        let root = store.put(&Block::Dir(DirBlock::new())).await?;
        let initial = RevisionMetadata {
            revision: Revision::INITIAL,
            branch: BranchId::Master,
            root,
            writer: "init".into(),
            ops: Vec::new(),
        };
        Ok(MemoryFolder {
            id: id.into(),
            store,
            unmerged_branch_id: BranchId::Unmerged("local".into()),
            state: Mutex::new(FolderState {
                merged: vec![initial],
                ..FolderState::default()
            }),
            on_sync: Mutex::new(None),
        })
    }

    fn state(&self) -> MutexGuard<'_, FolderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Writing ──────────────────────────────────────────────────────────

    /// Apply `edits` as one new merged revision, as another device would.
    pub async fn merged_edit(&self, writer: &str, edits: Vec<Edit>) -> CrResult<Revision> {
        let (base_root, revision) = {
            let state = self.state();
            let head = state.merged_head();
            (head.root, head.revision.next())
        };
        let (root, ops) = apply_edits(&self.store, base_root, edits).await?;
        let mut state = self.state();
        if state.merged_head().root != base_root {
            return Err(CrError::inconsistent("merged branch moved during edit"));
        }
        state.merged.push(RevisionMetadata {
            revision,
            branch: BranchId::Master,
            root,
            writer: writer.to_string(),
            ops,
        });
        debug!(folder = %self.id, %revision, "merged edit");
        Ok(revision)
    }

    /// Apply `edits` as one new local revision, starting the unmerged
    /// branch at the current merged head if there is none.
    pub async fn unmerged_edit(&self, writer: &str, edits: Vec<Edit>) -> CrResult<Revision> {
        let (base_root, revision) = {
            let state = self.state();
            if state.writes_blocked {
                return Err(CrError::Other(anyhow::anyhow!(
                    "unmerged writes to {} are blocked during conflict resolution",
                    self.id
                )));
            }
            match &state.unmerged {
                Some(branch) => match branch.revisions.last() {
                    Some(last) => (last.root, last.revision.next()),
                    None => {
                        let point = &state.merged[branch_index(branch.branch_point)?];
                        (point.root, point.revision.next())
                    }
                },
                None => {
                    let head = state.merged_head();
                    (head.root, head.revision.next())
                }
            }
        };
        let (root, ops) = apply_edits(&self.store, base_root, edits).await?;
        let mut state = self.state();
        let merged_head = state.merged_head().revision;
        let branch = state.unmerged.get_or_insert_with(|| UnmergedBranch {
            branch_point: merged_head,
            revisions: Vec::new(),
        });
        branch.revisions.push(RevisionMetadata {
            revision,
            branch: self.unmerged_branch_id.clone(),
            root,
            writer: writer.to_string(),
            ops,
        });
        debug!(folder = %self.id, %revision, "unmerged edit");
        Ok(revision)
    }

    // ── Hooks and failure injection ──────────────────────────────────────

    /// Run `hook` on every [`Folder::sync_all`].
    pub fn set_on_sync(&self, hook: impl Fn(&RequestContext) + Send + Sync + 'static) {
        *self.on_sync.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(hook));
    }

    /// Make the next `n` commits fail with a storage error.
    pub fn fail_next_commits(&self, n: usize) {
        self.state().fail_next_commits = n;
    }

    // ── Inspection ───────────────────────────────────────────────────────

    pub fn store(&self) -> &BlockStore {
        &self.store
    }

    pub fn merged_head(&self) -> Revision {
        self.state().merged_head().revision
    }

    pub fn merged_revisions(&self) -> Vec<RevisionMetadata> {
        self.state().merged.clone()
    }

    pub fn unmerged_head(&self) -> Option<Revision> {
        let state = self.state();
        let branch = state.unmerged.as_ref()?;
        Some(
            branch
                .revisions
                .last()
                .map(|md| md.revision)
                .unwrap_or(branch.branch_point),
        )
    }

    /// The input a client would hand the resolver right now.
    pub fn conflict_input(&self) -> ConflictInput {
        let merged = self.merged_head();
        ConflictInput::new(self.unmerged_head().unwrap_or(Revision::UNINITIALIZED), merged)
    }

    /// Local notification op lists, one per commit.
    pub fn local_ops(&self) -> Vec<Vec<Op>> {
        self.state().local_ops.clone()
    }

    /// Revisions handed to commits that were made to fail.
    pub fn rejected_commits(&self) -> Vec<RevisionMetadata> {
        self.state().rejected.clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.state().errors.clone()
    }

    pub fn stuck_changes(&self) -> Vec<bool> {
        self.state().stuck_changes.clone()
    }

    pub fn writes_blocked_history(&self) -> Vec<bool> {
        self.state().blocked_history.clone()
    }

    pub fn sync_count(&self) -> usize {
        self.state().syncs
    }

    /// Every path of the merged head, depth first.
    pub async fn snapshot(&self) -> CrResult<BTreeMap<String, Node>> {
        let root = self.state().merged_head().root;
        snapshot_tree(&self.store, root).await
    }

    /// Every path of the unmerged head, if there is an unmerged branch.
    pub async fn unmerged_snapshot(&self) -> CrResult<Option<BTreeMap<String, Node>>> {
        let root = {
            let state = self.state();
            match &state.unmerged {
                Some(branch) => match branch.revisions.last() {
                    Some(md) => md.root,
                    None => state.merged[branch_index(branch.branch_point)?].root,
                },
                None => return Ok(None),
            }
        };
        Ok(Some(snapshot_tree(&self.store, root).await?))
    }
}

fn branch_index(revision: Revision) -> CrResult<usize> {
    if !revision.is_initialized() {
        return Err(CrError::inconsistent(format!("bad merged revision {revision}")));
    }
    Ok((revision.0 - Revision::INITIAL.0) as usize)
}

impl Folder for MemoryFolder {
    fn id(&self) -> &str {
        &self.id
    }

    fn block_store(&self) -> &BlockStore {
        &self.store
    }

    fn unmerged_branch(&self) -> CrResult<UnmergedBranch> {
        let state = self.state();
        Ok(state.unmerged.clone().unwrap_or_else(|| UnmergedBranch {
            branch_point: state.merged_head().revision,
            revisions: Vec::new(),
        }))
    }

    fn merged_revisions_since(&self, after: Revision) -> CrResult<Vec<RevisionMetadata>> {
        Ok(self
            .state()
            .merged
            .iter()
            .filter(|md| md.revision > after)
            .cloned()
            .collect())
    }

    fn merged_revision(&self, revision: Revision) -> CrResult<RevisionMetadata> {
        let state = self.state();
        state
            .merged
            .get(branch_index(revision)?)
            .cloned()
            .ok_or_else(|| CrError::inconsistent(format!("no merged revision {revision}")))
    }

    fn sync_all(&self, ctx: &RequestContext) -> CrResult<()> {
        self.state().syncs += 1;
        if let Some(hook) = self.on_sync.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            hook(ctx);
        }
        Ok(())
    }

    fn set_unmerged_writes_blocked(&self, blocked: bool) {
        let mut state = self.state();
        state.writes_blocked = blocked;
        state.blocked_history.push(blocked);
    }

    fn commit_resolution(
        &self,
        ctx: &RequestContext,
        md: RevisionMetadata,
        local_ops: Vec<Op>,
    ) -> CrResult<()> {
        ctx.check_canceled()?;
        let mut state = self.state();
        if state.fail_next_commits > 0 {
            state.fail_next_commits -= 1;
            let revision = md.revision;
            state.rejected.push(md);
            return Err(CrError::Storage(format!("injected commit failure for {} at {revision}", self.id)));
        }
        let expected = state.merged_head().revision.next();
        if md.revision != expected || !md.branch.is_master() {
            return Err(CrError::inconsistent(format!(
                "resolved revision {} on {} does not follow merged head (want {expected})",
                md.revision, md.branch
            )));
        }
        debug!(folder = %self.id, revision = %md.revision, ops = md.ops.len(), "committed resolution");
        state.merged.push(md);
        state.unmerged = None;
        state.local_ops.push(local_ops);
        Ok(())
    }

    fn report_error(&self, err: &CrError) {
        tracing::error!(folder = %self.id, error = %err, "conflict resolution failed");
        self.state().errors.push(err.to_string());
    }

    fn notify_stuck_changed(&self, stuck: bool) {
        tracing::warn!(folder = %self.id, stuck, "folder stuck state changed");
        self.state().stuck_changes.push(stuck);
    }
}

// ── Tree writes ──────────────────────────────────────────────────────────────

fn split_path(path: &str) -> CrResult<(Vec<String>, String)> {
    let mut parts: Vec<String> = path
        .split('/')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();
    let name = parts
        .pop()
        .ok_or_else(|| CrError::inconsistent(format!("empty path {path:?}")))?;
    Ok((parts, name))
}

struct LoadedDir {
    ptr: BlockPointer,
    block: DirBlock,
    dirty: bool,
}

/// Directories loaded from one root snapshot, keyed by their path, and
/// rewritten bottom-up on flush.
struct TreeWriter<'a> {
    store: &'a BlockStore,
    dirs: BTreeMap<Vec<String>, LoadedDir>,
}

impl<'a> TreeWriter<'a> {
    async fn new(store: &'a BlockStore, root: BlockPointer) -> CrResult<Self> {
        let block = store.get_dir(root).await?;
        let mut dirs = BTreeMap::new();
        dirs.insert(
            Vec::new(),
            LoadedDir {
                ptr: root,
                block,
                dirty: false,
            },
        );
        Ok(TreeWriter { store, dirs })
    }

    /// Load `path` and every directory above it.
    async fn load(&mut self, path: &[String]) -> CrResult<()> {
        for depth in 1..=path.len() {
            let prefix = &path[..depth];
            if self.dirs.contains_key(prefix) {
                continue;
            }
            let parent = self.dir(&path[..depth - 1])?;
            let entry = parent.block.lookup(parent.ptr, &path[depth - 1])?;
            if entry.entry_type != EntryType::Dir {
                return Err(CrError::NotDirBlock(entry.ptr));
            }
            let ptr = entry.ptr;
            let block = self.store.get_dir(ptr).await?;
            self.dirs.insert(
                prefix.to_vec(),
                LoadedDir {
                    ptr,
                    block,
                    dirty: false,
                },
            );
        }
        Ok(())
    }

    fn dir(&self, path: &[String]) -> CrResult<&LoadedDir> {
        self.dirs
            .get(path)
            .ok_or_else(|| CrError::inconsistent(format!("directory /{} not loaded", path.join("/"))))
    }

    fn dir_mut(&mut self, path: &[String]) -> CrResult<&mut LoadedDir> {
        let dir = self
            .dirs
            .get_mut(path)
            .ok_or_else(|| CrError::inconsistent(format!("directory /{} not loaded", path.join("/"))))?;
        dir.dirty = true;
        Ok(dir)
    }

    /// Write every dirty directory deepest first, recording each
    /// `old -> new` pointer update on `op`. Returns the new root.
    async fn flush(mut self, op: &mut Op) -> CrResult<BlockPointer> {
        let max_depth = self.dirs.keys().map(Vec::len).max().unwrap_or(0);
        for depth in (0..=max_depth).rev() {
            let dirty: Vec<Vec<String>> = self
                .dirs
                .iter()
                .filter(|(k, d)| k.len() == depth && d.dirty)
                .map(|(k, _)| k.clone())
                .collect();
            for key in dirty {
                let (old, block) = {
                    let dir = self.dir(&key)?;
                    (dir.ptr, dir.block.clone())
                };
                let new = self.store.put(&Block::Dir(block)).await?;
                op.add_update(old, new);
                if let Some((name, parent_key)) = key.split_last() {
                    let parent = self.dir_mut(parent_key)?;
                    let entry = parent
                        .block
                        .children
                        .get_mut(name)
                        .ok_or_else(|| CrError::NoSuchName {
                            dir: old,
                            name: name.clone(),
                        })?;
                    entry.ptr = new;
                }
                if let Some(dir) = self.dirs.get_mut(&key) {
                    dir.ptr = new;
                    dir.dirty = false;
                }
            }
        }
        Ok(self.dir(&[])?.ptr)
    }
}

async fn apply_edits(
    store: &BlockStore,
    mut root: BlockPointer,
    edits: Vec<Edit>,
) -> CrResult<(BlockPointer, Vec<Op>)> {
    let mut ops = Vec::with_capacity(edits.len());
    for edit in edits {
        let (new_root, op) = apply_edit(store, root, edit).await?;
        root = new_root;
        ops.push(op);
    }
    Ok((root, ops))
}

async fn apply_edit(store: &BlockStore, root: BlockPointer, edit: Edit) -> CrResult<(BlockPointer, Op)> {
    let mut tree = TreeWriter::new(store, root).await?;
    let mut op = match edit {
        Edit::Mkdir(path) => {
            let ptr = store.put(&Block::Dir(DirBlock::new())).await?;
            create_entry(&mut tree, &path, DirEntry::new(ptr, EntryType::Dir)).await?
        }
        Edit::Create(path, contents) => {
            let size = contents.len() as u64;
            let ptr = store.put(&Block::File(FileBlock { contents })).await?;
            let mut entry = DirEntry::new(ptr, EntryType::File);
            entry.size = size;
            create_entry(&mut tree, &path, entry).await?
        }
        Edit::Symlink(path, target) => create_entry(&mut tree, &path, DirEntry::symlink(target)).await?,
        Edit::Write { path, offset, data } => {
            let range = WriteRange::write(offset, data.len() as u64);
            rewrite_file(&mut tree, &path, range, |contents| {
                let end = offset as usize + data.len();
                if contents.len() < end {
                    contents.resize(end, 0);
                }
                contents[offset as usize..end].copy_from_slice(&data);
            })
            .await?
        }
        Edit::Truncate(path, size) => {
            rewrite_file(&mut tree, &path, WriteRange::truncate(size), |contents| {
                contents.resize(size as usize, 0);
            })
            .await?
        }
        Edit::Rm(path) => {
            let (parent, name) = split_path(&path)?;
            tree.load(&parent).await?;
            let dir = tree.dir_mut(&parent)?;
            let entry = dir.block.lookup(dir.ptr, &name)?.clone();
            if entry.entry_type == EntryType::Dir && !store.get_dir(entry.ptr).await?.children.is_empty() {
                return Err(CrError::inconsistent(format!("directory {path} not empty")));
            }
            let dir = tree.dir_mut(&parent)?;
            let mut op = Op::rm(name.as_str(), dir.ptr);
            if entry.ptr.is_initialized() {
                op.add_unref(entry.ptr);
            }
            dir.block.remove_entry(&name);
            op
        }
        Edit::Rename(from, to) => {
            let (old_parent, old_name) = split_path(&from)?;
            let (new_parent, new_name) = split_path(&to)?;
            let moved: Vec<String> = old_parent.iter().cloned().chain([old_name.clone()]).collect();
            if new_parent.starts_with(&moved) {
                return Err(CrError::inconsistent(format!("cannot move {from} into itself")));
            }
            tree.load(&old_parent).await?;
            tree.load(&new_parent).await?;
            let old_dir_ptr = tree.dir(&old_parent)?.ptr;
            let new_dir_ptr = tree.dir(&new_parent)?.ptr;

            let src = tree.dir_mut(&old_parent)?;
            let entry = src
                .block
                .remove_entry(&old_name)
                .ok_or_else(|| CrError::NoSuchName {
                    dir: old_dir_ptr,
                    name: old_name.clone(),
                })?;
            let mut op = Op::rename(
                old_name.as_str(),
                old_dir_ptr,
                new_name.as_str(),
                new_dir_ptr,
                entry.ptr,
                entry.entry_type,
            );
            let dst = tree.dir_mut(&new_parent)?;
            if let Some(replaced) = dst.block.set_entry(&new_name, entry) {
                op.add_unref(replaced);
            }
            op
        }
        Edit::SetMtime(path, mtime) => {
            set_attr(&mut tree, &path, AttrChange::Mtime, |entry| entry.mtime = mtime).await?
        }
        Edit::SetExec(path, exec) => {
            set_attr(&mut tree, &path, AttrChange::Exec, |entry| {
                entry.entry_type = if exec { EntryType::Exec } else { EntryType::File };
            })
            .await?
        }
    };
    let new_root = tree.flush(&mut op).await?;
    Ok((new_root, op))
}

async fn create_entry(tree: &mut TreeWriter<'_>, path: &str, entry: DirEntry) -> CrResult<Op> {
    let (parent, name) = split_path(path)?;
    tree.load(&parent).await?;
    let dir = tree.dir_mut(&parent)?;
    if dir.block.contains(&name) {
        return Err(CrError::inconsistent(format!("{path} already exists")));
    }
    let mut op = Op::create(name.as_str(), dir.ptr, entry.entry_type);
    if entry.ptr.is_initialized() {
        op.add_ref(entry.ptr);
    }
    dir.block.set_entry(&name, entry);
    Ok(op)
}

async fn rewrite_file(
    tree: &mut TreeWriter<'_>,
    path: &str,
    range: WriteRange,
    edit: impl FnOnce(&mut Vec<u8>),
) -> CrResult<Op> {
    let (parent, name) = split_path(path)?;
    tree.load(&parent).await?;
    let dir = tree.dir(&parent)?;
    let entry = dir.block.lookup(dir.ptr, &name)?;
    if !entry.entry_type.is_file() {
        return Err(CrError::NotFileBlock(entry.ptr));
    }
    let old = entry.ptr;
    let mut file = tree.store.get_file(old).await?;
    edit(&mut file.contents);
    let size = file.contents.len() as u64;
    let new = tree.store.put(&Block::File(file)).await?;

    let dir = tree.dir_mut(&parent)?;
    if let Some(entry) = dir.block.children.get_mut(&name) {
        entry.ptr = new;
        entry.size = size;
    }
    let mut op = Op::sync(old).with_writes(vec![range]);
    op.add_update(old, new);
    Ok(op)
}

async fn set_attr(
    tree: &mut TreeWriter<'_>,
    path: &str,
    attr: AttrChange,
    edit: impl FnOnce(&mut DirEntry),
) -> CrResult<Op> {
    let (parent, name) = split_path(path)?;
    tree.load(&parent).await?;
    let dir = tree.dir_mut(&parent)?;
    let dir_ptr = dir.ptr;
    let entry = dir
        .block
        .children
        .get_mut(&name)
        .ok_or_else(|| CrError::NoSuchName {
            dir: dir_ptr,
            name: name.clone(),
        })?;
    if entry.entry_type == EntryType::Sym {
        return Err(CrError::inconsistent(format!("cannot set {attr} on symlink {path}")));
    }
    edit(entry);
    Ok(Op::set_attr(name.as_str(), dir_ptr, attr, entry.ptr))
}

/// Flatten the tree under `root` into `path -> node`. A directory
/// reachable twice is an error.
pub async fn snapshot_tree(store: &BlockStore, root: BlockPointer) -> CrResult<BTreeMap<String, Node>> {
    let mut out = BTreeMap::new();
    let mut seen = HashSet::new();
    let mut pending = vec![(String::new(), root)];
    while let Some((prefix, ptr)) = pending.pop() {
        if !seen.insert(ptr) {
            return Err(CrError::inconsistent(format!(
                "directory {ptr} reachable twice (at /{prefix})"
            )));
        }
        let dir = store.get_dir(ptr).await?;
        for (name, entry) in &dir.children {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}/{name}")
            };
            let node = match entry.entry_type {
                EntryType::Dir => {
                    pending.push((path.clone(), entry.ptr));
                    Node::Dir
                }
                EntryType::File => Node::File(store.get_file(entry.ptr).await?.contents),
                EntryType::Exec => Node::Exec(store.get_file(entry.ptr).await?.contents),
                EntryType::Sym => Node::Symlink(entry.sym_path.clone().unwrap_or_default()),
            };
            out.insert(path, node);
        }
    }
    Ok(out)
}
