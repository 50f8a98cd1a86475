//! Applying action lists to scratch copies of merged directories.

use std::collections::HashMap;

use tracing::debug;

use tlfcr_core::types::DirBlock;
use tlfcr_core::{BlockPointer, CrError, CrResult};
use tlfcr_storage::{BlockPutState, BlockStore};

use crate::actions::{ActionMap, FileCopier, SourceDir};
use crate::chains::Chains;
use crate::folder::RequestContext;
use crate::merge_paths::MergedPaths;

/// Result of running every action list.
#[derive(Debug, Default)]
pub struct Executed {
    /// Rewritten merged directories, keyed by their merged pointer.
    pub dirs: HashMap<BlockPointer, DirBlock>,
    /// Pointers the rewritten directories no longer reference.
    pub unrefs: Vec<BlockPointer>,
}

#[derive(Default)]
struct DirCache {
    dirs: HashMap<BlockPointer, DirBlock>,
}

impl DirCache {
    async fn get(&mut self, store: &BlockStore, ptr: BlockPointer) -> CrResult<DirBlock> {
        if let Some(dir) = self.dirs.get(&ptr) {
            return Ok(dir.clone());
        }
        let dir = if ptr.is_initialized() {
            store.get_dir(ptr).await?
        } else {
            DirBlock::new()
        };
        self.dirs.insert(ptr, dir.clone());
        Ok(dir)
    }
}

/// The merged directory an action list starts from. Directories the
/// merged branch deleted come back empty.
pub(crate) async fn load_merged_dir(
    store: &BlockStore,
    merged: &Chains,
    ptr: BlockPointer,
) -> CrResult<DirBlock> {
    if merged.is_deleted(merged.original_of(ptr)) {
        return Ok(DirBlock::new());
    }
    match store.get_dir(ptr).await {
        Ok(dir) => Ok(dir),
        Err(CrError::NodeNotFound(_)) => {
            debug!(%ptr, "merged directory has no block, starting empty");
            Ok(DirBlock::new())
        }
        Err(e) => Err(e),
    }
}

/// Deepest merged path ending at `ptr`; directories deeper in the tree
/// are processed first.
fn merged_depth(merged_paths: &MergedPaths, ptr: BlockPointer) -> usize {
    merged_paths
        .values()
        .filter(|p| p.tail_ptr() == ptr)
        .map(|p| p.len())
        .max()
        .unwrap_or(0)
}

/// Run each merged directory's actions against a scratch copy of it,
/// then let every action rewrite the chains. New file copies land in
/// `put_state`.
pub async fn execute_actions(
    ctx: &RequestContext,
    store: &BlockStore,
    unmerged: &mut Chains,
    merged: &mut Chains,
    merged_paths: &MergedPaths,
    action_map: ActionMap,
    put_state: &mut BlockPutState,
) -> CrResult<Executed> {
    let mut keyed: Vec<_> = action_map.into_iter().collect();
    keyed.sort_by_key(|(ptr, _)| (std::cmp::Reverse(merged_depth(merged_paths, *ptr)), *ptr));

    let mut unmerged_dirs = DirCache::default();
    let mut executed = Executed::default();
    for (merged_ptr, mut actions) in keyed {
        ctx.check_canceled()?;
        let mut merged_dir = load_merged_dir(store, merged, merged_ptr).await?;

        {
            let mut files = FileCopier::new(store, put_state);
            for action in actions.iter_mut() {
                let unmerged_dir = unmerged_dirs.get(store, action.unmerged_dir).await?;
                let source = match action.swap_unmerged_block(unmerged, merged, &unmerged_dir)? {
                    SourceDir::Unmerged => unmerged_dir,
                    SourceDir::Merged => merged_dir.clone(),
                    SourceDir::Other(ptr) => store.get_dir(ptr).await?,
                };
                debug!(dir = %merged_ptr, %action, "applying action");
                executed
                    .unrefs
                    .extend(action.apply(&mut files, &source, &mut merged_dir).await?);
            }
        }

        for action in &actions {
            let unmerged_dir = unmerged_dirs.get(store, action.unmerged_dir).await?;
            action.update_ops(&unmerged_dir, &merged_dir, unmerged, merged)?;
        }
        executed.dirs.insert(merged_ptr, merged_dir);
    }
    Ok(executed)
}
