//! One resolution attempt as a phase state machine.
//!
//! `Queued -> BuildingChains -> ResolvingPaths -> FixingConflicts ->
//! ComputingActions -> ExecutingActions -> Finalizing`, then the resolved
//! revision is committed. Cancellation is checked on entry to every phase
//! and once more right before anything is written.

use std::fmt;

use tracing::{debug, warn};

use tlfcr_core::{BranchId, CrError, CrResult, Revision, WriterInfo};
use tlfcr_storage::{BlockPutState, BlockStore};

use crate::chains::Chains;
use crate::compute::compute_actions;
use crate::execute::execute_actions;
use crate::finalize::{fast_forward, finalize, Resolved};
use crate::fixup::{add_merged_recreates, add_recreate_ops_to_unmerged_chains, fix_rename_conflicts};
use crate::folder::{Folder, RequestContext};
use crate::merge_paths::{find_created_dirs_to_merge, resolve_merged_paths};
use crate::path::sort_paths;
use crate::renamer::ConflictRenamer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Queued,
    BuildingChains,
    ResolvingPaths,
    FixingConflicts,
    ComputingActions,
    ExecutingActions,
    Finalizing,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Phase::Queued => "queued",
            Phase::BuildingChains => "building_chains",
            Phase::ResolvingPaths => "resolving_paths",
            Phase::FixingConflicts => "fixing_conflicts",
            Phase::ComputingActions => "computing_actions",
            Phase::ExecutingActions => "executing_actions",
            Phase::Finalizing => "finalizing",
        };
        f.write_str(s)
    }
}

/// How a finished attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The folder had no unmerged revisions.
    NothingToDo,
    /// The merged branch had not moved; the unmerged branch was committed
    /// on top of the branch point.
    FastForwarded { revision: Revision },
    Committed {
        revision: Revision,
        ops: usize,
        blocks: usize,
    },
}

impl Outcome {
    pub fn committed_revision(&self) -> Option<Revision> {
        match self {
            Outcome::NothingToDo => None,
            Outcome::FastForwarded { revision } | Outcome::Committed { revision, .. } => Some(*revision),
        }
    }
}

/// A single resolution attempt against one folder.
pub struct Attempt<'a> {
    folder: &'a dyn Folder,
    renamer: &'a dyn ConflictRenamer,
    ctx: &'a RequestContext,
    phase: Phase,
}

impl<'a> Attempt<'a> {
    pub fn new(folder: &'a dyn Folder, renamer: &'a dyn ConflictRenamer, ctx: &'a RequestContext) -> Self {
        Attempt {
            folder,
            renamer,
            ctx,
            phase: Phase::Queued,
        }
    }

    /// The phase the attempt is in, or stopped in.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    fn enter(&mut self, phase: Phase) -> CrResult<()> {
        self.ctx.check_canceled()?;
        debug!(folder = %self.folder.id(), %phase, "entering phase");
        self.phase = phase;
        Ok(())
    }

    pub async fn run(&mut self) -> CrResult<Outcome> {
        let folder = self.folder;
        let store = folder.block_store();

        self.enter(Phase::BuildingChains)?;
        folder.sync_all(self.ctx)?;
        let branch = folder.unmerged_branch()?;
        let Some(first) = branch.revisions.first() else {
            debug!(folder = %folder.id(), "no unmerged revisions, nothing to resolve");
            return Ok(Outcome::NothingToDo);
        };
        let unmerged_branch = first.branch.clone();
        let branch_point = folder.merged_revision(branch.branch_point)?;
        let merged_mds = folder.merged_revisions_since(branch.branch_point)?;

        let Some(base) = merged_mds.last() else {
            self.enter(Phase::Finalizing)?;
            let resolved = fast_forward(&branch_point, &branch.revisions)?;
            let revision = resolved.md.revision;
            self.commit(store, resolved).await?;
            return Ok(Outcome::FastForwarded { revision });
        };

        let mut unmerged = Chains::from_revisions(unmerged_branch, &branch.revisions, store).await?;
        let mut merged = Chains::from_revisions(BranchId::Master, &merged_mds, store).await?;
        if !merged.original_root.is_initialized() {
            merged.original_root = branch_point.root;
        }

        self.enter(Phase::ResolvingPaths)?;
        let mut unmerged_paths = unmerged.get_paths(store).await?;
        let created = find_created_dirs_to_merge(store, &unmerged_paths, &mut unmerged, &mut merged).await?;
        if !created.is_empty() {
            unmerged_paths.extend(created);
            sort_paths(&mut unmerged_paths);
        }
        let writer = WriterInfo::new(unmerged.head_writer.writer.clone(), unmerged.head_revision());
        let (mut merged_paths, recreate_ops, discovered) =
            resolve_merged_paths(store, &unmerged_paths, &mut unmerged, &mut merged, &writer).await?;
        if !discovered.is_empty() {
            unmerged_paths.extend(discovered);
            sort_paths(&mut unmerged_paths);
        }
        debug!(
            folder = %folder.id(),
            unmerged_paths = unmerged_paths.len(),
            merged_paths = merged_paths.len(),
            recreates = recreate_ops.len(),
            "resolved merged paths"
        );

        self.enter(Phase::FixingConflicts)?;
        let mut new_paths =
            add_recreate_ops_to_unmerged_chains(recreate_ops, &mut unmerged, &merged, &mut merged_paths)?;
        new_paths.extend(fix_rename_conflicts(store, &mut unmerged, &mut merged, &mut merged_paths).await?);
        let merged_writer = merged.head_writer.clone();
        add_merged_recreates(&mut unmerged, &mut merged, &merged_writer)?;

        self.enter(Phase::ComputingActions)?;
        let (action_map, collapsed) =
            compute_actions(self.renamer, &mut unmerged, &merged, &unmerged_paths, &mut merged_paths)?;
        if !new_paths.is_empty() || !collapsed.is_empty() {
            unmerged_paths.extend(new_paths);
            unmerged_paths.extend(collapsed);
            sort_paths(&mut unmerged_paths);
        }

        self.enter(Phase::ExecutingActions)?;
        let mut put_state = BlockPutState::new();
        let executed = execute_actions(
            self.ctx,
            store,
            &mut unmerged,
            &mut merged,
            &merged_paths,
            action_map,
            &mut put_state,
        )
        .await?;

        self.enter(Phase::Finalizing)?;
        let resolved = finalize(
            self.ctx,
            store,
            base,
            &unmerged,
            &merged,
            &unmerged_paths,
            &merged_paths,
            executed,
            put_state,
        )
        .await?;
        let outcome = Outcome::Committed {
            revision: resolved.md.revision,
            ops: resolved.md.ops.len(),
            blocks: resolved.put_state.len(),
        };
        self.commit(store, resolved).await?;
        Ok(outcome)
    }

    /// Write the new blocks and hand the revision to the folder. Blocks
    /// already written are deleted again if either step fails.
    async fn commit(&self, store: &BlockStore, resolved: Resolved) -> CrResult<()> {
        self.ctx.check_canceled()?;
        let Resolved {
            md,
            local_ops,
            put_state,
        } = resolved;
        let ptrs = put_state.ptrs();
        let result = match store.put_all(put_state).await {
            Ok(()) => self.folder.commit_resolution(self.ctx, md, local_ops),
            Err(e) => Err(e),
        };
        if let Err(err) = result {
            if !ptrs.is_empty() {
                if let Err(cleanup) = store.delete(&ptrs).await {
                    warn!(
                        folder = %self.folder.id(),
                        blocks = ptrs.len(),
                        error = %cleanup,
                        "failed to clean up blocks of an uncommitted resolution"
                    );
                }
            }
            return Err(err);
        }
        Ok(())
    }
}

/// Run one attempt to completion.
pub async fn run_attempt(
    folder: &dyn Folder,
    renamer: &dyn ConflictRenamer,
    ctx: &RequestContext,
) -> CrResult<Outcome> {
    Attempt::new(folder, renamer, ctx).run().await
}

/// Turn a caught panic payload into a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// The error recorded for a panicking attempt.
pub(crate) fn panic_error(message: &str) -> CrError {
    CrError::Other(anyhow::anyhow!("panic during conflict resolution: {message}"))
}
