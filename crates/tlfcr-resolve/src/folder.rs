//! The folder collaborator: where revisions come from and where a
//! resolution is committed.

use std::fmt;

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tlfcr_core::{BlockPointer, BranchId, CrError, CrResult, Revision, WriterInfo};
use tlfcr_storage::BlockStore;

use crate::ops::Op;

/// One immutable revision of a folder.
#[derive(Debug, Clone)]
pub struct RevisionMetadata {
    pub revision: Revision,
    pub branch: BranchId,
    pub root: BlockPointer,
    pub writer: String,
    pub ops: Vec<Op>,
}

impl RevisionMetadata {
    pub fn writer_info(&self) -> WriterInfo {
        WriterInfo::new(self.writer.clone(), self.revision)
    }
}

/// The local branch: the merged revision it forked from, then every
/// unmerged revision after it, oldest first.
#[derive(Debug, Clone, Default)]
pub struct UnmergedBranch {
    pub branch_point: Revision,
    pub revisions: Vec<RevisionMetadata>,
}

/// A resolution request: the newest unmerged and merged revisions known
/// when it was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConflictInput {
    pub unmerged: Revision,
    pub merged: Revision,
}

impl ConflictInput {
    pub fn new(unmerged: Revision, merged: Revision) -> Self {
        ConflictInput { unmerged, merged }
    }
}

impl fmt::Display for ConflictInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unmerged={} merged={}", self.unmerged, self.merged)
    }
}

/// Per-request context. Requests issued by the resolver itself carry the
/// id of the resolution that issued them.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub cr_id: Option<Uuid>,
    pub cancel: CancellationToken,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_resolution(cancel: CancellationToken) -> Self {
        RequestContext {
            cr_id: Some(Uuid::new_v4()),
            cancel,
        }
    }

    pub fn is_resolution(&self) -> bool {
        self.cr_id.is_some()
    }

    pub fn check_canceled(&self) -> CrResult<()> {
        if self.cancel.is_cancelled() {
            return Err(CrError::Canceled);
        }
        Ok(())
    }
}

/// Everything the resolver needs from the folder that owns it.
pub trait Folder: Send + Sync {
    fn id(&self) -> &str;

    fn block_store(&self) -> &BlockStore;

    fn unmerged_branch(&self) -> CrResult<UnmergedBranch>;

    /// Merged revisions strictly after `after`, oldest first.
    fn merged_revisions_since(&self, after: Revision) -> CrResult<Vec<RevisionMetadata>>;

    fn merged_revision(&self, revision: Revision) -> CrResult<RevisionMetadata>;

    /// Flush any dirty local state into the unmerged branch.
    fn sync_all(&self, ctx: &RequestContext) -> CrResult<()>;

    fn set_unmerged_writes_blocked(&self, blocked: bool);

    /// Append `md` to the merged branch, drop the unmerged branch and hand
    /// `local_ops` to local observers.
    fn commit_resolution(
        &self,
        ctx: &RequestContext,
        md: RevisionMetadata,
        local_ops: Vec<Op>,
    ) -> CrResult<()>;

    fn report_error(&self, err: &CrError) {
        tracing::error!(folder = %self.id(), error = %err, "conflict resolution failed");
    }

    fn notify_stuck_changed(&self, stuck: bool) {
        tracing::warn!(folder = %self.id(), stuck, "folder stuck state changed");
    }
}
