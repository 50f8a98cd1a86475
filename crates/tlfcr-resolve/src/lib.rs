//! tlfcr-resolve: conflict resolution between an unmerged local branch and
//! the merged branch of a folder.
//!
//! The pipeline builds per-branch [`chains::Chains`], maps every changed
//! unmerged node onto the merged tree ([`merge_paths`]), fixes structural
//! conflicts ([`fixup`]), computes and executes per-directory
//! [`actions::Action`] lists, and finally commits one resolved revision
//! ([`finalize`]). [`resolver::ConflictResolver`] drives attempts for one
//! folder and keeps the persisted [`attempts::AttemptLog`].

pub mod actions;
pub mod attempts;
pub mod chains;
pub mod compute;
pub mod execute;
pub mod finalize;
pub mod fixup;
pub mod folder;
pub mod memory;
pub mod merge_paths;
pub mod ops;
pub mod path;
pub mod pipeline;
pub mod renamer;
pub mod resolver;

pub use actions::{Action, ActionKind};
pub use attempts::{AttemptLog, AttemptRecord};
pub use chains::{Chain, Chains, RenameInfo};
pub use folder::{ConflictInput, Folder, RequestContext, RevisionMetadata};
pub use memory::MemoryFolder;
pub use ops::{AttrChange, BlockUpdate, Op, OpKind, WriteRange};
pub use path::{NodePath, PathNode};
pub use pipeline::{Outcome, Phase};
pub use renamer::{ConflictRenamer, WriterRevisionRenamer};
pub use resolver::ConflictResolver;
