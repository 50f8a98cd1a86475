pub mod config;
pub mod error;
pub mod types;

pub use error::{CrError, CrResult};
pub use types::{
    BlockPointer, BranchId, DirBlock, DirEntry, EntryType, FileBlock, Revision, WriterInfo,
};
