//! Conflict names for entries that lose a same-name race.

use tlfcr_core::types::{split_file_extension, DirBlock};
use tlfcr_core::{CrError, CrResult};

use crate::ops::Op;

const MAX_UNIQUE_SUFFIX: usize = 100;

/// Chooses the name a conflicting entry is moved to.
pub trait ConflictRenamer: Send + Sync {
    fn conflict_rename(&self, op: &Op, original: &str) -> CrResult<String>;
}

/// Names conflicts `"<base>.<suffix> (<writer>, rev <N>)<ext>"`, keeping the
/// extension so the copy still opens with the same application.
#[derive(Debug, Clone)]
pub struct WriterRevisionRenamer {
    suffix: String,
}

impl WriterRevisionRenamer {
    pub fn new(suffix: impl Into<String>) -> Self {
        WriterRevisionRenamer {
            suffix: suffix.into(),
        }
    }
}

impl Default for WriterRevisionRenamer {
    fn default() -> Self {
        WriterRevisionRenamer::new("conflicted copy")
    }
}

impl ConflictRenamer for WriterRevisionRenamer {
    fn conflict_rename(&self, op: &Op, original: &str) -> CrResult<String> {
        let (base, ext) = split_file_extension(original);
        Ok(format!(
            "{base}.{} ({}, rev {}){ext}",
            self.suffix, op.writer.writer, op.writer.revision
        ))
    }
}

/// Return `name` if `dir` has no such entry, else the first free
/// `"<base> (N)<ext>"` for N in 2..=100.
pub fn uniquify_name(dir: &DirBlock, name: &str) -> CrResult<String> {
    if !dir.contains(name) {
        return Ok(name.to_string());
    }
    let (base, ext) = split_file_extension(name);
    for i in 2..=MAX_UNIQUE_SUFFIX {
        let candidate = format!("{base} ({i}){ext}");
        if !dir.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(CrError::NoUniqueName(name.to_string()))
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;
    use tlfcr_core::types::{DirEntry, EntryType};
    use tlfcr_core::BlockPointer;

    proptest! {
        #[test]
        fn uniquified_name_is_always_free(
            taken in proptest::collection::btree_set("[a-c]{1,2}(\\.txt)?", 0..20),
            wanted in "[a-c]{1,2}(\\.txt)?",
        ) {
            let mut dir = DirBlock::new();
            for name in &taken {
                dir.set_entry(name, DirEntry::new(BlockPointer::ZERO, EntryType::File));
            }
            let name = uniquify_name(&dir, &wanted).unwrap();
            prop_assert!(!dir.contains(&name));
            if !taken.contains(&wanted) {
                prop_assert_eq!(name, wanted);
            }
        }
    }
}
