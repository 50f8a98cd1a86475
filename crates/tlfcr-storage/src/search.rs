//! Pointer-to-path search over one tree snapshot.

use std::collections::{HashMap, HashSet, VecDeque};

use tlfcr_core::types::EntryType;
use tlfcr_core::{BlockPointer, CrResult};

use crate::blocks::BlockStore;

/// Nodes from the root (named "") down to a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FoundPath {
    pub nodes: Vec<(BlockPointer, String)>,
}

impl FoundPath {
    pub fn tail(&self) -> Option<BlockPointer> {
        self.nodes.last().map(|(p, _)| *p)
    }
}

/// Breadth-first walk from `root`, returning the path of every target
/// found. Targets missing from the snapshot are simply absent from the
/// result. Symlinks are never followed.
pub async fn search_for_paths(
    store: &BlockStore,
    root: BlockPointer,
    targets: &HashSet<BlockPointer>,
) -> CrResult<HashMap<BlockPointer, FoundPath>> {
    let mut found = HashMap::new();
    if targets.is_empty() || !root.is_initialized() {
        return Ok(found);
    }

    let root_path = FoundPath {
        nodes: vec![(root, String::new())],
    };
    if targets.contains(&root) {
        found.insert(root, root_path.clone());
    }

    let mut queue = VecDeque::from([root_path]);
    while let Some(dir_path) = queue.pop_front() {
        if found.len() == targets.len() {
            break;
        }
        let Some(dir_ptr) = dir_path.tail() else {
            continue;
        };
        let dir = store.get_dir(dir_ptr).await?;
        for (name, entry) in &dir.children {
            if entry.entry_type == EntryType::Sym || !entry.ptr.is_initialized() {
                continue;
            }
            let mut child = dir_path.clone();
            child.nodes.push((entry.ptr, name.clone()));
            if targets.contains(&entry.ptr) && !found.contains_key(&entry.ptr) {
                found.insert(entry.ptr, child.clone());
            }
            if entry.entry_type == EntryType::Dir {
                queue.push_back(child);
            }
        }
    }

    tracing::debug!(
        wanted = targets.len(),
        found = found.len(),
        "searched tree for paths"
    );
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tlfcr_core::types::{Block, DirBlock, DirEntry, FileBlock};

    #[tokio::test]
    async fn test_finds_nested_targets_and_skips_missing() {
        let store = BlockStore::memory().unwrap();
        let file = store.put(&Block::File(FileBlock::default())).await.unwrap();

        let mut inner = DirBlock::new();
        inner.set_entry("f", DirEntry::new(file, EntryType::File));
        inner.set_entry("link", DirEntry::symlink("../elsewhere"));
        let inner_ptr = store.put(&Block::Dir(inner)).await.unwrap();

        let mut root = DirBlock::new();
        root.set_entry("d", DirEntry::new(inner_ptr, EntryType::Dir));
        let root_ptr = store.put(&Block::Dir(root)).await.unwrap();

        let missing = BlockPointer::derive(b"x", b"y");
        let targets = HashSet::from([file, inner_ptr, root_ptr, missing]);
        let found = search_for_paths(&store, root_ptr, &targets).await.unwrap();

        assert_eq!(found.len(), 3);
        let names: Vec<&str> = found[&file].nodes.iter().map(|(_, n)| n.as_str()).collect();
        assert_eq!(names, vec!["", "d", "f"]);
        assert_eq!(found[&root_ptr].nodes.len(), 1);
        assert!(!found.contains_key(&missing));
    }

    #[tokio::test]
    async fn test_empty_targets() {
        let store = BlockStore::memory().unwrap();
        let root = store.put(&Block::Dir(DirBlock::new())).await.unwrap();
        let found = search_for_paths(&store, root, &HashSet::new()).await.unwrap();
        assert!(found.is_empty());
    }
}
