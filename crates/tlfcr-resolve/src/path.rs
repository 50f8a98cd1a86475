//! Root-to-node paths within one branch's tree snapshot.

use std::collections::{HashMap, HashSet};
use std::fmt;

use tlfcr_core::{BlockPointer, BranchId, CrResult};
use tlfcr_storage::{search_for_paths, BlockStore, FoundPath};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PathNode {
    pub ptr: BlockPointer,
    pub name: String,
}

impl PathNode {
    pub fn new(ptr: BlockPointer, name: impl Into<String>) -> Self {
        PathNode {
            ptr,
            name: name.into(),
        }
    }
}

/// Ordered `(pointer, name)` pairs from the root to a node. The root node
/// carries an empty name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NodePath {
    pub branch: BranchId,
    pub nodes: Vec<PathNode>,
}

impl NodePath {
    pub fn new(branch: BranchId, nodes: Vec<PathNode>) -> Self {
        NodePath { branch, nodes }
    }

    pub fn from_found(branch: BranchId, found: FoundPath) -> Self {
        let nodes = found
            .nodes
            .into_iter()
            .map(|(ptr, name)| PathNode { ptr, name })
            .collect();
        NodePath { branch, nodes }
    }

    pub fn is_valid(&self) -> bool {
        !self.nodes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn tail_ptr(&self) -> BlockPointer {
        self.nodes.last().map(|n| n.ptr).unwrap_or(BlockPointer::ZERO)
    }

    pub fn tail_name(&self) -> &str {
        self.nodes.last().map(|n| n.name.as_str()).unwrap_or("")
    }

    pub fn set_tail_ptr(&mut self, ptr: BlockPointer) {
        if let Some(last) = self.nodes.last_mut() {
            last.ptr = ptr;
        }
    }

    /// The path with its last node removed.
    pub fn parent_path(&self) -> NodePath {
        let mut nodes = self.nodes.clone();
        nodes.pop();
        NodePath {
            branch: self.branch.clone(),
            nodes,
        }
    }

    pub fn child_path(&self, name: impl Into<String>, ptr: BlockPointer) -> NodePath {
        let mut nodes = self.nodes.clone();
        nodes.push(PathNode::new(ptr, name));
        NodePath {
            branch: self.branch.clone(),
            nodes,
        }
    }

    pub fn has_ptr(&self, ptr: BlockPointer) -> bool {
        self.nodes.iter().any(|n| n.ptr == ptr)
    }
}

impl fmt::Display for NodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.nodes.len() <= 1 {
            return f.write_str("/");
        }
        for node in &self.nodes[1..] {
            write!(f, "/{}", node.name)?;
        }
        Ok(())
    }
}

/// Order paths deepest first; ties break on the rendered path so runs are
/// reproducible.
pub fn sort_paths(paths: &mut [NodePath]) {
    paths.sort_by(|a, b| {
        b.len()
            .cmp(&a.len())
            .then_with(|| a.to_string().cmp(&b.to_string()))
    });
}

/// Find `targets` under `root` and return their paths on `branch`.
/// Targets that aren't in the tree are absent from the result.
pub async fn find_paths(
    store: &BlockStore,
    branch: &BranchId,
    root: BlockPointer,
    targets: &HashSet<BlockPointer>,
) -> CrResult<HashMap<BlockPointer, NodePath>> {
    let found = search_for_paths(store, root, targets).await?;
    Ok(found
        .into_iter()
        .map(|(ptr, fp)| (ptr, NodePath::from_found(branch.clone(), fp)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ptr(tag: &str) -> BlockPointer {
        BlockPointer::derive(tag.as_bytes(), b"")
    }

    fn path(names: &[&str]) -> NodePath {
        let mut nodes = vec![PathNode::new(ptr("root"), "")];
        for n in names {
            nodes.push(PathNode::new(ptr(n), *n));
        }
        NodePath::new(BranchId::Master, nodes)
    }

    #[test]
    fn test_display_and_tail() {
        let p = path(&["a", "b"]);
        assert_eq!(p.to_string(), "/a/b");
        assert_eq!(p.tail_name(), "b");
        assert_eq!(p.tail_ptr(), ptr("b"));
        assert_eq!(p.parent_path().to_string(), "/a");
        assert_eq!(path(&[]).to_string(), "/");
    }

    #[test]
    fn test_child_and_set_tail() {
        let mut p = path(&["a"]).child_path("c", ptr("c"));
        assert_eq!(p.to_string(), "/a/c");
        p.set_tail_ptr(ptr("c2"));
        assert_eq!(p.tail_ptr(), ptr("c2"));
        assert!(p.has_ptr(ptr("a")));
    }

    #[test]
    fn test_sort_deepest_first() {
        let mut paths = vec![path(&["a"]), path(&["a", "b", "c"]), path(&["z", "y"])];
        sort_paths(&mut paths);
        let lens: Vec<_> = paths.iter().map(|p| p.len()).collect();
        assert_eq!(lens, vec![4, 3, 2]);
    }
}

#[cfg(test)]
mod proptest_suite {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn sorted_paths_never_increase_in_length(
            shapes in proptest::collection::vec(proptest::collection::vec("[a-d]{1,3}", 0..5), 0..12)
        ) {
            let mut paths: Vec<NodePath> = shapes
                .iter()
                .map(|names| {
                    let mut nodes = vec![PathNode::new(BlockPointer::ZERO, "")];
                    for n in names {
                        nodes.push(PathNode::new(BlockPointer::derive(n.as_bytes(), b""), n.clone()));
                    }
                    NodePath::new(BranchId::Master, nodes)
                })
                .collect();
            sort_paths(&mut paths);
            for w in paths.windows(2) {
                prop_assert!(w[0].len() >= w[1].len());
            }
        }
    }
}
