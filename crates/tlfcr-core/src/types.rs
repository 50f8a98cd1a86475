//! Shared data model: block pointers, revisions, directory and file blocks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CrError, CrResult};

// ── Block pointers ───────────────────────────────────────────────────────────

/// Content-addressed identity of one immutable block.
///
/// The all-zero pointer means "no block" (symlinks, unset fields).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct BlockPointer([u8; 32]);

impl BlockPointer {
    pub const ZERO: BlockPointer = BlockPointer([0u8; 32]);

    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        BlockPointer(bytes)
    }

    /// Derive a pointer from a per-put nonce and the encoded block, so that
    /// two writers putting identical contents never alias.
    pub fn derive(nonce: &[u8], encoded: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(nonce);
        hasher.update(encoded);
        BlockPointer(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_initialized(&self) -> bool {
        *self != Self::ZERO
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }

    pub fn from_hex(s: &str) -> CrResult<Self> {
        let hash = blake3::Hash::from_hex(s)
            .map_err(|e| CrError::Storage(format!("invalid block pointer {s:?}: {e}")))?;
        Ok(BlockPointer(*hash.as_bytes()))
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        f.write_str(&hex[..12])
    }
}

impl fmt::Debug for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockPointer({self})")
    }
}

impl From<BlockPointer> for String {
    fn from(ptr: BlockPointer) -> String {
        ptr.to_hex()
    }
}

impl TryFrom<String> for BlockPointer {
    type Error = CrError;

    fn try_from(s: String) -> CrResult<Self> {
        BlockPointer::from_hex(&s)
    }
}

// ── Revisions and branches ───────────────────────────────────────────────────

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub const UNINITIALIZED: Revision = Revision(0);
    pub const INITIAL: Revision = Revision(1);

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }

    pub fn is_initialized(self) -> bool {
        self != Self::UNINITIALIZED
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which line of history a revision belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchId {
    #[default]
    Master,
    Unmerged(String),
    /// A local branch that will be squashed into one merged revision.
    PendingLocalSquash,
}

impl BranchId {
    pub fn is_master(&self) -> bool {
        matches!(self, BranchId::Master)
    }

    pub fn is_squash(&self) -> bool {
        matches!(self, BranchId::PendingLocalSquash)
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchId::Master => f.write_str("master"),
            BranchId::Unmerged(id) => write!(f, "unmerged:{id}"),
            BranchId::PendingLocalSquash => f.write_str("squash"),
        }
    }
}

/// Who produced an op, and in which revision.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WriterInfo {
    pub writer: String,
    pub revision: Revision,
}

impl WriterInfo {
    pub fn new(writer: impl Into<String>, revision: Revision) -> Self {
        WriterInfo {
            writer: writer.into(),
            revision,
        }
    }
}

// ── Blocks ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryType {
    File,
    Exec,
    Dir,
    Sym,
}

impl EntryType {
    pub fn is_file(self) -> bool {
        matches!(self, EntryType::File | EntryType::Exec)
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntryType::File => "file",
            EntryType::Exec => "exec",
            EntryType::Dir => "dir",
            EntryType::Sym => "sym",
        };
        f.write_str(s)
    }
}

/// One named child of a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Block holding the child's contents; zero for symlinks
    pub ptr: BlockPointer,
    pub entry_type: EntryType,
    /// Content length in bytes (files only)
    #[serde(default)]
    pub size: u64,
    /// Modification time, Unix seconds
    #[serde(default)]
    pub mtime: i64,
    /// Link target (symlinks only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sym_path: Option<String>,
}

impl DirEntry {
    pub fn new(ptr: BlockPointer, entry_type: EntryType) -> Self {
        DirEntry {
            ptr,
            entry_type,
            size: 0,
            mtime: 0,
            sym_path: None,
        }
    }

    pub fn symlink(target: impl Into<String>) -> Self {
        DirEntry {
            ptr: BlockPointer::ZERO,
            entry_type: EntryType::Sym,
            size: 0,
            mtime: 0,
            sym_path: Some(target.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DirBlock {
    pub children: BTreeMap<String, DirEntry>,
}

impl DirBlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a child by name. `dir` only feeds the error message.
    pub fn lookup(&self, dir: BlockPointer, name: &str) -> CrResult<&DirEntry> {
        self.children.get(name).ok_or_else(|| CrError::NoSuchName {
            dir,
            name: name.to_string(),
        })
    }

    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.children.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.children.contains_key(name)
    }

    /// Set a child, returning the pointer it displaced (if any).
    pub fn set_entry(&mut self, name: &str, entry: DirEntry) -> Option<BlockPointer> {
        self.children
            .insert(name.to_string(), entry)
            .map(|old| old.ptr)
            .filter(|p| p.is_initialized())
    }

    pub fn remove_entry(&mut self, name: &str) -> Option<DirEntry> {
        self.children.remove(name)
    }

    pub fn find_by_ptr(&self, ptr: BlockPointer) -> Option<(&str, &DirEntry)> {
        if !ptr.is_initialized() {
            return None;
        }
        self.children
            .iter()
            .find(|(_, e)| e.ptr == ptr)
            .map(|(n, e)| (n.as_str(), e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileBlock {
    pub contents: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Block {
    Dir(DirBlock),
    File(FileBlock),
}

impl Block {
    pub fn into_dir(self, ptr: BlockPointer) -> CrResult<DirBlock> {
        match self {
            Block::Dir(d) => Ok(d),
            Block::File(_) => Err(CrError::NotDirBlock(ptr)),
        }
    }

    pub fn into_file(self, ptr: BlockPointer) -> CrResult<FileBlock> {
        match self {
            Block::File(f) => Ok(f),
            Block::Dir(_) => Err(CrError::NotFileBlock(ptr)),
        }
    }
}

/// Split `name` into a base and an extension (with its leading dot).
/// Hidden files with no other dot keep their whole name as the base.
pub fn split_file_extension(name: &str) -> (&str, &str) {
    match name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < name.len() => name.split_at(idx),
        _ => (name, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_hex_roundtrip() {
        let ptr = BlockPointer::derive(b"nonce", b"contents");
        let hex = ptr.to_hex();
        assert_eq!(hex.len(), 64);
        assert_eq!(BlockPointer::from_hex(&hex).unwrap(), ptr);
        assert!(BlockPointer::from_hex("not-hex").is_err());
    }

    #[test]
    fn test_pointer_serializes_as_hex_string() {
        let ptr = BlockPointer::derive(b"n", b"c");
        let json = serde_json::to_string(&ptr).unwrap();
        assert_eq!(json, format!("\"{}\"", ptr.to_hex()));
        let back: BlockPointer = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ptr);
    }

    #[test]
    fn test_distinct_nonces_never_alias() {
        let a = BlockPointer::derive(b"nonce-a", b"same");
        let b = BlockPointer::derive(b"nonce-b", b"same");
        assert_ne!(a, b);
        assert!(a.is_initialized());
        assert!(!BlockPointer::ZERO.is_initialized());
    }

    #[test]
    fn test_dir_block_entries() {
        let mut dir = DirBlock::new();
        let p1 = BlockPointer::derive(b"1", b"");
        let p2 = BlockPointer::derive(b"2", b"");
        assert_eq!(dir.set_entry("a", DirEntry::new(p1, EntryType::File)), None);
        assert_eq!(
            dir.set_entry("a", DirEntry::new(p2, EntryType::File)),
            Some(p1)
        );
        assert_eq!(dir.find_by_ptr(p2).map(|(n, _)| n), Some("a"));
        assert!(dir.lookup(BlockPointer::ZERO, "missing").is_err());
        assert!(dir.remove_entry("a").is_some());
        assert!(dir.children.is_empty());
    }

    #[test]
    fn test_split_file_extension() {
        assert_eq!(split_file_extension("report.pdf"), ("report", ".pdf"));
        assert_eq!(split_file_extension("archive.tar.gz"), ("archive.tar", ".gz"));
        assert_eq!(split_file_extension("Makefile"), ("Makefile", ""));
        assert_eq!(split_file_extension(".bashrc"), (".bashrc", ""));
        assert_eq!(split_file_extension("trailing."), ("trailing.", ""));
    }

    #[test]
    fn test_block_kind_mismatch() {
        let ptr = BlockPointer::derive(b"x", b"y");
        let err = Block::File(FileBlock::default()).into_dir(ptr).unwrap_err();
        assert!(matches!(err, CrError::NotDirBlock(p) if p == ptr));
    }
}
