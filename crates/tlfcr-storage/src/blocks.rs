//! Content-addressed block store over an OpenDAL operator.
//!
//! Blocks are JSON-encoded `Block` values stored under `blocks/<hex>`.
//! Every put mixes a random nonce into the pointer so identical contents
//! written by different writers never alias.

use opendal::Operator;
use tlfcr_core::types::{Block, DirBlock, FileBlock};
use tlfcr_core::{BlockPointer, CrError, CrResult};

fn block_key(ptr: BlockPointer) -> String {
    format!("blocks/{}", ptr.to_hex())
}

fn storage_err(action: &str, ptr: BlockPointer, e: opendal::Error) -> CrError {
    CrError::Storage(format!("{action} block {ptr}: {e}"))
}

/// Encoded blocks waiting to be written, in the order they were readied.
#[derive(Debug, Default)]
pub struct BlockPutState {
    blocks: Vec<(BlockPointer, Vec<u8>)>,
}

impl BlockPutState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Encode `block`, assign it a fresh pointer and queue it.
    pub fn add(&mut self, block: &Block) -> CrResult<BlockPointer> {
        let (ptr, bytes) = BlockStore::ready(block)?;
        self.blocks.push((ptr, bytes));
        Ok(ptr)
    }

    pub fn ptrs(&self) -> Vec<BlockPointer> {
        self.blocks.iter().map(|(p, _)| *p).collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Decode a queued block without touching storage.
    pub fn get(&self, ptr: BlockPointer) -> Option<CrResult<Block>> {
        self.blocks
            .iter()
            .find(|(p, _)| *p == ptr)
            .map(|(_, bytes)| serde_json::from_slice(bytes).map_err(CrError::from))
    }
}

#[derive(Clone)]
pub struct BlockStore {
    op: Operator,
}

impl BlockStore {
    pub fn new(op: Operator) -> Self {
        BlockStore { op }
    }

    /// A store backed by OpenDAL's in-memory service.
    pub fn memory() -> CrResult<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(|e| CrError::Storage(format!("creating memory operator: {e}")))?
            .finish();
        Ok(BlockStore { op })
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Encode a block and derive its pointer without writing anything.
    pub fn ready(block: &Block) -> CrResult<(BlockPointer, Vec<u8>)> {
        let bytes = serde_json::to_vec(block)?;
        let nonce = uuid::Uuid::new_v4();
        let ptr = BlockPointer::derive(nonce.as_bytes(), &bytes);
        Ok((ptr, bytes))
    }

    pub async fn put_ready(&self, ptr: BlockPointer, bytes: Vec<u8>) -> CrResult<()> {
        self.op
            .write(&block_key(ptr), bytes)
            .await
            .map_err(|e| storage_err("writing", ptr, e))?;
        Ok(())
    }

    pub async fn put(&self, block: &Block) -> CrResult<BlockPointer> {
        let (ptr, bytes) = Self::ready(block)?;
        self.put_ready(ptr, bytes).await?;
        Ok(ptr)
    }

    /// Write every queued block. Stops at the first failure; the caller
    /// decides whether to clean up with [`BlockStore::delete`].
    pub async fn put_all(&self, state: BlockPutState) -> CrResult<()> {
        for (ptr, bytes) in state.blocks {
            self.put_ready(ptr, bytes).await?;
        }
        Ok(())
    }

    pub async fn get(&self, ptr: BlockPointer) -> CrResult<Block> {
        let data = self.op.read(&block_key(ptr)).await.map_err(|e| {
            if e.kind() == opendal::ErrorKind::NotFound {
                CrError::NodeNotFound(ptr)
            } else {
                storage_err("reading", ptr, e)
            }
        })?;
        Ok(serde_json::from_slice(&data.to_vec())?)
    }

    pub async fn get_dir(&self, ptr: BlockPointer) -> CrResult<DirBlock> {
        self.get(ptr).await?.into_dir(ptr)
    }

    pub async fn get_file(&self, ptr: BlockPointer) -> CrResult<FileBlock> {
        self.get(ptr).await?.into_file(ptr)
    }

    pub async fn delete(&self, ptrs: &[BlockPointer]) -> CrResult<()> {
        for ptr in ptrs {
            self.op
                .delete(&block_key(*ptr))
                .await
                .map_err(|e| storage_err("deleting", *ptr, e))?;
        }
        Ok(())
    }
}
