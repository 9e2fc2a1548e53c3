//! KV-cache block association for draft sequences.

mod blocks;

pub use blocks::{BlockConfig, BlockId, BlockTableManager, PagedBlockManager, DEFAULT_BLOCK_SIZE};
