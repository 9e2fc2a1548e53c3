//! KV-cache block tables keyed by sequence.
//!
//! The synchronization core only needs to know whether a sequence holds a
//! block table and to release it. `PagedBlockManager` is a fixed-pool,
//! vLLM-style reference implementation of that contract.

use std::collections::{HashMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::engine::sequence::SequenceId;

/// Tokens stored per block (vLLM standard).
pub const DEFAULT_BLOCK_SIZE: usize = 16;

/// Unique identifier for a physical block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub usize);

/// KV-cache association consumed during request removal.
pub trait BlockTableManager {
    /// True if the sequence currently owns KV-cache blocks.
    fn has_block_table(&self, sequence_id: SequenceId) -> bool;

    /// Release every block owned by the sequence.
    fn free_sequence(&mut self, sequence_id: SequenceId);
}

/// Configuration for the paged block manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlockConfig {
    pub block_size: usize,
    pub num_blocks: usize,
}

impl Default for BlockConfig {
    fn default() -> Self {
        Self { block_size: DEFAULT_BLOCK_SIZE, num_blocks: 1024 }
    }
}

/// Fixed pool of blocks handed out to sequences on demand.
#[derive(Debug)]
pub struct PagedBlockManager {
    block_size: usize,
    free_blocks: VecDeque<BlockId>,
    tables: HashMap<SequenceId, Vec<BlockId>>,
}

impl PagedBlockManager {
    pub fn new(config: &BlockConfig) -> Self {
        let block_size = config.block_size.max(1);
        Self {
            block_size,
            free_blocks: (0..config.num_blocks).map(BlockId).collect(),
            tables: HashMap::new(),
        }
    }

    /// Blocks needed to hold `num_tokens` tokens.
    pub fn blocks_needed(&self, num_tokens: usize) -> usize {
        num_tokens.div_ceil(self.block_size)
    }

    /// Grow the sequence's table until it covers `num_tokens` tokens.
    ///
    /// Returns the number of blocks the sequence holds afterwards, or `None`
    /// (allocating nothing) if the pool cannot cover the request.
    pub fn allocate(&mut self, sequence_id: SequenceId, num_tokens: usize) -> Option<usize> {
        let needed = self.blocks_needed(num_tokens);
        let held = self.tables.get(&sequence_id).map_or(0, Vec::len);
        let missing = needed.saturating_sub(held);
        if missing > self.free_blocks.len() {
            return None;
        }

        let table = self.tables.entry(sequence_id).or_default();
        table.extend(self.free_blocks.drain(..missing));
        Some(table.len())
    }

    /// Blocks currently owned by a sequence.
    pub fn block_table(&self, sequence_id: SequenceId) -> &[BlockId] {
        self.tables.get(&sequence_id).map_or(&[], Vec::as_slice)
    }

    pub fn num_free_blocks(&self) -> usize {
        self.free_blocks.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }
}

impl BlockTableManager for PagedBlockManager {
    fn has_block_table(&self, sequence_id: SequenceId) -> bool {
        self.tables.contains_key(&sequence_id)
    }

    fn free_sequence(&mut self, sequence_id: SequenceId) {
        if let Some(table) = self.tables.remove(&sequence_id) {
            self.free_blocks.extend(table);
        }
    }
}
