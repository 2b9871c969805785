// Block allocator interface
// Only log relocation allocates or frees blocks

use crate::transaction::Transaction;
use bfs_core::{BlockRun, Result};

pub trait BlockAllocator: Send + Sync {
    /// Marks exactly `run` as used, failing if any block of it is taken
    fn allocate_block_run(&self, transaction: &mut Transaction, run: BlockRun) -> Result<()>;

    fn free(&self, transaction: &mut Transaction, run: BlockRun) -> Result<()>;
}
