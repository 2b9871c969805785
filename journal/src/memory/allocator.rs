// In-memory block allocator
// Bitmap kept in memory, changed blocks written through the transaction

use crate::allocator::BlockAllocator;
use crate::transaction::Transaction;
use crate::transaction_table::TransactionListener;
use crate::volume::Volume;
use bfs_core::{BlockRun, Geometry, JournalError, Result};
use parking_lot::Mutex;
use std::sync::Arc;

pub struct MemoryAllocator {
    geometry: Geometry,
    bitmap: Arc<Mutex<Vec<u8>>>,
}

/// Undoes a bitmap change if its transaction does not commit
struct BitmapRollback {
    bitmap: Arc<Mutex<Vec<u8>>>,
    first: u64,
    count: u64,
    allocated: bool,
}

impl TransactionListener for BitmapRollback {
    fn transaction_done(&self, success: bool) {
        if !success {
            set_range(&mut self.bitmap.lock(), self.first, self.count, !self.allocated);
        }
    }

    fn removed_from_transaction(&self) {}
}

impl MemoryAllocator {
    /// Loads the bitmap stored behind the superblock
    pub fn new(volume: &dyn Volume) -> Result<Self> {
        let geometry = volume.geometry();
        let mut bitmap = vec![0u8; (geometry.num_bitmap_blocks() << geometry.block_shift) as usize];
        volume.read_at(geometry.block_size as u64, &mut bitmap)?;

        Ok(Self {
            geometry,
            bitmap: Arc::new(Mutex::new(bitmap)),
        })
    }

    pub fn is_used(&self, block: u64) -> bool {
        is_set(&self.bitmap.lock(), block)
    }

    fn change(&self, transaction: &mut Transaction, run: BlockRun, allocate: bool) -> Result<()> {
        if !transaction.is_started() {
            return Err(JournalError::NotInitialized(
                "bitmap changes need a running transaction".to_string(),
            ));
        }
        self.geometry.validate_block_run(run)?;
        let first = self.geometry.to_block(run);
        let count = run.length as u64;

        let dirty_blocks = {
            let mut bitmap = self.bitmap.lock();
            if (first..first + count).any(|block| is_set(&bitmap, block) == allocate) {
                return Err(JournalError::BadValue(format!(
                    "blocks of {} are {}",
                    run,
                    if allocate { "already in use" } else { "not in use" }
                )));
            }
            set_range(&mut bitmap, first, count, allocate);

            let bits_per_block = self.geometry.block_size as u64 * 8;
            let block_size = self.geometry.block_size as usize;
            (first / bits_per_block..=(first + count - 1) / bits_per_block)
                .map(|index| {
                    let offset = index as usize * block_size;
                    (index, bitmap[offset..offset + block_size].to_vec())
                })
                .collect::<Vec<_>>()
        };

        transaction.add_listener(Arc::new(BitmapRollback {
            bitmap: self.bitmap.clone(),
            first,
            count,
            allocated: allocate,
        }))?;

        for (index, data) in dirty_blocks {
            transaction.write_blocks(1 + index, &data, 1)?;
        }
        Ok(())
    }
}

impl BlockAllocator for MemoryAllocator {
    fn allocate_block_run(&self, transaction: &mut Transaction, run: BlockRun) -> Result<()> {
        self.change(transaction, run, true)
    }

    fn free(&self, transaction: &mut Transaction, run: BlockRun) -> Result<()> {
        self.change(transaction, run, false)
    }
}

fn is_set(bitmap: &[u8], block: u64) -> bool {
    bitmap[(block / 8) as usize] & (1 << (block % 8)) != 0
}

fn set_range(bitmap: &mut [u8], first: u64, count: u64, used: bool) {
    for block in first..first + count {
        let byte = &mut bitmap[(block / 8) as usize];
        if used {
            *byte |= 1 << (block % 8);
        } else {
            *byte &= !(1 << (block % 8));
        }
    }
}
