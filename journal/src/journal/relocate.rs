// Log relocation
// Moves or resizes the log area of a quiesced journal

use super::Journal;
use crate::allocator::BlockAllocator;
use crate::transaction::Transaction;
use bfs_core::{BlockRun, JournalError, Result};
use log::{error, info};
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl Journal {
    /// Moves the log to `new_log`, which must lie in the first allocation
    /// group behind the bitmap. Blocks the new area needs beyond the old
    /// one are allocated first; blocks the log gives up are freed after
    /// the move. Concurrent relocations run one after the other.
    pub fn move_log(self: &Arc<Self>, new_log: BlockRun, allocator: &dyn BlockAllocator) -> Result<()> {
        // taken before the log lock, held until the freed tail is logged
        let _relocation = self.relocation_lock.lock();
        let old_log = self.super_block.lock().log_blocks;
        if new_log == old_log {
            return Ok(());
        }

        let geometry = self.volume.geometry();
        let new_end = new_log.start as u64 + new_log.length as u64;
        let old_end = old_log.start as u64 + old_log.length as u64;

        if new_log.allocation_group != 0
            || geometry.validate_block_run(new_log).is_err()
            || (new_log.start as u64) < 1 + geometry.num_bitmap_blocks()
            || new_end > geometry.num_blocks
        {
            return Err(JournalError::BadValue(format!("cannot move the log to {}", new_log)));
        }
        if (new_log.length as u32) < self.config.min_log_blocks {
            return Err(JournalError::BadValue(format!(
                "log of {} blocks is smaller than the minimum of {}",
                new_log.length, self.config.min_log_blocks
            )));
        }

        let mut allocated = BlockRun::default();
        if new_end > old_end {
            allocated = if old_end > new_log.start as u64 {
                BlockRun::new(0, old_end as u16, (new_end - old_end) as u16)
            } else {
                new_log
            };

            let mut transaction = Transaction::begin(self, 0)?;
            if let Err(e) = allocator.allocate_block_run(&mut transaction, allocated) {
                error!("MoveLog: Could not allocate space to move log area: {}", e);
                return Err(e);
            }
            transaction.done()?;
        }

        let journal_lock = match self.lock_drained_journal() {
            Ok(lock) => lock,
            Err(e) => {
                self.free_best_effort(allocator, allocated);
                return Err(e);
            }
        };

        {
            let mut super_block = self.super_block.lock();
            let previous = *super_block;
            super_block.log_blocks = new_log;
            super_block.log_start = 0;
            super_block.log_end = 0;

            if let Err(e) = self.volume.write_super_block(&super_block) {
                *super_block = previous;
                drop(super_block);
                drop(journal_lock);
                self.free_best_effort(allocator, allocated);
                return Err(e);
            }
        }

        let log_size = new_log.length as u32;
        self.log_size.store(log_size, Ordering::Release);
        self.max_transaction_size
            .store(self.config.max_transaction_size(log_size), Ordering::Release);

        drop(journal_lock);
        info!("log moved from {} to {}", old_log, new_log);

        if new_end < old_end {
            let tail = BlockRun::new(0, new_end as u16, (old_end - new_end) as u16);
            // the log already moved, a leaked tail is not worth failing for
            self.free_best_effort(allocator, tail);
        }
        Ok(())
    }

    fn lock_drained_journal(&self) -> Result<super::JournalLock<'_>> {
        let lock = self.flush_log_and_lock_journal()?;
        if !self.entries.lock().list.is_empty() {
            return Err(JournalError::Busy(
                "log entries are still waiting for their blocks".to_string(),
            ));
        }
        Ok(lock)
    }

    fn free_best_effort(self: &Arc<Self>, allocator: &dyn BlockAllocator, run: BlockRun) {
        if run.is_zero() {
            return;
        }

        let freed = Transaction::begin(self, 0).and_then(|mut transaction| {
            allocator.free(&mut transaction, run)?;
            transaction.done()
        });
        if let Err(e) = freed {
            error!("could not free log blocks {}: {}", run, e);
        }
    }
}
