// Log completion
// Retires log entries once the cache has written their blocks home

use super::Journal;
use crate::cache::{CacheEvent, TransactionId};
use crate::log_entry::LogEntry;
use bfs_core::SUPER_BLOCK_DISK_CLEAN;
use log::{debug, error, trace};
use std::sync::Arc;

impl Journal {
    /// Handles every notification the cache has queued so far. Returns
    /// the number of events processed.
    pub fn process_cache_events(&self) -> usize {
        // held for the whole drain: whoever gets the lock next sees every
        // event sent before it
        let receiver = self.events.lock();
        let mut handled = 0;

        while let Ok(event) = receiver.try_recv() {
            match event {
                CacheEvent::Written { id, entry } => self.transaction_written(id, &entry),
                CacheEvent::Idle { id } => trace!("transaction {} went idle", id),
            }
            handled += 1;
        }
        handled
    }

    /// Only the head of the entry list moves the log start, so the
    /// reclaimable area stays a contiguous prefix even when entries
    /// complete out of order.
    fn transaction_written(&self, id: TransactionId, entry: &Arc<LogEntry>) {
        if entry.decrement() > 1 {
            return;
        }

        debug!("log entry {} finished with transaction {}", entry.id(), id);
        let log_size = self.log_size();

        let mut entries = self.entries.lock();
        let Some(index) = entries.list.iter().position(|e| Arc::ptr_eq(e, entry)) else {
            error!("finished log entry {} is not in the entry list", entry.id());
            return;
        };

        let mut super_block = self.super_block.lock();
        let update = index == 0;
        if update {
            super_block.log_start = match entries.list.get(1) {
                Some(next) => (next.start() % log_size) as i64,
                None => super_block.log_end,
            };
        }

        entries.used = entries.used.saturating_sub(entry.length());
        entries.list.remove(index);
        drop(entries);

        if update {
            if super_block.log_start == super_block.log_end {
                super_block.flags = SUPER_BLOCK_DISK_CLEAN;
            }
            if let Err(e) = self.volume.write_super_block(&super_block) {
                error!("could not write back superblock: {}", e);
            }
        }
    }
}
