// Log writer
// Batches committed transactions and writes them into the circular log

use super::{free_blocks, Journal};
use crate::cache::{CacheNotifier, TransactionId};
use crate::log_entry::LogEntry;
use crate::run_array::{max_runs, RunArray};
use crate::run_arrays::RunArrayBuilder;
use bfs_core::{BlockRun, JournalError, Result, SUPER_BLOCK_DISK_DIRTY};
use log::{debug, error, warn};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

impl Journal {
    /// Log space of an entry holding `count` blocks, descriptors included
    pub(crate) fn entry_length(&self, count: u32) -> u32 {
        let max_runs = max_runs(self.volume.geometry().block_size) as u32;
        count + (count + max_runs - 1) / max_runs
    }

    /// Final step of a committed or aborted transaction
    pub(crate) fn transaction_done(&self, id: TransactionId, success: bool) -> Result<()> {
        if !success {
            debug!("transaction {} aborted", id);
            return self.cache.abort_transaction(id);
        }

        let _log = self.log_lock.lock();

        let count = self.cache.block_count(id) as u32;
        let size = self.entry_length(count);
        let log_size = self.log_size();
        if size > log_size {
            // can never be represented in the log
            error!("transaction too large ({} blocks, log size {})", size, log_size);
            self.abort_in_cache(id);
            return Err(JournalError::TransactionTooLarge {
                blocks: size,
                log_size,
            });
        }

        // the whole batch becomes one entry and has to fit the log
        let flush_first = {
            let pending = self.pending.lock();
            !pending.ids.is_empty() && self.entry_length(pending.blocks + count) > log_size
        };
        if flush_first {
            if let Err(e) = self.flush_pending_locked() {
                self.abort_in_cache(id);
                return Err(e);
            }
        }

        let batch_full = {
            let mut pending = self.pending.lock();
            pending.ids.push(id);
            pending.blocks += count;
            pending.ids.len() >= self.config.max_pending_transactions
        };

        if batch_full || size > self.max_transaction_size() {
            self.flush_pending_locked()?;
        }
        Ok(())
    }

    /// Writes every pending transaction as one log entry. On failure all
    /// of them are aborted. The caller holds the log lock.
    pub(crate) fn flush_pending_locked(&self) -> Result<()> {
        let pending = {
            let mut pending = self.pending.lock();
            pending.blocks = 0;
            std::mem::take(&mut pending.ids)
        };
        if pending.is_empty() {
            return Ok(());
        }

        let mut builder = RunArrayBuilder::new(self.volume.geometry());
        let owners = match self.collect_blocks(&pending, &mut builder) {
            Ok(owners) => owners,
            Err(e) => {
                error!("filling log entry failed: {}", e);
                self.abort_all(&pending);
                return Err(e);
            }
        };

        if builder.count_blocks() == 0 {
            debug!("{} pending transactions changed nothing", pending.len());
            for id in &pending {
                self.end_in_cache(*id, None);
            }
            return Ok(());
        }

        let length = builder.log_entry_length();
        if let Err(e) = self.ensure_log_space(length) {
            self.abort_all(&pending);
            return Err(e);
        }

        let (log_run, log_end) = {
            let super_block = self.super_block.lock();
            (super_block.log_blocks, super_block.log_end)
        };
        let start = log_end as u32;
        let new_end = match self.write_log_entry(&builder, &owners, log_run, start) {
            Ok(end) => end,
            Err(e) => {
                error!("could not write log area: {}", e);
                self.abort_all(&pending);
                return Err(e);
            }
        };

        let entry = Arc::new(LogEntry::new(
            self.next_entry_id.fetch_add(1, Ordering::Relaxed),
            pending[0],
            start,
            length,
            pending.len() as i32,
        ));

        // listed before the end pointer moves, so that retiring an older
        // entry never reclaims the space of this one
        {
            let mut entries = self.entries.lock();
            entries.list.push_back(entry.clone());
            entries.used += length;
        }

        {
            let mut super_block = self.super_block.lock();
            super_block.flags = SUPER_BLOCK_DISK_DIRTY;
            super_block.log_end = new_end as i64;
            if let Err(e) = self.volume.write_super_block(&super_block) {
                // ending the transactions below is what counts
                error!("could not write back superblock: {}", e);
            }
        }

        if let Err(e) = self.volume.flush_drive_cache() {
            warn!("flushing the drive cache failed: {}", e);
        }

        debug!(
            "log entry {} written: {} transactions, start {}, length {}, log end {}",
            entry.id(),
            pending.len(),
            start,
            length,
            new_end
        );

        let notifier = self.notifier(Some(entry));
        for id in &pending {
            self.end_in_cache(*id, Some(notifier.clone()));
        }
        Ok(())
    }

    /// Fills the builder and maps every block to the newest batch
    /// transaction that changed it
    fn collect_blocks(
        &self,
        pending: &[TransactionId],
        builder: &mut RunArrayBuilder,
    ) -> Result<HashMap<u64, TransactionId>> {
        let mut owners = HashMap::new();
        for id in pending {
            for block in self.cache.blocks_in_transaction(*id)? {
                builder.insert(block)?;
                let owner = owners.entry(block).or_insert(*id);
                *owner = (*owner).max(*id);
            }
        }
        Ok(owners)
    }

    /// Makes room for `length` blocks, forcing older entries home if needed
    fn ensure_log_space(&self, length: u32) -> Result<()> {
        if self.reserve_log_space(length) {
            return Ok(());
        }

        let last_ended = self.pending.lock().last_ended;
        let synced = match last_ended {
            Some(id) => self.cache.sync_transaction(id),
            None => Ok(()),
        };
        if let Err(e) = &synced {
            warn!("syncing ended transactions failed: {}", e);
        }
        self.process_cache_events();

        if self.reserve_log_space(length) {
            return Ok(());
        }

        let free = self.free_log_blocks();
        match synced {
            Err(e) => Err(JournalError::DeviceFull(format!(
                "{} free log blocks for an entry of {}: {}",
                free, length, e
            ))),
            Ok(()) => panic!(
                "no space in log after sync ({} free for {} blocks)",
                free, length
            ),
        }
    }

    /// True if an entry of `length` blocks fits behind the log end. The
    /// end never catches up with the start, except in a drained log that
    /// is restarted at offset 0 where a full log stays distinguishable
    /// from an empty one.
    fn reserve_log_space(&self, length: u32) -> bool {
        let log_size = self.log_size();
        let entries = self.entries.lock();
        let mut super_block = self.super_block.lock();

        let free = free_blocks(super_block.log_start, super_block.log_end, log_size);
        if length < free {
            return true;
        }
        if entries.list.is_empty() && length <= log_size {
            super_block.log_start = 0;
            super_block.log_end = 0;
            return true;
        }
        false
    }

    /// Writes descriptors and block contents starting at `log_end`.
    /// Returns the new, not wrapped, log end.
    fn write_log_entry(
        &self,
        builder: &RunArrayBuilder,
        owners: &HashMap<u64, TransactionId>,
        log_run: BlockRun,
        log_end: u32,
    ) -> Result<u32> {
        let geometry = self.volume.geometry();
        let log_size = self.log_size() as u64;
        let log_offset = geometry.to_offset(log_run);

        let mut log_start = log_end as u64 % log_size;
        let mut log_position = log_start;

        for array in builder.arrays() {
            let blocks: Vec<u64> = array.runs().iter().map(|run| geometry.to_block(*run)).collect();
            let pinned = self.pin_blocks(&blocks, owners)?;

            let written = self.write_run_array(array, &pinned, log_offset, log_start, log_size);
            for block in &blocks {
                self.cache.unpin(*block);
            }

            log_position = written?;
            log_start = log_position % log_size;
        }

        Ok(log_position as u32)
    }

    /// One descriptor and its blocks; split in two writes if the log wraps
    fn write_run_array(
        &self,
        array: &RunArray,
        blocks: &[Arc<[u8]>],
        log_offset: u64,
        log_start: u64,
        log_size: u64,
    ) -> Result<u64> {
        let shift = self.volume.geometry().block_shift;
        let descriptor = array.encode();

        let mut start = log_start;
        let mut wrap = log_size - start;
        let mut count = 1u64;
        let mut vecs: Vec<&[u8]> = Vec::with_capacity(blocks.len() + 1);
        vecs.push(&descriptor);

        for data in blocks {
            if count >= wrap {
                self.volume.write_vectored_at(log_offset + (start << shift), &vecs)?;
                start = 0;
                wrap = log_size;
                count = 0;
                vecs.clear();
            }
            vecs.push(data.as_ref());
            count += 1;
        }

        self.volume.write_vectored_at(log_offset + (start << shift), &vecs)?;
        Ok(start + count)
    }

    /// Pins the copy each block has in the batch, never a change of a
    /// transaction that is still running
    fn pin_blocks(&self, blocks: &[u64], owners: &HashMap<u64, TransactionId>) -> Result<Vec<Arc<[u8]>>> {
        let mut pinned = Vec::with_capacity(blocks.len());
        for block in blocks {
            let copy = match owners.get(block) {
                Some(id) => self.cache.pin(*block, *id),
                None => Err(JournalError::Cache(format!(
                    "block {} is not part of the log entry",
                    block
                ))),
            };
            match copy {
                Ok(data) => pinned.push(data),
                Err(e) => {
                    for block in &blocks[..pinned.len()] {
                        self.cache.unpin(*block);
                    }
                    return Err(e);
                }
            }
        }
        Ok(pinned)
    }

    /// Ends the transaction in the cache; the id is consumed either way
    fn end_in_cache(&self, id: TransactionId, notifier: Option<CacheNotifier>) {
        if let Err(e) = self.cache.end_transaction(id, notifier.clone()) {
            warn!("ending transaction {} failed ({}), syncing older ones", id, e);
            if let Err(e) = self.cache.sync_transaction(id.previous()) {
                warn!("syncing transactions before {} failed: {}", id, e);
            }
            if let Err(e) = self.cache.end_transaction(id, notifier) {
                panic!("cache refused to end transaction {}: {}", id, e);
            }
        }

        let mut pending = self.pending.lock();
        pending.last_ended = Some(pending.last_ended.map_or(id, |last| last.max(id)));
    }

    fn abort_in_cache(&self, id: TransactionId) {
        if let Err(e) = self.cache.abort_transaction(id) {
            error!("could not abort transaction {}: {}", id, e);
        }
    }

    fn abort_all(&self, pending: &[TransactionId]) {
        for id in pending {
            self.abort_in_cache(*id);
        }
    }
}
