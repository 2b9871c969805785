// Log replay
// Re-applies unfinished log entries after an unclean shutdown

use super::Journal;
use crate::run_array::RunArray;
use bfs_core::{
    BlockRun, JournalError, Result, SuperBlock, SUPER_BLOCK_DISK_CLEAN, SUPER_BLOCK_DISK_DIRTY,
};
use log::{debug, error, info};

impl Journal {
    /// Writes every entry between log start and log end to its home
    /// location and marks the log empty. A clean log is left untouched.
    pub fn replay_log(&self) -> Result<()> {
        let _log = self.log_lock.lock();
        let super_block = *self.super_block.lock();

        if super_block.log_start == super_block.log_end {
            return Ok(());
        }

        info!("Replay log, disk was not correctly unmounted...");
        if super_block.flags != SUPER_BLOCK_DISK_DIRTY {
            info!("log_start and log_end differ, but disk is marked clean - trying to replay log...");
        }

        if self.volume.is_read_only() {
            return Err(JournalError::ReadOnly);
        }

        let log_size = self.log_size();
        let size = log_size as i64;
        let (start, end) = (super_block.log_start, super_block.log_end);
        if start < 0 || start > size || end < 0 || end > size {
            error!(
                "Log pointers are invalid (start = {}, end = {}, size = {})",
                start, end, log_size
            );
            return Err(JournalError::BadValue(format!(
                "log pointers {}..{} outside a log of {} blocks",
                start, end, log_size
            )));
        }

        let mut position = (start % size) as u32;
        let wrapped_end = (end % size) as u32;
        // equal positions with differing pointers mean a completely full log
        let mut remaining = if wrapped_end > position {
            wrapped_end - position
        } else {
            log_size - position + wrapped_end
        };

        let mut last_start = None;
        while remaining > 0 {
            if last_start == Some(position) {
                return Err(JournalError::CorruptLog(format!(
                    "replay did not advance past log block {}",
                    position
                )));
            }
            last_start = Some(position);

            let consumed = self
                .replay_run_array(super_block.log_blocks, position)
                .map_err(|e| {
                    error!("replaying log entry from {} failed: {}", position, e);
                    e
                })?;

            if consumed > remaining {
                return Err(JournalError::CorruptLog(format!(
                    "log entry at {} covers {} blocks, only {} are left in the log",
                    position, consumed, remaining
                )));
            }
            remaining -= consumed;
            position = (position + consumed) % log_size;
        }

        debug!("replaying worked fine");
        let mut super_block = self.super_block.lock();
        super_block.log_start = super_block.log_end;
        super_block.flags = SUPER_BLOCK_DISK_CLEAN;
        self.volume.write_super_block(&super_block)
    }

    /// Replays the entry whose descriptor sits at `position`. Nothing is
    /// written before every block of the entry checked out. Returns the
    /// number of log blocks the entry uses.
    fn replay_run_array(&self, log_run: BlockRun, position: u32) -> Result<u32> {
        let geometry = self.volume.geometry();
        let log_size = self.log_size();
        let log_block = geometry.to_block(log_run);

        let descriptor = self.volume.read_block(log_block + position as u64)?;
        let array = RunArray::decode(&descriptor, &geometry)?;

        let mut blocks = Vec::with_capacity(array.block_count() as usize);
        let mut block_number = (position + 1) % log_size;

        for run in array.runs() {
            let mut offset = geometry.to_offset(*run);
            for _ in 0..run.length {
                let data = self.volume.read_block(log_block + block_number as u64)?;

                if offset == 0 && SuperBlock::check_block(&data).is_err() {
                    error!("Log contains invalid superblock!");
                    return Err(JournalError::CorruptLog(format!(
                        "log block {} holds an invalid superblock",
                        block_number
                    )));
                }

                blocks.push((offset, data));
                block_number = (block_number + 1) % log_size;
                offset += geometry.block_size as u64;
            }
        }

        for (offset, data) in &blocks {
            debug!("replay block {} from the log", offset >> geometry.block_shift);
            self.volume.write_at(*offset, data)?;
        }

        Ok(1 + blocks.len() as u32)
    }
}
