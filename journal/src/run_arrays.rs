// Run array builder
// Collects the blocks of pending transactions into log descriptors

use crate::run_array::RunArray;
use bfs_core::{BlockRun, Geometry, JournalError, Result};

/// Accumulates block numbers into as many run arrays as needed.
///
/// A block appears at most once across all arrays.
pub struct RunArrayBuilder {
    geometry: Geometry,
    arrays: Vec<RunArray>,
    block_count: u32,
}

impl RunArrayBuilder {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            arrays: Vec::new(),
            block_count: 0,
        }
    }

    /// Adds `block`, ignoring it if an earlier insert already covers it
    pub fn insert(&mut self, block: u64) -> Result<()> {
        let run = self.geometry.to_block_run(block);

        if !self.arrays.is_empty() && self.contains_run(&run) {
            return Ok(());
        }

        if !self.add_run(run) {
            self.add_array()?;
            if !self.add_run(run) {
                return Err(JournalError::NoMemory(format!(
                    "no room for block {} in a fresh run array",
                    block
                )));
            }
        }
        Ok(())
    }

    fn contains_run(&self, run: &BlockRun) -> bool {
        self.arrays.iter().any(|array| array.contains(run))
    }

    // only single block runs, replay of existing volumes expects them
    fn add_run(&mut self, run: BlockRun) -> bool {
        debug_assert_eq!(run.length, 1);

        let Some(array) = self.arrays.last_mut() else {
            return false;
        };
        if !array.insert(run) {
            return false;
        }
        self.block_count += 1;
        true
    }

    fn add_array(&mut self) -> Result<()> {
        let array = RunArray::new(self.geometry.block_size)?;
        self.arrays
            .try_reserve(1)
            .map_err(|e| JournalError::NoMemory(format!("run array list: {}", e)))?;
        self.arrays.push(array);
        Ok(())
    }

    pub fn arrays(&self) -> &[RunArray] {
        &self.arrays
    }

    pub fn count_arrays(&self) -> usize {
        self.arrays.len()
    }

    pub fn count_blocks(&self) -> u32 {
        self.block_count
    }

    /// Blocks the entry occupies in the log: descriptors plus data
    pub fn log_entry_length(&self) -> u32 {
        self.block_count + self.arrays.len() as u32
    }

    pub fn max_array_length(&self) -> usize {
        self.arrays.iter().map(RunArray::count).max().unwrap_or(0)
    }
}
