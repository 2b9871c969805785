// Run array
// Block sized log descriptor listing the single-block runs of one log entry

use bfs_core::{BlockRun, Geometry, JournalError, Result, BLOCK_RUN_SIZE};
use byteorder::{ByteOrder, LittleEndian};
use static_assertions::const_assert_eq;
use std::cmp::Ordering;

/// `count` and `max_runs`, both i32
pub const RUN_ARRAY_HEADER_SIZE: usize = 8;

const_assert_eq!(RUN_ARRAY_HEADER_SIZE, 2 * std::mem::size_of::<i32>());

/// Upper bound the on-disk format places on a single array
const MAX_RUNS_LIMIT: usize = 127;

/// Below this many runs the insertion index is found by a linear scan
const LINEAR_SCAN_LIMIT: usize = 8;

/// Number of run slots in a descriptor for the given block size.
///
/// One less than what fits: existing logs carry this value in their
/// header and replay rejects anything else.
pub fn max_runs(block_size: u32) -> usize {
    let fitting = (block_size as usize).saturating_sub(RUN_ARRAY_HEADER_SIZE) / BLOCK_RUN_SIZE;
    fitting.min(MAX_RUNS_LIMIT).saturating_sub(1)
}

/// Sorted set of single-block runs, encoded into exactly one block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunArray {
    block_size: u32,
    max_runs: usize,
    runs: Vec<BlockRun>,
}

impl RunArray {
    /// Allocates an empty array; fails with `NoMemory` instead of aborting
    pub fn new(block_size: u32) -> Result<Self> {
        let max_runs = max_runs(block_size);
        let mut runs = Vec::new();
        runs.try_reserve_exact(max_runs)
            .map_err(|e| JournalError::NoMemory(format!("run array: {}", e)))?;

        Ok(Self {
            block_size,
            max_runs,
            runs,
        })
    }

    pub fn count(&self) -> usize {
        self.runs.len()
    }

    pub fn max_runs(&self) -> usize {
        self.max_runs
    }

    pub fn is_full(&self) -> bool {
        self.runs.len() >= self.max_runs
    }

    pub fn runs(&self) -> &[BlockRun] {
        &self.runs
    }

    pub fn run_at(&self, index: usize) -> Option<&BlockRun> {
        self.runs.get(index)
    }

    /// True if some run of this array covers `run` completely
    pub fn contains(&self, run: &BlockRun) -> bool {
        self.runs.iter().any(|existing| existing.contains(run))
    }

    /// Inserts `run` keeping the runs ordered by group and start.
    ///
    /// Capacity is the caller's business; a full array leaves the run
    /// out and reports `false`.
    pub fn insert(&mut self, run: BlockRun) -> bool {
        if self.is_full() {
            return false;
        }

        let index = self.insertion_index(&run);
        self.runs.insert(index, run);
        true
    }

    fn insertion_index(&self, run: &BlockRun) -> usize {
        if self.runs.len() > LINEAR_SCAN_LIMIT {
            match self.runs.binary_search_by(|existing| existing.cmp_position(run)) {
                Ok(index) | Err(index) => index,
            }
        } else {
            self.runs
                .iter()
                .position(|existing| existing.cmp_position(run) == Ordering::Greater)
                .unwrap_or(self.runs.len())
        }
    }

    /// Encodes the array into a block; unused slots stay zero
    pub fn encode(&self) -> Vec<u8> {
        let mut block = vec![0u8; self.block_size as usize];
        LittleEndian::write_i32(&mut block[0..4], self.runs.len() as i32);
        LittleEndian::write_i32(&mut block[4..8], self.max_runs as i32);

        for (index, run) in self.runs.iter().enumerate() {
            let offset = RUN_ARRAY_HEADER_SIZE + index * BLOCK_RUN_SIZE;
            let slot = &mut block[offset..offset + BLOCK_RUN_SIZE];
            LittleEndian::write_i32(&mut slot[0..4], run.allocation_group);
            LittleEndian::write_u16(&mut slot[4..6], run.start);
            LittleEndian::write_u16(&mut slot[6..8], run.length);
        }
        block
    }

    /// Decodes a descriptor read back from the log and checks its header
    /// and every run against the volume.
    pub fn decode(block: &[u8], geometry: &Geometry) -> Result<Self> {
        if block.len() < geometry.block_size as usize {
            return Err(JournalError::CorruptLog(format!(
                "descriptor of {} bytes is shorter than a block",
                block.len()
            )));
        }

        let count = LittleEndian::read_i32(&block[0..4]);
        let stored_max = LittleEndian::read_i32(&block[4..8]);
        let expected_max = max_runs(geometry.block_size);

        if stored_max != expected_max as i32 || count > expected_max as i32 || count <= 0 {
            log::error!(
                "Log entry has broken header: run count {}, array max {}, max runs {}",
                count,
                stored_max,
                expected_max
            );
            return Err(JournalError::CorruptLog(format!(
                "broken run array header (count {}, max {})",
                count, stored_max
            )));
        }

        let mut array = Self::new(geometry.block_size)?;
        for index in 0..count as usize {
            let offset = RUN_ARRAY_HEADER_SIZE + index * BLOCK_RUN_SIZE;
            let slot = &block[offset..offset + BLOCK_RUN_SIZE];
            let run = BlockRun::new(
                LittleEndian::read_i32(&slot[0..4]),
                LittleEndian::read_u16(&slot[4..6]),
                LittleEndian::read_u16(&slot[6..8]),
            );
            geometry.validate_block_run(run)?;
            // stored order is kept as is, replay writes in descriptor order
            array.runs.push(run);
        }

        log::debug!("Log entry has {} runs", count);
        Ok(array)
    }

    /// Number of data blocks following this descriptor in the log
    pub fn block_count(&self) -> u32 {
        self.runs.iter().map(|run| run.length as u32).sum()
    }
}
