// Block runs and volume geometry
// Converts between flat block numbers and (allocation group, start, length) runs

use crate::error::{JournalError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use static_assertions::assert_eq_size;
use std::cmp::Ordering;
use std::io::{self, Read, Write};

/// Size of an encoded block run on disk
pub const BLOCK_RUN_SIZE: usize = 8;

/// Contiguous range of blocks inside one allocation group
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRun {
    /* 0x00 */ pub allocation_group: i32,
    /* 0x04 */ pub start: u16,
    /* 0x06 */ pub length: u16,
}

assert_eq_size!(BlockRun, [u8; BLOCK_RUN_SIZE]);

impl BlockRun {
    pub fn new(allocation_group: i32, start: u16, length: u16) -> Self {
        Self {
            allocation_group,
            start,
            length,
        }
    }

    pub fn is_zero(&self) -> bool {
        self.allocation_group == 0 && self.start == 0 && self.length == 0
    }

    /// Orders runs by position only, ignoring their length
    pub fn cmp_position(&self, other: &BlockRun) -> Ordering {
        self.allocation_group
            .cmp(&other.allocation_group)
            .then(self.start.cmp(&other.start))
    }

    /// True if `other` lies completely inside this run
    pub fn contains(&self, other: &BlockRun) -> bool {
        self.allocation_group == other.allocation_group
            && other.start >= self.start
            && other.start as u32 + other.length as u32 <= self.start as u32 + self.length as u32
    }

    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Self> {
        Ok(Self {
            allocation_group: reader.read_i32::<LittleEndian>()?,
            start: reader.read_u16::<LittleEndian>()?,
            length: reader.read_u16::<LittleEndian>()?,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        writer.write_i32::<LittleEndian>(self.allocation_group)?;
        writer.write_u16::<LittleEndian>(self.start)?;
        writer.write_u16::<LittleEndian>(self.length)
    }
}

impl std::fmt::Display for BlockRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.allocation_group, self.start, self.length)
    }
}

/// Block layout of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub block_size: u32,
    pub block_shift: u32,
    /// Blocks per allocation group is `1 << ag_shift`
    pub ag_shift: u32,
    pub num_ags: u32,
    pub num_blocks: u64,
}

impl Geometry {
    pub fn blocks_per_ag(&self) -> u64 {
        1u64 << self.ag_shift
    }

    /// Number of bitmap blocks following the superblock
    pub fn num_bitmap_blocks(&self) -> u64 {
        let bits_per_block = self.block_size as u64 * 8;
        (self.num_blocks + bits_per_block - 1) / bits_per_block
    }

    pub fn to_block(&self, run: BlockRun) -> u64 {
        ((run.allocation_group as u64) << self.ag_shift) | run.start as u64
    }

    /// Single-block run addressing `block`
    pub fn to_block_run(&self, block: u64) -> BlockRun {
        let mask = self.blocks_per_ag() - 1;
        BlockRun::new(
            (block >> self.ag_shift) as i32,
            (block & mask) as u16,
            1,
        )
    }

    /// Byte offset of the first block of `run`
    pub fn to_offset(&self, run: BlockRun) -> u64 {
        self.to_block(run) << self.block_shift
    }

    pub fn validate_block_run(&self, run: BlockRun) -> Result<()> {
        let per_ag = self.blocks_per_ag();
        let valid = run.allocation_group >= 0
            && (run.allocation_group as u32) < self.num_ags
            && run.length != 0
            && run.start as u64 + run.length as u64 <= per_ag
            && self.to_block(run) + run.length as u64 <= self.num_blocks;

        if !valid {
            return Err(JournalError::CorruptLog(format!(
                "invalid block run {} (groups {}, blocks {})",
                run, self.num_ags, self.num_blocks
            )));
        }
        Ok(())
    }
}
