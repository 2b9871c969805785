// BFS superblock
// Only the log pointers are mutated by the journal; the rest is layout

use crate::block_run::{BlockRun, Geometry};
use crate::error::{JournalError, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use static_assertions::const_assert;
use std::io::{Cursor, Read, Write};

pub const SUPER_BLOCK_MAGIC1: i32 = 0x42465331; // 'BFS1'
pub const SUPER_BLOCK_MAGIC2: i32 = 0xdd121031u32 as i32;
pub const SUPER_BLOCK_MAGIC3: i32 = 0x15b6830e;
pub const SUPER_BLOCK_FS_LENDIAN: i32 = 0x42494745; // 'BIGE'

pub const SUPER_BLOCK_DISK_CLEAN: i32 = 0x434c454e; // 'CLEN'
pub const SUPER_BLOCK_DISK_DIRTY: i32 = 0x44495254; // 'DIRT'

/// Byte offset of the superblock inside block 0
pub const SUPER_BLOCK_OFFSET: usize = 512;
/// Encoded size of the superblock
pub const SUPER_BLOCK_SIZE: usize = 0xA4;
pub const MIN_BLOCK_SIZE: u32 = 1024;
pub const MAX_BLOCK_SIZE: u32 = 8192;

const_assert!(SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE <= MIN_BLOCK_SIZE as usize);

/// On-disk superblock, little endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SuperBlock {
    /* 0x00 */ pub name: [u8; 32],
    /* 0x20 */ pub magic1: i32,
    /* 0x24 */ pub fs_byte_order: i32,
    /* 0x28 */ pub block_size: u32,
    /* 0x2C */ pub block_shift: u32,
    /* 0x30 */ pub num_blocks: i64,
    /* 0x38 */ pub used_blocks: i64,
    /* 0x40 */ pub inode_size: i32,
    /* 0x44 */ pub magic2: i32,
    /* 0x48 */ pub blocks_per_ag: i32,
    /* 0x4C */ pub ag_shift: i32,
    /* 0x50 */ pub num_ags: i32,
    /* 0x54 */ pub flags: i32,
    /* 0x58 */ pub log_blocks: BlockRun,
    /* 0x60 */ pub log_start: i64,
    /* 0x68 */ pub log_end: i64,
    /* 0x70 */ pub magic3: i32,
    /* 0x74 */ pub root_dir: BlockRun,
    /* 0x7C */ pub indices: BlockRun,
    /* 0x84 */ pub pad: [i32; 8],
}

impl SuperBlock {
    /// Lays out a fresh volume: superblock in block 0, the free-space
    /// bitmap from block 1, and the log directly after the bitmap.
    pub fn format(
        name: &str,
        block_size: u32,
        num_blocks: u64,
        ag_shift: u32,
        log_length: u16,
    ) -> Result<Self> {
        if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(JournalError::BadValue(format!("unsupported block size {}", block_size)));
        }
        if ag_shift == 0 || ag_shift > 16 {
            return Err(JournalError::BadValue(format!("unsupported group shift {}", ag_shift)));
        }

        let per_ag = 1u64 << ag_shift;
        let num_ags = (num_blocks + per_ag - 1) / per_ag;
        let bits_per_block = block_size as u64 * 8;
        let bitmap_blocks = (num_blocks + bits_per_block - 1) / bits_per_block;
        let log_start = 1 + bitmap_blocks;

        if num_blocks < 10 || log_start + log_length as u64 > per_ag.min(num_blocks) {
            return Err(JournalError::BadValue(format!(
                "log of {} blocks does not fit into the first group of {} blocks",
                log_length, num_blocks
            )));
        }

        let mut raw_name = [0u8; 32];
        for (slot, byte) in raw_name.iter_mut().zip(name.bytes().take(31)) {
            *slot = byte;
        }

        Ok(Self {
            name: raw_name,
            magic1: SUPER_BLOCK_MAGIC1,
            fs_byte_order: SUPER_BLOCK_FS_LENDIAN,
            block_size,
            block_shift: block_size.trailing_zeros(),
            num_blocks: num_blocks as i64,
            used_blocks: (log_start + log_length as u64) as i64,
            inode_size: block_size as i32,
            magic2: SUPER_BLOCK_MAGIC2,
            blocks_per_ag: ((per_ag + bits_per_block - 1) / bits_per_block) as i32,
            ag_shift: ag_shift as i32,
            num_ags: num_ags as i32,
            flags: SUPER_BLOCK_DISK_CLEAN,
            log_blocks: BlockRun::new(0, log_start as u16, log_length),
            log_start: 0,
            log_end: 0,
            magic3: SUPER_BLOCK_MAGIC3,
            root_dir: BlockRun::default(),
            indices: BlockRun::default(),
            pad: [0; 8],
        })
    }

    pub fn geometry(&self) -> Geometry {
        Geometry {
            block_size: self.block_size,
            block_shift: self.block_shift,
            ag_shift: self.ag_shift as u32,
            num_ags: self.num_ags as u32,
            num_blocks: self.num_blocks as u64,
        }
    }

    pub fn log_length(&self) -> u32 {
        self.log_blocks.length as u32
    }

    pub fn is_clean(&self) -> bool {
        self.flags == SUPER_BLOCK_DISK_CLEAN
    }

    /// Structural self-check, mirroring what mounting expects
    pub fn check(&self) -> Result<()> {
        let fail = |reason: &str| Err(JournalError::CorruptLog(format!("invalid superblock: {}", reason)));

        if self.magic1 != SUPER_BLOCK_MAGIC1
            || self.magic2 != SUPER_BLOCK_MAGIC2
            || self.magic3 != SUPER_BLOCK_MAGIC3
        {
            return fail("bad magic");
        }
        if self.fs_byte_order != SUPER_BLOCK_FS_LENDIAN {
            return fail("unsupported byte order");
        }
        if self.block_shift >= 32 || 1u32 << self.block_shift != self.block_size {
            return fail("block size does not match block shift");
        }
        if self.inode_size != self.block_size as i32 {
            return fail("inode size differs from block size");
        }
        if self.num_ags < 1 || self.ag_shift < 1 || self.ag_shift > 16 || self.blocks_per_ag < 1 {
            return fail("bad allocation group layout");
        }
        if self.num_blocks < 10 {
            return fail("volume too small");
        }
        let per_ag = 1i64 << self.ag_shift;
        if self.num_ags as i64 != (self.num_blocks + per_ag - 1) / per_ag {
            return fail("group count does not cover the volume");
        }
        if self.flags != SUPER_BLOCK_DISK_CLEAN && self.flags != SUPER_BLOCK_DISK_DIRTY {
            return fail("unknown state flags");
        }
        let log_length = self.log_blocks.length as i64;
        if self.log_start < 0 || self.log_start > log_length || self.log_end < 0 || self.log_end > log_length {
            return fail("log pointers outside the log area");
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let mut name = [0u8; 32];
        reader.read_exact(&mut name)?;

        let magic1 = reader.read_i32::<LittleEndian>()?;
        let fs_byte_order = reader.read_i32::<LittleEndian>()?;
        let block_size = reader.read_u32::<LittleEndian>()?;
        let block_shift = reader.read_u32::<LittleEndian>()?;
        let num_blocks = reader.read_i64::<LittleEndian>()?;
        let used_blocks = reader.read_i64::<LittleEndian>()?;
        let inode_size = reader.read_i32::<LittleEndian>()?;
        let magic2 = reader.read_i32::<LittleEndian>()?;
        let blocks_per_ag = reader.read_i32::<LittleEndian>()?;
        let ag_shift = reader.read_i32::<LittleEndian>()?;
        let num_ags = reader.read_i32::<LittleEndian>()?;
        let flags = reader.read_i32::<LittleEndian>()?;
        let log_blocks = BlockRun::read_from(reader)?;
        let log_start = reader.read_i64::<LittleEndian>()?;
        let log_end = reader.read_i64::<LittleEndian>()?;
        let magic3 = reader.read_i32::<LittleEndian>()?;
        let root_dir = BlockRun::read_from(reader)?;
        let indices = BlockRun::read_from(reader)?;
        let mut pad = [0i32; 8];
        reader.read_i32_into::<LittleEndian>(&mut pad)?;

        Ok(Self {
            name,
            magic1,
            fs_byte_order,
            block_size,
            block_shift,
            num_blocks,
            used_blocks,
            inode_size,
            magic2,
            blocks_per_ag,
            ag_shift,
            num_ags,
            flags,
            log_blocks,
            log_start,
            log_end,
            magic3,
            root_dir,
            indices,
            pad,
        })
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        writer.write_all(&self.name)?;
        writer.write_i32::<LittleEndian>(self.magic1)?;
        writer.write_i32::<LittleEndian>(self.fs_byte_order)?;
        writer.write_u32::<LittleEndian>(self.block_size)?;
        writer.write_u32::<LittleEndian>(self.block_shift)?;
        writer.write_i64::<LittleEndian>(self.num_blocks)?;
        writer.write_i64::<LittleEndian>(self.used_blocks)?;
        writer.write_i32::<LittleEndian>(self.inode_size)?;
        writer.write_i32::<LittleEndian>(self.magic2)?;
        writer.write_i32::<LittleEndian>(self.blocks_per_ag)?;
        writer.write_i32::<LittleEndian>(self.ag_shift)?;
        writer.write_i32::<LittleEndian>(self.num_ags)?;
        writer.write_i32::<LittleEndian>(self.flags)?;
        self.log_blocks.write_to(writer)?;
        writer.write_i64::<LittleEndian>(self.log_start)?;
        writer.write_i64::<LittleEndian>(self.log_end)?;
        writer.write_i32::<LittleEndian>(self.magic3)?;
        self.root_dir.write_to(writer)?;
        self.indices.write_to(writer)?;
        for value in self.pad {
            writer.write_i32::<LittleEndian>(value)?;
        }
        Ok(())
    }

    /// Decodes the superblock stored inside the first volume block
    pub fn from_block(block: &[u8]) -> Result<Self> {
        if block.len() < SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE {
            return Err(JournalError::BadValue(format!(
                "block of {} bytes cannot hold a superblock",
                block.len()
            )));
        }
        let mut cursor = Cursor::new(&block[SUPER_BLOCK_OFFSET..SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE]);
        Self::read_from(&mut cursor)
    }

    /// Encodes the superblock into the first volume block, leaving the
    /// rest of the block untouched.
    pub fn to_block(&self, block: &mut [u8]) -> Result<()> {
        if block.len() < SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE {
            return Err(JournalError::BadValue(format!(
                "block of {} bytes cannot hold a superblock",
                block.len()
            )));
        }
        let mut cursor = Cursor::new(&mut block[SUPER_BLOCK_OFFSET..SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE]);
        self.write_to(&mut cursor)
    }

    /// Validates a raw copy of block 0, e.g. one found in the log
    pub fn check_block(block: &[u8]) -> Result<()> {
        Self::from_block(block)?.check()
    }
}
