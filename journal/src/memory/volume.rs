// In-memory volume
// Keeps the whole image in memory and records the writes issued to it

use crate::volume::{metadata_blocks, Volume};
use bfs_core::{Geometry, JournalError, Result, SuperBlock};
use parking_lot::Mutex;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// One device write as issued, before it was split into blocks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub offset: u64,
    pub length: usize,
    pub buffers: usize,
}

impl WriteRecord {
    pub fn first_block(&self, geometry: &Geometry) -> u64 {
        self.offset >> geometry.block_shift
    }

    pub fn block_count(&self, geometry: &Geometry) -> usize {
        self.length / geometry.block_size as usize
    }
}

pub struct MemoryVolume {
    geometry: Geometry,
    image: Mutex<Vec<u8>>,
    writes: Mutex<Vec<WriteRecord>>,
    read_only: AtomicBool,
    fail_super_block_writes: AtomicBool,
    fail_device_writes: AtomicBool,
    drive_cache_flushes: AtomicUsize,
}

impl MemoryVolume {
    /// Formats a fresh volume described by `super_block`
    pub fn format(super_block: &SuperBlock) -> Result<Self> {
        let geometry = super_block.geometry();
        let mut image = metadata_blocks(super_block)?;
        image.resize((geometry.num_blocks << geometry.block_shift) as usize, 0);
        Self::from_image(image)
    }

    /// Wraps an existing image, e.g. a copy taken from another volume
    pub fn from_image(image: Vec<u8>) -> Result<Self> {
        let super_block = SuperBlock::from_block(&image)?;
        let geometry = super_block.geometry();
        if (image.len() as u64) < geometry.num_blocks << geometry.block_shift {
            return Err(JournalError::BadValue(format!(
                "image of {} bytes is smaller than its {} blocks",
                image.len(),
                geometry.num_blocks
            )));
        }

        Ok(Self {
            geometry,
            image: Mutex::new(image),
            writes: Mutex::new(Vec::new()),
            read_only: AtomicBool::new(false),
            fail_super_block_writes: AtomicBool::new(false),
            fail_device_writes: AtomicBool::new(false),
            drive_cache_flushes: AtomicUsize::new(0),
        })
    }

    /// Copy of the current image, as a crash would leave it
    pub fn image(&self) -> Vec<u8> {
        self.image.lock().clone()
    }

    pub fn block(&self, block: u64) -> Vec<u8> {
        let offset = (block << self.geometry.block_shift) as usize;
        self.image.lock()[offset..offset + self.geometry.block_size as usize].to_vec()
    }

    /// Overwrites a block directly, bypassing the write log
    pub fn set_block(&self, block: u64, data: &[u8]) {
        let offset = (block << self.geometry.block_shift) as usize;
        self.image.lock()[offset..offset + data.len()].copy_from_slice(data);
    }

    /// Superblock as currently stored on the image
    pub fn stored_super_block(&self) -> Result<SuperBlock> {
        SuperBlock::from_block(&self.image.lock())
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        self.writes.lock().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    pub fn drive_cache_flushes(&self) -> usize {
        self.drive_cache_flushes.load(Ordering::SeqCst)
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.read_only.store(read_only, Ordering::SeqCst);
    }

    pub fn fail_super_block_writes(&self, fail: bool) {
        self.fail_super_block_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_device_writes(&self, fail: bool) {
        self.fail_device_writes.store(fail, Ordering::SeqCst);
    }

    fn check_range(&self, offset: u64, length: usize, image_len: usize) -> Result<()> {
        if offset as usize + length > image_len {
            return Err(JournalError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("access at {} of {} bytes beyond the volume", offset, length),
            )));
        }
        Ok(())
    }
}

impl Volume for MemoryVolume {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn read_super_block(&self) -> Result<SuperBlock> {
        self.stored_super_block()
    }

    fn write_super_block(&self, super_block: &SuperBlock) -> Result<()> {
        if self.fail_super_block_writes.load(Ordering::SeqCst) {
            return Err(JournalError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected superblock write failure",
            )));
        }
        if self.is_read_only() {
            return Err(JournalError::ReadOnly);
        }

        let mut image = self.image.lock();
        super_block.to_block(&mut image[..self.geometry.block_size as usize])
    }

    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let image = self.image.lock();
        self.check_range(offset, buffer.len(), image.len())?;
        let start = offset as usize;
        buffer.copy_from_slice(&image[start..start + buffer.len()]);
        Ok(())
    }

    fn write_vectored_at(&self, offset: u64, buffers: &[&[u8]]) -> Result<()> {
        if self.fail_device_writes.load(Ordering::SeqCst) {
            return Err(JournalError::Io(io::Error::new(
                io::ErrorKind::Other,
                "injected device write failure",
            )));
        }
        if self.is_read_only() {
            return Err(JournalError::ReadOnly);
        }

        let length: usize = buffers.iter().map(|buffer| buffer.len()).sum();
        let mut image = self.image.lock();
        self.check_range(offset, length, image.len())?;

        let mut position = offset as usize;
        for buffer in buffers {
            image[position..position + buffer.len()].copy_from_slice(buffer);
            position += buffer.len();
        }

        self.writes.lock().push(WriteRecord {
            offset,
            length,
            buffers: buffers.len(),
        });
        Ok(())
    }

    fn flush_drive_cache(&self) -> Result<()> {
        self.drive_cache_flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
