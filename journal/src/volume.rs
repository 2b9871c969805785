// Volume interface
// Device I/O and superblock persistence as seen by the journal

use bfs_core::{Geometry, JournalError, Result, SuperBlock};

pub trait Volume: Send + Sync {
    fn geometry(&self) -> Geometry;

    fn is_read_only(&self) -> bool;

    fn read_super_block(&self) -> Result<SuperBlock>;

    /// Persists the superblock into block 0
    fn write_super_block(&self, super_block: &SuperBlock) -> Result<()>;

    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()>;

    /// Writes the buffers back to back starting at `offset`
    fn write_vectored_at(&self, offset: u64, buffers: &[&[u8]]) -> Result<()>;

    fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.write_vectored_at(offset, &[data])
    }

    fn flush_drive_cache(&self) -> Result<()>;

    fn read_block(&self, block: u64) -> Result<Vec<u8>> {
        let geometry = self.geometry();
        let mut data = vec![0u8; geometry.block_size as usize];
        self.read_at(block << geometry.block_shift, &mut data)?;
        Ok(data)
    }
}

/// Superblock and free-space bitmap of a freshly formatted volume, i.e.
/// every block up to the start of the log area.
pub fn metadata_blocks(super_block: &SuperBlock) -> Result<Vec<u8>> {
    super_block.check()?;

    let geometry = super_block.geometry();
    let block_size = geometry.block_size as usize;
    let bitmap_blocks = geometry.num_bitmap_blocks() as usize;
    let mut image = vec![0u8; (1 + bitmap_blocks) * block_size];

    super_block.to_block(&mut image[..block_size])?;

    let used = super_block.used_blocks as u64;
    if used > geometry.num_blocks {
        return Err(JournalError::BadValue(format!(
            "{} used blocks on a volume of {}",
            used, geometry.num_blocks
        )));
    }
    let bitmap = &mut image[block_size..];
    for block in 0..used as usize {
        bitmap[block / 8] |= 1 << (block % 8);
    }

    Ok(image)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_blocks_mark_reserved_area() {
        let super_block = SuperBlock::format("meta", 1024, 4096, 13, 64).unwrap();
        let image = metadata_blocks(&super_block).unwrap();

        assert_eq!(image.len(), 2 * 1024);
        assert_eq!(SuperBlock::from_block(&image[..1024]).unwrap(), super_block);
        // superblock, one bitmap block and 64 log blocks
        assert!(image[1024..1024 + 8].iter().all(|byte| *byte == 0xff));
        assert_eq!(image[1024 + 8], 0b0000_0011);
        assert_eq!(image[1024 + 9], 0);
    }
}
