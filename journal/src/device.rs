// File backed volume
// Volume image stored in a regular file or opened block device

use crate::volume::{metadata_blocks, Volume};
use bfs_core::{Geometry, JournalError, Result, SuperBlock, SUPER_BLOCK_OFFSET, SUPER_BLOCK_SIZE};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

pub struct FileVolume {
    path: PathBuf,
    file: Mutex<File>,
    geometry: Geometry,
    read_only: bool,
}

impl FileVolume {
    /// Creates an image file for a freshly formatted volume
    pub fn create<P: AsRef<Path>>(path: P, super_block: &SuperBlock) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let geometry = super_block.geometry();
        let metadata = metadata_blocks(super_block)?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        file.set_len(geometry.num_blocks << geometry.block_shift)?;
        file.write_all(&metadata)?;
        file.sync_all()?;

        log::info!(
            "created volume {} with {} blocks of {} bytes",
            path.display(),
            geometry.num_blocks,
            geometry.block_size
        );

        Ok(Self {
            path,
            file: Mutex::new(file),
            geometry,
            read_only: false,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new().read(true).write(!read_only).open(&path)?;

        let mut head = vec![0u8; SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE];
        file.read_exact(&mut head)?;
        let super_block = SuperBlock::from_block(&head)?;
        super_block.check()?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            geometry: super_block.geometry(),
            read_only,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(JournalError::ReadOnly);
        }
        Ok(())
    }
}

impl Volume for FileVolume {
    fn geometry(&self) -> Geometry {
        self.geometry
    }

    fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn read_super_block(&self) -> Result<SuperBlock> {
        let mut head = vec![0u8; SUPER_BLOCK_OFFSET + SUPER_BLOCK_SIZE];
        self.read_at(0, &mut head)?;
        SuperBlock::from_block(&head)
    }

    fn write_super_block(&self, super_block: &SuperBlock) -> Result<()> {
        self.check_writable()?;

        let mut block = vec![0u8; self.geometry.block_size as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut block)?;
        super_block.to_block(&mut block)?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&block)?;
        Ok(())
    }

    fn read_at(&self, offset: u64, buffer: &mut [u8]) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buffer)?;
        Ok(())
    }

    fn write_vectored_at(&self, offset: u64, buffers: &[&[u8]]) -> Result<()> {
        self.check_writable()?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        for buffer in buffers {
            file.write_all(buffer)?;
        }
        Ok(())
    }

    fn flush_drive_cache(&self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.file.lock().sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn super_block() -> SuperBlock {
        SuperBlock::format("file", 1024, 2048, 11, 64).unwrap()
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("volume.img");

        let volume = FileVolume::create(&path, &super_block()).unwrap();
        volume.write_at(300 * 1024, &[0xabu8; 1024]).unwrap();
        volume.flush_drive_cache().unwrap();
        drop(volume);

        let volume = FileVolume::open(&path, false).unwrap();
        assert_eq!(volume.geometry().num_blocks, 2048);
        assert_eq!(volume.read_block(300).unwrap(), vec![0xabu8; 1024]);
        assert_eq!(volume.read_super_block().unwrap(), super_block());
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 2048 * 1024);
    }

    #[test]
    fn test_read_only_refuses_writes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("volume.img");
        FileVolume::create(&path, &super_block()).unwrap();

        let volume = FileVolume::open(&path, true).unwrap();
        assert!(volume.is_read_only());
        assert!(matches!(volume.write_at(0, &[0u8; 1024]), Err(JournalError::ReadOnly)));
        assert!(matches!(
            volume.write_super_block(&super_block()),
            Err(JournalError::ReadOnly)
        ));
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("garbage.img");
        std::fs::write(&path, vec![0x11u8; 4096]).unwrap();

        assert!(FileVolume::open(&path, false).is_err());
    }
}
