pub mod block_run;
pub mod error;
pub mod super_block;

pub use block_run::{BlockRun, Geometry, BLOCK_RUN_SIZE};
pub use error::{JournalError, Result};
pub use super_block::{
    SuperBlock, SUPER_BLOCK_DISK_CLEAN, SUPER_BLOCK_DISK_DIRTY, SUPER_BLOCK_OFFSET,
    SUPER_BLOCK_SIZE,
};
