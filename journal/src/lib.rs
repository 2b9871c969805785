pub mod allocator;
pub mod cache;
pub mod config;
pub mod device;
mod flusher;
pub mod journal;
pub mod log_entry;
pub mod memory;
pub mod run_array;
pub mod run_arrays;
pub mod transaction;
pub mod transaction_table;
pub mod volume;

pub use allocator::BlockAllocator;
pub use cache::{BlockCache, CacheEvent, CacheNotifier, TransactionId};
pub use config::JournalConfig;
pub use device::FileVolume;
pub use journal::{EntryDump, Journal, JournalDump, JournalLock};
pub use log_entry::LogEntry;
pub use memory::{MemoryAllocator, MemoryCache, MemoryVolume};
pub use run_array::RunArray;
pub use run_arrays::RunArrayBuilder;
pub use transaction::{JournalProvider, Transaction};
pub use transaction_table::{OwnerId, TransactionListener, TransactionTable};
pub use volume::Volume;

pub use bfs_core::{BlockRun, Geometry, JournalError, Result, SuperBlock};
