// Shared helpers for the journal scenario tests
#![allow(dead_code)]

use bfs_journal::{
    Journal, JournalConfig, MemoryCache, MemoryVolume, Result, SuperBlock, Transaction,
    TransactionListener,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Once};

static INIT: Once = Once::new();

pub fn init_logging() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

pub const BLOCK_SIZE: usize = 1024;
pub const NUM_BLOCKS: u64 = 4096;
/// First log block of every test volume: superblock plus one bitmap block
pub const LOG_START: u64 = 2;

pub struct TestVolume {
    pub volume: Arc<MemoryVolume>,
    pub cache: Arc<MemoryCache>,
    pub journal: Arc<Journal>,
}

/// Journal settings for deterministic tests: no background flusher
pub fn config() -> JournalConfig {
    JournalConfig {
        background_flush: false,
        ..JournalConfig::default()
    }
}

pub fn format(log_blocks: u16) -> SuperBlock {
    SuperBlock::format("journal test", BLOCK_SIZE as u32, NUM_BLOCKS, 13, log_blocks).unwrap()
}

pub fn setup(log_blocks: u16) -> TestVolume {
    setup_with(format(log_blocks), config())
}

pub fn setup_with(super_block: SuperBlock, config: JournalConfig) -> TestVolume {
    init_logging();
    let volume = Arc::new(MemoryVolume::format(&super_block).unwrap());
    open(volume, config)
}

/// Mounts an existing volume with an empty cache
pub fn open(volume: Arc<MemoryVolume>, config: JournalConfig) -> TestVolume {
    init_logging();
    let cache = Arc::new(MemoryCache::new(volume.clone()));
    let journal = Journal::new(volume.clone(), cache.clone(), config).unwrap();
    TestVolume {
        volume,
        cache,
        journal,
    }
}

/// Volume restored from the current image, as if power failed right now
pub fn crash_copy(volume: &MemoryVolume) -> Arc<MemoryVolume> {
    Arc::new(MemoryVolume::from_image(volume.image()).unwrap())
}

pub fn block(fill: u8) -> Vec<u8> {
    vec![fill; BLOCK_SIZE]
}

/// Runs one transaction writing `fill` into every listed block
pub fn write_transaction(journal: &Arc<Journal>, blocks: &[u64], fill: u8) -> Result<()> {
    let mut transaction = Transaction::begin(journal, blocks.first().copied().unwrap_or(0))?;
    for number in blocks {
        transaction.write_blocks(*number, &block(fill), 1)?;
    }
    transaction.done()
}

/// Log block holding log offset `position`
pub fn log_block(position: u64) -> u64 {
    LOG_START + position
}

#[derive(Default)]
pub struct RecordingListener {
    pub outcomes: Mutex<Vec<bool>>,
    pub removed: AtomicUsize,
}

impl RecordingListener {
    pub fn outcomes(&self) -> Vec<bool> {
        self.outcomes.lock().clone()
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

impl TransactionListener for RecordingListener {
    fn transaction_done(&self, success: bool) {
        self.outcomes.lock().push(success);
    }

    fn removed_from_transaction(&self) {
        self.removed.fetch_add(1, Ordering::SeqCst);
    }
}
