// In-memory block cache
// Per-transaction block copies, written home only when synced

use crate::cache::{BlockCache, CacheNotifier, TransactionId};
use crate::volume::Volume;
use bfs_core::{JournalError, Result};
use log::trace;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Default)]
struct OpenTransaction {
    blocks: BTreeMap<u64, Arc<[u8]>>,
    idle: Option<CacheNotifier>,
}

struct EndedTransaction {
    blocks: BTreeMap<u64, Arc<[u8]>>,
    notifier: Option<CacheNotifier>,
}

#[derive(Default)]
struct CacheState {
    next_id: u64,
    open: BTreeMap<TransactionId, OpenTransaction>,
    ended: BTreeMap<TransactionId, EndedTransaction>,
    pinned: HashMap<u64, usize>,
}

/// Block cache for tests and tools. Ended transactions stay in memory
/// until `sync` or `sync_transaction` writes them through the volume.
pub struct MemoryCache {
    volume: Arc<dyn Volume>,
    state: Mutex<CacheState>,
    fail_enumeration: AtomicBool,
    fail_next_end: AtomicBool,
    fail_write_back: AtomicBool,
}

impl MemoryCache {
    pub fn new(volume: Arc<dyn Volume>) -> Self {
        Self {
            volume,
            state: Mutex::new(CacheState {
                next_id: 1,
                ..CacheState::default()
            }),
            fail_enumeration: AtomicBool::new(false),
            fail_next_end: AtomicBool::new(false),
            fail_write_back: AtomicBool::new(false),
        }
    }

    /// Reports every open transaction with an idle listener as idle
    pub fn notify_idle(&self) {
        let state = self.state.lock();
        for (id, transaction) in &state.open {
            if let Some(notifier) = &transaction.idle {
                notifier.transaction_idle(*id);
            }
        }
    }

    pub fn fail_block_enumeration(&self, fail: bool) {
        self.fail_enumeration.store(fail, Ordering::SeqCst);
    }

    /// The next `end_transaction` fails and leaves the transaction running
    pub fn fail_next_end(&self) {
        self.fail_next_end.store(true, Ordering::SeqCst);
    }

    pub fn fail_write_back(&self, fail: bool) {
        self.fail_write_back.store(fail, Ordering::SeqCst);
    }

    pub fn open_transactions(&self) -> usize {
        self.state.lock().open.len()
    }

    /// Ended transactions not yet written home
    pub fn unsynced_transactions(&self) -> usize {
        self.state.lock().ended.len()
    }

    pub fn pinned_blocks(&self) -> usize {
        self.state.lock().pinned.values().sum()
    }

    /// Newest cached contents of `block`, if any transaction holds it
    pub fn cached_block(&self, block: u64) -> Option<Arc<[u8]>> {
        let state = self.state.lock();
        Self::lookup(&state, block)
    }

    fn lookup(state: &CacheState, block: u64) -> Option<Arc<[u8]>> {
        state
            .open
            .values()
            .rev()
            .find_map(|transaction| transaction.blocks.get(&block))
            .or_else(|| {
                state
                    .ended
                    .values()
                    .rev()
                    .find_map(|transaction| transaction.blocks.get(&block))
            })
            .cloned()
    }

    /// Copy of `block` in transaction `id`, else the newest copy an older
    /// ended transaction holds
    fn committed_copy(state: &CacheState, block: u64, id: TransactionId) -> Option<Arc<[u8]>> {
        state
            .open
            .get(&id)
            .and_then(|transaction| transaction.blocks.get(&block))
            .or_else(|| {
                state
                    .ended
                    .range(..=id)
                    .rev()
                    .find_map(|(_, transaction)| transaction.blocks.get(&block))
            })
            .cloned()
    }

    fn write_home(&self, state: &mut CacheState, up_to: Option<TransactionId>) -> Result<()> {
        if self.fail_write_back.load(Ordering::SeqCst) {
            return Err(JournalError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write back failure",
            )));
        }
        let shift = self.volume.geometry().block_shift;

        loop {
            let Some((&id, _)) = state.ended.iter().next() else {
                return Ok(());
            };
            if up_to.map_or(false, |limit| id > limit) {
                return Ok(());
            }

            let transaction = &state.ended[&id];
            for (block, data) in &transaction.blocks {
                self.volume.write_at(block << shift, data)?;
            }

            if let Some(transaction) = state.ended.remove(&id) {
                trace!("transaction {} written home", id);
                if let Some(notifier) = transaction.notifier {
                    notifier.transaction_written(id);
                }
            }
        }
    }
}

impl BlockCache for MemoryCache {
    fn start_transaction(&self) -> Result<TransactionId> {
        let mut state = self.state.lock();
        let id = TransactionId(state.next_id);
        state.next_id += 1;
        state.open.insert(id, OpenTransaction::default());
        Ok(id)
    }

    fn end_transaction(&self, id: TransactionId, notifier: Option<CacheNotifier>) -> Result<()> {
        if self.fail_next_end.swap(false, Ordering::SeqCst) {
            return Err(JournalError::Cache(format!("injected failure ending {}", id)));
        }
        let mut state = self.state.lock();
        let transaction = state
            .open
            .remove(&id)
            .ok_or_else(|| JournalError::Cache(format!("transaction {} is not running", id)))?;

        state.ended.insert(
            id,
            EndedTransaction {
                blocks: transaction.blocks,
                notifier,
            },
        );
        Ok(())
    }

    fn abort_transaction(&self, id: TransactionId) -> Result<()> {
        self.state
            .lock()
            .open
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| JournalError::Cache(format!("transaction {} is not running", id)))
    }

    fn sync_transaction(&self, id: TransactionId) -> Result<()> {
        let mut state = self.state.lock();
        self.write_home(&mut state, Some(id))
    }

    fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        self.write_home(&mut state, None)
    }

    fn blocks_in_transaction(&self, id: TransactionId) -> Result<Vec<u64>> {
        if self.fail_enumeration.load(Ordering::SeqCst) {
            return Err(JournalError::NoMemory(
                "injected block enumeration failure".to_string(),
            ));
        }

        let state = self.state.lock();
        let blocks = state
            .open
            .get(&id)
            .map(|transaction| &transaction.blocks)
            .or_else(|| state.ended.get(&id).map(|transaction| &transaction.blocks))
            .ok_or_else(|| JournalError::Cache(format!("unknown transaction {}", id)))?;
        Ok(blocks.keys().copied().collect())
    }

    fn block_count(&self, id: TransactionId) -> usize {
        let state = self.state.lock();
        state
            .open
            .get(&id)
            .map(|transaction| transaction.blocks.len())
            .or_else(|| state.ended.get(&id).map(|transaction| transaction.blocks.len()))
            .unwrap_or(0)
    }

    fn add_idle_listener(&self, id: TransactionId, notifier: CacheNotifier) -> Result<()> {
        let mut state = self.state.lock();
        let transaction = state
            .open
            .get_mut(&id)
            .ok_or_else(|| JournalError::Cache(format!("transaction {} is not running", id)))?;
        transaction.idle = Some(notifier);
        Ok(())
    }

    fn pin(&self, block: u64, id: TransactionId) -> Result<Arc<[u8]>> {
        let mut state = self.state.lock();
        let data = match Self::committed_copy(&state, block, id) {
            Some(data) => data,
            None => Arc::from(self.volume.read_block(block)?),
        };
        *state.pinned.entry(block).or_insert(0) += 1;
        Ok(data)
    }

    fn unpin(&self, block: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.pinned.get_mut(&block) {
            *count -= 1;
            if *count == 0 {
                state.pinned.remove(&block);
            }
        }
    }

    fn write_block(&self, block: u64, id: TransactionId, data: &[u8]) -> Result<()> {
        let block_size = self.volume.geometry().block_size as usize;
        if data.len() != block_size {
            return Err(JournalError::BadValue(format!(
                "block of {} bytes, expected {}",
                data.len(),
                block_size
            )));
        }

        let mut state = self.state.lock();
        let transaction = state
            .open
            .get_mut(&id)
            .ok_or_else(|| JournalError::Cache(format!("transaction {} is not running", id)))?;
        transaction.blocks.insert(block, Arc::from(data));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryVolume;
    use bfs_core::SuperBlock;

    fn cache() -> (Arc<MemoryVolume>, MemoryCache) {
        let super_block = SuperBlock::format("cache", 1024, 1024, 10, 32).unwrap();
        let volume = Arc::new(MemoryVolume::format(&super_block).unwrap());
        let cache = MemoryCache::new(volume.clone());
        (volume, cache)
    }

    #[test]
    fn test_blocks_stay_cached_until_sync() {
        let (volume, cache) = cache();
        let id = cache.start_transaction().unwrap();
        cache.write_block(200, id, &[7u8; 1024]).unwrap();
        cache.write_block(100, id, &[8u8; 1024]).unwrap();

        assert_eq!(cache.blocks_in_transaction(id).unwrap(), vec![100, 200]);
        assert_eq!(cache.block_count(id), 2);

        cache.end_transaction(id, None).unwrap();
        assert_eq!(volume.block(200), vec![0u8; 1024]);

        cache.sync().unwrap();
        assert_eq!(volume.block(200), vec![7u8; 1024]);
        assert_eq!(cache.unsynced_transactions(), 0);
    }

    #[test]
    fn test_sync_transaction_respects_limit() {
        let (volume, cache) = cache();
        let first = cache.start_transaction().unwrap();
        let second = cache.start_transaction().unwrap();
        cache.write_block(100, first, &[1u8; 1024]).unwrap();
        cache.write_block(101, second, &[2u8; 1024]).unwrap();
        cache.end_transaction(second, None).unwrap();
        cache.end_transaction(first, None).unwrap();

        cache.sync_transaction(first).unwrap();
        assert_eq!(volume.block(100), vec![1u8; 1024]);
        assert_eq!(volume.block(101), vec![0u8; 1024]);
        assert_eq!(cache.unsynced_transactions(), 1);
    }

    #[test]
    fn test_abort_discards_blocks() {
        let (volume, cache) = cache();
        let id = cache.start_transaction().unwrap();
        cache.write_block(100, id, &[9u8; 1024]).unwrap();
        cache.abort_transaction(id).unwrap();
        cache.sync().unwrap();

        assert_eq!(volume.block(100), vec![0u8; 1024]);
        assert!(cache.abort_transaction(id).is_err());
        assert!(cache.write_block(100, id, &[9u8; 1024]).is_err());
    }

    #[test]
    fn test_pin_uses_the_transactions_copy() {
        let (volume, cache) = cache();
        volume.set_block(100, &[3u8; 1024]);

        let id = cache.start_transaction().unwrap();
        assert_eq!(&cache.pin(100, id).unwrap()[..], &[3u8; 1024][..]);
        cache.write_block(100, id, &[4u8; 1024]).unwrap();
        assert_eq!(&cache.pin(100, id).unwrap()[..], &[4u8; 1024][..]);
        assert_eq!(cache.pinned_blocks(), 2);

        cache.unpin(100);
        cache.unpin(100);
        assert_eq!(cache.pinned_blocks(), 0);
    }

    #[test]
    fn test_pin_ignores_other_running_transactions() {
        let (volume, cache) = cache();
        volume.set_block(100, &[1u8; 1024]);

        let committed = cache.start_transaction().unwrap();
        cache.write_block(100, committed, &[2u8; 1024]).unwrap();
        let running = cache.start_transaction().unwrap();
        cache.write_block(100, running, &[3u8; 1024]).unwrap();

        assert_eq!(&cache.pin(100, committed).unwrap()[..], &[2u8; 1024][..]);
        cache.unpin(100);

        // an ended transaction's copy beats the home copy
        cache.end_transaction(committed, None).unwrap();
        let later = cache.start_transaction().unwrap();
        assert_eq!(&cache.pin(100, later).unwrap()[..], &[2u8; 1024][..]);
        cache.unpin(100);

        // the running one still sees its own change
        assert_eq!(&cache.pin(100, running).unwrap()[..], &[3u8; 1024][..]);
        cache.unpin(100);
        assert_eq!(cache.cached_block(100).as_deref(), Some(&[3u8; 1024][..]));
    }
}
