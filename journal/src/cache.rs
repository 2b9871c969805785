// Block cache interface
// The journal never touches home locations itself, the cache writes them back

use crate::flusher::FlusherSignal;
use crate::log_entry::LogEntry;
use bfs_core::Result;
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::Arc;

/// Cache assigned transaction id, increasing with every started transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Id right before this one, used to sync everything older
    pub fn previous(self) -> TransactionId {
        TransactionId(self.0.saturating_sub(1))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Notification sent by the cache to the journal
#[derive(Debug)]
pub enum CacheEvent {
    /// Every block of the transaction reached its home location
    Written {
        id: TransactionId,
        entry: Arc<LogEntry>,
    },
    /// The transaction has not been touched for a while
    Idle { id: TransactionId },
}

/// Handle the cache keeps to report on a transaction.
///
/// Sending never blocks; a journal that has gone away simply misses the
/// event.
#[derive(Clone)]
pub struct CacheNotifier {
    events: Sender<CacheEvent>,
    wake: Sender<FlusherSignal>,
    entry: Option<Arc<LogEntry>>,
}

impl CacheNotifier {
    pub(crate) fn new(
        events: Sender<CacheEvent>,
        wake: Sender<FlusherSignal>,
        entry: Option<Arc<LogEntry>>,
    ) -> Self {
        Self { events, wake, entry }
    }

    pub fn transaction_written(&self, id: TransactionId) {
        if let Some(entry) = &self.entry {
            let _ = self.events.send(CacheEvent::Written {
                id,
                entry: entry.clone(),
            });
            let _ = self.wake.send(FlusherSignal::Wake);
        }
    }

    pub fn transaction_idle(&self, id: TransactionId) {
        let _ = self.events.send(CacheEvent::Idle { id });
        let _ = self.wake.send(FlusherSignal::Wake);
    }
}

impl fmt::Debug for CacheNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheNotifier")
            .field("entry", &self.entry.as_ref().map(|entry| entry.id()))
            .finish()
    }
}

/// Operations the journal needs from the block cache
pub trait BlockCache: Send + Sync {
    fn start_transaction(&self) -> Result<TransactionId>;

    /// Hands the transaction over for write back. The notifier, if any,
    /// is told once all of its blocks are home. A failed call leaves the
    /// transaction running; the journal syncs older ones and retries.
    fn end_transaction(&self, id: TransactionId, notifier: Option<CacheNotifier>) -> Result<()>;

    /// Drops every change made in the transaction
    fn abort_transaction(&self, id: TransactionId) -> Result<()>;

    /// Writes back every ended transaction up to and including `id`
    fn sync_transaction(&self, id: TransactionId) -> Result<()>;

    /// Writes back every ended transaction
    fn sync(&self) -> Result<()>;

    /// Blocks changed in the transaction, in ascending order
    fn blocks_in_transaction(&self, id: TransactionId) -> Result<Vec<u64>>;

    fn block_count(&self, id: TransactionId) -> usize;

    fn add_idle_listener(&self, id: TransactionId, notifier: CacheNotifier) -> Result<()>;

    /// Contents of `block` as transaction `id` left it, held in memory
    /// until `unpin`. Changes of other running transactions are never
    /// returned, only older ended ones or the home copy.
    fn pin(&self, block: u64, id: TransactionId) -> Result<Arc<[u8]>>;

    fn unpin(&self, block: u64);

    /// Replaces the contents of `block` as part of transaction `id`
    fn write_block(&self, block: u64, id: TransactionId, data: &[u8]) -> Result<()>;
}
