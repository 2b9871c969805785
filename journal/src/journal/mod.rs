// Journal
// Coordinates transactions, the circular log area and its reclamation

mod completion;
mod log_writer;
mod relocate;
mod replay;

use crate::cache::{BlockCache, CacheEvent, CacheNotifier, TransactionId};
use crate::config::JournalConfig;
use crate::flusher::{Flusher, FlusherSignal};
use crate::log_entry::LogEntry;
use crate::transaction_table::{CommitOutcome, OwnerId, TransactionListener, TransactionTable};
use crate::volume::Volume;
use bfs_core::{JournalError, Result, SuperBlock, SUPER_BLOCK_DISK_CLEAN};
use log::{debug, info, trace, warn};
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Committed transactions not yet written to the log
#[derive(Default)]
struct PendingTransactions {
    ids: Vec<TransactionId>,
    /// Blocks changed by `ids`, descriptors not included
    blocks: u32,
    /// Newest transaction handed to the cache for write back
    last_ended: Option<TransactionId>,
}

/// Written log entries, oldest first
#[derive(Default)]
struct LogEntries {
    list: VecDeque<Arc<LogEntry>>,
    used: u32,
}

pub struct Journal {
    volume: Arc<dyn Volume>,
    cache: Arc<dyn BlockCache>,
    config: JournalConfig,

    /// Serializes everything that writes to the log area
    log_lock: ReentrantMutex<()>,
    pending: Mutex<PendingTransactions>,
    /// Serializes log relocations; the log pointers are guarded by
    /// `super_block`
    relocation_lock: Mutex<()>,
    /// In-memory copy of the superblock, owner of the log pointers
    super_block: Mutex<SuperBlock>,
    entries: Mutex<LogEntries>,
    transactions: TransactionTable,

    log_size: AtomicU32,
    max_transaction_size: AtomicU32,
    next_entry_id: AtomicU64,
    /// Background passes that found the log locked
    skipped_flushes: AtomicU64,
    last_activity: Mutex<Instant>,

    events: Mutex<Receiver<CacheEvent>>,
    event_sender: Mutex<Sender<CacheEvent>>,
    wake_sender: Mutex<Sender<FlusherSignal>>,
    flusher: Mutex<Option<Flusher>>,
}

/// Holds the journal's log lock after a full flush
pub struct JournalLock<'a> {
    _guard: ReentrantMutexGuard<'a, ()>,
}

impl Journal {
    /// Opens the journal of `volume`. Does not replay the log, call
    /// `replay_log` before handing out transactions.
    pub fn new(
        volume: Arc<dyn Volume>,
        cache: Arc<dyn BlockCache>,
        config: JournalConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let super_block = volume.read_super_block()?;
        let log_size = super_block.log_length();
        if log_size < config.min_log_blocks {
            return Err(JournalError::BadValue(format!(
                "log of {} blocks is smaller than the minimum of {}",
                log_size, config.min_log_blocks
            )));
        }
        let max_transaction_size = config.max_transaction_size(log_size);

        let (event_sender, event_receiver) = mpsc::channel();
        let (wake_sender, wake_receiver) = mpsc::channel();

        let journal = Arc::new(Self {
            volume,
            cache,
            log_lock: ReentrantMutex::new(()),
            pending: Mutex::new(PendingTransactions::default()),
            relocation_lock: Mutex::new(()),
            super_block: Mutex::new(super_block),
            entries: Mutex::new(LogEntries::default()),
            transactions: TransactionTable::new(),
            log_size: AtomicU32::new(log_size),
            max_transaction_size: AtomicU32::new(max_transaction_size),
            next_entry_id: AtomicU64::new(1),
            skipped_flushes: AtomicU64::new(0),
            last_activity: Mutex::new(Instant::now()),
            events: Mutex::new(event_receiver),
            event_sender: Mutex::new(event_sender),
            wake_sender: Mutex::new(wake_sender.clone()),
            flusher: Mutex::new(None),
            config,
        });

        if journal.config.background_flush {
            let flusher = Flusher::spawn(
                Arc::downgrade(&journal),
                wake_sender,
                wake_receiver,
                journal.config.flush_interval,
            )?;
            *journal.flusher.lock() = Some(flusher);
        }

        info!(
            "journal opened: log {} ({} blocks), max transaction size {}",
            super_block.log_blocks, log_size, max_transaction_size
        );
        Ok(journal)
    }

    pub fn volume(&self) -> &Arc<dyn Volume> {
        &self.volume
    }

    pub fn cache(&self) -> &Arc<dyn BlockCache> {
        &self.cache
    }

    pub fn config(&self) -> &JournalConfig {
        &self.config
    }

    pub fn log_size(&self) -> u32 {
        self.log_size.load(Ordering::Acquire)
    }

    pub fn max_transaction_size(&self) -> u32 {
        self.max_transaction_size.load(Ordering::Acquire)
    }

    /// Copy of the journal's view of the superblock
    pub fn super_block(&self) -> SuperBlock {
        *self.super_block.lock()
    }

    /// Log blocks not covered by unfinished entries
    pub fn free_log_blocks(&self) -> u32 {
        let super_block = self.super_block.lock();
        free_blocks(super_block.log_start, super_block.log_end, self.log_size())
    }

    /// Blocks the cache holds for the transaction
    pub fn current_transaction_size(&self, id: TransactionId) -> usize {
        self.cache.block_count(id)
    }

    pub fn current_transaction_too_large(&self, id: TransactionId) -> bool {
        self.current_transaction_size(id) > self.max_transaction_size() as usize
    }

    /// Transaction the owner currently has open, if any
    pub fn current_transaction(&self, owner: OwnerId) -> Option<TransactionId> {
        self.transactions.current(owner)
    }

    /// Starts a transaction for `owner`, or joins the one it has open
    pub fn start_transaction(&self, owner: OwnerId) -> Result<TransactionId> {
        let (id, started) = self
            .transactions
            .join_or_start(owner, || self.cache.start_transaction())?;

        if started {
            trace!("transaction {} started for {:?}", id, owner);
            if let Err(e) = self.cache.add_idle_listener(id, self.notifier(None)) {
                warn!("could not watch transaction {} for idleness: {}", id, e);
            }
        }
        Ok(id)
    }

    /// Closes one scope of the owner's transaction. The outermost scope
    /// hands it to the log, or aborts it if any scope failed.
    pub fn commit_transaction(&self, owner: OwnerId, success: bool) -> Result<()> {
        let outcome = match self.transactions.commit(owner, success) {
            Some(outcome) => outcome,
            None => panic!("commit without an open transaction for {:?}", owner),
        };

        let (id, succeeded, mut listeners) = match outcome {
            CommitOutcome::Nested => return Ok(()),
            CommitOutcome::Finished {
                id,
                success,
                listeners,
            } => (id, success, listeners),
        };

        let status = self.transaction_done(id, succeeded);
        let committed = succeeded && status.is_ok();

        while let Some(listener) = listeners.pop() {
            listener.transaction_done(committed);
            listener.removed_from_transaction();
        }
        *self.last_activity.lock() = Instant::now();

        status?;
        if success && !succeeded {
            return Err(JournalError::TransactionFailed(format!(
                "transaction {} was aborted by a nested scope",
                id
            )));
        }
        Ok(())
    }

    pub fn add_transaction_listener(
        &self,
        owner: OwnerId,
        listener: Arc<dyn TransactionListener>,
    ) -> Result<()> {
        if !self.transactions.add_listener(owner, listener) {
            return Err(JournalError::NotInitialized(format!(
                "{:?} has no open transaction",
                owner
            )));
        }
        Ok(())
    }

    /// Detaches the listener, which is told so right away
    pub fn remove_transaction_listener(
        &self,
        owner: OwnerId,
        listener: &Arc<dyn TransactionListener>,
    ) -> bool {
        let removed = self.transactions.remove_listener(owner, listener);
        if removed {
            listener.removed_from_transaction();
        }
        removed
    }

    /// Writes pending transactions to the log; their blocks stay in the
    /// cache until it writes them back.
    pub fn flush_log(&self) -> Result<()> {
        let _log = self.log_lock.lock();
        self.flush_pending_locked()
    }

    /// Writes pending transactions to the log and has the cache write
    /// every ended transaction home.
    pub fn flush_log_and_blocks(&self) -> Result<()> {
        let _log = self.log_lock.lock();
        self.flush_locked()
    }

    /// Like `flush_log_and_blocks`, but keeps the log locked until the
    /// returned guard is dropped.
    pub fn flush_log_and_lock_journal(&self) -> Result<JournalLock<'_>> {
        let guard = self.log_lock.lock();
        self.flush_locked()?;
        Ok(JournalLock { _guard: guard })
    }

    fn flush_locked(&self) -> Result<()> {
        self.flush_pending_locked()?;
        let synced = self.cache.sync();
        self.process_cache_events();
        synced
    }

    /// One pass of the background flusher. Never waits for the log lock.
    pub(crate) fn background_flush(&self, woken: bool, interval: Duration) {
        self.process_cache_events();

        let Some(_log) = self.log_lock.try_lock() else {
            trace!("log busy, background flush skipped");
            self.skipped_flushes.fetch_add(1, Ordering::Relaxed);
            return;
        };
        if self.pending.lock().ids.is_empty() {
            return;
        }
        if !woken && self.last_activity.lock().elapsed() < interval {
            return;
        }
        if let Err(e) = self.flush_pending_locked() {
            warn!("background log flush failed: {}", e);
        }
    }

    /// Stops the background flusher; the journal stays usable
    pub fn shutdown(&self) {
        let flusher = self.flusher.lock().take();
        if let Some(mut flusher) = flusher {
            debug!("stopping log flusher {:?}", flusher.thread_id());
            flusher.stop();
        }
    }

    pub(crate) fn notifier(&self, entry: Option<Arc<LogEntry>>) -> CacheNotifier {
        CacheNotifier::new(
            self.event_sender.lock().clone(),
            self.wake_sender.lock().clone(),
            entry,
        )
    }

    pub fn dump(&self) -> JournalDump {
        let (pending_transactions, pending_blocks) = {
            let pending = self.pending.lock();
            (pending.ids.len(), pending.blocks)
        };
        let entries = self.entries.lock();
        let super_block = self.super_block.lock();

        JournalDump {
            log_start: super_block.log_start,
            log_end: super_block.log_end,
            clean: super_block.flags == SUPER_BLOCK_DISK_CLEAN,
            log_size: self.log_size(),
            max_transaction_size: self.max_transaction_size(),
            used: entries.used,
            pending_transactions,
            pending_blocks,
            skipped_flushes: self.skipped_flushes.load(Ordering::Relaxed),
            open_transactions: self.transactions.len(),
            idle: self.last_activity.lock().elapsed(),
            entries: entries
                .list
                .iter()
                .map(|entry| EntryDump {
                    id: entry.id(),
                    transaction: entry.transaction(),
                    start: entry.start(),
                    length: entry.length(),
                    pending: entry.pending(),
                })
                .collect(),
        }
    }
}

impl Drop for Journal {
    fn drop(&mut self) {
        self.shutdown();
        if let Err(e) = self.flush_log_and_blocks() {
            warn!("could not flush the log on shutdown: {}", e);
        }
    }
}

/// Free blocks between end and start; `end` may equal the log size
fn free_blocks(start: i64, end: i64, log_size: u32) -> u32 {
    let size = log_size as i64;
    let free = if start <= end {
        size - end + start
    } else {
        start - end
    };
    free.clamp(0, size) as u32
}

/// Snapshot of the journal state
#[derive(Debug, Clone)]
pub struct JournalDump {
    pub log_start: i64,
    pub log_end: i64,
    pub clean: bool,
    pub log_size: u32,
    pub max_transaction_size: u32,
    pub used: u32,
    pub pending_transactions: usize,
    pub pending_blocks: u32,
    pub skipped_flushes: u64,
    pub open_transactions: usize,
    pub idle: Duration,
    pub entries: Vec<EntryDump>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryDump {
    pub id: u64,
    pub transaction: TransactionId,
    pub start: u32,
    pub length: u32,
    pub pending: i32,
}

impl fmt::Display for JournalDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Journal")?;
        writeln!(f, "  log start:            {}", self.log_start)?;
        writeln!(f, "  log end:              {}", self.log_end)?;
        writeln!(f, "  clean:                {}", self.clean)?;
        writeln!(f, "  log size:             {}", self.log_size)?;
        writeln!(f, "  max transaction size: {}", self.max_transaction_size)?;
        writeln!(f, "  used:                 {}", self.used)?;
        writeln!(
            f,
            "  pending:              {} ({} blocks)",
            self.pending_transactions, self.pending_blocks
        )?;
        writeln!(f, "  skipped flushes:      {}", self.skipped_flushes)?;
        writeln!(f, "  open transactions:    {}", self.open_transactions)?;
        writeln!(f, "  idle:                 {:?}", self.idle)?;
        writeln!(f, "entries:")?;
        writeln!(f, "  {:>6} {:>6} {:>6} {:>6} {:>7}", "entry", "id", "start", "length", "pending")?;
        for entry in &self.entries {
            writeln!(
                f,
                "  {:>6} {:>6} {:>6} {:>6} {:>7}",
                entry.id, entry.transaction, entry.start, entry.length, entry.pending
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_blocks() {
        assert_eq!(free_blocks(0, 0, 100), 100);
        assert_eq!(free_blocks(10, 30, 100), 80);
        assert_eq!(free_blocks(30, 10, 100), 20);
        // completely filled log, end is kept unwrapped
        assert_eq!(free_blocks(0, 100, 100), 0);
        assert_eq!(free_blocks(100, 100, 100), 100);
        assert_eq!(free_blocks(100, 4, 100), 96);
    }

    #[test]
    fn test_dump_display() {
        let dump = JournalDump {
            log_start: 4,
            log_end: 8,
            clean: false,
            log_size: 100,
            max_transaction_size: 45,
            used: 4,
            pending_transactions: 0,
            pending_blocks: 0,
            skipped_flushes: 2,
            open_transactions: 1,
            idle: Duration::from_millis(3),
            entries: vec![EntryDump {
                id: 2,
                transaction: TransactionId(7),
                start: 4,
                length: 4,
                pending: 1,
            }],
        };

        let text = dump.to_string();
        assert!(text.contains("log size:             100"));
        assert!(text.contains("max transaction size: 45"));
        assert!(text.contains("skipped flushes:      2"));
        assert!(text.lines().last().unwrap().split_whitespace().eq(["2", "7", "4", "4", "1"]));
    }
}
