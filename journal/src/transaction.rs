// Transaction handle
// Scope bound access to a journal transaction, aborting when dropped

use crate::cache::TransactionId;
use crate::journal::Journal;
use crate::transaction_table::{OwnerId, TransactionListener};
use bfs_core::{JournalError, Result};
use log::debug;
use std::sync::Arc;

/// Resolves the journal responsible for a block
pub trait JournalProvider {
    fn journal_for(&self, ref_block: u64) -> Option<Arc<Journal>>;
}

impl JournalProvider for Arc<Journal> {
    fn journal_for(&self, _ref_block: u64) -> Option<Arc<Journal>> {
        Some(self.clone())
    }
}

impl JournalProvider for Option<Arc<Journal>> {
    fn journal_for(&self, _ref_block: u64) -> Option<Arc<Journal>> {
        self.clone()
    }
}

/// Handle on the owner's current transaction.
///
/// Handles of the same owner share one underlying transaction; only the
/// outermost `done` writes it to the log. Dropping a started handle
/// without `done` aborts the whole transaction.
pub struct Transaction {
    journal: Option<Arc<Journal>>,
    owner: OwnerId,
    id: Option<TransactionId>,
}

impl Transaction {
    /// Handle for the calling thread, not started yet
    pub fn new() -> Self {
        Self::with_owner(OwnerId::current())
    }

    pub fn with_owner(owner: OwnerId) -> Self {
        Self {
            journal: None,
            owner,
            id: None,
        }
    }

    /// Creates a handle for the calling thread and starts it
    pub fn begin<P: JournalProvider + ?Sized>(provider: &P, ref_block: u64) -> Result<Self> {
        let mut transaction = Self::new();
        transaction.start(provider, ref_block)?;
        Ok(transaction)
    }

    /// Starts or joins the owner's transaction; no-op if already started
    pub fn start<P: JournalProvider + ?Sized>(&mut self, provider: &P, ref_block: u64) -> Result<()> {
        if self.journal.is_some() {
            return Ok(());
        }

        let journal = provider.journal_for(ref_block).ok_or_else(|| {
            JournalError::NotInitialized(format!("no journal for block {}", ref_block))
        })?;
        let id = journal.start_transaction(self.owner)?;

        self.id = Some(id);
        self.journal = Some(journal);
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.journal.is_some()
    }

    pub fn id(&self) -> Option<TransactionId> {
        self.id
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn journal(&self) -> Option<&Arc<Journal>> {
        self.journal.as_ref()
    }

    /// Commits this scope. The handle is detached afterwards, whatever
    /// the outcome.
    pub fn done(&mut self) -> Result<()> {
        self.finish(true)
    }

    fn finish(&mut self, success: bool) -> Result<()> {
        let Some(journal) = self.journal.take() else {
            return Ok(());
        };
        self.id = None;
        journal.commit_transaction(self.owner, success)
    }

    /// True once the transaction outgrew what the log takes in one batch
    pub fn is_too_large(&self) -> bool {
        match (&self.journal, self.id) {
            (Some(journal), Some(id)) => journal.current_transaction_too_large(id),
            _ => false,
        }
    }

    /// Copies `count` blocks from `buffer` into the cache, starting at
    /// `block`, as part of this transaction.
    pub fn write_blocks(&self, block: u64, buffer: &[u8], count: usize) -> Result<()> {
        let (Some(journal), Some(id)) = (&self.journal, self.id) else {
            return Err(JournalError::NotInitialized(
                "transaction has not been started".to_string(),
            ));
        };

        let block_size = journal.volume().geometry().block_size as usize;
        if buffer.len() < count * block_size {
            return Err(JournalError::BadValue(format!(
                "buffer of {} bytes for {} blocks",
                buffer.len(),
                count
            )));
        }

        for (index, data) in buffer.chunks_exact(block_size).take(count).enumerate() {
            journal.cache().write_block(block + index as u64, id, data)?;
        }
        Ok(())
    }

    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) -> Result<()> {
        let journal = self.running_journal()?;
        journal.add_transaction_listener(self.owner, listener)
    }

    /// Detaches the listener and tells it so right away
    pub fn remove_listener(&self, listener: &Arc<dyn TransactionListener>) -> Result<()> {
        let journal = self.running_journal()?;
        if !journal.remove_transaction_listener(self.owner, listener) {
            return Err(JournalError::BadValue(
                "listener is not attached to this transaction".to_string(),
            ));
        }
        Ok(())
    }

    fn running_journal(&self) -> Result<&Arc<Journal>> {
        self.journal
            .as_ref()
            .ok_or_else(|| JournalError::NotInitialized("transaction is not running".to_string()))
    }
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.journal.is_some() {
            if let Err(e) = self.finish(false) {
                debug!("aborting transaction for {:?} failed: {}", self.owner, e);
            }
        }
    }
}
