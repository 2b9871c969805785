// Transaction table
// Maps each owner to its open transaction so that nested scopes share it

use crate::cache::TransactionId;
use bfs_core::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Identity transactions are keyed on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OwnerId {
    Thread(ThreadId),
    /// Caller supplied identity, for work that hops between threads
    Task(u64),
}

impl OwnerId {
    pub fn current() -> Self {
        OwnerId::Thread(thread::current().id())
    }
}

/// Observer of a transaction's final outcome
pub trait TransactionListener: Send + Sync {
    /// Called once, when the outermost scope commits or aborts
    fn transaction_done(&self, success: bool);

    /// Called when the listener is detached, after `transaction_done` if
    /// that fired at all
    fn removed_from_transaction(&self);
}

struct TableEntry {
    id: TransactionId,
    nesting: u32,
    failed: bool,
    listeners: Vec<Arc<dyn TransactionListener>>,
}

/// Result of committing one scope
pub enum CommitOutcome {
    /// An enclosing scope is still open
    Nested,
    /// The outermost scope closed; the transaction leaves the table
    Finished {
        id: TransactionId,
        /// False if any scope, nested or not, failed
        success: bool,
        listeners: Vec<Arc<dyn TransactionListener>>,
    },
}

#[derive(Default)]
pub struct TransactionTable {
    entries: Mutex<HashMap<OwnerId, TableEntry>>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins the owner's open transaction or registers the one `start`
    /// creates. The flag tells whether a new transaction was started.
    pub fn join_or_start<F>(&self, owner: OwnerId, start: F) -> Result<(TransactionId, bool)>
    where
        F: FnOnce() -> Result<TransactionId>,
    {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&owner) {
            entry.nesting += 1;
            return Ok((entry.id, false));
        }

        let id = start()?;
        entries.insert(
            owner,
            TableEntry {
                id,
                nesting: 1,
                failed: false,
                listeners: Vec::new(),
            },
        );
        Ok((id, true))
    }

    /// Closes one scope of the owner's transaction, or returns `None` if
    /// the owner has none.
    pub fn commit(&self, owner: OwnerId, success: bool) -> Option<CommitOutcome> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&owner)?;

        entry.failed |= !success;
        entry.nesting -= 1;
        if entry.nesting > 0 {
            return Some(CommitOutcome::Nested);
        }

        let entry = entries.remove(&owner)?;
        Some(CommitOutcome::Finished {
            id: entry.id,
            success: !entry.failed,
            listeners: entry.listeners,
        })
    }

    pub fn current(&self, owner: OwnerId) -> Option<TransactionId> {
        self.entries.lock().get(&owner).map(|entry| entry.id)
    }

    pub fn nesting(&self, owner: OwnerId) -> u32 {
        self.entries.lock().get(&owner).map_or(0, |entry| entry.nesting)
    }

    pub fn add_listener(&self, owner: OwnerId, listener: Arc<dyn TransactionListener>) -> bool {
        match self.entries.lock().get_mut(&owner) {
            Some(entry) => {
                entry.listeners.push(listener);
                true
            }
            None => false,
        }
    }

    /// Detaches the listener; the caller delivers the removal callback
    pub fn remove_listener(&self, owner: OwnerId, listener: &Arc<dyn TransactionListener>) -> bool {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&owner) else {
            return false;
        };

        match entry.listeners.iter().position(|l| Arc::ptr_eq(l, listener)) {
            Some(index) => {
                entry.listeners.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bfs_core::JournalError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(AtomicUsize);

    impl TransactionListener for Counter {
        fn transaction_done(&self, _success: bool) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }

        fn removed_from_transaction(&self) {}
    }

    #[test]
    fn test_nested_join_shares_id() {
        let table = TransactionTable::new();
        let owner = OwnerId::Task(1);

        let (id, started) = table.join_or_start(owner, || Ok(TransactionId(5))).unwrap();
        assert!(started);
        let (nested, started) = table
            .join_or_start(owner, || panic!("nested scope must not start a transaction"))
            .unwrap();
        assert!(!started);
        assert_eq!(nested, id);
        assert_eq!(table.nesting(owner), 2);

        assert!(matches!(table.commit(owner, true), Some(CommitOutcome::Nested)));
        match table.commit(owner, true) {
            Some(CommitOutcome::Finished { id, success, .. }) => {
                assert_eq!(id, TransactionId(5));
                assert!(success);
            }
            _ => panic!("outermost commit must finish the transaction"),
        }
        assert!(table.is_empty());
        assert!(table.commit(owner, true).is_none());
    }

    #[test]
    fn test_failure_is_sticky() {
        let table = TransactionTable::new();
        let owner = OwnerId::Task(2);
        table.join_or_start(owner, || Ok(TransactionId(1))).unwrap();
        table.join_or_start(owner, || Ok(TransactionId(2))).unwrap();

        table.commit(owner, false);
        match table.commit(owner, true) {
            Some(CommitOutcome::Finished { success, .. }) => assert!(!success),
            _ => panic!("expected the transaction to finish"),
        }
    }

    #[test]
    fn test_failed_start_leaves_table_alone() {
        let table = TransactionTable::new();
        let owner = OwnerId::Task(3);

        let result = table.join_or_start(owner, || Err(JournalError::NoMemory("cache".into())));
        assert!(result.is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn test_owners_are_independent() {
        let table = TransactionTable::new();
        table.join_or_start(OwnerId::Task(1), || Ok(TransactionId(1))).unwrap();
        table.join_or_start(OwnerId::Task(2), || Ok(TransactionId(2))).unwrap();

        assert_eq!(table.len(), 2);
        assert_eq!(table.current(OwnerId::Task(2)), Some(TransactionId(2)));
        assert_eq!(table.current(OwnerId::current()), None);
    }

    #[test]
    fn test_listener_bookkeeping() {
        let table = TransactionTable::new();
        let owner = OwnerId::Task(4);
        let listener: Arc<dyn TransactionListener> = Arc::new(Counter(AtomicUsize::new(0)));
        let other: Arc<dyn TransactionListener> = Arc::new(Counter(AtomicUsize::new(0)));

        assert!(!table.add_listener(owner, listener.clone()));
        table.join_or_start(owner, || Ok(TransactionId(9))).unwrap();
        assert!(table.add_listener(owner, listener.clone()));
        assert!(table.add_listener(owner, other.clone()));
        assert!(table.remove_listener(owner, &other));
        assert!(!table.remove_listener(owner, &other));

        match table.commit(owner, true) {
            Some(CommitOutcome::Finished { listeners, .. }) => {
                assert_eq!(listeners.len(), 1);
                assert!(Arc::ptr_eq(&listeners[0], &listener));
            }
            _ => panic!("expected the transaction to finish"),
        }
    }
}
