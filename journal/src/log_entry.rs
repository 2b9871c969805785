// Log entries
// One written batch of transactions, alive until the cache confirms it

use crate::cache::TransactionId;
use std::sync::atomic::{AtomicI32, Ordering};

#[derive(Debug)]
pub struct LogEntry {
    /// Sequence number, for dumps only
    id: u64,
    /// First transaction folded into the entry
    transaction: TransactionId,
    /// Log position the entry was written at, not reduced modulo the log size
    start: u32,
    /// Blocks used in the log, descriptors included
    length: u32,
    /// Transactions still waiting for their blocks to reach home
    pending: AtomicI32,
}

impl LogEntry {
    pub fn new(id: u64, transaction: TransactionId, start: u32, length: u32, count: i32) -> Self {
        Self {
            id,
            transaction,
            start,
            length,
            pending: AtomicI32::new(count),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn transaction(&self) -> TransactionId {
        self.transaction
    }

    pub fn start(&self) -> u32 {
        self.start
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn pending(&self) -> i32 {
        self.pending.load(Ordering::Acquire)
    }

    /// Returns the count before decrementing; the caller that sees 1 owns
    /// the retirement of the entry.
    pub fn decrement(&self) -> i32 {
        self.pending.fetch_sub(1, Ordering::AcqRel)
    }
}
