use thiserror::Error;

/// Result type used throughout the journal crates.
pub type Result<T> = std::result::Result<T, JournalError>;

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("Journal not initialized: {0}")]
    NotInitialized(String),

    #[error("Bad value: {0}")]
    BadValue(String),

    #[error("Out of memory: {0}")]
    NoMemory(String),

    #[error("Transaction too large: {blocks} blocks do not fit into a log of {log_size} blocks")]
    TransactionTooLarge { blocks: u32, log_size: u32 },

    #[error("No space left in log: {0}")]
    DeviceFull(String),

    #[error("Corrupt log: {0}")]
    CorruptLog(String),

    #[error("Volume is read-only")]
    ReadOnly,

    #[error("Journal busy: {0}")]
    Busy(String),

    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    #[error("Block cache error: {0}")]
    Cache(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Other error: {0}")]
    Other(String),
}

impl JournalError {
    /// Errors that mean the log content itself cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(self, JournalError::CorruptLog(_))
    }
}
