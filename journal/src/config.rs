// Journal configuration
// Tunables of the batching logic and the background flusher

use bfs_core::{JournalError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JournalConfig {
    /// Committed transactions batched before the log is written
    pub max_pending_transactions: usize,
    /// Blocks kept free below half the log when sizing transactions
    pub transaction_size_margin: u32,
    /// Smallest log area a journal accepts
    pub min_log_blocks: u32,
    /// Run the background flusher thread
    pub background_flush: bool,
    /// Period after which an idle batch is written, in milliseconds
    #[serde(with = "duration_ms")]
    pub flush_interval: Duration,
}

impl Default for JournalConfig {
    fn default() -> Self {
        Self {
            max_pending_transactions: 64,
            transaction_size_margin: 5,
            min_log_blocks: 12,
            background_flush: true,
            flush_interval: Duration::from_secs(5),
        }
    }
}

impl JournalConfig {
    /// Parses a possibly partial JSON document; missing fields keep their
    /// defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: JournalConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pending_transactions == 0 {
            return Err(JournalError::Configuration(
                "max_pending_transactions must be at least 1".to_string(),
            ));
        }
        if self.min_log_blocks < 12 {
            return Err(JournalError::Configuration(format!(
                "min_log_blocks of {} is below the supported minimum of 12",
                self.min_log_blocks
            )));
        }
        if self.flush_interval.is_zero() {
            return Err(JournalError::Configuration(
                "flush_interval must not be zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Largest transaction that is batched instead of written right away
    pub fn max_transaction_size(&self, log_size: u32) -> u32 {
        (log_size / 2).saturating_sub(self.transaction_size_margin)
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
