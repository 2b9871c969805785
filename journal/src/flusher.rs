// Background log flusher
// Writes idle batches to the log without blocking foreground commits

use crate::journal::Journal;
use bfs_core::{JournalError, Result};
use log::{debug, trace};
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FlusherSignal {
    Wake,
    Stop,
}

pub(crate) struct Flusher {
    handle: Option<JoinHandle<()>>,
    signals: Sender<FlusherSignal>,
}

impl Flusher {
    pub(crate) fn spawn(
        journal: Weak<Journal>,
        signals: Sender<FlusherSignal>,
        receiver: Receiver<FlusherSignal>,
        interval: Duration,
    ) -> Result<Self> {
        let handle = thread::Builder::new()
            .name("bfs log flusher".to_string())
            .spawn(move || run(journal, receiver, interval))
            .map_err(|e| JournalError::Other(format!("could not start log flusher: {}", e)))?;

        Ok(Self {
            handle: Some(handle),
            signals,
        })
    }

    pub(crate) fn thread_id(&self) -> Option<ThreadId> {
        self.handle.as_ref().map(|handle| handle.thread().id())
    }

    /// Stops the worker; joins it unless called from the worker itself
    pub(crate) fn stop(&mut self) {
        let _ = self.signals.send(FlusherSignal::Stop);

        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == thread::current().id() {
                // the worker is tearing down the journal, it exits on its own
                return;
            }
            if handle.join().is_err() {
                log::error!("log flusher panicked");
            }
        }
    }
}

impl Drop for Flusher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(journal: Weak<Journal>, receiver: Receiver<FlusherSignal>, interval: Duration) {
    debug!("log flusher started");

    loop {
        let woken = match receiver.recv_timeout(interval) {
            Ok(FlusherSignal::Wake) => true,
            Err(RecvTimeoutError::Timeout) => false,
            Ok(FlusherSignal::Stop) | Err(RecvTimeoutError::Disconnected) => break,
        };

        // coalesce a burst of wake ups into one pass
        let mut stop = false;
        while let Ok(signal) = receiver.try_recv() {
            if signal == FlusherSignal::Stop {
                stop = true;
            }
        }
        if stop {
            break;
        }

        let Some(journal) = journal.upgrade() else {
            break;
        };
        trace!("log flusher pass (woken: {})", woken);
        journal.background_flush(woken, interval);
    }

    debug!("log flusher stopped");
}
