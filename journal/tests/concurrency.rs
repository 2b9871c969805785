// Concurrent transactions with the background flusher running

mod common;

use bfs_journal::{BlockCache, Journal, JournalConfig, OwnerId, Transaction};
use common::*;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn flusher_config() -> JournalConfig {
    JournalConfig {
        background_flush: true,
        flush_interval: Duration::from_millis(20),
        ..JournalConfig::default()
    }
}

fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

#[test]
fn test_threads_commit_concurrently() {
    let t = setup_with(format(512), flusher_config());
    const THREADS: u64 = 4;
    const ROUNDS: u64 = 25;

    let workers: Vec<_> = (0..THREADS)
        .map(|worker| {
            let journal: Arc<Journal> = t.journal.clone();
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    let first = 1000 + worker * 100 + round * 2;
                    write_transaction(&journal, &[first, first + 1], (worker * ROUNDS + round) as u8)
                        .unwrap();
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }

    t.journal.flush_log_and_blocks().unwrap();

    for worker in 0..THREADS {
        for round in 0..ROUNDS {
            let first = 1000 + worker * 100 + round * 2;
            let expected = block((worker * ROUNDS + round) as u8);
            assert_eq!(t.volume.block(first), expected);
            assert_eq!(t.volume.block(first + 1), expected);
        }
    }

    let dump = t.journal.dump();
    assert!(dump.entries.is_empty());
    assert_eq!(dump.pending_transactions, 0);
    assert!(dump.clean);
    assert_eq!(t.cache.open_transactions(), 0);
    assert_eq!(t.cache.pinned_blocks(), 0);
}

#[test]
fn test_threads_get_separate_transactions() {
    let t = setup(100);

    let outer = Transaction::begin(&t.journal, 0).unwrap();
    let journal = t.journal.clone();
    let other = thread::spawn(move || {
        let transaction = Transaction::begin(&journal, 0).unwrap();
        transaction.id()
    })
    .join()
    .unwrap();

    assert_ne!(outer.id(), other);
    assert_eq!(t.journal.current_transaction(OwnerId::current()), outer.id());
}

#[test]
fn test_explicit_owners_share_nothing() {
    let t = setup(100);

    let mut first = Transaction::with_owner(OwnerId::Task(1));
    let mut second = Transaction::with_owner(OwnerId::Task(2));
    first.start(&t.journal, 0).unwrap();
    second.start(&t.journal, 0).unwrap();
    assert_ne!(first.id(), second.id());

    first.write_blocks(1000, &block(1), 1).unwrap();
    second.write_blocks(1001, &block(2), 1).unwrap();
    drop(second);
    first.done().unwrap();

    t.journal.flush_log_and_blocks().unwrap();
    assert_eq!(t.volume.block(1000), block(1));
    assert_eq!(t.volume.block(1001), block(0));
}

#[test]
fn test_flusher_writes_idle_batch() {
    let t = setup_with(format(100), flusher_config());

    write_transaction(&t.journal, &[1000], 0x5a).unwrap();
    assert!(wait_for(|| {
        let dump = t.journal.dump();
        dump.pending_transactions == 0 && dump.entries.len() == 1
    }));

    // the log copy is written, the home copy waits for the cache
    assert_eq!(t.volume.block(1000), block(0));
    t.cache.sync().unwrap();
    assert!(wait_for(|| t.journal.dump().clean));
    assert_eq!(t.volume.block(1000), block(0x5a));
}

#[test]
fn test_flusher_reacts_to_idle_notification() {
    let config = JournalConfig {
        flush_interval: Duration::from_secs(60),
        ..flusher_config()
    };
    let t = setup_with(format(100), config);

    write_transaction(&t.journal, &[1000], 0x6b).unwrap();
    let open = Transaction::begin(&t.journal, 0).unwrap();
    t.cache.notify_idle();

    assert!(wait_for(|| t.journal.dump().pending_transactions == 0));
    drop(open);
}

#[test]
fn test_flusher_skips_locked_journal() {
    let config = JournalConfig {
        flush_interval: Duration::from_secs(60),
        ..flusher_config()
    };
    let t = setup_with(format(100), config);

    let guard = t.journal.flush_log_and_lock_journal().unwrap();
    // the log lock is reentrant, this thread can still commit
    write_transaction(&t.journal, &[1000], 0x3e).unwrap();
    t.cache.notify_idle();

    assert!(wait_for(|| t.journal.dump().skipped_flushes > 0));
    assert_eq!(t.journal.dump().pending_transactions, 1);

    // the skipped pass did not stay behind waiting for the lock
    drop(guard);
    thread::sleep(Duration::from_millis(50));
    assert_eq!(t.journal.dump().pending_transactions, 1);

    t.cache.notify_idle();
    assert!(wait_for(|| t.journal.dump().pending_transactions == 0));
    assert_eq!(t.journal.dump().entries.len(), 1);
}

#[test]
fn test_shutdown_stops_flusher() {
    let t = setup_with(format(100), flusher_config());
    t.journal.shutdown();
    t.journal.shutdown();

    write_transaction(&t.journal, &[1000], 0x7c).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(t.journal.dump().pending_transactions, 1);

    t.journal.flush_log_and_blocks().unwrap();
    assert_eq!(t.volume.block(1000), block(0x7c));
}
