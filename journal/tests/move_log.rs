// Log relocation tests

mod common;

use bfs_journal::{BlockAllocator, BlockRun, JournalError, MemoryAllocator, Transaction, Volume};
use common::*;

fn bitmap_bit(t: &TestVolume, block: u64) -> bool {
    let bitmap = t.volume.block(1);
    bitmap[(block / 8) as usize] & (1 << (block % 8)) != 0
}

#[test]
fn test_grow_log_in_place() {
    let t = setup(64);
    let allocator = MemoryAllocator::new(t.volume.as_ref()).unwrap();
    assert!(allocator.is_used(65));
    assert!(!allocator.is_used(66));

    t.journal.move_log(BlockRun::new(0, 2, 128), &allocator).unwrap();

    assert_eq!(t.journal.log_size(), 128);
    assert_eq!(t.journal.max_transaction_size(), 59);
    assert!(allocator.is_used(66));
    assert!(allocator.is_used(129));
    assert!(!allocator.is_used(130));

    // the allocation went through the journal and is home by now
    assert!(bitmap_bit(&t, 129));

    let stored = t.volume.stored_super_block().unwrap();
    assert_eq!(stored.log_blocks, BlockRun::new(0, 2, 128));
    assert_eq!((stored.log_start, stored.log_end), (0, 0));

    let blocks: Vec<u64> = (1000..1100).collect();
    write_transaction(&t.journal, &blocks, 0x12).unwrap();
    t.journal.flush_log_and_blocks().unwrap();
    assert_eq!(t.volume.block(1099), block(0x12));
}

#[test]
fn test_shrink_log_frees_tail() {
    let t = setup(64);
    let allocator = MemoryAllocator::new(t.volume.as_ref()).unwrap();

    t.journal.move_log(BlockRun::new(0, 2, 32), &allocator).unwrap();

    assert_eq!(t.journal.log_size(), 32);
    assert_eq!(t.journal.super_block().log_blocks, BlockRun::new(0, 2, 32));
    assert!(allocator.is_used(33));
    assert!(!allocator.is_used(34));
    assert!(!allocator.is_used(65));

    t.journal.flush_log_and_blocks().unwrap();
    assert!(!bitmap_bit(&t, 40));
    assert!(bitmap_bit(&t, 33));
}

#[test]
fn test_move_log_elsewhere() {
    let t = setup(64);
    let allocator = MemoryAllocator::new(t.volume.as_ref()).unwrap();

    t.journal.move_log(BlockRun::new(0, 200, 64), &allocator).unwrap();
    assert!(allocator.is_used(200));
    assert!(allocator.is_used(263));

    write_transaction(&t.journal, &[1000], 0x21).unwrap();
    t.volume.clear_writes();
    t.journal.flush_log().unwrap();

    let writes = t.volume.writes();
    assert_eq!(writes[0].first_block(&t.volume.geometry()), 200);
    assert_eq!(t.journal.dump().log_end, 2);

    // a crash now replays from the new location
    let r = open(crash_copy(&t.volume), config());
    r.journal.replay_log().unwrap();
    assert_eq!(r.volume.block(1000), block(0x21));
}

#[test]
fn test_move_to_same_log_is_noop() {
    let t = setup(64);
    let allocator = MemoryAllocator::new(t.volume.as_ref()).unwrap();
    t.journal.move_log(BlockRun::new(0, 2, 64), &allocator).unwrap();
    assert_eq!(t.journal.log_size(), 64);
    assert!(!allocator.is_used(66));
}

#[test]
fn test_invalid_log_locations() {
    let t = setup(64);
    let allocator = MemoryAllocator::new(t.volume.as_ref()).unwrap();

    for run in [
        BlockRun::new(1, 2, 64),
        BlockRun::new(0, 1, 64),
        BlockRun::new(0, 4090, 64),
        BlockRun::new(0, 2, 8),
    ] {
        assert!(
            matches!(t.journal.move_log(run, &allocator), Err(JournalError::BadValue(_))),
            "{} accepted",
            run
        );
    }
    assert_eq!(t.journal.super_block().log_blocks, BlockRun::new(0, 2, 64));
}

#[test]
fn test_occupied_blocks_stop_the_move() {
    let t = setup(64);
    let allocator = MemoryAllocator::new(t.volume.as_ref()).unwrap();

    let mut transaction = Transaction::begin(&t.journal, 0).unwrap();
    allocator.allocate_block_run(&mut transaction, BlockRun::new(0, 100, 1)).unwrap();
    transaction.done().unwrap();

    let result = t.journal.move_log(BlockRun::new(0, 2, 128), &allocator);
    assert!(matches!(result, Err(JournalError::BadValue(_))));
    assert_eq!(t.journal.log_size(), 64);
    assert!(!allocator.is_used(66));
    assert!(allocator.is_used(100));
}

#[test]
fn test_failed_super_block_write_rolls_back() {
    let t = setup(64);
    let allocator = MemoryAllocator::new(t.volume.as_ref()).unwrap();

    t.volume.fail_super_block_writes(true);
    let result = t.journal.move_log(BlockRun::new(0, 2, 128), &allocator);
    t.volume.fail_super_block_writes(false);

    assert!(matches!(result, Err(JournalError::Io(_))));
    assert_eq!(t.journal.log_size(), 64);
    assert_eq!(t.journal.super_block().log_blocks, BlockRun::new(0, 2, 64));
    assert!(!allocator.is_used(100));

    t.journal.flush_log_and_blocks().unwrap();
    assert_eq!(
        t.volume.stored_super_block().unwrap().log_blocks,
        BlockRun::new(0, 2, 64)
    );
    assert!(!bitmap_bit(&t, 100));
}

#[test]
fn test_aborted_allocation_is_rolled_back() {
    let t = setup(64);
    let allocator = MemoryAllocator::new(t.volume.as_ref()).unwrap();

    {
        let mut transaction = Transaction::begin(&t.journal, 0).unwrap();
        allocator.allocate_block_run(&mut transaction, BlockRun::new(0, 500, 10)).unwrap();
        assert!(allocator.is_used(505));
    }
    assert!(!allocator.is_used(505));

    let mut idle = Transaction::new();
    assert!(matches!(
        allocator.allocate_block_run(&mut idle, BlockRun::new(0, 500, 10)),
        Err(JournalError::NotInitialized(_))
    ));
    assert!(!allocator.is_used(500));
}

#[test]
fn test_concurrent_moves_run_one_after_the_other() {
    let t = setup(64);
    let allocator = MemoryAllocator::new(t.volume.as_ref()).unwrap();

    let (grown, shrunk) = std::thread::scope(|s| {
        let grow = s.spawn(|| t.journal.move_log(BlockRun::new(0, 2, 128), &allocator));
        let shrink = s.spawn(|| t.journal.move_log(BlockRun::new(0, 2, 32), &allocator));
        (grow.join().unwrap(), shrink.join().unwrap())
    });
    grown.unwrap();
    shrunk.unwrap();

    // whichever ran last decided the size, and the bitmap agrees with it
    let log_size = t.journal.log_size();
    assert!(log_size == 128 || log_size == 32);
    let log_end = 2 + log_size as u64;
    assert!((2..log_end).all(|block| allocator.is_used(block)));
    assert!(!allocator.is_used(log_end));

    t.journal.flush_log_and_blocks().unwrap();
    let stored = t.volume.stored_super_block().unwrap();
    assert_eq!(stored.log_blocks, BlockRun::new(0, 2, log_size as u16));
    assert!((2..log_end).all(|block| bitmap_bit(&t, block)));
}
