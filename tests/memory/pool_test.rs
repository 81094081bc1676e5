/*!
 * Memory Pool Tests
 * Block allocation, growth, reset and misuse detection
 */

use game_memory::core::limits::{FREE_BLOCK_TAG, GARBAGE_FILL_BYTE, INIT_FILLER_BYTE};
use game_memory::{MemoryConfig, MemoryError, MemoryPool, MemoryPoolFactory, PoolHandle};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::ptr::NonNull;

fn standalone(name: &'static str, size: usize, initial: usize, overflow: usize) -> PoolHandle {
    PoolHandle::new(MemoryPool::standalone(name, size, initial, overflow).unwrap())
}

fn assert_capacity(pool: &PoolHandle) {
    let p = pool.borrow();
    assert_eq!(
        p.total_block_count(),
        p.used_block_count() + p.free_block_count(),
        "capacity invariant broken for {}",
        p.name()
    );
}

#[test]
fn test_first_blob_is_created_eagerly() {
    let pool = standalone("eager", 32, 8, 4);
    let p = pool.borrow();
    assert_eq!(p.count_blobs_in_pool(), 1);
    assert_eq!(p.total_block_count(), 8);
    assert_eq!(p.used_block_count(), 0);
    assert_eq!(p.free_block_count(), 8);
}

#[test]
fn test_growth_trigger() {
    let pool = standalone("grow", 16, 2, 3);

    let a = pool.allocate_block("t").unwrap();
    let b = pool.allocate_block("t").unwrap();
    assert_eq!(pool.borrow().count_blobs_in_pool(), 1);

    let c = pool.allocate_block("t").unwrap();
    {
        let p = pool.borrow();
        assert_eq!(p.count_blobs_in_pool(), 2);
        assert_eq!(p.total_block_count(), 5);
        assert_eq!(p.used_block_count(), 3);
    }
    assert_capacity(&pool);

    for block in [a, b, c] {
        pool.free_block(Some(block)).unwrap();
    }
    assert_eq!(pool.borrow().used_block_count(), 0);
    assert_eq!(pool.borrow().total_block_count(), 5);
    assert_capacity(&pool);
}

#[test]
fn test_non_growable_pool_is_exhausted() {
    let pool = standalone("fixed", 16, 2, 0);
    pool.allocate_block("t").unwrap();
    pool.allocate_block("t").unwrap();

    let err = pool.allocate_block("t").unwrap_err();
    assert_eq!(err, MemoryError::PoolExhausted { pool: "fixed", total: 2 });
    assert_eq!(pool.borrow().count_blobs_in_pool(), 1);
}

#[test]
fn test_round_trip_reuses_block() {
    let pool = standalone("round_trip", 24, 4, 4);
    let block = pool.allocate_block("t").unwrap();
    pool.free_block(Some(block)).unwrap();
    let again = pool.allocate_block("t").unwrap();
    assert_eq!(block, again);
}

#[test]
fn test_blocks_are_distinct_and_sized() {
    let pool = standalone("distinct", 48, 16, 16);
    let size = pool.allocation_size();
    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    for _ in 0..40 {
        let block = pool.allocate_block("t").unwrap();
        assert!(seen.insert(block.as_ptr() as usize), "block handed out twice");
        assert_eq!(block.as_ptr() as usize % 8, 0);
        blocks.push(block);
    }

    let mut addrs: Vec<usize> = seen.into_iter().collect();
    addrs.sort_unstable();
    for pair in addrs.windows(2) {
        assert!(pair[1] - pair[0] >= size, "blocks overlap");
    }
    for block in blocks {
        pool.free_block(Some(block)).unwrap();
    }
}

#[test]
fn test_peak_is_monotonic() {
    let pool = standalone("peak", 16, 4, 4);
    let blocks: Vec<_> = (0..6).map(|_| pool.allocate_block("t").unwrap()).collect();
    assert_eq!(pool.borrow().peak_block_count(), 6);

    for block in blocks {
        pool.free_block(Some(block)).unwrap();
    }
    assert_eq!(pool.borrow().peak_block_count(), 6);

    pool.allocate_block("t").unwrap();
    assert_eq!(pool.borrow().peak_block_count(), 6);

    pool.reset().unwrap();
    assert_eq!(pool.borrow().peak_block_count(), 6);
}

#[test]
fn test_null_free_is_noop() {
    let pool = standalone("null", 16, 2, 2);
    pool.allocate_block("t").unwrap();
    assert!(pool.free_block(None).is_ok());
    assert_eq!(pool.borrow().used_block_count(), 1);
}

#[test]
fn test_double_free_is_detected() {
    let pool = standalone("double", 16, 2, 2);
    let block = pool.allocate_block("t").unwrap();
    pool.free_block(Some(block)).unwrap();

    let err = pool.free_block(Some(block)).unwrap_err();
    assert!(matches!(err, MemoryError::DoubleFree { owner: "double", .. }));
    assert_eq!(pool.borrow().used_block_count(), 0);
    assert!(pool.borrow().debug_memory_verify_pool().is_ok());
}

#[test]
fn test_foreign_block_is_rejected() {
    let a = standalone("owner_a", 16, 2, 2);
    let b = standalone("owner_b", 16, 2, 2);
    let block = a.allocate_block("t").unwrap();

    let err = b.free_block(Some(block)).unwrap_err();
    assert!(matches!(err, MemoryError::ForeignBlock { owner: "owner_b", .. }));

    let mut local = 0u64;
    let stack = NonNull::from(&mut local).cast::<u8>();
    assert!(matches!(a.free_block(Some(stack)), Err(MemoryError::ForeignBlock { .. })));
}

#[test]
fn test_misaligned_pointer_is_rejected() {
    let pool = standalone("misaligned", 32, 2, 2);
    let block = pool.allocate_block("t").unwrap();
    let inner = unsafe { NonNull::new_unchecked(block.as_ptr().add(8)) };
    assert!(matches!(pool.free_block(Some(inner)), Err(MemoryError::ForeignBlock { .. })));
    pool.free_block(Some(block)).unwrap();
}

#[test]
fn test_reset_keeps_identity_and_recreates_lazily() {
    let mut factory = MemoryPoolFactory::new();
    let pool = factory.create_memory_pool("reset_me", 32, 4, 2).unwrap();
    for _ in 0..6 {
        pool.allocate_block("t").unwrap();
    }

    pool.reset().unwrap();
    {
        let p = pool.borrow();
        assert_eq!(p.count_blobs_in_pool(), 0);
        assert_eq!(p.used_block_count(), 0);
        assert_eq!(p.total_block_count(), 0);
    }

    let found = factory.find_memory_pool("reset_me").unwrap();
    assert!(found.ptr_eq(&pool));

    pool.allocate_block("t").unwrap();
    assert_eq!(pool.borrow().total_block_count(), 4);
    assert!(factory.debug_memory_verify().is_ok());
}

#[test]
fn test_release_empties() {
    let pool = standalone("empties", 16, 2, 2);
    let blocks: Vec<_> = (0..4).map(|_| pool.allocate_block("t").unwrap()).collect();
    assert_eq!(pool.borrow().count_blobs_in_pool(), 2);

    pool.free_block(Some(blocks[2])).unwrap();
    pool.free_block(Some(blocks[3])).unwrap();

    let released = pool.release_empties();
    assert_eq!(released, 32);
    assert_eq!(pool.borrow().count_blobs_in_pool(), 1);
    assert_eq!(pool.borrow().total_block_count(), 2);
    assert_capacity(&pool);

    pool.free_block(Some(blocks[0])).unwrap();
    pool.free_block(Some(blocks[1])).unwrap();
    pool.release_empties();
    assert_eq!(pool.borrow().count_blobs_in_pool(), 0);

    // An empty pool starts over at its initial size
    pool.allocate_block("t").unwrap();
    assert_eq!(pool.borrow().total_block_count(), 2);
}

#[test]
fn test_block_tags() {
    let pool = standalone("tags", 16, 2, 2);
    let block = pool.allocate_block("W3D_Mesh").unwrap();
    assert_eq!(pool.borrow().debug_block_tag(block), "W3D_Mesh");
    assert!(pool.borrow().debug_is_block_in_pool(block));

    pool.free_block(Some(block)).unwrap();
    assert_eq!(pool.borrow().debug_block_tag(block), FREE_BLOCK_TAG);
}

#[test]
fn test_debug_fill_patterns() {
    let mut factory = MemoryPoolFactory::with_config(&MemoryConfig::debug());
    let pool = factory.create_memory_pool("filled", 32, 2, 2).unwrap();

    let block = pool.allocate_block_do_not_zero("t").unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 32) };
    assert!(bytes.iter().all(|&b| b == INIT_FILLER_BYTE));

    pool.free_block(Some(block)).unwrap();
    let link = std::mem::size_of::<usize>();
    let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr().add(link), 32 - link) };
    assert!(bytes.iter().all(|&b| b == GARBAGE_FILL_BYTE));

    let zeroed = pool.allocate_block("t").unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(zeroed.as_ptr(), 32) };
    assert!(bytes.iter().all(|&b| b == 0));
}

#[test]
fn test_leak_report_skips_ignored_blocks() {
    let pool = standalone("leaky", 16, 4, 4);
    let kept = pool.allocate_block("Kept").unwrap();
    let ignored = pool.allocate_block("Ignored").unwrap();
    let freed = pool.allocate_block("Freed").unwrap();
    pool.free_block(Some(freed)).unwrap();
    pool.borrow_mut().debug_ignore_leaks_for_block(ignored).unwrap();

    let mut out = Vec::new();
    let leaks = pool.borrow().debug_report_leaks("leaky", &mut out).unwrap();
    let text = String::from_utf8(out).unwrap();

    assert_eq!(leaks, 1);
    assert!(text.contains("tagstring Kept"));
    assert!(!text.contains("Ignored"));
    assert!(!text.contains("Freed"));
    let _ = kept;
}

#[test]
fn test_pool_info_row() {
    let pool = standalone("info", 16, 4, 2);
    pool.allocate_block("t").unwrap();

    let mut out = Vec::new();
    MemoryPool::write_info_header(&mut out).unwrap();
    pool.borrow().debug_pool_info_report(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    let lines: Vec<&str> = text.lines().collect();

    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("POOLNAME"));
    let fields: Vec<&str> = lines[1].split(',').map(str::trim).collect();
    assert_eq!(fields, vec!["POOLINFO", "info", "16", "4", "2", "1", "4", "1"]);
}

#[test]
fn test_stats_snapshot() {
    let pool = standalone("stats", 64, 4, 4);
    let block = pool.allocate_block("t").unwrap();
    let stats = pool.stats();
    assert_eq!(stats.name, "stats");
    assert_eq!(stats.used_bytes(), 64);
    assert_eq!(stats.physical_bytes(), 256);
    assert_eq!(stats.waste_bytes(), 192);
    pool.free_block(Some(block)).unwrap();
}

#[test]
fn test_random_free_order_keeps_counts() {
    use rand::rngs::StdRng;
    use rand::seq::SliceRandom;
    use rand::SeedableRng;

    let mut factory = MemoryPoolFactory::new();
    let pool = factory.create_memory_pool("shuffled", 40, 8, 8).unwrap();
    let mut rng = StdRng::seed_from_u64(0x5eed);

    let mut blocks: Vec<_> = (0..50).map(|_| pool.allocate_block("t").unwrap()).collect();
    blocks.shuffle(&mut rng);
    for block in blocks.drain(..25) {
        pool.free_block(Some(block)).unwrap();
        assert_capacity(&pool);
    }
    assert_eq!(pool.borrow().used_block_count(), 25);
    assert!(factory.debug_memory_verify().is_ok());

    // Freed blocks are reused before the pool grows again
    let total = pool.borrow().total_block_count();
    for _ in 0..25 {
        blocks.push(pool.allocate_block("t").unwrap());
    }
    assert_eq!(pool.borrow().total_block_count(), total);
}
