/*!
 * Dynamic Memory Allocator Tests
 * Size routing, raw blocks and subpool configuration
 */

use game_memory::core::limits::{DMA_LEAK_OWNER, MAX_DYNAMIC_MEMORY_ALLOCATOR_SUBPOOLS};
use game_memory::{MemoryError, MemoryPoolFactory, PoolInitRec};
use pretty_assertions::assert_eq;

#[test]
fn test_default_ladder() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory.create_dynamic_memory_allocator(&[]).unwrap();
    let sizes: Vec<usize> = dma
        .borrow()
        .subpools()
        .iter()
        .map(|pool| pool.allocation_size())
        .collect();
    assert_eq!(sizes, vec![16, 32, 64, 128, 256, 512, 1024]);

    // Subpools are ordinary named pools of the factory
    assert!(factory.find_memory_pool("dmaPool_256").is_some());
}

#[test]
fn test_size_routing() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory.create_dynamic_memory_allocator(&[]).unwrap();

    for (request, expected) in [(1, 16), (16, 16), (17, 32), (100, 128), (1000, 1024), (1024, 1024)] {
        let pool = dma.find_pool_for_size(request).unwrap();
        assert_eq!(pool.allocation_size(), expected, "request of {} bytes", request);
        assert_eq!(dma.get_actual_allocation_size(request), expected);

        let block = dma.allocate_bytes(request, "route").unwrap();
        assert!(pool.borrow().debug_is_block_in_pool(block));
        dma.free_bytes(Some(block)).unwrap();
    }

    assert!(dma.find_pool_for_size(1025).is_none());
    assert_eq!(dma.get_actual_allocation_size(5000), 5000);
}

#[test]
fn test_three_pool_ladder_routing() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory
        .create_dynamic_memory_allocator(&[
            PoolInitRec::new("s16", 16, 4, 4),
            PoolInitRec::new("s64", 64, 4, 4),
            PoolInitRec::new("s256", 256, 4, 4),
        ])
        .unwrap();
    let used = || -> Vec<usize> {
        dma.borrow()
            .subpools()
            .iter()
            .map(|pool| pool.borrow().used_block_count())
            .collect()
    };

    let small = dma.allocate_bytes(10, "t").unwrap();
    assert_eq!(dma.get_actual_allocation_size(10), 16);
    assert_eq!(used(), vec![1, 0, 0]);

    let middle = dma.allocate_bytes(65, "t").unwrap();
    assert_eq!(dma.get_actual_allocation_size(65), 256);
    assert_eq!(used(), vec![1, 0, 1]);
    dma.free_bytes(Some(small)).unwrap();
    dma.free_bytes(Some(middle)).unwrap();

    let raw = dma.allocate_bytes(300, "t").unwrap();
    assert_eq!(dma.get_actual_allocation_size(300), 300);
    assert!(dma.find_pool_for_size(300).is_none());
    assert_eq!(used(), vec![0, 0, 0]);
    assert_eq!(dma.borrow().debug_calc_raw_block_bytes(), (300, 1));
    assert_eq!(dma.borrow().used_block_count(), 1);

    dma.free_bytes(Some(raw)).unwrap();
    assert_eq!(dma.borrow().used_block_count(), 0);
}

#[test]
fn test_raw_blocks() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory.create_dynamic_memory_allocator(&[]).unwrap();
    let before = factory.stats();

    let block = dma.allocate_bytes(4000, "W3D_Texture").unwrap();
    let bytes = unsafe { std::slice::from_raw_parts(block.as_ptr(), 4000) };
    assert!(bytes.iter().all(|&b| b == 0));

    let after = factory.stats();
    assert_eq!(after.used_bytes - before.used_bytes, 4000);
    assert_eq!(after.physical_bytes - before.physical_bytes, 4000);
    assert_eq!(dma.borrow().debug_calc_raw_block_bytes(), (4000, 1));
    assert_eq!(dma.borrow().used_block_count(), 1);
    assert!(dma.borrow().debug_is_block_in_dma(block));
    assert_eq!(factory.debug_get_block_tag_string(Some(block)), "W3D_Texture");
    assert!(factory.debug_memory_verify().is_ok());

    dma.free_bytes(Some(block)).unwrap();
    assert_eq!(dma.borrow().debug_calc_raw_block_bytes(), (0, 0));
    assert_eq!(dma.borrow().peak_raw_bytes(), 4000);
    assert_eq!(factory.stats().used_bytes, before.used_bytes);
}

#[test]
fn test_used_count_covers_both_paths() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory.create_dynamic_memory_allocator(&[]).unwrap();

    let small = dma.allocate_bytes(8, "t").unwrap();
    let large = dma.allocate_bytes_do_not_zero(2048, "t").unwrap();
    assert_eq!(dma.borrow().used_block_count(), 2);

    dma.free_bytes(Some(small)).unwrap();
    dma.free_bytes(Some(large)).unwrap();
    dma.free_bytes(None).unwrap();
    assert_eq!(dma.borrow().used_block_count(), 0);
}

#[test]
fn test_foreign_free_is_rejected() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory.create_dynamic_memory_allocator(&[]).unwrap();
    let other = factory.create_memory_pool("not_a_subpool", 16, 4, 4).unwrap();
    let block = other.allocate_block("t").unwrap();

    let err = dma.free_bytes(Some(block)).unwrap_err();
    assert!(matches!(err, MemoryError::ForeignBlock { .. }));
    assert_eq!(other.borrow().used_block_count(), 1);
}

#[test]
fn test_direct_subpool_block_is_foreign() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory.create_dynamic_memory_allocator(&[]).unwrap();
    let shared = factory.create_memory_pool("dmaPool_16", 16, 4, 4).unwrap();
    assert!(dma.borrow().debug_is_pool_in_dma(&shared));

    let direct = shared.allocate_block("direct").unwrap();
    assert!(!dma.borrow().debug_is_block_in_dma(direct));
    let err = dma.free_bytes(Some(direct)).unwrap_err();
    assert!(matches!(err, MemoryError::ForeignBlock { .. }));
    assert_eq!(dma.borrow().used_block_count(), 0);
    assert_eq!(shared.borrow().used_block_count(), 1);
    assert!(factory.debug_memory_verify().is_ok());

    // The pool refuses the DMA's blocks just the same
    let routed = dma.allocate_bytes(8, "routed").unwrap();
    assert!(shared.borrow().debug_is_block_in_pool(routed));
    assert!(matches!(
        shared.free_block(Some(routed)),
        Err(MemoryError::BlockHeld { .. })
    ));
    assert_eq!(dma.borrow().used_block_count(), 1);

    dma.free_bytes(Some(routed)).unwrap();
    shared.free_block(Some(direct)).unwrap();
    assert!(factory.debug_memory_verify().is_ok());
    factory.destroy_dynamic_memory_allocator(&dma).unwrap();
}

#[test]
fn test_blocks_of_another_dma_are_foreign() {
    let mut factory = MemoryPoolFactory::new();
    let first = factory.create_dynamic_memory_allocator(&[]).unwrap();
    let second = factory.create_dynamic_memory_allocator(&[]).unwrap();

    let block = first.allocate_bytes(40, "t").unwrap();
    assert!(matches!(
        second.free_bytes(Some(block)),
        Err(MemoryError::ForeignBlock { .. })
    ));
    assert_eq!(second.borrow().used_block_count(), 0);
    assert!(factory.debug_memory_verify().is_ok());

    first.free_bytes(Some(block)).unwrap();
    assert_eq!(first.borrow().used_block_count(), 0);
}

#[test]
fn test_too_many_subpools() {
    let mut factory = MemoryPoolFactory::new();
    let names = ["s0", "s1", "s2", "s3", "s4", "s5", "s6", "s7", "s8"];
    let parms: Vec<PoolInitRec> = names
        .iter()
        .enumerate()
        .map(|(i, name)| PoolInitRec::new(*name, 16 << i, 4, 4))
        .collect();
    assert_eq!(parms.len(), MAX_DYNAMIC_MEMORY_ALLOCATOR_SUBPOOLS + 1);

    let err = factory.create_dynamic_memory_allocator(&parms).unwrap_err();
    assert_eq!(err, MemoryError::TooManySubpools { requested: 9, limit: 8 });
    assert!(factory.dmas().is_empty());
}

#[test]
fn test_subpool_sizes_must_increase() {
    let mut factory = MemoryPoolFactory::new();
    let parms = [PoolInitRec::new("big", 64, 4, 4), PoolInitRec::new("small", 32, 4, 4)];
    let err = factory.create_dynamic_memory_allocator(&parms).unwrap_err();
    assert_eq!(err, MemoryError::SubpoolOrder("small"));
}

#[test]
fn test_custom_ladder() {
    let mut factory = MemoryPoolFactory::new();
    let parms = [PoolInitRec::new("tiny", 8, 8, 8), PoolInitRec::new("huge", 4096, 2, 2)];
    let dma = factory.create_dynamic_memory_allocator(&parms).unwrap();

    assert_eq!(dma.get_actual_allocation_size(9), 4096);
    let block = dma.allocate_bytes(4096, "t").unwrap();
    assert_eq!(dma.borrow().debug_calc_raw_block_bytes(), (0, 0));
    dma.free_bytes(Some(block)).unwrap();
}

#[test]
fn test_reset_frees_everything() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory.create_dynamic_memory_allocator(&[]).unwrap();
    dma.allocate_bytes(20, "t").unwrap();
    dma.allocate_bytes(3000, "t").unwrap();

    dma.reset().unwrap();
    assert_eq!(dma.borrow().used_block_count(), 0);
    assert_eq!(dma.borrow().debug_calc_raw_block_bytes(), (0, 0));
    assert_eq!(dma.borrow().subpools().len(), 7);
    assert!(factory.debug_memory_verify().is_ok());

    // Still usable afterwards
    let block = dma.allocate_bytes(20, "t").unwrap();
    dma.free_bytes(Some(block)).unwrap();
}

#[test]
fn test_pool_membership() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory.create_dynamic_memory_allocator(&[]).unwrap();
    let sub = factory.find_memory_pool("dmaPool_64").unwrap();
    let other = factory.create_memory_pool("standalone", 64, 4, 4).unwrap();

    assert!(dma.borrow().debug_is_pool_in_dma(&sub));
    assert!(!dma.borrow().debug_is_pool_in_dma(&other));
}

#[test]
fn test_leak_and_info_reports() {
    let mut factory = MemoryPoolFactory::new();
    let dma = factory.create_dynamic_memory_allocator(&[]).unwrap();
    let raw = dma.allocate_bytes(2000, "BigThing").unwrap();
    let ignored = dma.allocate_bytes(3000, "Ignored").unwrap();
    dma.borrow_mut().debug_ignore_leaks_for_block(ignored).unwrap();

    let mut out = Vec::new();
    let leaks = dma.borrow().debug_report_leaks(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert_eq!(leaks, 1);
    assert!(text.contains("tagstring BigThing"));
    assert!(text.contains(DMA_LEAK_OWNER));

    let mut out = Vec::new();
    dma.borrow().debug_dma_info_report(&mut out).unwrap();
    let text = String::from_utf8(out).unwrap();
    assert!(text.contains("Total Raw Blocks = 2"));
    assert!(text.contains("Total Raw Block Bytes = 5000"));
    assert!(text.contains("Average Raw Block Size = 2500"));

    dma.free_bytes(Some(raw)).unwrap();
    dma.free_bytes(Some(ignored)).unwrap();
}
