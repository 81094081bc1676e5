/*!
 * Memory Manager Lifecycle Tests
 * Init paths, hooks and the thread-local manager
 */

use game_memory::core::limits::CONFIG_PATH_ENV;
use game_memory::{
    init_memory_manager, init_memory_manager_with, is_memory_manager_officially_inited,
    pre_main_init_memory_manager, shutdown_memory_manager, with_memory_manager, MemoryConfig, MemoryError,
    MemoryManager, MemoryManagerHooks, MemoryPoolFactory, MemoryResult, PoolInitRec,
};
use mockall::mock;
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::rc::Rc;

mock! {
    pub Hooks {}

    impl MemoryManagerHooks for Hooks {
        fn dma_parms(&self) -> Vec<PoolInitRec>;
        fn init_pools(&self, factory: &mut MemoryPoolFactory) -> MemoryResult<()>;
        fn adjust_pool_size(&self, name: &str, initial: usize, overflow: usize) -> MemoryResult<(usize, usize)>;
    }
}

/// Hooks that keep every default
struct DefaultHooks;

impl MemoryManagerHooks for DefaultHooks {}

#[test]
fn test_manager_owns_default_dma() {
    let manager = MemoryManager::init(&MemoryConfig::default(), None).unwrap();
    assert_eq!(manager.dma().borrow().subpools().len(), 7);
    assert_eq!(manager.factory().pools().len(), 7);

    let stats = manager.shutdown().unwrap();
    assert_eq!(stats.dmas.len(), 1);
}

#[test]
fn test_default_hooks_change_nothing() {
    let hooks: Rc<dyn MemoryManagerHooks> = Rc::new(DefaultHooks);
    let mut manager = MemoryManager::init(&MemoryConfig::default(), Some(hooks)).unwrap();
    assert_eq!(manager.factory().pools().len(), 7);
    assert!(matches!(
        manager.factory_mut().create_memory_pool("Nowhere", 16, 0, 0),
        Err(MemoryError::PoolSizeUnknown(_))
    ));
}

#[test]
fn test_hooks_drive_init() {
    let mut hooks = MockHooks::new();
    hooks
        .expect_dma_parms()
        .times(1)
        .returning(|| vec![PoolInitRec::new("small", 32, 8, 8), PoolInitRec::new("large", 256, 4, 4)]);
    hooks.expect_init_pools().times(1).returning(|factory| {
        factory.create_memory_pool("HostPool", 48, 0, 0)?;
        Ok(())
    });
    hooks
        .expect_adjust_pool_size()
        .withf(|name, initial, _| name == "HostPool" && *initial == 0)
        .times(1)
        .returning(|_, _, _| Ok((12, 6)));

    let hooks: Rc<dyn MemoryManagerHooks> = Rc::new(hooks);
    let manager = MemoryManager::init(&MemoryConfig::default(), Some(hooks)).unwrap();

    let sizes: Vec<usize> = manager
        .dma()
        .borrow()
        .subpools()
        .iter()
        .map(|pool| pool.allocation_size())
        .collect();
    assert_eq!(sizes, vec![32, 256]);

    let host = manager.factory().find_memory_pool("HostPool").unwrap();
    assert_eq!(host.borrow().initial_block_count(), 12);
    assert_eq!(host.borrow().overflow_block_count(), 6);
}

#[test]
fn test_hook_deferring_to_size_table() {
    let mut hooks = MockHooks::new();
    hooks.expect_dma_parms().returning(Vec::new);
    hooks.expect_init_pools().returning(|_| Ok(()));
    hooks
        .expect_adjust_pool_size()
        .returning(|_, initial, overflow| Ok((initial, overflow)));

    let config = MemoryConfig {
        pool_sizes: vec![game_memory::PoolSizeEntry::new("Tabled", 20, 8)],
        ..MemoryConfig::default()
    };
    let hooks: Rc<dyn MemoryManagerHooks> = Rc::new(hooks);
    let mut manager = MemoryManager::init(&config, Some(hooks)).unwrap();

    let pool = manager.factory_mut().create_memory_pool("Tabled", 16, 0, 0).unwrap();
    assert_eq!(pool.borrow().initial_block_count(), 20);
}

#[test]
fn test_failing_init_pools_fails_init() {
    let mut hooks = MockHooks::new();
    hooks.expect_dma_parms().returning(Vec::new);
    hooks
        .expect_init_pools()
        .returning(|_| Err(MemoryError::PoolNotFound("Missing")));

    let hooks: Rc<dyn MemoryManagerHooks> = Rc::new(hooks);
    let err = MemoryManager::init(&MemoryConfig::default(), Some(hooks)).unwrap_err();
    assert_eq!(err, MemoryError::PoolNotFound("Missing"));
}

#[test]
fn test_shutdown_with_blocks_out() {
    let manager = MemoryManager::init(&MemoryConfig::default(), None).unwrap();
    let block = manager.dma().allocate_bytes(64, "t").unwrap();

    let stats = manager.shutdown().unwrap();
    assert_eq!(stats.used_bytes, 64);
    let _ = block;
}

#[test]
#[serial]
fn test_official_init_and_shutdown() {
    assert!(!is_memory_manager_officially_inited());
    assert_eq!(with_memory_manager(|_| ()).unwrap_err(), MemoryError::NotInitialized);

    init_memory_manager().unwrap();
    assert!(is_memory_manager_officially_inited());
    assert_eq!(init_memory_manager().unwrap_err(), MemoryError::AlreadyInitialized);

    let used = with_memory_manager(|m| {
        let dma = m.dma().clone();
        let block = dma.allocate_bytes(100, "t").unwrap();
        let used = m.factory().stats().used_bytes;
        dma.free_bytes(Some(block)).unwrap();
        used
    })
    .unwrap();
    assert_eq!(used, 128);

    let stats = shutdown_memory_manager().unwrap().unwrap();
    assert_eq!(stats.peak_used_bytes, 128);
    assert!(!is_memory_manager_officially_inited());
    assert_eq!(with_memory_manager(|_| ()).unwrap_err(), MemoryError::NotInitialized);

    // A fresh init is allowed after shutdown
    init_memory_manager().unwrap();
    shutdown_memory_manager().unwrap();
}

#[test]
#[serial]
fn test_pre_main_init() {
    std::env::remove_var(CONFIG_PATH_ENV);
    pre_main_init_memory_manager().unwrap();
    assert!(!is_memory_manager_officially_inited());
    // Idempotent
    pre_main_init_memory_manager().unwrap();

    // Official init after an early one only marks the manager official
    init_memory_manager_with(&MemoryConfig::release(), None).unwrap();
    assert!(is_memory_manager_officially_inited());
    let checkpointing = with_memory_manager(|m| m.factory().settings().checkpointing).unwrap();
    assert!(checkpointing);

    // Teardown is skipped and the manager stays usable
    assert!(shutdown_memory_manager().unwrap().is_none());
    assert!(with_memory_manager(|m| m.factory().pools().len()).is_ok());
}

#[test]
#[serial]
fn test_pre_main_falls_back_on_bad_config() {
    std::env::set_var(CONFIG_PATH_ENV, "/nonexistent/mempool.json");
    let result = pre_main_init_memory_manager();
    std::env::remove_var(CONFIG_PATH_ENV);

    result.unwrap();
    assert!(with_memory_manager(|m| m.dma().borrow().subpools().len()).unwrap() == 7);
}
