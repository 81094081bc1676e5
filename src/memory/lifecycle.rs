/*!
 * Memory Manager Lifecycle
 *
 * `MemoryManager` owns the factory and the main DMA. A process-wide manager
 * lives in thread-local storage for hosts that want one; since every handle
 * is `!Send`, "process-wide" means the thread that initialized it.
 *
 * Init happens either officially through `init_memory_manager` or early
 * through `pre_main_init_memory_manager` when something allocates before
 * the host is ready. An early init makes the later official init a no-op
 * and makes `shutdown_memory_manager` skip teardown.
 */

use super::config::MemoryConfig;
use super::dma::DmaHandle;
use super::factory::MemoryPoolFactory;
use super::types::{FactoryStats, MemoryError, MemoryResult, PoolInitRec};
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use tracing::{debug, info, instrument, warn};

/// Host customization points
///
/// Every method has a default, so hosts implement only what they need.
pub trait MemoryManagerHooks {
    /// Subpool ladder for the main DMA; empty selects the configured ladder
    fn dma_parms(&self) -> Vec<PoolInitRec> {
        Vec::new()
    }

    /// Create the host's pools right after the main DMA exists
    fn init_pools(&self, _factory: &mut MemoryPoolFactory) -> MemoryResult<()> {
        Ok(())
    }

    /// Counts for a pool requested with zero initial blocks
    ///
    /// Returning a zero initial count defers to the pool size table.
    fn adjust_pool_size(
        &self,
        _name: &str,
        initial_allocation_count: usize,
        overflow_allocation_count: usize,
    ) -> MemoryResult<(usize, usize)> {
        Ok((initial_allocation_count, overflow_allocation_count))
    }
}

/// Factory plus main DMA
pub struct MemoryManager {
    factory: MemoryPoolFactory,
    dma: DmaHandle,
}

impl MemoryManager {
    #[instrument(skip(config, hooks), fields(hooks = hooks.is_some()))]
    pub fn init(config: &MemoryConfig, hooks: Option<Rc<dyn MemoryManagerHooks>>) -> MemoryResult<Self> {
        let mut factory = MemoryPoolFactory::with_config(config);
        factory.set_hooks(hooks.clone());

        let mut parms = hooks.as_ref().map(|h| h.dma_parms()).unwrap_or_default();
        if parms.is_empty() {
            parms = config.dma_parms();
        }
        let dma = factory.create_dynamic_memory_allocator(&parms)?;

        if let Some(hooks) = &hooks {
            hooks.init_pools(&mut factory)?;
        }
        info!(
            pools = factory.pools().len(),
            checkpointing = config.checkpointing,
            "Memory manager initialized"
        );
        Ok(Self { factory, dma })
    }

    pub fn factory(&self) -> &MemoryPoolFactory {
        &self.factory
    }

    pub fn factory_mut(&mut self) -> &mut MemoryPoolFactory {
        &mut self.factory
    }

    pub fn dma(&self) -> &DmaHandle {
        &self.dma
    }

    /// Tear down, returning the final statistics
    ///
    /// A DMA that still has blocks out is left to be released when its
    /// last handle drops.
    #[instrument(skip(self))]
    pub fn shutdown(mut self) -> MemoryResult<FactoryStats> {
        let stats = self.factory.stats();
        match self.factory.destroy_dynamic_memory_allocator(&self.dma) {
            Ok(()) => {}
            Err(MemoryError::DmaInUse(used)) => {
                warn!(used, "Main DMA still has blocks in use at shutdown");
            }
            Err(e) => return Err(e),
        }
        info!(
            peak_used = stats.peak_used_bytes,
            peak_physical = stats.peak_physical_bytes,
            "Memory manager shut down"
        );
        Ok(stats)
    }
}

impl fmt::Debug for MemoryManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("factory", &self.factory)
            .field("dma", &self.dma)
            .finish()
    }
}

#[derive(Default)]
struct ManagerState {
    manager: Option<MemoryManager>,
    pre_main: bool,
    main_inited: bool,
}

thread_local! {
    static MANAGER: RefCell<ManagerState> = RefCell::new(ManagerState::default());
}

/// Bring the manager up early with the environment's configuration
///
/// Does nothing if a manager already exists.
pub fn pre_main_init_memory_manager() -> MemoryResult<()> {
    MANAGER.with(|state| {
        let mut state = state.borrow_mut();
        if state.manager.is_some() {
            return Ok(());
        }
        debug!("Initializing memory manager before main");
        let config = MemoryConfig::from_env().unwrap_or_else(|e| {
            warn!(error = %e, "Falling back to default memory config");
            MemoryConfig::default()
        });
        state.manager = Some(MemoryManager::init(&config, None)?);
        state.pre_main = true;
        Ok(())
    })
}

/// Official init with the default configuration and no hooks
pub fn init_memory_manager() -> MemoryResult<()> {
    init_memory_manager_with(&MemoryConfig::default(), None)
}

/// Official init
///
/// After an early init this only marks the manager official; otherwise a
/// second call fails with `AlreadyInitialized`.
pub fn init_memory_manager_with(
    config: &MemoryConfig,
    hooks: Option<Rc<dyn MemoryManagerHooks>>,
) -> MemoryResult<()> {
    MANAGER.with(|state| {
        let mut state = state.borrow_mut();
        if state.manager.is_none() {
            state.manager = Some(MemoryManager::init(config, hooks)?);
            state.pre_main = false;
        } else if state.pre_main {
            debug!("Memory manager was initialized before main, ignoring init");
        } else {
            return Err(MemoryError::AlreadyInitialized);
        }
        state.main_inited = true;
        Ok(())
    })
}

/// Tear down the process-wide manager
///
/// Skipped when the manager came up through the early path.
pub fn shutdown_memory_manager() -> MemoryResult<Option<FactoryStats>> {
    MANAGER.with(|state| {
        let mut state = state.borrow_mut();
        state.main_inited = false;
        if state.pre_main {
            info!("Memory manager was initialized before main, skipping shutdown");
            return Ok(None);
        }
        match state.manager.take() {
            Some(manager) => manager.shutdown().map(Some),
            None => Ok(None),
        }
    })
}

pub fn is_memory_manager_officially_inited() -> bool {
    MANAGER.with(|state| state.borrow().main_inited)
}

/// Run `f` against the process-wide manager
///
/// Calls must not nest.
pub fn with_memory_manager<R>(f: impl FnOnce(&mut MemoryManager) -> R) -> MemoryResult<R> {
    MANAGER.with(|state| {
        let mut state = state.borrow_mut();
        let manager = state.manager.as_mut().ok_or(MemoryError::NotInitialized)?;
        Ok(f(manager))
    })
}
