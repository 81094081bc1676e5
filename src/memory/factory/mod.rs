/*!
 * Memory Pool Factory
 * Named registry of pools and dynamic memory allocators
 *
 * The factory owns the accounting context shared by every pool it creates,
 * so factory-wide byte totals and the checkpoint clock stay current without
 * the hot path ever touching the registry.
 */

mod report;

pub use report::ReportSummary;

use super::checkpoint::Checkpointable;
use super::config::{MemoryConfig, PoolSizeTable};
use super::dma::{DmaHandle, DynamicMemoryAllocator};
use super::lifecycle::MemoryManagerHooks;
use super::pool::{MemoryPool, PoolHandle};
use super::tracking::{Accounting, TrackingSettings, UsageLedger};
use super::types::{FactoryStats, MemoryError, MemoryResult, PoolInitRec};
use crate::core::limits::FREE_BLOCK_TAG;
use crate::core::types::{Checkpoint, Size, Tag};
use ahash::RandomState;
use std::any::TypeId;
use std::collections::HashMap;
use std::fmt;
use std::ptr::NonNull;
use std::rc::Rc;
use tracing::{debug, error, info, instrument, warn};

pub struct MemoryPoolFactory {
    pools: Vec<PoolHandle>,
    dmas: Vec<DmaHandle>,
    accounting: Rc<Accounting>,
    size_table: PoolSizeTable,
    hooks: Option<Rc<dyn MemoryManagerHooks>>,
    typed_pools: HashMap<TypeId, PoolHandle, RandomState>,
}

impl MemoryPoolFactory {
    pub fn new() -> Self {
        Self::with_config(&MemoryConfig::default())
    }

    pub fn with_config(config: &MemoryConfig) -> Self {
        let accounting = Accounting::new(
            config.tracking_settings(),
            UsageLedger::new(&config.special_prefixes),
        );
        Self {
            pools: Vec::new(),
            dmas: Vec::new(),
            accounting,
            size_table: config.pool_size_table(),
            hooks: None,
            typed_pools: HashMap::with_hasher(RandomState::new()),
        }
    }

    /// Create a pool, or return the existing pool with that name
    ///
    /// An `initial_allocation_count` of zero asks `adjust_pool_size` for
    /// both counts.
    #[instrument(skip(self), fields(pools = self.pools.len()))]
    pub fn create_memory_pool(
        &mut self,
        name: &'static str,
        allocation_size: Size,
        initial_allocation_count: usize,
        overflow_allocation_count: usize,
    ) -> MemoryResult<PoolHandle> {
        if let Some(existing) = self.find_memory_pool(name) {
            if existing.allocation_size() < allocation_size {
                debug!(
                    pool = name,
                    existing = existing.allocation_size(),
                    requested = allocation_size,
                    "Pool exists with a smaller block size; keeping the first definition"
                );
            }
            return Ok(existing);
        }

        let (initial, overflow) =
            self.adjust_pool_size(name, initial_allocation_count, overflow_allocation_count)?;
        let pool = MemoryPool::new(Rc::clone(&self.accounting), name, allocation_size, initial, overflow)
            .inspect_err(|e| error!(pool = name, error = %e, "Pool creation failed"))?;

        let handle = PoolHandle::new(pool);
        debug!(
            pool = name,
            size = handle.allocation_size(),
            initial,
            overflow,
            "Created memory pool"
        );
        self.pools.push(handle.clone());
        Ok(handle)
    }

    pub fn create_memory_pool_from(&mut self, rec: &PoolInitRec) -> MemoryResult<PoolHandle> {
        self.create_memory_pool(
            rec.pool_name,
            rec.allocation_size,
            rec.initial_allocation_count,
            rec.overflow_allocation_count,
        )
    }

    /// Resolve block counts for a pool created with zero initial blocks
    ///
    /// Non-zero counts pass through untouched. Hooks get the first say;
    /// the pool size table answers whatever they leave at zero.
    pub fn adjust_pool_size(
        &self,
        name: &str,
        initial_allocation_count: usize,
        overflow_allocation_count: usize,
    ) -> MemoryResult<(usize, usize)> {
        if initial_allocation_count > 0 {
            return Ok((initial_allocation_count, overflow_allocation_count));
        }

        let (initial, overflow) = match &self.hooks {
            Some(hooks) => {
                hooks.adjust_pool_size(name, initial_allocation_count, overflow_allocation_count)?
            }
            None => (initial_allocation_count, overflow_allocation_count),
        };
        if initial > 0 {
            return Ok((initial, overflow));
        }

        self.size_table.lookup(name).ok_or_else(|| {
            error!(pool = name, "No pool size entry");
            MemoryError::PoolSizeUnknown(name.into())
        })
    }

    pub fn find_memory_pool(&self, name: &str) -> Option<PoolHandle> {
        self.pools.iter().find(|pool| pool.name() == name).cloned()
    }

    /// Create a DMA; an empty slice selects the default subpool ladder
    #[instrument(skip(self, parms), fields(subpools = parms.len()))]
    pub fn create_dynamic_memory_allocator(&mut self, parms: &[PoolInitRec]) -> MemoryResult<DmaHandle> {
        let dma = DynamicMemoryAllocator::new(self, parms)
            .inspect_err(|e| error!(error = %e, "Dynamic memory allocator creation failed"))?;
        let handle = DmaHandle::new(dma);
        self.dmas.push(handle.clone());
        Ok(handle)
    }

    /// Unlink and release a pool with no blocks in use
    #[instrument(skip(self, pool), fields(pool = pool.name()))]
    pub fn destroy_memory_pool(&mut self, pool: &PoolHandle) -> MemoryResult<()> {
        let name = pool.name();
        if self.dmas.iter().any(|dma| dma.borrow().debug_is_pool_in_dma(pool)) {
            warn!(pool = name, "Refusing to destroy a DMA subpool");
            return Err(MemoryError::PoolOwnedByDma(name));
        }
        self.release_pool(pool)
    }

    fn release_pool(&mut self, pool: &PoolHandle) -> MemoryResult<()> {
        let name = pool.name();
        let used = pool.borrow().used_block_count();
        if used > 0 {
            warn!(pool = name, used, "Refusing to destroy a pool in use");
            return Err(MemoryError::PoolInUse { pool: name, used });
        }
        let index = self
            .pools
            .iter()
            .position(|p| p.ptr_eq(pool))
            .ok_or(MemoryError::PoolNotFound(name))?;

        self.pools.remove(index);
        self.typed_pools.retain(|_, p| !p.ptr_eq(pool));
        pool.borrow_mut().mark_destroyed();
        Ok(())
    }

    /// Unlink a DMA with no blocks in use and destroy its subpools
    ///
    /// Subpools still shared with another DMA, or still holding blocks
    /// allocated directly, are kept.
    #[instrument(skip(self, dma))]
    pub fn destroy_dynamic_memory_allocator(&mut self, dma: &DmaHandle) -> MemoryResult<()> {
        let used = dma.borrow().used_block_count();
        if used > 0 {
            warn!(used, "Refusing to destroy a DMA in use");
            return Err(MemoryError::DmaInUse(used));
        }
        let index = self
            .dmas
            .iter()
            .position(|d| d.ptr_eq(dma))
            .ok_or(MemoryError::PoolNotFound("DynamicMemoryAllocator"))?;
        self.dmas.remove(index);

        let subpools = dma.borrow_mut().take_subpools();
        for pool in &subpools {
            let shared = self.dmas.iter().any(|d| d.borrow().debug_is_pool_in_dma(pool));
            if shared || pool.borrow().used_block_count() > 0 {
                debug!(pool = pool.name(), shared, "Keeping subpool of destroyed DMA");
                continue;
            }
            self.release_pool(pool)?;
        }
        debug!(subpools = subpools.len(), "Destroyed dynamic memory allocator");
        Ok(())
    }

    /// Free every block in every pool and DMA, keeping the topology
    ///
    /// Checkpoint history is dropped and the ledger zeroed. Refused before
    /// anything changes if a typed object is still alive anywhere.
    #[instrument(skip(self), fields(pools = self.pools.len(), dmas = self.dmas.len()))]
    pub fn reset(&mut self) -> MemoryResult<()> {
        if let Some(pool) = self.pools.iter().find(|p| p.borrow().pinned_block_count() > 0) {
            let pool = pool.borrow();
            warn!(pool = pool.name(), "Factory reset refused, typed objects alive");
            return Err(MemoryError::PoolInUse {
                pool: pool.name(),
                used: pool.pinned_block_count(),
            });
        }

        self.debug_reset_checkpoints();
        for pool in &self.pools {
            pool.reset()?;
        }
        for dma in &self.dmas {
            dma.reset()?;
        }
        self.accounting.reset_ledger();
        info!("Memory pool factory reset");
        Ok(())
    }

    /// True if the block was handed out by any pool or DMA of this factory
    pub fn debug_is_block_in_any_pool(&self, block: NonNull<u8>) -> bool {
        self.pools
            .iter()
            .any(|pool| pool.borrow().debug_is_block_in_pool(block))
            || self.dmas.iter().any(|dma| dma.borrow().debug_is_block_in_dma(block))
    }

    /// Tag of an allocated block; free, foreign and null blocks give `FREE_BLOCK_TAG`
    pub fn debug_get_block_tag_string(&self, block: Option<NonNull<u8>>) -> Tag {
        let Some(block) = block else {
            return FREE_BLOCK_TAG;
        };
        for pool in &self.pools {
            let pool = pool.borrow();
            if pool.debug_is_block_in_pool(block) {
                return pool.debug_block_tag(block);
            }
        }
        for dma in &self.dmas {
            let dma = dma.borrow();
            if dma.debug_is_block_in_dma(block) {
                return dma.debug_block_tag(block);
            }
        }
        FREE_BLOCK_TAG
    }

    /// Verify every pool and DMA, then check the ledger against their sums
    pub fn debug_memory_verify(&self) -> MemoryResult<()> {
        let mut used: i64 = 0;
        let mut physical: i64 = 0;
        for pool in &self.pools {
            let pool = pool.borrow();
            pool.debug_memory_verify_pool()?;
            used += (pool.used_block_count() * pool.allocation_size()) as i64;
            physical += (pool.total_block_count() * pool.allocation_size()) as i64;
        }
        for dma in &self.dmas {
            let dma = dma.borrow();
            dma.debug_memory_verify_dma()?;
            let (raw_bytes, _) = dma.debug_calc_raw_block_bytes();
            used += raw_bytes as i64;
            physical += raw_bytes as i64;
        }

        let ledger = self.accounting.ledger();
        if ledger.used_bytes() != used || ledger.physical_bytes() != physical {
            return Err(MemoryError::CorruptionDetected(
                format!(
                    "ledger holds {}/{} bytes, pools hold {}/{}",
                    ledger.used_bytes(),
                    ledger.physical_bytes(),
                    used,
                    physical
                )
                .into(),
            ));
        }
        Ok(())
    }

    /// Advance the checkpoint clock
    pub fn debug_set_checkpoint(&self) -> Checkpoint {
        let checkpoint = self.accounting.advance_checkpoint();
        debug!(checkpoint, "Set checkpoint");
        checkpoint
    }

    /// Drop every checkpoint record; the clock keeps counting
    pub fn debug_reset_checkpoints(&self) {
        for pool in &self.pools {
            pool.borrow_mut().debug_reset_checkpoints();
        }
        for dma in &self.dmas {
            dma.borrow_mut().debug_reset_checkpoints();
        }
    }

    pub fn cur_checkpoint(&self) -> Checkpoint {
        self.accounting.current_checkpoint()
    }

    pub fn stats(&self) -> FactoryStats {
        let ledger = self.accounting.ledger();
        FactoryStats {
            used_bytes: ledger.used_bytes(),
            physical_bytes: ledger.physical_bytes(),
            peak_used_bytes: ledger.peak_used_bytes(),
            peak_physical_bytes: ledger.peak_physical_bytes(),
            current_checkpoint: self.accounting.current_checkpoint(),
            pools: self.pools.iter().map(PoolHandle::stats).collect(),
            dmas: self.dmas.iter().map(DmaHandle::stats).collect(),
            buckets: ledger.buckets(),
        }
    }

    pub fn pools(&self) -> &[PoolHandle] {
        &self.pools
    }

    pub fn dmas(&self) -> &[DmaHandle] {
        &self.dmas
    }

    pub fn settings(&self) -> TrackingSettings {
        self.accounting.settings()
    }

    pub fn set_settings(&self, settings: TrackingSettings) {
        self.accounting.set_settings(settings);
    }

    pub fn pool_size_table(&self) -> &PoolSizeTable {
        &self.size_table
    }

    pub fn set_pool_size_table(&mut self, table: PoolSizeTable) {
        self.size_table = table;
    }

    pub fn pool_size_table_mut(&mut self) -> &mut PoolSizeTable {
        &mut self.size_table
    }

    pub fn set_hooks(&mut self, hooks: Option<Rc<dyn MemoryManagerHooks>>) {
        self.hooks = hooks;
    }

    pub(crate) fn accounting(&self) -> Rc<Accounting> {
        Rc::clone(&self.accounting)
    }

    pub(crate) fn typed_pool(&self, type_id: TypeId) -> Option<PoolHandle> {
        self.typed_pools.get(&type_id).cloned()
    }

    pub(crate) fn register_typed_pool(&mut self, type_id: TypeId, pool: PoolHandle) {
        self.typed_pools.insert(type_id, pool);
    }
}

impl Default for MemoryPoolFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for MemoryPoolFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPoolFactory")
            .field("pools", &self.pools.len())
            .field("dmas", &self.dmas.len())
            .field("checkpoint", &self.accounting.current_checkpoint())
            .field("hooks", &self.hooks.is_some())
            .finish()
    }
}
