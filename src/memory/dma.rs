/*!
 * Dynamic Memory Allocator
 * Routes variable-size requests to the smallest fitting subpool
 *
 * Requests larger than every subpool become raw blocks: direct system
 * allocations tracked in a side table so they can be told apart from
 * pooled blocks on free.
 *
 * Subpools are ordinary factory pools and may be shared with direct pool
 * users or other DMAs. Every pooled block a DMA hands out is tagged with
 * that DMA's id, so it only accepts its own blocks back.
 */

use super::checkpoint::{CheckpointLog, Checkpointable, RecordId};
use super::factory::MemoryPoolFactory;
use super::pool::{BlockOwner, PoolHandle};
use super::tracking::Accounting;
use super::types::{DmaStats, MemoryError, MemoryResult, PoolInitRec};
use crate::core::limits::{
    DEFAULT_DMA_LADDER, DEFAULT_DMA_SUBPOOL_COUNT, DMA_LEAK_OWNER, FREE_BLOCK_TAG, INIT_FILLER_BYTE,
    MAX_DYNAMIC_MEMORY_ALLOCATOR_SUBPOOLS, RAW_BLOCK_ALIGNMENT,
};
use crate::core::types::{Address, Size, Tag};
use ahash::RandomState;
use std::alloc::{self, Layout};
use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, warn};

/// Owner label used in errors
const DMA_OWNER: &str = "DynamicMemoryAllocator";

static NEXT_DMA_ID: AtomicU32 = AtomicU32::new(1);

/// Default subpool ladder
pub fn default_dma_subpools() -> Vec<PoolInitRec> {
    DEFAULT_DMA_LADDER
        .iter()
        .map(|&(name, size)| PoolInitRec::new(name, size, DEFAULT_DMA_SUBPOOL_COUNT, DEFAULT_DMA_SUBPOOL_COUNT))
        .collect()
}

/// Oversized allocation served straight from the system allocator
#[derive(Debug)]
struct RawBlock {
    ptr: NonNull<u8>,
    layout: Layout,
    logical_size: Size,
    tag: Tag,
    record: Option<RecordId>,
    ignore_leaks: bool,
}

impl RawBlock {
    fn release(self) {
        // SAFETY: ptr was allocated with exactly this layout and is only
        // released once, since the block has been removed from the table.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

pub struct DynamicMemoryAllocator {
    id: u32,
    subpools: Vec<PoolHandle>,
    raw_blocks: HashMap<Address, RawBlock, RandomState>,
    used_blocks_in_dma: usize,
    raw_bytes: Size,
    peak_raw_bytes: Size,
    checkpoints: CheckpointLog,
    accounting: Rc<Accounting>,
}

impl DynamicMemoryAllocator {
    /// Build a DMA whose subpools are created (or found) by name in `factory`
    ///
    /// An empty `parms` slice selects the default ladder.
    pub fn new(factory: &mut MemoryPoolFactory, parms: &[PoolInitRec]) -> MemoryResult<Self> {
        let defaults;
        let parms = if parms.is_empty() {
            defaults = default_dma_subpools();
            &defaults[..]
        } else {
            parms
        };

        if parms.len() > MAX_DYNAMIC_MEMORY_ALLOCATOR_SUBPOOLS {
            return Err(MemoryError::TooManySubpools {
                requested: parms.len(),
                limit: MAX_DYNAMIC_MEMORY_ALLOCATOR_SUBPOOLS,
            });
        }

        let mut subpools: Vec<PoolHandle> = Vec::with_capacity(parms.len());
        for rec in parms {
            let pool = factory.create_memory_pool_from(rec)?;
            if let Some(prev) = subpools.last() {
                if pool.allocation_size() <= prev.allocation_size() {
                    return Err(MemoryError::SubpoolOrder(rec.pool_name));
                }
            }
            subpools.push(pool);
        }

        let accounting = factory.accounting();
        let max_records = accounting.settings().max_checkpoint_records;
        debug!(subpools = subpools.len(), "Created dynamic memory allocator");
        Ok(Self {
            id: NEXT_DMA_ID.fetch_add(1, Ordering::Relaxed),
            subpools,
            raw_blocks: HashMap::with_hasher(RandomState::new()),
            used_blocks_in_dma: 0,
            raw_bytes: 0,
            peak_raw_bytes: 0,
            checkpoints: CheckpointLog::new(max_records),
            accounting,
        })
    }

    /// First subpool whose block size is at least `alloc_size`
    pub fn find_pool_for_size(&self, alloc_size: Size) -> Option<PoolHandle> {
        self.subpools
            .iter()
            .find(|pool| pool.allocation_size() >= alloc_size)
            .cloned()
    }

    /// Allocate zeroed bytes
    pub fn allocate_bytes(&mut self, num_bytes: Size, tag: Tag) -> MemoryResult<NonNull<u8>> {
        self.allocate(num_bytes, tag, true)
    }

    /// Allocate bytes without clearing them
    pub fn allocate_bytes_do_not_zero(&mut self, num_bytes: Size, tag: Tag) -> MemoryResult<NonNull<u8>> {
        self.allocate(num_bytes, tag, false)
    }

    fn allocate(&mut self, num_bytes: Size, tag: Tag, zero: bool) -> MemoryResult<NonNull<u8>> {
        let block = match self.find_pool_for_size(num_bytes) {
            Some(pool) => pool.borrow_mut().allocate_for(self.owner(), tag, zero)?,
            None => self.allocate_raw(num_bytes, tag, zero)?,
        };
        self.used_blocks_in_dma += 1;
        Ok(block)
    }

    fn allocate_raw(&mut self, num_bytes: Size, tag: Tag, zero: bool) -> MemoryResult<NonNull<u8>> {
        let layout = Layout::from_size_align(num_bytes.max(1), RAW_BLOCK_ALIGNMENT).map_err(|_| {
            MemoryError::InvalidPoolSize {
                name: DMA_OWNER,
                allocation_size: num_bytes,
                initial: 1,
            }
        })?;

        // SAFETY: layout has non-zero size.
        let raw = unsafe {
            if zero {
                alloc::alloc_zeroed(layout)
            } else {
                alloc::alloc(layout)
            }
        };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => alloc::handle_alloc_error(layout),
        };

        let settings = self.accounting.settings();
        if !zero && settings.debug_fill {
            // SAFETY: freshly allocated, `layout.size()` bytes.
            unsafe { ptr::write_bytes(ptr.as_ptr(), INIT_FILLER_BYTE, layout.size()) };
        }

        let record = if settings.checkpointing {
            self.checkpoints
                .record_alloc(tag, self.accounting.current_checkpoint(), num_bytes)
        } else {
            None
        };

        self.accounting
            .adjust_totals(tag, num_bytes as i64, num_bytes as i64);
        self.raw_bytes += num_bytes;
        if self.raw_bytes > self.peak_raw_bytes {
            self.peak_raw_bytes = self.raw_bytes;
        }

        self.raw_blocks.insert(
            ptr.as_ptr() as Address,
            RawBlock {
                ptr,
                layout,
                logical_size: num_bytes,
                tag,
                record,
                ignore_leaks: false,
            },
        );
        debug!(bytes = num_bytes, tag, "Allocated raw block");
        Ok(ptr)
    }

    fn owner(&self) -> BlockOwner {
        BlockOwner::Dma(self.id)
    }

    /// Size that a request of `num_bytes` would actually receive
    pub fn get_actual_allocation_size(&self, num_bytes: Size) -> Size {
        self.find_pool_for_size(num_bytes)
            .map_or(num_bytes, |pool| pool.allocation_size())
    }

    /// Free bytes from this DMA; `None` is a no-op
    ///
    /// Pooled blocks this DMA did not hand out are refused as foreign, even
    /// when they live in one of its subpools.
    pub fn free_bytes(&mut self, block: Option<NonNull<u8>>) -> MemoryResult<()> {
        let Some(block) = block else {
            return Ok(());
        };
        let address = block.as_ptr() as Address;

        if let Some(raw) = self.raw_blocks.remove(&address) {
            self.release_raw(raw);
        } else if let Some(pool) = self.subpool_containing(address) {
            pool.borrow_mut().free_for(self.owner(), block)?;
        } else {
            warn!(address, "Block does not belong to dynamic memory allocator");
            return Err(MemoryError::ForeignBlock {
                address,
                owner: DMA_OWNER,
            });
        }

        self.used_blocks_in_dma -= 1;
        Ok(())
    }

    fn release_raw(&mut self, raw: RawBlock) {
        let size = raw.logical_size;
        self.accounting.adjust_totals(raw.tag, -(size as i64), -(size as i64));
        self.raw_bytes -= size;
        if let Some(record) = raw.record {
            self.checkpoints
                .record_free(record, self.accounting.current_checkpoint());
        }
        raw.release();
    }

    fn subpool_containing(&self, address: Address) -> Option<&PoolHandle> {
        self.subpools
            .iter()
            .find(|pool| pool.borrow().contains(address))
    }

    /// Reset every subpool and free every raw block
    ///
    /// Nothing is touched if any subpool refuses to reset.
    pub fn reset(&mut self) -> MemoryResult<()> {
        if let Some(pool) = self.subpools.iter().find(|p| p.borrow().pinned_block_count() > 0) {
            let pool = pool.borrow();
            return Err(MemoryError::PoolInUse {
                pool: pool.name(),
                used: pool.pinned_block_count(),
            });
        }
        for pool in &self.subpools {
            pool.reset()?;
        }
        let raws: Vec<RawBlock> = self.raw_blocks.drain().map(|(_, raw)| raw).collect();
        for raw in raws {
            self.release_raw(raw);
        }
        self.used_blocks_in_dma = 0;
        debug!("Dynamic memory allocator reset");
        Ok(())
    }

    pub fn subpools(&self) -> &[PoolHandle] {
        &self.subpools
    }

    pub fn used_block_count(&self) -> usize {
        self.used_blocks_in_dma
    }

    pub fn peak_raw_bytes(&self) -> Size {
        self.peak_raw_bytes
    }

    pub fn stats(&self) -> DmaStats {
        let (raw_bytes, raw_blocks) = self.debug_calc_raw_block_bytes();
        DmaStats {
            used_blocks: self.used_blocks_in_dma,
            subpools: self.subpools.iter().map(PoolHandle::name).collect(),
            raw_blocks,
            raw_bytes,
            peak_raw_bytes: self.peak_raw_bytes,
        }
    }

    pub fn debug_is_pool_in_dma(&self, pool: &PoolHandle) -> bool {
        self.subpools.iter().any(|p| p.ptr_eq(pool))
    }

    /// True if the block was handed out by this DMA (pooled or raw) and not yet freed
    pub fn debug_is_block_in_dma(&self, block: NonNull<u8>) -> bool {
        let address = block.as_ptr() as Address;
        let owner = self.owner();
        self.raw_blocks.contains_key(&address)
            || self
                .subpools
                .iter()
                .any(|pool| pool.borrow().block_owner(block) == Some(owner))
    }

    /// Total logical bytes and count of raw blocks
    pub fn debug_calc_raw_block_bytes(&self) -> (Size, usize) {
        let bytes = self.raw_blocks.values().map(|raw| raw.logical_size).sum();
        (bytes, self.raw_blocks.len())
    }

    pub fn debug_block_tag(&self, block: NonNull<u8>) -> Tag {
        let address = block.as_ptr() as Address;
        if let Some(raw) = self.raw_blocks.get(&address) {
            return raw.tag;
        }
        match self.subpool_containing(address) {
            Some(pool) => pool.borrow().debug_block_tag(block),
            None => FREE_BLOCK_TAG,
        }
    }

    /// Exclude a block (pooled or raw) from leak reports
    pub fn debug_ignore_leaks_for_block(&mut self, block: NonNull<u8>) -> MemoryResult<()> {
        let address = block.as_ptr() as Address;
        if let Some(raw) = self.raw_blocks.get_mut(&address) {
            raw.ignore_leaks = true;
            return Ok(());
        }
        match self.subpool_containing(address) {
            Some(pool) => pool.borrow_mut().debug_ignore_leaks_for_block(block),
            None => Err(MemoryError::ForeignBlock {
                address,
                owner: DMA_OWNER,
            }),
        }
    }

    /// Check the DMA's used count against its own subpool blocks and raw table
    pub fn debug_memory_verify_dma(&self) -> MemoryResult<()> {
        let owner = self.owner();
        let pooled: usize = self
            .subpools
            .iter()
            .map(|pool| pool.borrow().blocks_held_by(owner))
            .sum();
        let raw = self.raw_blocks.len();
        if self.used_blocks_in_dma != raw + pooled {
            return Err(MemoryError::CorruptionDetected(
                format!(
                    "dma used {} but holds {} raw and {} pooled blocks",
                    self.used_blocks_in_dma, raw, pooled
                )
                .into(),
            ));
        }
        let (bytes, _) = self.debug_calc_raw_block_bytes();
        if bytes != self.raw_bytes {
            return Err(MemoryError::CorruptionDetected(
                format!("dma raw bytes {} but table holds {}", self.raw_bytes, bytes).into(),
            ));
        }
        Ok(())
    }

    /// Raw block summary in `POOLINFO` form
    pub fn debug_dma_info_report(&self, out: &mut dyn Write) -> MemoryResult<()> {
        let (bytes, count) = self.debug_calc_raw_block_bytes();
        let average = if count == 0 { 0 } else { bytes / count };
        writeln!(out, "POOLINFO,Total Raw Blocks = {}", count)?;
        writeln!(out, "POOLINFO,Total Raw Block Bytes = {}", bytes)?;
        writeln!(out, "POOLINFO,Average Raw Block Size = {}", average)?;
        writeln!(out, "POOLINFO,Raw Blocks:")?;
        for raw in self.raw_blocks.values() {
            writeln!(out, "POOLINFO,  Blocksize={}", raw.logical_size)?;
        }
        Ok(())
    }

    /// Leak lines for raw blocks; pooled blocks are reported by their pools
    pub fn debug_report_leaks(&self, out: &mut dyn Write) -> MemoryResult<usize> {
        let mut leaks = 0;
        for raw in self.raw_blocks.values().filter(|raw| !raw.ignore_leaks) {
            writeln!(
                out,
                "Leaked a block of size {}, tagstring {}, from pool/dma {}",
                raw.logical_size, raw.tag, DMA_LEAK_OWNER
            )?;
            leaks += 1;
        }
        Ok(leaks)
    }

    /// Release raw blocks and detach subpools, returning the subpools
    pub(crate) fn take_subpools(&mut self) -> Vec<PoolHandle> {
        let raws: Vec<RawBlock> = self.raw_blocks.drain().map(|(_, raw)| raw).collect();
        for raw in raws {
            self.release_raw(raw);
        }
        self.used_blocks_in_dma = 0;
        std::mem::take(&mut self.subpools)
    }
}

impl Checkpointable for DynamicMemoryAllocator {
    fn checkpoint_log(&self) -> &CheckpointLog {
        &self.checkpoints
    }

    fn checkpoint_log_mut(&mut self) -> &mut CheckpointLog {
        &mut self.checkpoints
    }
}

impl Drop for DynamicMemoryAllocator {
    fn drop(&mut self) {
        for (_, raw) in self.raw_blocks.drain() {
            raw.release();
        }
    }
}

impl fmt::Debug for DynamicMemoryAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicMemoryAllocator")
            .field("id", &self.id)
            .field("subpools", &self.subpools.len())
            .field("used", &self.used_blocks_in_dma)
            .field("raw_blocks", &self.raw_blocks.len())
            .finish()
    }
}

/// Shared handle to a DMA
#[derive(Clone)]
pub struct DmaHandle(Rc<RefCell<DynamicMemoryAllocator>>);

impl DmaHandle {
    pub fn new(dma: DynamicMemoryAllocator) -> Self {
        Self(Rc::new(RefCell::new(dma)))
    }

    pub fn borrow(&self) -> Ref<'_, DynamicMemoryAllocator> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, DynamicMemoryAllocator> {
        self.0.borrow_mut()
    }

    pub fn ptr_eq(&self, other: &DmaHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn allocate_bytes(&self, num_bytes: Size, tag: Tag) -> MemoryResult<NonNull<u8>> {
        self.0.borrow_mut().allocate_bytes(num_bytes, tag)
    }

    pub fn allocate_bytes_do_not_zero(&self, num_bytes: Size, tag: Tag) -> MemoryResult<NonNull<u8>> {
        self.0.borrow_mut().allocate_bytes_do_not_zero(num_bytes, tag)
    }

    pub fn free_bytes(&self, block: Option<NonNull<u8>>) -> MemoryResult<()> {
        self.0.borrow_mut().free_bytes(block)
    }

    pub fn get_actual_allocation_size(&self, num_bytes: Size) -> Size {
        self.0.borrow().get_actual_allocation_size(num_bytes)
    }

    pub fn find_pool_for_size(&self, alloc_size: Size) -> Option<PoolHandle> {
        self.0.borrow().find_pool_for_size(alloc_size)
    }

    pub fn reset(&self) -> MemoryResult<()> {
        self.0.borrow_mut().reset()
    }

    pub fn stats(&self) -> DmaStats {
        self.0.borrow().stats()
    }
}

impl fmt::Debug for DmaHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(dma) => dma.fmt(f),
            Err(_) => f.write_str("DmaHandle(<borrowed>)"),
        }
    }
}
