/*!
 * Memory Pool
 * Fixed-size block allocator backed by a chain of blobs
 *
 * # Growth
 *
 * The first blob holds `initial_allocation_count` blocks and is created
 * eagerly. When every blob is full the pool adds a blob of
 * `overflow_allocation_count` blocks; a pool with an overflow count of zero
 * never grows. After `reset` the pool holds no blobs and recreates an
 * initial-sized blob on the next allocation.
 *
 * # Misuse
 *
 * Every free is checked against the blob table and the per-block slot
 * state, so foreign pointers and double frees are reported as errors
 * instead of corrupting the free list. Each allocated slot also records
 * its owner: blocks handed out by a DMA or held by an `Owned<T>` can only
 * be freed through that owner.
 */

pub(crate) mod blob;
pub(crate) mod free_list;

pub(crate) use self::blob::BlockOwner;

use self::blob::{Blob, Lookup};
use self::free_list::MIN_BLOCK_SIZE;
use super::checkpoint::{CheckpointLog, Checkpointable};
use super::tracking::Accounting;
use super::types::{MemoryError, MemoryResult, PoolStats};
use crate::core::limits::{FREE_BLOCK_TAG, GARBAGE_FILL_BYTE, INIT_FILLER_BYTE, MEM_BOUND_ALIGNMENT};
use crate::core::types::{round_up, Address, Size, Tag};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::io::Write;
use std::ptr::{self, NonNull};
use std::rc::Rc;
use tracing::{debug, warn};

/// Pool of equal-size blocks
pub struct MemoryPool {
    name: &'static str,
    allocation_size: Size,
    initial_allocation_count: usize,
    overflow_allocation_count: usize,
    used_blocks: usize,
    total_blocks: usize,
    peak_used_blocks: usize,
    blobs: Vec<Blob>,
    first_blob_with_free: Option<usize>,
    checkpoints: CheckpointLog,
    accounting: Rc<Accounting>,
    pinned_blocks: usize,
    destroyed: bool,
}

impl MemoryPool {
    /// Create a pool and its first blob
    ///
    /// `allocation_size` is rounded up to `MEM_BOUND_ALIGNMENT`.
    pub fn new(
        accounting: Rc<Accounting>,
        name: &'static str,
        allocation_size: Size,
        initial_allocation_count: usize,
        overflow_allocation_count: usize,
    ) -> MemoryResult<Self> {
        if allocation_size == 0 || initial_allocation_count == 0 {
            return Err(MemoryError::InvalidPoolSize {
                name,
                allocation_size,
                initial: initial_allocation_count,
            });
        }

        let allocation_size = round_up(allocation_size.max(MIN_BLOCK_SIZE), MEM_BOUND_ALIGNMENT);
        let max_records = accounting.settings().max_checkpoint_records;
        let mut pool = Self {
            name,
            allocation_size,
            initial_allocation_count,
            overflow_allocation_count,
            used_blocks: 0,
            total_blocks: 0,
            peak_used_blocks: 0,
            blobs: Vec::new(),
            first_blob_with_free: None,
            checkpoints: CheckpointLog::new(max_records),
            accounting,
            pinned_blocks: 0,
            destroyed: false,
        };
        pool.create_blob(initial_allocation_count);
        Ok(pool)
    }

    /// Create a pool with its own private accounting
    pub fn standalone(
        name: &'static str,
        allocation_size: Size,
        initial_allocation_count: usize,
        overflow_allocation_count: usize,
    ) -> MemoryResult<Self> {
        Self::new(
            Accounting::standalone(),
            name,
            allocation_size,
            initial_allocation_count,
            overflow_allocation_count,
        )
    }

    /// Allocate a zeroed block
    pub fn allocate_block(&mut self, tag: Tag) -> MemoryResult<NonNull<u8>> {
        self.allocate_for(BlockOwner::Pool, tag, true)
    }

    /// Allocate a block without clearing it
    pub fn allocate_block_do_not_zero(&mut self, tag: Tag) -> MemoryResult<NonNull<u8>> {
        self.allocate_for(BlockOwner::Pool, tag, false)
    }

    pub(crate) fn allocate_for(&mut self, owner: BlockOwner, tag: Tag, zero: bool) -> MemoryResult<NonNull<u8>> {
        if self.destroyed {
            return Err(MemoryError::PoolDestroyed(self.name));
        }

        let index = self.blob_with_free_blocks()?;
        let (block, slot_index) = self.blobs[index]
            .pop()
            .ok_or_else(|| MemoryError::CorruptionDetected("cursor blob has no free block".into()))?;
        self.first_blob_with_free = Some(index);

        self.used_blocks += 1;
        if self.used_blocks > self.peak_used_blocks {
            self.peak_used_blocks = self.used_blocks;
        }
        self.accounting.adjust_totals(tag, self.allocation_size as i64, 0);

        let settings = self.accounting.settings();
        let record = if settings.checkpointing {
            self.checkpoints
                .record_alloc(tag, self.accounting.current_checkpoint(), self.allocation_size)
        } else {
            None
        };

        let slot = self.blobs[index].slot_mut(slot_index);
        slot.tag = tag;
        slot.record = record;
        slot.ignore_leaks = false;
        slot.owner = owner;
        if owner == BlockOwner::Object {
            self.pinned_blocks += 1;
        }

        if zero {
            // SAFETY: the block is ours, `allocation_size` bytes long and not
            // yet visible to the caller.
            unsafe { ptr::write_bytes(block.as_ptr(), 0, self.allocation_size) };
        } else if settings.debug_fill {
            // SAFETY: as above.
            unsafe { ptr::write_bytes(block.as_ptr(), INIT_FILLER_BYTE, self.allocation_size) };
        }

        Ok(block)
    }

    /// Return a block to the pool; `None` is a no-op
    ///
    /// Blocks handed out by a DMA or held by a typed object are refused.
    pub fn free_block(&mut self, block: Option<NonNull<u8>>) -> MemoryResult<()> {
        match block {
            Some(block) => self.free_for(BlockOwner::Pool, block),
            None => Ok(()),
        }
    }

    pub(crate) fn free_for(&mut self, owner: BlockOwner, block: NonNull<u8>) -> MemoryResult<()> {
        let address = block.as_ptr() as Address;
        let (blob_index, slot_index) = self.locate(block)?;
        let slot = *self.blobs[blob_index].slot(slot_index);
        if !slot.allocated {
            warn!(pool = self.name, address, "Double free");
            return Err(MemoryError::DoubleFree {
                address,
                owner: self.name,
            });
        }
        if slot.owner != owner {
            warn!(pool = self.name, address, holder = slot.owner.label(), "Free by wrong owner");
            return Err(match owner {
                BlockOwner::Pool => MemoryError::BlockHeld {
                    address,
                    pool: self.name,
                    holder: slot.owner.label(),
                },
                _ => MemoryError::ForeignBlock {
                    address,
                    owner: owner.label(),
                },
            });
        }
        if owner == BlockOwner::Object {
            self.pinned_blocks -= 1;
        }

        if self.accounting.settings().debug_fill {
            // SAFETY: the block is allocated in this pool, so we may scribble
            // over it before it goes back on the free list.
            unsafe { ptr::write_bytes(block.as_ptr(), GARBAGE_FILL_BYTE, self.allocation_size) };
        }

        self.blobs[blob_index].push(slot_index);
        self.used_blocks -= 1;
        self.accounting.adjust_totals(slot.tag, -(self.allocation_size as i64), 0);

        if let Some(record) = slot.record {
            self.checkpoints
                .record_free(record, self.accounting.current_checkpoint());
        }
        if self.first_blob_with_free.is_none() {
            self.first_blob_with_free = Some(blob_index);
        }
        Ok(())
    }

    /// Release every blob; the pool stays usable
    ///
    /// Refused while typed objects still live in the pool, since their
    /// owners hold safe references into the blobs.
    pub fn reset(&mut self) -> MemoryResult<()> {
        if self.pinned_blocks > 0 {
            warn!(pool = self.name, pinned = self.pinned_blocks, "Reset refused, typed objects alive");
            return Err(MemoryError::PoolInUse {
                pool: self.name,
                used: self.pinned_blocks,
            });
        }
        self.release_all_blobs();
        debug!(pool = self.name, "Pool reset");
        Ok(())
    }

    fn release_all_blobs(&mut self) {
        let size = self.allocation_size as i64;
        for blob in self.blobs.drain(..) {
            for slot in blob.allocated_slots() {
                self.accounting.adjust_totals(slot.tag, -size, 0);
            }
            self.accounting
                .adjust_totals("", 0, -(blob.byte_size() as i64));
        }
        self.used_blocks = 0;
        self.total_blocks = 0;
        self.first_blob_with_free = None;
    }

    /// Free every blob with no blocks in use, returning the bytes released
    pub fn release_empties(&mut self) -> usize {
        let mut released_blocks = 0;
        let mut released_bytes = 0;
        self.blobs.retain(|blob| {
            if blob.used_block_count() == 0 {
                released_blocks += blob.total_block_count();
                released_bytes += blob.byte_size();
                false
            } else {
                true
            }
        });

        if released_bytes > 0 {
            self.total_blocks -= released_blocks;
            self.accounting
                .adjust_totals("", 0, -(released_bytes as i64));
            debug!(pool = self.name, bytes = released_bytes, "Released empty blobs");
        }
        self.first_blob_with_free = self.blobs.iter().position(Blob::has_free_blocks);
        released_bytes
    }

    /// Index of a blob that can serve an allocation, growing if needed
    fn blob_with_free_blocks(&mut self) -> MemoryResult<usize> {
        if let Some(index) = self.first_blob_with_free {
            if self.blobs[index].has_free_blocks() {
                return Ok(index);
            }
        }
        if let Some(index) = self.blobs.iter().position(Blob::has_free_blocks) {
            return Ok(index);
        }

        let count = if self.blobs.is_empty() {
            self.initial_allocation_count
        } else if self.overflow_allocation_count == 0 {
            warn!(pool = self.name, total = self.total_blocks, "Pool exhausted and may not grow");
            return Err(MemoryError::PoolExhausted {
                pool: self.name,
                total: self.total_blocks,
            });
        } else {
            self.overflow_allocation_count
        };
        Ok(self.create_blob(count))
    }

    fn create_blob(&mut self, count: usize) -> usize {
        let blob = Blob::new(self.allocation_size, count);
        self.accounting.adjust_totals("", 0, blob.byte_size() as i64);
        self.total_blocks += count;
        self.blobs.push(blob);
        debug!(
            pool = self.name,
            blocks = count,
            blobs = self.blobs.len(),
            "Created blob"
        );
        let index = self.blobs.len() - 1;
        self.first_blob_with_free = Some(index);
        index
    }

    /// Find the blob and slot for a block start in this pool
    fn locate(&self, block: NonNull<u8>) -> MemoryResult<(usize, usize)> {
        let address = block.as_ptr() as Address;
        for (blob_index, blob) in self.blobs.iter().enumerate() {
            match blob.lookup(address) {
                Lookup::Outside => continue,
                Lookup::Block(slot_index) => return Ok((blob_index, slot_index)),
                Lookup::Misaligned => break,
            }
        }
        warn!(pool = self.name, address, "Block does not belong to pool");
        Err(MemoryError::ForeignBlock {
            address,
            owner: self.name,
        })
    }

    /// True if the address falls anywhere inside this pool's blobs
    pub(crate) fn contains(&self, address: Address) -> bool {
        self.blobs
            .iter()
            .any(|blob| blob.lookup(address) != Lookup::Outside)
    }

    /// Release all storage and refuse further allocations
    ///
    /// Callers check the pool has no blocks in use first.
    pub(crate) fn mark_destroyed(&mut self) {
        self.release_all_blobs();
        self.checkpoints.reset();
        self.destroyed = true;
        debug!(pool = self.name, "Pool destroyed");
    }

    /// Hand an allocated pool-user block to a typed handle
    pub(crate) fn pin(&mut self, block: NonNull<u8>) -> MemoryResult<()> {
        self.transfer(block, BlockOwner::Pool, BlockOwner::Object)?;
        self.pinned_blocks += 1;
        Ok(())
    }

    /// Give a typed handle's block back to plain pool ownership
    pub(crate) fn unpin(&mut self, block: NonNull<u8>) -> MemoryResult<()> {
        self.transfer(block, BlockOwner::Object, BlockOwner::Pool)?;
        self.pinned_blocks -= 1;
        Ok(())
    }

    fn transfer(&mut self, block: NonNull<u8>, from: BlockOwner, to: BlockOwner) -> MemoryResult<()> {
        let address = block.as_ptr() as Address;
        let (blob_index, slot_index) = self.locate(block)?;
        let slot = self.blobs[blob_index].slot_mut(slot_index);
        if !slot.allocated {
            return Err(MemoryError::DoubleFree {
                address,
                owner: self.name,
            });
        }
        if slot.owner != from {
            return Err(MemoryError::BlockHeld {
                address,
                pool: self.name,
                holder: slot.owner.label(),
            });
        }
        slot.owner = to;
        Ok(())
    }

    /// Allocated blocks currently held by `owner`
    pub(crate) fn blocks_held_by(&self, owner: BlockOwner) -> usize {
        self.blobs
            .iter()
            .flat_map(|blob| blob.allocated_slots())
            .filter(|slot| slot.owner == owner)
            .count()
    }

    /// Owner of an allocated block start, `None` if free or foreign
    pub(crate) fn block_owner(&self, block: NonNull<u8>) -> Option<BlockOwner> {
        let address = block.as_ptr() as Address;
        self.blobs.iter().find_map(|blob| match blob.lookup(address) {
            Lookup::Block(index) if blob.slot(index).allocated => Some(blob.slot(index).owner),
            _ => None,
        })
    }

    /// Blocks currently owned by typed handles
    pub fn pinned_block_count(&self) -> usize {
        self.pinned_blocks
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn allocation_size(&self) -> Size {
        self.allocation_size
    }

    pub fn initial_block_count(&self) -> usize {
        self.initial_allocation_count
    }

    pub fn overflow_block_count(&self) -> usize {
        self.overflow_allocation_count
    }

    pub fn used_block_count(&self) -> usize {
        self.used_blocks
    }

    pub fn total_block_count(&self) -> usize {
        self.total_blocks
    }

    pub fn peak_block_count(&self) -> usize {
        self.peak_used_blocks
    }

    /// Blocks sitting on free lists, summed over every blob
    pub fn free_block_count(&self) -> usize {
        self.blobs.iter().map(Blob::free_block_count).sum()
    }

    pub fn count_blobs_in_pool(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            name: self.name,
            allocation_size: self.allocation_size,
            initial_blocks: self.initial_allocation_count,
            overflow_blocks: self.overflow_allocation_count,
            used_blocks: self.used_blocks,
            total_blocks: self.total_blocks,
            peak_blocks: self.peak_used_blocks,
            blobs: self.blobs.len(),
        }
    }

    /// True if `block` is the start of a block (free or not) in this pool
    pub fn debug_is_block_in_pool(&self, block: NonNull<u8>) -> bool {
        let address = block.as_ptr() as Address;
        self.blobs
            .iter()
            .any(|blob| matches!(blob.lookup(address), Lookup::Block(_)))
    }

    /// Tag of an allocated block, or `FREE_BLOCK_TAG`
    pub fn debug_block_tag(&self, block: NonNull<u8>) -> Tag {
        let address = block.as_ptr() as Address;
        for blob in &self.blobs {
            if let Lookup::Block(index) = blob.lookup(address) {
                return blob.slot(index).tag;
            }
        }
        FREE_BLOCK_TAG
    }

    /// Exclude an allocated block from leak reports
    pub fn debug_ignore_leaks_for_block(&mut self, block: NonNull<u8>) -> MemoryResult<()> {
        let (blob_index, slot_index) = self.locate(block)?;
        self.blobs[blob_index].slot_mut(slot_index).ignore_leaks = true;
        Ok(())
    }

    /// Check blob bookkeeping against the pool counters
    pub fn debug_memory_verify_pool(&self) -> MemoryResult<()> {
        let mut used = 0;
        let mut total = 0;
        for (index, blob) in self.blobs.iter().enumerate() {
            blob.verify().map_err(|msg| {
                MemoryError::CorruptionDetected(format!("pool {} blob {}: {}", self.name, index, msg).into())
            })?;
            used += blob.used_block_count();
            total += blob.total_block_count();
        }
        if used != self.used_blocks || total != self.total_blocks {
            return Err(MemoryError::CorruptionDetected(
                format!(
                    "pool {}: blobs hold {}/{} blocks, counters say {}/{}",
                    self.name, used, total, self.used_blocks, self.total_blocks
                )
                .into(),
            ));
        }
        Ok(())
    }

    /// Write one line per allocated block not marked ignore-leaks
    pub fn debug_report_leaks(&self, owner: &str, out: &mut dyn Write) -> MemoryResult<usize> {
        let mut leaks = 0;
        for blob in &self.blobs {
            for slot in blob.allocated_slots().filter(|slot| !slot.ignore_leaks) {
                writeln!(
                    out,
                    "Leaked a block of size {}, tagstring {}, from pool/dma {}",
                    self.allocation_size, slot.tag, owner
                )?;
                leaks += 1;
            }
        }
        Ok(leaks)
    }

    /// `POOLINFO` column header
    pub fn write_info_header(out: &mut dyn Write) -> MemoryResult<()> {
        writeln!(
            out,
            "POOLINFO,{:>32},{:>6},{:>6},{:>6},{:>6},{:>6},{:>6}",
            "POOLNAME", "BLKSZ", "INIT", "OVRFL", "USED", "TOTAL", "PEAK"
        )?;
        Ok(())
    }

    /// `POOLINFO` row for this pool
    pub fn debug_pool_info_report(&self, out: &mut dyn Write) -> MemoryResult<()> {
        writeln!(
            out,
            "POOLINFO,{:>32},{:>6},{:>6},{:>6},{:>6},{:>6},{:>6}",
            self.name,
            self.allocation_size,
            self.initial_allocation_count,
            self.overflow_allocation_count,
            self.used_blocks,
            self.total_blocks,
            self.peak_used_blocks
        )?;
        Ok(())
    }
}

impl Checkpointable for MemoryPool {
    fn checkpoint_log(&self) -> &CheckpointLog {
        &self.checkpoints
    }

    fn checkpoint_log_mut(&mut self) -> &mut CheckpointLog {
        &mut self.checkpoints
    }
}

impl fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryPool")
            .field("name", &self.name)
            .field("allocation_size", &self.allocation_size)
            .field("used", &self.used_blocks)
            .field("total", &self.total_blocks)
            .field("peak", &self.peak_used_blocks)
            .field("blobs", &self.blobs.len())
            .finish()
    }
}

/// Shared handle to a pool
///
/// All clones refer to the same pool. Handles are `!Send`.
#[derive(Clone)]
pub struct PoolHandle(Rc<RefCell<MemoryPool>>);

impl PoolHandle {
    pub fn new(pool: MemoryPool) -> Self {
        Self(Rc::new(RefCell::new(pool)))
    }

    pub fn borrow(&self) -> Ref<'_, MemoryPool> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> RefMut<'_, MemoryPool> {
        self.0.borrow_mut()
    }

    /// True if both handles refer to the same pool
    pub fn ptr_eq(&self, other: &PoolHandle) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn name(&self) -> &'static str {
        self.0.borrow().name()
    }

    pub fn allocation_size(&self) -> Size {
        self.0.borrow().allocation_size()
    }

    pub fn allocate_block(&self, tag: Tag) -> MemoryResult<NonNull<u8>> {
        self.0.borrow_mut().allocate_block(tag)
    }

    pub fn allocate_block_do_not_zero(&self, tag: Tag) -> MemoryResult<NonNull<u8>> {
        self.0.borrow_mut().allocate_block_do_not_zero(tag)
    }

    pub fn free_block(&self, block: Option<NonNull<u8>>) -> MemoryResult<()> {
        self.0.borrow_mut().free_block(block)
    }

    pub fn reset(&self) -> MemoryResult<()> {
        self.0.borrow_mut().reset()
    }

    pub fn release_empties(&self) -> usize {
        self.0.borrow_mut().release_empties()
    }

    pub fn stats(&self) -> PoolStats {
        self.0.borrow().stats()
    }
}

impl fmt::Debug for PoolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(pool) => pool.fmt(f),
            Err(_) => f.write_str("PoolHandle(<borrowed>)"),
        }
    }
}
