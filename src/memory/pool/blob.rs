/*!
 * Memory Pool Blob
 * One system allocation carved into equal-size blocks
 */

use super::free_list::FreeList;
use crate::core::limits::BLOB_ALIGNMENT;
use crate::core::types::{Address, Tag};
use crate::memory::checkpoint::RecordId;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

/// Who may free an allocated block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockOwner {
    /// Direct pool user
    Pool,
    /// The dynamic memory allocator with this id
    Dma(u32),
    /// A live `Owned<T>`
    Object,
}

impl BlockOwner {
    pub fn label(self) -> &'static str {
        match self {
            BlockOwner::Pool => "pool user",
            BlockOwner::Dma(_) => "DynamicMemoryAllocator",
            BlockOwner::Object => "typed object",
        }
    }
}

/// Side metadata for one block
///
/// Kept outside the block so allocated blocks stay fully opaque.
#[derive(Debug, Clone, Copy)]
pub(crate) struct BlockSlot {
    pub allocated: bool,
    pub ignore_leaks: bool,
    pub owner: BlockOwner,
    pub tag: Tag,
    pub record: Option<RecordId>,
}

impl BlockSlot {
    const FREE: Self = Self {
        allocated: false,
        ignore_leaks: false,
        owner: BlockOwner::Pool,
        tag: crate::core::limits::FREE_BLOCK_TAG,
        record: None,
    };
}

/// Where an address falls inside a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup {
    /// Not inside this blob at all
    Outside,
    /// Inside the blob but not at a block boundary
    Misaligned,
    /// Start of the block at this index
    Block(usize),
}

#[derive(Debug)]
pub(crate) struct Blob {
    base: NonNull<u8>,
    layout: Layout,
    block_size: usize,
    used: usize,
    free: FreeList,
    slots: Box<[BlockSlot]>,
}

impl Blob {
    /// Allocate storage for `count` blocks and thread them all onto the free list
    ///
    /// `block_size` must be a non-zero multiple of the pointer size. Running
    /// out of system memory is fatal.
    pub fn new(block_size: usize, count: usize) -> Self {
        debug_assert!(block_size >= super::free_list::MIN_BLOCK_SIZE);
        debug_assert!(count > 0);

        let bytes = block_size
            .checked_mul(count)
            .unwrap_or_else(|| capacity_overflow(block_size, count));
        let layout = Layout::from_size_align(bytes, BLOB_ALIGNMENT)
            .unwrap_or_else(|_| capacity_overflow(block_size, count));

        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc(layout) };
        let base = match NonNull::new(raw) {
            Some(base) => base,
            None => alloc::handle_alloc_error(layout),
        };

        let mut free = FreeList::new();
        // Push in reverse so blocks come out in address order.
        for index in (0..count).rev() {
            // SAFETY: the block lies inside our fresh allocation, is aligned
            // to the pointer size and nobody else can see it yet.
            unsafe { free.push_free(block_at(base, block_size, index)) };
        }

        Self {
            base,
            layout,
            block_size,
            used: 0,
            free,
            slots: vec![BlockSlot::FREE; count].into_boxed_slice(),
        }
    }

    /// Take a free block, returning it and its slot index
    pub fn pop(&mut self) -> Option<(NonNull<u8>, usize)> {
        let block = self.free.pop_free()?;
        let index = self.index_of(block.as_ptr() as Address);
        self.used += 1;
        self.slots[index].allocated = true;
        Some((block, index))
    }

    /// Return the block at `index` to the free list
    ///
    /// The caller has already checked the block is allocated.
    pub fn push(&mut self, index: usize) {
        let block = block_at(self.base, self.block_size, index);
        // SAFETY: `index` came from `lookup` on this blob and the slot was
        // marked allocated, so the block is ours and not on the list.
        unsafe { self.free.push_free(block) };
        self.slots[index] = BlockSlot::FREE;
        self.used -= 1;
    }

    pub fn lookup(&self, address: Address) -> Lookup {
        let start = self.base.as_ptr() as Address;
        let end = start + self.layout.size();
        if address < start || address >= end {
            return Lookup::Outside;
        }
        let offset = address - start;
        if offset % self.block_size != 0 {
            return Lookup::Misaligned;
        }
        Lookup::Block(offset / self.block_size)
    }

    pub fn slot(&self, index: usize) -> &BlockSlot {
        &self.slots[index]
    }

    pub fn slot_mut(&mut self, index: usize) -> &mut BlockSlot {
        &mut self.slots[index]
    }

    /// Allocated slots in address order
    pub fn allocated_slots(&self) -> impl Iterator<Item = &BlockSlot> {
        self.slots.iter().filter(|slot| slot.allocated)
    }

    pub fn block_ptr(&self, index: usize) -> NonNull<u8> {
        block_at(self.base, self.block_size, index)
    }

    #[inline]
    pub fn has_free_blocks(&self) -> bool {
        !self.free.is_empty()
    }

    #[inline]
    pub fn used_block_count(&self) -> usize {
        self.used
    }

    #[inline]
    pub fn total_block_count(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn free_block_count(&self) -> usize {
        self.free.len()
    }

    /// Bytes of system memory held by this blob
    pub fn byte_size(&self) -> usize {
        self.layout.size()
    }

    fn index_of(&self, address: Address) -> usize {
        (address - self.base.as_ptr() as Address) / self.block_size
    }

    /// Walk the free list and compare it with the slot table
    pub fn verify(&self) -> Result<(), String> {
        let total = self.total_block_count();
        let walked = self.free.walk_len(total + 1);
        if walked != self.free.len() {
            return Err(format!("free list walk found {} blocks, expected {}", walked, self.free.len()));
        }
        let allocated = self.slots.iter().filter(|s| s.allocated).count();
        if allocated != self.used {
            return Err(format!("{} slots allocated, used count is {}", allocated, self.used));
        }
        if self.used + self.free.len() != total {
            return Err(format!(
                "used {} + free {} != total {}",
                self.used,
                self.free.len(),
                total
            ));
        }
        Ok(())
    }
}

impl Drop for Blob {
    fn drop(&mut self) {
        self.free.clear();
        // SAFETY: base was allocated with exactly this layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) };
    }
}

#[inline]
fn block_at(base: NonNull<u8>, block_size: usize, index: usize) -> NonNull<u8> {
    // SAFETY: callers only pass indices inside the blob, so the offset stays
    // within the allocation and cannot wrap to null.
    unsafe { NonNull::new_unchecked(base.as_ptr().add(index * block_size)) }
}

fn capacity_overflow(block_size: usize, count: usize) -> ! {
    panic!("blob of {} blocks of {} bytes overflows the address space", count, block_size)
}
