/*!
 * Intrusive Free List
 * Singly linked list threaded through the first word of each free block
 *
 * This is the only place that reads or writes the link word. Everything
 * above it deals in block addresses and per-block side metadata.
 */

use std::mem;
use std::ptr::NonNull;

/// Link stored in the first word of a free block
type Link = Option<NonNull<u8>>;

/// Smallest block that can hold a link
pub(crate) const MIN_BLOCK_SIZE: usize = mem::size_of::<Link>();

/// LIFO list of free blocks
#[derive(Debug)]
pub(crate) struct FreeList {
    head: Link,
    len: usize,
}

impl FreeList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    /// Push a block onto the list
    ///
    /// # Safety
    ///
    /// `block` must point to at least `MIN_BLOCK_SIZE` writable bytes aligned
    /// for a pointer, must not already be on any list, and must not be read
    /// or written by anyone else until it is popped again. The memory must
    /// stay valid for as long as the block is on the list.
    #[inline]
    pub unsafe fn push_free(&mut self, block: NonNull<u8>) {
        block.cast::<Link>().as_ptr().write(self.head);
        self.head = Some(block);
        self.len += 1;
    }

    /// Pop the most recently pushed block
    #[inline]
    pub fn pop_free(&mut self) -> Option<NonNull<u8>> {
        let block = self.head?;
        // SAFETY: every block on the list was pushed under the contract of
        // `push_free`, so it is valid, aligned and holds a link we wrote.
        self.head = unsafe { block.cast::<Link>().as_ptr().read() };
        self.len -= 1;
        Some(block)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Forget every block without touching memory
    ///
    /// Used when the backing storage is released as a whole.
    pub fn clear(&mut self) {
        self.head = None;
        self.len = 0;
    }

    /// Walk the list and count its links
    ///
    /// Stops after `limit` links so a corrupted cycle cannot hang the caller.
    pub fn walk_len(&self, limit: usize) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while let Some(block) = cursor {
            if count >= limit {
                break;
            }
            count += 1;
            // SAFETY: see `pop_free`.
            cursor = unsafe { block.cast::<Link>().as_ptr().read() };
        }
        count
    }
}
