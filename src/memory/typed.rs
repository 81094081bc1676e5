/*!
 * Typed Pool Binding
 *
 * Lets a Rust type live in its own named pool. `PoolBacked` names the pool
 * and says how to obtain it; `Owned<T>` is the owning pointer that drops
 * the value and returns its block to the pool.
 *
 * # Example
 *
 * ```ignore
 * struct Particle { pos: [f32; 3] }
 *
 * impl PoolBacked for Particle {
 *     const POOL_NAME: &'static str = "Particle";
 *     fn pool_init() -> PoolInit { PoolInit::Create(256, 64) }
 * }
 *
 * let pool = factory.pool_for::<Particle>()?;
 * let p = Particle::create_in(&pool, Particle { pos: [0.0; 3] })?;
 * ```
 *
 * Every live `Owned<T>` pins its block. The pool refuses to free a pinned
 * block through `free_block`, and pool, DMA and factory resets are refused
 * while typed objects exist.
 */

use super::factory::MemoryPoolFactory;
use super::pool::{BlockOwner, PoolHandle};
use super::types::{MemoryError, MemoryResult};
use crate::core::limits::{MEMORY_POOL_OBJECT_ALLOCATION_SLOP, MEM_BOUND_ALIGNMENT};
use crate::core::types::{Address, Size};
use std::any::{type_name, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::mem::{align_of, size_of, ManuallyDrop};
use std::ops::{Deref, DerefMut};
use std::ptr::{self, NonNull};
use tracing::error;

/// How a type's pool is obtained on first use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolInit {
    /// The pool must already exist in the factory
    Find,
    /// Create the pool with these initial and overflow counts
    Create(usize, usize),
    /// Create the pool with counts from the pool size table
    UserLookup,
}

/// A type that lives in a named memory pool
pub trait PoolBacked: Sized + 'static {
    const POOL_NAME: &'static str;

    fn pool_init() -> PoolInit {
        PoolInit::UserLookup
    }

    /// Move `value` into a block of `pool`
    fn create_in(pool: &PoolHandle, value: Self) -> MemoryResult<Owned<Self>> {
        Owned::new_in(pool, value)
    }
}

impl MemoryPoolFactory {
    /// Pool bound to `T`, resolved on first call and cached per factory
    pub fn pool_for<T: PoolBacked>(&mut self) -> MemoryResult<PoolHandle> {
        let type_id = TypeId::of::<T>();
        if let Some(pool) = self.typed_pool(type_id) {
            if !pool.borrow().is_destroyed() {
                return Ok(pool);
            }
        }

        let pool = self
            .resolve_typed_pool::<T>()
            .inspect_err(|e| error!(pool = T::POOL_NAME, ty = type_name::<T>(), error = %e, "Typed pool binding failed"))?;
        self.register_typed_pool(type_id, pool.clone());
        Ok(pool)
    }

    fn resolve_typed_pool<T: PoolBacked>(&mut self) -> MemoryResult<PoolHandle> {
        check_alignment::<T>(0)?;
        let type_size = object_size::<T>();
        let pool = match T::pool_init() {
            PoolInit::Find => self
                .find_memory_pool(T::POOL_NAME)
                .ok_or(MemoryError::PoolNotFound(T::POOL_NAME))?,
            PoolInit::Create(initial, overflow) => {
                self.create_memory_pool(T::POOL_NAME, type_size, initial, overflow)?
            }
            PoolInit::UserLookup => self.create_memory_pool(T::POOL_NAME, type_size, 0, 0)?,
        };

        let block_size = pool.allocation_size();
        if block_size < type_size || block_size > type_size + MEMORY_POOL_OBJECT_ALLOCATION_SLOP {
            return Err(MemoryError::PoolSizeMismatch {
                pool: T::POOL_NAME,
                block_size,
                type_size,
                slop: MEMORY_POOL_OBJECT_ALLOCATION_SLOP,
            });
        }
        Ok(pool)
    }
}

/// Create a pool whose counts come from the pool size table
pub fn create_named_pool(
    factory: &mut MemoryPoolFactory,
    name: &'static str,
    allocation_size: Size,
) -> MemoryResult<PoolHandle> {
    factory.create_memory_pool(name, allocation_size, 0, 0)
}

#[inline]
fn object_size<T>() -> Size {
    size_of::<T>().max(1)
}

fn check_alignment<T>(address: Address) -> MemoryResult<()> {
    let alignment = align_of::<T>();
    if alignment > MEM_BOUND_ALIGNMENT || address % alignment != 0 {
        return Err(MemoryError::AlignmentError { address, alignment });
    }
    Ok(())
}

/// Owning pointer to a `T` stored in a pool block
pub struct Owned<T: PoolBacked> {
    ptr: NonNull<T>,
    pool: PoolHandle,
    _marker: PhantomData<T>,
}

impl<T: PoolBacked> Owned<T> {
    /// Allocate a block from `pool` and move `value` into it
    pub fn new_in(pool: &PoolHandle, value: T) -> MemoryResult<Self> {
        let block_size = pool.allocation_size();
        if block_size < size_of::<T>() {
            return Err(MemoryError::PoolSizeMismatch {
                pool: pool.name(),
                block_size,
                type_size: size_of::<T>(),
                slop: MEMORY_POOL_OBJECT_ALLOCATION_SLOP,
            });
        }

        let block = pool
            .borrow_mut()
            .allocate_for(BlockOwner::Object, type_name::<T>(), false)?;
        if let Err(e) = check_alignment::<T>(block.as_ptr() as Address) {
            pool.borrow_mut().free_for(BlockOwner::Object, block)?;
            return Err(e);
        }

        let ptr = block.cast::<T>();
        // SAFETY: the block is at least `size_of::<T>()` bytes, aligned for
        // `T` and owned by nobody else.
        unsafe { ptr.as_ptr().write(value) };
        Ok(Self {
            ptr,
            pool: pool.clone(),
            _marker: PhantomData,
        })
    }

    /// Give up ownership without dropping the value or freeing the block
    ///
    /// The block is unpinned and becomes an ordinary pool block. The caller
    /// must not reset the pool while the pointer is in use, and should
    /// rebuild the owner with `from_raw`.
    pub fn into_raw(this: Self) -> (NonNull<T>, PoolHandle) {
        let this = ManuallyDrop::new(this);
        if let Err(e) = this.pool.borrow_mut().unpin(this.ptr.cast()) {
            error!(pool = T::POOL_NAME, error = %e, "Typed object was not pinned");
        }
        // SAFETY: `this` is never dropped, so the handle is moved out once.
        let pool = unsafe { ptr::read(&this.pool) };
        (this.ptr, pool)
    }

    /// Rebuild an owner from `into_raw` output
    ///
    /// # Safety
    ///
    /// `ptr` must come from `into_raw` on an `Owned<T>` from the same pool,
    /// and must not have been rebuilt already.
    pub unsafe fn from_raw(ptr: NonNull<T>, pool: PoolHandle) -> Self {
        if let Err(e) = pool.borrow_mut().pin(ptr.cast()) {
            error!(pool = T::POOL_NAME, error = %e, "Rebuilt typed object could not be pinned");
        }
        Self {
            ptr,
            pool,
            _marker: PhantomData,
        }
    }

    /// Drop the value and free its block, reporting pool errors
    pub fn delete(this: Self) -> MemoryResult<()> {
        let (ptr, pool) = Self::into_raw(this);
        // SAFETY: we held the only owner and it no longer exists.
        unsafe { ptr::drop_in_place(ptr.as_ptr()) };
        pool.free_block(Some(ptr.cast()))
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.pool
    }

    pub fn as_ptr(&self) -> NonNull<T> {
        self.ptr
    }
}

impl<T: PoolBacked> Deref for Owned<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the value was written in `new_in` and lives until drop.
        unsafe { self.ptr.as_ref() }
    }
}

impl<T: PoolBacked> DerefMut for Owned<T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: as above, and `&mut self` makes the access unique.
        unsafe { self.ptr.as_mut() }
    }
}

impl<T: PoolBacked> Drop for Owned<T> {
    fn drop(&mut self) {
        // SAFETY: the value is live and this is its only owner.
        unsafe { ptr::drop_in_place(self.ptr.as_ptr()) };
        let freed = self.pool.borrow_mut().free_for(BlockOwner::Object, self.ptr.cast());
        if let Err(e) = freed {
            error!(pool = self.pool.name(), error = %e, "Failed to free typed object");
        }
    }
}

impl<T: PoolBacked + fmt::Debug> fmt::Debug for Owned<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Owned")
            .field("pool", &T::POOL_NAME)
            .field("value", &**self)
            .finish()
    }
}

/// Pool handle bound to one type
pub struct TypedPool<T: PoolBacked> {
    pool: PoolHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T: PoolBacked> TypedPool<T> {
    pub fn new(factory: &mut MemoryPoolFactory) -> MemoryResult<Self> {
        Ok(Self {
            pool: factory.pool_for::<T>()?,
            _marker: PhantomData,
        })
    }

    pub fn create(&self, value: T) -> MemoryResult<Owned<T>> {
        T::create_in(&self.pool, value)
    }

    pub fn handle(&self) -> &PoolHandle {
        &self.pool
    }

    pub fn live_objects(&self) -> usize {
        self.pool.borrow().pinned_block_count()
    }
}

impl<T: PoolBacked> Clone for TypedPool<T> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
            _marker: PhantomData,
        }
    }
}

/// Optional owner that drops whatever it holds
pub struct ObjectHolder<T: PoolBacked> {
    held: Option<Owned<T>>,
}

impl<T: PoolBacked> ObjectHolder<T> {
    pub fn new() -> Self {
        Self { held: None }
    }

    /// Hold `object`, dropping anything held before
    pub fn hold(&mut self, object: Owned<T>) {
        self.held = Some(object);
    }

    /// Drop the held object now
    pub fn release(&mut self) {
        self.held = None;
    }

    /// Hand the held object back to the caller
    pub fn take(&mut self) -> Option<Owned<T>> {
        self.held.take()
    }

    pub fn get(&self) -> Option<&T> {
        self.held.as_deref()
    }

    pub fn get_mut(&mut self) -> Option<&mut T> {
        self.held.as_deref_mut()
    }

    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }
}

impl<T: PoolBacked> Default for ObjectHolder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: PoolBacked> From<Owned<T>> for ObjectHolder<T> {
    fn from(object: Owned<T>) -> Self {
        Self { held: Some(object) }
    }
}
