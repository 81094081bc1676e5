/*!
 * Memory Types
 * Errors, configuration records and statistics for the allocator
 */

use crate::core::types::{Address, Checkpoint, Size};
use miette::Diagnostic;
use serde::Serialize;
use smartstring::alias::String as SmartString;
use thiserror::Error;

/// Memory operation result
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Memory errors
#[derive(Error, Debug, Clone, PartialEq, Eq, Diagnostic)]
pub enum MemoryError {
    #[error("Pool '{0}' not found")]
    #[diagnostic(
        code(memory::pool_not_found),
        help("Create the pool before binding a type to it, or use PoolInit::Create.")
    )]
    PoolNotFound(&'static str),

    #[error("Pool '{pool}' has block size {block_size}, type needs {type_size} (+{slop} slop)")]
    #[diagnostic(
        code(memory::pool_size_mismatch),
        help("Pool block size must be at least the type size and within the slop tolerance.")
    )]
    PoolSizeMismatch {
        pool: &'static str,
        block_size: Size,
        type_size: Size,
        slop: Size,
    },

    #[error("Alignment error: address 0x{address:x}, required alignment {alignment}")]
    #[diagnostic(
        code(memory::alignment),
        help("Pool blocks are only aligned to MEM_BOUND_ALIGNMENT.")
    )]
    AlignmentError { address: Address, alignment: Size },

    #[error("No size entry for pool '{0}'")]
    #[diagnostic(
        code(memory::pool_size_unknown),
        help("Add the pool to the pool size table or pass explicit counts.")
    )]
    PoolSizeUnknown(SmartString),

    #[error("Invalid pool parameters for '{name}': size {allocation_size}, initial {initial}")]
    #[diagnostic(
        code(memory::invalid_pool_size),
        help("Block size and initial block count must both be non-zero.")
    )]
    InvalidPoolSize {
        name: &'static str,
        allocation_size: Size,
        initial: usize,
    },

    #[error("Too many subpools: {requested} requested, limit {limit}")]
    #[diagnostic(code(memory::too_many_subpools))]
    TooManySubpools { requested: usize, limit: usize },

    #[error("Subpool '{0}' is not larger than the subpool before it")]
    #[diagnostic(
        code(memory::subpool_order),
        help("Subpool sizes must strictly increase.")
    )]
    SubpoolOrder(&'static str),

    #[error("Pool '{pool}' is exhausted ({total} blocks) and may not grow")]
    #[diagnostic(
        code(memory::pool_exhausted),
        help("Give the pool a non-zero overflow count or a larger initial count.")
    )]
    PoolExhausted { pool: &'static str, total: usize },

    #[error("Block 0x{address:x} does not belong to '{owner}'")]
    #[diagnostic(
        code(memory::foreign_block),
        help("Free blocks through the pool or allocator that produced them.")
    )]
    ForeignBlock { address: Address, owner: &'static str },

    #[error("Block 0x{address:x} in '{owner}' is already free")]
    #[diagnostic(code(memory::double_free))]
    DoubleFree { address: Address, owner: &'static str },

    #[error("Block 0x{address:x} in '{pool}' is held by a {holder}")]
    #[diagnostic(
        code(memory::block_held),
        help("Free the block through whatever allocated it.")
    )]
    BlockHeld {
        address: Address,
        pool: &'static str,
        holder: &'static str,
    },

    #[error("Pool '{0}' has been destroyed")]
    #[diagnostic(code(memory::pool_destroyed))]
    PoolDestroyed(&'static str),

    #[error("Pool '{pool}' still has {used} blocks in use")]
    #[diagnostic(
        code(memory::pool_in_use),
        help("Free every block (or reset the pool) before destroying it.")
    )]
    PoolInUse { pool: &'static str, used: usize },

    #[error("Pool '{0}' is a subpool of a dynamic memory allocator")]
    #[diagnostic(
        code(memory::pool_owned_by_dma),
        help("Destroy the owning allocator instead.")
    )]
    PoolOwnedByDma(&'static str),

    #[error("Dynamic memory allocator still has {0} blocks in use")]
    #[diagnostic(code(memory::dma_in_use))]
    DmaInUse(usize),

    #[error("Memory corruption detected: {0}")]
    #[diagnostic(
        code(memory::corruption),
        help("Internal bookkeeping disagrees with itself. This is a bug or a stray write.")
    )]
    CorruptionDetected(SmartString),

    #[error("Invalid checkpoint range {start}..{end} (current {current})")]
    #[diagnostic(code(memory::checkpoint_range))]
    InvalidCheckpointRange {
        start: Checkpoint,
        end: Checkpoint,
        current: Checkpoint,
    },

    #[error("Report flags 0x{0:x} must select at least one alloc bit and one freed bit")]
    #[diagnostic(code(memory::report_flags))]
    InvalidReportFlags(u32),

    #[error("Memory manager is already initialized")]
    #[diagnostic(code(memory::already_initialized))]
    AlreadyInitialized,

    #[error("Memory manager is not initialized")]
    #[diagnostic(
        code(memory::not_initialized),
        help("Call init_memory_manager() first.")
    )]
    NotInitialized,

    #[error("Configuration error: {0}")]
    #[diagnostic(code(memory::config))]
    ConfigParse(SmartString),

    #[error("I/O error: {0}")]
    #[diagnostic(code(memory::io))]
    Io(SmartString),
}

impl From<std::io::Error> for MemoryError {
    fn from(err: std::io::Error) -> Self {
        MemoryError::Io(err.to_string().into())
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::ConfigParse(err.to_string().into())
    }
}

/// Creation parameters for one named pool
///
/// An `initial_allocation_count` of zero asks the factory's pool size
/// table for both counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolInitRec {
    pub pool_name: &'static str,
    pub allocation_size: Size,
    pub initial_allocation_count: usize,
    pub overflow_allocation_count: usize,
}

impl PoolInitRec {
    pub const fn new(
        pool_name: &'static str,
        allocation_size: Size,
        initial_allocation_count: usize,
        overflow_allocation_count: usize,
    ) -> Self {
        Self {
            pool_name,
            allocation_size,
            initial_allocation_count,
            overflow_allocation_count,
        }
    }
}

/// Snapshot of one pool's counters
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub name: &'static str,
    pub allocation_size: Size,
    pub initial_blocks: usize,
    pub overflow_blocks: usize,
    pub used_blocks: usize,
    pub total_blocks: usize,
    pub peak_blocks: usize,
    pub blobs: usize,
}

impl PoolStats {
    pub fn used_bytes(&self) -> Size {
        self.used_blocks * self.allocation_size
    }

    pub fn physical_bytes(&self) -> Size {
        self.total_blocks * self.allocation_size
    }

    /// Bytes of the initial blob never touched at peak
    pub fn waste_bytes(&self) -> Size {
        (self.initial_blocks * self.allocation_size)
            .saturating_sub(self.peak_blocks * self.allocation_size)
    }
}

/// Snapshot of one dynamic memory allocator
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DmaStats {
    pub used_blocks: usize,
    pub subpools: Vec<&'static str>,
    pub raw_blocks: usize,
    pub raw_bytes: Size,
    pub peak_raw_bytes: Size,
}

/// Byte totals for one special bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BucketStats {
    pub prefix: SmartString,
    pub used_bytes: i64,
    pub peak_used_bytes: i64,
    pub physical_bytes: i64,
    pub peak_physical_bytes: i64,
}

/// Factory-wide statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FactoryStats {
    pub used_bytes: i64,
    pub physical_bytes: i64,
    pub peak_used_bytes: i64,
    pub peak_physical_bytes: i64,
    pub current_checkpoint: Checkpoint,
    pub pools: Vec<PoolStats>,
    pub dmas: Vec<DmaStats>,
    pub buckets: Vec<BucketStats>,
}
