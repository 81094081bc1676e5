/*!
 * Memory Module
 * Pooled allocation for a single-threaded game engine
 */

pub mod checkpoint;
pub mod config;
pub mod dma;
pub mod factory;
pub mod lifecycle;
pub mod pool;
pub mod tracking;
pub mod typed;
pub mod types;

// Re-export for convenience
pub use checkpoint::{CheckpointLog, CheckpointRecord, Checkpointable, ReportFlags};
pub use config::{MemoryConfig, PoolSizeEntry, PoolSizeTable, SubpoolConfig};
pub use dma::{default_dma_subpools, DmaHandle, DynamicMemoryAllocator};
pub use factory::{MemoryPoolFactory, ReportSummary};
pub use lifecycle::{
    init_memory_manager, init_memory_manager_with, is_memory_manager_officially_inited,
    pre_main_init_memory_manager, shutdown_memory_manager, with_memory_manager, MemoryManager,
    MemoryManagerHooks,
};
pub use pool::{MemoryPool, PoolHandle};
pub use tracking::{TrackingSettings, UsageLedger};
pub use typed::{create_named_pool, ObjectHolder, Owned, PoolBacked, PoolInit, TypedPool};
pub use types::*;
