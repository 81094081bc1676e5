/*!
 * Allocator Limits and Constants
 *
 * Centralized location for block sizing, pool counts, report thresholds,
 * and debug fill patterns used across the memory subsystem.
 *
 * ## Conventions
 * - Values are grouped by concern (sizing, DMA, reporting, debug)
 * - Performance-sensitive constants are marked with [PERF]
 * - Values that appear in report output are marked with [REPORT]
 */

// =============================================================================
// BLOCK SIZING
// =============================================================================

/// Granularity that every pool block size is rounded up to (8 bytes)
/// A free block stores its next pointer in its first word, so blocks are
/// never smaller than this and always word aligned
/// [PERF] Keeps every block start aligned for the intrusive free list
pub const MEM_BOUND_ALIGNMENT: usize = 8;

/// Alignment of each blob's base address (16 bytes)
pub const BLOB_ALIGNMENT: usize = 16;

/// Alignment used for raw (oversized) DMA allocations (16 bytes)
pub const RAW_BLOCK_ALIGNMENT: usize = 16;

/// Tolerance by which a typed pool's block size may exceed `size_of::<T>()`
pub const MEMORY_POOL_OBJECT_ALLOCATION_SLOP: usize = 16;

// =============================================================================
// DYNAMIC MEMORY ALLOCATOR
// =============================================================================

/// Maximum number of subpools owned by one dynamic memory allocator
/// [PERF] Scanned linearly on every DMA allocation
pub const MAX_DYNAMIC_MEMORY_ALLOCATOR_SUBPOOLS: usize = 8;

/// Default subpool ladder: (name, block size)
pub const DEFAULT_DMA_LADDER: [(&str, usize); 7] = [
    ("dmaPool_16", 16),
    ("dmaPool_32", 32),
    ("dmaPool_64", 64),
    ("dmaPool_128", 128),
    ("dmaPool_256", 256),
    ("dmaPool_512", 512),
    ("dmaPool_1024", 1024),
];

/// Initial and overflow block counts for every default ladder subpool
pub const DEFAULT_DMA_SUBPOOL_COUNT: usize = 64;

// =============================================================================
// ACCOUNTING AND REPORTING
// =============================================================================

/// Maximum number of special byte buckets tracked by tag prefix
/// Bucket zero collects every tag that matches no prefix
pub const MAX_SPECIAL_USED: usize = 256;

/// Default special bucket prefixes (bucket zero is always "Misc")
pub const DEFAULT_SPECIAL_PREFIXES: [&str; 5] = ["Misc", "W3D_", "W3A_", "STL_", "STR_"];

/// Block size named by the unpooled large blocks row
/// [REPORT] First row of the usage report
pub const UNPOOLED_LARGE_BLOCK_THRESHOLD: usize = 1024;

/// Waste above which a pool that peaked under half its initial blob is reported
/// [REPORT] Pool underflow section
pub const UNDERFLOW_WASTE_THRESHOLD: usize = 4096;

/// Default cap on stored checkpoint records per pool or DMA
/// Once reached, further records are dropped and the log is marked incomplete
pub const DEFAULT_MAX_CHECKPOINT_RECORDS: usize = 1 << 20;

// =============================================================================
// DEBUG TAGS AND FILL PATTERNS
// =============================================================================

/// Tag reported for blocks that are free, foreign or null
pub const FREE_BLOCK_TAG: &str = "FREE_SINGLEBLOCK_TAG_STRING";

/// Owner label for raw DMA blocks in block reports
/// [REPORT]
pub const RAW_BLOCK_OWNER: &str = "(Oversized)";

/// Owner label for raw DMA blocks in leak reports
/// [REPORT]
pub const DMA_LEAK_OWNER: &str = "(DMA)";

/// Pattern written into do-not-zero blocks when debug fill is enabled
pub const INIT_FILLER_BYTE: u8 = 0xCD;

/// Pattern written over freed blocks when debug fill is enabled
pub const GARBAGE_FILL_BYTE: u8 = 0xDD;

// =============================================================================
// CONFIGURATION FILES
// =============================================================================

/// Pool size overrides are rounded up to a multiple of this
pub const POOL_COUNT_GRANULARITY: usize = 4;

/// Environment variable naming a JSON `MemoryConfig` file
pub const CONFIG_PATH_ENV: &str = "MEMPOOL_CONFIG";

/// Environment variable naming the usage report base path
pub const REPORT_PATH_ENV: &str = "MEMPOOL_REPORT_PATH";
