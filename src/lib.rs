/*!
 * Game Memory Library
 * Fixed-size pools, a size-routing allocator and checkpointed leak reports
 */

pub mod core;
pub mod memory;
pub mod monitoring;

// Re-exports
pub use memory::*;
pub use monitoring::init_tracing;
