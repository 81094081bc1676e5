/*!
 * Core Module
 * Fundamental types and limits shared by the allocator
 */

pub mod limits;
pub mod types;

pub use types::*;
