/*!
 * Core Types
 * Common types used across the memory subsystem
 */

/// Address type for block lookups
pub type Address = usize;

/// Size type for memory operations
pub type Size = usize;

/// Checkpoint counter value
pub type Checkpoint = u32;

/// Static tag attached to every allocation for reporting
pub type Tag = &'static str;

/// Round `value` up to the next multiple of `granularity`
///
/// `granularity` must be a power of two.
#[inline]
pub const fn round_up(value: usize, granularity: usize) -> usize {
    (value + granularity - 1) & !(granularity - 1)
}
