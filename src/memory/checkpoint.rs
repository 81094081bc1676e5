/*!
 * Checkpointing
 * Per-block allocation history for leak and usage reports
 *
 * Every pool and DMA keeps a `CheckpointLog`. When checkpointing is on, an
 * allocation appends a record stamped with the current checkpoint, and the
 * matching free stamps the same record with the checkpoint at free time.
 * Reports then classify records against a `[start, end)` window.
 */

use super::types::{MemoryError, MemoryResult};
use crate::core::types::{Checkpoint, Size, Tag};
use std::fmt;
use std::io::Write;
use std::ops::{BitOr, BitOrAssign};

/// OR-able report selector
///
/// The low bits select which checkpoint records a block report includes;
/// the high bits select whole report sections.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ReportFlags(u32);

impl ReportFlags {
    pub const NONE: Self = Self(0);

    pub const CP_ALLOCATED_BEFORE: Self = Self(0x0000_0001);
    pub const CP_ALLOCATED_BETWEEN: Self = Self(0x0000_0002);
    pub const CP_ALLOCATED_DONTCARE: Self = Self(0x0000_0003);

    pub const CP_FREED_BEFORE: Self = Self(0x0000_0010);
    pub const CP_FREED_BETWEEN: Self = Self(0x0000_0020);
    pub const CP_FREED_NEVER: Self = Self(0x0000_0040);
    pub const CP_FREED_DONTCARE: Self = Self(0x0000_0070);

    pub const CP_STACKTRACE: Self = Self(0x0000_0100);
    pub const POOLINFO: Self = Self(0x0000_0200);
    pub const FACTORYINFO: Self = Self(0x0000_0400);
    pub const POOL_OVERFLOW: Self = Self(0x0000_0800);
    pub const SIMPLE_LEAKS: Self = Self(0x0000_1000);

    /// Blocks allocated in the window, whatever happened to them later
    pub const CP_ALLOCATES: Self = Self::CP_ALLOCATED_BETWEEN.union(Self::CP_FREED_DONTCARE);
    /// Blocks freed in the window, whenever they were allocated
    pub const CP_FREES: Self = Self::CP_ALLOCATED_DONTCARE.union(Self::CP_FREED_BETWEEN);
    /// Blocks allocated in the window and still live
    pub const CP_LEAKS: Self = Self::CP_ALLOCATED_BETWEEN.union(Self::CP_FREED_NEVER);
    /// Blocks allocated before the window and still live
    pub const CP_LONGTERM: Self = Self::CP_ALLOCATED_BEFORE.union(Self::CP_FREED_NEVER);
    /// Blocks both allocated and freed in the window
    pub const CP_TRANSIENT: Self = Self::CP_ALLOCATED_BETWEEN.union(Self::CP_FREED_BETWEEN);
    /// Every live block allocated before the window ends
    pub const CP_EXISTING: Self = Self::CP_ALLOCATED_DONTCARE.union(Self::CP_FREED_NEVER);
    /// Every tracked block
    pub const CP_ALL: Self = Self::CP_ALLOCATED_DONTCARE.union(Self::CP_FREED_DONTCARE);

    #[inline]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// True if every bit of `other` is set
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// True if the flags ask for a per-block checkpoint report
    pub const fn wants_block_report(self) -> bool {
        self.intersects(Self::CP_ALLOCATED_DONTCARE) && self.intersects(Self::CP_FREED_DONTCARE)
    }

    /// Check the alloc and freed halves are either both set or both empty
    pub fn validate(self) -> MemoryResult<()> {
        if self.intersects(Self::CP_ALLOCATED_DONTCARE) != self.intersects(Self::CP_FREED_DONTCARE) {
            return Err(MemoryError::InvalidReportFlags(self.0));
        }
        Ok(())
    }

    /// Human-readable list of the record selectors
    pub fn describe(self) -> String {
        let mut parts = Vec::new();
        if self.intersects(Self::CP_ALLOCATED_BEFORE) {
            parts.push("AllocBefore");
        }
        if self.intersects(Self::CP_ALLOCATED_BETWEEN) {
            parts.push("AllocBetween");
        }
        if self.intersects(Self::CP_FREED_BEFORE) {
            parts.push("FreedBefore");
        }
        if self.intersects(Self::CP_FREED_BETWEEN) {
            parts.push("FreedBetween");
        }
        if self.intersects(Self::CP_FREED_NEVER) {
            parts.push("StillExisting");
        }
        parts.join(" ")
    }
}

impl BitOr for ReportFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for ReportFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for ReportFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReportFlags(0x{:x})", self.0)
    }
}

/// History of one tracked block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointRecord {
    pub tag: Tag,
    pub alloc_checkpoint: Checkpoint,
    pub free_checkpoint: Option<Checkpoint>,
    pub block_size: Size,
}

impl CheckpointRecord {
    /// True if the record matches both the alloc and the freed half of `flags`
    pub fn should_be_in_report(&self, flags: ReportFlags, start: Checkpoint, end: Checkpoint) -> bool {
        let alloc = self.alloc_checkpoint;
        let alloc_ok = (alloc < start && flags.intersects(ReportFlags::CP_ALLOCATED_BEFORE))
            || (start <= alloc && alloc < end && flags.intersects(ReportFlags::CP_ALLOCATED_BETWEEN));

        let freed_ok = match self.free_checkpoint {
            None => flags.intersects(ReportFlags::CP_FREED_NEVER),
            Some(freed) => {
                (freed < start && flags.intersects(ReportFlags::CP_FREED_BEFORE))
                    || (start <= freed && freed < end && flags.intersects(ReportFlags::CP_FREED_BETWEEN))
            }
        };

        alloc_ok && freed_ok
    }
}

/// Handle from a block to its record
///
/// Carries the log generation so links made before a reset go inert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordId {
    generation: u32,
    index: usize,
}

/// Per pool or DMA list of checkpoint records
#[derive(Debug)]
pub struct CheckpointLog {
    records: Vec<CheckpointRecord>,
    generation: u32,
    max_records: usize,
    ever_failed: bool,
}

impl CheckpointLog {
    pub fn new(max_records: usize) -> Self {
        Self {
            records: Vec::new(),
            generation: 0,
            max_records,
            ever_failed: false,
        }
    }

    /// Record an allocation
    ///
    /// Returns `None` and latches the failure flag when the record cannot be
    /// stored.
    pub fn record_alloc(&mut self, tag: Tag, checkpoint: Checkpoint, block_size: Size) -> Option<RecordId> {
        if self.records.len() >= self.max_records || self.records.try_reserve(1).is_err() {
            self.ever_failed = true;
            return None;
        }
        self.records.push(CheckpointRecord {
            tag,
            alloc_checkpoint: checkpoint,
            free_checkpoint: None,
            block_size,
        });
        Some(RecordId {
            generation: self.generation,
            index: self.records.len() - 1,
        })
    }

    /// Stamp the free checkpoint on a record, ignoring stale ids
    pub fn record_free(&mut self, id: RecordId, checkpoint: Checkpoint) {
        if id.generation != self.generation {
            return;
        }
        if let Some(record) = self.records.get_mut(id.index) {
            record.free_checkpoint = Some(checkpoint);
        }
    }

    /// Drop every record
    ///
    /// The failure latch stays set: once a report is known incomplete it
    /// stays that way for the life of the owner.
    pub fn reset(&mut self) {
        self.records = Vec::new();
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn get(&self, id: RecordId) -> Option<&CheckpointRecord> {
        if id.generation != self.generation {
            return None;
        }
        self.records.get(id.index)
    }

    pub fn records(&self) -> &[CheckpointRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn ever_failed(&self) -> bool {
        self.ever_failed
    }

    /// Records matching `flags` in the `[start, end)` window
    pub fn matching(
        &self,
        flags: ReportFlags,
        start: Checkpoint,
        end: Checkpoint,
    ) -> impl Iterator<Item = &CheckpointRecord> {
        self.records
            .iter()
            .filter(move |record| record.should_be_in_report(flags, start, end))
    }

    /// Write one `BLOCKINFO` row per matching record, returning the row count
    pub fn report(
        &self,
        flags: ReportFlags,
        start: Checkpoint,
        end: Checkpoint,
        owner: &str,
        out: &mut dyn Write,
    ) -> MemoryResult<usize> {
        validate_window(flags, start, end)?;

        if self.ever_failed {
            writeln!(out, "  *** WARNING *** info on freed blocks may be inaccurate or incomplete!")?;
        }

        let mut rows = 0;
        for record in self.matching(flags, start, end) {
            let freed = record.free_checkpoint.map_or(-1, i64::from);
            writeln!(
                out,
                "BLOCKINFO,{:>32},{:>6},{:>6},{:>6},{}",
                owner, record.block_size, record.alloc_checkpoint, freed, record.tag
            )?;
            rows += 1;
        }
        Ok(rows)
    }
}

/// Column header matching `CheckpointLog::report` rows
pub fn write_block_report_header(out: &mut dyn Write) -> MemoryResult<()> {
    writeln!(
        out,
        "BLOCKINFO,{:>32},{:>6},{:>6},{:>6},BLOCKNAME",
        "POOLNAME", "BLKSZ", "ALLOC", "FREED"
    )?;
    Ok(())
}

fn validate_window(flags: ReportFlags, start: Checkpoint, end: Checkpoint) -> MemoryResult<()> {
    if start > end {
        return Err(MemoryError::InvalidCheckpointRange {
            start,
            end,
            current: end,
        });
    }
    if !flags.intersects(ReportFlags::CP_ALLOCATED_DONTCARE) || !flags.intersects(ReportFlags::CP_FREED_DONTCARE) {
        return Err(MemoryError::InvalidReportFlags(flags.bits()));
    }
    Ok(())
}

/// Owner of a checkpoint log
pub trait Checkpointable {
    fn checkpoint_log(&self) -> &CheckpointLog;

    fn checkpoint_log_mut(&mut self) -> &mut CheckpointLog;

    /// Discard all tracked history
    fn debug_reset_checkpoints(&mut self) {
        self.checkpoint_log_mut().reset();
    }

    /// Report tracked blocks in the `[start, end)` window
    fn debug_checkpoint_report(
        &self,
        flags: ReportFlags,
        start: Checkpoint,
        end: Checkpoint,
        owner: &str,
        out: &mut dyn Write,
    ) -> MemoryResult<usize> {
        self.checkpoint_log().report(flags, start, end, owner, out)
    }
}
