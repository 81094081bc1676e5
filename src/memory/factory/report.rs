/*!
 * Factory Reports
 * Usage CSV and the sectioned debug memory report
 */

use super::MemoryPoolFactory;
use crate::core::limits::{RAW_BLOCK_OWNER, UNDERFLOW_WASTE_THRESHOLD, UNPOOLED_LARGE_BLOCK_THRESHOLD};
use crate::core::types::Checkpoint;
use crate::memory::checkpoint::{write_block_report_header, Checkpointable, ReportFlags};
use crate::memory::pool::MemoryPool;
use crate::memory::types::{MemoryError, MemoryResult};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{info, instrument, warn};

const RULE: &str = "------------------------------------------";

/// Counts gathered while writing a debug report
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReportSummary {
    /// Blocks listed by the simple leak section
    pub leaks: usize,
    /// `BLOCKINFO` rows written by the block section
    pub block_rows: usize,
}

fn write_banner(out: &mut dyn Write, title: &str) -> MemoryResult<()> {
    writeln!(out, "{}", RULE)?;
    writeln!(out, "{}", title)?;
    writeln!(out, "{}", RULE)?;
    Ok(())
}

impl MemoryPoolFactory {
    /// Write the usage CSV to `<filename>.csv`, returning the path written
    #[instrument(skip(self, filename), fields(path = tracing::field::Empty))]
    pub fn memory_pool_usage_report<P: AsRef<Path>>(&self, filename: P) -> MemoryResult<PathBuf> {
        let mut path = filename.as_ref().as_os_str().to_owned();
        path.push(".csv");
        let path = PathBuf::from(path);
        tracing::Span::current().record("path", tracing::field::display(path.display()));

        let mut out = BufWriter::new(File::create(&path)?);
        self.write_usage_report(&mut out)?;
        out.flush()?;
        info!(path = %path.display(), "Wrote memory pool usage report");
        Ok(path)
    }

    /// Write the usage CSV to any writer
    ///
    /// Row zero carries the peak of unpooled large blocks in KB; each later
    /// row is one pool's peak and waste in KB. Special bucket peaks run down
    /// trailing columns alongside.
    pub fn write_usage_report(&self, out: &mut dyn Write) -> MemoryResult<()> {
        let peak_raw: usize = self
            .dmas
            .iter()
            .map(|dma| dma.borrow().peak_raw_bytes())
            .sum();
        let buckets = self.accounting.ledger().buckets();

        let mut pools = self.pools.iter();
        let mut line = 0;
        loop {
            let mut keep_going = true;
            if line == 0 {
                write!(
                    out,
                    "Unpooled Large Blocks (>{} bytes),{}",
                    UNPOOLED_LARGE_BLOCK_THRESHOLD,
                    peak_raw / 1024
                )?;
            } else if let Some(pool) = pools.next() {
                let stats = pool.stats();
                let peak = stats.peak_blocks * stats.allocation_size;
                write!(out, "{},{},{}", stats.name, peak / 1024, stats.waste_bytes() / 1024)?;
            } else {
                write!(out, ",,")?;
                keep_going = false;
            }

            if let Some(bucket) = buckets.get(line) {
                write!(out, ",,,{},{}", bucket.prefix, bucket.peak_used_bytes / 1024)?;
                keep_going = true;
            }

            writeln!(out)?;
            line += 1;
            if !keep_going {
                break;
            }
        }
        Ok(())
    }

    /// Write the sections selected by `flags`
    ///
    /// A block report (both alloc and freed bits set) covers the
    /// `[start, end)` window, which must end at or before the current
    /// checkpoint. Every report starts with a full verify.
    #[instrument(skip(self, out), fields(flags = flags.bits()))]
    pub fn debug_memory_report(
        &self,
        flags: ReportFlags,
        start: Checkpoint,
        end: Checkpoint,
        out: &mut dyn Write,
    ) -> MemoryResult<ReportSummary> {
        flags.validate()?;
        let current = self.accounting.current_checkpoint();
        let block_report = flags.wants_block_report();
        if block_report && (start > end || end > current) {
            return Err(MemoryError::InvalidCheckpointRange { start, end, current });
        }

        self.debug_memory_verify()?;
        let mut summary = ReportSummary::default();

        if flags.intersects(ReportFlags::FACTORYINFO) {
            self.write_factory_info(out)?;
        }
        if flags.intersects(ReportFlags::POOLINFO) {
            self.write_pool_info(out)?;
        }
        if flags.intersects(ReportFlags::POOL_OVERFLOW) {
            self.write_overflow_report(out)?;
        }
        if flags.intersects(ReportFlags::SIMPLE_LEAKS) {
            summary.leaks = self.write_simple_leaks(out)?;
        }
        if block_report {
            summary.block_rows = self.write_block_report(flags, start, end, out)?;
        }
        Ok(summary)
    }

    fn write_factory_info(&self, out: &mut dyn Write) -> MemoryResult<()> {
        let ledger = self.accounting.ledger();
        write_banner(out, "Begin Factory Info Report")?;
        writeln!(out, "Bytes in use (logical) = {}", ledger.used_bytes())?;
        writeln!(out, "Bytes in use (physical) = {}", ledger.physical_bytes())?;
        writeln!(out, "PEAK Bytes in use (logical) = {}", ledger.peak_used_bytes())?;
        writeln!(out, "PEAK Bytes in use (physical) = {}", ledger.peak_physical_bytes())?;
        for bucket in ledger.buckets() {
            writeln!(
                out,
                "Special {}: used {} (peak {}), physical {} (peak {})",
                bucket.prefix,
                bucket.used_bytes,
                bucket.peak_used_bytes,
                bucket.physical_bytes,
                bucket.peak_physical_bytes
            )?;
        }
        write_banner(out, "End Factory Info Report")
    }

    fn write_pool_info(&self, out: &mut dyn Write) -> MemoryResult<()> {
        write_banner(out, "Begin Pool Info Report")?;
        MemoryPool::write_info_header(out)?;
        for pool in &self.pools {
            pool.borrow().debug_pool_info_report(out)?;
        }
        for dma in &self.dmas {
            dma.borrow().debug_dma_info_report(out)?;
        }
        write_banner(out, "End Pool Info Report")
    }

    fn write_overflow_report(&self, out: &mut dyn Write) -> MemoryResult<()> {
        write_banner(out, "Begin Pool Overflow Report")?;
        for pool in &self.pools {
            let stats = pool.stats();
            if stats.peak_blocks > stats.initial_blocks {
                writeln!(
                    out,
                    "*** Pool {} overflowed initial allocation of {} (peak allocation was {})",
                    stats.name, stats.initial_blocks, stats.peak_blocks
                )?;
            }
        }
        write_banner(out, "End Pool Overflow Report")?;

        write_banner(out, "Begin Pool Underflow Report")?;
        for pool in &self.pools {
            let stats = pool.stats();
            let peak = stats.peak_blocks * stats.allocation_size;
            let initial = stats.initial_blocks * stats.allocation_size;
            if peak < initial / 2 && initial - peak > UNDERFLOW_WASTE_THRESHOLD {
                writeln!(
                    out,
                    "*** Pool {} used less than half its initial allocation of {} (peak allocation was {}, wasted {}k)",
                    stats.name,
                    stats.initial_blocks,
                    stats.peak_blocks,
                    (initial - peak) / 1024
                )?;
            }
        }
        write_banner(out, "End Pool Underflow Report")
    }

    fn write_simple_leaks(&self, out: &mut dyn Write) -> MemoryResult<usize> {
        write_banner(out, "Begin Simple Leak Report")?;
        let mut leaks = 0;
        for pool in &self.pools {
            let pool = pool.borrow();
            leaks += pool.debug_report_leaks(pool.name(), out)?;
        }
        for dma in &self.dmas {
            leaks += dma.borrow().debug_report_leaks(out)?;
        }
        if leaks > 0 {
            warn!(leaks, "Memory leaks detected");
        }
        write_banner(out, "End Simple Leak Report")?;
        Ok(leaks)
    }

    fn write_block_report(
        &self,
        flags: ReportFlags,
        start: Checkpoint,
        end: Checkpoint,
        out: &mut dyn Write,
    ) -> MemoryResult<usize> {
        writeln!(out)?;
        write_banner(out, "Begin Block Report")?;
        writeln!(
            out,
            "Options: Between checkpoints {} and {}, report on ({})",
            start,
            end,
            flags.describe()
        )?;
        writeln!(out, "{}", RULE)?;

        write_block_report_header(out)?;
        let mut rows = 0;
        for pool in &self.pools {
            let pool = pool.borrow();
            rows += pool.debug_checkpoint_report(flags, start, end, pool.name(), out)?;
        }
        for dma in &self.dmas {
            rows += dma
                .borrow()
                .debug_checkpoint_report(flags, start, end, RAW_BLOCK_OWNER, out)?;
        }

        write_banner(out, "End Block Report")?;
        Ok(rows)
    }
}
