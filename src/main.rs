/*!
 * Memory Pool Report Tool
 *
 * Brings up the memory manager, runs a short synthetic workload between two
 * checkpoints and prints:
 * - The debug memory report (stdout)
 * - The usage CSV (MEMPOOL_REPORT_PATH, default "mempool_usage")
 * - Factory statistics as JSON
 *
 * An optional first argument names a pool size override file.
 */

use anyhow::{Context, Result};
use game_memory::core::limits::REPORT_PATH_ENV;
use game_memory::monitoring::span_report;
use game_memory::{
    init_memory_manager_with, init_tracing, shutdown_memory_manager, with_memory_manager, MemoryConfig, Owned,
    PoolBacked, PoolInit, ReportFlags,
};
use std::io::Write;
use tracing::info;

struct Particle {
    position: [f32; 3],
    velocity: [f32; 3],
    ttl: u32,
}

impl PoolBacked for Particle {
    const POOL_NAME: &'static str = "Particle";

    fn pool_init() -> PoolInit {
        PoolInit::Create(64, 16)
    }
}

fn main() -> Result<()> {
    init_tracing();

    let config = MemoryConfig::from_env().context("Failed to load memory config")?;
    init_memory_manager_with(&config, None).context("Failed to initialize memory manager")?;

    if let Some(path) = std::env::args().nth(1) {
        let applied = with_memory_manager(|m| m.factory_mut().pool_size_table_mut().load_overrides(&path))?
            .with_context(|| format!("Failed to read pool size overrides from {}", path))?;
        info!(path = %path, applied, "Loaded pool size overrides");
    }

    let report_path = std::env::var(REPORT_PATH_ENV).unwrap_or_else(|_| "mempool_usage".to_string());

    with_memory_manager(|manager| -> Result<()> {
        let start = manager.factory().debug_set_checkpoint();
        let (blocks, particles) = run_workload(manager)?;
        let end = manager.factory().debug_set_checkpoint();

        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        {
            let span = span_report("debug_memory_report");
            let _entered = span.enter();
            let flags = ReportFlags::FACTORYINFO
                | ReportFlags::POOLINFO
                | ReportFlags::POOL_OVERFLOW
                | ReportFlags::SIMPLE_LEAKS
                | ReportFlags::CP_LEAKS;
            let summary = manager
                .factory()
                .debug_memory_report(flags, start, end, &mut out)
                .context("Failed to write debug memory report")?;
            span.record_rows(summary.block_rows);
        }

        let csv = manager
            .factory()
            .memory_pool_usage_report(&report_path)
            .context("Failed to write usage report")?;
        info!(path = %csv.display(), "Usage report written");

        let stats = serde_json::to_string_pretty(&manager.factory().stats()).context("Failed to encode stats")?;
        writeln!(out, "{}", stats)?;

        let dma = manager.dma().clone();
        for block in blocks {
            dma.free_bytes(Some(block))?;
        }
        for particle in particles {
            Owned::delete(particle)?;
        }
        Ok(())
    })??;

    if let Some(stats) = shutdown_memory_manager().context("Failed to shut down memory manager")? {
        info!(peak_used = stats.peak_used_bytes, "Done");
    }
    Ok(())
}

/// Allocate a mix of DMA blocks and particles, freeing about half
fn run_workload(
    manager: &mut game_memory::MemoryManager,
) -> Result<(Vec<std::ptr::NonNull<u8>>, Vec<Owned<Particle>>)> {
    let dma = manager.dma().clone();
    let pool = manager.factory_mut().pool_for::<Particle>()?;

    let mut blocks = Vec::new();
    for i in 0..256usize {
        let size = (i * 337) % 2047 + 1;
        let tag = if size > 1024 { "W3D_Texture" } else { "STR_Buffer" };
        let block = dma.allocate_bytes(size, tag)?;
        if i % 2 == 0 {
            dma.free_bytes(Some(block))?;
        } else {
            blocks.push(block);
        }
    }

    let mut particles = Vec::new();
    for i in 0..100u32 {
        let mut particle = Particle::create_in(
            &pool,
            Particle {
                position: [0.0; 3],
                velocity: [1.0, 0.5, 0.0],
                ttl: i % 30,
            },
        )?;
        let velocity = particle.velocity;
        for (pos, vel) in particle.position.iter_mut().zip(velocity) {
            *pos += vel;
        }
        if particle.ttl < 10 {
            Owned::delete(particle)?;
        } else {
            particles.push(particle);
        }
    }

    info!(
        live_blocks = blocks.len(),
        live_particles = particles.len(),
        "Workload complete"
    );
    Ok((blocks, particles))
}
