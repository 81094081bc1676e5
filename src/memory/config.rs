/*!
 * Memory Configuration
 *
 * Runtime configuration for tracking, debug fill, the DMA subpool ladder
 * and the named pool size table
 */

use super::dma::default_dma_subpools;
use super::tracking::TrackingSettings;
use super::types::{MemoryError, MemoryResult, PoolInitRec};
use crate::core::limits::{
    CONFIG_PATH_ENV, DEFAULT_MAX_CHECKPOINT_RECORDS, DEFAULT_SPECIAL_PREFIXES, POOL_COUNT_GRANULARITY,
};
use crate::core::types::round_up;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use smartstring::alias::String as SmartString;
use std::path::Path;

/// One DMA subpool as written in a config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubpoolConfig {
    pub name: SmartString,
    pub size: usize,
    pub initial: usize,
    pub overflow: usize,
}

/// Block counts for a named pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSizeEntry {
    pub name: SmartString,
    pub initial: usize,
    pub overflow: usize,
}

impl PoolSizeEntry {
    pub fn new(name: &str, initial: usize, overflow: usize) -> Self {
        Self {
            name: name.into(),
            initial,
            overflow,
        }
    }
}

/// Memory subsystem configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Record per-block checkpoint history
    pub checkpointing: bool,
    /// Cap on stored checkpoint records per pool or DMA
    pub max_checkpoint_records: usize,
    /// Fill do-not-zero blocks and freed blocks with marker bytes
    pub debug_fill: bool,
    /// Tag prefixes for special byte buckets; the first entry catches the rest
    pub special_prefixes: Vec<SmartString>,
    /// DMA subpool ladder; empty selects the built-in ladder
    pub dma_subpools: Vec<SubpoolConfig>,
    /// Counts for pools created with an initial count of zero
    pub pool_sizes: Vec<PoolSizeEntry>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            checkpointing: true,
            max_checkpoint_records: DEFAULT_MAX_CHECKPOINT_RECORDS,
            debug_fill: false,
            special_prefixes: DEFAULT_SPECIAL_PREFIXES.iter().map(|p| (*p).into()).collect(),
            dma_subpools: Vec::new(),
            pool_sizes: Vec::new(),
        }
    }
}

impl MemoryConfig {
    /// Configuration with every debug aid switched off
    pub fn release() -> Self {
        Self {
            checkpointing: false,
            debug_fill: false,
            ..Self::default()
        }
    }

    /// Configuration with checkpointing and fill patterns on
    pub fn debug() -> Self {
        Self {
            checkpointing: true,
            debug_fill: true,
            ..Self::default()
        }
    }

    pub fn tracking_settings(&self) -> TrackingSettings {
        TrackingSettings {
            checkpointing: self.checkpointing,
            max_checkpoint_records: self.max_checkpoint_records,
            debug_fill: self.debug_fill,
        }
    }

    /// Subpool ladder as creation records
    ///
    /// Names from the config are leaked so pools can keep `&'static str`
    /// names; this runs once per manager init.
    pub fn dma_parms(&self) -> Vec<PoolInitRec> {
        if self.dma_subpools.is_empty() {
            return default_dma_subpools();
        }
        self.dma_subpools
            .iter()
            .map(|sub| {
                let name: &'static str = Box::leak(sub.name.to_string().into_boxed_str());
                PoolInitRec::new(name, sub.size, sub.initial, sub.overflow)
            })
            .collect()
    }

    pub fn pool_size_table(&self) -> PoolSizeTable {
        PoolSizeTable::from_entries(self.pool_sizes.clone())
    }

    /// Load configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> MemoryResult<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_json::from_str(&text)?;
        info!("Loaded memory config from {}", path.as_ref().display());
        Ok(config)
    }

    /// Load from the file named by `MEMPOOL_CONFIG`, or use the defaults
    pub fn from_env() -> MemoryResult<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.is_empty() => Self::from_json_file(path),
            _ => Ok(Self::default()),
        }
    }
}

/// Named pool block counts, matched case-insensitively
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolSizeTable {
    entries: Vec<PoolSizeEntry>,
}

impl PoolSizeTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: Vec<PoolSizeEntry>) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.insert(&entry.name, entry.initial, entry.overflow);
        }
        table
    }

    /// Add or replace the counts for `name`
    pub fn insert(&mut self, name: &str, initial: usize, overflow: usize) {
        match self.find_mut(name) {
            Some(entry) => {
                entry.initial = initial;
                entry.overflow = overflow;
            }
            None => self.entries.push(PoolSizeEntry::new(name, initial, overflow)),
        }
    }

    /// Counts for `name` as `(initial, overflow)`
    pub fn lookup(&self, name: &str) -> Option<(usize, usize)> {
        self.entries
            .iter()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
            .map(|entry| (entry.initial, entry.overflow))
    }

    pub fn entries(&self) -> &[PoolSizeEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut PoolSizeEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.name.eq_ignore_ascii_case(name))
    }

    /// Apply `name initial overflow` lines to existing entries
    ///
    /// Lines starting with `;` are comments. Counts are rounded up to a
    /// multiple of four (minimum four). Lines naming unknown pools or not
    /// matching the format are skipped. Returns the number of entries changed.
    pub fn parse_overrides(&mut self, text: &str) -> usize {
        let mut applied = 0;
        for (line_no, line) in text.lines().enumerate() {
            if line.starts_with(';') || line.trim().is_empty() {
                continue;
            }
            let mut fields = line.split_whitespace();
            let parsed = match (fields.next(), fields.next(), fields.next()) {
                (Some(name), Some(initial), Some(overflow)) => {
                    match (initial.parse::<usize>(), overflow.parse::<usize>()) {
                        (Ok(initial), Ok(overflow)) => Some((name, initial, overflow)),
                        _ => None,
                    }
                }
                _ => None,
            };
            let Some((name, initial, overflow)) = parsed else {
                debug!("Skipping pool size line {}: {:?}", line_no + 1, line);
                continue;
            };

            match self.find_mut(name) {
                Some(entry) => {
                    entry.initial = round_up_count(initial);
                    entry.overflow = round_up_count(overflow);
                    applied += 1;
                }
                None => warn!("Pool size override for unknown pool {}", name),
            }
        }
        applied
    }

    /// Apply overrides from a file; a missing file changes nothing
    pub fn load_overrides<P: AsRef<Path>>(&mut self, path: P) -> MemoryResult<usize> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No pool size overrides at {}", path.display());
                return Ok(0);
            }
            Err(e) => return Err(MemoryError::from(e)),
        };
        let applied = self.parse_overrides(&text);
        info!("Applied {} pool size overrides from {}", applied, path.display());
        Ok(applied)
    }
}

fn round_up_count(count: usize) -> usize {
    round_up(count.max(POOL_COUNT_GRANULARITY), POOL_COUNT_GRANULARITY)
}
