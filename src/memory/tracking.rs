/*!
 * Usage Tracking
 * Byte totals, special buckets and the checkpoint clock shared by a factory
 * and every pool it creates
 */

use super::types::BucketStats;
use crate::core::limits::{DEFAULT_MAX_CHECKPOINT_RECORDS, DEFAULT_SPECIAL_PREFIXES, MAX_SPECIAL_USED};
use crate::core::types::{Checkpoint, Tag};
use smartstring::alias::String as SmartString;
use std::cell::{Cell, Ref, RefCell};
use std::rc::Rc;

/// Runtime switches that pools consult on every allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackingSettings {
    pub checkpointing: bool,
    pub max_checkpoint_records: usize,
    pub debug_fill: bool,
}

impl Default for TrackingSettings {
    fn default() -> Self {
        Self {
            checkpointing: true,
            max_checkpoint_records: DEFAULT_MAX_CHECKPOINT_RECORDS,
            debug_fill: false,
        }
    }
}

/// Current and peak value of one counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Gauge {
    current: i64,
    peak: i64,
}

impl Gauge {
    fn adjust(&mut self, delta: i64) {
        self.current += delta;
        if self.current > self.peak {
            self.peak = self.current;
        }
    }
}

#[derive(Debug, Clone)]
struct Bucket {
    prefix: SmartString,
    used: Gauge,
    physical: Gauge,
}

/// Logical and physical byte totals
///
/// Logical bytes are blocks handed out; physical bytes are blob and raw
/// storage held from the system. Each change is also charged to the first
/// special bucket whose prefix matches the tag, or to bucket zero.
#[derive(Debug, Clone)]
pub struct UsageLedger {
    used: Gauge,
    physical: Gauge,
    buckets: Vec<Bucket>,
}

impl UsageLedger {
    pub fn new<S: AsRef<str>>(prefixes: &[S]) -> Self {
        let mut buckets: Vec<Bucket> = prefixes
            .iter()
            .take(MAX_SPECIAL_USED)
            .map(|p| Bucket {
                prefix: p.as_ref().into(),
                used: Gauge::default(),
                physical: Gauge::default(),
            })
            .collect();
        if buckets.is_empty() {
            buckets.push(Bucket {
                prefix: DEFAULT_SPECIAL_PREFIXES[0].into(),
                used: Gauge::default(),
                physical: Gauge::default(),
            });
        }
        Self {
            used: Gauge::default(),
            physical: Gauge::default(),
            buckets,
        }
    }

    /// Apply a change in logical and physical bytes
    pub fn adjust_totals(&mut self, tag: &str, used_delta: i64, physical_delta: i64) {
        self.used.adjust(used_delta);
        self.physical.adjust(physical_delta);

        let slot = self.bucket_for(tag);
        let bucket = &mut self.buckets[slot];
        bucket.used.adjust(used_delta);
        bucket.physical.adjust(physical_delta);
    }

    /// Index of the bucket charged for `tag`
    pub fn bucket_for(&self, tag: &str) -> usize {
        self.buckets
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, b)| tag.starts_with(b.prefix.as_str()))
            .map_or(0, |(i, _)| i)
    }

    /// Zero every counter and peak
    pub fn reset(&mut self) {
        self.used = Gauge::default();
        self.physical = Gauge::default();
        for bucket in &mut self.buckets {
            bucket.used = Gauge::default();
            bucket.physical = Gauge::default();
        }
    }

    pub fn used_bytes(&self) -> i64 {
        self.used.current
    }

    pub fn physical_bytes(&self) -> i64 {
        self.physical.current
    }

    pub fn peak_used_bytes(&self) -> i64 {
        self.used.peak
    }

    pub fn peak_physical_bytes(&self) -> i64 {
        self.physical.peak
    }

    pub fn buckets(&self) -> Vec<BucketStats> {
        self.buckets
            .iter()
            .map(|b| BucketStats {
                prefix: b.prefix.clone(),
                used_bytes: b.used.current,
                peak_used_bytes: b.used.peak,
                physical_bytes: b.physical.current,
                peak_physical_bytes: b.physical.peak,
            })
            .collect()
    }
}

impl Default for UsageLedger {
    fn default() -> Self {
        Self::new(&DEFAULT_SPECIAL_PREFIXES)
    }
}

/// State shared between a factory and its pools
///
/// Pools hold an `Rc` to this so the hot path can stamp checkpoints and
/// charge the ledger without going through the factory.
#[derive(Debug)]
pub struct Accounting {
    clock: Cell<Checkpoint>,
    ledger: RefCell<UsageLedger>,
    settings: Cell<TrackingSettings>,
}

impl Accounting {
    pub fn new(settings: TrackingSettings, ledger: UsageLedger) -> Rc<Self> {
        Rc::new(Self {
            clock: Cell::new(0),
            ledger: RefCell::new(ledger),
            settings: Cell::new(settings),
        })
    }

    /// Fresh context with default settings, for standalone pools
    pub fn standalone() -> Rc<Self> {
        Self::new(TrackingSettings::default(), UsageLedger::default())
    }

    #[inline]
    pub fn current_checkpoint(&self) -> Checkpoint {
        self.clock.get()
    }

    /// Advance the clock, returning the new checkpoint
    pub fn advance_checkpoint(&self) -> Checkpoint {
        let next = self.clock.get().wrapping_add(1);
        self.clock.set(next);
        next
    }

    #[inline]
    pub fn settings(&self) -> TrackingSettings {
        self.settings.get()
    }

    pub fn set_settings(&self, settings: TrackingSettings) {
        self.settings.set(settings);
    }

    #[inline]
    pub fn adjust_totals(&self, tag: Tag, used_delta: i64, physical_delta: i64) {
        self.ledger.borrow_mut().adjust_totals(tag, used_delta, physical_delta);
    }

    pub fn ledger(&self) -> Ref<'_, UsageLedger> {
        self.ledger.borrow()
    }

    pub fn reset_ledger(&self) {
        self.ledger.borrow_mut().reset();
    }
}
