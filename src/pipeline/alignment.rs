//! Bounded frame-alignment buffer between the dispatcher and the render loop

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::AlignedResult;

/// Results keyed by `frame_id`, waiting for the render loop to reach that frame.
///
/// Inserts overwrite. `take` hands back the exact match and drops every older
/// key, since metadata only moves forward. Overflow evicts the oldest frame.
pub struct AlignmentBuffer {
    entries: Mutex<BTreeMap<u64, AlignedResult>>,
    capacity: usize,

    /// Statistics
    stats: CachePadded<Stats>,
}

#[derive(Default)]
struct Stats {
    inserted: AtomicUsize,
    taken: AtomicUsize,
    superseded: AtomicUsize,
    evicted: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlignmentStats {
    pub inserted: usize,
    pub taken: usize,
    pub superseded: usize,
    pub evicted: usize,
}

impl AlignmentBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            capacity: capacity.max(1),
            stats: CachePadded::new(Stats::default()),
        }
    }

    /// Dispatcher side: insert or overwrite.
    pub fn insert(&self, result: AlignedResult) {
        let evicted = {
            let mut entries = self.entries.lock();
            entries.insert(result.frame_id, result);
            let mut evicted = 0;
            while entries.len() > self.capacity {
                entries.pop_first();
                evicted += 1;
            }
            evicted
        };
        self.stats.inserted.fetch_add(1, Ordering::Relaxed);
        if evicted > 0 {
            self.stats.evicted.fetch_add(evicted, Ordering::Relaxed);
            ::metrics::counter!("argus_alignment_evicted_total").increment(evicted as u64);
        }
    }

    /// Render side: remove the entry for `frame_id`, if any, and discard
    /// everything older. A miss is normal.
    pub fn take(&self, frame_id: u64) -> Option<AlignedResult> {
        let (found, superseded) = {
            let mut entries = self.entries.lock();
            let found = entries.remove(&frame_id);
            let newer = entries.split_off(&frame_id);
            let superseded = entries.len();
            *entries = newer;
            (found, superseded)
        };
        if found.is_some() {
            self.stats.taken.fetch_add(1, Ordering::Relaxed);
        }
        if superseded > 0 {
            self.stats.superseded.fetch_add(superseded, Ordering::Relaxed);
        }
        found
    }

    pub fn contains(&self, frame_id: u64) -> bool {
        self.entries.lock().contains_key(&frame_id)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> AlignmentStats {
        AlignmentStats {
            inserted: self.stats.inserted.load(Ordering::Relaxed),
            taken: self.stats.taken.load(Ordering::Relaxed),
            superseded: self.stats.superseded.load(Ordering::Relaxed),
            evicted: self.stats.evicted.load(Ordering::Relaxed),
        }
    }
}
