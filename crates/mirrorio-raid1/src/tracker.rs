//! Dirty-region tracking
//!
//! The engine consults a [`RegionTracker`] before every write and every resync
//! chunk. Persistence of the tracked state is left to the implementation;
//! [`MemoryTracker`] keeps it in memory only, which is enough for tests and for
//! arrays that are always resynced from scratch after an unclean stop.

use mirrorio_common::Sector;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::debug;

/// Answer to a resync query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncHint {
    /// The region starting at the queried sector must be resynced
    pub needs_sync: bool,
    /// Sectors from the queried sector that share this answer
    pub run_length: u64,
}

/// Tracks which regions of the array may differ between replicas
pub trait RegionTracker: Send + Sync {
    /// A client write covering the range is about to be issued
    fn begin_write(&self, sector: Sector, sectors: u64, behind: bool);

    /// A client write finished; `fully_synced` is false if any replica missed it
    fn end_write(&self, sector: Sector, sectors: u64, fully_synced: bool, behind: bool);

    /// Ask whether the region at `sector` needs resync, and claim it if so.
    /// While `degraded` the region stays marked since a replica is missing.
    fn begin_sync(&self, sector: Sector, sectors: u64, degraded: bool) -> SyncHint;

    /// A claimed region was fully resynced
    fn end_sync(&self, sector: Sector, sectors: u64);

    /// A claimed region could not be resynced and stays out of sync
    fn abort_sync(&self, sector: Sector, sectors: u64) {
        let _ = (sector, sectors);
    }

    /// The resync pass ended; regions still claimed return to needing sync
    fn close_sync(&self);

    /// Behind writes currently outstanding
    fn outstanding_behind_writes(&self) -> u32;

    /// Upper bound on outstanding behind writes (0 disables write-behind)
    fn max_behind_writes(&self) -> u32;

    /// Flush pending tracker updates before queued writes are dispatched
    fn unplug(&self) {}

    /// The array was resized to `sectors`
    fn resize(&self, sectors: Sector) {
        let _ = sectors;
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Region {
    writers: u32,
    needed: bool,
    syncing: bool,
}

/// In-memory region tracker
pub struct MemoryTracker {
    region_sectors: u64,
    regions: Mutex<Vec<Region>>,
    behind: AtomicU32,
    max_behind: u32,
}

impl MemoryTracker {
    /// Tracker for an array whose replicas are known to be identical
    #[must_use]
    pub fn new_clean(size: Sector, region_sectors: u64, max_behind: u32) -> Self {
        Self::with_state(size, region_sectors, max_behind, false)
    }

    /// Tracker for an array whose replicas may differ anywhere
    #[must_use]
    pub fn new_dirty(size: Sector, region_sectors: u64, max_behind: u32) -> Self {
        Self::with_state(size, region_sectors, max_behind, true)
    }

    fn with_state(size: Sector, region_sectors: u64, max_behind: u32, needed: bool) -> Self {
        let region_sectors = region_sectors.max(1);
        let count = size.div_ceil(region_sectors) as usize;
        Self {
            region_sectors,
            regions: Mutex::new(vec![
                Region {
                    needed,
                    ..Region::default()
                };
                count
            ]),
            behind: AtomicU32::new(0),
            max_behind,
        }
    }

    /// Sectors covered by one region
    #[must_use]
    pub const fn region_sectors(&self) -> u64 {
        self.region_sectors
    }

    /// Number of regions that need resync
    pub fn dirty_regions(&self) -> usize {
        self.regions
            .lock()
            .iter()
            .filter(|r| r.needed || r.syncing)
            .count()
    }

    /// Mark the region holding `sector` as needing resync
    pub fn mark_dirty(&self, sector: Sector) {
        let idx = self.index(sector);
        if let Some(region) = self.regions.lock().get_mut(idx) {
            region.needed = true;
        }
    }

    /// Number of client writes in flight across all regions
    pub fn writers_in_flight(&self) -> u32 {
        self.regions.lock().iter().map(|r| r.writers).sum()
    }

    fn index(&self, sector: Sector) -> usize {
        (sector / self.region_sectors) as usize
    }

    fn span(&self, sector: Sector, sectors: u64) -> std::ops::Range<usize> {
        let first = self.index(sector);
        let last = self.index(sector + sectors.max(1) - 1);
        first..last + 1
    }
}

impl RegionTracker for MemoryTracker {
    fn begin_write(&self, sector: Sector, sectors: u64, behind: bool) {
        let span = self.span(sector, sectors);
        let mut regions = self.regions.lock();
        for region in regions.iter_mut().take(span.end).skip(span.start) {
            region.writers += 1;
        }
        drop(regions);
        if behind {
            self.behind.fetch_add(1, Ordering::AcqRel);
        }
    }

    fn end_write(&self, sector: Sector, sectors: u64, fully_synced: bool, behind: bool) {
        let span = self.span(sector, sectors);
        let mut regions = self.regions.lock();
        for region in regions.iter_mut().take(span.end).skip(span.start) {
            region.writers = region.writers.saturating_sub(1);
            if !fully_synced {
                region.needed = true;
            }
        }
        drop(regions);
        if behind {
            let _ = self
                .behind
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        }
    }

    fn begin_sync(&self, sector: Sector, _sectors: u64, degraded: bool) -> SyncHint {
        let idx = self.index(sector);
        let run_length = (idx as u64 + 1) * self.region_sectors - sector;
        let mut regions = self.regions.lock();
        let Some(region) = regions.get_mut(idx) else {
            return SyncHint {
                needs_sync: false,
                run_length,
            };
        };

        let needs_sync = region.needed || region.syncing || region.writers > 0;
        if needs_sync && !degraded {
            region.needed = false;
            region.syncing = true;
        }
        SyncHint {
            needs_sync,
            run_length,
        }
    }

    fn end_sync(&self, sector: Sector, _sectors: u64) {
        let idx = self.index(sector);
        if let Some(region) = self.regions.lock().get_mut(idx) {
            region.syncing = false;
        }
    }

    fn abort_sync(&self, sector: Sector, _sectors: u64) {
        let idx = self.index(sector);
        if let Some(region) = self.regions.lock().get_mut(idx)
            && region.syncing
        {
            region.syncing = false;
            region.needed = true;
        }
    }

    fn close_sync(&self) {
        let mut regions = self.regions.lock();
        for region in regions.iter_mut().filter(|r| r.syncing) {
            region.syncing = false;
            region.needed = true;
        }
    }

    fn outstanding_behind_writes(&self) -> u32 {
        self.behind.load(Ordering::Acquire)
    }

    fn max_behind_writes(&self) -> u32 {
        self.max_behind
    }

    fn resize(&self, sectors: Sector) {
        let count = sectors.div_ceil(self.region_sectors) as usize;
        let mut regions = self.regions.lock();
        let old = regions.len();
        // New space has never been written to every replica
        regions.resize(
            count,
            Region {
                needed: true,
                ..Region::default()
            },
        );
        debug!("Region tracker resized from {} to {} regions", old, count);
    }
}
