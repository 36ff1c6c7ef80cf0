//! Replica descriptors and the replica table
//!
//! A [`Replica`] wraps a transport with the per-replica state the engine keeps.
//! The `faulty` flag is set at most once and never cleared, so it can be read
//! without holding the array's config lock.

use crate::device::ReplicaDevice;

use mirrorio_common::{Sector, SlotId};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

/// Per-replica descriptor
pub struct Replica {
    device: Arc<dyn ReplicaDevice>,
    in_sync: AtomicBool,
    faulty: AtomicBool,
    write_mostly: AtomicBool,
    no_ordered: AtomicBool,
    pending: AtomicU32,
    head_position: AtomicU64,
    read_errors: AtomicU32,
    corrected_errors: AtomicU64,
}

impl Replica {
    /// Create a descriptor for a device
    pub fn new(device: Arc<dyn ReplicaDevice>, in_sync: bool, write_mostly: bool) -> Self {
        Self {
            device,
            in_sync: AtomicBool::new(in_sync),
            faulty: AtomicBool::new(false),
            write_mostly: AtomicBool::new(write_mostly),
            no_ordered: AtomicBool::new(false),
            pending: AtomicU32::new(0),
            head_position: AtomicU64::new(0),
            read_errors: AtomicU32::new(0),
            corrected_errors: AtomicU64::new(0),
        }
    }

    /// Backing transport
    pub fn device(&self) -> &Arc<dyn ReplicaDevice> {
        &self.device
    }

    /// Transport name
    pub fn name(&self) -> &str {
        self.device.name()
    }

    /// Holds a complete copy of the array
    pub fn is_in_sync(&self) -> bool {
        self.in_sync.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_sync(&self, in_sync: bool) {
        self.in_sync.store(in_sync, Ordering::Release);
    }

    /// Has been failed; never cleared
    pub fn is_faulty(&self) -> bool {
        self.faulty.load(Ordering::Acquire)
    }

    /// Set the faulty bit, returning true if this call set it
    pub(crate) fn set_faulty(&self) -> bool {
        let first = !self.faulty.swap(true, Ordering::AcqRel);
        if first {
            self.in_sync.store(false, Ordering::Release);
        }
        first
    }

    /// Prefer for writes only
    pub fn is_write_mostly(&self) -> bool {
        self.write_mostly.load(Ordering::Acquire)
    }

    pub(crate) fn set_write_mostly(&self, write_mostly: bool) {
        self.write_mostly.store(write_mostly, Ordering::Release);
    }

    /// The ordering primitive was rejected and is no longer requested
    pub fn is_no_ordered(&self) -> bool {
        self.no_ordered.load(Ordering::Acquire)
    }

    pub(crate) fn set_no_ordered(&self) {
        self.no_ordered.store(true, Ordering::Release);
    }

    /// In-flight sub-requests
    pub fn pending(&self) -> u32 {
        self.pending.load(Ordering::Acquire)
    }

    pub(crate) fn inc_pending(&self) {
        self.pending.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn dec_pending(&self) {
        let _ = self
            .pending
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Sector following the last completed request
    pub fn head_position(&self) -> Sector {
        self.head_position.load(Ordering::Acquire)
    }

    pub(crate) fn set_head_position(&self, sector: Sector) {
        self.head_position.store(sector, Ordering::Release);
    }

    /// Read errors seen on this replica
    pub fn read_errors(&self) -> u32 {
        self.read_errors.load(Ordering::Acquire)
    }

    /// Record a read error and return the new total
    pub(crate) fn note_read_error(&self) -> u32 {
        self.read_errors.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Sectors rewritten after a read error
    pub fn corrected_errors(&self) -> u64 {
        self.corrected_errors.load(Ordering::Acquire)
    }

    pub(crate) fn add_corrected(&self, sectors: u64) {
        self.corrected_errors.fetch_add(sectors, Ordering::AcqRel);
    }

    /// Can serve reads without a resync
    pub fn is_readable(&self) -> bool {
        self.is_in_sync() && !self.is_faulty()
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("name", &self.name())
            .field("in_sync", &self.is_in_sync())
            .field("faulty", &self.is_faulty())
            .field("write_mostly", &self.is_write_mostly())
            .field("pending", &self.pending())
            .finish()
    }
}

/// Slot-indexed table of replicas; slots may be empty
#[derive(Debug, Default)]
pub struct ReplicaTable {
    slots: Vec<Option<Arc<Replica>>>,
}

impl ReplicaTable {
    /// Table with `raid_disks` empty slots
    #[must_use]
    pub fn new(raid_disks: usize) -> Self {
        Self {
            slots: vec![None; raid_disks],
        }
    }

    /// Number of slots
    pub fn raid_disks(&self) -> usize {
        self.slots.len()
    }

    /// Replica in a slot
    pub fn get(&self, slot: SlotId) -> Option<&Arc<Replica>> {
        self.slots.get(slot).and_then(Option::as_ref)
    }

    /// Iterate over occupied slots
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &Arc<Replica>)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(slot, r)| r.as_ref().map(|r| (slot, r)))
    }

    /// Replicas that are in sync and not faulty
    pub fn working_count(&self) -> usize {
        self.iter().filter(|(_, r)| r.is_readable()).count()
    }

    /// Replicas present and not faulty
    pub fn active_count(&self) -> usize {
        self.iter().filter(|(_, r)| !r.is_faulty()).count()
    }

    /// First empty slot
    pub fn first_empty(&self) -> Option<SlotId> {
        self.slots.iter().position(Option::is_none)
    }

    pub fn insert(&mut self, slot: SlotId, replica: Arc<Replica>) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Some(replica);
        }
    }

    pub fn remove(&mut self, slot: SlotId) -> Option<Arc<Replica>> {
        self.slots.get_mut(slot).and_then(Option::take)
    }

    /// Grow or shrink the table; callers ensure dropped slots are empty
    pub fn resize(&mut self, raid_disks: usize) {
        self.slots.resize(raid_disks, None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryReplica;

    fn replica(in_sync: bool) -> Arc<Replica> {
        Arc::new(Replica::new(
            Arc::new(MemoryReplica::new("r", 16)),
            in_sync,
            false,
        ))
    }

    #[test]
    fn test_faulty_is_sticky() {
        let r = replica(true);
        assert!(r.set_faulty());
        assert!(!r.set_faulty());
        assert!(r.is_faulty());
        assert!(!r.is_in_sync());
        r.set_in_sync(true);
        assert!(!r.is_readable());
    }

    #[test]
    fn test_pending_never_underflows() {
        let r = replica(true);
        r.inc_pending();
        r.dec_pending();
        r.dec_pending();
        assert_eq!(r.pending(), 0);
    }

    #[test]
    fn test_table_counts() {
        let mut table = ReplicaTable::new(3);
        table.insert(0, replica(true));
        table.insert(2, replica(false));
        assert_eq!(table.working_count(), 1);
        assert_eq!(table.active_count(), 2);
        assert_eq!(table.first_empty(), Some(1));

        table.get(0).unwrap().set_faulty();
        assert_eq!(table.working_count(), 0);
        assert!(table.remove(0).is_some());
        assert_eq!(table.first_empty(), Some(0));

        table.resize(4);
        assert_eq!(table.raid_disks(), 4);
        assert!(table.get(3).is_none());
    }
}
