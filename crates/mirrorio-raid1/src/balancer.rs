//! Read balancing
//!
//! Replica selection is a pure function over a snapshot of the replica table,
//! so it can be tested without devices and is deterministic for a given input.

use mirrorio_common::{Sector, SectorRange, SlotId};

/// What the balancer needs to know about one slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplicaView {
    /// Holds a complete copy and is not faulty
    pub in_sync: bool,
    /// Prefer for writes only
    pub write_mostly: bool,
    /// Already failed this request
    pub blocked: bool,
    /// In-flight sub-requests
    pub pending: u32,
    /// Sector following the last completed request
    pub head_position: Sector,
}

impl ReplicaView {
    fn readable(&self) -> bool {
        self.in_sync && !self.blocked
    }

    fn preferred(&self) -> bool {
        self.readable() && !self.write_mostly
    }
}

/// Balancer state carried between reads
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReadCursor {
    /// Slot chosen for the previous read
    pub last_used: SlotId,
    /// Sector a sequential follow-up read would start at
    pub next_seq_sect: Sector,
}

/// A read to place
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadPlan {
    /// Sectors to read
    pub range: SectorRange,
    /// Start of the unsynced tail while a resync is running
    pub resync_window: Option<Sector>,
}

/// Choose the replica that should serve a read
///
/// `views` is indexed by slot; `None` marks an empty slot. Returns `None` if no
/// replica can serve the read.
pub fn choose_read_replica(
    views: &[Option<ReplicaView>],
    cursor: &mut ReadCursor,
    plan: &ReadPlan,
) -> Option<SlotId> {
    let view = |slot: SlotId| views.get(slot).copied().flatten();
    let slots = views.len();
    if slots == 0 {
        return None;
    }

    let in_window = plan
        .resync_window
        .is_some_and(|next_resync| plan.range.end() >= next_resync);

    let chosen = if in_window {
        // Only replicas known to hold the unsynced tail may serve it
        (0..slots)
            .find(|&s| view(s).is_some_and(|v| v.preferred()))
            .or_else(|| (0..slots).find(|&s| view(s).is_some_and(|v| v.readable())))?
    } else {
        select_nearest(views, cursor, plan.range.start)?
    };

    cursor.last_used = chosen;
    cursor.next_seq_sect = plan.range.end();
    Some(chosen)
}

fn select_nearest(
    views: &[Option<ReplicaView>],
    cursor: &ReadCursor,
    sector: Sector,
) -> Option<SlotId> {
    let view = |slot: SlotId| views.get(slot).copied().flatten();
    let slots = views.len();
    let start = cursor.last_used.min(slots - 1);

    // Walk backwards from the last used slot to the first preferred replica
    let backwards = |from: SlotId| (0..slots).map(move |i| (from + slots - i) % slots);
    let mut current = backwards(start).find(|&s| view(s).is_some_and(|v| v.preferred()));
    if current.is_none() {
        current = backwards(start).find(|&s| view(s).is_some_and(|v| v.readable()));
    }
    let current = current?;
    let current_view = view(current)?;

    // Sequential access stays on the same replica
    if cursor.next_seq_sect == sector || current_view.head_position == sector {
        return Some(current);
    }
    if current_view.write_mostly {
        return Some(current);
    }

    let mut best = current;
    let mut best_distance = current_view.head_position.abs_diff(sector);
    for slot in backwards(current).skip(1) {
        let Some(v) = view(slot) else { continue };
        if !v.preferred() {
            continue;
        }
        if v.pending == 0 {
            return Some(slot);
        }
        let distance = v.head_position.abs_diff(sector);
        if distance < best_distance {
            best = slot;
            best_distance = distance;
        }
    }
    Some(best)
}
