//! Resync engine
//!
//! A resync pass walks the array in chunks on its own thread. Each chunk that
//! the region tracker (or the pass kind) says must be processed takes the
//! barrier, reads from in-sync replicas and hands the data to the recovery
//! thread, which writes it to the replicas that need it and lowers the barrier
//! again. Up to the barrier depth chunks may be in flight at once.

use crate::array::{ArrayShared, Dispatch};
use crate::device::IoRequest;
use crate::error::{MirrorError, MirrorResult};
use crate::metrics::ArrayMetrics;
use crate::request::{RequestContext, RequestFlag, RequestState, SubRole, SyncChunk};

use mirrorio_common::{Sector, SectorRange, SlotId};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Kind of resync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResyncKind {
    /// Make replicas identical after an unclean shutdown
    Resync,
    /// Rebuild replicas that are not in sync
    Recovery,
    /// Compare in-sync replicas and count mismatches
    Check,
    /// Compare in-sync replicas and rewrite mismatches
    Repair,
}

impl ResyncKind {
    /// Get the kind as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Resync => "resync",
            Self::Recovery => "recovery",
            Self::Check => "check",
            Self::Repair => "repair",
        }
    }

    /// Every in-sync replica is read and compared
    pub const fn is_requested(&self) -> bool {
        matches!(self, Self::Check | Self::Repair)
    }

    /// Replicas found to differ are rewritten
    pub const fn writes_mismatches(&self) -> bool {
        matches!(self, Self::Repair)
    }
}

impl fmt::Display for ResyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResyncKind {
    type Err = MirrorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "resync" => Ok(Self::Resync),
            "recovery" | "recover" => Ok(Self::Recovery),
            "check" => Ok(Self::Check),
            "repair" => Ok(Self::Repair),
            other => Err(MirrorError::InvalidRequest(format!(
                "unknown resync kind: {other}"
            ))),
        }
    }
}

/// Result of a finished resync pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncReport {
    pub kind: ResyncKind,
    /// The pass reached the end of the array
    pub completed: bool,
    /// Sectors read and written
    pub synced_sectors: u64,
    /// Sectors the tracker reported as clean
    pub skipped_sectors: u64,
    /// Sectors found to differ (check and repair)
    pub mismatch_sectors: u64,
    pub elapsed: Duration,
}

/// Progress of the running pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResyncStatus {
    pub kind: ResyncKind,
    pub position: Sector,
    pub total: Sector,
    pub mismatch_sectors: u64,
}

impl fmt::Display for ResyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let percent = if self.total == 0 {
            100.0
        } else {
            self.position as f64 * 100.0 / self.total as f64
        };
        write!(
            f,
            "[{}] {:.1}% ({}/{})",
            self.kind,
            percent,
            self.position / 2,
            self.total / 2
        )
    }
}

/// Resync thread handle and progress counters
#[derive(Default)]
pub(crate) struct ResyncControl {
    running: AtomicBool,
    interrupted: AtomicBool,
    kind: Mutex<Option<ResyncKind>>,
    position: AtomicU64,
    total: AtomicU64,
    synced: AtomicU64,
    skipped: AtomicU64,
    pub(crate) mismatches: AtomicU64,
    handle: Mutex<Option<JoinHandle<ResyncReport>>>,
}

impl ResyncControl {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the running pass to stop at the next chunk
    pub(crate) fn interrupt(&self) {
        if self.is_running() {
            self.interrupted.store(true, Ordering::Release);
        }
    }

    fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    pub(crate) fn status(&self) -> Option<ResyncStatus> {
        if !self.is_running() {
            return None;
        }
        let kind = (*self.kind.lock())?;
        Some(ResyncStatus {
            kind,
            position: self.position.load(Ordering::Acquire),
            total: self.total.load(Ordering::Acquire),
            mismatch_sectors: self.mismatches.load(Ordering::Acquire),
        })
    }
}

/// Replica roles for one chunk
struct ChunkPlan {
    roles: Vec<(SlotId, SubRole)>,
    read_slot: SlotId,
    read_targets: usize,
    write_targets: usize,
}

impl ArrayShared {
    pub(crate) fn start_resync(self: &Arc<Self>, kind: ResyncKind) -> MirrorResult<()> {
        let mut handle = self.resync.handle.lock();
        if self.resync.is_running() {
            return Err(MirrorError::ResyncRunning);
        }
        if self.conf.lock().stopping {
            return Err(MirrorError::Stopped);
        }
        // Reap a finished pass nobody waited for
        if let Some(previous) = handle.take() {
            let _ = previous.join();
        }

        self.resync.running.store(true, Ordering::Release);
        self.resync.interrupted.store(false, Ordering::Release);
        *self.resync.kind.lock() = Some(kind);

        let shared = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-{}", self.name(), kind))
            .spawn(move || {
                let report = shared.resync_pass(kind);
                shared.resync.running.store(false, Ordering::Release);
                report
            });
        match spawned {
            Ok(join) => {
                *handle = Some(join);
                Ok(())
            }
            Err(e) => {
                self.resync.running.store(false, Ordering::Release);
                Err(MirrorError::Internal(format!(
                    "failed to spawn resync thread: {e}"
                )))
            }
        }
    }

    pub(crate) fn wait_resync(&self) -> Option<ResyncReport> {
        let handle = self.resync.handle.lock().take()?;
        handle.join().ok()
    }

    fn resync_pass(self: &Arc<Self>, kind: ResyncKind) -> ResyncReport {
        let started = Instant::now();
        let (size, start, full, raid_disks) = {
            let state = self.conf.lock();
            let start = match kind {
                ResyncKind::Resync => state.recovery_cp.unwrap_or(state.size),
                _ => 0,
            };
            let full = kind == ResyncKind::Recovery && state.fullsync;
            (state.size, start, full, state.table.raid_disks())
        };
        let requested = kind.is_requested();
        let chunk_sectors = self.config.resync.chunk_sectors;
        let yield_interval = Duration::from_millis(self.config.resync.yield_interval_ms);

        self.resync.position.store(start, Ordering::Release);
        self.resync.total.store(size, Ordering::Release);
        self.resync.synced.store(0, Ordering::Release);
        self.resync.skipped.store(0, Ordering::Release);
        self.resync.mismatches.store(0, Ordering::Release);

        // Rebuild targets are fixed when the pass starts; check and repair
        // only compare in-sync replicas
        let targets: Vec<SlotId> = if requested {
            Vec::new()
        } else {
            let state = self.conf.lock();
            state
                .table
                .iter()
                .filter(|(_, r)| !r.is_faulty() && !r.is_in_sync())
                .map(|(slot, _)| slot)
                .collect()
        };

        info!(
            "Array {}: {} started at sector {} of {}",
            self.name(),
            kind,
            start,
            size
        );

        let mut sector = start;
        let mut completed = true;
        while sector < size {
            if self.resync.is_interrupted() || self.conf.lock().stopping {
                completed = false;
                break;
            }

            let remaining = size - sector;
            let degraded = {
                let state = self.conf.lock();
                (0..state.table.raid_disks())
                    .any(|slot| state.table.get(slot).is_none_or(|r| r.is_faulty()))
            };
            let hint = self.tracker.begin_sync(sector, remaining, degraded);
            let run_length = hint.run_length.clamp(1, remaining);
            if !hint.needs_sync && !requested && !full {
                ArrayMetrics::add(&self.metrics.resync_skipped, run_length);
                self.resync.skipped.fetch_add(run_length, Ordering::AcqRel);
                sector += run_length;
                self.resync.position.store(sector, Ordering::Release);
                self.conf.lock().next_resync = Some(sector);
                continue;
            }
            let len = chunk_sectors.min(run_length);

            if self.barrier.has_waiters() {
                std::thread::sleep(yield_interval);
            }
            self.barrier.raise_barrier();
            self.conf.lock().next_resync = Some(sector);

            let plan = self.plan_chunk(kind, &targets);
            let chunk_range = SectorRange::new(sector, len);
            let write_targets = if kind == ResyncKind::Recovery {
                plan.write_targets
            } else {
                plan.write_targets + plan.read_targets.saturating_sub(1)
            };
            if write_targets == 0 || plan.read_targets == 0 {
                warn!(
                    "Array {}: {} has {} sources and {} targets, nothing to do",
                    self.name(),
                    kind,
                    plan.read_targets,
                    write_targets
                );
                self.tracker.abort_sync(sector, len);
                self.barrier.lower_barrier();
                sector = size;
                self.resync.position.store(sector, Ordering::Release);
                break;
            }

            self.issue_chunk(chunk_range, raid_disks, kind, requested, &plan);
            sector += len;
            self.resync.position.store(sector, Ordering::Release);
        }

        self.barrier.wait_idle();
        self.tracker.close_sync();
        let interrupted = self.resync.is_interrupted();
        completed &= !interrupted;

        {
            let mut state = self.conf.lock();
            state.next_resync = None;
            if completed {
                match kind {
                    ResyncKind::Recovery => {
                        for slot in &targets {
                            if let Some(replica) = state.table.get(*slot)
                                && !replica.is_faulty()
                            {
                                replica.set_in_sync(true);
                                info!(
                                    "Array {}: {} in slot {} is now in sync",
                                    self.name(),
                                    replica.name(),
                                    slot
                                );
                            }
                        }
                        state.fullsync = false;
                    }
                    ResyncKind::Resync => state.recovery_cp = None,
                    ResyncKind::Check | ResyncKind::Repair => {}
                }
            }
        }

        let report = ResyncReport {
            kind,
            completed,
            synced_sectors: self.resync.synced.load(Ordering::Acquire),
            skipped_sectors: self.resync.skipped.load(Ordering::Acquire),
            mismatch_sectors: self.resync.mismatches.load(Ordering::Acquire),
            elapsed: started.elapsed(),
        };
        if completed {
            info!(
                "Array {}: {} done in {:?} ({} sectors synced, {} skipped, {} mismatched)",
                self.name(),
                kind,
                report.elapsed,
                report.synced_sectors,
                report.skipped_sectors,
                report.mismatch_sectors
            );
        } else {
            warn!(
                "Array {}: {} interrupted at sector {}",
                self.name(),
                kind,
                self.resync.position.load(Ordering::Acquire)
            );
        }
        report
    }

    /// Assign read and write roles for a chunk
    fn plan_chunk(&self, kind: ResyncKind, targets: &[SlotId]) -> ChunkPlan {
        let state = self.conf.lock();
        let mut readers = Vec::new();
        let mut fallback = Vec::new();
        let mut writers = Vec::new();
        for (slot, replica) in state.table.iter() {
            if replica.is_faulty() {
                continue;
            }
            if replica.is_in_sync() {
                if replica.is_write_mostly() {
                    fallback.push(slot);
                } else {
                    readers.push(slot);
                }
            } else if targets.contains(&slot) {
                writers.push(slot);
            }
        }
        let read_slot = readers.first().or(fallback.first()).copied().unwrap_or(0);
        let read_targets = readers.len() + fallback.len();

        let mut roles: Vec<(SlotId, SubRole)> = Vec::new();
        for slot in readers.iter().chain(fallback.iter()) {
            let role = if kind.is_requested() || *slot == read_slot {
                SubRole::Read
            } else if kind == ResyncKind::Resync {
                SubRole::Write
            } else {
                continue;
            };
            roles.push((*slot, role));
        }
        roles.extend(writers.iter().map(|slot| (*slot, SubRole::Write)));

        ChunkPlan {
            roles,
            read_slot,
            read_targets,
            write_targets: writers.len(),
        }
    }

    /// Build the chunk's context and issue its reads
    fn issue_chunk(
        self: &Arc<Self>,
        range: SectorRange,
        raid_disks: usize,
        kind: ResyncKind,
        requested: bool,
        plan: &ChunkPlan,
    ) {
        let ctx = Arc::new(RequestContext::sync(
            range,
            raid_disks,
            SyncChunk { kind, requested },
        ));
        ctx.set_read_slot(plan.read_slot);

        let mut reads = Vec::new();
        {
            let state = self.conf.lock();
            for (slot, role) in &plan.roles {
                let Some(replica) = state.table.get(*slot) else {
                    continue;
                };
                ctx.set_role(*slot, *role, Some(Arc::clone(replica)));
                if *role == SubRole::Read {
                    replica.inc_pending();
                    reads.push(Dispatch {
                        ctx: Arc::clone(&ctx),
                        slot: *slot,
                        replica: Arc::clone(replica),
                        request: IoRequest::read(range.start, range.sectors),
                    });
                }
            }
        }

        if reads.is_empty() {
            self.tracker.abort_sync(range.start, range.sectors);
            ctx.transition(RequestState::Completed);
            self.barrier.lower_barrier();
            return;
        }

        debug!(
            "Array {}: {} chunk {} reading from {} replicas",
            self.name(),
            kind,
            range,
            reads.len()
        );
        ctx.remaining.store(reads.len() as u32, Ordering::Release);
        ctx.transition(RequestState::Dispatched);
        for read in reads {
            self.dispatch(read);
        }
    }

    /// Last write of a chunk completed: record it with the tracker and lower
    /// the barrier
    pub(crate) fn finish_sync_chunk(&self, ctx: &RequestContext) {
        let range = ctx.range;
        if ctx.flags.test(RequestFlag::Degraded) {
            self.tracker.abort_sync(range.start, range.sectors);
        } else {
            self.tracker.end_sync(range.start, range.sectors);
        }
        ArrayMetrics::add(&self.metrics.resync_sectors, range.sectors);
        self.resync.synced.fetch_add(range.sectors, Ordering::AcqRel);
        ctx.transition(RequestState::Completed);
        self.barrier.lower_barrier();
    }
}
