//! Mirror array assembly and administrative surface
//!
//! [`MirrorArray`] owns the shared array state and the recovery thread. Client
//! I/O enters through [`MirrorArray::submit`] (or the blocking wrappers) and
//! everything else is administration: replica lifecycle, resize, resync and
//! status reporting.

use crate::balancer::ReadCursor;
use crate::barrier::Barrier;
use crate::device::{IoRequest, ReplicaDevice};
use crate::error::{MirrorError, MirrorResult};
use crate::metrics::{ArrayMetrics, MetricsSnapshot, PrometheusExporter};
use crate::replica::{Replica, ReplicaTable};
use crate::request::{ClientCompletion, RequestContext, RequestPool};
use crate::resync::{ResyncControl, ResyncKind, ResyncReport, ResyncStatus};
use crate::tracker::RegionTracker;

use bytes::Bytes;
use mirrorio_common::config::ArrayConfig;
use mirrorio_common::{ArrayId, Direction, Sector, SlotId};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// A client I/O request
#[derive(Clone, PartialEq, Eq)]
pub struct ClientIo {
    pub direction: Direction,
    pub sector: Sector,
    pub sectors: u64,
    /// Payload for writes
    pub data: Bytes,
    /// Request the ordering primitive on every replica
    pub ordered: bool,
}

impl ClientIo {
    /// Read `sectors` sectors at `sector`
    #[must_use]
    pub fn read(sector: Sector, sectors: u64) -> Self {
        Self {
            direction: Direction::Read,
            sector,
            sectors,
            data: Bytes::new(),
            ordered: false,
        }
    }

    /// Write `data` at `sector`
    #[must_use]
    pub fn write(sector: Sector, data: Bytes) -> Self {
        Self {
            direction: Direction::Write,
            sector,
            sectors: data.len() as u64 / mirrorio_common::SECTOR_SIZE,
            data,
            ordered: false,
        }
    }

    /// Write `data` at `sector` with the ordering primitive
    #[must_use]
    pub fn ordered_write(sector: Sector, data: Bytes) -> Self {
        Self {
            ordered: true,
            ..Self::write(sector, data)
        }
    }
}

impl fmt::Debug for ClientIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIo")
            .field("direction", &self.direction)
            .field("sector", &self.sector)
            .field("sectors", &self.sectors)
            .field("ordered", &self.ordered)
            .finish_non_exhaustive()
    }
}

/// A replica to assemble into a new array
pub struct ReplicaSpec {
    pub device: Arc<dyn ReplicaDevice>,
    /// Explicit slot (defaults to the next free slot)
    pub slot: Option<SlotId>,
    pub write_mostly: bool,
    /// The replica already holds a complete copy
    pub in_sync: bool,
}

impl ReplicaSpec {
    /// In-sync member in the next free slot
    pub fn new(device: Arc<dyn ReplicaDevice>) -> Self {
        Self {
            device,
            slot: None,
            write_mostly: false,
            in_sync: true,
        }
    }

    #[must_use]
    pub fn with_slot(mut self, slot: SlotId) -> Self {
        self.slot = Some(slot);
        self
    }

    #[must_use]
    pub fn with_write_mostly(mut self, write_mostly: bool) -> Self {
        self.write_mostly = write_mostly;
        self
    }

    #[must_use]
    pub fn with_in_sync(mut self, in_sync: bool) -> Self {
        self.in_sync = in_sync;
        self
    }
}

/// Options for hot-adding a replica
#[derive(Debug, Clone, Copy, Default)]
pub struct AddReplicaOptions {
    /// Slot to use (defaults to the first empty slot)
    pub slot: Option<SlotId>,
    pub write_mostly: bool,
    /// The replica was a member before and only regions the tracker marks
    /// need rebuilding
    pub readd: bool,
}

/// Sub-request waiting for the recovery thread to dispatch it
pub(crate) struct Dispatch {
    pub(crate) ctx: Arc<RequestContext>,
    pub(crate) slot: SlotId,
    pub(crate) replica: Arc<Replica>,
    pub(crate) request: IoRequest,
}

/// State guarded by the config lock
pub(crate) struct ArrayState {
    pub(crate) table: ReplicaTable,
    pub(crate) cursor: ReadCursor,
    pub(crate) size: Sector,
    /// Writes waiting to be dispatched outside the lock
    pub(crate) deferred: VecDeque<Dispatch>,
    /// Contexts waiting for the recovery thread
    pub(crate) retry: VecDeque<Arc<RequestContext>>,
    /// A replica was added without history and needs a full copy
    pub(crate) fullsync: bool,
    /// Replicas may differ from this sector on; `None` once clean
    pub(crate) recovery_cp: Option<Sector>,
    /// Position of the running resync pass
    pub(crate) next_resync: Option<Sector>,
    pub(crate) stopping: bool,
}

/// State shared by the array handle, completion callbacks and worker threads
pub(crate) struct ArrayShared {
    pub(crate) id: ArrayId,
    pub(crate) config: ArrayConfig,
    pub(crate) conf: Mutex<ArrayState>,
    /// Wakes the recovery thread
    pub(crate) wake: Condvar,
    pub(crate) barrier: Barrier,
    pub(crate) tracker: Arc<dyn RegionTracker>,
    pub(crate) pool: Arc<RequestPool>,
    pub(crate) metrics: ArrayMetrics,
    /// Bytes held by write-behind payload copies
    pub(crate) behind_bytes: AtomicU64,
    pub(crate) resync: ResyncControl,
}

impl ArrayShared {
    pub(crate) fn name(&self) -> &str {
        &self.config.name
    }

    pub(crate) fn raid_disks(&self) -> usize {
        self.conf.lock().table.raid_disks()
    }
}

/// Replica state as reported by [`MirrorArray::status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaState {
    InSync,
    Rebuilding,
    Faulty,
}

impl ReplicaState {
    /// Get the state as a string
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::InSync => "in_sync",
            Self::Rebuilding => "rebuilding",
            Self::Faulty => "faulty",
        }
    }

    /// Gauge value for metrics export
    pub const fn as_value(&self) -> f64 {
        match self {
            Self::InSync => 2.0,
            Self::Rebuilding => 1.0,
            Self::Faulty => 0.0,
        }
    }
}

/// Status of one replica
#[derive(Debug, Clone)]
pub struct ReplicaStatus {
    pub slot: SlotId,
    pub name: String,
    pub state: ReplicaState,
    pub write_mostly: bool,
    pub pending: u32,
    pub read_errors: u32,
    pub corrected_errors: u64,
}

/// Array status, displayed in the familiar mdstat layout
#[derive(Debug, Clone)]
pub struct ArrayStatus {
    pub name: String,
    pub raid_disks: usize,
    /// In-sync replicas
    pub working: usize,
    pub size_sectors: Sector,
    pub resync: Option<ResyncStatus>,
    pub replicas: Vec<ReplicaStatus>,
}

impl ArrayStatus {
    /// Per-slot health map, e.g. `UU_`
    pub fn health_map(&self) -> String {
        (0..self.raid_disks)
            .map(|slot| {
                let in_sync = self
                    .replicas
                    .iter()
                    .any(|r| r.slot == slot && r.state == ReplicaState::InSync);
                if in_sync { 'U' } else { '_' }
            })
            .collect()
    }
}

impl fmt::Display for ArrayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} : active raid1", self.name)?;
        for replica in &self.replicas {
            write!(f, " {}[{}]", replica.name, replica.slot)?;
            if replica.write_mostly {
                write!(f, "(W)")?;
            }
            if replica.state == ReplicaState::Faulty {
                write!(f, "(F)")?;
            }
        }
        writeln!(f)?;
        write!(
            f,
            "      {} blocks [{}/{}] [{}]",
            self.size_sectors / 2,
            self.raid_disks,
            self.working,
            self.health_map()
        )?;
        if let Some(resync) = &self.resync {
            writeln!(f)?;
            write!(f, "      {resync}")?;
        }
        Ok(())
    }
}

/// A running RAID-1 array
pub struct MirrorArray {
    shared: Arc<ArrayShared>,
    recovery: Mutex<Option<JoinHandle<()>>>,
}

impl MirrorArray {
    /// Assemble an array from its replicas and start the recovery thread
    pub fn start(
        config: ArrayConfig,
        replicas: Vec<ReplicaSpec>,
        tracker: Arc<dyn RegionTracker>,
    ) -> MirrorResult<Self> {
        config.validate()?;
        if replicas.is_empty() {
            return Err(MirrorError::InvalidRequest(
                "an array needs at least one replica".to_string(),
            ));
        }

        let mut table = ReplicaTable::new(config.raid_disks);
        let mut fullsync = false;
        for spec in replicas {
            let slot = match spec.slot {
                Some(slot) if slot >= config.raid_disks => {
                    return Err(MirrorError::InvalidSlot(slot));
                }
                Some(slot) if table.get(slot).is_some() => {
                    return Err(MirrorError::SlotOccupied(slot));
                }
                Some(slot) => slot,
                None => table.first_empty().ok_or(MirrorError::NoFreeSlot)?,
            };
            if !spec.in_sync {
                fullsync = true;
            }
            table.insert(
                slot,
                Arc::new(Replica::new(spec.device, spec.in_sync, spec.write_mostly)),
            );
        }

        let smallest = table
            .iter()
            .map(|(_, r)| r.device().capacity())
            .min()
            .unwrap_or(0);
        let size = config.size_sectors.unwrap_or(smallest);
        if let Some((slot, replica)) = table.iter().find(|(_, r)| r.device().capacity() < size) {
            return Err(MirrorError::Rejected {
                slot,
                reason: format!(
                    "{} holds {} sectors but the array needs {}",
                    replica.name(),
                    replica.device().capacity(),
                    size
                ),
            });
        }
        if size == 0 {
            return Err(MirrorError::InvalidRequest("array size is zero".to_string()));
        }

        let working = table.working_count();
        let raid_disks = config.raid_disks;
        let shared = Arc::new(ArrayShared {
            id: ArrayId::new(),
            conf: Mutex::new(ArrayState {
                table,
                cursor: ReadCursor::default(),
                size,
                deferred: VecDeque::new(),
                retry: VecDeque::new(),
                fullsync,
                recovery_cp: if config.assume_clean { None } else { Some(0) },
                next_resync: None,
                stopping: false,
            }),
            wake: Condvar::new(),
            barrier: Barrier::new(config.resync.barrier_depth),
            tracker,
            pool: Arc::new(RequestPool::new(config.max_requests)),
            metrics: ArrayMetrics::default(),
            behind_bytes: AtomicU64::new(0),
            resync: ResyncControl::default(),
            config,
        });

        let recovery = {
            let shared = Arc::clone(&shared);
            std::thread::Builder::new()
                .name(format!("{}-raid1", shared.name()))
                .spawn(move || shared.run_recovery())
                .map_err(|e| MirrorError::Internal(format!("failed to spawn recovery thread: {e}")))?
        };

        info!(
            "Array {} ({}) started: raid1 with {} out of {} mirrors, {} sectors",
            shared.name(),
            shared.id,
            working,
            raid_disks,
            size
        );
        if working < raid_disks {
            warn!("Array {} is degraded", shared.name());
        }

        Ok(Self {
            shared,
            recovery: Mutex::new(Some(recovery)),
        })
    }

    /// Array identity
    pub fn id(&self) -> ArrayId {
        self.shared.id
    }

    /// Array name
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Usable size in sectors
    pub fn size(&self) -> Sector {
        self.shared.conf.lock().size
    }

    /// Submit a client request; `done` fires exactly once with the result
    pub fn submit(&self, io: ClientIo, done: ClientCompletion) {
        self.shared.submit(io, done);
    }

    /// Read and wait for the data
    pub fn read(&self, sector: Sector, sectors: u64) -> MirrorResult<Bytes> {
        self.submit_and_wait(ClientIo::read(sector, sectors))
    }

    /// Write and wait for the result
    pub fn write(&self, sector: Sector, data: Bytes) -> MirrorResult<()> {
        self.submit_and_wait(ClientIo::write(sector, data)).map(|_| ())
    }

    /// Write with the ordering primitive and wait for the result
    pub fn write_ordered(&self, sector: Sector, data: Bytes) -> MirrorResult<()> {
        self.submit_and_wait(ClientIo::ordered_write(sector, data))
            .map(|_| ())
    }

    fn submit_and_wait(&self, io: ClientIo) -> MirrorResult<Bytes> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.submit(
            io,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        rx.blocking_recv()
            .map_err(|_| MirrorError::Internal("request completion dropped".to_string()))?
    }

    /// Start a background resync pass
    pub fn start_resync(&self, kind: ResyncKind) -> MirrorResult<()> {
        self.shared.start_resync(kind)
    }

    /// Wait for the running resync pass, if any, and return its report
    pub fn wait_resync(&self) -> Option<ResyncReport> {
        self.shared.wait_resync()
    }

    /// Ask a running resync pass to stop
    pub fn interrupt_resync(&self) {
        self.shared.resync.interrupt();
    }

    /// Block client I/O (`true`) or let it resume (`false`)
    pub fn quiesce(&self, quiesce: bool) {
        if quiesce {
            self.shared.barrier.raise_barrier();
        } else {
            self.shared.barrier.lower_barrier();
        }
    }

    /// Current status
    pub fn status(&self) -> ArrayStatus {
        let state = self.shared.conf.lock();
        let replicas = state
            .table
            .iter()
            .map(|(slot, r)| ReplicaStatus {
                slot,
                name: r.name().to_string(),
                state: if r.is_faulty() {
                    ReplicaState::Faulty
                } else if r.is_in_sync() {
                    ReplicaState::InSync
                } else {
                    ReplicaState::Rebuilding
                },
                write_mostly: r.is_write_mostly(),
                pending: r.pending(),
                read_errors: r.read_errors(),
                corrected_errors: r.corrected_errors(),
            })
            .collect();
        ArrayStatus {
            name: self.shared.name().to_string(),
            raid_disks: state.table.raid_disks(),
            working: state.table.working_count(),
            size_sectors: state.size,
            resync: self.shared.resync.status(),
            replicas,
        }
    }

    /// Replicas may still differ and a resync pass should be run
    pub fn needs_resync(&self) -> bool {
        let state = self.shared.conf.lock();
        state.recovery_cp.is_some()
            || state.fullsync
            || state
                .table
                .iter()
                .any(|(_, r)| !r.is_faulty() && !r.is_in_sync())
    }

    /// Fail a replica as an operator would
    pub fn fail_replica(&self, slot: SlotId) -> MirrorResult<()> {
        let replica = {
            let state = self.shared.conf.lock();
            if slot >= state.table.raid_disks() {
                return Err(MirrorError::InvalidSlot(slot));
            }
            state
                .table
                .get(slot)
                .cloned()
                .ok_or(MirrorError::SlotEmpty(slot))?
        };
        if replica.is_faulty() {
            return Ok(());
        }
        if self.shared.mark_faulty(slot, &replica, "failed by operator") {
            Ok(())
        } else {
            Err(MirrorError::Rejected {
                slot,
                reason: "last working replica".to_string(),
            })
        }
    }

    /// Hot-add a replica; it serves no reads until a recovery pass rebuilds it
    pub fn add_replica(
        &self,
        device: Arc<dyn ReplicaDevice>,
        options: AddReplicaOptions,
    ) -> MirrorResult<SlotId> {
        let mut state = self.shared.conf.lock();
        if state.stopping {
            return Err(MirrorError::Stopped);
        }
        let slot = match options.slot {
            Some(slot) if slot >= state.table.raid_disks() => {
                return Err(MirrorError::InvalidSlot(slot));
            }
            Some(slot) if state.table.get(slot).is_some() => {
                return Err(MirrorError::SlotOccupied(slot));
            }
            Some(slot) => slot,
            None => state.table.first_empty().ok_or(MirrorError::NoFreeSlot)?,
        };
        if device.capacity() < state.size {
            return Err(MirrorError::Rejected {
                slot,
                reason: format!(
                    "{} holds {} sectors but the array needs {}",
                    device.name(),
                    device.capacity(),
                    state.size
                ),
            });
        }

        info!(
            "Array {}: adding {} in slot {}{}",
            self.shared.name(),
            device.name(),
            slot,
            if options.readd { " (re-add)" } else { "" }
        );
        state.table.insert(
            slot,
            Arc::new(Replica::new(device, false, options.write_mostly)),
        );
        if !options.readd {
            state.fullsync = true;
        }
        Ok(slot)
    }

    /// Remove a replica that is faulty or not yet rebuilt and has no I/O in flight
    pub fn remove_replica(&self, slot: SlotId) -> MirrorResult<Arc<dyn ReplicaDevice>> {
        let mut state = self.shared.conf.lock();
        if slot >= state.table.raid_disks() {
            return Err(MirrorError::InvalidSlot(slot));
        }
        let replica = state.table.get(slot).ok_or(MirrorError::SlotEmpty(slot))?;
        if replica.is_in_sync() || replica.pending() > 0 {
            return Err(MirrorError::Busy(slot));
        }
        if !replica.is_faulty() && self.shared.resync.is_running() {
            // Still a rebuild target
            return Err(MirrorError::Busy(slot));
        }
        let replica = state.table.remove(slot).ok_or(MirrorError::SlotEmpty(slot))?;
        info!(
            "Array {}: removed {} from slot {}",
            self.shared.name(),
            replica.name(),
            slot
        );
        Ok(Arc::clone(replica.device()))
    }

    /// Mark or unmark a replica as write-mostly; it then serves reads only
    /// when no other in-sync replica can
    pub fn set_write_mostly(&self, slot: SlotId, write_mostly: bool) -> MirrorResult<()> {
        let state = self.shared.conf.lock();
        if slot >= state.table.raid_disks() {
            return Err(MirrorError::InvalidSlot(slot));
        }
        let replica = state.table.get(slot).ok_or(MirrorError::SlotEmpty(slot))?;
        replica.set_write_mostly(write_mostly);
        info!(
            "Array {}: {} in slot {} is {}write-mostly",
            self.shared.name(),
            replica.name(),
            slot,
            if write_mostly { "" } else { "no longer " }
        );
        Ok(())
    }

    /// Change the usable size
    pub fn resize(&self, sectors: Sector) -> MirrorResult<()> {
        if sectors == 0 {
            return Err(MirrorError::InvalidRequest("array size is zero".to_string()));
        }
        let mut state = self.shared.conf.lock();
        if let Some((slot, replica)) = state
            .table
            .iter()
            .find(|(_, r)| !r.is_faulty() && r.device().capacity() < sectors)
        {
            return Err(MirrorError::Rejected {
                slot,
                reason: format!(
                    "{} holds only {} sectors",
                    replica.name(),
                    replica.device().capacity()
                ),
            });
        }

        let old = state.size;
        self.shared.tracker.resize(sectors);
        if sectors > old {
            // The new space was never mirrored
            state.recovery_cp = Some(state.recovery_cp.map_or(old, |cp| cp.min(old)));
        }
        state.size = sectors;
        info!(
            "Array {} resized from {} to {} sectors",
            self.shared.name(),
            old,
            sectors
        );
        Ok(())
    }

    /// Change the number of replica slots
    pub fn set_replica_count(&self, raid_disks: usize) -> MirrorResult<()> {
        if raid_disks == 0 {
            return Err(MirrorError::InvalidRequest(
                "an array needs at least one slot".to_string(),
            ));
        }
        if self.shared.resync.is_running() {
            return Err(MirrorError::ResyncRunning);
        }

        self.quiesce(true);
        let result = {
            let mut state = self.shared.conf.lock();
            let occupied = state
                .table
                .iter()
                .find(|(slot, _)| *slot >= raid_disks)
                .map(|(slot, _)| slot);
            match occupied {
                Some(slot) => Err(MirrorError::SlotOccupied(slot)),
                None => {
                    let old = state.table.raid_disks();
                    state.table.resize(raid_disks);
                    info!(
                        "Array {}: replica slots changed from {} to {}",
                        self.shared.name(),
                        old,
                        raid_disks
                    );
                    Ok(())
                }
            }
        };
        self.quiesce(false);
        result
    }

    /// Counter snapshot
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared.metrics.snapshot()
    }

    /// Metrics in Prometheus text format
    pub fn export_prometheus(&self) -> String {
        PrometheusExporter::default().export(&self.shared.metrics, &self.status())
    }

    /// Stop resync, drain in-flight I/O and stop the recovery thread
    pub fn shutdown(&self) {
        let Some(recovery) = self.recovery.lock().take() else {
            return;
        };

        self.shared.resync.interrupt();
        let _ = self.shared.wait_resync();

        // Drain client I/O, then let the recovery thread finish its queues
        self.shared.barrier.raise_barrier();
        self.shared.conf.lock().stopping = true;
        self.shared.wake.notify_all();
        if recovery.join().is_err() {
            warn!("Array {}: recovery thread panicked", self.shared.name());
        }
        self.shared.barrier.lower_barrier();
        info!("Array {} stopped", self.shared.name());
    }
}

impl Drop for MirrorArray {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for MirrorArray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MirrorArray")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{IoCompletion, IoResult, sync_io};
    use crate::memory::{CompletionMode, FaultMode, MemoryReplica};
    use crate::tracker::MemoryTracker;
    use mirrorio_common::SectorRange;
    use mirrorio_common::config::ResyncConfig;
    use rand::{Rng, RngCore};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;

    const SIZE: Sector = 1024;

    fn test_config(raid_disks: usize) -> ArrayConfig {
        ArrayConfig {
            raid_disks,
            assume_clean: true,
            resync: ResyncConfig {
                chunk_sectors: 64,
                page_sectors: 8,
                barrier_depth: 4,
                yield_interval_ms: 1,
            },
            ..ArrayConfig::default()
        }
    }

    fn pattern(sectors: u64, seed: u8) -> Bytes {
        Bytes::from(
            (0..sectors * 512)
                .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
                .collect::<Vec<u8>>(),
        )
    }

    fn replicas(count: usize) -> Vec<Arc<MemoryReplica>> {
        (0..count)
            .map(|i| Arc::new(MemoryReplica::new(format!("mem{i}"), SIZE)))
            .collect()
    }

    fn start(
        config: ArrayConfig,
        replicas: &[Arc<MemoryReplica>],
        tracker: &Arc<MemoryTracker>,
    ) -> MirrorArray {
        let specs = replicas
            .iter()
            .map(|r| ReplicaSpec::new(r.clone()))
            .collect();
        MirrorArray::start(config, specs, tracker.clone()).unwrap()
    }

    fn clean_mirror(count: usize) -> (MirrorArray, Vec<Arc<MemoryReplica>>, Arc<MemoryTracker>) {
        let replicas = replicas(count);
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 0));
        let array = start(test_config(count), &replicas, &tracker);
        (array, replicas, tracker)
    }

    fn wait_until(cond: impl Fn() -> bool) {
        for _ in 0..500 {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        panic!("condition not reached");
    }

    /// Holds completions until opened
    struct GatedReplica {
        inner: MemoryReplica,
        held: Mutex<Option<Vec<(IoCompletion, IoResult)>>>,
    }

    impl GatedReplica {
        fn new(name: &str) -> Self {
            Self {
                inner: MemoryReplica::new(name, SIZE),
                held: Mutex::new(None),
            }
        }

        fn close(&self) {
            *self.held.lock() = Some(Vec::new());
        }

        fn open(&self) {
            let held = self.held.lock().take().unwrap_or_default();
            for (done, result) in held {
                done(result);
            }
        }
    }

    impl ReplicaDevice for GatedReplica {
        fn name(&self) -> &str {
            self.inner.name()
        }

        fn capacity(&self) -> Sector {
            self.inner.capacity()
        }

        fn submit_io(&self, request: IoRequest, done: IoCompletion) {
            let result = sync_io(&self.inner, request);
            let mut held = self.held.lock();
            if let Some(held) = held.as_mut() {
                held.push((done, result));
                return;
            }
            drop(held);
            done(result);
        }
    }

    #[test]
    fn test_healthy_write_reaches_every_replica() {
        let (array, replicas, tracker) = clean_mirror(2);
        let data = pattern(8, 1);
        array.write(16, data.clone()).unwrap();

        for replica in &replicas {
            assert_eq!(replica.read_raw(16, 8), data.to_vec());
            assert_eq!(replica.request_count(Direction::Write), 1);
        }
        assert_eq!(tracker.writers_in_flight(), 0);
        assert_eq!(tracker.dirty_regions(), 0);
        assert_eq!(array.read(16, 8).unwrap(), data);

        let metrics = array.metrics();
        assert_eq!(metrics.writes, 1);
        assert_eq!(metrics.reads, 1);
        assert_eq!(metrics.write_bytes, 4096);
        assert_eq!(metrics.degraded_writes, 0);
    }

    #[test]
    fn test_degraded_write_marks_tracker() {
        let (array, replicas, tracker) = clean_mirror(2);
        array.fail_replica(1).unwrap();

        let data = pattern(8, 2);
        array.write(0, data.clone()).unwrap();
        assert_eq!(replicas[0].read_raw(0, 8), data.to_vec());
        assert_eq!(replicas[1].request_count(Direction::Write), 0);
        assert_eq!(tracker.dirty_regions(), 1);
        assert_eq!(array.metrics().degraded_writes, 1);
        assert_eq!(array.status().health_map(), "U_");
    }

    #[test]
    fn test_transient_read_error_retried() {
        let (array, replicas, _tracker) = clean_mirror(2);
        let data = pattern(8, 3);
        array.write(0, data.clone()).unwrap();
        replicas[0].fail_reads(SectorRange::new(0, 8), FaultMode::Once);

        assert_eq!(array.read(0, 8).unwrap(), data);
        let status = array.status();
        assert_eq!(status.working, 2);
        assert_eq!(status.replicas[0].read_errors, 1);
        assert_eq!(array.metrics().read_retries, 1);
    }

    #[test]
    fn test_deterministic_read_error_fails_replica() {
        let (array, replicas, _tracker) = clean_mirror(2);
        let data = pattern(8, 4);
        array.write(0, data.clone()).unwrap();
        replicas[0].fail_reads(SectorRange::new(0, 8), FaultMode::Persistent);

        assert_eq!(array.read(0, 8).unwrap(), data);
        let status = array.status();
        assert_eq!(status.replicas[0].state, ReplicaState::Faulty);
        assert_eq!(status.health_map(), "_U");
        assert_eq!(array.metrics().replicas_failed, 1);

        // Later reads never reach the failed replica
        let reads_before = replicas[0].request_count(Direction::Read);
        assert_eq!(array.read(0, 8).unwrap(), data);
        assert_eq!(replicas[0].request_count(Direction::Read), reads_before);
    }

    #[test]
    fn test_read_error_corrected_by_rewrite() {
        let (array, replicas, _tracker) = clean_mirror(2);
        let data = pattern(8, 5);
        array.write(0, data.clone()).unwrap();
        replicas[0].fail_reads(SectorRange::new(0, 8), FaultMode::UntilRewritten);

        assert_eq!(array.read(0, 8).unwrap(), data);
        let status = array.status();
        assert_eq!(status.working, 2);
        assert_eq!(status.replicas[0].corrected_errors, 8);
        assert_eq!(array.metrics().corrected_sectors, 8);
        assert!(sync_io(replicas[0].as_ref(), IoRequest::read(0, 8)).is_ok());
    }

    #[test]
    fn test_read_fails_when_every_replica_fails() {
        let (array, replicas, _tracker) = clean_mirror(2);
        for replica in &replicas {
            replica.fail_reads(SectorRange::new(32, 8), FaultMode::Persistent);
        }

        let err = array.read(32, 8).unwrap_err();
        assert!(matches!(err, MirrorError::Unrecoverable { sector: 32, .. }));
        // The last working replica is never failed
        assert_eq!(array.status().working, 1);
        assert_eq!(array.metrics().unrecoverable_reads, 1);
    }

    #[test]
    fn test_read_error_on_only_replica_is_reported() {
        let (array, replicas, _tracker) = clean_mirror(2);
        array.fail_replica(1).unwrap();
        replicas[0].fail_reads(SectorRange::new(0, 8), FaultMode::Once);

        assert!(array.read(0, 8).unwrap_err().is_io_error());
        assert_eq!(array.status().working, 1);
        assert_eq!(array.metrics().read_retries, 0);
    }

    #[test]
    fn test_clean_regions_skipped_without_io() {
        let replicas = replicas(2);
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 0));
        let mut config = test_config(2);
        config.assume_clean = false;
        let array = start(config, &replicas, &tracker);
        assert!(array.needs_resync());

        array.start_resync(ResyncKind::Resync).unwrap();
        let report = array.wait_resync().unwrap();
        assert!(report.completed);
        assert_eq!(report.synced_sectors, 0);
        assert_eq!(report.skipped_sectors, SIZE);
        for replica in &replicas {
            assert!(replica.requests().is_empty());
        }
        assert!(!array.needs_resync());
    }

    #[test]
    fn test_dirty_resync_converges() {
        let replicas = replicas(2);
        replicas[0].fill(0xAA);
        let tracker = Arc::new(MemoryTracker::new_dirty(SIZE, 64, 0));
        let mut config = test_config(2);
        config.assume_clean = false;
        let array = start(config, &replicas, &tracker);

        array.start_resync(ResyncKind::Resync).unwrap();
        let report = array.wait_resync().unwrap();
        assert!(report.completed);
        assert_eq!(report.synced_sectors, SIZE);
        assert_eq!(replicas[1].read_raw(0, SIZE), replicas[0].read_raw(0, SIZE));
        assert_eq!(tracker.dirty_regions(), 0);
        assert_eq!(array.metrics().resync_sectors, SIZE);
        assert_eq!(array.status().resync, None);
    }

    #[test]
    fn test_resync_source_read_error_repaired() {
        let replicas = replicas(2);
        replicas[0].fill(0xAA);
        replicas[0].fail_reads(SectorRange::new(16, 8), FaultMode::UntilRewritten);
        let tracker = Arc::new(MemoryTracker::new_dirty(SIZE, 64, 0));
        let mut config = test_config(2);
        config.assume_clean = false;
        let array = start(config, &replicas, &tracker);

        array.start_resync(ResyncKind::Resync).unwrap();
        let report = array.wait_resync().unwrap();
        assert!(report.completed);
        assert_eq!(report.synced_sectors, SIZE);
        // The unreadable page came from the other replica
        assert_eq!(replicas[0].read_raw(16, 8), vec![0u8; 4096]);
        assert_eq!(replicas[0].read_raw(0, SIZE), replicas[1].read_raw(0, SIZE));
        assert_eq!(array.metrics().corrected_sectors, 8);
        assert_eq!(array.status().working, 2);
    }

    #[test]
    fn test_resync_runs_alongside_write_burst() {
        let replicas: Vec<_> = (0..2)
            .map(|i| {
                Arc::new(
                    MemoryReplica::new(format!("mem{i}"), SIZE)
                        .with_completion(CompletionMode::Delayed(Duration::from_micros(200))),
                )
            })
            .collect();
        replicas[0].fill(0x55);
        let tracker = Arc::new(MemoryTracker::new_dirty(SIZE, 64, 0));
        let mut config = test_config(2);
        config.assume_clean = false;
        let array = Arc::new(start(config, &replicas, &tracker));

        array.start_resync(ResyncKind::Resync).unwrap();
        let writers: Vec<_> = (0..4u64)
            .map(|t| {
                let array = Arc::clone(&array);
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    // Each writer owns a disjoint quarter of the array
                    for _ in 0..40 {
                        let sector = t * 256 + rng.gen_range(0..32u64) * 8;
                        let mut buf = vec![0u8; 4096];
                        rng.fill_bytes(&mut buf);
                        array.write(sector, Bytes::from(buf)).unwrap();
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        assert!(array.wait_resync().unwrap().completed);

        array.start_resync(ResyncKind::Check).unwrap();
        let check = array.wait_resync().unwrap();
        assert!(check.completed);
        assert_eq!(check.mismatch_sectors, 0);
        assert_eq!(replicas[0].read_raw(0, SIZE), replicas[1].read_raw(0, SIZE));
    }

    #[test]
    fn test_check_counts_and_repair_fixes_mismatches() {
        let (array, replicas, _tracker) = clean_mirror(2);
        replicas[1].write_raw(70, &[0xFF; 512]);

        array.start_resync(ResyncKind::Check).unwrap();
        let check = array.wait_resync().unwrap();
        assert!(check.completed);
        assert_eq!(check.mismatch_sectors, 64);
        assert_eq!(replicas[1].read_raw(70, 1), vec![0xFF; 512]);

        array.start_resync(ResyncKind::Repair).unwrap();
        let repair = array.wait_resync().unwrap();
        assert_eq!(repair.mismatch_sectors, 64);
        assert_eq!(replicas[1].read_raw(0, SIZE), replicas[0].read_raw(0, SIZE));

        array.start_resync(ResyncKind::Check).unwrap();
        assert_eq!(array.wait_resync().unwrap().mismatch_sectors, 0);
        assert_eq!(array.metrics().mismatch_sectors, 128);
    }

    #[test]
    fn test_hot_added_replica_recovered() {
        let source = Arc::new(MemoryReplica::new("mem0", SIZE));
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 0));
        let array = start(test_config(2), &[source.clone()], &tracker);
        let data = pattern(8, 6);
        array.write(512, data.clone()).unwrap();
        assert_eq!(array.status().health_map(), "U_");

        let fresh = Arc::new(MemoryReplica::new("mem1", SIZE));
        let slot = array
            .add_replica(fresh.clone(), AddReplicaOptions::default())
            .unwrap();
        assert_eq!(slot, 1);
        assert!(array.needs_resync());
        assert_eq!(array.status().replicas[1].state, ReplicaState::Rebuilding);

        // Not in sync yet: reads stay on the source
        array.read(512, 8).unwrap();
        assert_eq!(fresh.request_count(Direction::Read), 0);

        array.start_resync(ResyncKind::Recovery).unwrap();
        let report = array.wait_resync().unwrap();
        assert!(report.completed);
        assert_eq!(report.synced_sectors, SIZE);
        assert_eq!(fresh.read_raw(512, 8), data.to_vec());
        assert_eq!(array.status().health_map(), "UU");
        assert!(!array.needs_resync());
    }

    #[test]
    fn test_readded_replica_copies_dirty_regions_only() {
        let (array, replicas, tracker) = clean_mirror(2);
        array.fail_replica(1).unwrap();
        array.write(128, pattern(8, 7)).unwrap();
        let old = array.remove_replica(1).unwrap();
        assert_eq!(old.name(), "mem1");

        replicas[1].clear_log();
        array
            .add_replica(
                replicas[1].clone(),
                AddReplicaOptions {
                    slot: Some(1),
                    readd: true,
                    ..AddReplicaOptions::default()
                },
            )
            .unwrap();
        array.start_resync(ResyncKind::Recovery).unwrap();
        let report = array.wait_resync().unwrap();
        assert!(report.completed);
        assert_eq!(report.synced_sectors, 64);
        assert_eq!(report.skipped_sectors, SIZE - 64);
        assert_eq!(replicas[1].read_raw(128, 8), replicas[0].read_raw(128, 8));
        assert_eq!(tracker.dirty_regions(), 0);
    }

    #[test]
    fn test_faulty_replica_never_used_again() {
        let (array, replicas, _tracker) = clean_mirror(3);
        array.fail_replica(2).unwrap();
        replicas[2].clear_log();

        for i in 0..20u64 {
            array.write(i * 8, pattern(8, i as u8)).unwrap();
            array.read(i * 8, 8).unwrap();
        }
        assert!(replicas[2].requests().is_empty());
        assert_eq!(array.status().working, 2);

        array.fail_replica(1).unwrap();
        let err = array.fail_replica(0).unwrap_err();
        assert!(matches!(err, MirrorError::Rejected { slot: 0, .. }));
        assert_eq!(array.status().health_map(), "U__");
    }

    #[test]
    fn test_behind_write_acknowledged_early() {
        let fast = Arc::new(MemoryReplica::new("fast", SIZE));
        let slow = Arc::new(GatedReplica::new("slow"));
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 4));
        let array = MirrorArray::start(
            test_config(2),
            vec![
                ReplicaSpec::new(fast.clone()),
                ReplicaSpec::new(slow.clone()).with_write_mostly(true),
            ],
            tracker.clone(),
        )
        .unwrap();

        slow.close();
        let (tx, rx) = mpsc::channel();
        array.submit(
            ClientIo::write(0, pattern(8, 8)),
            Box::new(move |result| {
                let _ = tx.send(result.is_ok());
            }),
        );
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        wait_until(|| array.metrics().early_acks == 1);
        assert_eq!(tracker.outstanding_behind_writes(), 1);

        slow.open();
        wait_until(|| tracker.outstanding_behind_writes() == 0);
        assert_eq!(slow.inner.read_raw(0, 8), fast.read_raw(0, 8));
    }

    #[test]
    fn test_behind_write_finishing_first_is_not_an_early_ack() {
        let fast = Arc::new(GatedReplica::new("fast"));
        let slow = Arc::new(MemoryReplica::new("slow", SIZE));
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 4));
        let array = MirrorArray::start(
            test_config(2),
            vec![
                ReplicaSpec::new(fast.clone()),
                ReplicaSpec::new(slow.clone()).with_write_mostly(true),
            ],
            tracker.clone(),
        )
        .unwrap();

        fast.close();
        let (tx, rx) = mpsc::channel();
        array.submit(
            ClientIo::write(0, pattern(8, 13)),
            Box::new(move |result| {
                let _ = tx.send(result.is_ok());
            }),
        );
        wait_until(|| slow.request_count(Direction::Write) == 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        fast.open();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        wait_until(|| tracker.outstanding_behind_writes() == 0);
        let metrics = array.metrics();
        assert_eq!(metrics.behind_writes, 1);
        assert_eq!(metrics.early_acks, 0);
    }

    #[test]
    fn test_write_waits_for_every_replica_without_write_behind() {
        let fast = Arc::new(MemoryReplica::new("fast", SIZE));
        let slow = Arc::new(GatedReplica::new("slow"));
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 0));
        let array = MirrorArray::start(
            test_config(2),
            vec![
                ReplicaSpec::new(fast.clone()),
                ReplicaSpec::new(slow.clone()).with_write_mostly(true),
            ],
            tracker.clone(),
        )
        .unwrap();

        slow.close();
        let (tx, rx) = mpsc::channel();
        array.submit(
            ClientIo::write(0, pattern(8, 9)),
            Box::new(move |result| {
                let _ = tx.send(result.is_ok());
            }),
        );
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        slow.open();
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        assert_eq!(array.metrics().early_acks, 0);
    }

    #[test]
    fn test_ordered_write_retried_without_ordering() {
        let (array, replicas, _tracker) = clean_mirror(2);
        replicas[1].set_ordered_supported(false);

        let data = pattern(8, 10);
        array.write_ordered(0, data.clone()).unwrap();
        assert_eq!(replicas[1].read_raw(0, 8), data.to_vec());
        let writes: Vec<_> = replicas[1]
            .requests()
            .into_iter()
            .filter(|r| r.direction == Direction::Write)
            .collect();
        assert_eq!(writes.len(), 2);
        assert!(writes[0].ordered);
        assert!(!writes[1].ordered);
        assert_eq!(array.metrics().ordered_retries, 1);
        assert_eq!(array.status().working, 2);

        // The replica is no longer asked for ordering
        array.write_ordered(8, pattern(8, 11)).unwrap();
        assert_eq!(array.metrics().ordered_retries, 1);
        assert!(!replicas[1].requests().last().unwrap().ordered);
        assert!(replicas[0].requests().last().unwrap().ordered);
    }

    #[test]
    fn test_every_request_completes_exactly_once() {
        let replicas: Vec<_> = (0..2)
            .map(|i| {
                Arc::new(
                    MemoryReplica::new(format!("mem{i}"), SIZE)
                        .with_completion(CompletionMode::Delayed(Duration::from_micros(100))),
                )
            })
            .collect();
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 0));
        let array = Arc::new(start(test_config(2), &replicas, &tracker));
        for sector in (0..SIZE).step_by(64) {
            replicas[0].fail_reads(SectorRange::new(sector, 1), FaultMode::Once);
        }

        let calls: Arc<Vec<AtomicU32>> = Arc::new((0..200).map(|_| AtomicU32::new(0)).collect());
        let (tx, rx) = mpsc::channel();
        let submitters: Vec<_> = (0..4usize)
            .map(|t| {
                let (array, calls, tx) = (Arc::clone(&array), Arc::clone(&calls), tx.clone());
                std::thread::spawn(move || {
                    let mut rng = rand::thread_rng();
                    for i in (t..200).step_by(4) {
                        let sector = rng.gen_range(0..(SIZE / 8)) * 8;
                        let io = if i % 2 == 0 {
                            ClientIo::read(sector, 8)
                        } else {
                            ClientIo::write(sector, pattern(8, i as u8))
                        };
                        let (calls, tx) = (Arc::clone(&calls), tx.clone());
                        array.submit(
                            io,
                            Box::new(move |result| {
                                calls[i].fetch_add(1, Ordering::SeqCst);
                                let _ = tx.send(result.is_ok());
                            }),
                        );
                    }
                })
            })
            .collect();
        for submitter in submitters {
            submitter.join().unwrap();
        }
        drop(tx);

        let results: Vec<bool> = (0..200)
            .map(|_| rx.recv_timeout(Duration::from_secs(10)).unwrap())
            .collect();
        assert!(results.iter().all(|ok| *ok));
        assert!(calls.iter().all(|c| c.load(Ordering::SeqCst) == 1));
        wait_until(|| {
            array.shared.pool.in_use() == 0 && array.shared.barrier.snapshot().pending == 0
        });
    }

    #[test]
    fn test_read_repair_with_exhausted_request_pool() {
        let replicas: Vec<_> = (0..2)
            .map(|i| {
                Arc::new(
                    MemoryReplica::new(format!("mem{i}"), SIZE)
                        .with_completion(CompletionMode::Delayed(Duration::from_millis(20))),
                )
            })
            .collect();
        replicas[0].fail_reads(SectorRange::new(0, 8), FaultMode::Once);
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 0));
        let mut config = test_config(2);
        config.max_requests = 1;
        let array = Arc::new(start(config, &replicas, &tracker));

        let (tx, rx) = mpsc::channel();
        let readers: Vec<_> = [0u64, 64]
            .into_iter()
            .map(|sector| {
                let (array, tx) = (Arc::clone(&array), tx.clone());
                let reader = std::thread::spawn(move || {
                    let _ = tx.send(array.read(sector, 8).is_ok());
                });
                // The second reader waits for the only request context
                std::thread::sleep(Duration::from_millis(5));
                reader
            })
            .collect();

        for _ in 0..2 {
            assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(array.metrics().read_retries, 1);
        wait_until(|| array.shared.pool.in_use() == 0);
    }

    #[test]
    fn test_write_mostly_replica_skipped_for_reads() {
        let (array, replicas, _tracker) = clean_mirror(2);
        array.set_write_mostly(0, true).unwrap();
        assert!(array.status().to_string().contains("mem0[0](W)"));
        replicas[0].clear_log();

        for i in 0..16u64 {
            array.read((i * 40) % (SIZE - 8), 8).unwrap();
        }
        assert_eq!(replicas[0].request_count(Direction::Read), 0);

        // Still readable when it is the only in-sync copy
        array.fail_replica(1).unwrap();
        array.read(0, 8).unwrap();
        assert_eq!(replicas[0].request_count(Direction::Read), 1);

        assert!(matches!(
            array.set_write_mostly(5, false),
            Err(MirrorError::InvalidSlot(5))
        ));
    }

    #[test]
    fn test_resync_point_moves_past_clean_regions() {
        let source = Arc::new(GatedReplica::new("src"));
        let target = Arc::new(MemoryReplica::new("dst", SIZE));
        source.inner.fill(0x3C);
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 0));
        tracker.mark_dirty(0);
        let mut config = test_config(2);
        config.assume_clean = false;
        let array = MirrorArray::start(
            config,
            vec![ReplicaSpec::new(source.clone()), ReplicaSpec::new(target.clone())],
            tracker.clone(),
        )
        .unwrap();

        source.close();
        array.start_resync(ResyncKind::Resync).unwrap();
        // The dirty chunk is still in flight while the clean regions are passed
        wait_until(|| array.shared.conf.lock().next_resync == Some(SIZE));
        assert_eq!(tracker.dirty_regions(), 1);

        source.open();
        let report = array.wait_resync().unwrap();
        assert!(report.completed);
        assert_eq!(report.synced_sectors, 64);
        assert_eq!(report.skipped_sectors, SIZE - 64);
        assert_eq!(target.read_raw(0, 64), source.inner.read_raw(0, 64));
        assert_eq!(target.read_raw(64, 1), vec![0u8; 512]);
        assert_eq!(array.shared.conf.lock().next_resync, None);
    }

    #[test]
    fn test_rejects_invalid_requests() {
        let (array, _replicas, _tracker) = clean_mirror(2);
        assert!(matches!(
            array.read(SIZE - 4, 8),
            Err(MirrorError::OutOfBounds { .. })
        ));
        assert!(matches!(
            array.read(0, 0),
            Err(MirrorError::InvalidRequest(_))
        ));
        let misaligned = ClientIo {
            sectors: 2,
            ..ClientIo::write(0, Bytes::from(vec![0u8; 100]))
        };
        let (tx, rx) = mpsc::channel();
        array.submit(
            misaligned,
            Box::new(move |result| {
                let _ = tx.send(result);
            }),
        );
        assert!(matches!(
            rx.recv().unwrap(),
            Err(MirrorError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_replica_lifecycle_rules() {
        let (array, _replicas, _tracker) = clean_mirror(2);
        assert!(matches!(array.remove_replica(0), Err(MirrorError::Busy(0))));
        assert!(matches!(
            array.add_replica(Arc::new(MemoryReplica::new("x", SIZE)), AddReplicaOptions::default()),
            Err(MirrorError::NoFreeSlot)
        ));

        array.set_replica_count(3).unwrap();
        let small = Arc::new(MemoryReplica::new("small", SIZE / 2));
        assert!(matches!(
            array.add_replica(small, AddReplicaOptions::default()),
            Err(MirrorError::Rejected { slot: 2, .. })
        ));
        assert!(matches!(
            array.set_replica_count(1),
            Err(MirrorError::SlotOccupied(1))
        ));

        array.fail_replica(1).unwrap();
        array.remove_replica(1).unwrap();
        assert!(matches!(array.remove_replica(1), Err(MirrorError::SlotEmpty(1))));
        assert_eq!(array.status().raid_disks, 3);
        assert_eq!(array.status().health_map(), "U__");
    }

    #[test]
    fn test_resize_marks_new_space_unsynced() {
        let replicas: Vec<_> = (0..2)
            .map(|i| Arc::new(MemoryReplica::new(format!("mem{i}"), SIZE * 2)))
            .collect();
        let tracker = Arc::new(MemoryTracker::new_clean(SIZE, 64, 0));
        let mut config = test_config(2);
        config.size_sectors = Some(SIZE);
        let array = start(config, &replicas, &tracker);
        assert!(!array.needs_resync());

        assert!(matches!(
            array.resize(SIZE * 4),
            Err(MirrorError::Rejected { .. })
        ));
        array.resize(SIZE * 2).unwrap();
        assert_eq!(array.size(), SIZE * 2);
        assert!(array.needs_resync());

        array.start_resync(ResyncKind::Resync).unwrap();
        let report = array.wait_resync().unwrap();
        assert!(report.completed);
        assert_eq!(report.synced_sectors, SIZE);
        assert!(!array.needs_resync());
    }

    #[test]
    fn test_status_display() {
        let (array, _replicas, _tracker) = clean_mirror(2);
        array.fail_replica(1).unwrap();
        let text = array.status().to_string();
        assert!(text.starts_with("md0 : active raid1 mem0[0] mem1[1](F)"));
        assert!(text.contains("512 blocks [2/1] [U_]"));
        assert!(array.export_prometheus().contains("mirrorio_array_working_replicas{array=\"md0\"} 1"));
    }

    #[test]
    fn test_shutdown_rejects_new_io() {
        let (array, _replicas, _tracker) = clean_mirror(2);
        array.write(0, pattern(8, 12)).unwrap();
        array.shutdown();
        assert!(matches!(array.read(0, 8), Err(MirrorError::Stopped)));
        assert!(matches!(
            array.start_resync(ResyncKind::Check),
            Err(MirrorError::Stopped)
        ));
        // Idempotent
        array.shutdown();
    }

    #[test]
    fn test_quiesce_blocks_client_io() {
        let (array, _replicas, _tracker) = clean_mirror(2);
        let array = Arc::new(array);
        array.quiesce(true);

        let reader = {
            let array = Arc::clone(&array);
            std::thread::spawn(move || array.read(0, 8).is_ok())
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!reader.is_finished());
        assert_eq!(array.shared.barrier.snapshot().waiting, 1);
        array.quiesce(false);
        assert!(reader.join().unwrap());
    }
}
