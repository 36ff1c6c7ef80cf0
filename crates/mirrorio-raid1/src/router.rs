//! Request routing
//!
//! Admits client requests through the barrier, places reads with the balancer
//! and fans writes out to every working replica. Writes are queued for the
//! recovery thread rather than dispatched under the config lock.

use crate::array::{ArrayShared, ArrayState, ClientIo, Dispatch};
use crate::balancer::{ReadPlan, ReplicaView, choose_read_replica};
use crate::device::{IoRequest, IoResult};
use crate::error::{DeviceError, MirrorError};
use crate::metrics::ArrayMetrics;
use crate::request::{ClientCompletion, RequestContext, RequestFlag, RequestState, SubRole};

use bytes::Bytes;
use mirrorio_common::{Direction, SECTOR_SIZE, SectorRange, SlotId};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace};

impl ArrayShared {
    /// Admit and route a client request
    pub(crate) fn submit(self: &Arc<Self>, io: ClientIo, done: ClientCompletion) {
        if let Err(err) = self.validate(&io) {
            done(Err(err));
            return;
        }

        // Pool waiters must not count as pending, or a freeze could wait on
        // a caller that needs the permit of the request being repaired
        let permit = self.pool.acquire();
        self.barrier.wait_barrier();
        if self.conf.lock().stopping {
            self.barrier.allow_barrier();
            drop(permit);
            done(Err(MirrorError::Stopped));
            return;
        }

        let range = SectorRange::new(io.sector, io.sectors);
        let ctx = Arc::new(RequestContext::client(
            io.direction,
            range,
            io.data,
            io.ordered,
            self.raid_disks(),
            done,
            permit,
        ));

        match io.direction {
            Direction::Read => {
                ArrayMetrics::inc(&self.metrics.reads);
                self.submit_read(ctx);
            }
            Direction::Write => {
                ArrayMetrics::inc(&self.metrics.writes);
                self.submit_write(ctx);
            }
        }
    }

    fn validate(&self, io: &ClientIo) -> Result<(), MirrorError> {
        if io.sectors == 0 {
            return Err(MirrorError::InvalidRequest("zero-length request".to_string()));
        }
        if io.direction == Direction::Write && io.data.len() as u64 != io.sectors * SECTOR_SIZE {
            return Err(MirrorError::InvalidRequest(format!(
                "payload of {} bytes for {} sectors",
                io.data.len(),
                io.sectors
            )));
        }
        let state = self.conf.lock();
        if state.stopping {
            return Err(MirrorError::Stopped);
        }
        let range = SectorRange::new(io.sector, io.sectors);
        if range.end() > state.size {
            return Err(MirrorError::OutOfBounds {
                sector: io.sector,
                sectors: io.sectors,
                size: state.size,
            });
        }
        Ok(())
    }

    /// Run the balancer for a context, honoring slots it has already failed on
    pub(crate) fn choose_replica(
        &self,
        state: &mut ArrayState,
        ctx: &RequestContext,
    ) -> Option<SlotId> {
        let blocked = ctx.blocked_slots();
        let views: Vec<Option<ReplicaView>> = (0..state.table.raid_disks())
            .map(|slot| {
                state.table.get(slot).map(|r| ReplicaView {
                    in_sync: r.is_readable(),
                    write_mostly: r.is_write_mostly(),
                    blocked: blocked.get(slot).copied().unwrap_or(false),
                    pending: r.pending(),
                    head_position: r.head_position(),
                })
            })
            .collect();
        let plan = ReadPlan {
            range: ctx.range,
            resync_window: state
                .recovery_cp
                .map(|cp| state.next_resync.unwrap_or(cp)),
        };
        choose_read_replica(&views, &mut state.cursor, &plan)
    }

    /// Place a read on a replica and dispatch it, or fail the request
    pub(crate) fn submit_read(self: &Arc<Self>, ctx: Arc<RequestContext>) {
        let dispatch = {
            let mut state = self.conf.lock();
            self.choose_replica(&mut state, &ctx).and_then(|slot| {
                let replica = Arc::clone(state.table.get(slot)?);
                replica.inc_pending();
                ctx.set_role(slot, SubRole::Read, Some(Arc::clone(&replica)));
                ctx.set_read_slot(slot);
                Some(Dispatch {
                    ctx: Arc::clone(&ctx),
                    slot,
                    replica,
                    request: IoRequest::read(ctx.range.start, ctx.range.sectors),
                })
            })
        };

        match dispatch {
            Some(dispatch) => {
                ctx.remaining.store(1, Ordering::Release);
                ctx.transition(RequestState::Dispatched);
                self.dispatch(dispatch);
            }
            None => {
                error!(
                    "Array {}: no replica available to read sectors {}",
                    self.name(),
                    ctx.range
                );
                ArrayMetrics::inc(&self.metrics.unrecoverable_reads);
                self.complete(
                    &ctx,
                    Err(MirrorError::Unrecoverable {
                        sector: ctx.range.start,
                        sectors: ctx.range.sectors,
                    }),
                );
            }
        }
    }

    /// Fan a write out to every working replica via the deferred queue
    pub(crate) fn submit_write(self: &Arc<Self>, ctx: Arc<RequestContext>) {
        let mut state = self.conf.lock();
        let participants: Vec<_> = state
            .table
            .iter()
            .filter(|(_, r)| !r.is_faulty())
            .map(|(slot, r)| (slot, Arc::clone(r)))
            .collect();

        if participants.is_empty() {
            drop(state);
            error!(
                "Array {}: no working replica for write at sectors {}",
                self.name(),
                ctx.range
            );
            self.complete(
                &ctx,
                Err(MirrorError::NoWorkingReplica {
                    sector: ctx.range.start,
                    sectors: ctx.range.sectors,
                }),
            );
            return;
        }
        if participants.len() < state.table.raid_disks() {
            ctx.flags.set(RequestFlag::Degraded);
        }

        let write_mostly = participants
            .iter()
            .filter(|(_, r)| r.is_write_mostly())
            .count() as u32;
        let behind = write_mostly > 0
            && self.tracker.outstanding_behind_writes() < self.tracker.max_behind_writes()
            && self.reserve_behind_copy(ctx.data.len() as u64);
        if behind {
            ctx.flags.set(RequestFlag::BehindIo);
            *ctx.behind_copy.lock() = Some(Bytes::copy_from_slice(&ctx.data));
            ctx.behind_remaining.store(write_mostly, Ordering::Release);
            ArrayMetrics::inc(&self.metrics.behind_writes);
        }

        self.tracker
            .begin_write(ctx.range.start, ctx.range.sectors, behind);
        ctx.remaining
            .store(participants.len() as u32, Ordering::Release);

        let ordered = ctx.flags.test(RequestFlag::Ordered);
        let behind_copy = ctx.behind_copy.lock().clone();
        for (slot, replica) in participants {
            replica.inc_pending();
            let carries_copy = behind && replica.is_write_mostly();
            let payload = match (&behind_copy, carries_copy) {
                (Some(copy), true) => copy.clone(),
                _ => ctx.data.clone(),
            };
            ctx.set_role(slot, SubRole::Write, Some(Arc::clone(&replica)));
            ctx.subs.lock()[slot].behind = carries_copy;
            let request = IoRequest::write(ctx.range.start, payload)
                .with_ordered(ordered && !replica.is_no_ordered());
            state.deferred.push_back(Dispatch {
                ctx: Arc::clone(&ctx),
                slot,
                replica,
                request,
            });
        }
        ctx.transition(RequestState::Dispatched);
        drop(state);
        self.wake.notify_one();
    }

    /// Hand a sub-request to its replica. Must not be called with the config
    /// lock held.
    pub(crate) fn dispatch(self: &Arc<Self>, dispatch: Dispatch) {
        let Dispatch {
            ctx,
            slot,
            replica,
            request,
        } = dispatch;

        if replica.is_faulty() {
            trace!(
                "Array {}: slot {} is faulty, failing sub-request for sectors {}",
                self.name(),
                slot,
                ctx.range
            );
            self.end_io(
                ctx,
                slot,
                request.direction,
                Err(DeviceError::Offline(replica.name().to_string())),
            );
            return;
        }

        let shared = Arc::clone(self);
        let direction = request.direction;
        replica.device().submit_io(
            request,
            Box::new(move |result| shared.end_io(ctx, slot, direction, result)),
        );
    }

    /// Queue every deferred write for dispatch
    pub(crate) fn flush_deferred(self: &Arc<Self>) {
        let batch: Vec<Dispatch> = self.conf.lock().deferred.drain(..).collect();
        if batch.is_empty() {
            return;
        }
        self.tracker.unplug();
        for dispatch in batch {
            self.dispatch(dispatch);
        }
    }

    /// Park a context for the recovery thread
    pub(crate) fn queue_retry(&self, ctx: Arc<RequestContext>) {
        let client = !ctx.is_sync();
        let mut state = self.conf.lock();
        state.retry.push_back(ctx);
        if client {
            self.barrier.note_queued();
        }
        drop(state);
        self.wake.notify_one();
    }

    /// Report the final result, release the permit and retire from the barrier
    pub(crate) fn complete(&self, ctx: &RequestContext, result: Result<Bytes, MirrorError>) {
        if !ctx.transition(RequestState::Completed) {
            return;
        }
        let elapsed = ctx.started.elapsed().as_micros() as u64;
        match ctx.direction {
            Direction::Read => {
                if let Ok(data) = &result {
                    ArrayMetrics::add(&self.metrics.read_bytes, data.len() as u64);
                }
                self.metrics.read_latency.record(elapsed);
            }
            Direction::Write => {
                if result.is_ok() {
                    ArrayMetrics::add(&self.metrics.write_bytes, ctx.range.bytes());
                }
                self.metrics.write_latency.record(elapsed);
            }
        }
        ctx.report(result);
        if ctx.release_permit() {
            self.barrier.allow_barrier();
        }
        debug!(
            "Array {}: {} of sectors {} retired",
            self.name(),
            ctx.direction,
            ctx.range
        );
    }

    fn reserve_behind_copy(&self, bytes: u64) -> bool {
        let budget = self.config.write_behind.max_copy_bytes;
        self.behind_bytes
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                (held + bytes <= budget).then_some(held + bytes)
            })
            .is_ok()
    }

    pub(crate) fn release_behind_copy(&self, ctx: &RequestContext) {
        if ctx.behind_copy.lock().take().is_some() {
            let bytes = ctx.data.len() as u64;
            let _ = self
                .behind_bytes
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |held| {
                    Some(held.saturating_sub(bytes))
                });
        }
    }

    /// Route a sub-request completion to its handler
    pub(crate) fn end_io(
        self: &Arc<Self>,
        ctx: Arc<RequestContext>,
        slot: SlotId,
        direction: Direction,
        result: IoResult,
    ) {
        match (ctx.is_sync(), direction) {
            (false, Direction::Read) => self.end_read(ctx, slot, result),
            (false, Direction::Write) => self.end_write(ctx, slot, result),
            (true, Direction::Read) => self.end_sync_read(ctx, slot, result),
            (true, Direction::Write) => self.end_sync_write(ctx, slot, result),
        }
    }
}
