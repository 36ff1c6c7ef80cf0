//! Recovery thread
//!
//! One thread per array drains the deferred-write queue and works through the
//! retry list: failed reads are repaired and redirected, writes rejected for
//! the ordering primitive are resubmitted without it, and resync chunks whose
//! reads have completed are written back.

use crate::array::{ArrayShared, Dispatch};
use crate::device::{IoRequest, sync_io};
use crate::error::MirrorError;
use crate::metrics::ArrayMetrics;
use crate::replica::Replica;
use crate::request::{RequestContext, RequestFlag, RequestState, SubRole};

use bytes::{Bytes, BytesMut};
use mirrorio_common::{Direction, SectorRange, SlotId};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{debug, error, info, warn};

impl ArrayShared {
    /// Recovery thread main loop; returns once the array is stopping and both
    /// queues are empty
    pub(crate) fn run_recovery(self: Arc<Self>) {
        debug!("Array {}: recovery thread started", self.name());
        loop {
            let (batch, item) = {
                let mut state = self.conf.lock();
                while state.deferred.is_empty() && state.retry.is_empty() {
                    if state.stopping {
                        debug!("Array {}: recovery thread exiting", self.name());
                        return;
                    }
                    self.wake.wait(&mut state);
                }
                let batch: Vec<Dispatch> = state.deferred.drain(..).collect();
                let item = state.retry.pop_front();
                if item.as_ref().is_some_and(|ctx| !ctx.is_sync()) {
                    self.barrier.note_dequeued();
                }
                (batch, item)
            };

            if !batch.is_empty() {
                self.tracker.unplug();
                for dispatch in batch {
                    self.dispatch(dispatch);
                }
            }
            if let Some(ctx) = item {
                self.handle_retry(ctx);
            }
        }
    }

    fn handle_retry(self: &Arc<Self>, ctx: Arc<RequestContext>) {
        if ctx.is_sync() {
            self.sync_write_back(ctx);
        } else if ctx.direction == Direction::Write {
            self.retry_unordered(ctx);
        } else {
            self.handle_read_error(ctx);
        }
    }

    fn replica_at(&self, slot: SlotId) -> Option<Arc<Replica>> {
        self.conf.lock().table.get(slot).cloned()
    }

    /// In-sync replicas in slot order starting at `first`, wrapping around
    fn readable_from(&self, first: SlotId) -> Vec<(SlotId, Arc<Replica>)> {
        let state = self.conf.lock();
        let slots = state.table.raid_disks();
        (0..slots)
            .map(|i| (first + i) % slots.max(1))
            .filter_map(|slot| {
                state
                    .table
                    .get(slot)
                    .filter(|r| r.is_readable())
                    .map(|r| (slot, Arc::clone(r)))
            })
            .collect()
    }

    /// Repair after a failed client read, then redirect it to another replica
    fn handle_read_error(self: &Arc<Self>, ctx: Arc<RequestContext>) {
        let slot = ctx.read_slot();
        if let Some(replica) = self.replica_at(slot) {
            if replica.read_errors() > self.config.max_read_errors {
                warn!(
                    "Array {}: {} exceeded {} read errors",
                    self.name(),
                    replica.name(),
                    self.config.max_read_errors
                );
                self.mark_faulty(slot, &replica, "too many read errors");
            } else if !replica.is_faulty() && ctx.transition(RequestState::Repairing) {
                let shared = Arc::clone(self);
                self.barrier.freeze(move || shared.flush_deferred());
                self.fix_read_error(slot, ctx.range);
                self.barrier.unfreeze();
            }
        }

        ctx.set_role(slot, SubRole::Blocked, None);
        let dispatch = {
            let mut state = self.conf.lock();
            self.choose_replica(&mut state, &ctx).and_then(|next| {
                let replica = Arc::clone(state.table.get(next)?);
                replica.inc_pending();
                ctx.set_role(next, SubRole::Read, Some(Arc::clone(&replica)));
                ctx.set_read_slot(next);
                Some(Dispatch {
                    ctx: Arc::clone(&ctx),
                    slot: next,
                    replica,
                    request: IoRequest::read(ctx.range.start, ctx.range.sectors),
                })
            })
        };

        match dispatch {
            Some(dispatch) => {
                info!(
                    "Array {}: redirecting sectors {} to {}",
                    self.name(),
                    ctx.range,
                    dispatch.replica.name()
                );
                ctx.remaining.store(1, Ordering::Release);
                ctx.transition(RequestState::Dispatched);
                self.dispatch(dispatch);
            }
            None => {
                error!(
                    "Array {}: unrecoverable read error at sectors {}",
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

    /// Synchronously repair a range one page at a time: find a replica that
    /// can read each page, rewrite the page to every other in-sync replica and
    /// read it back. Must be called with the array frozen.
    pub(crate) fn fix_read_error(&self, read_slot: SlotId, range: SectorRange) {
        let page_sectors = self.config.resync.page_sectors;
        for page in range.split(page_sectors) {
            let candidates = self.readable_from(read_slot);
            let mut failed: Vec<SlotId> = Vec::new();
            let mut source = None;
            for (slot, replica) in &candidates {
                match sync_io(
                    replica.device().as_ref(),
                    IoRequest::read(page.start, page.sectors),
                ) {
                    Ok(data) => {
                        source = Some((*slot, data));
                        break;
                    }
                    Err(_) => failed.push(*slot),
                }
            }

            let Some((good, data)) = source else {
                // Unreadable everywhere: the replica that reported it goes
                if let Some(replica) = self.replica_at(read_slot) {
                    self.mark_faulty(read_slot, &replica, "unrecoverable read error");
                }
                return;
            };

            for (slot, replica) in candidates.iter().filter(|(s, _)| *s != good) {
                if replica.is_faulty() {
                    continue;
                }
                let rewritten = sync_io(
                    replica.device().as_ref(),
                    IoRequest::write(page.start, data.clone()),
                )
                .and_then(|_| {
                    sync_io(
                        replica.device().as_ref(),
                        IoRequest::read(page.start, page.sectors),
                    )
                });
                match rewritten {
                    Ok(_) => {
                        if failed.contains(slot) {
                            info!(
                                "Array {}: read error corrected ({} sectors at {} on {})",
                                self.name(),
                                page.sectors,
                                page.start,
                                replica.name()
                            );
                            replica.add_corrected(page.sectors);
                            ArrayMetrics::add(&self.metrics.corrected_sectors, page.sectors);
                        }
                    }
                    Err(err) => {
                        warn!(
                            "Array {}: rewrite of sectors {} on {} failed: {}",
                            self.name(),
                            page,
                            replica.name(),
                            err
                        );
                        self.mark_faulty(*slot, replica, "read error not correctable");
                    }
                }
            }
        }
    }

    /// Resubmit a write without the ordering primitive to every participant
    /// that is still working
    fn retry_unordered(self: &Arc<Self>, ctx: Arc<RequestContext>) {
        ArrayMetrics::inc(&self.metrics.ordered_retries);
        ctx.flags.clear(RequestFlag::Ordered);

        let targets: Vec<(SlotId, Arc<Replica>, bool)> = ctx
            .subs
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.role == SubRole::Write)
            .filter_map(|(slot, s)| {
                s.replica
                    .as_ref()
                    .filter(|r| !r.is_faulty())
                    .map(|r| (slot, Arc::clone(r), s.behind))
            })
            .collect();

        if targets.is_empty() {
            let result = if ctx.flags.test(RequestFlag::Uptodate) {
                Ok(Bytes::new())
            } else {
                Err(MirrorError::NoWorkingReplica {
                    sector: ctx.range.start,
                    sectors: ctx.range.sectors,
                })
            };
            let behind = ctx.flags.test(RequestFlag::BehindIo);
            self.tracker.end_write(ctx.range.start, ctx.range.sectors, false, behind);
            self.release_behind_copy(&ctx);
            self.complete(&ctx, result);
            return;
        }

        debug!(
            "Array {}: retrying sectors {} without ordering on {} replicas",
            self.name(),
            ctx.range,
            targets.len()
        );
        let behind_copy = ctx.behind_copy.lock().clone();
        let behind_targets = targets.iter().filter(|(_, _, behind)| *behind).count() as u32;
        ctx.behind_remaining.store(behind_targets, Ordering::Release);
        ctx.remaining.store(targets.len() as u32, Ordering::Release);
        ctx.transition(RequestState::Dispatched);

        for (slot, replica, behind) in targets {
            replica.inc_pending();
            let payload = match (&behind_copy, behind) {
                (Some(copy), true) => copy.clone(),
                _ => ctx.data.clone(),
            };
            self.dispatch(Dispatch {
                ctx: Arc::clone(&ctx),
                slot,
                replica,
                request: IoRequest::write(ctx.range.start, payload),
            });
        }
    }

    /// Write a resync chunk's data to every replica that needs it
    fn sync_write_back(self: &Arc<Self>, ctx: Arc<RequestContext>) {
        let Some(chunk) = ctx.sync else {
            return;
        };

        if !ctx.flags.test(RequestFlag::Uptodate) && !self.fix_sync_read_error(&ctx) {
            error!(
                "Array {}: unrecoverable read error during {} at sectors {}",
                self.name(),
                chunk.kind,
                ctx.range
            );
            self.tracker.abort_sync(ctx.range.start, ctx.range.sectors);
            self.resync.interrupt();
            ctx.transition(RequestState::Completed);
            self.barrier.lower_barrier();
            return;
        }

        let targets: Vec<(SlotId, Arc<Replica>)>;
        let data: Bytes;
        {
            let subs = ctx.subs.lock();
            let primary = subs.iter().enumerate().find_map(|(slot, s)| {
                (s.role == SubRole::Read && !s.failed)
                    .then(|| s.data.clone().map(|d| (slot, d)))
                    .flatten()
            });
            let Some((primary, primary_data)) = primary else {
                drop(subs);
                self.tracker.abort_sync(ctx.range.start, ctx.range.sectors);
                ctx.transition(RequestState::Completed);
                self.barrier.lower_barrier();
                return;
            };
            data = primary_data;

            let mut chosen = Vec::new();
            for (slot, sub) in subs.iter().enumerate() {
                let Some(replica) = sub.replica.as_ref() else {
                    continue;
                };
                if replica.is_faulty() || slot == primary {
                    continue;
                }
                match sub.role {
                    SubRole::Write => chosen.push((slot, Arc::clone(replica))),
                    SubRole::Read if chunk.requested => {
                        let matches = !sub.failed && sub.data.as_ref() == Some(&data);
                        if !matches {
                            if !sub.failed {
                                ArrayMetrics::add(
                                    &self.metrics.mismatch_sectors,
                                    ctx.range.sectors,
                                );
                                self.resync
                                    .mismatches
                                    .fetch_add(ctx.range.sectors, Ordering::AcqRel);
                            }
                            if chunk.kind.writes_mismatches() {
                                chosen.push((slot, Arc::clone(replica)));
                            }
                        }
                    }
                    _ => {}
                }
            }
            targets = chosen;
        }

        if targets.is_empty() {
            self.finish_sync_chunk(&ctx);
            return;
        }

        ctx.remaining.store(targets.len() as u32, Ordering::Release);
        ctx.transition(RequestState::Dispatched);
        for (slot, replica) in targets {
            replica.inc_pending();
            ctx.set_role(slot, SubRole::Write, None);
            self.dispatch(Dispatch {
                ctx: Arc::clone(&ctx),
                slot,
                replica,
                request: IoRequest::write(ctx.range.start, data.clone()),
            });
        }
    }

    /// Rebuild a chunk whose source read failed, page by page from any
    /// in-sync replica, rewriting each page to the readers that cannot read it.
    /// Returns false if some page is unreadable everywhere.
    fn fix_sync_read_error(&self, ctx: &RequestContext) -> bool {
        let read_slot = ctx.read_slot();
        let failed_readers: Vec<(SlotId, Arc<Replica>)> = ctx
            .subs
            .lock()
            .iter()
            .enumerate()
            .filter(|(_, s)| s.role == SubRole::Read && s.failed)
            .filter_map(|(slot, s)| s.replica.clone().map(|r| (slot, r)))
            .collect();

        let mut buf = BytesMut::with_capacity(ctx.range.bytes() as usize);
        for page in ctx.range.split(self.config.resync.page_sectors) {
            let mut page_failed: Vec<SlotId> = Vec::new();
            let mut page_data = None;
            for (slot, replica) in self.readable_from(read_slot) {
                match sync_io(
                    replica.device().as_ref(),
                    IoRequest::read(page.start, page.sectors),
                ) {
                    Ok(data) => {
                        page_data = Some(data);
                        break;
                    }
                    Err(_) => page_failed.push(slot),
                }
            }
            let Some(page_data) = page_data else {
                error!(
                    "Array {}: sectors {} unreadable on every replica",
                    self.name(),
                    page
                );
                return false;
            };

            for (slot, replica) in &failed_readers {
                if replica.is_faulty() || !page_failed.contains(slot) {
                    continue;
                }
                let rewritten = sync_io(
                    replica.device().as_ref(),
                    IoRequest::write(page.start, page_data.clone()),
                )
                .and_then(|_| {
                    sync_io(
                        replica.device().as_ref(),
                        IoRequest::read(page.start, page.sectors),
                    )
                });
                match rewritten {
                    Ok(_) => {
                        replica.add_corrected(page.sectors);
                        ArrayMetrics::add(&self.metrics.corrected_sectors, page.sectors);
                    }
                    Err(err) => {
                        warn!(
                            "Array {}: rewrite of sectors {} on {} failed: {}",
                            self.name(),
                            page,
                            replica.name(),
                            err
                        );
                        self.mark_faulty(*slot, replica, "resync read error not correctable");
                    }
                }
            }
            buf.extend_from_slice(&page_data);
        }

        let data = buf.freeze();
        let mut subs = ctx.subs.lock();
        for (slot, _) in &failed_readers {
            if let Some(sub) = subs.get_mut(*slot) {
                sub.failed = false;
                sub.data = Some(data.clone());
            }
        }
        drop(subs);
        ctx.flags.set(RequestFlag::Uptodate);
        true
    }
}
