//! Sub-request completion handling
//!
//! Completions may run on any thread, including the submitting one. Each
//! handler updates the per-replica state, folds the outcome into the request
//! context, and whichever completion drives the outstanding count to zero
//! finishes the request or hands it to the recovery thread.

use crate::array::ArrayShared;
use crate::device::IoResult;
use crate::error::{DeviceError, MirrorError};
use crate::metrics::ArrayMetrics;
use crate::replica::Replica;
use crate::request::{RequestContext, RequestFlag, RequestState};

use bytes::Bytes;
use mirrorio_common::SlotId;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tracing::{error, warn};

impl ArrayShared {
    fn sub_replica(&self, ctx: &RequestContext, slot: SlotId) -> Option<Arc<Replica>> {
        ctx.subs.lock().get(slot).and_then(|s| s.replica.clone())
    }

    pub(crate) fn end_read(self: &Arc<Self>, ctx: Arc<RequestContext>, slot: SlotId, result: IoResult) {
        let Some(replica) = self.sub_replica(&ctx, slot) else {
            error!("Array {}: read completion for empty slot {}", self.name(), slot);
            return;
        };
        replica.set_head_position(ctx.range.end());

        match result {
            Ok(data) => {
                ctx.flags.set(RequestFlag::Uptodate);
                replica.dec_pending();
                self.complete(&ctx, Ok(data));
            }
            Err(err) => {
                let others = {
                    let state = self.conf.lock();
                    state
                        .table
                        .iter()
                        .filter(|(s, r)| *s != slot && r.is_readable())
                        .count()
                };
                replica.dec_pending();

                if others == 0 {
                    // Only working replica: nothing to retry against
                    error!(
                        "Array {}: read error on {} at sectors {}: {}",
                        self.name(),
                        replica.name(),
                        ctx.range,
                        err
                    );
                    ArrayMetrics::inc(&self.metrics.unrecoverable_reads);
                    self.complete(
                        &ctx,
                        Err(MirrorError::Unrecoverable {
                            sector: ctx.range.start,
                            sectors: ctx.range.sectors,
                        }),
                    );
                    return;
                }

                let errors = replica.note_read_error();
                warn!(
                    "Array {}: read error on {} at sectors {} ({} errors): {}",
                    self.name(),
                    replica.name(),
                    ctx.range,
                    errors,
                    err
                );
                ArrayMetrics::inc(&self.metrics.read_retries);
                if ctx.transition(RequestState::AwaitingRetry) {
                    self.queue_retry(ctx);
                }
            }
        }
    }

    pub(crate) fn end_write(self: &Arc<Self>, ctx: Arc<RequestContext>, slot: SlotId, result: IoResult) {
        let Some(replica) = self.sub_replica(&ctx, slot) else {
            error!("Array {}: write completion for empty slot {}", self.name(), slot);
            return;
        };
        replica.set_head_position(ctx.range.end());

        match result {
            Err(DeviceError::OrderingUnsupported) => {
                warn!(
                    "Array {}: {} rejected an ordered write, disabling ordering for it",
                    self.name(),
                    replica.name()
                );
                replica.set_no_ordered();
                ctx.flags.set(RequestFlag::OrderedWriteRetry);
            }
            Err(err) => {
                error!(
                    "Array {}: write error on {} at sectors {}: {}",
                    self.name(),
                    replica.name(),
                    ctx.range,
                    err
                );
                self.mark_faulty(slot, &replica, "write error");
                ctx.flags.set(RequestFlag::Degraded);
            }
            Ok(_) => {
                ctx.flags.set(RequestFlag::Uptodate);
            }
        }

        if ctx.flags.test(RequestFlag::BehindIo) {
            let carries_copy = ctx.subs.lock().get(slot).is_some_and(|s| s.behind);
            if carries_copy {
                let _ = ctx
                    .behind_remaining
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
            }
            // Everything still outstanding is write-behind: acknowledge now
            let remaining = ctx.remaining.load(Ordering::Acquire);
            if ctx.behind_remaining.load(Ordering::Acquire) >= remaining.saturating_sub(1)
                && ctx.flags.test(RequestFlag::Uptodate)
                && ctx.report(Ok(Bytes::new()))
                && remaining > 1
            {
                ArrayMetrics::inc(&self.metrics.early_acks);
            }
        }

        replica.dec_pending();
        if ctx.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.write_done(ctx);
        }
    }

    /// Last write completion for a client request
    fn write_done(self: &Arc<Self>, ctx: Arc<RequestContext>) {
        if ctx.flags.clear(RequestFlag::OrderedWriteRetry) {
            if ctx.transition(RequestState::AwaitingRetry) {
                self.queue_retry(ctx);
            }
            return;
        }

        let behind = ctx.flags.test(RequestFlag::BehindIo);
        let degraded = ctx.flags.test(RequestFlag::Degraded);
        self.tracker
            .end_write(ctx.range.start, ctx.range.sectors, !degraded, behind);
        if behind {
            self.release_behind_copy(&ctx);
        }
        if degraded {
            ArrayMetrics::inc(&self.metrics.degraded_writes);
        }

        let result = if ctx.flags.test(RequestFlag::Uptodate) {
            Ok(Bytes::new())
        } else {
            Err(MirrorError::NoWorkingReplica {
                sector: ctx.range.start,
                sectors: ctx.range.sectors,
            })
        };
        self.complete(&ctx, result);
    }

    pub(crate) fn end_sync_read(
        self: &Arc<Self>,
        ctx: Arc<RequestContext>,
        slot: SlotId,
        result: IoResult,
    ) {
        let Some(replica) = self.sub_replica(&ctx, slot) else {
            return;
        };
        replica.set_head_position(ctx.range.end());

        {
            let mut subs = ctx.subs.lock();
            if let Some(sub) = subs.get_mut(slot) {
                match result {
                    Ok(data) => {
                        sub.data = Some(data);
                        ctx.flags.set(RequestFlag::Uptodate);
                    }
                    Err(err) => {
                        warn!(
                            "Array {}: resync read error on {} at sectors {}: {}",
                            self.name(),
                            replica.name(),
                            ctx.range,
                            err
                        );
                        sub.failed = true;
                    }
                }
            }
        }

        replica.dec_pending();
        if ctx.remaining.fetch_sub(1, Ordering::AcqRel) == 1
            && ctx.transition(RequestState::AwaitingRetry)
        {
            self.queue_retry(ctx);
        }
    }

    pub(crate) fn end_sync_write(
        self: &Arc<Self>,
        ctx: Arc<RequestContext>,
        slot: SlotId,
        result: IoResult,
    ) {
        let Some(replica) = self.sub_replica(&ctx, slot) else {
            return;
        };
        replica.set_head_position(ctx.range.end());

        if let Err(err) = result {
            error!(
                "Array {}: resync write error on {} at sectors {}: {}",
                self.name(),
                replica.name(),
                ctx.range,
                err
            );
            self.mark_faulty(slot, &replica, "resync write error");
            ctx.flags.set(RequestFlag::Degraded);
        }

        replica.dec_pending();
        if ctx.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finish_sync_chunk(&ctx);
        }
    }

    /// Fail a replica. Refused for the last working in-sync replica, in which
    /// case the array keeps running without redundancy.
    pub(crate) fn mark_faulty(&self, slot: SlotId, replica: &Replica, reason: &str) -> bool {
        let working = {
            let state = self.conf.lock();
            if replica.is_readable() && state.table.working_count() <= 1 {
                warn!(
                    "Array {}: not failing {} in slot {} ({}): last working replica",
                    self.name(),
                    replica.name(),
                    slot,
                    reason
                );
                return false;
            }
            if !replica.set_faulty() {
                return false;
            }
            state.table.working_count()
        };

        error!(
            "Array {}: disk failure on {} in slot {} ({}), disabling device. Operation continuing on {} devices",
            self.name(),
            replica.name(),
            slot,
            reason,
            working
        );
        ArrayMetrics::inc(&self.metrics.replicas_failed);
        self.resync.interrupt();
        true
    }
}
