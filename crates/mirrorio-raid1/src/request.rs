//! Request contexts
//!
//! Every client I/O and every resync chunk is tracked by a [`RequestContext`]
//! from admission until its aggregated result has been reported and all of its
//! sub-requests have completed. Contexts are shared between completion
//! callbacks and the recovery thread through an `Arc`.

use crate::error::MirrorResult;
use crate::replica::Replica;
use crate::resync::ResyncKind;

use bytes::Bytes;
use mirrorio_common::{Direction, SectorRange, SlotId};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::time::Instant;
use tracing::error;

/// Callback receiving a client request's result; read data for reads
pub type ClientCompletion = Box<dyn FnOnce(MirrorResult<Bytes>) + Send + 'static>;

/// Request state flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestFlag {
    /// At least one replica holds the data
    Uptodate = 1 << 0,
    /// Some replica missed the write
    Degraded = 1 << 1,
    /// Write-mostly replicas got a private payload copy
    BehindIo = 1 << 2,
    /// The client has been told the result
    Returned = 1 << 3,
    /// Resync chunk
    IsSync = 1 << 4,
    /// A replica rejected the ordering primitive
    OrderedWriteRetry = 1 << 5,
    /// The client asked for the ordering primitive
    Ordered = 1 << 6,
}

/// Atomic set of [`RequestFlag`]s
#[derive(Debug, Default)]
pub struct RequestFlags(AtomicU8);

impl RequestFlags {
    /// Empty flag set
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Set a flag, returning whether it was already set
    pub fn set(&self, flag: RequestFlag) -> bool {
        self.0.fetch_or(flag as u8, Ordering::AcqRel) & flag as u8 != 0
    }

    /// Clear a flag, returning whether it was set
    pub fn clear(&self, flag: RequestFlag) -> bool {
        self.0.fetch_and(!(flag as u8), Ordering::AcqRel) & flag as u8 != 0
    }

    /// Check a flag
    pub fn test(&self, flag: RequestFlag) -> bool {
        self.0.load(Ordering::Acquire) & flag as u8 != 0
    }
}

/// Lifecycle of a request context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Admitted, no sub-request issued yet
    Admitted,
    /// Sub-requests are in flight
    Dispatched,
    /// Parked on the retry list for the recovery thread
    AwaitingRetry,
    /// Synchronous repair in progress
    Repairing,
    /// Result reported and resources released
    Completed,
}

impl RequestState {
    /// Check whether moving to `next` is legal
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Admitted, Self::Dispatched)
                | (Self::Admitted, Self::Completed)
                | (Self::Dispatched, Self::Completed)
                | (Self::Dispatched, Self::AwaitingRetry)
                | (Self::AwaitingRetry, Self::Repairing)
                | (Self::AwaitingRetry, Self::Dispatched)
                | (Self::AwaitingRetry, Self::Completed)
                | (Self::Repairing, Self::Dispatched)
                | (Self::Repairing, Self::Completed)
        )
    }
}

/// Role of one replica slot within a request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SubRole {
    /// Not participating
    #[default]
    Absent,
    /// Failed a read for this request and must not be chosen again
    Blocked,
    /// Source of data
    Read,
    /// Destination of data
    Write,
}

#[derive(Default)]
pub(crate) struct SubRequest {
    pub(crate) role: SubRole,
    pub(crate) replica: Option<Arc<Replica>>,
    /// Data returned by a sync read
    pub(crate) data: Option<Bytes>,
    /// The sub-request failed
    pub(crate) failed: bool,
    /// Carries the write-behind copy
    pub(crate) behind: bool,
}

/// Resync chunk parameters
#[derive(Debug, Clone, Copy)]
pub(crate) struct SyncChunk {
    pub(crate) kind: ResyncKind,
    /// Every in-sync replica is read and compared
    pub(crate) requested: bool,
}

/// Per-request state shared by the router, completion handlers and the
/// recovery thread
pub(crate) struct RequestContext {
    pub(crate) direction: Direction,
    pub(crate) range: SectorRange,
    /// Write payload
    pub(crate) data: Bytes,
    /// Private payload copy for write-mostly replicas
    pub(crate) behind_copy: Mutex<Option<Bytes>>,
    pub(crate) flags: RequestFlags,
    state: Mutex<RequestState>,
    /// Sub-requests still outstanding
    pub(crate) remaining: AtomicU32,
    /// Behind sub-requests still outstanding
    pub(crate) behind_remaining: AtomicU32,
    read_slot: AtomicUsize,
    pub(crate) subs: Mutex<Vec<SubRequest>>,
    completion: Mutex<Option<ClientCompletion>>,
    permit: Mutex<Option<RequestPermit>>,
    pub(crate) sync: Option<SyncChunk>,
    pub(crate) started: Instant,
}

impl RequestContext {
    /// Context for a client request
    pub(crate) fn client(
        direction: Direction,
        range: SectorRange,
        data: Bytes,
        ordered: bool,
        raid_disks: usize,
        completion: ClientCompletion,
        permit: RequestPermit,
    ) -> Self {
        let ctx = Self::with_parts(direction, range, data, raid_disks, None);
        if ordered {
            ctx.flags.set(RequestFlag::Ordered);
        }
        *ctx.completion.lock() = Some(completion);
        *ctx.permit.lock() = Some(permit);
        ctx
    }

    /// Context for a resync chunk
    pub(crate) fn sync(range: SectorRange, raid_disks: usize, chunk: SyncChunk) -> Self {
        let ctx = Self::with_parts(Direction::Read, range, Bytes::new(), raid_disks, Some(chunk));
        ctx.flags.set(RequestFlag::IsSync);
        ctx
    }

    fn with_parts(
        direction: Direction,
        range: SectorRange,
        data: Bytes,
        raid_disks: usize,
        sync: Option<SyncChunk>,
    ) -> Self {
        Self {
            direction,
            range,
            data,
            behind_copy: Mutex::new(None),
            flags: RequestFlags::new(),
            state: Mutex::new(RequestState::Admitted),
            remaining: AtomicU32::new(0),
            behind_remaining: AtomicU32::new(0),
            read_slot: AtomicUsize::new(0),
            subs: Mutex::new((0..raid_disks).map(|_| SubRequest::default()).collect()),
            completion: Mutex::new(None),
            permit: Mutex::new(None),
            sync,
            started: Instant::now(),
        }
    }

    pub(crate) fn is_sync(&self) -> bool {
        self.flags.test(RequestFlag::IsSync)
    }

    pub(crate) fn state(&self) -> RequestState {
        *self.state.lock()
    }

    /// Move to `next`, returning false (and leaving the state alone) if the
    /// transition is illegal
    pub(crate) fn transition(&self, next: RequestState) -> bool {
        let mut state = self.state.lock();
        if state.can_transition_to(next) {
            *state = next;
            true
        } else {
            error!(
                "Illegal request transition {:?} -> {:?} for sectors {}",
                *state, next, self.range
            );
            false
        }
    }

    pub(crate) fn read_slot(&self) -> SlotId {
        self.read_slot.load(Ordering::Acquire)
    }

    pub(crate) fn set_read_slot(&self, slot: SlotId) {
        self.read_slot.store(slot, Ordering::Release);
    }

    /// Assign a role to a slot, recording the replica it borrows
    pub(crate) fn set_role(&self, slot: SlotId, role: SubRole, replica: Option<Arc<Replica>>) {
        let mut subs = self.subs.lock();
        if slot >= subs.len() {
            subs.resize_with(slot + 1, SubRequest::default);
        }
        let sub = &mut subs[slot];
        sub.role = role;
        if replica.is_some() {
            sub.replica = replica;
        }
    }

    pub(crate) fn role(&self, slot: SlotId) -> SubRole {
        self.subs.lock().get(slot).map_or(SubRole::Absent, |s| s.role)
    }

    /// Slots that failed a read for this request
    pub(crate) fn blocked_slots(&self) -> Vec<bool> {
        self.subs
            .lock()
            .iter()
            .map(|s| s.role == SubRole::Blocked)
            .collect()
    }

    /// Report the result to the client, at most once
    pub(crate) fn report(&self, result: MirrorResult<Bytes>) -> bool {
        if self.flags.set(RequestFlag::Returned) {
            return false;
        }
        let done = self.completion.lock().take();
        match done {
            Some(done) => {
                done(result);
                true
            }
            None => false,
        }
    }

    /// Give back the pool permit
    pub(crate) fn release_permit(&self) -> bool {
        self.permit.lock().take().is_some()
    }
}

/// Bounded pool of client request contexts
#[derive(Debug)]
pub struct RequestPool {
    in_use: Mutex<usize>,
    cond: Condvar,
    capacity: usize,
}

impl RequestPool {
    /// Pool allowing `capacity` contexts at once
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            in_use: Mutex::new(0),
            cond: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Take a permit, blocking while the pool is exhausted
    pub fn acquire(self: &Arc<Self>) -> RequestPermit {
        let mut in_use = self.in_use.lock();
        while *in_use >= self.capacity {
            self.cond.wait(&mut in_use);
        }
        *in_use += 1;
        RequestPermit {
            pool: Arc::clone(self),
        }
    }

    /// Permits currently held
    pub fn in_use(&self) -> usize {
        *self.in_use.lock()
    }

    /// Maximum permits
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    fn release(&self) {
        let mut in_use = self.in_use.lock();
        *in_use = in_use.saturating_sub(1);
        drop(in_use);
        self.cond.notify_one();
    }
}

/// Pool permit, returned on drop
#[derive(Debug)]
pub struct RequestPermit {
    pool: Arc<RequestPool>,
}

impl Drop for RequestPermit {
    fn drop(&mut self) {
        self.pool.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn client_ctx(pool: &Arc<RequestPool>, done: ClientCompletion) -> RequestContext {
        RequestContext::client(
            Direction::Read,
            SectorRange::new(0, 8),
            Bytes::new(),
            false,
            2,
            done,
            pool.acquire(),
        )
    }

    #[test]
    fn test_flags_set_returns_previous() {
        let flags = RequestFlags::new();
        assert!(!flags.set(RequestFlag::Uptodate));
        assert!(flags.set(RequestFlag::Uptodate));
        assert!(flags.test(RequestFlag::Uptodate));
        assert!(!flags.test(RequestFlag::Degraded));
        assert!(flags.clear(RequestFlag::Uptodate));
        assert!(!flags.clear(RequestFlag::Uptodate));
    }

    #[test]
    fn test_state_transitions() {
        use RequestState::*;
        assert!(Admitted.can_transition_to(Dispatched));
        assert!(Dispatched.can_transition_to(AwaitingRetry));
        assert!(AwaitingRetry.can_transition_to(Repairing));
        assert!(Repairing.can_transition_to(Dispatched));
        assert!(!Completed.can_transition_to(Dispatched));
        assert!(!Completed.can_transition_to(Completed));
        assert!(!Admitted.can_transition_to(Repairing));
    }

    #[test]
    fn test_completed_entered_once() {
        let pool = Arc::new(RequestPool::new(1));
        let ctx = client_ctx(&pool, Box::new(|_| {}));
        assert!(ctx.transition(RequestState::Dispatched));
        assert!(ctx.transition(RequestState::Completed));
        assert!(!ctx.transition(RequestState::Completed));
        assert_eq!(ctx.state(), RequestState::Completed);
    }

    #[test]
    fn test_report_exactly_once() {
        let pool = Arc::new(RequestPool::new(1));
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let ctx = client_ctx(
            &pool,
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert!(ctx.report(Ok(Bytes::new())));
        assert!(!ctx.report(Ok(Bytes::new())));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pool_blocks_when_exhausted() {
        let pool = Arc::new(RequestPool::new(1));
        let permit = pool.acquire();
        assert_eq!(pool.in_use(), 1);

        let waiter = {
            let pool = Arc::clone(&pool);
            thread::spawn(move || {
                let _permit = pool.acquire();
            })
        };
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());
        drop(permit);
        waiter.join().unwrap();
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_roles_and_blocked() {
        let ctx = RequestContext::sync(
            SectorRange::new(0, 128),
            3,
            SyncChunk {
                kind: ResyncKind::Check,
                requested: true,
            },
        );
        assert!(ctx.is_sync());
        ctx.set_role(1, SubRole::Blocked, None);
        ctx.set_role(2, SubRole::Read, None);
        assert_eq!(ctx.role(0), SubRole::Absent);
        assert_eq!(ctx.blocked_slots(), vec![false, true, false]);
        assert_eq!(ctx.role(7), SubRole::Absent);
    }
}
