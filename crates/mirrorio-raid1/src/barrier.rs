//! Admission barrier between client I/O and resync I/O
//!
//! Client requests hold a `pending` reference from admission to retirement.
//! A resync chunk raises the barrier, which stops new admissions and waits for
//! every admitted request to retire before the chunk's I/O is issued. Up to
//! `depth` chunks may hold the barrier at once.
//!
//! Freezing is stronger: it waits until the only admitted requests left are
//! those parked on the retry list plus the one the caller is repairing.

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

/// Interval between deferred-queue flushes while freezing
const FREEZE_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Default)]
struct BarrierState {
    barrier: u32,
    pending: u32,
    waiting: u32,
    queued: u32,
    frozen: bool,
}

/// Point-in-time barrier counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarrierSnapshot {
    /// Resync chunks holding the barrier
    pub barrier: u32,
    /// Admitted client requests
    pub pending: u32,
    /// Client requests blocked on admission
    pub waiting: u32,
    /// Admitted client requests parked on the retry list
    pub queued: u32,
    /// A freeze is in progress
    pub frozen: bool,
}

/// Admission barrier
pub struct Barrier {
    state: Mutex<BarrierState>,
    cond: Condvar,
    depth: u32,
}

impl Barrier {
    /// Create a barrier allowing `depth` concurrent resync chunks
    #[must_use]
    pub fn new(depth: u32) -> Self {
        Self {
            state: Mutex::new(BarrierState::default()),
            cond: Condvar::new(),
            depth: depth.max(1),
        }
    }

    /// Admit a client request, blocking while resync holds the barrier
    pub fn wait_barrier(&self) {
        let mut state = self.state.lock();
        if state.barrier > 0 || state.frozen {
            state.waiting += 1;
            while state.barrier > 0 || state.frozen {
                self.cond.wait(&mut state);
            }
            state.waiting -= 1;
        }
        state.pending += 1;
    }

    /// Retire a client request
    pub fn allow_barrier(&self) {
        let mut state = self.state.lock();
        state.pending = state.pending.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }

    /// Take the barrier for one resync chunk
    pub fn raise_barrier(&self) {
        let mut state = self.state.lock();
        while state.waiting > 0 || state.frozen {
            self.cond.wait(&mut state);
        }
        state.barrier += 1;
        while state.pending > 0 || state.barrier >= self.depth + 1 {
            self.cond.wait(&mut state);
        }
        trace!("Barrier raised ({} held)", state.barrier);
    }

    /// Release the barrier held by one resync chunk
    pub fn lower_barrier(&self) {
        let mut state = self.state.lock();
        state.barrier = state.barrier.saturating_sub(1);
        drop(state);
        self.cond.notify_all();
    }

    /// Client requests are blocked on admission
    pub fn has_waiters(&self) -> bool {
        self.state.lock().waiting > 0
    }

    /// Wait until no admitted request is in flight outside the retry list,
    /// except the caller's own. `flush` dispatches deferred writes and runs
    /// without the barrier lock held.
    pub fn freeze(&self, mut flush: impl FnMut()) {
        let mut state = self.state.lock();
        state.frozen = true;
        while state.pending != state.queued + 1 {
            MutexGuard::unlocked(&mut state, &mut flush);
            if state.pending == state.queued + 1 {
                break;
            }
            self.cond.wait_for(&mut state, FREEZE_POLL);
        }
        trace!(
            "Array frozen (pending {}, queued {})",
            state.pending, state.queued
        );
    }

    /// Resume admissions after a freeze
    pub fn unfreeze(&self) {
        let mut state = self.state.lock();
        state.frozen = false;
        drop(state);
        self.cond.notify_all();
    }

    /// An admitted client request was parked on the retry list
    pub fn note_queued(&self) {
        let mut state = self.state.lock();
        state.queued += 1;
        drop(state);
        self.cond.notify_all();
    }

    /// An admitted client request was taken off the retry list
    pub fn note_dequeued(&self) {
        let mut state = self.state.lock();
        state.queued = state.queued.saturating_sub(1);
    }

    /// Wait until no resync chunk holds the barrier
    pub fn wait_idle(&self) {
        let mut state = self.state.lock();
        while state.barrier > 0 {
            self.cond.wait(&mut state);
        }
    }

    /// Current counters
    pub fn snapshot(&self) -> BarrierSnapshot {
        let state = self.state.lock();
        BarrierSnapshot {
            barrier: state.barrier,
            pending: state.pending,
            waiting: state.waiting,
            queued: state.queued,
            frozen: state.frozen,
        }
    }
}

impl std::fmt::Debug for Barrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Barrier")
            .field("depth", &self.depth)
            .field("state", &self.snapshot())
            .finish()
    }
}
