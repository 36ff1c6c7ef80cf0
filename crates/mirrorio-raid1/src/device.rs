//! Replica transport interface
//!
//! A [`ReplicaDevice`] accepts sub-requests asynchronously and reports each
//! one through a completion callback that fires exactly once. The engine never
//! calls `submit_io` while holding one of its own locks, so implementations are
//! free to complete inline on the submitting thread.

use crate::error::DeviceError;

use bytes::Bytes;
use mirrorio_common::{Direction, Sector, SectorRange, sectors_to_bytes};
use std::fmt;

/// A single sub-request addressed to one replica
#[derive(Clone, PartialEq, Eq)]
pub struct IoRequest {
    /// Read or write
    pub direction: Direction,
    /// First sector
    pub sector: Sector,
    /// Number of sectors
    pub sectors: u64,
    /// Payload for writes (empty for reads)
    pub data: Bytes,
    /// Request the ordering primitive (write-through with flush semantics)
    pub ordered: bool,
}

impl IoRequest {
    /// Create a read request
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

    /// Create a write request; the payload must be sector aligned
    #[must_use]
    pub fn write(sector: Sector, data: Bytes) -> Self {
        let sectors = data.len() as u64 / mirrorio_common::SECTOR_SIZE;
        Self {
            direction: Direction::Write,
            sector,
            sectors,
            data,
            ordered: false,
        }
    }

    /// Set the ordering flag
    #[must_use]
    pub const fn with_ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Sector range covered by the request
    #[must_use]
    pub const fn range(&self) -> SectorRange {
        SectorRange::new(self.sector, self.sectors)
    }

    /// Length in bytes
    #[must_use]
    pub const fn len_bytes(&self) -> u64 {
        sectors_to_bytes(self.sectors)
    }
}

impl fmt::Debug for IoRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRequest")
            .field("direction", &self.direction)
            .field("sector", &self.sector)
            .field("sectors", &self.sectors)
            .field("ordered", &self.ordered)
            .finish_non_exhaustive()
    }
}

/// Outcome of a sub-request: read data (empty for writes) or a transport error
pub type IoResult = Result<Bytes, DeviceError>;

/// Completion callback for a sub-request
pub type IoCompletion = Box<dyn FnOnce(IoResult) + Send + 'static>;

/// A backing store that mirrors the array's data
pub trait ReplicaDevice: Send + Sync {
    /// Human-readable name (path, device node, test label)
    fn name(&self) -> &str;

    /// Capacity in sectors
    fn capacity(&self) -> Sector;

    /// Submit a sub-request; `done` must be invoked exactly once
    fn submit_io(&self, request: IoRequest, done: IoCompletion);
}

impl fmt::Debug for dyn ReplicaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplicaDevice")
            .field("name", &self.name())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Submit a request and block until it completes
///
/// Used by the recovery thread for synchronous repair. Must not be called from
/// within an async runtime.
pub fn sync_io(device: &dyn ReplicaDevice, request: IoRequest) -> IoResult {
    let (tx, rx) = tokio::sync::oneshot::channel();
    device.submit_io(
        request,
        Box::new(move |result| {
            let _ = tx.send(result);
        }),
    );
    rx.blocking_recv()
        .unwrap_or_else(|_| Err(DeviceError::Offline("completion dropped".to_string())))
}
