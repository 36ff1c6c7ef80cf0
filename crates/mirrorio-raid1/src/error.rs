//! Mirror engine error types

use mirrorio_common::{Sector, SlotId};
use thiserror::Error;

/// Error reported by a replica transport for a single sub-request
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Unreadable or unwritable media at the given sector
    #[error("media error at sector {sector}")]
    Media { sector: Sector },

    /// The replica rejected the ordering (FUA/flush) primitive
    #[error("ordered writes not supported")]
    OrderingUnsupported,

    /// The replica is gone or has been failed
    #[error("replica offline: {0}")]
    Offline(String),

    /// Request outside the replica's capacity
    #[error("sector {sector} + {sectors} exceeds replica capacity {capacity}")]
    OutOfRange {
        sector: Sector,
        sectors: u64,
        capacity: u64,
    },

    /// Any other transport failure
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for DeviceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

/// Mirror engine error
#[derive(Error, Debug)]
pub enum MirrorError {
    /// Every replica that could serve the range has failed
    #[error("I/O error: no replica could serve sectors {sector}+{sectors}")]
    Unrecoverable { sector: Sector, sectors: u64 },

    /// A write reached no working replica
    #[error("I/O error: no working replica for sectors {sector}+{sectors}")]
    NoWorkingReplica { sector: Sector, sectors: u64 },

    /// Request beyond the end of the array
    #[error("sectors {sector}+{sectors} exceed array size {size}")]
    OutOfBounds {
        sector: Sector,
        sectors: u64,
        size: Sector,
    },

    /// Malformed request
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Slot index beyond the replica table
    #[error("slot {0} is out of range")]
    InvalidSlot(SlotId),

    /// Slot already holds a replica
    #[error("slot {0} is occupied")]
    SlotOccupied(SlotId),

    /// Slot holds no replica
    #[error("slot {0} is empty")]
    SlotEmpty(SlotId),

    /// No free slot for a hot-added replica
    #[error("no free replica slot")]
    NoFreeSlot,

    /// Replica is still in use
    #[error("replica in slot {0} is busy")]
    Busy(SlotId),

    /// Replica refused because it cannot be failed or resized
    #[error("replica in slot {slot} rejected: {reason}")]
    Rejected { slot: SlotId, reason: String },

    /// A resync pass is already running
    #[error("resync already running")]
    ResyncRunning,

    /// The array is shutting down
    #[error("array is stopped")]
    Stopped,

    /// Configuration error
    #[error(transparent)]
    Config(#[from] mirrorio_common::Error),

    /// Transport error surfaced directly (synchronous paths)
    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl MirrorError {
    /// Check if this is a data-path I/O failure (as opposed to a usage error)
    #[must_use]
    pub const fn is_io_error(&self) -> bool {
        matches!(
            self,
            Self::Unrecoverable { .. } | Self::NoWorkingReplica { .. } | Self::Device(_)
        )
    }
}

/// Result type for mirror operations
pub type MirrorResult<T> = Result<T, MirrorError>;
