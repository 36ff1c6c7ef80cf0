//! Core type definitions for MirrorIO
//!
//! Addresses are expressed in 512-byte sectors throughout. Replicas are
//! addressed by their slot index in the replica table.

use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Sector size in bytes (standard 512-byte sectors)
pub const SECTOR_SIZE: u64 = 512;

/// Sector address within an array or replica
pub type Sector = u64;

/// Index of a replica slot in the replica table
pub type SlotId = usize;

/// Convert a sector count to bytes
#[must_use]
pub const fn sectors_to_bytes(sectors: u64) -> u64 {
    sectors * SECTOR_SIZE
}

/// Convert a byte length to sectors, returning `None` if it is not sector aligned
#[must_use]
pub const fn bytes_to_sectors(bytes: u64) -> Option<u64> {
    if bytes % SECTOR_SIZE == 0 {
        Some(bytes / SECTOR_SIZE)
    } else {
        None
    }
}

/// Unique identifier for a mirror array
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, From, Into, Display)]
#[display("{_0}")]
pub struct ArrayId(Uuid);

impl ArrayId {
    /// Generate a new random array ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ArrayId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ArrayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArrayId({})", self.0)
    }
}

/// Direction of an I/O request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    /// Get the direction as a lowercase string (for logs and labels)
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A contiguous run of sectors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SectorRange {
    /// First sector of the range
    pub start: Sector,
    /// Number of sectors in the range
    pub sectors: u64,
}

impl SectorRange {
    /// Create a new sector range
    #[must_use]
    pub const fn new(start: Sector, sectors: u64) -> Self {
        Self { start, sectors }
    }

    /// One past the last sector of the range
    #[must_use]
    pub const fn end(&self) -> Sector {
        self.start + self.sectors
    }

    /// Length of the range in bytes
    #[must_use]
    pub const fn bytes(&self) -> u64 {
        sectors_to_bytes(self.sectors)
    }

    /// Check if the range is empty
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.sectors == 0
    }

    /// Check if a sector falls inside the range
    #[must_use]
    pub const fn contains(&self, sector: Sector) -> bool {
        sector >= self.start && sector < self.end()
    }

    /// Check if two ranges share at least one sector
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end() && other.start < self.end()
    }

    /// Split the range into consecutive pieces of at most `max_sectors`
    pub fn split(&self, max_sectors: u64) -> impl Iterator<Item = SectorRange> + '_ {
        assert!(max_sectors > 0, "split size must be positive");
        let end = self.end();
        let mut next = self.start;
        std::iter::from_fn(move || {
            if next >= end {
                return None;
            }
            let sectors = max_sectors.min(end - next);
            let piece = SectorRange::new(next, sectors);
            next += sectors;
            Some(piece)
        })
    }
}

impl fmt::Display for SectorRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}+{}", self.start, self.sectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sector_conversions() {
        assert_eq!(sectors_to_bytes(8), 4096);
        assert_eq!(bytes_to_sectors(4096), Some(8));
        assert_eq!(bytes_to_sectors(4095), None);
        assert_eq!(bytes_to_sectors(0), Some(0));
    }

    #[test]
    fn test_range_bounds() {
        let range = SectorRange::new(100, 8);
        assert_eq!(range.end(), 108);
        assert_eq!(range.bytes(), 4096);
        assert!(range.contains(100));
        assert!(range.contains(107));
        assert!(!range.contains(108));
        assert_eq!(range.to_string(), "100+8");
    }

    #[test]
    fn test_range_overlap() {
        let a = SectorRange::new(0, 128);
        assert!(a.overlaps(&SectorRange::new(127, 1)));
        assert!(!a.overlaps(&SectorRange::new(128, 64)));
        assert!(!a.overlaps(&SectorRange::new(500, 0)));
    }

    #[test]
    fn test_range_split() {
        let pieces: Vec<_> = SectorRange::new(10, 20).split(8).collect();
        assert_eq!(
            pieces,
            vec![
                SectorRange::new(10, 8),
                SectorRange::new(18, 8),
                SectorRange::new(26, 4),
            ]
        );
        assert_eq!(SectorRange::new(0, 0).split(8).count(), 0);
    }

    #[test]
    fn test_array_id_display() {
        let id = ArrayId::new();
        assert_eq!(id.to_string(), id.as_uuid().to_string());
        assert_ne!(id, ArrayId::new());
    }
}
