//! Configuration types for MirrorIO
//!
//! This module defines the configuration structures for a mirror array and
//! the tooling around it. Every section has defaults so a minimal TOML file
//! only needs the replica list.

use crate::error::{Error, Result};
use crate::types::{SECTOR_SIZE, Sector, SlotId};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default number of replica slots
pub const DEFAULT_RAID_DISKS: usize = 2;

/// Default bound on concurrently raised resync barriers
pub const DEFAULT_BARRIER_DEPTH: u32 = 32;

/// Default resync chunk: 64 KiB
pub const DEFAULT_RESYNC_CHUNK_SECTORS: u64 = 128;

/// Default repair granularity: one 4 KiB page
pub const DEFAULT_PAGE_SECTORS: u64 = 8;

/// Default number of in-flight client request contexts
pub const DEFAULT_MAX_REQUESTS: usize = 256;

/// Default number of read errors tolerated per replica before it is failed
pub const DEFAULT_MAX_READ_ERRORS: u32 = 20;

/// Default dirty-region tracker granularity: 64 MiB
pub const DEFAULT_REGION_SECTORS: u64 = 128 * 1024;

/// Root configuration for a MirrorIO deployment
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Array configuration
    #[serde(default)]
    pub array: ArrayConfig,
    /// Backing replicas, in slot order unless a slot is given explicitly
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,
    /// Dirty-region tracker configuration
    #[serde(default)]
    pub tracker: TrackerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.array.validate()?;
        self.tracker.validate()?;

        if self.replicas.len() > self.array.raid_disks {
            return Err(Error::configuration(format!(
                "{} replicas configured but the array only has {} slots",
                self.replicas.len(),
                self.array.raid_disks
            )));
        }

        let mut used = vec![false; self.array.raid_disks];
        for replica in &self.replicas {
            if let Some(slot) = replica.slot {
                if slot >= self.array.raid_disks {
                    return Err(Error::configuration(format!(
                        "replica {} requests slot {slot} beyond raid_disks {}",
                        replica.path.display(),
                        self.array.raid_disks
                    )));
                }
                if used[slot] {
                    return Err(Error::configuration(format!(
                        "slot {slot} is assigned to more than one replica"
                    )));
                }
                used[slot] = true;
            }
        }

        Ok(())
    }
}

/// Mirror array configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArrayConfig {
    /// Array name (human-readable identifier)
    pub name: String,
    /// Number of replica slots
    pub raid_disks: usize,
    /// Usable size in sectors (defaults to the smallest replica)
    pub size_sectors: Option<Sector>,
    /// Skip the initial resync (replicas are known to be identical)
    pub assume_clean: bool,
    /// Maximum number of in-flight client request contexts
    pub max_requests: usize,
    /// Read errors tolerated per replica before it is marked faulty
    pub max_read_errors: u32,
    /// Resync engine tuning
    pub resync: ResyncConfig,
    /// Write-behind tuning for write-mostly replicas
    pub write_behind: WriteBehindConfig,
}

impl Default for ArrayConfig {
    fn default() -> Self {
        Self {
            name: "md0".to_string(),
            raid_disks: DEFAULT_RAID_DISKS,
            size_sectors: None,
            assume_clean: false,
            max_requests: DEFAULT_MAX_REQUESTS,
            max_read_errors: DEFAULT_MAX_READ_ERRORS,
            resync: ResyncConfig::default(),
            write_behind: WriteBehindConfig::default(),
        }
    }
}

impl ArrayConfig {
    /// Validate array settings
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::configuration("array name must not be empty"));
        }
        if self.raid_disks == 0 {
            return Err(Error::configuration("raid_disks must be at least 1"));
        }
        if self.max_requests == 0 {
            return Err(Error::configuration("max_requests must be at least 1"));
        }
        if self.size_sectors == Some(0) {
            return Err(Error::configuration("size_sectors must be positive"));
        }
        self.resync.validate()
    }
}

/// Resync engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    /// Maximum sectors covered by one resync chunk
    pub chunk_sectors: u64,
    /// Granularity of synchronous repair I/O
    pub page_sectors: u64,
    /// Upper bound on resync chunks holding the barrier at once
    pub barrier_depth: u32,
    /// Pause before raising the next chunk while client I/O is waiting
    pub yield_interval_ms: u64,
}

impl Default for ResyncConfig {
    fn default() -> Self {
        Self {
            chunk_sectors: DEFAULT_RESYNC_CHUNK_SECTORS,
            page_sectors: DEFAULT_PAGE_SECTORS,
            barrier_depth: DEFAULT_BARRIER_DEPTH,
            yield_interval_ms: 10,
        }
    }
}

impl ResyncConfig {
    /// Validate resync settings
    pub fn validate(&self) -> Result<()> {
        if self.page_sectors == 0 {
            return Err(Error::configuration("page_sectors must be positive"));
        }
        if self.chunk_sectors == 0 || self.chunk_sectors % self.page_sectors != 0 {
            return Err(Error::configuration(format!(
                "chunk_sectors ({}) must be a positive multiple of page_sectors ({})",
                self.chunk_sectors, self.page_sectors
            )));
        }
        if self.barrier_depth < 2 {
            return Err(Error::configuration("barrier_depth must be at least 2"));
        }
        Ok(())
    }

    /// Chunk size in bytes
    #[must_use]
    pub const fn chunk_bytes(&self) -> u64 {
        self.chunk_sectors * SECTOR_SIZE
    }
}

/// Write-behind configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WriteBehindConfig {
    /// Byte budget for private payload copies held by behind writes
    pub max_copy_bytes: u64,
}

impl Default for WriteBehindConfig {
    fn default() -> Self {
        Self {
            max_copy_bytes: 64 * 1024 * 1024, // 64 MB
        }
    }
}

/// Dirty-region tracker configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Sectors covered by one tracked region
    pub region_sectors: u64,
    /// Maximum outstanding behind writes (0 disables write-behind)
    pub max_behind_writes: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            region_sectors: DEFAULT_REGION_SECTORS,
            max_behind_writes: 0,
        }
    }
}

impl TrackerConfig {
    /// Validate tracker settings
    pub fn validate(&self) -> Result<()> {
        if self.region_sectors == 0 {
            return Err(Error::configuration("region_sectors must be positive"));
        }
        Ok(())
    }
}

/// Configuration for a single backing replica
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// Path to the replica file or block device
    pub path: PathBuf,
    /// Prefer this replica for writes only
    #[serde(default)]
    pub write_mostly: bool,
    /// Explicit slot (defaults to the next free slot)
    #[serde(default)]
    pub slot: Option<SlotId>,
}

/// Logging configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level or `EnvFilter` directive
    pub level: String,
    /// Emit JSON formatted logs
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.array.raid_disks, 2);
        assert_eq!(config.array.resync.chunk_bytes(), 64 * 1024);
    }

    #[test]
    fn test_parse_minimal_toml() {
        let config: Config = toml::from_str(
            r#"
            [array]
            name = "mirror0"

            [[replicas]]
            path = "/var/lib/mirrorio/a.img"

            [[replicas]]
            path = "/var/lib/mirrorio/b.img"
            write_mostly = true
            "#,
        )
        .unwrap();

        config.validate().unwrap();
        assert_eq!(config.array.name, "mirror0");
        assert_eq!(config.array.raid_disks, DEFAULT_RAID_DISKS);
        assert_eq!(config.replicas.len(), 2);
        assert!(config.replicas[1].write_mostly);
        assert_eq!(config.tracker.max_behind_writes, 0);
    }

    #[test]
    fn test_rejects_misaligned_chunk() {
        let mut config = Config::default();
        config.array.resync.chunk_sectors = 12;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_too_many_replicas() {
        let mut config = Config::default();
        config.array.raid_disks = 1;
        for name in ["a", "b"] {
            config.replicas.push(ReplicaConfig {
                path: PathBuf::from(name),
                write_mostly: false,
                slot: None,
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_slot() {
        let mut config = Config::default();
        for name in ["a", "b"] {
            config.replicas.push(ReplicaConfig {
                path: PathBuf::from(name),
                write_mostly: false,
                slot: Some(1),
            });
        }
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("slot 1"));
    }
}
