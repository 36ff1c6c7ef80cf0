//! File-backed replica
//!
//! Serves a replica from a regular file or block device. I/O is performed on
//! the submitting thread and completes inline; ordered writes are followed by
//! `sync_data` so they are durable when acknowledged.

use crate::device::{IoCompletion, IoRequest, IoResult, ReplicaDevice};
use crate::error::DeviceError;

use bytes::Bytes;
use mirrorio_common::{Direction, SECTOR_SIZE, Sector, sectors_to_bytes};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use tracing::debug;

/// Replica stored in a file
pub struct FileReplica {
    file: Mutex<File>,
    path: String,
    capacity: Sector,
}

impl FileReplica {
    /// Open an existing replica file
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| DeviceError::Io(format!("failed to open {path_str}: {e}")))?;

        // Block devices report a zero length in metadata; seek to the end instead
        let size = file
            .seek(SeekFrom::End(0))
            .map_err(|e| DeviceError::Io(format!("failed to size {path_str}: {e}")))?;

        debug!("Opened replica {} ({} bytes)", path_str, size);

        Ok(Self {
            file: Mutex::new(file),
            path: path_str,
            capacity: size / SECTOR_SIZE,
        })
    }

    /// Create (or truncate) a sparse replica file of `sectors` sectors
    pub fn create(path: impl AsRef<Path>, sectors: Sector) -> Result<Self, DeviceError> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| DeviceError::Io(format!("failed to create {path_str}: {e}")))?;
        file.set_len(sectors_to_bytes(sectors))
            .map_err(|e| DeviceError::Io(format!("failed to size {path_str}: {e}")))?;

        Ok(Self {
            file: Mutex::new(file),
            path: path_str,
            capacity: sectors,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &str {
        &self.path
    }

    fn execute(&self, request: &IoRequest) -> IoResult {
        if request.range().end() > self.capacity {
            return Err(DeviceError::OutOfRange {
                sector: request.sector,
                sectors: request.sectors,
                capacity: self.capacity,
            });
        }

        let offset = sectors_to_bytes(request.sector);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        match request.direction {
            Direction::Read => {
                let mut buf = vec![0u8; request.len_bytes() as usize];
                file.read_exact(&mut buf).map_err(|e| {
                    DeviceError::Io(format!(
                        "read {} at sector {} failed: {e}",
                        self.path, request.sector
                    ))
                })?;
                Ok(Bytes::from(buf))
            }
            Direction::Write => {
                file.write_all(&request.data).map_err(|e| {
                    DeviceError::Io(format!(
                        "write {} at sector {} failed: {e}",
                        self.path, request.sector
                    ))
                })?;
                if request.ordered {
                    file.sync_data()?;
                }
                Ok(Bytes::new())
            }
        }
    }
}

impl ReplicaDevice for FileReplica {
    fn name(&self) -> &str {
        &self.path
    }

    fn capacity(&self) -> Sector {
        self.capacity
    }

    fn submit_io(&self, request: IoRequest, done: IoCompletion) {
        done(self.execute(&request));
    }
}
