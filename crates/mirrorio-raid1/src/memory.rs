//! In-memory replica with fault injection
//!
//! `MemoryReplica` backs a replica with a byte vector. Media errors, lost
//! devices and ordering-primitive rejection can be injected per sector range,
//! and completions can be delayed onto a separate thread to model a real
//! asynchronous transport.

use crate::device::{IoCompletion, IoRequest, IoResult, ReplicaDevice};
use crate::error::DeviceError;

use bytes::Bytes;
use mirrorio_common::{Direction, Sector, SectorRange, sectors_to_bytes};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// How long an injected fault persists
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    /// Fails the next matching request only
    Once,
    /// Read fault that is healed by a write covering it (remapped sector)
    UntilRewritten,
    /// Fails every matching request
    Persistent,
}

#[derive(Debug, Clone)]
struct Fault {
    direction: Direction,
    range: SectorRange,
    mode: FaultMode,
}

/// When completions are delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompletionMode {
    /// Complete on the submitting thread
    #[default]
    Inline,
    /// Complete on a helper thread after the given delay
    Delayed(Duration),
}

/// Record of a request seen by the replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoRecord {
    pub direction: Direction,
    pub sector: Sector,
    pub sectors: u64,
    pub ordered: bool,
}

/// Replica backed by memory
pub struct MemoryReplica {
    name: String,
    capacity: Sector,
    data: RwLock<Vec<u8>>,
    faults: Mutex<Vec<Fault>>,
    ordered_supported: AtomicBool,
    offline: AtomicBool,
    completion: CompletionMode,
    log: Mutex<Vec<IoRecord>>,
}

impl MemoryReplica {
    /// Create a zero-filled replica of `capacity` sectors
    pub fn new(name: impl Into<String>, capacity: Sector) -> Self {
        Self {
            name: name.into(),
            capacity,
            data: RwLock::new(vec![0u8; sectors_to_bytes(capacity) as usize]),
            faults: Mutex::new(Vec::new()),
            ordered_supported: AtomicBool::new(true),
            offline: AtomicBool::new(false),
            completion: CompletionMode::Inline,
            log: Mutex::new(Vec::new()),
        }
    }

    /// Deliver completions according to `mode`
    #[must_use]
    pub fn with_completion(mut self, mode: CompletionMode) -> Self {
        self.completion = mode;
        self
    }

    /// Fill the whole replica with one byte value
    pub fn fill(&self, value: u8) {
        self.data.write().fill(value);
    }

    /// Write bytes directly, bypassing faults and the request log
    pub fn write_raw(&self, sector: Sector, bytes: &[u8]) {
        let start = sectors_to_bytes(sector) as usize;
        self.data.write()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    /// Read bytes directly, bypassing faults and the request log
    pub fn read_raw(&self, sector: Sector, sectors: u64) -> Vec<u8> {
        let start = sectors_to_bytes(sector) as usize;
        let end = start + sectors_to_bytes(sectors) as usize;
        self.data.read()[start..end].to_vec()
    }

    /// Inject a read fault
    pub fn fail_reads(&self, range: SectorRange, mode: FaultMode) {
        self.faults.lock().push(Fault {
            direction: Direction::Read,
            range,
            mode,
        });
    }

    /// Inject a write fault
    pub fn fail_writes(&self, range: SectorRange, mode: FaultMode) {
        self.faults.lock().push(Fault {
            direction: Direction::Write,
            range,
            mode,
        });
    }

    /// Remove every injected fault
    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Make every request fail as if the device vanished
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::Release);
    }

    /// Accept or reject the ordering primitive
    pub fn set_ordered_supported(&self, supported: bool) {
        self.ordered_supported.store(supported, Ordering::Release);
    }

    /// Requests seen so far, in submission order
    pub fn requests(&self) -> Vec<IoRecord> {
        self.log.lock().clone()
    }

    /// Number of requests seen in the given direction
    pub fn request_count(&self, direction: Direction) -> usize {
        self.log
            .lock()
            .iter()
            .filter(|r| r.direction == direction)
            .count()
    }

    /// Forget the request log
    pub fn clear_log(&self) {
        self.log.lock().clear();
    }

    fn check_fault(&self, request: &IoRequest) -> Result<(), DeviceError> {
        let range = request.range();
        let mut faults = self.faults.lock();

        if request.direction == Direction::Write {
            faults.retain(|f| {
                !(f.direction == Direction::Read
                    && f.mode == FaultMode::UntilRewritten
                    && range.start <= f.range.start
                    && f.range.end() <= range.end())
            });
        }

        let hit = faults
            .iter()
            .position(|f| f.direction == request.direction && f.range.overlaps(&range));
        match hit {
            Some(idx) => {
                let fault = faults[idx].clone();
                if fault.mode == FaultMode::Once {
                    faults.remove(idx);
                }
                Err(DeviceError::Media {
                    sector: fault.range.start.max(range.start),
                })
            }
            None => Ok(()),
        }
    }

    fn execute(&self, request: &IoRequest) -> IoResult {
        if self.offline.load(Ordering::Acquire) {
            return Err(DeviceError::Offline(self.name.clone()));
        }
        if request.range().end() > self.capacity {
            return Err(DeviceError::OutOfRange {
                sector: request.sector,
                sectors: request.sectors,
                capacity: self.capacity,
            });
        }
        if request.ordered
            && request.direction == Direction::Write
            && !self.ordered_supported.load(Ordering::Acquire)
        {
            return Err(DeviceError::OrderingUnsupported);
        }
        self.check_fault(request)?;

        let start = sectors_to_bytes(request.sector) as usize;
        let len = request.len_bytes() as usize;
        match request.direction {
            Direction::Read => Ok(Bytes::copy_from_slice(
                &self.data.read()[start..start + len],
            )),
            Direction::Write => {
                if request.data.len() != len {
                    return Err(DeviceError::Io(format!(
                        "payload of {} bytes for {} sectors",
                        request.data.len(),
                        request.sectors
                    )));
                }
                self.data.write()[start..start + len].copy_from_slice(&request.data);
                Ok(Bytes::new())
            }
        }
    }
}

impl ReplicaDevice for MemoryReplica {
    fn name(&self) -> &str {
        &self.name
    }

    fn capacity(&self) -> Sector {
        self.capacity
    }

    fn submit_io(&self, request: IoRequest, done: IoCompletion) {
        self.log.lock().push(IoRecord {
            direction: request.direction,
            sector: request.sector,
            sectors: request.sectors,
            ordered: request.ordered,
        });

        let result = self.execute(&request);
        match self.completion {
            CompletionMode::Inline => done(result),
            CompletionMode::Delayed(delay) => {
                std::thread::spawn(move || {
                    std::thread::sleep(delay);
                    done(result);
                });
            }
        }
    }
}
