#![allow(clippy::result_large_err)]
//! MirrorIO RAID-1 engine
//!
//! This crate fans client block I/O out to a set of mirrored replicas, keeps
//! them consistent under concurrent client I/O and background resync, and
//! recovers from single-replica failures without failing the array.
//!
//! # Features
//!
//! - **Read balancing**: sequential reads stick to one replica, random reads
//!   go to an idle replica or the one whose head is closest
//! - **Read repair**: failed reads are redirected and the bad sectors rewritten
//! - **Write-behind**: write-mostly replicas may lag behind the acknowledgement
//! - **Resync**: tracker-guided resync, full or incremental recovery, check
//!   and repair passes
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │     Client      │  submit() / read() / write()
//! └────────┬────────┘
//!          │ wait_barrier
//! ┌────────▼────────┐        ┌─────────────────┐
//! │ Request Router  │◄──────►│  Resync Engine  │ raise_barrier
//! │  - Balancer     │        └────────┬────────┘
//! │  - Deferred Q   │                 │
//! └────────┬────────┘        ┌────────▼────────┐
//!          │                 │ Recovery Thread │ retry list, repair
//!          │                 └────────┬────────┘
//! ┌────────▼─────────────────────────▼┐
//! │        ReplicaDevice × N          │  (memory, file, ...)
//! └───────────────────────────────────┘
//! ```

pub mod array;
pub mod balancer;
pub mod barrier;
mod completion;
pub mod device;
pub mod error;
pub mod file;
pub mod memory;
pub mod metrics;
mod recovery;
pub mod replica;
pub mod request;
pub mod resync;
mod router;
pub mod tracker;

pub use array::{
    AddReplicaOptions, ArrayStatus, ClientIo, MirrorArray, ReplicaSpec, ReplicaState,
    ReplicaStatus,
};
pub use balancer::{ReadCursor, ReadPlan, ReplicaView, choose_read_replica};
pub use barrier::{Barrier, BarrierSnapshot};
pub use device::{IoCompletion, IoRequest, IoResult, ReplicaDevice, sync_io};
pub use error::{DeviceError, MirrorError, MirrorResult};
pub use file::FileReplica;
pub use memory::{CompletionMode, FaultMode, IoRecord, MemoryReplica};
pub use metrics::{ArrayMetrics, LatencyHistogram, MetricsSnapshot, PrometheusExporter};
pub use replica::{Replica, ReplicaTable};
pub use request::{
    ClientCompletion, RequestFlag, RequestFlags, RequestPermit, RequestPool, RequestState,
    SubRole,
};
pub use resync::{ResyncKind, ResyncReport, ResyncStatus};
pub use tracker::{MemoryTracker, RegionTracker, SyncHint};
