//! # shmsync - Cross-Process Synchronization Objects in Shared Memory
//!
//! shmsync implements mutex, event and semaphore semantics on records that
//! live in a shared memory region mapped by several independent processes.
//! No kernel-side arbiter is involved: each record carries its own 32-bit
//! guard word, and every state transition happens under that guard.
//!
//! ## Features
//!
//! - **Fixed record layout**: 20-byte `#[repr(C)]` records, zero bytes mean
//!   "uninitialized"
//! - **Crash-tolerant guard**: spin, then futex park; dead holders are
//!   detected and their guard taken over
//! - **Recursive mutexes with abandonment** reported to the next acquirer
//! - **Auto-reset and manual-reset events**, counting semaphores
//! - **Object tables**: fixed-slot allocator over file-backed or memfd regions
//! - **Non-blocking API** meant to be driven by an external wait layer
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │   SharedMutex │ SharedEvent │ SharedSemaphore   │
//! ├─────────────────────────────────────────────────┤
//! │  SyncObject record: guard │ type │ payload      │
//! ├─────────────────────────────────────────────────┤
//! │  ObjectTable: header │ bitmap │ slots           │
//! └─────────────────────────────────────────────────┘
//!           │
//!           ▼
//! ┌─────────────────────────────────────────────────┐
//! │  SharedMemoryRegion (file-backed / memfd mmap)  │
//! └─────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use shmsync::{ObjectTable, Ptid, RegionConfig, SharedMemoryRegion, TableConfig};
//!
//! # fn main() -> shmsync::Result<()> {
//! let config = TableConfig::new(256);
//! let region = SharedMemoryRegion::new(
//!     RegionConfig::new("objects", config.region_size()).with_file_path("/tmp/objects.shm"),
//! )?;
//! let table = ObjectTable::create(Arc::new(region), config)?;
//!
//! let slot = table.create_mutex(None)?;
//! let me = Ptid::current();
//! if table.mutex(slot)?.try_acquire(me)?.is_acquired() {
//!     table.mutex(slot)?.release(me)?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod memory;
pub mod objects;
pub mod sync;
pub mod table;

// Main API re-exports
pub use error::{Result, ShmSyncError};
pub use memory::{BackingType, RegionConfig, SharedMemoryRegion};
pub use objects::{
    Acquisition, EventState, MutexState, ObjectState, ObjectType, Ptid, SemaphoreState,
    SharedEvent, SharedMutex, SharedSemaphore, SyncObject,
};
pub use sync::{GuardHold, GuardPolicy, GuardWord, HolderProbe, ProcessProbe};
pub use table::{ObjectTable, SlotId, TableConfig, TableStats};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration constants
pub mod config {
    use std::time::Duration;

    /// Default number of slots in an object table
    pub const DEFAULT_TABLE_CAPACITY: u32 = 4096;

    /// Deepest recursion a mutex owner may reach
    pub const MAX_MUTEX_RECURSION: u32 = i32::MAX as u32;

    /// Busy spins on a contended guard before parking
    pub const DEFAULT_GUARD_SPINS: u32 = 100;

    /// Longest single futex park; also how often a holder's liveness is checked
    pub const DEFAULT_PARK_SLICE: Duration = Duration::from_millis(1);

    /// Give up on a guard held by a live process after this long
    pub const DEFAULT_GUARD_TIMEOUT: Duration = Duration::from_secs(5);
}
