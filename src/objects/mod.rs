//! Shared synchronization objects
//!
//! A [`SyncObject`] is a fixed-layout record that any number of processes can
//! map. The typed views ([`SharedMutex`], [`SharedEvent`], [`SharedSemaphore`])
//! apply the per-type transition rules; every one of them follows the same
//! shape: take the record guard, check the type tag, do one check-and-mutate,
//! release the guard.

pub mod record;
pub mod mutex;
pub mod event;
pub mod semaphore;

pub use record::{EventState, MutexState, ObjectState, ObjectType, Ptid, SemaphoreState, SyncObject};
pub use mutex::SharedMutex;
pub use event::SharedEvent;
pub use semaphore::SharedSemaphore;

/// Outcome of a non-blocking acquire or wait-check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// Taken fresh (mutex unheld, semaphore units available, event signaled)
    Acquired,
    /// Mutex re-entered by its owner; carries the new recursion depth
    Recursive(u32),
    /// Mutex taken after its previous owner died holding it
    Abandoned,
    /// The object could not be taken right now; retry later
    NotAvailable,
}

impl Acquisition {
    /// Whether the caller now holds (or consumed) the object
    pub fn is_acquired(&self) -> bool {
        !matches!(self, Acquisition::NotAvailable)
    }
}
