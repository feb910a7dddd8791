//! Error types and handling for shmsync

use std::time::Duration;

use crate::objects::{ObjectType, Ptid};

/// Result type alias for shmsync operations
pub type Result<T> = std::result::Result<T, ShmSyncError>;

/// Error types for shared synchronization objects and their backing memory
#[derive(Debug, thiserror::Error)]
pub enum ShmSyncError {
    /// Mutex released by a thread that does not hold it
    #[error("Not owner: mutex held by {owner}, release requested by {requester}")]
    NotOwner { owner: Ptid, requester: Ptid },

    /// Semaphore release past its maximum, or mutex recursion past the ceiling
    #[error("Overflow on {object}: limit {limit}")]
    Overflow { object: ObjectType, limit: u32 },

    /// Create called on a slot that already carries a type
    #[error("Object already initialized as {found}")]
    AlreadyInitialized { found: ObjectType },

    /// Operation for one object type invoked on another
    #[error("Type mismatch: expected {}, found {found}", expected_name(.expected))]
    TypeMismatch {
        /// `None` when any initialized type would have done
        expected: Option<ObjectType>,
        found: ObjectType,
    },

    /// The record guard could not be taken within the configured timeout
    #[error("Guard timeout: held by {holder} for at least {waited:?}")]
    GuardTimeout { holder: u32, waited: Duration },

    /// Invalid parameters or configuration
    #[error("Invalid parameter: {parameter} - {message}")]
    InvalidParameter { parameter: String, message: String },

    /// Slot index out of range or not allocated
    #[error("Invalid slot: {slot}")]
    InvalidSlot { slot: u32 },

    /// No free slot left in an object table
    #[error("Object table full: capacity {capacity}")]
    TableFull { capacity: u32 },

    /// Abandonment sweep finished but could not reach every slot
    #[error("Sweep incomplete: {abandoned} mutexes abandoned, guards timed out on slots {stuck:?}")]
    SweepIncomplete { abandoned: usize, stuck: Vec<u32> },

    /// Shared region does not hold a recognizable object table
    #[error("Invalid layout: {message}")]
    InvalidLayout { message: String },

    /// I/O related errors (file operations, mmap, etc.)
    #[error("I/O error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    /// Platform-specific errors
    #[error("Platform error: {message}")]
    Platform { message: String },
}

impl ShmSyncError {
    /// Create an I/O error from a standard I/O error
    pub fn from_io(source: std::io::Error, context: &str) -> Self {
        Self::Io {
            message: format!("{}: {}", context, source),
            source: Some(source),
        }
    }

    pub fn not_owner(owner: Ptid, requester: Ptid) -> Self {
        Self::NotOwner { owner, requester }
    }

    pub fn overflow(object: ObjectType, limit: u32) -> Self {
        Self::Overflow { object, limit }
    }

    pub fn already_initialized(found: ObjectType) -> Self {
        Self::AlreadyInitialized { found }
    }

    pub fn type_mismatch(expected: ObjectType, found: ObjectType) -> Self {
        Self::TypeMismatch {
            expected: Some(expected),
            found,
        }
    }

    /// Operation that works on every type hit an uninitialized record
    pub fn untyped() -> Self {
        Self::TypeMismatch {
            expected: None,
            found: ObjectType::Unknown,
        }
    }

    pub fn guard_timeout(holder: u32, waited: Duration) -> Self {
        Self::GuardTimeout { holder, waited }
    }

    /// Create an invalid parameter error
    pub fn invalid_parameter(parameter: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidParameter {
            parameter: parameter.into(),
            message: message.into(),
        }
    }

    pub fn invalid_slot(slot: u32) -> Self {
        Self::InvalidSlot { slot }
    }

    pub fn table_full(capacity: u32) -> Self {
        Self::TableFull { capacity }
    }

    pub fn sweep_incomplete(abandoned: usize, stuck: Vec<u32>) -> Self {
        Self::SweepIncomplete { abandoned, stuck }
    }

    pub fn invalid_layout(message: impl Into<String>) -> Self {
        Self::InvalidLayout {
            message: message.into(),
        }
    }

    /// Create a platform error
    pub fn platform(message: impl Into<String>) -> Self {
        Self::Platform {
            message: message.into(),
        }
    }

    /// Whether retrying the same call later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::GuardTimeout { .. } | Self::SweepIncomplete { .. })
    }
}

fn expected_name(expected: &Option<ObjectType>) -> &'static str {
    match expected {
        Some(kind) => kind.name(),
        None => "an initialized object",
    }
}

// Convert from common error types
impl From<std::io::Error> for ShmSyncError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io(err, "I/O operation failed")
    }
}

impl From<nix::errno::Errno> for ShmSyncError {
    fn from(err: nix::errno::Errno) -> Self {
        Self::platform(format!("System call failed: {}", err))
    }
}
