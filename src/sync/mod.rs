//! Low-level cross-process synchronization
//!
//! - `guard`: the per-record guard word and its acquire/release protocol
//! - `futex`: park/wake on a shared 32-bit word

pub mod futex;
pub mod guard;

pub use guard::{GuardHold, GuardPolicy, GuardWord, HolderProbe, ProcessProbe, HOLDER_MASK, WAITERS};
