//! Cross-process record guard
//!
//! Every shared object record starts with a 32-bit guard word. The word is
//! the only thing the protocol relies on: no process-local mutex is ever
//! involved, so the guard works between unrelated processes mapping the same
//! page.
//!
//! Word encoding:
//!
//! ```text
//!  31        30                               0
//! |WAITERS|  holder id (process id)            |
//! ```
//!
//! `0` means free. A contender first spins, then sets `WAITERS` and parks on
//! the word with a futex bounded by [`GuardPolicy::park_slice`]. Between
//! parks the holder is checked with a [`HolderProbe`]; a dead holder's word
//! is taken over with a CAS, so a crashed process costs its peers at most one
//! park slice. Release swaps the word to `0` and wakes parked contenders if
//! `WAITERS` was set.

use std::fmt;
use std::hint::spin_loop;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{trace, warn};
use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

use crate::config;
use crate::error::{Result, ShmSyncError};

use super::futex;

/// Set while at least one contender is parked on the word
pub const WAITERS: u32 = 1 << 31;

/// Bits carrying the holder id
pub const HOLDER_MASK: u32 = !WAITERS;

/// Liveness check for the id stored in a held guard word
pub trait HolderProbe: Send + Sync + fmt::Debug {
    /// Whether `holder` may still release the guard itself
    fn is_alive(&self, holder: u32) -> bool;
}

/// Treats the holder id as a process id and probes it with `kill(pid, 0)`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessProbe;

impl HolderProbe for ProcessProbe {
    fn is_alive(&self, holder: u32) -> bool {
        if holder == 0 || holder > i32::MAX as u32 {
            return false;
        }
        match kill(Pid::from_raw(holder as i32), None) {
            Ok(()) => true,
            Err(Errno::ESRCH) => false,
            // EPERM: the process exists but belongs to someone else
            Err(_) => true,
        }
    }
}

/// How a contender waits for a guard and when it gives up
#[derive(Debug, Clone)]
pub struct GuardPolicy {
    /// Busy spins before the first park
    pub spin_limit: u32,
    /// Upper bound of a single park; also the liveness check period
    pub park_slice: Duration,
    /// Total wait before `GuardTimeout`; `None` waits forever
    pub timeout: Option<Duration>,
    /// Value written into the guard word while held
    pub holder_id: u32,
    /// Liveness check used for stale-holder recovery
    pub probe: Arc<dyn HolderProbe>,
}

impl Default for GuardPolicy {
    fn default() -> Self {
        Self {
            spin_limit: config::DEFAULT_GUARD_SPINS,
            park_slice: config::DEFAULT_PARK_SLICE,
            timeout: Some(config::DEFAULT_GUARD_TIMEOUT),
            holder_id: std::process::id(),
            probe: Arc::new(ProcessProbe),
        }
    }
}

impl GuardPolicy {
    /// Create a policy with the default settings for this process
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_spin_limit(mut self, spin_limit: u32) -> Self {
        self.spin_limit = spin_limit;
        self
    }

    pub fn with_park_slice(mut self, park_slice: Duration) -> Self {
        self.park_slice = park_slice;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_holder_id(mut self, holder_id: u32) -> Self {
        self.holder_id = holder_id;
        self
    }

    pub fn with_probe(mut self, probe: impl HolderProbe + 'static) -> Self {
        self.probe = Arc::new(probe);
        self
    }

    /// Validate the policy
    pub fn validate(&self) -> Result<()> {
        self.claim_value()?;

        if self.park_slice.is_zero() {
            return Err(ShmSyncError::invalid_parameter(
                "park_slice",
                "Park slice must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Word value written on acquire; `0` or a `WAITERS` bit would break the encoding
    fn claim_value(&self) -> Result<u32> {
        match self.holder_id {
            id if id == 0 || id & WAITERS != 0 => Err(ShmSyncError::invalid_parameter(
                "holder_id",
                format!("Holder id must be in 1..={}", HOLDER_MASK),
            )),
            id => Ok(id),
        }
    }
}

/// The shared guard word at the head of every record
#[repr(transparent)]
#[derive(Debug, Default)]
pub struct GuardWord(AtomicU32);

impl GuardWord {
    pub const fn new() -> Self {
        Self(AtomicU32::new(0))
    }

    /// Claim the guard without waiting; `Ok(None)` if someone holds it
    pub fn try_acquire(&self, policy: &GuardPolicy) -> Result<Option<GuardHold<'_>>> {
        let me = policy.claim_value()?;
        Ok(self
            .0
            .compare_exchange(0, me, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| GuardHold { word: self }))
    }

    /// Claim the guard, spinning then parking until it is free
    ///
    /// Returns `GuardTimeout` once `policy.timeout` has elapsed while a live
    /// holder kept the word.
    pub fn acquire(&self, policy: &GuardPolicy) -> Result<GuardHold<'_>> {
        if let Some(hold) = self.try_acquire(policy)? {
            return Ok(hold);
        }

        let me = policy.holder_id;
        let start = Instant::now();
        let mut spins = 0u32;

        loop {
            let current = self.0.load(Ordering::Relaxed);
            if current == 0 {
                if self
                    .0
                    .compare_exchange_weak(0, me, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return Ok(GuardHold { word: self });
                }
                continue;
            }

            if spins < policy.spin_limit {
                spins += 1;
                spin_loop();
                continue;
            }

            let holder = current & HOLDER_MASK;
            if !policy.probe.is_alive(holder) {
                let stolen = me | (current & WAITERS);
                if self
                    .0
                    .compare_exchange(current, stolen, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    warn!("recovered guard {:p} from dead holder {}", self, holder);
                    return Ok(GuardHold { word: self });
                }
                continue;
            }

            let waited = start.elapsed();
            let slice = match policy.timeout {
                Some(limit) if waited >= limit => {
                    return Err(ShmSyncError::guard_timeout(holder, waited));
                }
                Some(limit) => policy.park_slice.min(limit - waited),
                None => policy.park_slice,
            };

            let flagged = current | WAITERS;
            if current & WAITERS == 0
                && self
                    .0
                    .compare_exchange(current, flagged, Ordering::Relaxed, Ordering::Relaxed)
                    .is_err()
            {
                continue;
            }

            trace!("parking on guard {:p} held by {}", self, holder);
            futex::wait(&self.0, flagged, slice);
        }
    }

    /// Holder id currently stored in the word, if held
    pub fn holder(&self) -> Option<u32> {
        match self.0.load(Ordering::Acquire) & HOLDER_MASK {
            0 => None,
            holder => Some(holder),
        }
    }

    pub fn is_held(&self) -> bool {
        self.0.load(Ordering::Acquire) != 0
    }

    /// Raw word value, for diagnostics
    pub fn raw(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Exclusive access to a record; released on drop
#[must_use = "the guard is released as soon as the hold is dropped"]
#[derive(Debug)]
pub struct GuardHold<'a> {
    word: &'a GuardWord,
}

impl<'a> GuardHold<'a> {
    /// Release the guard explicitly
    pub fn release(self) {}
}

impl Drop for GuardHold<'_> {
    fn drop(&mut self) {
        let previous = self.word.0.swap(0, Ordering::SeqCst);
        if previous & WAITERS != 0 {
            futex::wake_all(&self.word.0);
        }
    }
}
