//! Cross-process counting semaphore

use log::debug;

use crate::error::{Result, ShmSyncError};
use crate::sync::guard::GuardPolicy;

use super::record::{ObjectState, ObjectType, SemaphoreState, SyncObject};
use super::Acquisition;

pub(crate) fn acquire_step(state: &mut SemaphoreState, units: u32) -> Result<Acquisition> {
    check_units(units)?;
    if state.count < units {
        return Ok(Acquisition::NotAvailable);
    }
    state.count -= units;
    Ok(Acquisition::Acquired)
}

fn release_step(state: &mut SemaphoreState, units: u32) -> Result<u32> {
    check_units(units)?;
    let previous = state.count;
    match previous.checked_add(units) {
        Some(count) if count <= state.maximum => {
            state.count = count;
            Ok(previous)
        }
        _ => Err(ShmSyncError::overflow(ObjectType::Semaphore, state.maximum)),
    }
}

fn check_units(units: u32) -> Result<()> {
    if units == 0 {
        return Err(ShmSyncError::invalid_parameter(
            "units",
            "Unit count must be greater than 0",
        ));
    }
    Ok(())
}

/// Semaphore view over a shared record
#[derive(Debug, Clone, Copy)]
pub struct SharedSemaphore<'a> {
    object: &'a SyncObject,
    policy: &'a GuardPolicy,
}

impl<'a> SharedSemaphore<'a> {
    /// Initialize an unknown record as a semaphore
    pub fn create(
        object: &'a SyncObject,
        policy: &'a GuardPolicy,
        initial: u32,
        maximum: u32,
    ) -> Result<Self> {
        if maximum == 0 {
            return Err(ShmSyncError::invalid_parameter(
                "maximum",
                "Semaphore maximum must be greater than 0",
            ));
        }
        if initial > maximum {
            return Err(ShmSyncError::invalid_parameter(
                "initial",
                format!("Initial count {} exceeds maximum {}", initial, maximum),
            ));
        }

        let state = SemaphoreState { count: initial, maximum };
        object.initialize(policy, ObjectState::Semaphore(state))?;
        debug!("created semaphore {:p} {}/{}", object, initial, maximum);
        Ok(Self { object, policy })
    }

    /// View an existing semaphore record
    pub fn open(object: &'a SyncObject, policy: &'a GuardPolicy) -> Result<Self> {
        match object.object_type() {
            ObjectType::Semaphore => Ok(Self { object, policy }),
            found => Err(ShmSyncError::type_mismatch(ObjectType::Semaphore, found)),
        }
    }

    /// Return `units` to the semaphore; returns the count before the call
    pub fn release(&self, units: u32) -> Result<u32> {
        self.object
            .with_semaphore(self.policy, |state| release_step(state, units))
    }

    /// Take `units` if that many are available
    pub fn try_acquire(&self, units: u32) -> Result<Acquisition> {
        self.object
            .with_semaphore(self.policy, |state| acquire_step(state, units))
    }

    pub fn state(&self) -> Result<SemaphoreState> {
        self.object.with_semaphore(self.policy, |state| Ok(*state))
    }

    pub fn object(&self) -> &'a SyncObject {
        self.object
    }
}
