//! Cross-process manual-reset and auto-reset events
//!
//! There is no waiter list in the record. An auto-reset signal is consumed
//! by the first poll that observes it, inside the same guarded step, so each
//! `signal` is seen by exactly one poller.

use log::debug;

use crate::error::{Result, ShmSyncError};
use crate::sync::guard::GuardPolicy;

use super::record::{EventState, ObjectState, ObjectType, SyncObject};

pub(crate) fn poll_step(state: &mut EventState) -> bool {
    if !state.is_signaled() {
        return false;
    }
    if !state.is_manual_reset() {
        state.signaled = 0;
    }
    true
}

/// Event view over a shared record
#[derive(Debug, Clone, Copy)]
pub struct SharedEvent<'a> {
    object: &'a SyncObject,
    policy: &'a GuardPolicy,
}

impl<'a> SharedEvent<'a> {
    /// Initialize an unknown record as an event
    pub fn create(
        object: &'a SyncObject,
        policy: &'a GuardPolicy,
        manual_reset: bool,
        initial_signaled: bool,
    ) -> Result<Self> {
        let state = EventState {
            manual_reset: manual_reset as u32,
            signaled: initial_signaled as u32,
        };
        object.initialize(policy, ObjectState::Event(state))?;
        debug!(
            "created {} event {:p}",
            if manual_reset { "manual-reset" } else { "auto-reset" },
            object
        );
        Ok(Self { object, policy })
    }

    /// View an existing event record
    pub fn open(object: &'a SyncObject, policy: &'a GuardPolicy) -> Result<Self> {
        match object.object_type() {
            ObjectType::Event => Ok(Self { object, policy }),
            found => Err(ShmSyncError::type_mismatch(ObjectType::Event, found)),
        }
    }

    /// Set the event; returns whether it was already signaled
    pub fn signal(&self) -> Result<bool> {
        self.object.with_event(self.policy, |state| {
            let previous = state.is_signaled();
            state.signaled = 1;
            Ok(previous)
        })
    }

    /// Clear the event; returns whether it was signaled
    pub fn reset(&self) -> Result<bool> {
        self.object.with_event(self.policy, |state| {
            let previous = state.is_signaled();
            state.signaled = 0;
            Ok(previous)
        })
    }

    /// Observe the event, consuming the signal if it is auto-reset
    pub fn poll(&self) -> Result<bool> {
        self.object.with_event(self.policy, |state| Ok(poll_step(state)))
    }

    pub fn state(&self) -> Result<EventState> {
        self.object.with_event(self.policy, |state| Ok(*state))
    }

    pub fn object(&self) -> &'a SyncObject {
        self.object
    }
}
