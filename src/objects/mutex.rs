//! Cross-process recursive mutex with abandonment

use log::{debug, warn};

use crate::config::MAX_MUTEX_RECURSION;
use crate::error::{Result, ShmSyncError};
use crate::sync::guard::GuardPolicy;

use super::record::{MutexState, ObjectState, ObjectType, Ptid, SyncObject};
use super::Acquisition;

pub(crate) fn acquire_step(state: &mut MutexState, requester: Ptid) -> Result<Acquisition> {
    check_requester(requester)?;

    if state.count == 0 {
        state.owner = requester;
        state.count = 1;
        if state.is_abandoned() {
            state.abandoned = 0;
            return Ok(Acquisition::Abandoned);
        }
        return Ok(Acquisition::Acquired);
    }

    if state.owner == requester {
        if state.count >= MAX_MUTEX_RECURSION {
            return Err(ShmSyncError::overflow(ObjectType::Mutex, MAX_MUTEX_RECURSION));
        }
        state.count += 1;
        return Ok(Acquisition::Recursive(state.count));
    }

    Ok(Acquisition::NotAvailable)
}

fn release_step(state: &mut MutexState, requester: Ptid) -> Result<u32> {
    if state.count == 0 || state.owner != requester {
        return Err(ShmSyncError::not_owner(state.owner, requester));
    }

    let previous = state.count;
    state.count -= 1;
    if state.count == 0 {
        state.owner = Ptid::NONE;
    }
    Ok(previous)
}

fn abandon_step(state: &mut MutexState) {
    state.owner = Ptid::NONE;
    state.count = 0;
    state.abandoned = 1;
}

fn check_requester(requester: Ptid) -> Result<()> {
    if requester.is_none() {
        return Err(ShmSyncError::invalid_parameter(
            "requester",
            "Requester must not be the unheld sentinel",
        ));
    }
    Ok(())
}

/// Mutex view over a shared record
#[derive(Debug, Clone, Copy)]
pub struct SharedMutex<'a> {
    object: &'a SyncObject,
    policy: &'a GuardPolicy,
}

impl<'a> SharedMutex<'a> {
    /// Initialize an unknown record as a mutex, optionally already held
    pub fn create(
        object: &'a SyncObject,
        policy: &'a GuardPolicy,
        initial_owner: Option<Ptid>,
    ) -> Result<Self> {
        let state = match initial_owner {
            Some(owner) => {
                check_requester(owner)?;
                MutexState { owner, count: 1, abandoned: 0 }
            }
            None => MutexState::default(),
        };
        object.initialize(policy, ObjectState::Mutex(state))?;
        debug!("created mutex {:p} owner={}", object, state.owner);
        Ok(Self { object, policy })
    }

    /// View an existing mutex record
    pub fn open(object: &'a SyncObject, policy: &'a GuardPolicy) -> Result<Self> {
        match object.object_type() {
            ObjectType::Mutex => Ok(Self { object, policy }),
            found => Err(ShmSyncError::type_mismatch(ObjectType::Mutex, found)),
        }
    }

    /// Take the mutex for `requester` if it is free or already theirs
    pub fn try_acquire(&self, requester: Ptid) -> Result<Acquisition> {
        self.object
            .with_mutex(self.policy, |state| acquire_step(state, requester))
    }

    /// Drop one level of recursion; returns the depth before the call
    pub fn release(&self, requester: Ptid) -> Result<u32> {
        self.object
            .with_mutex(self.policy, |state| release_step(state, requester))
    }

    /// Upcall for the owner-death detector: force the mutex free and flag it
    pub fn mark_abandoned(&self) -> Result<()> {
        let previous = self.object.with_mutex(self.policy, |state| {
            let previous = *state;
            abandon_step(state);
            Ok(previous)
        })?;
        warn!(
            "mutex {:p} abandoned by {} at depth {}",
            self.object, previous.owner, previous.count
        );
        Ok(())
    }

    /// Mark abandoned only if `owner` holds the mutex right now
    pub fn abandon_if_owned_by(&self, owner: Ptid) -> Result<bool> {
        let abandoned = self.object.with_mutex(self.policy, |state| {
            if owner.is_none() || !state.is_held() || state.owner != owner {
                return Ok(false);
            }
            abandon_step(state);
            Ok(true)
        })?;
        if abandoned {
            warn!("mutex {:p} abandoned by exiting thread {}", self.object, owner);
        }
        Ok(abandoned)
    }

    pub fn state(&self) -> Result<MutexState> {
        self.object.with_mutex(self.policy, |state| Ok(*state))
    }

    pub fn object(&self) -> &'a SyncObject {
        self.object
    }
}
