//! Fixed-layout object record shared across processes
//!
//! Byte layout (20 bytes, 4-byte aligned, identical in every process):
//!
//! ```text
//! offset  size  field
//!      0     4  guard word   (0 = free, see `sync::guard`)
//!      4     4  type tag     (0 unknown, 1 mutex, 2 event, 3 semaphore)
//!      8    12  payload      mutex:     owner, count, abandoned
//!                            event:     manual_reset, signaled, -
//!                            semaphore: count, maximum, -
//! ```
//!
//! All-zero bytes decode to an unknown (uninitialized) object. Flags are
//! stored as `u32` rather than `bool` because a peer process may leave any
//! bit pattern in the page.

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::{align_of, size_of};
use std::sync::atomic::{AtomicU32, Ordering};

use log::debug;

use crate::error::{Result, ShmSyncError};
use crate::sync::guard::{GuardPolicy, GuardWord};

use super::{event, mutex, semaphore, Acquisition};

/// Type tag stored in the record
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Unknown = 0,
    Mutex = 1,
    Event = 2,
    Semaphore = 3,
}

impl ObjectType {
    /// Decode a raw tag; unrecognized values read as `Unknown`
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            1 => ObjectType::Mutex,
            2 => ObjectType::Event,
            3 => ObjectType::Semaphore,
            _ => ObjectType::Unknown,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ObjectType::Unknown => "unknown",
            ObjectType::Mutex => "mutex",
            ObjectType::Event => "event",
            ObjectType::Semaphore => "semaphore",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Opaque cross-process thread identifier; zero is the unheld sentinel
#[repr(transparent)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ptid(u32);

impl Ptid {
    /// No thread
    pub const NONE: Ptid = Ptid(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    pub const fn is_none(&self) -> bool {
        self.0 == 0
    }

    /// Identifier of the calling OS thread
    #[cfg(target_os = "linux")]
    pub fn current() -> Self {
        Self(nix::unistd::gettid().as_raw() as u32)
    }

    /// Identifier of the calling OS thread
    #[cfg(not(target_os = "linux"))]
    pub fn current() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        thread_local! {
            static LOCAL: u32 = NEXT.fetch_add(1, Ordering::Relaxed);
        }
        Self(LOCAL.with(|id| (std::process::id() << 16) ^ *id))
    }
}

impl fmt::Display for Ptid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Mutex payload
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MutexState {
    /// Holding thread, `Ptid::NONE` when unheld
    pub owner: Ptid,
    /// Recursion depth, 0 when unheld
    pub count: u32,
    /// Non-zero when the last owner died holding the mutex
    pub abandoned: u32,
}

impl MutexState {
    pub fn is_held(&self) -> bool {
        self.count > 0
    }

    pub fn is_abandoned(&self) -> bool {
        self.abandoned != 0
    }
}

/// Event payload
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EventState {
    pub manual_reset: u32,
    pub signaled: u32,
}

impl EventState {
    pub fn is_manual_reset(&self) -> bool {
        self.manual_reset != 0
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled != 0
    }
}

/// Semaphore payload
#[repr(C)]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SemaphoreState {
    pub count: u32,
    pub maximum: u32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) union Payload {
    mutex: MutexState,
    event: EventState,
    semaphore: SemaphoreState,
    raw: [u32; 3],
}

/// Decoded copy of a record, taken under the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectState {
    Unknown,
    Mutex(MutexState),
    Event(EventState),
    Semaphore(SemaphoreState),
}

impl ObjectState {
    pub fn object_type(&self) -> ObjectType {
        match self {
            ObjectState::Unknown => ObjectType::Unknown,
            ObjectState::Mutex(_) => ObjectType::Mutex,
            ObjectState::Event(_) => ObjectType::Event,
            ObjectState::Semaphore(_) => ObjectType::Semaphore,
        }
    }
}

impl fmt::Display for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectState::Unknown => write!(f, "unknown"),
            ObjectState::Mutex(m) => write!(
                f,
                "mutex owner={} count={}{}",
                m.owner,
                m.count,
                if m.is_abandoned() { " abandoned" } else { "" }
            ),
            ObjectState::Event(e) => write!(
                f,
                "event {} signaled={}",
                if e.is_manual_reset() { "manual" } else { "auto" },
                e.is_signaled()
            ),
            ObjectState::Semaphore(s) => {
                write!(f, "semaphore count={}/{}", s.count, s.maximum)
            }
        }
    }
}

/// One shared synchronization object record
#[repr(C)]
pub struct SyncObject {
    guard: GuardWord,
    kind: AtomicU32,
    payload: UnsafeCell<Payload>,
}

// Payload access is serialized by the guard word
unsafe impl Sync for SyncObject {}
unsafe impl Send for SyncObject {}

const _: () = assert!(size_of::<SyncObject>() == 20);
const _: () = assert!(align_of::<SyncObject>() == 4);

impl SyncObject {
    /// Size of one record in bytes
    pub const SIZE: usize = size_of::<SyncObject>();

    /// A record as the slot allocator hands it out: all zero, type unknown
    pub const fn zeroed() -> Self {
        Self {
            guard: GuardWord::new(),
            kind: AtomicU32::new(0),
            payload: UnsafeCell::new(Payload { raw: [0; 3] }),
        }
    }

    /// Type tag; fixed from initialization until the slot is freed
    pub fn object_type(&self) -> ObjectType {
        ObjectType::from_raw(self.kind.load(Ordering::Acquire))
    }

    pub fn guard(&self) -> &GuardWord {
        &self.guard
    }

    /// Return the record to the all-zero unknown state under its guard
    ///
    /// A peer that already passed an unguarded type check sees `Unknown`
    /// once it holds the guard, so it can never act on the old payload.
    pub(crate) fn retire(&self, policy: &GuardPolicy) -> Result<ObjectType> {
        let _hold = self.guard.acquire(policy)?;
        let previous = ObjectType::from_raw(self.kind.swap(0, Ordering::AcqRel));
        unsafe { std::ptr::write(self.payload.get(), Payload { raw: [0; 3] }) };
        Ok(previous)
    }

    /// Set the type tag and initial payload, exactly once
    pub(crate) fn initialize(&self, policy: &GuardPolicy, state: ObjectState) -> Result<()> {
        let payload = match state {
            ObjectState::Unknown => {
                return Err(ShmSyncError::invalid_parameter(
                    "state",
                    "Cannot initialize an object as unknown",
                ))
            }
            ObjectState::Mutex(mutex) => Payload { mutex },
            ObjectState::Event(event) => Payload { event },
            ObjectState::Semaphore(semaphore) => Payload { semaphore },
        };

        let _hold = self.guard.acquire(policy)?;
        let raw = self.kind.load(Ordering::Acquire);
        if raw != 0 {
            return Err(ShmSyncError::already_initialized(ObjectType::from_raw(raw)));
        }

        unsafe { std::ptr::write(self.payload.get(), payload) };
        self.kind.store(state.object_type() as u32, Ordering::Release);
        debug!("initialized {:p} as {}", self, state);
        Ok(())
    }

    /// Run `f` on the payload with the guard held, whatever the type
    fn with_any<R>(
        &self,
        policy: &GuardPolicy,
        f: impl FnOnce(ObjectType, &mut Payload) -> Result<R>,
    ) -> Result<R> {
        let _hold = self.guard.acquire(policy)?;
        let kind = self.object_type();
        // exclusive: the guard is held until `_hold` drops
        let payload = unsafe { &mut *self.payload.get() };
        f(kind, payload)
    }

    fn with_type<R>(
        &self,
        policy: &GuardPolicy,
        expected: ObjectType,
        f: impl FnOnce(&mut Payload) -> Result<R>,
    ) -> Result<R> {
        self.with_any(policy, |kind, payload| {
            if kind != expected {
                return Err(ShmSyncError::type_mismatch(expected, kind));
            }
            f(payload)
        })
    }

    pub(crate) fn with_mutex<R>(
        &self,
        policy: &GuardPolicy,
        f: impl FnOnce(&mut MutexState) -> Result<R>,
    ) -> Result<R> {
        self.with_type(policy, ObjectType::Mutex, |payload| f(unsafe { &mut payload.mutex }))
    }

    pub(crate) fn with_event<R>(
        &self,
        policy: &GuardPolicy,
        f: impl FnOnce(&mut EventState) -> Result<R>,
    ) -> Result<R> {
        self.with_type(policy, ObjectType::Event, |payload| f(unsafe { &mut payload.event }))
    }

    pub(crate) fn with_semaphore<R>(
        &self,
        policy: &GuardPolicy,
        f: impl FnOnce(&mut SemaphoreState) -> Result<R>,
    ) -> Result<R> {
        self.with_type(policy, ObjectType::Semaphore, |payload| {
            f(unsafe { &mut payload.semaphore })
        })
    }

    /// Read a consistent copy of the record
    pub fn snapshot(&self, policy: &GuardPolicy) -> Result<ObjectState> {
        self.with_any(policy, |kind, payload| {
            Ok(unsafe {
                match kind {
                    ObjectType::Unknown => ObjectState::Unknown,
                    ObjectType::Mutex => ObjectState::Mutex(payload.mutex),
                    ObjectType::Event => ObjectState::Event(payload.event),
                    ObjectType::Semaphore => ObjectState::Semaphore(payload.semaphore),
                }
            })
        })
    }

    /// Non-blocking wait-check dispatched on the type tag
    ///
    /// Mutexes are acquired for `requester`, events are polled (consuming an
    /// auto-reset signal), semaphores give up one unit.
    pub fn try_wait(&self, policy: &GuardPolicy, requester: Ptid) -> Result<Acquisition> {
        self.with_any(policy, |kind, payload| unsafe {
            match kind {
                ObjectType::Mutex => mutex::acquire_step(&mut payload.mutex, requester),
                ObjectType::Event => Ok(if event::poll_step(&mut payload.event) {
                    Acquisition::Acquired
                } else {
                    Acquisition::NotAvailable
                }),
                ObjectType::Semaphore => semaphore::acquire_step(&mut payload.semaphore, 1),
                ObjectType::Unknown => Err(ShmSyncError::untyped()),
            }
        })
    }
}

impl Default for SyncObject {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for SyncObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncObject")
            .field("guard", &self.guard.raw())
            .field("type", &self.object_type())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> GuardPolicy {
        GuardPolicy::new().with_holder_id(1)
    }

    #[test]
    fn test_zeroed_record_is_unknown() {
        let object = SyncObject::zeroed();
        assert_eq!(object.object_type(), ObjectType::Unknown);
        assert_eq!(object.snapshot(&policy()).unwrap(), ObjectState::Unknown);
        assert!(!object.guard().is_held());
    }

    #[test]
    fn test_layout_offsets() {
        let object = SyncObject::zeroed();
        let base = &object as *const SyncObject as usize;
        assert_eq!(object.guard() as *const GuardWord as usize - base, 0);
        assert_eq!(&object.kind as *const AtomicU32 as usize - base, 4);
        assert_eq!(object.payload.get() as usize - base, 8);
        assert_eq!(SyncObject::SIZE, 20);
    }

    #[test]
    fn test_zero_bytes_decode_as_unknown() {
        let bytes = [0u32; 5];
        let object = unsafe { &*(bytes.as_ptr() as *const SyncObject) };
        assert_eq!(object.object_type(), ObjectType::Unknown);
    }

    #[test]
    fn test_initialize_once() {
        let object = SyncObject::zeroed();
        let state = ObjectState::Semaphore(SemaphoreState { count: 1, maximum: 4 });
        object.initialize(&policy(), state).unwrap();
        assert_eq!(object.object_type(), ObjectType::Semaphore);
        assert_eq!(object.snapshot(&policy()).unwrap(), state);

        let again = object.initialize(&policy(), ObjectState::Event(EventState::default()));
        assert!(matches!(
            again,
            Err(ShmSyncError::AlreadyInitialized { found: ObjectType::Semaphore })
        ));
        assert!(!object.guard().is_held());
    }

    #[test]
    fn test_initialize_unknown_rejected() {
        let object = SyncObject::zeroed();
        assert!(object.initialize(&policy(), ObjectState::Unknown).is_err());
        assert_eq!(object.object_type(), ObjectType::Unknown);
    }

    #[test]
    fn test_wrong_type_rejected() {
        let object = SyncObject::zeroed();
        object
            .initialize(&policy(), ObjectState::Event(EventState::default()))
            .unwrap();

        let result = object.with_mutex(&policy(), |m| Ok(m.count));
        assert!(matches!(
            result,
            Err(ShmSyncError::TypeMismatch {
                expected: Some(ObjectType::Mutex),
                found: ObjectType::Event
            })
        ));
        assert!(!object.guard().is_held());
    }

    #[test]
    fn test_try_wait_dispatch() {
        let requester = Ptid::new(5);

        let mutex = SyncObject::zeroed();
        mutex
            .initialize(&policy(), ObjectState::Mutex(MutexState::default()))
            .unwrap();
        assert_eq!(mutex.try_wait(&policy(), requester).unwrap(), Acquisition::Acquired);
        assert_eq!(
            mutex.try_wait(&policy(), requester).unwrap(),
            Acquisition::Recursive(2)
        );

        let event = SyncObject::zeroed();
        event
            .initialize(
                &policy(),
                ObjectState::Event(EventState { manual_reset: 0, signaled: 1 }),
            )
            .unwrap();
        assert_eq!(event.try_wait(&policy(), requester).unwrap(), Acquisition::Acquired);
        assert_eq!(
            event.try_wait(&policy(), requester).unwrap(),
            Acquisition::NotAvailable
        );

        let semaphore = SyncObject::zeroed();
        semaphore
            .initialize(
                &policy(),
                ObjectState::Semaphore(SemaphoreState { count: 1, maximum: 1 }),
            )
            .unwrap();
        assert_eq!(
            semaphore.try_wait(&policy(), requester).unwrap(),
            Acquisition::Acquired
        );
        assert_eq!(
            semaphore.try_wait(&policy(), requester).unwrap(),
            Acquisition::NotAvailable
        );

        let unknown = SyncObject::zeroed();
        assert!(matches!(
            unknown.try_wait(&policy(), requester),
            Err(ShmSyncError::TypeMismatch {
                expected: None,
                found: ObjectType::Unknown
            })
        ));
    }

    #[test]
    fn test_retire_resets_to_unknown() {
        let object = SyncObject::zeroed();
        object
            .initialize(
                &policy(),
                ObjectState::Mutex(MutexState { owner: Ptid::new(9), count: 2, abandoned: 0 }),
            )
            .unwrap();

        assert_eq!(object.retire(&policy()).unwrap(), ObjectType::Mutex);
        assert_eq!(object.object_type(), ObjectType::Unknown);
        assert_eq!(object.snapshot(&policy()).unwrap(), ObjectState::Unknown);
        assert!(!object.guard().is_held());

        // a view opened before the retire fails its guarded type check
        assert!(matches!(
            object.with_mutex(&policy(), |state| Ok(state.count)),
            Err(ShmSyncError::TypeMismatch { found: ObjectType::Unknown, .. })
        ));
        object
            .initialize(&policy(), ObjectState::Event(EventState::default()))
            .unwrap();
    }

    #[test]
    fn test_state_display() {
        let state = ObjectState::Mutex(MutexState {
            owner: Ptid::new(0x10),
            count: 2,
            abandoned: 1,
        });
        let text = state.to_string();
        assert!(text.contains("owner=0x10"));
        assert!(text.contains("count=2"));
        assert!(text.contains("abandoned"));
    }
}
