//! Object table: fixed-size slots for sync objects inside a shared region

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use log::{debug, warn};

use crate::{
    config::DEFAULT_TABLE_CAPACITY,
    error::{Result, ShmSyncError},
    memory::SharedMemoryRegion,
    objects::{
        Acquisition, ObjectState, ObjectType, Ptid, SharedEvent, SharedMutex, SharedSemaphore,
        SyncObject,
    },
    sync::guard::GuardPolicy,
};

use super::{
    header::{TableHeader, TableLayout},
    stats::TableStats,
};

/// Index of a slot in an object table; identical in every attached process
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Configuration for creating or attaching to an object table
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Number of slots (used when creating)
    pub capacity: u32,
    /// Guard policy for every object in the table
    pub guard: GuardPolicy,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_TABLE_CAPACITY,
            guard: GuardPolicy::default(),
        }
    }
}

impl TableConfig {
    pub fn new(capacity: u32) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    pub fn with_guard_policy(mut self, guard: GuardPolicy) -> Self {
        self.guard = guard;
        self
    }

    /// Bytes a region needs to hold a table of this capacity
    pub fn region_size(&self) -> usize {
        TableLayout::for_capacity(self.capacity).total_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.capacity == 0 {
            return Err(ShmSyncError::invalid_parameter(
                "capacity",
                "Table capacity must be greater than 0",
            ));
        }
        self.guard.validate()
    }
}

/// Allocator and accessor for the sync objects of one shared region
pub struct ObjectTable {
    region: Arc<SharedMemoryRegion>,
    header: *const TableHeader,
    bitmap: *const AtomicU64,
    slots: *const SyncObject,
    layout: TableLayout,
    policy: GuardPolicy,
}

// All shared state behind the pointers is atomics or guarded records
unsafe impl Send for ObjectTable {}
unsafe impl Sync for ObjectTable {}

impl ObjectTable {
    /// Lay out a fresh table in `region`, discarding whatever it held
    pub fn create(region: Arc<SharedMemoryRegion>, config: TableConfig) -> Result<Self> {
        config.validate()?;
        let layout = TableLayout::for_capacity(config.capacity);
        if layout.total_size > region.size() {
            return Err(ShmSyncError::invalid_parameter(
                "capacity",
                format!(
                    "{} slots need {} bytes, region {} has {}",
                    config.capacity,
                    layout.total_size,
                    region.name(),
                    region.size()
                ),
            ));
        }

        let base = region.as_ptr() as *mut u8;
        unsafe {
            let header = base as *mut TableHeader;
            (*header).magic.store(0, Ordering::Release);
            std::ptr::write_bytes(
                base.add(layout.bitmap_offset),
                0,
                layout.total_size - layout.bitmap_offset,
            );
            (*header).prepare(&layout);
            (*header).publish();
        }

        debug!(
            "created object table in {} with {} slots",
            region.name(),
            layout.capacity
        );
        Ok(Self::from_parts(region, layout, config.guard))
    }

    /// Attach to a table another process created; `config.capacity` is ignored
    pub fn attach(region: Arc<SharedMemoryRegion>, config: TableConfig) -> Result<Self> {
        config.guard.validate()?;
        let header = unsafe { &*(region.as_ptr() as *const TableHeader) };
        let layout = header.validate(region.size())?;
        debug!(
            "attached object table in {} with {} slots",
            region.name(),
            layout.capacity
        );
        Ok(Self::from_parts(region, layout, config.guard))
    }

    fn from_parts(region: Arc<SharedMemoryRegion>, layout: TableLayout, policy: GuardPolicy) -> Self {
        let base = region.as_ptr();
        unsafe {
            Self {
                header: base as *const TableHeader,
                bitmap: base.add(layout.bitmap_offset) as *const AtomicU64,
                slots: base.add(layout.slots_offset) as *const SyncObject,
                region,
                layout,
                policy,
            }
        }
    }

    fn header(&self) -> &TableHeader {
        unsafe { &*self.header }
    }

    fn bitmap_word(&self, index: usize) -> &AtomicU64 {
        debug_assert!(index < self.layout.bitmap_words);
        unsafe { &*self.bitmap.add(index) }
    }

    /// Bits of bitmap word `index` that correspond to real slots
    fn word_mask(&self, index: usize) -> u64 {
        let remainder = self.layout.capacity as usize - index * 64;
        if remainder >= 64 {
            u64::MAX
        } else {
            (1u64 << remainder) - 1
        }
    }

    fn record(&self, slot: SlotId) -> &SyncObject {
        unsafe { &*self.slots.add(slot.0 as usize) }
    }

    pub fn capacity(&self) -> u32 {
        self.layout.capacity
    }

    pub fn policy(&self) -> &GuardPolicy {
        &self.policy
    }

    pub fn region(&self) -> &Arc<SharedMemoryRegion> {
        &self.region
    }

    /// Whether `slot` is currently handed out
    pub fn is_allocated(&self, slot: SlotId) -> bool {
        if slot.0 >= self.layout.capacity {
            return false;
        }
        let (word, bit) = (slot.0 as usize / 64, slot.0 % 64);
        self.bitmap_word(word).load(Ordering::Acquire) & (1u64 << bit) != 0
    }

    /// Claim a free slot; its record is all zero (type unknown)
    pub fn alloc(&self) -> Result<SlotId> {
        for index in 0..self.layout.bitmap_words {
            let word = self.bitmap_word(index);
            let mask = self.word_mask(index);
            let mut current = word.load(Ordering::Relaxed);

            while current & mask != mask {
                let bit = (!current & mask).trailing_zeros();
                match word.compare_exchange_weak(
                    current,
                    current | (1u64 << bit),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // records of free slots are already zero, see `free`
                        let slot = SlotId(index as u32 * 64 + bit);
                        self.header().allocated.fetch_add(1, Ordering::Relaxed);
                        debug!("allocated slot {} in {}", slot, self.region.name());
                        return Ok(slot);
                    }
                    Err(actual) => current = actual,
                }
            }
        }

        Err(ShmSyncError::table_full(self.layout.capacity))
    }

    /// Return a slot to the allocator
    ///
    /// Callers must make sure no process still uses the object.
    pub fn free(&self, slot: SlotId) -> Result<()> {
        if !self.is_allocated(slot) {
            return Err(ShmSyncError::invalid_slot(slot.0));
        }

        // zero under the guard before the bit goes, so a reused slot never
        // carries the old type
        let kind = self.record(slot).retire(&self.policy)?;

        let (word, bit) = (slot.0 as usize / 64, slot.0 % 64);
        let previous = self
            .bitmap_word(word)
            .fetch_and(!(1u64 << bit), Ordering::AcqRel);
        if previous & (1u64 << bit) == 0 {
            return Err(ShmSyncError::invalid_slot(slot.0));
        }
        self.header().allocated.fetch_sub(1, Ordering::Relaxed);
        debug!("freed slot {} ({}) in {}", slot, kind, self.region.name());
        Ok(())
    }

    /// Record of an allocated slot
    pub fn get(&self, slot: SlotId) -> Result<&SyncObject> {
        if !self.is_allocated(slot) {
            return Err(ShmSyncError::invalid_slot(slot.0));
        }
        Ok(self.record(slot))
    }

    /// Allocated slots in index order
    pub fn allocated_slots(&self) -> Vec<SlotId> {
        let mut slots = Vec::new();
        for index in 0..self.layout.bitmap_words {
            let mut bits = self.bitmap_word(index).load(Ordering::Acquire) & self.word_mask(index);
            while bits != 0 {
                let bit = bits.trailing_zeros();
                slots.push(SlotId(index as u32 * 64 + bit));
                bits &= bits - 1;
            }
        }
        slots
    }

    /// Allocate and initialize in one step, releasing the slot on failure
    fn create_with<F>(&self, init: F) -> Result<SlotId>
    where
        F: FnOnce(&SyncObject, &GuardPolicy) -> Result<()>,
    {
        let slot = self.alloc()?;
        if let Err(e) = init(self.record(slot), &self.policy) {
            self.free(slot)?;
            return Err(e);
        }
        Ok(slot)
    }

    pub fn create_mutex(&self, initial_owner: Option<Ptid>) -> Result<SlotId> {
        self.create_with(|object, policy| {
            SharedMutex::create(object, policy, initial_owner).map(|_| ())
        })
    }

    pub fn create_event(&self, manual_reset: bool, initial_signaled: bool) -> Result<SlotId> {
        self.create_with(|object, policy| {
            SharedEvent::create(object, policy, manual_reset, initial_signaled).map(|_| ())
        })
    }

    pub fn create_semaphore(&self, initial: u32, maximum: u32) -> Result<SlotId> {
        self.create_with(|object, policy| {
            SharedSemaphore::create(object, policy, initial, maximum).map(|_| ())
        })
    }

    pub fn mutex(&self, slot: SlotId) -> Result<SharedMutex<'_>> {
        SharedMutex::open(self.get(slot)?, &self.policy)
    }

    pub fn event(&self, slot: SlotId) -> Result<SharedEvent<'_>> {
        SharedEvent::open(self.get(slot)?, &self.policy)
    }

    pub fn semaphore(&self, slot: SlotId) -> Result<SharedSemaphore<'_>> {
        SharedSemaphore::open(self.get(slot)?, &self.policy)
    }

    /// Non-blocking wait-check on whatever object `slot` holds
    pub fn try_wait(&self, slot: SlotId, requester: Ptid) -> Result<Acquisition> {
        self.get(slot)?.try_wait(&self.policy, requester)
    }

    pub fn snapshot(&self, slot: SlotId) -> Result<ObjectState> {
        self.get(slot)?.snapshot(&self.policy)
    }

    /// Mark every mutex held by `owner` abandoned; returns how many were
    ///
    /// Slots retyped or freed during the sweep are skipped. A slot whose
    /// guard times out does not stop the sweep; the sweep then ends with
    /// `SweepIncomplete` carrying the count and the unreachable slots.
    pub fn abandon_mutexes(&self, owner: Ptid) -> Result<usize> {
        let mut abandoned = 0;
        let mut stuck = Vec::new();
        for slot in self.allocated_slots() {
            let object = self.record(slot);
            if object.object_type() != ObjectType::Mutex {
                continue;
            }
            let mutex = match SharedMutex::open(object, &self.policy) {
                Ok(mutex) => mutex,
                Err(ShmSyncError::TypeMismatch { .. }) => continue,
                Err(e) => return Err(e),
            };
            match mutex.abandon_if_owned_by(owner) {
                Ok(true) => abandoned += 1,
                Ok(false) | Err(ShmSyncError::TypeMismatch { .. }) => {}
                Err(ShmSyncError::GuardTimeout { holder, .. }) => {
                    warn!("sweep for {} skipped slot {} held by {}", owner, slot, holder);
                    stuck.push(slot.0);
                }
                Err(e) => return Err(e),
            }
        }
        if abandoned > 0 {
            debug!("abandoned {} mutexes held by {}", abandoned, owner);
        }
        if !stuck.is_empty() {
            return Err(ShmSyncError::sweep_incomplete(abandoned, stuck));
        }
        Ok(abandoned)
    }

    pub fn stats(&self) -> TableStats {
        let mut stats = TableStats {
            capacity: self.layout.capacity,
            ..Default::default()
        };
        for slot in self.allocated_slots() {
            stats.record(self.record(slot).object_type());
        }
        stats
    }

    /// Every allocated slot with a guarded copy of its state
    pub fn dump(&self) -> Result<Vec<(SlotId, ObjectState)>> {
        self.allocated_slots()
            .into_iter()
            .map(|slot| Ok((slot, self.record(slot).snapshot(&self.policy)?)))
            .collect()
    }
}

impl fmt::Debug for ObjectTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectTable")
            .field("region", &self.region.name())
            .field("capacity", &self.layout.capacity)
            .field("allocated", &self.header().allocated.load(Ordering::Relaxed))
            .finish()
    }
}
