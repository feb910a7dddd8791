//! Statistics for object tables

use serde::{Deserialize, Serialize};

use crate::objects::ObjectType;

/// Occupancy of an object table at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    /// Total slots
    pub capacity: u32,
    /// Slots handed out by the allocator
    pub allocated: u32,
    pub mutexes: u32,
    pub events: u32,
    pub semaphores: u32,
    /// Allocated but not yet typed
    pub uninitialized: u32,
}

impl TableStats {
    pub(crate) fn record(&mut self, kind: ObjectType) {
        self.allocated += 1;
        match kind {
            ObjectType::Mutex => self.mutexes += 1,
            ObjectType::Event => self.events += 1,
            ObjectType::Semaphore => self.semaphores += 1,
            ObjectType::Unknown => self.uninitialized += 1,
        }
    }

    /// Free slots
    pub fn available(&self) -> u32 {
        self.capacity.saturating_sub(self.allocated)
    }

    /// Fraction of slots in use
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.allocated as f64 / self.capacity as f64
    }
}
