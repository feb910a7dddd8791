//! On-disk/in-memory layout of an object table
//!
//! ```text
//! 0                 32               slots_offset (64-aligned)
//! | TableHeader     | bitmap words   | SyncObject x capacity |
//! ```

use std::mem::size_of;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::error::{Result, ShmSyncError};
use crate::objects::SyncObject;

/// Magic number identifying an object table ("SHMSYNC" + 1)
pub const TABLE_MAGIC: u64 = 0x53484D53594E4301;

/// Current table layout version
pub const TABLE_VERSION: u32 = 1;

/// Alignment of the slot array
pub const SLOT_ALIGNMENT: usize = 64;

/// Global header at the start of the table region
#[repr(C)]
pub struct TableHeader {
    /// Written last by the creator; zero until the header is complete
    pub magic: AtomicU64,
    pub version: u32,
    pub capacity: u32,
    pub record_size: u32,
    /// Currently allocated slots
    pub allocated: AtomicU32,
    pub bitmap_offset: u32,
    pub slots_offset: u32,
}

const _: () = assert!(size_of::<TableHeader>() == 32);

/// Byte offsets of the table sections for a given capacity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableLayout {
    pub capacity: u32,
    pub bitmap_offset: usize,
    pub bitmap_words: usize,
    pub slots_offset: usize,
    pub total_size: usize,
}

impl TableLayout {
    pub fn for_capacity(capacity: u32) -> Self {
        let bitmap_offset = size_of::<TableHeader>();
        let bitmap_words = (capacity as usize + 63) / 64;
        let bitmap_end = bitmap_offset + bitmap_words * size_of::<u64>();
        let slots_offset = (bitmap_end + SLOT_ALIGNMENT - 1) & !(SLOT_ALIGNMENT - 1);
        let total_size = slots_offset + capacity as usize * SyncObject::SIZE;

        Self {
            capacity,
            bitmap_offset,
            bitmap_words,
            slots_offset,
            total_size,
        }
    }
}

impl TableHeader {
    /// Fill in every field except `magic`
    pub fn prepare(&mut self, layout: &TableLayout) {
        self.version = TABLE_VERSION;
        self.capacity = layout.capacity;
        self.record_size = SyncObject::SIZE as u32;
        self.allocated = AtomicU32::new(0);
        self.bitmap_offset = layout.bitmap_offset as u32;
        self.slots_offset = layout.slots_offset as u32;
    }

    /// Publish the header to attaching processes
    pub fn publish(&self) {
        self.magic.store(TABLE_MAGIC, Ordering::Release);
    }

    /// Validate an existing header against the region it lives in
    pub fn validate(&self, region_size: usize) -> Result<TableLayout> {
        let magic = self.magic.load(Ordering::Acquire);
        if magic != TABLE_MAGIC {
            return Err(ShmSyncError::invalid_layout(format!(
                "Bad table magic {:#x}",
                magic
            )));
        }
        if self.version != TABLE_VERSION {
            return Err(ShmSyncError::invalid_layout(format!(
                "Unsupported table version {}",
                self.version
            )));
        }
        if self.record_size as usize != SyncObject::SIZE {
            return Err(ShmSyncError::invalid_layout(format!(
                "Record size {} does not match {}",
                self.record_size,
                SyncObject::SIZE
            )));
        }

        let layout = TableLayout::for_capacity(self.capacity);
        if layout.bitmap_offset != self.bitmap_offset as usize
            || layout.slots_offset != self.slots_offset as usize
        {
            return Err(ShmSyncError::invalid_layout("Section offsets do not match capacity"));
        }
        if layout.total_size > region_size {
            return Err(ShmSyncError::invalid_layout(format!(
                "Table needs {} bytes, region has {}",
                layout.total_size, region_size
            )));
        }
        Ok(layout)
    }
}
