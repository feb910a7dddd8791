//! Fixed-slot object tables inside shared memory regions
//!
//! The table stands in for the allocator collaborator of the object layer:
//! it hands out zero-initialized records at stable offsets, so a `SlotId`
//! names the same object in every process that attached the region.

pub mod header;
pub mod manager;
pub mod stats;

pub use header::{TableHeader, TableLayout, TABLE_MAGIC, TABLE_VERSION};
pub use manager::{ObjectTable, SlotId, TableConfig};
pub use stats::TableStats;
