//! Shared memory regions backing object tables

pub mod config;
pub mod regions;

pub use config::{BackingType, RegionConfig};
pub use regions::{RegionMetadata, SharedMemoryRegion};
