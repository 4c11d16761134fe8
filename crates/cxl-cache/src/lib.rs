//! Backing store and last-level cache of the emulated hosts and devices.

pub mod accessor;
pub mod controller;

pub use accessor::{AccessorError, BackingStore, MemoryAccessor};
pub use controller::{
    CacheController, CacheControllerConfig, CacheError, MemAddrType, MemoryRange,
};
