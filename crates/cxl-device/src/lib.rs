//! Emulated CXL endpoint devices and their coherency engines.
//!
//! The device coherency engine (DCOH) has two halves: [`mem_dcoh`] serves
//! CXL.mem traffic as the memory target (including back-invalidation when the
//! host holds HDM-DB lines), and [`cache_dcoh`] drives CXL.cache as a caching
//! agent for host memory. On top of those sit the Type 1 / Type 2 / Type 3
//! endpoint devices and the multi-logical-device wrapper.

pub mod cache_dcoh;
pub mod devices;
pub mod llc_iogen;
pub mod mem_dcoh;
pub mod memory_device;
pub mod mld;

pub use cache_dcoh::CxlCacheDcoh;
pub use devices::{CxlType1Device, CxlType2Device, CxlType3Device, MemoryBacking};
pub use llc_iogen::DeviceLlcIoGen;
pub use mem_dcoh::CxlMemDcoh;
pub use memory_device::{CxlMemoryDeviceComponent, MemoryDeviceIdentity};
pub use mld::MultiLogicalDevice;
