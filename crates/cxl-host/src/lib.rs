//! The emulated host: root complex (IO bridge, home agent, cache coherency
//! bridge, memory controller), memory hub, CPU, and the PCI/CXL enumeration
//! drivers.

pub mod coh_bridge;
pub mod cpu;
pub mod drivers;
pub mod home_agent;
pub mod host;
pub mod io_bridge;
pub mod memory_controller;
pub mod memory_hub;
pub mod root_complex;

pub use coh_bridge::CacheCoherencyBridge;
pub use cpu::Cpu;
pub use home_agent::{CohPolicy, HomeAgent};
pub use host::{CxlHost, CxlHostConfig, RootPortLink};
pub use io_bridge::IoBridge;
pub use memory_controller::MemoryController;
pub use memory_hub::CxlMemoryHub;
pub use root_complex::{RootComplex, RootComplexConfig};

use thiserror::Error;

use cxl_cache::accessor::AccessorError;
use cxl_cache::controller::CacheError;
use cxl_protocol::wire::WireError;
use cxl_protocol::ComponentError;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("access to 0x{0:x} timed out")]
    Timeout(u64),
    #[error("address 0x{0:x} is out of bounds")]
    OutOfBounds(u64),
    #[error("size and address must be aligned to the cache line")]
    Misaligned,
    #[error("accessing the root bus is not supported in pass-through mode")]
    RootBusAccess,
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Accessor(#[from] AccessorError),
    #[error(transparent)]
    Wire(#[from] WireError),
}
