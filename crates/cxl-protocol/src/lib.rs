//! Transaction layer of the CXL emulator fabric.
//!
//! Everything that moves between two adjacent emulated components lives here:
//! the packet taxonomy for the four traffic classes (PCIe CFG, CXL.io MMIO,
//! CXL.mem and CXL.cache), the FIFO pairs that carry them, the internal
//! cache/memory request channels used inside a host or device, the runnable
//! component lifecycle shared by every actor, and the length-prefixed wire
//! format used when a fabric edge crosses a TCP socket.

pub mod component;
pub mod fabric;
pub mod fifo;
pub mod packet;
pub mod sideband;
pub mod wire;

pub use component::{ComponentError, ComponentState, ComponentStatus};
pub use fifo::{
    CacheFifoPair, CacheRequest, CacheResponse, CacheResponseStatus, CacheRequestOp,
    CxlConnection, Fifo, FifoPair, MemoryFifoPair, MemoryRequest, MemoryRequestOp,
    MemoryResponse, MemoryResponseStatus,
};
pub use packet::{
    Bdf, CacheLineData, CplStatus, CxlCachePacket, CxlIoPacket, CxlMemPacket,
};
