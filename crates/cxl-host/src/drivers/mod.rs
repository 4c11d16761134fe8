//! Bus drivers: PCI depth-first enumeration, CXL DVSEC/component-register
//! discovery, HDM decoder programming, and the raw root-port accessor the
//! integration harness drives topologies with.

pub mod cxl_bus;
pub mod cxl_mem;
pub mod pci_bus;
pub mod root_port;

use futures::future::BoxFuture;

use cxl_protocol::packet::Bdf;

use crate::root_complex::RootComplex;
use crate::HostError;

/// Configuration and MMIO access surface the drivers run against: the full
/// root complex, or the bare root-port accessor used by the test harness.
pub trait HostIo: Send + Sync {
    fn read_config(
        &self,
        bdf: Bdf,
        offset: u16,
        size: usize,
    ) -> BoxFuture<'_, Result<u32, HostError>>;
    fn write_config(
        &self,
        bdf: Bdf,
        offset: u16,
        size: usize,
        value: u32,
    ) -> BoxFuture<'_, Result<(), HostError>>;
    fn read_mmio(&self, addr: u64, size: usize) -> BoxFuture<'_, Result<u64, HostError>>;
    fn write_mmio(
        &self,
        addr: u64,
        size: usize,
        value: u64,
    ) -> BoxFuture<'_, Result<(), HostError>>;
}

impl HostIo for RootComplex {
    fn read_config(
        &self,
        bdf: Bdf,
        offset: u16,
        size: usize,
    ) -> BoxFuture<'_, Result<u32, HostError>> {
        Box::pin(RootComplex::read_config(self, bdf, offset, size))
    }

    fn write_config(
        &self,
        bdf: Bdf,
        offset: u16,
        size: usize,
        value: u32,
    ) -> BoxFuture<'_, Result<(), HostError>> {
        Box::pin(RootComplex::write_config(self, bdf, offset, size, value))
    }

    fn read_mmio(&self, addr: u64, size: usize) -> BoxFuture<'_, Result<u64, HostError>> {
        Box::pin(RootComplex::read_mmio(self, addr, size))
    }

    fn write_mmio(
        &self,
        addr: u64,
        size: usize,
        value: u64,
    ) -> BoxFuture<'_, Result<(), HostError>> {
        Box::pin(RootComplex::write_mmio(self, addr, size, value))
    }
}

pub use cxl_bus::{CxlBusDriver, CxlDeviceInfo};
pub use cxl_mem::CxlMemDriver;
pub use pci_bus::{EnumerationInfo, PciBusDriver, PciDeviceInfo};
pub use root_port::RootPortDevice;
