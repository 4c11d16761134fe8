//! Register modelling for the CXL emulator.
//!
//! All register files are flat byte buffers with per-field attributes
//! (RO / RW / RW1C / HWInit / Reserved) applied by a small interpreter;
//! views compose by offset. On top of that sit the PCI configuration space
//! (type 0 and type 1, with the PCIe capability and the CXL DVSEC chain),
//! the CXL component register block (HDM decoder, BI route table / decoder,
//! cache ID route table) and the HDM decoder managers that the switch and
//! device data paths consult.

pub mod component;
pub mod config_space;
pub mod hdm;
pub mod identity;
pub mod register;

pub use component::{
    BiDecoder, BiRouteTable, CacheIdRouteTable, ComponentRegisterBlock, ComponentRegisterConfig,
};
pub use config_space::{ConfigSpace, ConfigSpaceBuilder, ConfigSpaceHooks, RegisterLocatorBlock};
pub use hdm::{DeviceHdmDecoderManager, HdmDecoderConfig, SwitchHdmDecoderManager};
pub use identity::{DvsecDeviceType, PciIdentity, PciePortType};
pub use register::{FieldAttr, RegisterBlock};
