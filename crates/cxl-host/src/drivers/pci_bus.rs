//! PCI bus driver: standard depth-first enumeration.
//!
//! Probes every device-0 function for VID/DID, sizes BAR0 with the
//! write-all-ones probe, assigns it from a running cursor (one 0x100000
//! window per device), and for bridges assigns secondary/subordinate buses
//! and aggregates the child BAR windows into memory base/limit. A read-only
//! rescan walks the same tree without touching any register, which is what
//! the rebind-stability check compares.

use futures::future::BoxFuture;
use tracing::{debug, info};

use cxl_protocol::packet::Bdf;
use cxl_regs::config_space::{
    memory_base_addr_to_regval, memory_base_regval_to_addr, memory_limit_addr_to_regval,
    memory_limit_regval_to_addr, BAR0, CAPABILITY_POINTER, CLASS_CODE, DEVICE_ID, MEMORY_BASE,
    MEMORY_LIMIT, SECONDARY_BUS, SUBORDINATE_BUS, VENDOR_ID,
};
use cxl_regs::identity::{PciePortType, BRIDGE_CLASS_CODE};

use super::HostIo;
use crate::HostError;

/// MMIO window reserved per device during enumeration.
pub const BAR_WINDOW: u64 = 0x10_0000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PciDeviceInfo {
    pub bdf: Bdf,
    pub vid: u16,
    pub did: u16,
    pub class_code: u32,
    pub bar_base: u64,
    pub bar_size: u64,
    pub is_bridge: bool,
    pub secondary_bus: u8,
    pub subordinate_bus: u8,
    pub memory_base: u64,
    pub memory_limit: u64,
    pub port_type: Option<PciePortType>,
    pub port_number: u8,
    pub parent: Option<usize>,
}

/// The enumerated tree, in discovery order (children precede the sibling
/// that follows their bridge).
#[derive(Clone, Debug, Default)]
pub struct EnumerationInfo {
    pub devices: Vec<PciDeviceInfo>,
}

impl EnumerationInfo {
    pub fn bridges(&self) -> impl Iterator<Item = &PciDeviceInfo> {
        self.devices.iter().filter(|device| device.is_bridge)
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &PciDeviceInfo> {
        self.devices.iter().filter(|device| !device.is_bridge)
    }

    pub fn find(&self, bdf: Bdf) -> Option<&PciDeviceInfo> {
        self.devices.iter().find(|device| device.bdf == bdf)
    }
}

pub struct PciBusDriver<'a> {
    io: &'a dyn HostIo,
}

impl<'a> PciBusDriver<'a> {
    pub fn new(io: &'a dyn HostIo) -> Self {
        PciBusDriver { io }
    }

    async fn read_vid_did(&self, bdf: Bdf) -> Result<Option<(u16, u16)>, HostError> {
        let vid = self.io.read_config(bdf, VENDOR_ID, 2).await? as u16;
        let did = self.io.read_config(bdf, DEVICE_ID, 2).await? as u16;
        if vid == 0xFFFF && did == 0xFFFF {
            return Ok(None);
        }
        Ok(Some((vid, did)))
    }

    async fn probe_bar0(&self, bdf: Bdf, base: u64) -> Result<u64, HostError> {
        self.io.write_config(bdf, BAR0, 4, 0xFFFF_FFFF).await?;
        let raw = self.io.read_config(bdf, BAR0, 4).await?;
        if raw == 0 || raw == 0xFFFF_FFFF {
            self.io.write_config(bdf, BAR0, 4, 0).await?;
            return Ok(0);
        }
        let size = u64::from(0xFFFF_FFFF - raw + 1);
        info!("BAR0 of {bdf} sized 0x{size:x}, placing at 0x{base:08x}");
        self.io.write_config(bdf, BAR0, 4, base as u32).await?;
        Ok(size)
    }

    async fn read_port_info(&self, bdf: Bdf) -> Result<(Option<PciePortType>, u8), HostError> {
        let mut pointer = self.io.read_config(bdf, CAPABILITY_POINTER, 1).await? as u16;
        while pointer != 0 && pointer != 0xFF {
            let cap_id = self.io.read_config(bdf, pointer, 1).await?;
            if cap_id == 0x10 {
                let caps = self.io.read_config(bdf, pointer + 2, 2).await?;
                let port_type = PciePortType::from_code((caps >> 4 & 0xF) as u8);
                let link_caps = self.io.read_config(bdf, pointer + 0x0C, 4).await?;
                return Ok((port_type, (link_caps >> 24) as u8));
            }
            pointer = self.io.read_config(bdf, pointer + 1, 1).await? as u16;
        }
        Ok((None, 0))
    }

    fn scan_bus<'b>(
        &'b self,
        bus: u8,
        memory_start: u64,
        parent: Option<usize>,
        devices: &'b mut Vec<PciDeviceInfo>,
    ) -> BoxFuture<'b, Result<(u8, u64), HostError>> {
        Box::pin(async move {
            debug!("scanning PCI bus {bus}");
            let mut max_bus = bus;
            let mut memory_cursor = memory_start;

            for device in 0..32u8 {
                let bdf = Bdf::new(bus, device, 0);
                let Some((vid, did)) = self.read_vid_did(bdf).await? else {
                    continue;
                };

                let bar_size = self.probe_bar0(bdf, memory_cursor).await?;
                let bar_base = if bar_size > 0 {
                    let base = memory_cursor;
                    memory_cursor += BAR_WINDOW;
                    base
                } else {
                    0
                };

                let class_code = self.io.read_config(bdf, CLASS_CODE, 3).await?;
                let (port_type, port_number) = self.read_port_info(bdf).await?;
                let index = devices.len();
                devices.push(PciDeviceInfo {
                    bdf,
                    vid,
                    did,
                    class_code,
                    bar_base,
                    bar_size,
                    is_bridge: false,
                    secondary_bus: 0,
                    subordinate_bus: 0,
                    memory_base: 0,
                    memory_limit: 0,
                    port_type,
                    port_number,
                    parent,
                });

                if class_code >> 8 == BRIDGE_CLASS_CODE >> 8 {
                    info!("found a bridge at {bdf} (VID 0x{vid:04x} DID 0x{did:04x})");
                    let secondary = max_bus + 1;
                    self.io
                        .write_config(bdf, SECONDARY_BUS, 1, u32::from(secondary))
                        .await?;
                    self.io.write_config(bdf, SUBORDINATE_BUS, 1, 0xFF).await?;

                    let child_window_start = memory_cursor;
                    let (new_max, memory_end) = self
                        .scan_bus(secondary, memory_cursor, Some(index), devices)
                        .await?;
                    max_bus = new_max;
                    self.io
                        .write_config(bdf, SUBORDINATE_BUS, 1, u32::from(max_bus))
                        .await?;

                    let mut window = (0, 0);
                    if memory_end != child_window_start {
                        let base = child_window_start;
                        let limit = memory_end - 1;
                        self.io
                            .write_config(
                                bdf,
                                MEMORY_BASE,
                                2,
                                u32::from(memory_base_addr_to_regval(base)),
                            )
                            .await?;
                        self.io
                            .write_config(
                                bdf,
                                MEMORY_LIMIT,
                                2,
                                u32::from(memory_limit_addr_to_regval(limit)),
                            )
                            .await?;
                        window = (base, limit);
                    }
                    memory_cursor = memory_end;

                    let entry = &mut devices[index];
                    entry.is_bridge = true;
                    entry.secondary_bus = secondary;
                    entry.subordinate_bus = max_bus;
                    entry.memory_base = window.0;
                    entry.memory_limit = window.1;
                } else {
                    info!("found an endpoint at {bdf} (VID 0x{vid:04x} DID 0x{did:04x})");
                }
            }
            Ok((max_bus, memory_cursor))
        })
    }

    /// Full enumeration: assigns buses, BARs and bridge windows.
    pub async fn scan(&self, start_bus: u8, mmio_base: u64) -> Result<EnumerationInfo, HostError> {
        let mut devices = Vec::new();
        self.scan_bus(start_bus, mmio_base, None, &mut devices)
            .await?;
        Ok(EnumerationInfo { devices })
    }

    fn rescan_bus<'b>(
        &'b self,
        bus: u8,
        parent: Option<usize>,
        devices: &'b mut Vec<PciDeviceInfo>,
    ) -> BoxFuture<'b, Result<(), HostError>> {
        Box::pin(async move {
            for device in 0..32u8 {
                let bdf = Bdf::new(bus, device, 0);
                let Some((vid, did)) = self.read_vid_did(bdf).await? else {
                    continue;
                };
                let class_code = self.io.read_config(bdf, CLASS_CODE, 3).await?;
                let bar_raw = self.io.read_config(bdf, BAR0, 4).await?;
                let (port_type, port_number) = self.read_port_info(bdf).await?;
                let is_bridge = class_code >> 8 == BRIDGE_CLASS_CODE >> 8;

                let mut info = PciDeviceInfo {
                    bdf,
                    vid,
                    did,
                    class_code,
                    bar_base: u64::from(bar_raw & 0xFFFF_FFF0),
                    bar_size: 0,
                    is_bridge,
                    secondary_bus: 0,
                    subordinate_bus: 0,
                    memory_base: 0,
                    memory_limit: 0,
                    port_type,
                    port_number,
                    parent,
                };
                if is_bridge {
                    info.secondary_bus =
                        self.io.read_config(bdf, SECONDARY_BUS, 1).await? as u8;
                    info.subordinate_bus =
                        self.io.read_config(bdf, SUBORDINATE_BUS, 1).await? as u8;
                    let base_regval = self.io.read_config(bdf, MEMORY_BASE, 2).await? as u16;
                    let limit_regval = self.io.read_config(bdf, MEMORY_LIMIT, 2).await? as u16;
                    if limit_regval != 0 {
                        info.memory_base = memory_base_regval_to_addr(base_regval);
                        info.memory_limit = memory_limit_regval_to_addr(limit_regval);
                    }
                }
                let index = devices.len();
                devices.push(info);
                let secondary = devices[index].secondary_bus;
                if is_bridge && secondary != 0 {
                    self.rescan_bus(secondary, Some(index), devices).await?;
                }
            }
            Ok(())
        })
    }

    /// Read-only walk of an already-enumerated tree.
    pub async fn rescan(&self, start_bus: u8) -> Result<EnumerationInfo, HostError> {
        let mut devices = Vec::new();
        self.rescan_bus(start_bus, None, &mut devices).await?;
        Ok(EnumerationInfo { devices })
    }
}
