//! PCI configuration space (4 KiB) for the emulated functions.
//!
//! A config space is a [`RegisterBlock`] assembled from a compile-time field
//! schema: the type 0 or type 1 header, the PCI Express capability (which
//! carries the device/port type the CXL bus driver keys on) and the CXL DVSEC
//! chain in extended space. Software-visible side effects of writes (BAR
//! relocation, bridge window and bus-number updates) are delivered through
//! [`ConfigSpaceHooks`], so the register file stays free of routing concerns.

use std::sync::Arc;

use crate::identity::{DvsecDeviceType, PciIdentity};
use crate::register::{FieldAttr, RegisterBlock};

pub const CONFIG_SPACE_SIZE: usize = 0x1000;

// Header offsets shared with the enumeration drivers.
pub const VENDOR_ID: u16 = 0x00;
pub const DEVICE_ID: u16 = 0x02;
pub const COMMAND: u16 = 0x04;
pub const STATUS: u16 = 0x06;
pub const CLASS_CODE: u16 = 0x09;
pub const HEADER_TYPE: u16 = 0x0E;
pub const BAR0: u16 = 0x10;
pub const PRIMARY_BUS: u16 = 0x18;
pub const SECONDARY_BUS: u16 = 0x19;
pub const SUBORDINATE_BUS: u16 = 0x1A;
pub const MEMORY_BASE: u16 = 0x20;
pub const MEMORY_LIMIT: u16 = 0x22;
pub const CAPABILITY_POINTER: u16 = 0x34;

const PCIE_CAP_OFFSET: u16 = 0x40;
const EXT_CAP_BASE: u16 = 0x100;
const EXT_CAP_STRIDE: u16 = 0x40;

/// DVSEC vendor ID assigned to the CXL consortium.
pub const CXL_DVSEC_VENDOR: u16 = 0x1E98;

pub const DVSEC_ID_CXL_DEVICES: u16 = 0x0000;
pub const DVSEC_ID_EXTENSION_PORTS: u16 = 0x0003;
pub const DVSEC_ID_FLEX_BUS_PORT: u16 = 0x0007;
pub const DVSEC_ID_REGISTER_LOCATOR: u16 = 0x0008;

bitflags::bitflags! {
    /// COMMAND register bits software may toggle; everything else in the
    /// register is reserved and reads zero.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PciCommand: u16 {
        const IO_SPACE = 1 << 0;
        const MEMORY_SPACE = 1 << 1;
        const BUS_MASTER = 1 << 2;
        const PARITY_ERROR_RESPONSE = 1 << 6;
        const SERR_ENABLE = 1 << 8;
        const INTERRUPT_DISABLE = 1 << 10;
    }
}

pub fn memory_base_addr_to_regval(addr: u64) -> u16 {
    ((addr >> 16) & 0xFFF0) as u16
}

pub fn memory_base_regval_to_addr(regval: u16) -> u64 {
    u64::from(regval & 0xFFF0) << 16
}

pub fn memory_limit_addr_to_regval(addr: u64) -> u16 {
    ((addr >> 16) & 0xFFF0) as u16
}

pub fn memory_limit_regval_to_addr(regval: u16) -> u64 {
    u64::from(regval & 0xFFF0) << 16 | 0xF_FFFF
}

/// Write side effects a config space owner can observe.
pub trait ConfigSpaceHooks: Send + Sync {
    fn bar_changed(&self, _index: usize, _base: u64, _size: u64) {}
    fn secondary_bus_changed(&self, _bus: u8) {}
    fn subordinate_bus_changed(&self, _bus: u8) {}
    fn memory_base_changed(&self, _base: u64) {}
    fn memory_limit_changed(&self, _limit: u64) {}
}

/// No-op hook set for functions without routing side effects.
pub struct NoHooks;

impl ConfigSpaceHooks for NoHooks {}

/// One block entry of the register locator DVSEC.
#[derive(Clone, Copy, Debug)]
pub struct RegisterLocatorBlock {
    pub bir: u8,
    pub block_id: u8,
    /// 64 KiB-aligned offset into the BAR.
    pub offset: u64,
}

#[derive(Clone, Copy, Default)]
struct DeviceDvsecInfo {
    cache_capable: bool,
    mem_capable: bool,
    range_sizes: [u64; 2],
}

enum HeaderKind {
    Type0 { bar_sizes: [u64; 6] },
    Type1 { bar_sizes: [u64; 2] },
}

pub struct ConfigSpaceBuilder {
    identity: PciIdentity,
    header: HeaderKind,
    dvsec_type: Option<DvsecDeviceType>,
    device_dvsec: Option<DeviceDvsecInfo>,
    register_locator: Vec<RegisterLocatorBlock>,
}

impl ConfigSpaceBuilder {
    pub fn endpoint(identity: PciIdentity) -> Self {
        ConfigSpaceBuilder {
            identity,
            header: HeaderKind::Type0 { bar_sizes: [0; 6] },
            dvsec_type: None,
            device_dvsec: None,
            register_locator: Vec::new(),
        }
    }

    pub fn bridge(identity: PciIdentity) -> Self {
        ConfigSpaceBuilder {
            identity,
            header: HeaderKind::Type1 { bar_sizes: [0; 2] },
            dvsec_type: None,
            device_dvsec: None,
            register_locator: Vec::new(),
        }
    }

    /// BAR sizes must be powers of two, at least 0x1000.
    pub fn bar(mut self, index: usize, size: u64) -> Self {
        match &mut self.header {
            HeaderKind::Type0 { bar_sizes } => bar_sizes[index] = size,
            HeaderKind::Type1 { bar_sizes } => bar_sizes[index] = size,
        }
        self
    }

    pub fn cxl_port_dvsec(mut self, device_type: DvsecDeviceType) -> Self {
        self.dvsec_type = Some(device_type);
        self
    }

    pub fn cxl_device_dvsec(
        mut self,
        device_type: DvsecDeviceType,
        cache_capable: bool,
        mem_capable: bool,
        range_sizes: [u64; 2],
    ) -> Self {
        self.dvsec_type = Some(device_type);
        self.device_dvsec = Some(DeviceDvsecInfo {
            cache_capable,
            mem_capable,
            range_sizes,
        });
        self
    }

    pub fn register_locator(mut self, blocks: Vec<RegisterLocatorBlock>) -> Self {
        self.register_locator = blocks;
        self
    }

    pub fn build(self, hooks: Arc<dyn ConfigSpaceHooks>) -> ConfigSpace {
        let mut regs = RegisterBlock::new(CONFIG_SPACE_SIZE);
        let identity = &self.identity;

        regs.add_field(0x00, 0x01, FieldAttr::HwInit, u64::from(identity.vendor_id));
        regs.add_field(0x02, 0x03, FieldAttr::HwInit, u64::from(identity.device_id));
        // COMMAND: io/mem/bus-master enables and error bits writable.
        regs.add_field_masked(
            0x04,
            0x05,
            FieldAttr::Rw,
            0,
            u64::from(PciCommand::all().bits()),
        );
        // STATUS: capabilities list present, immediate readiness.
        regs.add_field(0x06, 0x07, FieldAttr::Ro, 0x0011);
        regs.add_field(0x08, 0x08, FieldAttr::HwInit, 0);
        regs.add_field(0x09, 0x09, FieldAttr::Ro, u64::from(identity.prog_if));
        regs.add_field(0x0A, 0x0A, FieldAttr::Ro, u64::from(identity.sub_class));
        regs.add_field(0x0B, 0x0B, FieldAttr::Ro, u64::from(identity.base_class));
        regs.add_field(0x0C, 0x0C, FieldAttr::Rw, 0);
        let header_type = match &self.header {
            HeaderKind::Type0 { .. } => 0x00,
            HeaderKind::Type1 { .. } => 0x01,
        };
        regs.add_field(0x0E, 0x0E, FieldAttr::Ro, header_type);
        regs.add_field(0x0F, 0x0F, FieldAttr::Ro, 0);

        let bar_sizes: Vec<u64> = match &self.header {
            HeaderKind::Type0 { bar_sizes } => bar_sizes.to_vec(),
            HeaderKind::Type1 { bar_sizes } => bar_sizes.to_vec(),
        };
        for (index, &size) in bar_sizes.iter().enumerate() {
            let start = usize::from(BAR0) + index * 4;
            if size > 0 {
                debug_assert!(size.is_power_of_two() && size >= 0x1000);
                regs.add_field_masked(start, start + 3, FieldAttr::Rw, 0, !(size - 1) & 0xFFFF_FFFF);
            } else {
                regs.add_field(start, start + 3, FieldAttr::Ro, 0);
            }
        }

        match &self.header {
            HeaderKind::Type0 { .. } => {
                regs.add_field(0x2C, 0x2D, FieldAttr::Ro, u64::from(identity.subsystem_vendor_id));
                regs.add_field(0x2E, 0x2F, FieldAttr::Ro, u64::from(identity.subsystem_id));
                regs.add_field(0x30, 0x33, FieldAttr::Ro, 0);
                regs.add_field(0x34, 0x34, FieldAttr::Ro, u64::from(PCIE_CAP_OFFSET));
                regs.add_field(0x3C, 0x3C, FieldAttr::Rw, 0);
                regs.add_field(0x3D, 0x3D, FieldAttr::Ro, 0);
            }
            HeaderKind::Type1 { .. } => {
                regs.add_field(0x18, 0x18, FieldAttr::Rw, 0); // primary bus
                regs.add_field(0x19, 0x19, FieldAttr::Rw, 0); // secondary bus
                regs.add_field(0x1A, 0x1A, FieldAttr::Rw, 0); // subordinate bus
                regs.add_field(0x1B, 0x1B, FieldAttr::Ro, 0);
                regs.add_field(0x1C, 0x1D, FieldAttr::Ro, 0); // io base/limit unimplemented
                regs.add_field(0x1E, 0x1F, FieldAttr::Rw1c, 0); // secondary status
                regs.add_field_masked(0x20, 0x21, FieldAttr::Rw, 0, 0xFFF0);
                regs.add_field_masked(0x22, 0x23, FieldAttr::Rw, 0, 0xFFF0);
                regs.add_field(0x24, 0x2F, FieldAttr::Ro, 0); // prefetchable pair
                regs.add_field(0x30, 0x33, FieldAttr::Ro, 0);
                regs.add_field(0x34, 0x34, FieldAttr::Ro, u64::from(PCIE_CAP_OFFSET));
                regs.add_field(0x38, 0x3B, FieldAttr::Ro, 0);
                regs.add_field(0x3C, 0x3C, FieldAttr::Rw, 0);
                regs.add_field(0x3D, 0x3D, FieldAttr::Ro, 0);
                regs.add_field(0x3E, 0x3F, FieldAttr::Rw, 0); // bridge control
            }
        }

        // PCI Express capability: the port type nibble is what the CXL bus
        // driver uses to tell endpoints from switch ports.
        let pcie = usize::from(PCIE_CAP_OFFSET);
        regs.add_field(pcie, pcie, FieldAttr::Ro, 0x10);
        regs.add_field(pcie + 1, pcie + 1, FieldAttr::Ro, 0);
        let pcie_caps = 0x2u64 | (identity.port_type as u64) << 4;
        regs.add_field(pcie + 2, pcie + 3, FieldAttr::Ro, pcie_caps);
        // Device capabilities / control and link capabilities; the link
        // capabilities port-number byte is stamped by hardware at bind.
        regs.add_field(pcie + 4, pcie + 0x13, FieldAttr::Ro, 0);

        self.build_dvsec_chain(&mut regs);

        ConfigSpace {
            regs,
            bar_sizes,
            bridge: matches!(self.header, HeaderKind::Type1 { .. }),
            hooks,
        }
    }

    fn build_dvsec_chain(&self, regs: &mut RegisterBlock) {
        struct DvsecSpec {
            id: u16,
            length: u16,
        }

        let mut specs = Vec::new();
        if self.device_dvsec.is_some() {
            specs.push(DvsecSpec {
                id: DVSEC_ID_CXL_DEVICES,
                length: 0x3C,
            });
        }
        if matches!(
            self.dvsec_type,
            Some(DvsecDeviceType::Usp | DvsecDeviceType::Dsp)
        ) {
            specs.push(DvsecSpec {
                id: DVSEC_ID_EXTENSION_PORTS,
                length: 0x28,
            });
        }
        if self.dvsec_type.is_some() {
            specs.push(DvsecSpec {
                id: DVSEC_ID_FLEX_BUS_PORT,
                length: 0x20,
            });
            specs.push(DvsecSpec {
                id: DVSEC_ID_REGISTER_LOCATOR,
                length: 0xC + 8 * self.register_locator.len() as u16,
            });
        }

        for (index, dvsec) in specs.iter().enumerate() {
            let offset = usize::from(EXT_CAP_BASE + index as u16 * EXT_CAP_STRIDE);
            let next = if index + 1 < specs.len() {
                EXT_CAP_BASE + (index as u16 + 1) * EXT_CAP_STRIDE
            } else {
                0
            };
            // Extended capability header: DVSEC id, version 1, next pointer.
            let header = 0x0023u64 | 1 << 16 | u64::from(next) << 20;
            regs.add_field(offset, offset + 3, FieldAttr::Ro, header);
            // DVSEC header 1: vendor, revision 0, length.
            let header1 = u64::from(CXL_DVSEC_VENDOR) | u64::from(dvsec.length) << 20;
            regs.add_field(offset + 4, offset + 7, FieldAttr::Ro, header1);
            // DVSEC header 2: DVSEC id.
            regs.add_field(offset + 8, offset + 9, FieldAttr::Ro, u64::from(dvsec.id));

            match dvsec.id {
                DVSEC_ID_CXL_DEVICES => {
                    let info = self.device_dvsec.unwrap_or_default();
                    let capability = u64::from(info.cache_capable)
                        | 1 << 1
                        | u64::from(info.mem_capable) << 2
                        | u64::from(info.range_sizes.iter().filter(|s| **s > 0).count() as u64)
                            << 4;
                    regs.add_field(offset + 0x0A, offset + 0x0B, FieldAttr::Ro, capability);
                    for (range, &size) in info.range_sizes.iter().enumerate() {
                        if size == 0 {
                            continue;
                        }
                        let high = size >> 32;
                        let low = size & 0xF000_0000 | 0b11; // info valid, active
                        let base = offset + 0x18 + range * 0x10;
                        regs.add_field(base, base + 3, FieldAttr::Ro, high);
                        regs.add_field(base + 4, base + 7, FieldAttr::Ro, low);
                    }
                }
                DVSEC_ID_REGISTER_LOCATOR => {
                    for (block_index, block) in self.register_locator.iter().enumerate() {
                        debug_assert_eq!(block.offset & 0xFFFF, 0);
                        let base = offset + 0x0C + block_index * 8;
                        let low = u64::from(block.bir & 0x7)
                            | u64::from(block.block_id) << 8
                            | (block.offset & 0xFFFF_0000);
                        let high = block.offset >> 32;
                        regs.add_field(base, base + 3, FieldAttr::Ro, low);
                        regs.add_field(base + 4, base + 7, FieldAttr::Ro, high);
                    }
                }
                _ => {}
            }
        }
    }
}

/// A built config space: the register file plus write side effects.
pub struct ConfigSpace {
    regs: RegisterBlock,
    bar_sizes: Vec<u64>,
    bridge: bool,
    hooks: Arc<dyn ConfigSpaceHooks>,
}

impl ConfigSpace {
    pub fn read(&self, offset: u16, size: usize) -> u32 {
        self.regs.read(usize::from(offset), size) as u32
    }

    pub fn write(&mut self, offset: u16, size: usize, value: u32) {
        self.regs
            .write(usize::from(offset), size, u64::from(value));
        self.apply_side_effects(offset, size);
    }

    pub fn is_bridge(&self) -> bool {
        self.bridge
    }

    pub fn bar_size(&self, index: usize) -> u64 {
        self.bar_sizes.get(index).copied().unwrap_or(0)
    }

    /// Current BAR base, masked to the BAR's address bits.
    pub fn bar_base(&self, index: usize) -> u64 {
        let size = self.bar_size(index);
        if size == 0 {
            return 0;
        }
        let raw = self
            .regs
            .read(usize::from(BAR0) + index * 4, 4);
        raw & !(size - 1)
    }

    pub fn secondary_bus(&self) -> u8 {
        self.regs.read(usize::from(SECONDARY_BUS), 1) as u8
    }

    /// Hardware-side update of the PCIe link capabilities port number. The
    /// switch stamps the physical port a bridge fronts at bind time.
    pub fn set_port_number(&mut self, port: u8) {
        self.regs
            .set(usize::from(PCIE_CAP_OFFSET) + 0x0F, 1, u64::from(port));
    }

    pub fn subordinate_bus(&self) -> u8 {
        self.regs.read(usize::from(SUBORDINATE_BUS), 1) as u8
    }

    fn apply_side_effects(&self, offset: u16, size: usize) {
        let start = offset;
        let end = offset + size as u16 - 1;
        let overlaps = |field_start: u16, field_end: u16| start <= field_end && end >= field_start;

        let bar_count = self.bar_sizes.len() as u16;
        if start >= BAR0 && overlaps(BAR0, BAR0 + bar_count * 4 - 1) {
            let index = usize::from((start - BAR0) / 4);
            let bar_size = self.bar_size(index);
            if bar_size > 0 {
                let raw = self.regs.read(usize::from(BAR0) + index * 4, 4);
                let mask = !(bar_size - 1) & 0xFFFF_FFFF;
                // A sizing probe writes all-ones; the read-back equals the
                // mask and must not relocate the BAR.
                if raw != mask {
                    self.hooks.bar_changed(index, raw & mask, bar_size);
                }
            }
        }

        if !self.bridge {
            return;
        }
        if overlaps(SECONDARY_BUS, SECONDARY_BUS) {
            self.hooks.secondary_bus_changed(self.secondary_bus());
        }
        if overlaps(SUBORDINATE_BUS, SUBORDINATE_BUS) {
            self.hooks.subordinate_bus_changed(self.subordinate_bus());
        }
        if overlaps(MEMORY_BASE, MEMORY_BASE + 1) {
            let regval = self.regs.read(usize::from(MEMORY_BASE), 2) as u16;
            self.hooks
                .memory_base_changed(memory_base_regval_to_addr(regval));
        }
        if overlaps(MEMORY_LIMIT, MEMORY_LIMIT + 1) {
            let regval = self.regs.read(usize::from(MEMORY_LIMIT), 2) as u16;
            self.hooks
                .memory_limit_changed(memory_limit_regval_to_addr(regval));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{PciIdentity, PciePortType, SLD_DID, SW_DSP_DID};
    use std::sync::Mutex;

    #[test]
    fn endpoint_header_reads_back_identity() {
        let space = ConfigSpaceBuilder::endpoint(PciIdentity::memory_device(SLD_DID))
            .bar(0, 0x10000)
            .build(Arc::new(NoHooks));
        assert_eq!(space.read(VENDOR_ID, 2), u32::from(crate::identity::EMU_VID));
        assert_eq!(space.read(DEVICE_ID, 2), u32::from(SLD_DID));
        assert_eq!(space.read(HEADER_TYPE, 1), 0x00);
        // Class code: memory controller / CXL memory device.
        assert_eq!(space.read(CLASS_CODE, 3), 0x05_02_10);
    }

    #[test]
    fn bar_sizing_probe_reports_size_without_relocating() {
        struct Recorder(Mutex<Vec<(usize, u64)>>);
        impl ConfigSpaceHooks for Recorder {
            fn bar_changed(&self, index: usize, base: u64, _size: u64) {
                self.0.lock().unwrap().push((index, base));
            }
        }
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let mut space = ConfigSpaceBuilder::endpoint(PciIdentity::memory_device(SLD_DID))
            .bar(0, 0x10000)
            .build(recorder.clone());

        space.write(BAR0, 4, 0xFFFF_FFFF);
        assert_eq!(space.read(BAR0, 4), 0xFFFF_0000);
        assert!(recorder.0.lock().unwrap().is_empty());

        space.write(BAR0, 4, 0xFE10_0000);
        assert_eq!(space.read(BAR0, 4), 0xFE10_0000);
        assert_eq!(*recorder.0.lock().unwrap(), vec![(0, 0xFE10_0000)]);
    }

    #[test]
    fn bridge_window_hooks_fire_with_decoded_addresses() {
        struct Recorder(Mutex<Vec<(u64, u64)>>);
        impl ConfigSpaceHooks for Recorder {
            fn memory_base_changed(&self, base: u64) {
                self.0.lock().unwrap().push((0, base));
            }
            fn memory_limit_changed(&self, limit: u64) {
                self.0.lock().unwrap().push((1, limit));
            }
        }
        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let identity = PciIdentity::bridge(SW_DSP_DID, PciePortType::DownstreamSwitchPort);
        let mut space = ConfigSpaceBuilder::bridge(identity).build(recorder.clone());

        space.write(MEMORY_BASE, 2, u32::from(memory_base_addr_to_regval(0xFE00_0000)));
        space.write(MEMORY_LIMIT, 2, u32::from(memory_limit_addr_to_regval(0xFE30_0000)));
        assert_eq!(
            *recorder.0.lock().unwrap(),
            vec![(0, 0xFE00_0000), (1, 0xFE3F_FFFF)]
        );
    }

    #[test]
    fn dvsec_chain_walks_to_register_locator() {
        let space = ConfigSpaceBuilder::endpoint(PciIdentity::memory_device(SLD_DID))
            .bar(0, 0x10000)
            .cxl_device_dvsec(DvsecDeviceType::Ld, false, true, [256 << 20, 0])
            .register_locator(vec![RegisterLocatorBlock {
                bir: 0,
                block_id: 0x01,
                offset: 0,
            }])
            .build(Arc::new(NoHooks));

        // Walk the extended chain by next pointers, collecting DVSEC ids.
        let mut ids = Vec::new();
        let mut offset = 0x100u16;
        loop {
            let header = space.read(offset, 4);
            assert_eq!(header & 0xFFFF, 0x0023);
            let header1 = space.read(offset + 4, 4);
            assert_eq!(header1 & 0xFFFF, u32::from(CXL_DVSEC_VENDOR));
            ids.push(space.read(offset + 8, 2) as u16);
            let next = (header >> 20) as u16;
            if next == 0 {
                break;
            }
            offset = next;
        }
        assert_eq!(
            ids,
            vec![
                DVSEC_ID_CXL_DEVICES,
                DVSEC_ID_FLEX_BUS_PORT,
                DVSEC_ID_REGISTER_LOCATOR
            ]
        );

        // Device DVSEC advertises 256 MiB in range 1.
        let dvsec = 0x100u16;
        let capability = space.read(dvsec + 0x0A, 2);
        assert_ne!(capability & 0x4, 0, "mem capable");
        let high = space.read(dvsec + 0x18, 4) as u64;
        let low = space.read(dvsec + 0x1C, 4) as u64;
        assert_eq!(high << 32 | (low & 0xF000_0000), 256 << 20);
    }
}
