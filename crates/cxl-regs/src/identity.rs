//! PCI identities of the emulated components.

/// Vendor ID used by every emulated function.
pub const EMU_VID: u16 = 0x1AC1;

pub const SW_USP_DID: u16 = 0x0100;
pub const SW_DSP_DID: u16 = 0x0101;
pub const SLD_DID: u16 = 0x0200;
pub const TYPE1_DID: u16 = 0x0201;
pub const TYPE2_DID: u16 = 0x0202;
pub const MLD_DID: u16 = 0x0203;

pub const PCI_CLASS_MEMORY: u8 = 0x05;
pub const PCI_CLASS_BRIDGE: u8 = 0x06;
pub const PCI_SUBCLASS_PCI_BRIDGE: u8 = 0x04;
pub const PCI_SUBCLASS_CXL_MEMORY: u8 = 0x02;
/// CXL memory device programming interface.
pub const CXL_MEMORY_PROG_IF: u8 = 0x10;

/// Class code of a PCI-to-PCI bridge as read from offset 9 (3 bytes).
pub const BRIDGE_CLASS_CODE: u32 =
    (PCI_CLASS_BRIDGE as u32) << 16 | (PCI_SUBCLASS_PCI_BRIDGE as u32) << 8;

/// Device/port type advertised in the PCI Express capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PciePortType {
    Endpoint = 0x0,
    RootPort = 0x4,
    UpstreamSwitchPort = 0x5,
    DownstreamSwitchPort = 0x6,
}

impl PciePortType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x0 => Some(PciePortType::Endpoint),
            0x4 => Some(PciePortType::RootPort),
            0x5 => Some(PciePortType::UpstreamSwitchPort),
            0x6 => Some(PciePortType::DownstreamSwitchPort),
            _ => None,
        }
    }
}

/// CXL role of a function, selecting which DVSECs its config space carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DvsecDeviceType {
    Usp,
    Dsp,
    Ld,
    AccelT1,
    AccelT2,
}

#[derive(Clone, Copy, Debug)]
pub struct PciIdentity {
    pub vendor_id: u16,
    pub device_id: u16,
    pub base_class: u8,
    pub sub_class: u8,
    pub prog_if: u8,
    pub subsystem_vendor_id: u16,
    pub subsystem_id: u16,
    pub port_type: PciePortType,
}

impl PciIdentity {
    pub fn endpoint(device_id: u16, base_class: u8, sub_class: u8, prog_if: u8) -> Self {
        PciIdentity {
            vendor_id: EMU_VID,
            device_id,
            base_class,
            sub_class,
            prog_if,
            subsystem_vendor_id: 0,
            subsystem_id: 0,
            port_type: PciePortType::Endpoint,
        }
    }

    pub fn bridge(device_id: u16, port_type: PciePortType) -> Self {
        PciIdentity {
            vendor_id: EMU_VID,
            device_id,
            base_class: PCI_CLASS_BRIDGE,
            sub_class: PCI_SUBCLASS_PCI_BRIDGE,
            prog_if: 0,
            subsystem_vendor_id: 0,
            subsystem_id: 0,
            port_type,
        }
    }

    /// Identity of an emulated Type 3 memory expander.
    pub fn memory_device(device_id: u16) -> Self {
        PciIdentity::endpoint(
            device_id,
            PCI_CLASS_MEMORY,
            PCI_SUBCLASS_CXL_MEMORY,
            CXL_MEMORY_PROG_IF,
        )
    }
}
