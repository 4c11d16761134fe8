//! CXL bus driver: DVSEC chain walk and component-register discovery.
//!
//! For every enumerated function this walks the extended capability chain
//! for CXL DVSECs (vendor 0x1E98), decodes the device DVSEC's capability
//! bits and memory ranges, follows the register locator into BAR space to
//! find the component register block, and walks the CXL.cache/.mem
//! capability directory to cache each capability's MMIO address. Devices are
//! linked to their parent DSP and grandparent USP so decoder programming can
//! walk up the topology.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use cxl_regs::component::{CAP_ID_CXL, CAP_ID_HDM_DECODER};
use cxl_regs::config_space::{
    CXL_DVSEC_VENDOR, DVSEC_ID_CXL_DEVICES, DVSEC_ID_REGISTER_LOCATOR,
};
use cxl_regs::hdm::DECODER_COUNT_MAP;
use cxl_regs::identity::PciePortType;

use super::pci_bus::PciDeviceInfo;
use super::HostIo;
use crate::HostError;

const HDM_CONTROL_COMMITTED: u64 = 1 << 10;
const HDM_CONTROL_COMMIT: u64 = 1 << 9;

#[derive(Clone, Copy, Debug)]
pub struct DvsecInfo {
    pub id: u16,
    pub offset: u16,
    pub length: u16,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceDvsecInfo {
    pub cache_capable: bool,
    pub mem_capable: bool,
    pub range_sizes: [u64; 2],
}

impl DeviceDvsecInfo {
    pub fn memory_size(&self) -> u64 {
        self.range_sizes.iter().sum()
    }
}

#[derive(Clone, Debug)]
pub struct CxlDeviceInfo {
    pub pci: PciDeviceInfo,
    pub dvsecs: Vec<DvsecInfo>,
    pub device_dvsec: Option<DeviceDvsecInfo>,
    pub component_register_base: Option<u64>,
    /// Capability id -> MMIO address inside the component block.
    pub cachemem_registers: HashMap<u16, u64>,
    pub parent: Option<usize>,
    pub children: Vec<usize>,
}

impl CxlDeviceInfo {
    pub fn is_upstream_port(&self) -> bool {
        self.pci.port_type == Some(PciePortType::UpstreamSwitchPort)
    }

    pub fn is_downstream_port(&self) -> bool {
        self.pci.port_type == Some(PciePortType::DownstreamSwitchPort)
    }

    pub fn is_cxl_memory_device(&self) -> bool {
        self.pci.port_type == Some(PciePortType::Endpoint)
            && self.device_dvsec.map_or(false, |dvsec| dvsec.mem_capable)
    }

    pub fn hdm_decoder_base(&self) -> Option<u64> {
        self.cachemem_registers.get(&CAP_ID_HDM_DECODER).copied()
    }
}

pub struct CxlBusDriver<'a> {
    io: &'a dyn HostIo,
    devices: Vec<CxlDeviceInfo>,
}

impl<'a> CxlBusDriver<'a> {
    pub fn new(io: &'a dyn HostIo) -> Self {
        CxlBusDriver {
            io,
            devices: Vec::new(),
        }
    }

    pub fn devices(&self) -> &[CxlDeviceInfo] {
        &self.devices
    }

    pub async fn init(&mut self, pci_devices: &[PciDeviceInfo]) -> Result<(), HostError> {
        self.devices.clear();
        for pci in pci_devices {
            let mut info = CxlDeviceInfo {
                pci: pci.clone(),
                dvsecs: Vec::new(),
                device_dvsec: None,
                component_register_base: None,
                cachemem_registers: HashMap::new(),
                parent: None,
                children: Vec::new(),
            };
            self.scan_dvsecs(&mut info).await?;
            if !info.dvsecs.is_empty() {
                info!("found a CXL function at {}", info.pci.bdf);
                self.scan_component_registers(&mut info).await?;
            }
            self.devices.push(info);
        }
        self.link_topology(pci_devices);
        Ok(())
    }

    fn link_topology(&mut self, pci_devices: &[PciDeviceInfo]) {
        for index in 0..self.devices.len() {
            let parent = pci_devices[index].parent;
            self.devices[index].parent = parent;
            if let Some(parent) = parent {
                self.devices[parent].children.push(index);
            }
        }
    }

    async fn scan_dvsecs(&self, info: &mut CxlDeviceInfo) -> Result<(), HostError> {
        let bdf = info.pci.bdf;
        let mut offset = 0x100u16;
        loop {
            let header = self.io.read_config(bdf, offset, 4).await?;
            if header == 0 || header == 0xFFFF_FFFF {
                break;
            }
            let cap_id = (header & 0xFFFF) as u16;
            let next = (header >> 20) as u16;
            if cap_id == 0x0023 {
                let header1 = self.io.read_config(bdf, offset + 4, 4).await?;
                let vendor = (header1 & 0xFFFF) as u16;
                let length = (header1 >> 20 & 0xFFF) as u16;
                if vendor == CXL_DVSEC_VENDOR {
                    let dvsec_id = self.io.read_config(bdf, offset + 8, 2).await? as u16;
                    debug!("{bdf}: DVSEC id 0x{dvsec_id:04x} at 0x{offset:x}");
                    info.dvsecs.push(DvsecInfo {
                        id: dvsec_id,
                        offset,
                        length,
                    });
                    match dvsec_id {
                        DVSEC_ID_CXL_DEVICES => {
                            info.device_dvsec =
                                Some(self.scan_device_dvsec(bdf, offset).await?);
                        }
                        DVSEC_ID_REGISTER_LOCATOR => {
                            self.scan_register_locator(info, offset, length).await?;
                        }
                        _ => {}
                    }
                }
            }
            if next == 0 {
                break;
            }
            offset = next;
        }
        Ok(())
    }

    async fn scan_device_dvsec(
        &self,
        bdf: cxl_protocol::packet::Bdf,
        offset: u16,
    ) -> Result<DeviceDvsecInfo, HostError> {
        let capability = self.io.read_config(bdf, offset + 0x0A, 2).await?;
        let mut dvsec = DeviceDvsecInfo {
            cache_capable: capability & 0x1 != 0,
            mem_capable: capability & 0x4 != 0,
            range_sizes: [0; 2],
        };
        for range in 0..2u16 {
            let high = self.io.read_config(bdf, offset + 0x18 + range * 0x10, 4).await?;
            let low = self.io.read_config(bdf, offset + 0x1C + range * 0x10, 4).await?;
            dvsec.range_sizes[usize::from(range)] =
                u64::from(high) << 32 | u64::from(low & 0xF000_0000);
        }
        Ok(dvsec)
    }

    async fn scan_register_locator(
        &self,
        info: &mut CxlDeviceInfo,
        offset: u16,
        length: u16,
    ) -> Result<(), HostError> {
        let bdf = info.pci.bdf;
        let blocks = (length.saturating_sub(0x0C)) / 8;
        for block in 0..blocks {
            let low = self.io.read_config(bdf, offset + 0x0C + block * 8, 4).await?;
            let high = self.io.read_config(bdf, offset + 0x10 + block * 8, 4).await?;
            let bir = low & 0x7;
            let block_id = low >> 8 & 0xFF;
            let block_offset = u64::from(low & 0xFFFF_0000) | u64::from(high) << 32;
            if block_id == 0x01 {
                if bir != 0 {
                    warn!("{bdf}: component registers behind BAR{bir} are not mapped");
                    continue;
                }
                let address = info.pci.bar_base + block_offset;
                debug!("{bdf}: component registers at 0x{address:x}");
                info.component_register_base = Some(address);
            }
        }
        Ok(())
    }

    async fn scan_component_registers(&self, info: &mut CxlDeviceInfo) -> Result<(), HostError> {
        let Some(base) = info.component_register_base else {
            return Ok(());
        };
        let directory = base + 0x1000;
        let header = self.io.read_mmio(directory, 4).await?;
        if header & 0xFFFF != u64::from(CAP_ID_CXL) {
            warn!(
                "{}: capability directory id 0x{:x} is not CXL",
                info.pci.bdf,
                header & 0xFFFF
            );
            return Ok(());
        }
        let array_size = header >> 24 & 0xFF;
        for index in 0..array_size {
            let entry = self.io.read_mmio(directory + 4 + index * 4, 4).await?;
            let cap_id = (entry & 0xFFFF) as u16;
            let cap_offset = entry >> 20 & 0xFFF;
            debug!(
                "{}: cachemem capability 0x{cap_id:04x} at +0x{cap_offset:x}",
                info.pci.bdf
            );
            info.cachemem_registers.insert(cap_id, directory + cap_offset);
        }
        Ok(())
    }

    async fn hdm_decoder_count(&self, register_base: u64) -> Result<usize, HostError> {
        let capability = self.io.read_mmio(register_base, 4).await?;
        let code = (capability & 0xF) as usize;
        Ok(DECODER_COUNT_MAP.get(code).copied().unwrap_or(0))
    }

    async fn next_available_decoder(&self, register_base: u64) -> Result<Option<u64>, HostError> {
        let count = self.hdm_decoder_count(register_base).await?;
        for index in 0..count as u64 {
            let control = self
                .io
                .read_mmio(register_base + 0x20 + index * 0x20, 4)
                .await?;
            if control & HDM_CONTROL_COMMITTED == 0 {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    async fn program_decoder_common(
        &self,
        register_base: u64,
        index: u64,
        hpa_base: u64,
        hpa_size: u64,
        ig: u8,
        iw: u8,
    ) -> Result<(), HostError> {
        let decoder = register_base + 0x10 + index * 0x20;
        self.io.write_mmio(decoder, 4, hpa_base & 0xFFFF_FFFF).await?;
        self.io.write_mmio(decoder + 0x4, 4, hpa_base >> 32).await?;
        self.io.write_mmio(decoder + 0x8, 4, hpa_size & 0xFFFF_FFFF).await?;
        self.io.write_mmio(decoder + 0xC, 4, hpa_size >> 32).await?;
        let control = u64::from(ig) & 0xF | (u64::from(iw) & 0xF) << 4 | HDM_CONTROL_COMMIT;
        self.io.write_mmio(decoder + 0x10, 4, control).await?;

        // The commit bit is observable on read; poll until the decoder
        // reports committed.
        loop {
            let control = self.io.read_mmio(decoder + 0x10, 4).await?;
            if control & HDM_CONTROL_COMMITTED != 0 {
                return Ok(());
            }
        }
    }

    /// Programs the next free decoder of a device with an HPA window.
    pub async fn configure_hdm_decoder_device(
        &self,
        device: &CxlDeviceInfo,
        hpa_base: u64,
        hpa_size: u64,
        dpa_skip: u64,
        ig: u8,
        iw: u8,
    ) -> Result<bool, HostError> {
        let Some(register_base) = device.hdm_decoder_base() else {
            warn!("{}: no HDM decoder capability", device.pci.bdf);
            return Ok(false);
        };
        let Some(index) = self.next_available_decoder(register_base).await? else {
            warn!("{}: no available HDM decoders", device.pci.bdf);
            return Ok(false);
        };
        info!(
            "{}: programming device HDM decoder {index}: 0x{hpa_base:x}+0x{hpa_size:x}",
            device.pci.bdf
        );
        let decoder = register_base + 0x10 + index * 0x20;
        self.io.write_mmio(decoder + 0x14, 4, dpa_skip & 0xFFFF_FFFF).await?;
        self.io.write_mmio(decoder + 0x18, 4, dpa_skip >> 32).await?;
        self.program_decoder_common(register_base, index, hpa_base, hpa_size, ig, iw)
            .await?;
        Ok(true)
    }

    /// Programs the next free switch decoder with an HPA window and its
    /// per-way target port list.
    pub async fn configure_hdm_decoder_switch(
        &self,
        port: &CxlDeviceInfo,
        hpa_base: u64,
        hpa_size: u64,
        targets: &[u8],
        ig: u8,
        iw: u8,
    ) -> Result<bool, HostError> {
        let Some(register_base) = port.hdm_decoder_base() else {
            warn!("{}: no HDM decoder capability", port.pci.bdf);
            return Ok(false);
        };
        let Some(index) = self.next_available_decoder(register_base).await? else {
            warn!("{}: no available HDM decoders", port.pci.bdf);
            return Ok(false);
        };
        info!(
            "{}: programming switch HDM decoder {index}: 0x{hpa_base:x}+0x{hpa_size:x} -> {targets:?}",
            port.pci.bdf
        );
        let mut low = 0u64;
        let mut high = 0u64;
        for (way, &target) in targets.iter().enumerate().take(8) {
            if way < 4 {
                low |= u64::from(target) << (way * 8);
            } else {
                high |= u64::from(target) << ((way - 4) * 8);
            }
        }
        let decoder = register_base + 0x10 + index * 0x20;
        self.io.write_mmio(decoder + 0x14, 4, low).await?;
        self.io.write_mmio(decoder + 0x18, 4, high).await?;
        self.program_decoder_common(register_base, index, hpa_base, hpa_size, ig, iw)
            .await?;
        Ok(true)
    }

    /// Sets the HDM decoder global enable of a port or device.
    pub async fn enable_hdm_decoder(&self, device: &CxlDeviceInfo) -> Result<bool, HostError> {
        let Some(register_base) = device.hdm_decoder_base() else {
            return Ok(false);
        };
        self.io.write_mmio(register_base + 0x4, 4, 0x2).await?;
        Ok(true)
    }
}
