//! Memory device component: identity, device HDM decoders, backing store.

use std::sync::Arc;

use tracing::warn;

use cxl_cache::accessor::MemoryAccessor;
use cxl_protocol::packet::{CacheLineData, CACHE_LINE_SIZE};
use cxl_regs::hdm::DeviceHdmDecoderManager;

pub const SIZE_256MB: u64 = 256 * 1024 * 1024;

/// Capacity bookkeeping advertised through the device DVSEC. Capacities are
/// recorded in 256 MiB units, as the identity structure encodes them.
#[derive(Clone, Debug)]
pub struct MemoryDeviceIdentity {
    pub fw_revision: String,
    total_capacity_units: u64,
    volatile_only_units: u64,
}

impl MemoryDeviceIdentity {
    pub fn new(fw_revision: impl Into<String>, total_capacity: u64) -> Self {
        MemoryDeviceIdentity {
            fw_revision: fw_revision.into(),
            total_capacity_units: total_capacity / SIZE_256MB,
            volatile_only_units: total_capacity / SIZE_256MB,
        }
    }

    pub fn total_capacity(&self) -> u64 {
        self.total_capacity_units * SIZE_256MB
    }

    pub fn volatile_only_capacity(&self) -> u64 {
        self.volatile_only_units * SIZE_256MB
    }
}

pub struct CxlMemoryDeviceComponent {
    identity: MemoryDeviceIdentity,
    hdm: Arc<DeviceHdmDecoderManager>,
    accessor: MemoryAccessor,
    label: String,
}

impl CxlMemoryDeviceComponent {
    pub fn new(
        identity: MemoryDeviceIdentity,
        decoder_count: usize,
        accessor: MemoryAccessor,
        label: impl Into<String>,
    ) -> Arc<Self> {
        let label = label.into();
        Arc::new(CxlMemoryDeviceComponent {
            hdm: Arc::new(DeviceHdmDecoderManager::new(decoder_count, label.clone())),
            identity,
            accessor,
            label,
        })
    }

    pub fn identity(&self) -> &MemoryDeviceIdentity {
        &self.identity
    }

    pub fn hdm_decoder_manager(&self) -> &Arc<DeviceHdmDecoderManager> {
        &self.hdm
    }

    pub fn get_dpa(&self, hpa: u64) -> Option<u64> {
        self.hdm.get_dpa(hpa)
    }

    pub fn get_hpa(&self, dpa: u64) -> Option<u64> {
        self.hdm.get_hpa(dpa)
    }

    /// Reads the line at `dpa`. Backend failures are logged and yield
    /// undefined (zero) data; the transaction still completes.
    pub fn read_mem_dpa(&self, dpa: u64) -> CacheLineData {
        let mut line = CacheLineData::zeroed();
        if let Err(error) = self.accessor.read(dpa, &mut line.0) {
            warn!("[{}] read of DPA 0x{dpa:x} failed: {error}", self.label);
        }
        line
    }

    pub fn write_mem_dpa(&self, dpa: u64, data: &CacheLineData) {
        if let Err(error) = self.accessor.write(dpa, &data.0) {
            warn!("[{}] write of DPA 0x{dpa:x} failed: {error}", self.label);
        }
    }

    /// HPA-addressed access through the committed device decoders.
    pub fn read_mem(&self, hpa: u64) -> CacheLineData {
        match self.get_dpa(hpa) {
            Some(dpa) => self.read_mem_dpa(dpa),
            None => {
                warn!("[{}] HPA 0x{hpa:x} is not decodable", self.label);
                CacheLineData::zeroed()
            }
        }
    }

    pub fn write_mem(&self, hpa: u64, data: &CacheLineData) {
        match self.get_dpa(hpa) {
            Some(dpa) => self.write_mem_dpa(dpa, data),
            None => warn!("[{}] HPA 0x{hpa:x} is not decodable", self.label),
        }
    }

    pub fn line_size(&self) -> usize {
        CACHE_LINE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxl_regs::hdm::HdmDecoderConfig;

    #[test]
    fn hpa_access_goes_through_the_committed_decoder() {
        let identity = MemoryDeviceIdentity::new("EMU 1.0", SIZE_256MB);
        let component = CxlMemoryDeviceComponent::new(
            identity,
            4,
            MemoryAccessor::anonymous(SIZE_256MB),
            "mem0",
        );
        component.hdm_decoder_manager().commit(
            0,
            HdmDecoderConfig {
                hpa_base: 0x1_0000_0000,
                hpa_size: SIZE_256MB,
                ..Default::default()
            },
        );

        let line = CacheLineData::from_u64(0xDEAD_BEEF);
        component.write_mem(0x1_0000_0040, &line);
        assert_eq!(component.read_mem(0x1_0000_0040).as_u64(), 0xDEAD_BEEF);
        assert_eq!(component.read_mem_dpa(0x40).as_u64(), 0xDEAD_BEEF);

        // Undecodable HPAs read as zero.
        assert_eq!(component.read_mem(0x9_0000_0000).as_u64(), 0);
    }
}
