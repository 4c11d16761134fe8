//! CXL.mem driver: attaches enumerated memory devices into the host address
//! space by programming the device decoder and the upstream switch decoder.

use tracing::{info, warn};

use super::cxl_bus::{CxlBusDriver, CxlDeviceInfo};
use crate::HostError;

pub struct CxlMemDriver;

impl CxlMemDriver {
    /// Memory devices found by the CXL bus scan, in discovery order.
    pub fn memory_devices<'d>(bus: &'d CxlBusDriver<'_>) -> Vec<&'d CxlDeviceInfo> {
        bus.devices()
            .iter()
            .filter(|device| device.is_cxl_memory_device())
            .collect()
    }

    /// Maps one device at `hpa_base`: device decoder first, then the
    /// grandparent USP's switch decoder targeting the device's DSP port.
    pub async fn attach_single_mem_device(
        bus: &CxlBusDriver<'_>,
        device: &CxlDeviceInfo,
        hpa_base: u64,
        hpa_size: u64,
    ) -> Result<bool, HostError> {
        if !bus
            .configure_hdm_decoder_device(device, hpa_base, hpa_size, 0, 0, 0)
            .await?
        {
            warn!("failed to configure the HDM decoder of {}", device.pci.bdf);
            return Ok(false);
        }

        let Some(parent) = device.parent.map(|index| &bus.devices()[index]) else {
            warn!("{} has no parent port", device.pci.bdf);
            return Ok(false);
        };
        if !parent.is_downstream_port() {
            warn!("{} is not a downstream switch port", parent.pci.bdf);
            return Ok(false);
        }
        let port_number = parent.pci.port_number;

        let Some(usp) = parent.parent.map(|index| &bus.devices()[index]) else {
            warn!("{} has no upstream port", parent.pci.bdf);
            return Ok(false);
        };
        if !usp.is_upstream_port() {
            warn!("{} is not an upstream switch port", usp.pci.bdf);
            return Ok(false);
        }

        if !bus
            .configure_hdm_decoder_switch(usp, hpa_base, hpa_size, &[port_number], 0, 0)
            .await?
        {
            warn!("failed to configure the HDM decoder of {}", usp.pci.bdf);
            return Ok(false);
        }
        info!(
            "attached {} at HPA 0x{hpa_base:x} through port {port_number}",
            device.pci.bdf
        );
        Ok(true)
    }
}
