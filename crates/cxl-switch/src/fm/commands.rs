//! FM API command set, executed against the switch managers.
//!
//! Payloads are little-endian packed exactly as laid out here; the API
//! client in `mctp` uses the same encoders. LD-scope commands address an MLD
//! by physical port through a one-byte prefix (the reference tunnels them
//! through the MLD port; the addressing byte stands in for that tunnel).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use cxl_device::mld::MultiLogicalDevice;

use crate::manager::{PhysicalPortManager, VirtualSwitchManager};
use crate::ports::PhysicalPort;

use super::cci::{CciBackend, CciResponse, CciReturnCode, Opcode};

/// Static identity of the switch, reported by `IDENTIFY_SWITCH_DEVICE`.
#[derive(Clone, Copy, Debug)]
pub struct SwitchInfo {
    pub ingress_port_id: u8,
    pub num_hdm_decoders_per_usp: u8,
}

impl Default for SwitchInfo {
    fn default() -> Self {
        SwitchInfo {
            ingress_port_id: 0,
            num_hdm_decoders_per_usp: 32,
        }
    }
}

pub struct SwitchCciBackend {
    info: SwitchInfo,
    ports: Arc<PhysicalPortManager>,
    switches: Arc<VirtualSwitchManager>,
    mlds: Mutex<HashMap<u8, Arc<MultiLogicalDevice>>>,
}

impl SwitchCciBackend {
    pub fn new(
        info: SwitchInfo,
        ports: Arc<PhysicalPortManager>,
        switches: Arc<VirtualSwitchManager>,
    ) -> Arc<Self> {
        Arc::new(SwitchCciBackend {
            info,
            ports,
            switches,
            mlds: Mutex::new(HashMap::new()),
        })
    }

    /// Registers an in-process MLD reachable through `physical_port`.
    pub fn register_mld(&self, physical_port: u8, mld: Arc<MultiLogicalDevice>) {
        self.mlds.lock().unwrap().insert(physical_port, mld);
    }

    fn identify_switch_device(&self) -> CciResponse {
        let num_ports = self.ports.port_count() as u8;
        let num_vcs = self.switches.virtual_switch_count() as u8;
        let mut active_port_bitmask = [0u8; 32];
        for port in self.ports.ports() {
            let index = port.port_index();
            active_port_bitmask[usize::from(index) / 8] |= 1 << (index % 8);
        }
        let mut active_vcs_bitmask = [0u8; 32];
        let mut total_vppbs = 0u16;
        let mut active_vppbs = 0u16;
        for vcs in self.switches.switches() {
            active_vcs_bitmask[vcs.id() / 8] |= 1 << (vcs.id() % 8);
            total_vppbs += vcs.vppb_count() as u16;
            active_vppbs += vcs.bound_vppb_count() as u16;
        }

        let mut payload = Vec::with_capacity(0x49);
        payload.push(self.info.ingress_port_id);
        payload.push(0); // reserved
        payload.push(num_ports);
        payload.push(num_vcs);
        payload.extend_from_slice(&active_port_bitmask);
        payload.extend_from_slice(&active_vcs_bitmask);
        payload.extend_from_slice(&total_vppbs.to_le_bytes());
        payload.extend_from_slice(&active_vppbs.to_le_bytes());
        payload.push(self.info.num_hdm_decoders_per_usp);
        CciResponse::success(payload)
    }

    fn get_physical_port_state(&self, payload: &[u8]) -> CciResponse {
        let Some((&count, ids)) = payload.split_first() else {
            return CciResponse::error(CciReturnCode::InvalidInput);
        };
        if ids.len() < usize::from(count) {
            return CciResponse::error(CciReturnCode::InvalidInput);
        }
        let mut out = vec![count, 0, 0, 0];
        for &port_id in &ids[..usize::from(count)] {
            let port = self
                .ports
                .ports()
                .iter()
                .find(|port| port.port_index() == port_id);
            // 16-byte port information record.
            let mut record = [0u8; 16];
            record[0] = port_id;
            match port {
                Some(PhysicalPort::Usp(_)) => {
                    record[1] = 0x04; // configured as USP
                    record[4] = 0x00; // no device: host side
                    record[2] = 0x02; // CXL 2.0
                }
                Some(PhysicalPort::Dsp(dsp)) => {
                    record[1] = 0x03; // configured as DSP
                    if dsp.is_connected() {
                        let is_mld =
                            self.mlds.lock().unwrap().contains_key(&dsp.port_index());
                        record[4] = if is_mld { 0x05 } else { 0x04 }; // T3 MLD/SLD
                        record[2] = 0x02;
                    } else {
                        record[4] = 0x00; // no device detected
                    }
                }
                None => {
                    record[1] = 0x0F; // invalid port id
                }
            }
            out.extend_from_slice(&record);
        }
        CciResponse::success(out)
    }

    fn get_virtual_cxl_switch_info(&self, payload: &[u8]) -> CciResponse {
        // Request: start vPPB, vPPB list limit, VCS id count, VCS id list.
        if payload.len() < 3 {
            return CciResponse::error(CciReturnCode::InvalidInput);
        }
        let vcs_count = usize::from(payload[2]);
        let Some(vcs_ids) = payload.get(3..3 + vcs_count) else {
            return CciResponse::error(CciReturnCode::InvalidInput);
        };

        let mut out = vec![vcs_ids.len() as u8, 0, 0, 0];
        for &vcs_id in vcs_ids {
            let Some(vcs) = self.switches.get_virtual_switch(usize::from(vcs_id)) else {
                return CciResponse::error(CciReturnCode::InvalidInput);
            };
            out.push(vcs_id);
            out.push(0x01); // VCS enabled
            out.push(vcs.usp_port_id());
            out.push(vcs.vppb_count() as u8);
            for vppb in 0..vcs.vppb_count() {
                out.push(vcs.vppb_binding_status(vppb) as u8);
                out.push(vcs.bound_port_id(vppb).unwrap_or(0xFF));
                out.push(0); // bound LD
                out.push(0); // reserved
            }
        }
        CciResponse::success(out)
    }

    async fn bind_vppb(&self, payload: &[u8]) -> CciResponse {
        if payload.len() < 6 {
            return CciResponse::error(CciReturnCode::InvalidInput);
        }
        let vcs_id = usize::from(payload[0]);
        let vppb_id = usize::from(payload[1]);
        let physical_port_id = payload[2];
        let ld_id = u16::from_le_bytes([payload[4], payload[5]]);

        let Some(vcs) = self.switches.get_virtual_switch(vcs_id) else {
            debug!("BIND_VPPB: VCS {vcs_id} out of bound");
            return CciResponse::error(CciReturnCode::InvalidInput);
        };
        let port_index = self
            .ports
            .ports()
            .iter()
            .position(|port| port.port_index() == physical_port_id && port.is_dsp());
        let Some(port_index) = port_index else {
            debug!("BIND_VPPB: physical port {physical_port_id} is not a DSP");
            return CciResponse::error(CciReturnCode::InvalidInput);
        };
        if vppb_id >= vcs.vppb_count() || vcs.is_vppb_bound(vppb_id) {
            return CciResponse::error(CciReturnCode::InvalidInput);
        }
        // 0xFFFF selects an SLD bind (no LD addressing).
        let ld_id = if ld_id == 0xFFFF { 0 } else { ld_id as u8 };

        match vcs.bind_vppb(port_index, vppb_id, ld_id).await {
            Ok(()) => CciResponse::success(Vec::new()),
            Err(error) => {
                debug!("BIND_VPPB failed: {error}");
                CciResponse::error(CciReturnCode::InternalError)
            }
        }
    }

    async fn unbind_vppb(&self, payload: &[u8]) -> CciResponse {
        if payload.len() < 2 {
            return CciResponse::error(CciReturnCode::InvalidInput);
        }
        let vcs_id = usize::from(payload[0]);
        let vppb_id = usize::from(payload[1]);
        let Some(vcs) = self.switches.get_virtual_switch(vcs_id) else {
            return CciResponse::error(CciReturnCode::InvalidInput);
        };
        if vppb_id >= vcs.vppb_count() {
            return CciResponse::error(CciReturnCode::InvalidInput);
        }
        match vcs.unbind_vppb(vppb_id).await {
            Ok(()) => CciResponse::success(Vec::new()),
            Err(error) => {
                debug!("UNBIND_VPPB failed: {error}");
                CciResponse::error(CciReturnCode::InternalError)
            }
        }
    }

    fn get_connected_devices(&self) -> CciResponse {
        // Vendor-specific: DSP ports with something bound behind them.
        let mut ports = Vec::new();
        for vcs in self.switches.switches() {
            for vppb in 0..vcs.vppb_count() {
                if let Some(port) = vcs.bound_port_id(vppb) {
                    ports.push(port);
                }
            }
        }
        ports.sort_unstable();
        ports.dedup();
        let mut payload = vec![ports.len() as u8];
        payload.extend_from_slice(&ports);
        CciResponse::success(payload)
    }

    fn with_mld<R>(&self, payload: &[u8], f: impl FnOnce(&MultiLogicalDevice, &[u8]) -> R) -> Option<R> {
        let (&port, rest) = payload.split_first()?;
        let mlds = self.mlds.lock().unwrap();
        let mld = mlds.get(&port)?;
        Some(f(mld, rest))
    }

    fn get_ld_info(&self, payload: &[u8]) -> CciResponse {
        let Some(response) = self.with_mld(payload, |mld, _| {
            let info = mld.get_ld_info();
            let mut out = Vec::with_capacity(11);
            out.extend_from_slice(&info.memory_size.to_le_bytes());
            out.extend_from_slice(&info.ld_count.to_le_bytes());
            out.push(0);
            out
        }) else {
            return CciResponse::error(CciReturnCode::InvalidInput);
        };
        CciResponse::success(response)
    }

    fn get_ld_allocations(&self, payload: &[u8]) -> CciResponse {
        let Some(response) = self.with_mld(payload, |mld, _| {
            let allocations = mld.get_ld_allocations();
            let mut out = vec![allocations.len() as u8, 0, 0, 0];
            for allocation in allocations {
                out.extend_from_slice(&allocation.to_le_bytes());
            }
            out
        }) else {
            return CciResponse::error(CciReturnCode::InvalidInput);
        };
        CciResponse::success(response)
    }

    fn set_ld_allocations(&self, payload: &[u8]) -> CciResponse {
        let Some(response) = self.with_mld(payload, |mld, rest| {
            let Some((&count, list)) = rest.split_first() else {
                return None;
            };
            let mut requested = Vec::with_capacity(usize::from(count));
            for chunk in list.chunks_exact(8).take(usize::from(count)) {
                requested.push(u64::from_le_bytes(chunk.try_into().unwrap()));
            }
            if requested.len() < usize::from(count) {
                return None;
            }
            let applied = mld.set_ld_allocations(&requested);
            let mut out = vec![applied.len() as u8, 0, 0, 0];
            for allocation in applied {
                out.extend_from_slice(&allocation.to_le_bytes());
            }
            Some(out)
        }) else {
            return CciResponse::error(CciReturnCode::InvalidInput);
        };
        match response {
            Some(out) => CciResponse::success(out),
            None => CciResponse::error(CciReturnCode::InvalidInput),
        }
    }
}

impl CciBackend for SwitchCciBackend {
    fn is_background(&self, opcode: Opcode) -> bool {
        matches!(opcode, Opcode::BindVppb | Opcode::UnbindVppb)
    }

    fn execute(&self, opcode: Opcode, payload: &[u8]) -> BoxFuture<'_, CciResponse> {
        let payload = payload.to_vec();
        async move {
            match opcode {
                Opcode::IdentifySwitchDevice => self.identify_switch_device(),
                Opcode::GetPhysicalPortState => self.get_physical_port_state(&payload),
                Opcode::GetVirtualCxlSwitchInfo => self.get_virtual_cxl_switch_info(&payload),
                Opcode::BindVppb => self.bind_vppb(&payload).await,
                Opcode::UnbindVppb => self.unbind_vppb(&payload).await,
                Opcode::GetConnectedDevices => self.get_connected_devices(),
                Opcode::GetLdInfo => self.get_ld_info(&payload),
                Opcode::GetLdAllocations => self.get_ld_allocations(&payload),
                Opcode::SetLdAllocations => self.set_ld_allocations(&payload),
                _ => CciResponse::error(CciReturnCode::Unsupported),
            }
        }
        .boxed()
    }
}
