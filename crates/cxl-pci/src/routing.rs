//! Per-VCS routing state.
//!
//! The routing table is populated as a side effect of enumeration (bridge
//! config-space writes) and of vPPB bind/unbind (physical-port mapping).
//! CFG requests route by BDF, MMIO by address window, CXL.mem by HPA through
//! the upstream port's committed HDM decoders, and CXL.cache by cache ID
//! through the committed cache-ID route table. HDM decoder targets and cache
//! route table entries name physical DSP ports; the table translates them to
//! the vPPB currently bound to that port.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use cxl_protocol::packet::Bdf;
use cxl_regs::component::CacheIdRouteTable;
use cxl_regs::config_space::ConfigSpaceHooks;
use cxl_regs::hdm::SwitchHdmDecoderManager;

#[derive(Clone, Copy, Debug, Default)]
struct VppbEntry {
    secondary_bus: u8,
    subordinate_bus: u8,
    memory_base: u64,
    memory_limit: u64,
    bar_base: u64,
    bar_limit: u64,
}

#[derive(Default)]
struct RoutingState {
    vppbs: Vec<VppbEntry>,
    usp_secondary_bus: u8,
    /// Physical DSP port -> bound vPPB.
    port_to_vppb: HashMap<u8, usize>,
}

pub struct RoutingTable {
    state: Mutex<RoutingState>,
    hdm: OnceLock<Arc<SwitchHdmDecoderManager>>,
    cache_rt: OnceLock<Arc<CacheIdRouteTable>>,
    label: String,
}

impl RoutingTable {
    pub fn new(vppb_count: usize, label: impl Into<String>) -> Arc<Self> {
        Arc::new(RoutingTable {
            state: Mutex::new(RoutingState {
                vppbs: vec![VppbEntry::default(); vppb_count],
                ..Default::default()
            }),
            hdm: OnceLock::new(),
            cache_rt: OnceLock::new(),
            label: label.into(),
        })
    }

    pub fn vppb_count(&self) -> usize {
        self.state.lock().unwrap().vppbs.len()
    }

    pub fn set_hdm_decoder(&self, manager: Arc<SwitchHdmDecoderManager>) {
        let _ = self.hdm.set(manager);
    }

    pub fn set_cache_route_table(&self, table: Arc<CacheIdRouteTable>) {
        let _ = self.cache_rt.set(table);
    }

    pub fn set_usp_secondary_bus(&self, bus: u8) {
        self.state.lock().unwrap().usp_secondary_bus = bus;
    }

    pub fn set_secondary_bus(&self, vppb: usize, bus: u8) {
        if let Some(entry) = self.state.lock().unwrap().vppbs.get_mut(vppb) {
            entry.secondary_bus = bus;
        }
    }

    pub fn set_subordinate_bus(&self, vppb: usize, bus: u8) {
        if let Some(entry) = self.state.lock().unwrap().vppbs.get_mut(vppb) {
            entry.subordinate_bus = bus;
        }
    }

    pub fn set_memory_base(&self, vppb: usize, base: u64) {
        if let Some(entry) = self.state.lock().unwrap().vppbs.get_mut(vppb) {
            entry.memory_base = base;
        }
    }

    pub fn set_memory_limit(&self, vppb: usize, limit: u64) {
        if let Some(entry) = self.state.lock().unwrap().vppbs.get_mut(vppb) {
            entry.memory_limit = limit;
        }
    }

    pub fn set_bar_range(&self, vppb: usize, base: u64, limit: u64) {
        if let Some(entry) = self.state.lock().unwrap().vppbs.get_mut(vppb) {
            entry.bar_base = base;
            entry.bar_limit = limit;
        }
    }

    /// Records which vPPB a physical DSP port is bound to.
    pub fn bind_port(&self, physical_port: u8, vppb: usize) {
        self.state
            .lock()
            .unwrap()
            .port_to_vppb
            .insert(physical_port, vppb);
    }

    pub fn unbind_port(&self, physical_port: u8) {
        self.state.lock().unwrap().port_to_vppb.remove(&physical_port);
    }

    /// vPPB serving a CFG request to `bdf`, or `None` when unroutable.
    pub fn get_config_space_target_port(&self, bdf: Bdf) -> Option<usize> {
        let state = self.state.lock().unwrap();
        let bus = bdf.bus();
        if bus == state.usp_secondary_bus {
            let device = usize::from(bdf.device());
            return (device < state.vppbs.len()).then_some(device);
        }
        state.vppbs.iter().position(|entry| {
            entry.secondary_bus != 0
                && bus >= entry.secondary_bus
                && bus <= entry.subordinate_bus
        })
    }

    /// vPPB whose BAR or forwarding window contains `addr`.
    pub fn get_mmio_target_port(&self, addr: u64) -> Option<usize> {
        let state = self.state.lock().unwrap();
        state.vppbs.iter().position(|entry| {
            let in_bar = entry.bar_limit != 0 && addr >= entry.bar_base && addr <= entry.bar_limit;
            let in_window = entry.memory_limit != 0
                && addr >= entry.memory_base
                && addr <= entry.memory_limit;
            in_bar || in_window
        })
    }

    /// vPPB serving `addr` through the committed switch HDM decoders.
    pub fn get_cxl_mem_target_port(&self, addr: u64) -> Option<usize> {
        let physical_port = self.hdm.get()?.get_target(addr)?;
        self.vppb_for_port(physical_port)
    }

    /// vPPB serving `cache_id` through the committed cache route table.
    pub fn get_cxl_cache_target_port(&self, cache_id: u8) -> Option<usize> {
        let physical_port = self.cache_rt.get()?.get_target(cache_id)?;
        self.vppb_for_port(physical_port)
    }

    /// vPPB that owns a BI response. Devices use their physical port index
    /// as BI-ID, so the bound-port map resolves it.
    pub fn get_bi_target_port(&self, bi_id: u8) -> Option<usize> {
        self.vppb_for_port(bi_id)
    }

    fn vppb_for_port(&self, physical_port: u8) -> Option<usize> {
        self.state
            .lock()
            .unwrap()
            .port_to_vppb
            .get(&physical_port)
            .copied()
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

/// Who a bridge's config space belongs to.
#[derive(Clone, Copy, Debug)]
pub enum BridgeRole {
    Usp,
    Vppb(usize),
}

/// Connects a bridge's config-space writes to the routing table and its own
/// MMIO manager.
pub struct BridgeRouting {
    pub role: BridgeRole,
    pub routing_table: Arc<RoutingTable>,
    pub mmio: Arc<crate::mmio::MmioState>,
}

impl ConfigSpaceHooks for BridgeRouting {
    fn bar_changed(&self, index: usize, base: u64, size: u64) {
        self.mmio.set_bar_base(index, base);
        if let BridgeRole::Vppb(vppb) = self.role {
            if index == 0 {
                self.routing_table
                    .set_bar_range(vppb, base, base + size - 1);
            }
        }
    }

    fn secondary_bus_changed(&self, bus: u8) {
        match self.role {
            BridgeRole::Usp => self.routing_table.set_usp_secondary_bus(bus),
            BridgeRole::Vppb(vppb) => self.routing_table.set_secondary_bus(vppb, bus),
        }
    }

    fn subordinate_bus_changed(&self, bus: u8) {
        if let BridgeRole::Vppb(vppb) = self.role {
            self.routing_table.set_subordinate_bus(vppb, bus);
        }
    }

    fn memory_base_changed(&self, base: u64) {
        self.mmio.set_window_base(base);
        if let BridgeRole::Vppb(vppb) = self.role {
            self.routing_table.set_memory_base(vppb, base);
        }
    }

    fn memory_limit_changed(&self, limit: u64) {
        self.mmio.set_window_limit(limit);
        if let BridgeRole::Vppb(vppb) = self.role {
            self.routing_table.set_memory_limit(vppb, limit);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cfg_routes_by_device_on_the_usp_secondary_bus() {
        let table = RoutingTable::new(3, "vcs0");
        table.set_usp_secondary_bus(2);
        assert_eq!(table.get_config_space_target_port(Bdf::new(2, 0, 0)), Some(0));
        assert_eq!(table.get_config_space_target_port(Bdf::new(2, 2, 0)), Some(2));
        assert_eq!(table.get_config_space_target_port(Bdf::new(2, 3, 0)), None);
    }

    #[test]
    fn cfg_routes_by_bus_range_below_the_vppbs() {
        let table = RoutingTable::new(3, "vcs0");
        table.set_usp_secondary_bus(2);
        for (vppb, bus) in [(0usize, 3u8), (1, 4), (2, 5)] {
            table.set_secondary_bus(vppb, bus);
            table.set_subordinate_bus(vppb, bus);
        }
        assert_eq!(table.get_config_space_target_port(Bdf::new(3, 0, 0)), Some(0));
        assert_eq!(table.get_config_space_target_port(Bdf::new(5, 0, 0)), Some(2));
        assert_eq!(table.get_config_space_target_port(Bdf::new(6, 0, 0)), None);
    }

    #[test]
    fn mmio_routes_by_bar_and_window() {
        let table = RoutingTable::new(2, "vcs0");
        table.set_bar_range(0, 0xFE20_0000, 0xFE20_FFFF);
        table.set_memory_base(1, 0xFE40_0000);
        table.set_memory_limit(1, 0xFE5F_FFFF);
        assert_eq!(table.get_mmio_target_port(0xFE20_0040), Some(0));
        assert_eq!(table.get_mmio_target_port(0xFE50_0000), Some(1));
        assert_eq!(table.get_mmio_target_port(0xFE00_0000), None);
    }

    #[test]
    fn mem_routing_translates_physical_port_to_vppb() {
        let table = RoutingTable::new(3, "vcs0");
        let hdm = Arc::new(SwitchHdmDecoderManager::new(4, "usp"));
        let mut targets = [0u8; 8];
        targets[0] = 2; // physical port 2
        hdm.commit(
            0,
            cxl_regs::hdm::HdmDecoderConfig {
                hpa_base: 0x1_0000_0000,
                hpa_size: 0x1000_0000,
                targets,
                ..Default::default()
            },
        );
        table.set_hdm_decoder(hdm);

        // Nothing bound: committed decoder but no port mapping.
        assert_eq!(table.get_cxl_mem_target_port(0x1_0000_0000), None);

        table.bind_port(2, 1);
        assert_eq!(table.get_cxl_mem_target_port(0x1_0000_0000), Some(1));

        table.unbind_port(2);
        assert_eq!(table.get_cxl_mem_target_port(0x1_0000_0000), None);
    }
}
