//! Physical switch ports.
//!
//! An upstream port is a full type-1 bridge function: config space with the
//! USP identity, BAR0 component block carrying the switch HDM decoders, BI
//! route table and cache-ID route table, and relays binding its transport to
//! the VCS routers. A downstream port is the physical attach point of an
//! endpoint: it owns the transport connection the device (or its TCP fabric
//! edge) speaks on, plus the PPB LD router that multiplexes logical devices
//! over that one link.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use tokio::join;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use cxl_pci::cfg_space::{ConfigSpaceManager, PciDeviceKind};
use cxl_pci::mmio::{BarEntry, MmioBackend, MmioManager, MmioState};
use cxl_pci::relay::FifoRelay;
use cxl_pci::routing::{BridgeRole, RoutingTable};
use cxl_protocol::fifo::CxlConnection;
use cxl_protocol::packet::CxlMemPacket;
use cxl_protocol::{ComponentError, ComponentState};
use cxl_regs::component::{
    BiRouteTable, CacheIdRouteTable, ComponentRegisterBlock, ComponentRegisterConfig, HdmBackend,
};
use cxl_regs::config_space::{ConfigSpaceBuilder, ConfigSpaceHooks, RegisterLocatorBlock};
use cxl_regs::hdm::SwitchHdmDecoderManager;
use cxl_regs::identity::{DvsecDeviceType, PciIdentity, PciePortType, SW_USP_DID};

const COMPONENT_BAR_SIZE: u64 = 0x10000;
const SWITCH_DECODER_COUNT: usize = 32;

/// Config-space hooks of a switch bridge whose routing table arrives after
/// construction (the VCS attaches it).
pub(crate) struct SwitchBridgeHooks {
    pub mmio: Arc<MmioState>,
    pub routing: OnceLock<(Arc<RoutingTable>, BridgeRole)>,
}

impl ConfigSpaceHooks for SwitchBridgeHooks {
    fn bar_changed(&self, index: usize, base: u64, size: u64) {
        self.mmio.set_bar_base(index, base);
        if let Some((table, BridgeRole::Vppb(vppb))) = self.routing.get() {
            if index == 0 {
                table.set_bar_range(*vppb, base, base + size - 1);
            }
        }
    }

    fn secondary_bus_changed(&self, bus: u8) {
        if let Some((table, role)) = self.routing.get() {
            match role {
                BridgeRole::Usp => table.set_usp_secondary_bus(bus),
                BridgeRole::Vppb(vppb) => table.set_secondary_bus(*vppb, bus),
            }
        }
    }

    fn subordinate_bus_changed(&self, bus: u8) {
        if let Some((table, BridgeRole::Vppb(vppb))) = self.routing.get() {
            table.set_subordinate_bus(*vppb, bus);
        }
    }

    fn memory_base_changed(&self, base: u64) {
        self.mmio.set_window_base(base);
        if let Some((table, BridgeRole::Vppb(vppb))) = self.routing.get() {
            table.set_memory_base(*vppb, base);
        }
    }

    fn memory_limit_changed(&self, limit: u64) {
        self.mmio.set_window_limit(limit);
        if let Some((table, BridgeRole::Vppb(vppb))) = self.routing.get() {
            table.set_memory_limit(*vppb, limit);
        }
    }
}

pub struct UpstreamPort {
    state: ComponentState,
    port_index: u8,
    transport: CxlConnection,
    downstream: CxlConnection,
    cfg_manager: ConfigSpaceManager,
    mmio_manager: MmioManager,
    mem_relay: FifoRelay<CxlMemPacket>,
    cache_relay: FifoRelay<cxl_protocol::packet::CxlCachePacket>,
    hdm: Arc<SwitchHdmDecoderManager>,
    cache_rt: Arc<CacheIdRouteTable>,
    hooks: Arc<SwitchBridgeHooks>,
}

impl UpstreamPort {
    pub fn new(transport: CxlConnection, port_index: u8) -> Arc<Self> {
        let label = format!("USP{port_index}");
        let downstream = CxlConnection::new();

        let hdm = Arc::new(SwitchHdmDecoderManager::new(
            SWITCH_DECODER_COUNT,
            label.clone(),
        ));
        let cache_rt = CacheIdRouteTable::new();
        let block = ComponentRegisterBlock::new(
            ComponentRegisterConfig {
                hdm: Some(HdmBackend::Switch(hdm.clone())),
                bi_rt: Some(BiRouteTable::new()),
                bi_decoder: None,
                cache_rt: Some(cache_rt.clone()),
            },
            label.clone(),
        );
        let mmio_state = MmioState::new(vec![BarEntry {
            backend: MmioBackend::Component(block),
            size: COMPONENT_BAR_SIZE,
        }]);
        let hooks = Arc::new(SwitchBridgeHooks {
            mmio: mmio_state.clone(),
            routing: OnceLock::new(),
        });

        let identity = PciIdentity::bridge(SW_USP_DID, PciePortType::UpstreamSwitchPort);
        let config_space = ConfigSpaceBuilder::bridge(identity)
            .bar(0, COMPONENT_BAR_SIZE)
            .cxl_port_dvsec(DvsecDeviceType::Usp)
            .register_locator(vec![RegisterLocatorBlock {
                bir: 0,
                block_id: 0x01,
                offset: 0,
            }])
            .build(hooks.clone());

        let cfg_manager = ConfigSpaceManager::new(
            Arc::new(Mutex::new(config_space)),
            transport.cfg.clone(),
            Some(downstream.cfg.clone()),
            PciDeviceKind::UpstreamBridge,
            label.clone(),
        );
        let mmio_manager = MmioManager::new(
            mmio_state,
            transport.mmio.clone(),
            Some(downstream.mmio.clone()),
            label.clone(),
        );
        let mem_relay = FifoRelay::new(transport.cxl_mem.clone(), downstream.cxl_mem.clone());
        let cache_relay = FifoRelay::new(transport.cxl_cache.clone(), downstream.cxl_cache.clone());

        Arc::new(UpstreamPort {
            state: ComponentState::new(),
            port_index,
            transport,
            downstream,
            cfg_manager,
            mmio_manager,
            mem_relay,
            cache_relay,
            hdm,
            cache_rt,
            hooks,
        })
    }

    pub fn port_index(&self) -> u8 {
        self.port_index
    }

    pub fn transport(&self) -> &CxlConnection {
        &self.transport
    }

    /// VCS-facing side of the port.
    pub fn downstream_connection(&self) -> &CxlConnection {
        &self.downstream
    }

    /// Attaches the VCS routing table: HDM decoders and the cache route table
    /// of this port feed its lookups, and the port's bridge registers update
    /// its entries from now on.
    pub fn set_routing_table(&self, table: &Arc<RoutingTable>) {
        table.set_hdm_decoder(self.hdm.clone());
        table.set_cache_route_table(self.cache_rt.clone());
        let _ = self.hooks.routing.set((table.clone(), BridgeRole::Usp));
    }

    pub fn hdm_decoder_manager(&self) -> &Arc<SwitchHdmDecoderManager> {
        &self.hdm
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        let (cfg, mmio, _, _) = join!(
            self.cfg_manager.run(),
            self.mmio_manager.run(),
            self.mem_relay.pump(),
            self.cache_relay.pump()
        );
        cfg?;
        mmio?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.cfg_manager.stop().await?;
        self.mmio_manager.stop().await?;
        self.mem_relay.shutdown();
        self.cache_relay.shutdown();
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}

/// Physical downstream port: transport attach point plus the PPB LD router.
pub struct DownstreamPort {
    state: ComponentState,
    port_index: u8,
    transport: CxlConnection,
    connected: AtomicBool,
    ld_connections: Mutex<HashMap<u8, CxlConnection>>,
    ld_pumps: Mutex<Vec<JoinHandle<()>>>,
    label: String,
}

impl DownstreamPort {
    pub fn new(transport: CxlConnection, port_index: u8) -> Arc<Self> {
        Arc::new(DownstreamPort {
            state: ComponentState::new(),
            port_index,
            transport,
            connected: AtomicBool::new(false),
            ld_connections: Mutex::new(HashMap::new()),
            ld_pumps: Mutex::new(Vec::new()),
            label: format!("DSP{port_index}"),
        })
    }

    pub fn port_index(&self) -> u8 {
        self.port_index
    }

    pub fn transport(&self) -> &CxlConnection {
        &self.transport
    }

    /// Marks whether a device currently sits on the other end of the
    /// transport — set when an endpoint is composed in-process or a fabric
    /// client claims the port, cleared when it goes away.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Creates (or returns) the per-LD connection the binder relays a vPPB
    /// onto, and starts its downstream pumps.
    pub fn bind_ld(self: &Arc<Self>, ld_id: u8) -> CxlConnection {
        let mut connections = self.ld_connections.lock().unwrap();
        if let Some(existing) = connections.get(&ld_id) {
            return existing.clone();
        }
        let connection = CxlConnection::new();
        connections.insert(ld_id, connection.clone());
        drop(connections);

        // Downstream pumps: stamp the LD onto everything leaving for the
        // device.
        let mut pumps = self.ld_pumps.lock().unwrap();
        {
            let from = connection.cfg.host_to_target.clone();
            let to = self.transport.cfg.host_to_target.clone();
            pumps.push(tokio::spawn(async move {
                while let Some(mut packet) = from.recv().await {
                    packet.set_ld_id(ld_id);
                    to.send(packet);
                }
            }));
        }
        {
            let from = connection.mmio.host_to_target.clone();
            let to = self.transport.mmio.host_to_target.clone();
            pumps.push(tokio::spawn(async move {
                while let Some(mut packet) = from.recv().await {
                    packet.set_ld_id(ld_id);
                    to.send(packet);
                }
            }));
        }
        {
            let from = connection.cxl_mem.host_to_target.clone();
            let to = self.transport.cxl_mem.host_to_target.clone();
            pumps.push(tokio::spawn(async move {
                while let Some(mut packet) = from.recv().await {
                    match &mut packet {
                        CxlMemPacket::M2SReq(req) => req.ld_id = ld_id,
                        CxlMemPacket::M2SRwD(rwd) => rwd.ld_id = ld_id,
                        // No LD-ID on BI packets.
                        _ => {}
                    }
                    to.send(packet);
                }
            }));
        }
        {
            let from = connection.cxl_cache.host_to_target.clone();
            let to = self.transport.cxl_cache.host_to_target.clone();
            pumps.push(tokio::spawn(async move {
                while let Some(packet) = from.recv().await {
                    to.send(packet);
                }
            }));
        }
        connection
    }

    pub fn unbind_ld(&self, ld_id: u8) {
        self.ld_connections.lock().unwrap().remove(&ld_id);
    }

    fn ld_connection(&self, ld_id: u8) -> Option<CxlConnection> {
        let connections = self.ld_connections.lock().unwrap();
        connections
            .get(&ld_id)
            .or_else(|| connections.get(&0))
            .cloned()
    }

    /// Upstream router: demultiplex device responses by LD.
    async fn route_upstream(&self) {
        let cfg = async {
            while let Some(packet) = self.transport.cfg.target_to_host.recv().await {
                match self.ld_connection(packet.ld_id()) {
                    Some(connection) => connection.cfg.target_to_host.send(packet),
                    None => warn!("[{}] CFG completion for unbound LD", self.label),
                }
            }
        };
        let mmio = async {
            while let Some(packet) = self.transport.mmio.target_to_host.recv().await {
                match self.ld_connection(packet.ld_id()) {
                    Some(connection) => connection.mmio.target_to_host.send(packet),
                    None => warn!("[{}] MMIO completion for unbound LD", self.label),
                }
            }
        };
        let mem = async {
            while let Some(packet) = self.transport.cxl_mem.target_to_host.recv().await {
                let ld_id = match &packet {
                    CxlMemPacket::S2MNdr(ndr) => ndr.ld_id,
                    CxlMemPacket::S2MDrs(drs) => drs.ld_id,
                    CxlMemPacket::S2MBISnp(_) => 0,
                    other => {
                        warn!("[{}] unexpected CXL.mem packet {other:?}", self.label);
                        continue;
                    }
                };
                match self.ld_connection(ld_id) {
                    Some(connection) => connection.cxl_mem.target_to_host.send(packet),
                    None => warn!("[{}] CXL.mem response for unbound LD", self.label),
                }
            }
        };
        let cache = async {
            while let Some(packet) = self.transport.cxl_cache.target_to_host.recv().await {
                match self.ld_connection(0) {
                    Some(connection) => connection.cxl_cache.target_to_host.send(packet),
                    None => warn!("[{}] CXL.cache response with nothing bound", self.label),
                }
            }
        };
        join!(cfg, mmio, mem, cache);
        debug!("[{}] upstream router stopped", self.label);
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        self.route_upstream().await;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.transport.shutdown_target_to_host();
        for pump in self.ld_pumps.lock().unwrap().drain(..) {
            pump.abort();
        }
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}

/// A physical port of the switch.
#[derive(Clone)]
pub enum PhysicalPort {
    Usp(Arc<UpstreamPort>),
    Dsp(Arc<DownstreamPort>),
}

impl PhysicalPort {
    pub fn port_index(&self) -> u8 {
        match self {
            PhysicalPort::Usp(port) => port.port_index(),
            PhysicalPort::Dsp(port) => port.port_index(),
        }
    }

    pub fn is_dsp(&self) -> bool {
        matches!(self, PhysicalPort::Dsp(_))
    }

    pub fn transport(&self) -> &CxlConnection {
        match self {
            PhysicalPort::Usp(port) => port.transport(),
            PhysicalPort::Dsp(port) => port.transport(),
        }
    }
}
