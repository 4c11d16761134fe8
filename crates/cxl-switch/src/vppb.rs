//! vPPB bridges and the dummy downstream endpoint.
//!
//! Every vPPB of a VCS is a permanent type-1 bridge function whose registers
//! (bus numbers, windows, BAR) survive bind and unbind, so re-enumeration
//! after a rebind sees an identical bridge tree. What sits *below* the bridge
//! is what the port binder swaps: the bound physical DSP's transport, or the
//! dummy endpoint that answers configuration reads with all-ones the way an
//! empty slot does.

use std::sync::{Arc, Mutex};

use tokio::join;
use tracing::debug;

use cxl_pci::cfg_space::{ConfigSpaceManager, PciDeviceKind};
use cxl_pci::mmio::{BarEntry, MmioBackend, MmioManager, MmioState};
use cxl_pci::relay::FifoRelay;
use cxl_pci::routing::{BridgeRole, BridgeRouting, RoutingTable};
use cxl_protocol::fifo::CxlConnection;
use cxl_protocol::packet::{CplStatus, CxlCachePacket, CxlIoPacket, CxlMemPacket};
use cxl_protocol::{ComponentError, ComponentState};
use cxl_regs::component::{BiDecoder, ComponentRegisterBlock, ComponentRegisterConfig};
use cxl_regs::config_space::{ConfigSpaceBuilder, RegisterLocatorBlock};
use cxl_regs::identity::{DvsecDeviceType, PciIdentity, PciePortType, SW_DSP_DID};

const COMPONENT_BAR_SIZE: u64 = 0x10000;

/// A vPPB: persistent DSP bridge function inside a VCS.
pub struct VppbBridge {
    state: ComponentState,
    vppb_index: usize,
    upstream: CxlConnection,
    downstream: CxlConnection,
    cfg_manager: ConfigSpaceManager,
    mmio_manager: MmioManager,
    mem_relay: FifoRelay<CxlMemPacket>,
    cache_relay: FifoRelay<CxlCachePacket>,
    bi_decoder: Arc<BiDecoder>,
}

impl VppbBridge {
    pub fn new(vcs_id: usize, vppb_index: usize, routing_table: &Arc<RoutingTable>) -> Arc<Self> {
        let label = format!("VCS{vcs_id}:vPPB{vppb_index}");
        let upstream = CxlConnection::new();
        let downstream = CxlConnection::new();

        let bi_decoder = BiDecoder::new(true);
        let block = ComponentRegisterBlock::new(
            ComponentRegisterConfig {
                hdm: None,
                bi_rt: None,
                bi_decoder: Some(bi_decoder.clone()),
                cache_rt: None,
            },
            label.clone(),
        );
        let mmio_state = MmioState::new(vec![BarEntry {
            backend: MmioBackend::Component(block),
            size: COMPONENT_BAR_SIZE,
        }]);
        let hooks = Arc::new(BridgeRouting {
            role: BridgeRole::Vppb(vppb_index),
            routing_table: routing_table.clone(),
            mmio: mmio_state.clone(),
        });

        let identity = PciIdentity::bridge(SW_DSP_DID, PciePortType::DownstreamSwitchPort);
        let config_space = ConfigSpaceBuilder::bridge(identity)
            .bar(0, COMPONENT_BAR_SIZE)
            .cxl_port_dvsec(DvsecDeviceType::Dsp)
            .register_locator(vec![RegisterLocatorBlock {
                bir: 0,
                block_id: 0x01,
                offset: 0,
            }])
            .build(hooks);

        let cfg_manager = ConfigSpaceManager::new(
            Arc::new(Mutex::new(config_space)),
            upstream.cfg.clone(),
            Some(downstream.cfg.clone()),
            PciDeviceKind::DownstreamBridge,
            label.clone(),
        );
        let mmio_manager = MmioManager::new(
            mmio_state,
            upstream.mmio.clone(),
            Some(downstream.mmio.clone()),
            label.clone(),
        );
        let mem_relay = FifoRelay::new(upstream.cxl_mem.clone(), downstream.cxl_mem.clone());
        let cache_relay = FifoRelay::new(upstream.cxl_cache.clone(), downstream.cxl_cache.clone());

        Arc::new(VppbBridge {
            state: ComponentState::new(),
            vppb_index,
            upstream,
            downstream,
            cfg_manager,
            mmio_manager,
            mem_relay,
            cache_relay,
            bi_decoder,
        })
    }

    pub fn vppb_index(&self) -> usize {
        self.vppb_index
    }

    /// Router-facing side.
    pub fn upstream_connection(&self) -> &CxlConnection {
        &self.upstream
    }

    /// Below-bridge side the binder relays.
    pub fn downstream_connection(&self) -> &CxlConnection {
        &self.downstream
    }

    pub fn bi_decoder(&self) -> &Arc<BiDecoder> {
        &self.bi_decoder
    }

    /// Stamps the physical port this vPPB currently fronts into the bridge's
    /// link capabilities, where the CXL.mem driver reads it back.
    pub fn set_port_number(&self, port: u8) {
        self.cfg_manager.register().lock().unwrap().set_port_number(port);
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

/// Stand-in below an unbound vPPB. Configuration reads complete with
/// all-ones (no device present), writes complete successfully, MMIO reads
/// return zero, MMIO writes and CXL.mem/.cache packets are dropped.
pub struct DummyEndpoint {
    state: ComponentState,
    connection: CxlConnection,
    label: String,
}

impl DummyEndpoint {
    pub fn new(vcs_id: usize, vppb_index: usize) -> Arc<Self> {
        Arc::new(DummyEndpoint {
            state: ComponentState::new(),
            connection: CxlConnection::new(),
            label: format!("VCS{vcs_id}:vPPB{vppb_index}:Dummy"),
        })
    }

    pub fn connection(&self) -> &CxlConnection {
        &self.connection
    }

    async fn serve_cfg(&self) {
        while let Some(packet) = self.connection.cfg.host_to_target.recv().await {
            match packet {
                CxlIoPacket::CfgRd(request) => {
                    let mask = if request.size >= 4 {
                        0xFFFF_FFFF
                    } else {
                        (1u64 << (u32::from(request.size) * 8)) - 1
                    };
                    self.connection.cfg.target_to_host.send(CxlIoPacket::cpl_d(
                        request.req_id,
                        request.tag,
                        mask,
                        request.size,
                    ));
                }
                CxlIoPacket::CfgWr(request) => {
                    self.connection.cfg.target_to_host.send(CxlIoPacket::cpl(
                        request.req_id,
                        request.tag,
                        CplStatus::Sc,
                    ));
                }
                _ => {}
            }
        }
    }

    async fn serve_mmio(&self) {
        while let Some(packet) = self.connection.mmio.host_to_target.recv().await {
            if let CxlIoPacket::MemRd(request) = packet {
                self.connection.mmio.target_to_host.send(CxlIoPacket::cpl_d(
                    request.req_id,
                    request.tag,
                    0,
                    request.size,
                ));
            }
        }
    }

    async fn drop_mem_and_cache(&self) {
        let mem = async {
            while self.connection.cxl_mem.host_to_target.recv().await.is_some() {}
        };
        let cache = async {
            while self
                .connection
                .cxl_cache
                .host_to_target
                .recv()
                .await
                .is_some()
            {}
        };
        join!(mem, cache);
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        join!(self.serve_cfg(), self.serve_mmio(), self.drop_mem_and_cache());
        debug!("[{}] stopped", self.label);
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.connection.shutdown_host_to_target();
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxl_protocol::packet::Bdf;

    #[tokio::test]
    async fn dummy_endpoint_completes_cfg_reads_with_all_ones() {
        let dummy = DummyEndpoint::new(0, 1);
        let runner = dummy.clone();
        let task = tokio::spawn(async move { runner.run().await });
        dummy.wait_for_ready().await;

        dummy
            .connection()
            .cfg
            .host_to_target
            .send(CxlIoPacket::cfg_rd(Bdf::new(3, 0, 0), 0, 2, true, 0, 5));
        let response = dummy.connection().cfg.target_to_host.recv().await.unwrap();
        assert_eq!(response, CxlIoPacket::cpl_d(0, 5, 0xFFFF, 2));

        dummy
            .connection()
            .mmio
            .host_to_target
            .send(CxlIoPacket::mem_rd(0xFE00_0000, 4, 0, 6));
        let response = dummy.connection().mmio.target_to_host.recv().await.unwrap();
        assert_eq!(response, CxlIoPacket::cpl_d(0, 6, 0, 4));

        dummy.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
