//! Per-VCS routers, one per traffic class.
//!
//! Each router binds the upstream port's VCS-facing FIFO pair to the vPPB
//! bridges. CFG routes by BDF, MMIO by address window, CXL.mem by HPA through
//! the committed HDM decoders (BI responses by BI-ID), CXL.cache by cache ID.
//! The return path is a straight fan-in with no translation. Traffic routed
//! to a slot whose bind state is in transition completes UR (CFG/MMIO) or is
//! dropped (CXL.mem/.cache).

use std::sync::Arc;

use futures::future::join_all;
use tokio::join;
use tracing::{debug, warn};

use cxl_pci::routing::RoutingTable;
use cxl_protocol::fifo::{CxlConnection, FifoPair};
use cxl_protocol::packet::{CplStatus, CxlCachePacket, CxlIoPacket, CxlMemPacket};
use cxl_protocol::{ComponentError, ComponentState};

use crate::binder::{BindStatus, BindStatusBoard};

pub struct VcsRouters {
    state: ComponentState,
    vcs_id: usize,
    routing_table: Arc<RoutingTable>,
    board: Arc<BindStatusBoard>,
    upstream: CxlConnection,
    vppbs: Vec<CxlConnection>,
}

impl VcsRouters {
    pub fn new(
        vcs_id: usize,
        routing_table: Arc<RoutingTable>,
        board: Arc<BindStatusBoard>,
        upstream: CxlConnection,
        vppbs: Vec<CxlConnection>,
    ) -> Self {
        VcsRouters {
            state: ComponentState::new(),
            vcs_id,
            routing_table,
            board,
            upstream,
            vppbs,
        }
    }

    fn slot_ready(&self, vppb: usize) -> bool {
        self.board.status(vppb) != BindStatus::InProgress
    }

    async fn route_cfg(&self) {
        let upstream = &self.upstream.cfg;
        while let Some(packet) = upstream.host_to_target.recv().await {
            let request = match &packet {
                CxlIoPacket::CfgRd(request) | CxlIoPacket::CfgWr(request) => *request,
                other => {
                    warn!("[VCS{}] unexpected CFG packet {other:?}, dropped", self.vcs_id);
                    continue;
                }
            };
            let target = self.routing_table.get_config_space_target_port(request.bdf);
            let Some(target) = target.filter(|t| *t < self.vppbs.len()) else {
                debug!(
                    "[VCS{}] CFG to {} is not routable, completing UR",
                    self.vcs_id, request.bdf
                );
                upstream
                    .target_to_host
                    .send(CxlIoPacket::cpl(request.req_id, request.tag, CplStatus::Ur));
                continue;
            };
            if !self.slot_ready(target) {
                upstream
                    .target_to_host
                    .send(CxlIoPacket::cpl(request.req_id, request.tag, CplStatus::Ur));
                continue;
            }
            self.vppbs[target].cfg.host_to_target.send(packet);
        }
    }

    async fn route_mmio(&self) {
        let upstream = &self.upstream.mmio;
        while let Some(packet) = upstream.host_to_target.recv().await {
            let (request, is_read) = match &packet {
                CxlIoPacket::MemRd(request) => (*request, true),
                CxlIoPacket::MemWr(request) => (*request, false),
                other => {
                    warn!("[VCS{}] unexpected MMIO packet {other:?}, dropped", self.vcs_id);
                    continue;
                }
            };
            let target = self.routing_table.get_mmio_target_port(request.addr);
            let Some(target) = target.filter(|t| *t < self.vppbs.len()) else {
                if is_read {
                    debug!("[VCS{}] MMIO RD 0x{:x} OOB", self.vcs_id, request.addr);
                    upstream.target_to_host.send(CxlIoPacket::cpl_d(
                        request.req_id,
                        request.tag,
                        0,
                        request.size,
                    ));
                } else {
                    debug!("[VCS{}] MMIO WR 0x{:x} OOB, dropped", self.vcs_id, request.addr);
                }
                continue;
            };
            if !self.slot_ready(target) {
                if is_read {
                    upstream
                        .target_to_host
                        .send(CxlIoPacket::cpl(request.req_id, request.tag, CplStatus::Ur));
                }
                continue;
            }
            self.vppbs[target].mmio.host_to_target.send(packet);
        }
    }

    async fn route_mem(&self) {
        let upstream = &self.upstream.cxl_mem;
        while let Some(packet) = upstream.host_to_target.recv().await {
            let target = match &packet {
                CxlMemPacket::M2SReq(req) => self.routing_table.get_cxl_mem_target_port(req.addr),
                CxlMemPacket::M2SRwD(rwd) => self.routing_table.get_cxl_mem_target_port(rwd.addr),
                CxlMemPacket::M2SBIRsp(rsp) => self.routing_table.get_bi_target_port(rsp.bi_id),
                other => {
                    warn!(
                        "[VCS{}] unexpected CXL.mem packet {other:?}, dropped",
                        self.vcs_id
                    );
                    continue;
                }
            };
            let Some(target) = target.filter(|t| *t < self.vppbs.len() && self.slot_ready(*t))
            else {
                warn!("[VCS{}] unroutable CXL.mem packet, dropped", self.vcs_id);
                continue;
            };
            self.vppbs[target].cxl_mem.host_to_target.send(packet);
        }
    }

    async fn route_cache(&self) {
        let upstream = &self.upstream.cxl_cache;
        while let Some(packet) = upstream.host_to_target.recv().await {
            let Some(cache_id) = packet.cache_id() else {
                warn!(
                    "[VCS{}] unexpected CXL.cache packet {packet:?}, dropped",
                    self.vcs_id
                );
                continue;
            };
            let target = self.routing_table.get_cxl_cache_target_port(cache_id);
            let Some(target) = target.filter(|t| *t < self.vppbs.len() && self.slot_ready(*t))
            else {
                warn!(
                    "[VCS{}] unroutable CXL.cache packet for cache {cache_id}, dropped",
                    self.vcs_id
                );
                continue;
            };
            self.vppbs[target].cxl_cache.host_to_target.send(packet);
        }
    }

    async fn fan_in(&self) {
        fn pump<T: Send + 'static>(
            from: &FifoPair<T>,
            to: &FifoPair<T>,
        ) -> futures::future::BoxFuture<'static, ()> {
            let from = from.target_to_host.clone();
            let to = to.target_to_host.clone();
            Box::pin(async move {
                while let Some(packet) = from.recv().await {
                    to.send(packet);
                }
            })
        }

        let mut pumps = Vec::new();
        for vppb in &self.vppbs {
            pumps.push(pump(&vppb.cfg, &self.upstream.cfg));
            pumps.push(pump(&vppb.mmio, &self.upstream.mmio));
            pumps.push(pump(&vppb.cxl_mem, &self.upstream.cxl_mem));
            pumps.push(pump(&vppb.cxl_cache, &self.upstream.cxl_cache));
        }
        join_all(pumps).await;
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        join!(
            self.route_cfg(),
            self.route_mmio(),
            self.route_mem(),
            self.route_cache(),
            self.fan_in()
        );
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.upstream.shutdown_host_to_target();
        for vppb in &self.vppbs {
            vppb.shutdown_target_to_host();
        }
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
