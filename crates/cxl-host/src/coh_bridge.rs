//! Cache coherency bridge: the host's CXL.cache home.
//!
//! Resolves host-originated snoops against the device caches tracked in the
//! per-device snoop filter, and resolves device D2H requests against the
//! host LLC and the other device caches. Over-approximation of the snoop
//! filter is tolerated (it only costs an extra snoop); dropping an entry
//! that is still cached is not.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::join;
use tracing::{debug, warn};

use cxl_protocol::fifo::{
    CacheFifoPair, CacheRequest, CacheRequestOp, CacheResponse, CacheResponseStatus, Fifo,
    FifoPair, MemoryFifoPair, MemoryRequest,
};
use cxl_protocol::packet::{
    CacheLineData, CxlCachePacket, D2HData, D2HReq, D2HReqOpcode, D2HRsp, D2HRspOpcode,
    H2DReqOpcode, H2DRspState,
};
use cxl_protocol::{ComponentError, ComponentState};

pub struct CacheCoherencyBridgeConfig {
    pub host_name: String,
    pub num_cache_devices: usize,
    /// LLC requests into the bridge (DRAM coherency path).
    pub upstream_cache: CacheFifoPair,
    /// Bridge snoops into the host LLC.
    pub upstream_snoop: CacheFifoPair,
    /// DRAM requests toward the home agent.
    pub memory_producer: MemoryFifoPair,
    pub downstream: FifoPair<CxlCachePacket>,
}

pub struct CacheCoherencyBridge {
    state: ComponentState,
    upstream_cache: CacheFifoPair,
    upstream_snoop: CacheFifoPair,
    memory_producer: MemoryFifoPair,
    downstream: FifoPair<CxlCachePacket>,
    sf_device: Mutex<Vec<HashSet<u64>>>,
    uqid: Mutex<u16>,
    d2h_req: Fifo<D2HReq>,
    d2h_rsp: Fifo<D2HRsp>,
    d2h_data: Fifo<D2HData>,
    label: String,
}

impl CacheCoherencyBridge {
    pub fn new(config: CacheCoherencyBridgeConfig) -> Self {
        CacheCoherencyBridge {
            state: ComponentState::new(),
            upstream_cache: config.upstream_cache,
            upstream_snoop: config.upstream_snoop,
            memory_producer: config.memory_producer,
            downstream: config.downstream,
            sf_device: Mutex::new(vec![HashSet::new(); config.num_cache_devices.max(1)]),
            uqid: Mutex::new(0),
            d2h_req: Fifo::new(),
            d2h_rsp: Fifo::new(),
            d2h_data: Fifo::new(),
            label: format!("{}:CacheCoherencyBridge", config.host_name),
        }
    }

    pub fn set_cache_device_count(&self, count: usize) {
        *self.sf_device.lock().unwrap() = vec![HashSet::new(); count.max(1)];
    }

    fn next_uqid(&self) -> u16 {
        let mut uqid = self.uqid.lock().unwrap();
        *uqid = (*uqid + 1) & 0xFFF;
        *uqid
    }

    /// Devices believed to hold `addr`, excluding `except`.
    fn holders(&self, addr: u64, except: Option<u8>) -> Vec<u8> {
        self.sf_device
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(cache_id, lines)| {
                Some(*cache_id as u8) != except && lines.contains(&addr)
            })
            .map(|(cache_id, _)| cache_id as u8)
            .collect()
    }

    fn sf_insert(&self, cache_id: u8, addr: u64) {
        if let Some(lines) = self.sf_device.lock().unwrap().get_mut(usize::from(cache_id)) {
            lines.insert(addr);
        }
    }

    fn sf_remove(&self, cache_id: u8, addr: u64) {
        if let Some(lines) = self.sf_device.lock().unwrap().get_mut(usize::from(cache_id)) {
            lines.remove(&addr);
        }
    }

    async fn read_memory(&self, addr: u64) -> CacheLineData {
        self.memory_producer
            .request
            .send(MemoryRequest::read(addr, 64));
        self.memory_producer
            .response
            .recv()
            .await
            .map(|response| response.data)
            .unwrap_or_default()
    }

    async fn write_memory(&self, addr: u64, data: CacheLineData) {
        self.memory_producer
            .request
            .send(MemoryRequest::write(addr, 64, data));
        let _ = self.memory_producer.response.recv().await;
    }

    fn send_h2d(&self, packet: CxlCachePacket) {
        self.downstream.host_to_target.send(packet);
    }

    /// Snoop-invalidates every holder and collects their responses.
    async fn invalidate_devices(&self, addr: u64, holders: &[u8]) {
        for &cache_id in holders {
            self.send_h2d(CxlCachePacket::h2d_req(
                H2DReqOpcode::SnpInv,
                addr,
                cache_id,
                self.next_uqid(),
            ));
        }
        for &cache_id in holders {
            let Some(rsp) = self.d2h_rsp.recv().await else {
                return;
            };
            match rsp.opcode {
                D2HRspOpcode::RspIHitI | D2HRspOpcode::RspIHitSE | D2HRspOpcode::RspIFwdM => {
                    self.sf_remove(cache_id, addr);
                }
                other => warn!("[{}] unexpected SnpInv response {other:?}", self.label),
            }
        }
    }

    /// Pulls the latest copy from the single holder. Returns the data and
    /// whether the device kept a shared copy.
    async fn snoop_read_latest(
        &self,
        addr: u64,
        cache_id: u8,
        opcode: H2DReqOpcode,
    ) -> Option<(CacheLineData, bool)> {
        self.send_h2d(CxlCachePacket::h2d_req(
            opcode,
            addr,
            cache_id,
            self.next_uqid(),
        ));
        let rsp = self.d2h_rsp.recv().await?;
        match rsp.opcode {
            D2HRspOpcode::RspSFwdM | D2HRspOpcode::RspVFwdV | D2HRspOpcode::RspVHitV => {
                let data = self.d2h_data.recv().await?;
                Some((data.data, true))
            }
            D2HRspOpcode::RspIFwdM => {
                self.sf_remove(cache_id, addr);
                let data = self.d2h_data.recv().await?;
                Some((data.data, false))
            }
            D2HRspOpcode::RspIHitI | D2HRspOpcode::RspIHitSE => {
                self.sf_remove(cache_id, addr);
                None
            }
            D2HRspOpcode::RspSHitSE => None,
        }
    }

    /// Host LLC request against the device coherency domain.
    async fn handle_host_request(&self, request: CacheRequest) {
        let addr = request.addr;
        match request.op {
            CacheRequestOp::WriteBack | CacheRequestOp::WriteBackClean => {
                self.write_memory(addr, request.data).await;
                self.upstream_cache
                    .response
                    .send(CacheResponse::new(CacheResponseStatus::Ok));
            }
            CacheRequestOp::SnpInv => {
                let holders = self.holders(addr, None);
                if !holders.is_empty() {
                    self.invalidate_devices(addr, &holders).await;
                }
                self.upstream_cache
                    .response
                    .send(CacheResponse::new(CacheResponseStatus::RspI));
            }
            CacheRequestOp::SnpData | CacheRequestOp::SnpCur => {
                let status = if request.op == CacheRequestOp::SnpData {
                    CacheResponseStatus::RspS
                } else {
                    CacheResponseStatus::RspV
                };
                let holders = self.holders(addr, None);
                let data = match holders.as_slice() {
                    [] => self.read_memory(addr).await,
                    [single] => {
                        // Exclusive or modified copy: pull the latest data.
                        let opcode = if request.op == CacheRequestOp::SnpData {
                            H2DReqOpcode::SnpData
                        } else {
                            H2DReqOpcode::SnpCur
                        };
                        match self.snoop_read_latest(addr, *single, opcode).await {
                            Some((data, _)) => data,
                            None => self.read_memory(addr).await,
                        }
                    }
                    // Shared everywhere: memory already matches.
                    _ => self.read_memory(addr).await,
                };
                self.upstream_cache
                    .response
                    .send(CacheResponse::with_data(status, data));
            }
            other => {
                warn!("[{}] unexpected host request {other:?}", self.label);
                self.upstream_cache
                    .response
                    .send(CacheResponse::new(CacheResponseStatus::Failed));
            }
        }
    }

    /// Device D2H request against the host and the other device caches.
    async fn handle_d2h_req(&self, request: D2HReq) {
        let addr = request.addr;
        let cache_id = request.cache_id;
        match request.opcode {
            D2HReqOpcode::RdOwnNoData | D2HReqOpcode::RdAny => {
                let holders = self.holders(addr, Some(cache_id));
                if !holders.is_empty() {
                    self.invalidate_devices(addr, &holders).await;
                }
                // Invalidate the host's own copy before granting ownership.
                self.upstream_snoop
                    .request
                    .send(CacheRequest::new(CacheRequestOp::SnpInv, addr));
                let _ = self.upstream_snoop.response.recv().await;

                self.send_h2d(CxlCachePacket::h2d_go(
                    cache_id,
                    H2DRspState::Exclusive,
                    request.cqid,
                ));
                self.sf_insert(cache_id, addr);
            }
            D2HReqOpcode::RdShared => {
                let holders = self.holders(addr, Some(cache_id));
                let data = if let [single] = holders.as_slice() {
                    match self
                        .snoop_read_latest(addr, *single, H2DReqOpcode::SnpData)
                        .await
                    {
                        Some((data, _)) => Some(data),
                        None => None,
                    }
                } else {
                    None
                };
                let data = match data {
                    Some(data) => data,
                    None => {
                        // Fall back to the host cache, then memory.
                        self.upstream_snoop
                            .request
                            .send(CacheRequest::new(CacheRequestOp::SnpData, addr));
                        match self.upstream_snoop.response.recv().await {
                            Some(response)
                                if response.status != CacheResponseStatus::RspMiss =>
                            {
                                response.data
                            }
                            _ => self.read_memory(addr).await,
                        }
                    }
                };
                self.send_h2d(CxlCachePacket::h2d_go(
                    cache_id,
                    H2DRspState::Shared,
                    request.cqid,
                ));
                self.send_h2d(CxlCachePacket::h2d_data(cache_id, request.cqid, data));
                self.sf_insert(cache_id, addr);
            }
            D2HReqOpcode::DirtyEvict | D2HReqOpcode::CleanEvict => {
                self.send_h2d(CxlCachePacket::h2d_go_write_pull(
                    cache_id,
                    self.next_uqid(),
                    request.cqid,
                ));
                if let Some(data) = self.d2h_data.recv().await {
                    self.write_memory(addr, data.data).await;
                }
                self.sf_remove(cache_id, addr);
            }
            D2HReqOpcode::CleanEvictNoData => {
                self.send_h2d(CxlCachePacket::h2d_go(
                    cache_id,
                    H2DRspState::Invalid,
                    request.cqid,
                ));
                self.sf_remove(cache_id, addr);
            }
        }
    }

    async fn distributor(&self) {
        while let Some(packet) = self.downstream.target_to_host.recv().await {
            match packet {
                CxlCachePacket::D2HReq(req) => self.d2h_req.send(req),
                CxlCachePacket::D2HRsp(rsp) => self.d2h_rsp.send(rsp),
                CxlCachePacket::D2HData(data) => self.d2h_data.send(data),
                other => {
                    warn!("[{}] unexpected packet {other:?}, dropped", self.label);
                }
            }
        }
        self.d2h_req.shutdown();
        self.d2h_rsp.shutdown();
        self.d2h_data.shutdown();
        debug!("[{}] distributor stopped", self.label);
    }

    async fn coherency_loop(&self) {
        loop {
            tokio::select! {
                request = self.upstream_cache.request.recv() => match request {
                    Some(request) => self.handle_host_request(request).await,
                    None => break,
                },
                req = self.d2h_req.recv() => match req {
                    Some(req) => self.handle_d2h_req(req).await,
                    None => break,
                },
            }
        }
        debug!("[{}] coherency loop stopped", self.label);
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        join!(self.distributor(), self.coherency_loop());
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.downstream.target_to_host.shutdown();
        self.upstream_cache.request.shutdown();
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
