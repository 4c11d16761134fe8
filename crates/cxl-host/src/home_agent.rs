//! Home agent: the host's CXL.mem master.
//!
//! Converts the LLC's coherency requests into M2S traffic, pairs S2M
//! responses back, and services device back-invalidation snoops by snooping
//! the host LLC and flushing the surrendered line. One request is in flight
//! at a time; host- and device-originated work alternate. Response waits are
//! bounded by the configured timeout and fail the requesting operation
//! instead of wedging the fabric.

use std::time::Duration;

use tokio::join;
use tracing::{debug, error, warn};

use cxl_protocol::fifo::{
    CacheFifoPair, CacheRequest, CacheRequestOp, CacheResponse, CacheResponseStatus, Fifo,
    FifoPair, MemoryFifoPair, MemoryRequest, MemoryRequestOp, MemoryResponse,
};
use cxl_protocol::packet::{
    CacheLineData, CxlMemPacket, M2SBIRspOpcode, M2SReqOpcode, MemMetaField, MemMetaValue,
    MemSnpType, S2MBISnp, S2MBISnpOpcode, S2MDrs, S2MNdr, S2MNdrOpcode,
};
use cxl_protocol::{ComponentError, ComponentState};

pub const DEFAULT_MEM_TIMEOUT: Duration = Duration::from_secs(3);

/// Coherency policy of the host toward its CXL memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CohPolicy {
    /// Plain memory expander use: no device-side coherency traffic.
    NonCache,
    DotCache,
    DotMemBi,
}

pub struct HomeAgentConfig {
    pub host_name: String,
    pub coh_policy: CohPolicy,
    pub mem_timeout: Duration,
    /// LLC requests into the home agent.
    pub upstream_cache: CacheFifoPair,
    /// Home-agent snoops into the host LLC (BISnp resolution).
    pub upstream_snoop: CacheFifoPair,
    /// DRAM requests from the IO bridge.
    pub memory_consumer_io: MemoryFifoPair,
    /// DRAM requests from the cache coherency bridge.
    pub memory_consumer_coh: MemoryFifoPair,
    /// Requests to the memory controller.
    pub memory_producer: MemoryFifoPair,
    pub downstream: FifoPair<CxlMemPacket>,
}

pub struct HomeAgent {
    state: ComponentState,
    coh_policy: CohPolicy,
    mem_timeout: Duration,
    upstream_cache: CacheFifoPair,
    upstream_snoop: CacheFifoPair,
    memory_consumer_io: MemoryFifoPair,
    memory_consumer_coh: MemoryFifoPair,
    memory_producer: MemoryFifoPair,
    downstream: FifoPair<CxlMemPacket>,
    s2m_ndr: Fifo<S2MNdr>,
    s2m_drs: Fifo<S2MDrs>,
    s2m_bisnp: Fifo<S2MBISnp>,
    label: String,
}

impl HomeAgent {
    pub fn new(config: HomeAgentConfig) -> Self {
        HomeAgent {
            state: ComponentState::new(),
            coh_policy: config.coh_policy,
            mem_timeout: config.mem_timeout,
            upstream_cache: config.upstream_cache,
            upstream_snoop: config.upstream_snoop,
            memory_consumer_io: config.memory_consumer_io,
            memory_consumer_coh: config.memory_consumer_coh,
            memory_producer: config.memory_producer,
            downstream: config.downstream,
            s2m_ndr: Fifo::new(),
            s2m_drs: Fifo::new(),
            s2m_bisnp: Fifo::new(),
            label: format!("{}:HomeAgent", config.host_name),
        }
    }

    fn non_cache(&self) -> bool {
        self.coh_policy == CohPolicy::NonCache
    }

    async fn write_memory(&self, addr: u64, size: usize, data: CacheLineData) {
        self.memory_producer
            .request
            .send(MemoryRequest::write(addr, size, data));
        let _ = self.memory_producer.response.recv().await;
    }

    async fn read_memory(&self, addr: u64, size: usize) -> CacheLineData {
        self.memory_producer
            .request
            .send(MemoryRequest::read(addr, size));
        self.memory_producer
            .response
            .recv()
            .await
            .map(|response| response.data)
            .unwrap_or_default()
    }

    async fn await_ndr(&self, addr: u64) -> Option<S2MNdr> {
        match tokio::time::timeout(self.mem_timeout, self.s2m_ndr.recv()).await {
            Ok(ndr) => ndr,
            Err(_) => {
                error!("[{}] CXL.mem completion for 0x{addr:x} timed out", self.label);
                None
            }
        }
    }

    async fn await_drs(&self, addr: u64) -> Option<S2MDrs> {
        match tokio::time::timeout(self.mem_timeout, self.s2m_drs.recv()).await {
            Ok(drs) => drs,
            Err(_) => {
                error!("[{}] CXL.mem data for 0x{addr:x} timed out", self.label);
                None
            }
        }
    }

    fn send_m2s(&self, packet: CxlMemPacket) {
        self.downstream.host_to_target.send(packet);
    }

    /// Converts an LLC request into M2S traffic and pairs the response.
    async fn handle_cache_request(&self, request: CacheRequest) {
        let addr = request.addr;
        match request.op {
            CacheRequestOp::Write => {
                // HDM-H normal write.
                self.send_m2s(CxlMemPacket::mem_wr(addr, request.data));
                self.upstream_cache
                    .response
                    .send(CacheResponse::new(CacheResponseStatus::Ok));
                let _ = self.await_ndr(addr).await;
            }
            CacheRequestOp::WriteBack | CacheRequestOp::WriteBackClean => {
                // HDM-DB flush write; NonCache hosts write plainly.
                let packet = if self.non_cache() {
                    CxlMemPacket::mem_wr(addr, request.data)
                } else {
                    CxlMemPacket::m2s_rwd(
                        MemMetaField::Meta0State,
                        MemMetaValue::Invalid,
                        MemSnpType::NoOp,
                        addr,
                        request.data,
                    )
                };
                self.send_m2s(packet);
                self.upstream_cache
                    .response
                    .send(CacheResponse::new(CacheResponseStatus::Ok));
                let _ = self.await_ndr(addr).await;
            }
            CacheRequestOp::UncachedWrite => {
                self.send_m2s(CxlMemPacket::mem_wr(addr, request.data));
                let _ = self.await_ndr(addr).await;
                self.upstream_cache
                    .response
                    .send(CacheResponse::new(CacheResponseStatus::Ok));
            }
            CacheRequestOp::UncachedRead | CacheRequestOp::Read => {
                // HDM-H read: data-only response.
                self.send_m2s(CxlMemPacket::mem_rd(addr));
                let response = match self.await_drs(addr).await {
                    Some(drs) => CacheResponse::with_data(CacheResponseStatus::Ok, drs.data),
                    None => CacheResponse::new(CacheResponseStatus::Failed),
                };
                self.upstream_cache.response.send(response);
            }
            CacheRequestOp::SnpData => {
                // HDM-DB shared read.
                let packet = if self.non_cache() {
                    CxlMemPacket::mem_rd(addr)
                } else {
                    CxlMemPacket::m2s_req(
                        M2SReqOpcode::MemRd,
                        MemMetaField::Meta0State,
                        MemMetaValue::Shared,
                        MemSnpType::SnpData,
                        addr,
                    )
                };
                self.send_m2s(packet);
                if self.non_cache() {
                    let response = match self.await_drs(addr).await {
                        Some(drs) => CacheResponse::with_data(CacheResponseStatus::Ok, drs.data),
                        None => CacheResponse::new(CacheResponseStatus::Failed),
                    };
                    self.upstream_cache.response.send(response);
                    return;
                }
                self.complete_with_ndr(addr).await;
            }
            CacheRequestOp::SnpInv => {
                if self.non_cache() {
                    // Never any device-side copy to invalidate. Whether a
                    // device cache could still owe forwarded data here is
                    // unresolved; see the ignored test in this crate.
                    debug_assert!(self.coh_policy == CohPolicy::NonCache);
                    self.upstream_cache
                        .response
                        .send(CacheResponse::new(CacheResponseStatus::RspI));
                    return;
                }
                self.send_m2s(CxlMemPacket::m2s_req(
                    M2SReqOpcode::MemInv,
                    MemMetaField::Meta0State,
                    MemMetaValue::Any,
                    MemSnpType::SnpInv,
                    addr,
                ));
                self.complete_with_ndr(addr).await;
            }
            CacheRequestOp::SnpCur => {
                self.send_m2s(CxlMemPacket::m2s_req(
                    M2SReqOpcode::MemRd,
                    MemMetaField::Meta0State,
                    MemMetaValue::Invalid,
                    MemSnpType::SnpCur,
                    addr,
                ));
                self.complete_with_ndr(addr).await;
            }
        }
    }

    /// Pairs an NDR (and its DRS when data rides along) back to the LLC.
    async fn complete_with_ndr(&self, addr: u64) {
        let Some(ndr) = self.await_ndr(addr).await else {
            self.upstream_cache
                .response
                .send(CacheResponse::new(CacheResponseStatus::Failed));
            return;
        };
        let status = match ndr.opcode {
            S2MNdrOpcode::CmpS => CacheResponseStatus::RspS,
            S2MNdrOpcode::CmpE => CacheResponseStatus::RspI,
            S2MNdrOpcode::Cmp => CacheResponseStatus::RspV,
            S2MNdrOpcode::CmpM => {
                warn!("[{}] unexpected Cmp-M", self.label);
                CacheResponseStatus::Failed
            }
        };
        let response = if ndr.meta_value == MemMetaValue::Any {
            match self.await_drs(addr).await {
                Some(drs) => CacheResponse::with_data(status, drs.data),
                None => CacheResponse::new(CacheResponseStatus::Failed),
            }
        } else {
            CacheResponse::new(status)
        };
        self.upstream_cache.response.send(response);
    }

    /// Services a device back-invalidation: snoop the host LLC, flush the
    /// surrendered line, answer with the host's state.
    async fn handle_bisnp(&self, snp: S2MBISnp) {
        let snoop_op = match snp.opcode {
            S2MBISnpOpcode::BISnpData => CacheRequestOp::SnpData,
            S2MBISnpOpcode::BISnpInv => CacheRequestOp::SnpInv,
            S2MBISnpOpcode::BISnpCur => CacheRequestOp::SnpCur,
        };
        self.upstream_snoop
            .request
            .send(CacheRequest::new(snoop_op, snp.addr));
        let response = self
            .upstream_snoop
            .response
            .recv()
            .await
            .unwrap_or(CacheResponse::new(CacheResponseStatus::RspMiss));

        if response.status == CacheResponseStatus::RspMiss {
            // The line crossed us on its way back to the device.
            self.send_m2s(CxlMemPacket::bi_rsp(
                M2SBIRspOpcode::BIRspI,
                snp.bi_id,
                snp.bi_tag,
            ));
            return;
        }

        let keeps_shared = response.status == CacheResponseStatus::RspS;
        // Flush what the host cache surrendered; a retained shared copy
        // stays visible to the device's snoop filter.
        let meta_value = if keeps_shared {
            MemMetaValue::Shared
        } else {
            MemMetaValue::Invalid
        };
        self.send_m2s(CxlMemPacket::m2s_rwd(
            MemMetaField::Meta0State,
            meta_value,
            MemSnpType::NoOp,
            snp.addr,
            response.data,
        ));
        let _ = self.await_ndr(snp.addr).await;

        let opcode = if keeps_shared {
            M2SBIRspOpcode::BIRspS
        } else {
            M2SBIRspOpcode::BIRspI
        };
        self.send_m2s(CxlMemPacket::bi_rsp(opcode, snp.bi_id, snp.bi_tag));
    }

    async fn serve_memory_consumer(&self, consumer: &MemoryFifoPair, what: &str) {
        while let Some(request) = consumer.request.recv().await {
            let response = match request.op {
                MemoryRequestOp::Write | MemoryRequestOp::UncachedWrite => {
                    self.write_memory(request.addr, request.size, request.data)
                        .await;
                    MemoryResponse::ok()
                }
                MemoryRequestOp::Read | MemoryRequestOp::UncachedRead => {
                    let data = self.read_memory(request.addr, request.size).await;
                    MemoryResponse::ok_with_data(data)
                }
            };
            consumer.response.send(response);
        }
        debug!("[{}] {what} memory consumer stopped", self.label);
    }

    async fn distributor(&self) {
        while let Some(packet) = self.downstream.target_to_host.recv().await {
            match packet {
                CxlMemPacket::S2MNdr(ndr) => self.s2m_ndr.send(ndr),
                CxlMemPacket::S2MDrs(drs) => self.s2m_drs.send(drs),
                CxlMemPacket::S2MBISnp(snp) => self.s2m_bisnp.send(snp),
                other => {
                    warn!("[{}] unexpected packet {other:?}, dropped", self.label);
                }
            }
        }
        self.s2m_ndr.shutdown();
        self.s2m_drs.shutdown();
        self.s2m_bisnp.shutdown();
        debug!("[{}] distributor stopped", self.label);
    }

    async fn coherency_loop(&self) {
        loop {
            tokio::select! {
                request = self.upstream_cache.request.recv() => match request {
                    Some(request) => self.handle_cache_request(request).await,
                    None => break,
                },
                snp = self.s2m_bisnp.recv() => match snp {
                    Some(snp) => self.handle_bisnp(snp).await,
                    None => break,
                },
            }
        }
        debug!("[{}] coherency loop stopped", self.label);
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        join!(
            self.distributor(),
            self.coherency_loop(),
            self.serve_memory_consumer(&self.memory_consumer_io, "IO bridge"),
            self.serve_memory_consumer(&self.memory_consumer_coh, "coherency bridge")
        );
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.downstream.target_to_host.shutdown();
        self.upstream_cache.request.shutdown();
        self.memory_consumer_io.request.shutdown();
        self.memory_consumer_coh.request.shutdown();
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
    use std::sync::Arc;

    fn harness(policy: CohPolicy) -> (Arc<HomeAgent>, CacheFifoPair, FifoPair<CxlMemPacket>) {
        let upstream_cache = CacheFifoPair::new();
        let downstream = FifoPair::new();
        let agent = Arc::new(HomeAgent::new(HomeAgentConfig {
            host_name: "host0".into(),
            coh_policy: policy,
            mem_timeout: Duration::from_millis(200),
            upstream_cache: upstream_cache.clone(),
            upstream_snoop: CacheFifoPair::new(),
            memory_consumer_io: MemoryFifoPair::new(),
            memory_consumer_coh: MemoryFifoPair::new(),
            memory_producer: MemoryFifoPair::new(),
            downstream: downstream.clone(),
        }));
        (agent, upstream_cache, downstream)
    }

    #[tokio::test]
    async fn hdm_db_shared_read_round_trip() {
        let (agent, cache, downstream) = harness(CohPolicy::DotMemBi);
        let runner = agent.clone();
        let task = tokio::spawn(async move { runner.run().await });
        agent.wait_for_ready().await;

        cache
            .request
            .send(CacheRequest::new(CacheRequestOp::SnpData, 0x1_0000_0000));
        let m2s = downstream.host_to_target.recv().await.unwrap();
        match m2s {
            CxlMemPacket::M2SReq(req) => {
                assert_eq!(req.opcode, M2SReqOpcode::MemRd);
                assert_eq!(req.meta_value, MemMetaValue::Shared);
                assert_eq!(req.snp_type, MemSnpType::SnpData);
            }
            other => panic!("expected M2SReq, got {other:?}"),
        }

        // Device completes Cmp-S with data.
        downstream.target_to_host.send(CxlMemPacket::ndr(
            S2MNdrOpcode::CmpS,
            MemMetaField::Meta0State,
            MemMetaValue::Any,
        ));
        downstream.target_to_host.send(CxlMemPacket::drs(
            CacheLineData::from_u64(0xFEED),
            MemMetaField::NoOp,
            MemMetaValue::Any,
        ));

        let response = cache.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspS);
        assert_eq!(response.data.as_u64(), 0xFEED);

        agent.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn missing_response_times_out_instead_of_deadlocking() {
        let (agent, cache, downstream) = harness(CohPolicy::DotMemBi);
        let runner = agent.clone();
        let task = tokio::spawn(async move { runner.run().await });
        agent.wait_for_ready().await;

        cache
            .request
            .send(CacheRequest::new(CacheRequestOp::SnpData, 0x1_0000_0000));
        // Nothing answers.
        let _ = downstream.host_to_target.recv().await;
        let response = cache.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::Failed);

        agent.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn non_cache_policy_short_circuits_snpinv() {
        let (agent, cache, _downstream) = harness(CohPolicy::NonCache);
        let runner = agent.clone();
        let task = tokio::spawn(async move { runner.run().await });
        agent.wait_for_ready().await;

        cache
            .request
            .send(CacheRequest::new(CacheRequestOp::SnpInv, 0x1_0000_0000));
        let response = cache.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspI);

        agent.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    /// Whether the NonCache short-circuit is correct when a device cache is
    /// expected to forward data is an open question in the source material;
    /// this records the unresolved case rather than guessing.
    #[tokio::test]
    #[ignore = "unresolved: NonCache SnpInv with a device cache holding forwardable data"]
    async fn non_cache_snpinv_with_device_forwarded_data() {
        let (agent, cache, downstream) = harness(CohPolicy::NonCache);
        let runner = agent.clone();
        let task = tokio::spawn(async move { runner.run().await });
        agent.wait_for_ready().await;

        cache
            .request
            .send(CacheRequest::new(CacheRequestOp::SnpInv, 0x1_0000_0000));
        // A device holding the line modified would have data to forward; the
        // short-circuit answers RspI without ever asking.
        let response = cache.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspM, "would need device data");

        drop(downstream);
        agent.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
