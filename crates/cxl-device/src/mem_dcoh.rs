//! CXL.mem device coherency engine.
//!
//! Serves M2S traffic as the memory target and, when the device has a local
//! cache, keeps it coherent with the host through the snoop filter and the
//! back-invalidation channel. Host-originated requests are handled on their
//! own plane and do not block the device's in-flight request; both planes
//! update the snoop filter and device memory atomically from the LLC's
//! viewpoint.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tokio::join;
use tracing::{debug, warn};

use cxl_protocol::fifo::{
    CacheFifoPair, CacheRequestOp, CacheResponse, CacheResponseStatus, Fifo, FifoPair,
};
use cxl_protocol::packet::{
    CacheLineData, CxlMemPacket, M2SBIRsp, M2SBIRspOpcode, M2SReq, M2SReqOpcode, M2SRwD,
    MemMetaField, MemMetaValue, MemSnpType, S2MBISnpOpcode, S2MNdrOpcode,
};
use cxl_protocol::{ComponentError, ComponentState};

use crate::memory_device::CxlMemoryDeviceComponent;

/// FIFO pair bundle linking the DCOH to the device LLC.
pub struct DcohLlcLink {
    /// Device cache requests into the DCOH.
    pub requests_in: CacheFifoPair,
    /// DCOH snoops into the device cache.
    pub snoops_out: CacheFifoPair,
}

pub struct CxlMemDcoh {
    state: ComponentState,
    llc: Option<DcohLlcLink>,
    upstream: FifoPair<CxlMemPacket>,
    mem: Arc<CxlMemoryDeviceComponent>,
    sf_host: Mutex<HashSet<u64>>,
    bi_id: u8,
    bi_tag: Mutex<u16>,
    m2s_req: Fifo<M2SReq>,
    m2s_rwd: Fifo<M2SRwD>,
    m2s_birsp: Fifo<M2SBIRsp>,
    label: String,
}

impl CxlMemDcoh {
    pub fn new(
        llc: Option<DcohLlcLink>,
        upstream: FifoPair<CxlMemPacket>,
        mem: Arc<CxlMemoryDeviceComponent>,
        device_id: u8,
        label: impl Into<String>,
    ) -> Self {
        CxlMemDcoh {
            state: ComponentState::new(),
            llc,
            upstream,
            mem,
            sf_host: Mutex::new(HashSet::new()),
            bi_id: device_id,
            bi_tag: Mutex::new(0),
            m2s_req: Fifo::new(),
            m2s_rwd: Fifo::new(),
            m2s_birsp: Fifo::new(),
            label: label.into(),
        }
    }

    fn next_bi_tag(&self) -> u16 {
        let mut tag = self.bi_tag.lock().unwrap();
        *tag = (*tag + 1) & 0xFFF;
        *tag
    }

    fn sf_host_contains(&self, dpa: u64) -> bool {
        self.sf_host.lock().unwrap().contains(&dpa)
    }

    fn sf_host_insert(&self, dpa: u64) {
        self.sf_host.lock().unwrap().insert(dpa);
    }

    fn sf_host_remove(&self, dpa: u64) {
        self.sf_host.lock().unwrap().remove(&dpa);
    }

    /// Snoops the device cache, or reports a miss when there is none.
    async fn snoop_device_cache(&self, op: CacheRequestOp, dpa: u64) -> CacheResponse {
        let Some(llc) = &self.llc else {
            return CacheResponse::new(CacheResponseStatus::RspMiss);
        };
        llc.snoops_out
            .request
            .send(cxl_protocol::fifo::CacheRequest::new(op, dpa));
        llc.snoops_out
            .response
            .recv()
            .await
            .unwrap_or(CacheResponse::new(CacheResponseStatus::RspMiss))
    }

    fn send_ndr(&self, opcode: S2MNdrOpcode, meta_field: MemMetaField, meta_value: MemMetaValue) {
        self.upstream
            .target_to_host
            .send(CxlMemPacket::ndr(opcode, meta_field, meta_value));
    }

    fn send_drs(&self, data: CacheLineData, meta_value: MemMetaValue) {
        self.upstream
            .target_to_host
            .send(CxlMemPacket::drs(data, MemMetaField::NoOp, meta_value));
    }

    async fn handle_m2s_req(&self, req: M2SReq) {
        let Some(dpa) = self.mem.get_dpa(req.addr) else {
            warn!("[{}:MemDcoh] undecodable HPA 0x{:x}, dropped", self.label, req.addr);
            return;
        };

        // HDM-H fast path: no coherence metadata, plain read.
        if req.meta_field == MemMetaField::NoOp {
            let data = self.mem.read_mem_dpa(dpa);
            self.send_drs(data, MemMetaValue::Invalid);
            return;
        }

        let data_read = matches!(req.opcode, M2SReqOpcode::MemRd | M2SReqOpcode::MemRdData);
        let snoop_op = match req.snp_type {
            MemSnpType::SnpData => CacheRequestOp::SnpData,
            MemSnpType::SnpInv => CacheRequestOp::SnpInv,
            MemSnpType::SnpCur => CacheRequestOp::SnpCur,
            MemSnpType::NoOp => {
                // Metadata update with no snoop: complete without touching
                // the device cache.
                let data = self.mem.read_mem_dpa(dpa);
                let opcode = if req.meta_value == MemMetaValue::Any {
                    self.sf_host_insert(dpa);
                    S2MNdrOpcode::CmpE
                } else {
                    S2MNdrOpcode::Cmp
                };
                // The NDR's meta value doubles as the data-follows marker.
                if data_read {
                    self.send_ndr(opcode, req.meta_field, MemMetaValue::Any);
                    self.send_drs(data, MemMetaValue::Any);
                } else {
                    self.send_ndr(opcode, req.meta_field, MemMetaValue::Invalid);
                }
                return;
            }
        };

        let response = self.snoop_device_cache(snoop_op, dpa).await;

        let mut rsp_code = S2MNdrOpcode::Cmp;
        let mut sf_insert = false;
        let mut data_flush = false;
        let mut data = CacheLineData::zeroed();

        match response.status {
            CacheResponseStatus::RspMiss => {
                match req.snp_type {
                    MemSnpType::SnpData => {
                        rsp_code = S2MNdrOpcode::CmpE;
                        sf_insert = true;
                    }
                    MemSnpType::SnpInv => {
                        if req.meta_value == MemMetaValue::Any {
                            rsp_code = S2MNdrOpcode::CmpE;
                            sf_insert = true;
                        }
                    }
                    _ => {}
                }
                if data_read {
                    data = self.mem.read_mem_dpa(dpa);
                }
            }
            CacheResponseStatus::RspS => {
                rsp_code = S2MNdrOpcode::CmpS;
                sf_insert = true;
                data = response.data;
            }
            CacheResponseStatus::RspI => {
                if req.meta_value == MemMetaValue::Any {
                    rsp_code = S2MNdrOpcode::CmpE;
                    sf_insert = true;
                } else if req.opcode == M2SReqOpcode::MemRd {
                    // Host is giving the line up; the dirty copy the device
                    // cache surrendered lands in device memory.
                    data_flush = true;
                }
                data = response.data;
            }
            CacheResponseStatus::RspV => {
                data = response.data;
            }
            other => {
                warn!("[{}:MemDcoh] unexpected snoop response {other:?}", self.label);
                return;
            }
        }

        if sf_insert {
            self.sf_host_insert(dpa);
        }
        if data_flush {
            self.mem.write_mem_dpa(dpa, &data);
        }

        if data_read {
            self.send_ndr(rsp_code, req.meta_field, MemMetaValue::Any);
            self.send_drs(data, MemMetaValue::Any);
        } else {
            self.send_ndr(rsp_code, req.meta_field, MemMetaValue::Invalid);
        }
    }

    async fn handle_m2s_rwd(&self, rwd: M2SRwD) {
        let Some(dpa) = self.mem.get_dpa(rwd.addr) else {
            warn!("[{}:MemDcoh] undecodable HPA 0x{:x}, dropped", self.label, rwd.addr);
            return;
        };

        // HDM-H fast path.
        if rwd.meta_field == MemMetaField::NoOp {
            self.mem.write_mem_dpa(dpa, &rwd.data);
            self.send_ndr(S2MNdrOpcode::Cmp, MemMetaField::NoOp, MemMetaValue::Invalid);
            return;
        }

        let snoop_op = match rwd.meta_value {
            MemMetaValue::Shared => CacheRequestOp::SnpData,
            MemMetaValue::Any | MemMetaValue::Invalid => CacheRequestOp::SnpInv,
        };
        if rwd.meta_value == MemMetaValue::Invalid {
            // Flush write: the host no longer holds the line.
            self.sf_host_remove(dpa);
        }
        let _ = self.snoop_device_cache(snoop_op, dpa).await;

        self.mem.write_mem_dpa(dpa, &rwd.data);
        self.send_ndr(S2MNdrOpcode::Cmp, MemMetaField::NoOp, MemMetaValue::Invalid);
    }

    /// Host plane: M2S requests and writes, handled as they arrive.
    async fn host_plane(&self) {
        loop {
            tokio::select! {
                req = self.m2s_req.recv() => match req {
                    Some(req) => self.handle_m2s_req(req).await,
                    None => break,
                },
                rwd = self.m2s_rwd.recv() => match rwd {
                    Some(rwd) => self.handle_m2s_rwd(rwd).await,
                    None => break,
                },
            }
        }
        debug!("[{}:MemDcoh] host plane stopped", self.label);
    }

    /// Device plane: one local cache request at a time.
    async fn device_plane(&self) {
        let Some(llc) = &self.llc else {
            return;
        };
        while let Some(request) = llc.requests_in.request.recv().await {
            let dpa = request.addr;
            match request.op {
                CacheRequestOp::Read | CacheRequestOp::UncachedRead => {
                    let data = self.mem.read_mem_dpa(dpa);
                    llc.requests_in
                        .response
                        .send(CacheResponse::with_data(CacheResponseStatus::Ok, data));
                }
                CacheRequestOp::Write
                | CacheRequestOp::WriteBack
                | CacheRequestOp::WriteBackClean
                | CacheRequestOp::UncachedWrite => {
                    self.mem.write_mem_dpa(dpa, &request.data);
                    llc.requests_in
                        .response
                        .send(CacheResponse::new(CacheResponseStatus::Ok));
                }
                CacheRequestOp::SnpData | CacheRequestOp::SnpInv | CacheRequestOp::SnpCur => {
                    if !self.sf_host_contains(dpa) {
                        let response = match request.op {
                            CacheRequestOp::SnpData => CacheResponse::with_data(
                                CacheResponseStatus::RspI,
                                self.mem.read_mem_dpa(dpa),
                            ),
                            CacheRequestOp::SnpInv => {
                                CacheResponse::new(CacheResponseStatus::RspI)
                            }
                            _ => CacheResponse::new(CacheResponseStatus::RspV),
                        };
                        llc.requests_in.response.send(response);
                        continue;
                    }

                    // The host may hold the line: back-invalidate.
                    let bi_opcode = match request.op {
                        CacheRequestOp::SnpData => S2MBISnpOpcode::BISnpData,
                        CacheRequestOp::SnpInv => {
                            self.sf_host_remove(dpa);
                            S2MBISnpOpcode::BISnpInv
                        }
                        _ => S2MBISnpOpcode::BISnpCur,
                    };
                    let Some(hpa) = self.mem.get_hpa(dpa) else {
                        warn!("[{}:MemDcoh] DPA 0x{dpa:x} has no HPA mapping", self.label);
                        llc.requests_in
                            .response
                            .send(CacheResponse::new(CacheResponseStatus::Failed));
                        continue;
                    };
                    self.upstream.target_to_host.send(CxlMemPacket::bi_snp(
                        bi_opcode,
                        hpa,
                        self.bi_id,
                        self.next_bi_tag(),
                    ));

                    let Some(birsp) = self.m2s_birsp.recv().await else {
                        break;
                    };
                    let data = self.mem.read_mem_dpa(dpa);
                    let status = match birsp.opcode {
                        M2SBIRspOpcode::BIRspS => CacheResponseStatus::RspS,
                        M2SBIRspOpcode::BIRspI => CacheResponseStatus::RspI,
                    };
                    llc.requests_in
                        .response
                        .send(CacheResponse::with_data(status, data));
                }
            }
        }
        debug!("[{}:MemDcoh] device plane stopped", self.label);
    }

    /// Distributes inbound M2S packets to their channels.
    async fn distributor(&self) {
        while let Some(packet) = self.upstream.host_to_target.recv().await {
            match packet {
                CxlMemPacket::M2SReq(req) => self.m2s_req.send(req),
                CxlMemPacket::M2SRwD(rwd) => self.m2s_rwd.send(rwd),
                CxlMemPacket::M2SBIRsp(birsp) => self.m2s_birsp.send(birsp),
                other => {
                    warn!("[{}:MemDcoh] unexpected packet {other:?}, dropped", self.label);
                }
            }
        }
        self.m2s_req.shutdown();
        self.m2s_rwd.shutdown();
        self.m2s_birsp.shutdown();
        debug!("[{}:MemDcoh] distributor stopped", self.label);
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        join!(self.distributor(), self.host_plane(), self.device_plane());
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.upstream.host_to_target.shutdown();
        if let Some(llc) = &self.llc {
            llc.requests_in.request.shutdown();
        }
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
    use crate::memory_device::{MemoryDeviceIdentity, SIZE_256MB};
    use cxl_cache::accessor::MemoryAccessor;
    use cxl_protocol::fifo::CacheRequest;
    use cxl_regs::hdm::HdmDecoderConfig;

    fn component() -> Arc<CxlMemoryDeviceComponent> {
        let component = CxlMemoryDeviceComponent::new(
            MemoryDeviceIdentity::new("EMU 1.0", SIZE_256MB),
            4,
            MemoryAccessor::anonymous(0x10_0000),
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
        component
    }

    #[tokio::test]
    async fn hdm_h_read_write_round_trip() {
        let upstream = FifoPair::new();
        let dcoh = Arc::new(CxlMemDcoh::new(None, upstream.clone(), component(), 0, "mem0"));
        let runner = dcoh.clone();
        let task = tokio::spawn(async move { runner.run().await });
        dcoh.wait_for_ready().await;

        upstream
            .host_to_target
            .send(CxlMemPacket::mem_wr(0x1_0000_0040, CacheLineData::from_u64(0x1234)));
        let ndr = upstream.target_to_host.recv().await.unwrap();
        assert!(matches!(ndr, CxlMemPacket::S2MNdr(n) if n.opcode == S2MNdrOpcode::Cmp));

        upstream.host_to_target.send(CxlMemPacket::mem_rd(0x1_0000_0040));
        let drs = upstream.target_to_host.recv().await.unwrap();
        match drs {
            CxlMemPacket::S2MDrs(drs) => assert_eq!(drs.data.as_u64(), 0x1234),
            other => panic!("expected DRS, got {other:?}"),
        }

        dcoh.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn coherent_read_miss_grants_exclusive_and_tracks_the_host() {
        let upstream = FifoPair::new();
        let dcoh = Arc::new(CxlMemDcoh::new(None, upstream.clone(), component(), 0, "mem0"));
        let runner = dcoh.clone();
        let task = tokio::spawn(async move { runner.run().await });
        dcoh.wait_for_ready().await;

        // HDM-DB shared read against a device with no cache: miss, Cmp-E.
        upstream.host_to_target.send(CxlMemPacket::m2s_req(
            M2SReqOpcode::MemRd,
            MemMetaField::Meta0State,
            MemMetaValue::Shared,
            MemSnpType::SnpData,
            0x1_0000_0080,
        ));
        let ndr = upstream.target_to_host.recv().await.unwrap();
        assert!(matches!(ndr, CxlMemPacket::S2MNdr(n) if n.opcode == S2MNdrOpcode::CmpE));
        let drs = upstream.target_to_host.recv().await.unwrap();
        assert!(matches!(drs, CxlMemPacket::S2MDrs(_)));
        assert!(dcoh.sf_host_contains(0x80));

        dcoh.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn device_snoop_of_host_held_line_raises_bisnp() {
        let upstream = FifoPair::new();
        let llc = DcohLlcLink {
            requests_in: CacheFifoPair::new(),
            snoops_out: CacheFifoPair::new(),
        };
        let requests_in = llc.requests_in.clone();
        let dcoh = Arc::new(CxlMemDcoh::new(Some(llc), upstream.clone(), component(), 2, "mem0"));
        dcoh.sf_host_insert(0x40);

        let runner = dcoh.clone();
        let task = tokio::spawn(async move { runner.run().await });
        dcoh.wait_for_ready().await;

        // The device cache wants the line the host holds.
        requests_in
            .request
            .send(CacheRequest::new(CacheRequestOp::SnpData, 0x40));
        let bisnp = upstream.target_to_host.recv().await.unwrap();
        match bisnp {
            CxlMemPacket::S2MBISnp(snp) => {
                assert_eq!(snp.opcode, S2MBISnpOpcode::BISnpData);
                assert_eq!(snp.addr, 0x1_0000_0040);
                assert_eq!(snp.bi_id, 2);
                // Host answers: it keeps a shared copy.
                upstream
                    .host_to_target
                    .send(CxlMemPacket::bi_rsp(M2SBIRspOpcode::BIRspS, snp.bi_id, snp.bi_tag));
            }
            other => panic!("expected BISnp, got {other:?}"),
        }
        let response = requests_in.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspS);

        dcoh.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
