//! CXL.cache device coherency engine.
//!
//! Drives the device LLC's requests for host memory onto the D2H channels
//! (`SnpData -> RdShared`, `SnpInv -> RdOwnNoData`, `WriteBack -> DirtyEvict`)
//! and completes them from the matching H2D responses. Inbound H2D snoops
//! are applied to the device LLC and answered with the D2H response set.
//! While a DirtyEvict waits for its write pull, inbound snoops keep being
//! served; a snoop-invalidate that crosses the in-flight writeback of the
//! same line answers `RspIHitI` and the writeback proceeds.

use std::sync::Mutex;

use tokio::join;
use tracing::{debug, warn};

use cxl_protocol::fifo::{
    CacheRequest, CacheRequestOp, CacheResponse, CacheResponseStatus, Fifo, FifoPair,
};
use cxl_protocol::packet::{
    CxlCachePacket, D2HReqOpcode, D2HRspOpcode, H2DData, H2DReq, H2DReqOpcode, H2DRsp,
    H2DRspOpcode, H2DRspState,
};
use cxl_protocol::{ComponentError, ComponentState};

use crate::mem_dcoh::DcohLlcLink;

pub struct CxlCacheDcoh {
    state: ComponentState,
    llc: DcohLlcLink,
    upstream: FifoPair<CxlCachePacket>,
    cache_id: u8,
    cqid: Mutex<u16>,
    h2d_req: Fifo<H2DReq>,
    h2d_rsp: Fifo<H2DRsp>,
    h2d_data: Fifo<H2DData>,
    label: String,
}

impl CxlCacheDcoh {
    pub fn new(
        llc: DcohLlcLink,
        upstream: FifoPair<CxlCachePacket>,
        cache_id: u8,
        label: impl Into<String>,
    ) -> Self {
        CxlCacheDcoh {
            state: ComponentState::new(),
            llc,
            upstream,
            cache_id,
            cqid: Mutex::new(0),
            h2d_req: Fifo::new(),
            h2d_rsp: Fifo::new(),
            h2d_data: Fifo::new(),
            label: label.into(),
        }
    }

    fn next_cqid(&self) -> u16 {
        let mut cqid = self.cqid.lock().unwrap();
        *cqid = (*cqid + 1) & 0xFFF;
        *cqid
    }

    /// Applies an inbound H2D snoop to the device LLC and answers it.
    async fn handle_h2d_req(&self, req: H2DReq) {
        let snoop_op = match req.opcode {
            H2DReqOpcode::SnpData => CacheRequestOp::SnpData,
            H2DReqOpcode::SnpInv => CacheRequestOp::SnpInv,
            H2DReqOpcode::SnpCur => CacheRequestOp::SnpCur,
        };
        self.llc
            .snoops_out
            .request
            .send(CacheRequest::new(snoop_op, req.addr));
        let Some(response) = self.llc.snoops_out.response.recv().await else {
            return;
        };

        let (opcode, data) = match (response.status, req.opcode) {
            (CacheResponseStatus::RspMiss, _) => (D2HRspOpcode::RspIHitI, None),
            (CacheResponseStatus::RspI, H2DReqOpcode::SnpInv) => (D2HRspOpcode::RspIHitSE, None),
            (CacheResponseStatus::RspI, _) => (D2HRspOpcode::RspIFwdM, Some(response.data)),
            (CacheResponseStatus::RspS, _) => (D2HRspOpcode::RspSFwdM, Some(response.data)),
            (CacheResponseStatus::RspV, _) => (D2HRspOpcode::RspVHitV, Some(response.data)),
            (status, _) => {
                warn!("[{}:CacheDcoh] unexpected snoop result {status:?}", self.label);
                (D2HRspOpcode::RspIHitI, None)
            }
        };
        self.upstream
            .target_to_host
            .send(CxlCachePacket::d2h_rsp(opcode, req.uqid));
        if let Some(data) = data {
            self.upstream
                .target_to_host
                .send(CxlCachePacket::d2h_data(req.uqid, data));
        }
    }

    /// Runs one device LLC request to completion, servicing crossing H2D
    /// requests while waiting.
    async fn handle_device_request(&self, request: CacheRequest) {
        let opcode = match request.op {
            CacheRequestOp::SnpData => D2HReqOpcode::RdShared,
            CacheRequestOp::SnpInv => D2HReqOpcode::RdOwnNoData,
            CacheRequestOp::WriteBack => D2HReqOpcode::DirtyEvict,
            CacheRequestOp::WriteBackClean => D2HReqOpcode::CleanEvict,
            other => {
                warn!(
                    "[{}:CacheDcoh] unsupported device request {other:?}",
                    self.label
                );
                self.llc
                    .requests_in
                    .response
                    .send(CacheResponse::new(CacheResponseStatus::Failed));
                return;
            }
        };
        let cqid = self.next_cqid();
        self.upstream.target_to_host.send(CxlCachePacket::d2h_req(
            opcode,
            request.addr,
            self.cache_id,
            cqid,
        ));

        loop {
            tokio::select! {
                rsp = self.h2d_rsp.recv() => {
                    let Some(rsp) = rsp else { return };
                    if self.complete_device_request(&request, rsp).await {
                        return;
                    }
                }
                crossing = self.h2d_req.recv() => {
                    let Some(crossing) = crossing else { return };
                    let is_writeback = matches!(
                        request.op,
                        CacheRequestOp::WriteBack | CacheRequestOp::WriteBackClean
                    );
                    if crossing.addr == request.addr
                        && is_writeback
                        && crossing.opcode == H2DReqOpcode::SnpInv
                    {
                        // The host's invalidation crossed our writeback of
                        // the same line: the line is already on its way out.
                        debug!(
                            "[{}:CacheDcoh] SnpInv crossed writeback of 0x{:x}",
                            self.label, request.addr
                        );
                        self.upstream
                            .target_to_host
                            .send(CxlCachePacket::d2h_rsp(D2HRspOpcode::RspIHitI, crossing.uqid));
                    } else {
                        self.handle_h2d_req(crossing).await;
                    }
                }
            }
        }
    }

    /// Finishes the in-flight device request with an H2D response. Returns
    /// `true` when the request is complete.
    async fn complete_device_request(&self, request: &CacheRequest, rsp: H2DRsp) -> bool {
        match rsp.opcode {
            H2DRspOpcode::GoWritePull => {
                // The host pulls the dirty line; hand it over and finish.
                self.upstream
                    .target_to_host
                    .send(CxlCachePacket::d2h_data(rsp.uqid, request.data));
                self.llc
                    .requests_in
                    .response
                    .send(CacheResponse::new(CacheResponseStatus::Ok));
                true
            }
            H2DRspOpcode::Go => match rsp.state {
                H2DRspState::Exclusive => {
                    self.llc
                        .requests_in
                        .response
                        .send(CacheResponse::new(CacheResponseStatus::RspI));
                    true
                }
                H2DRspState::Shared => {
                    let Some(data) = self.h2d_data.recv().await else {
                        return true;
                    };
                    self.llc
                        .requests_in
                        .response
                        .send(CacheResponse::with_data(CacheResponseStatus::RspS, data.data));
                    true
                }
                H2DRspState::Invalid => {
                    warn!("[{}:CacheDcoh] Go/Invalid has no local action", self.label);
                    true
                }
            },
        }
    }

    async fn device_plane(&self) {
        loop {
            tokio::select! {
                request = self.llc.requests_in.request.recv() => match request {
                    Some(request) => self.handle_device_request(request).await,
                    None => break,
                },
                req = self.h2d_req.recv() => match req {
                    Some(req) => self.handle_h2d_req(req).await,
                    None => break,
                },
            }
        }
        debug!("[{}:CacheDcoh] device plane stopped", self.label);
    }

    async fn distributor(&self) {
        while let Some(packet) = self.upstream.host_to_target.recv().await {
            match packet {
                CxlCachePacket::H2DReq(req) => self.h2d_req.send(req),
                CxlCachePacket::H2DRsp(rsp) => self.h2d_rsp.send(rsp),
                CxlCachePacket::H2DData(data) => self.h2d_data.send(data),
                other => {
                    warn!("[{}:CacheDcoh] unexpected packet {other:?}, dropped", self.label);
                }
            }
        }
        self.h2d_req.shutdown();
        self.h2d_rsp.shutdown();
        self.h2d_data.shutdown();
        debug!("[{}:CacheDcoh] distributor stopped", self.label);
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        join!(self.distributor(), self.device_plane());
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.upstream.host_to_target.shutdown();
        self.llc.requests_in.request.shutdown();
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
    use cxl_protocol::fifo::CacheFifoPair;
    use cxl_protocol::packet::CacheLineData;
    use std::sync::Arc;

    struct Harness {
        dcoh: Arc<CxlCacheDcoh>,
        upstream: FifoPair<CxlCachePacket>,
        requests_in: CacheFifoPair,
        snoops_out: CacheFifoPair,
    }

    fn harness() -> Harness {
        let upstream = FifoPair::new();
        let requests_in = CacheFifoPair::new();
        let snoops_out = CacheFifoPair::new();
        let dcoh = Arc::new(CxlCacheDcoh::new(
            DcohLlcLink {
                requests_in: requests_in.clone(),
                snoops_out: snoops_out.clone(),
            },
            upstream.clone(),
            0,
            "accel0",
        ));
        Harness {
            dcoh,
            upstream,
            requests_in,
            snoops_out,
        }
    }

    #[tokio::test]
    async fn shared_read_completes_with_pulled_data() {
        let h = harness();
        let runner = h.dcoh.clone();
        let task = tokio::spawn(async move { runner.run().await });
        h.dcoh.wait_for_ready().await;

        h.requests_in
            .request
            .send(CacheRequest::new(CacheRequestOp::SnpData, 0x40));
        let d2h = h.upstream.target_to_host.recv().await.unwrap();
        let cqid = match d2h {
            CxlCachePacket::D2HReq(req) => {
                assert_eq!(req.opcode, D2HReqOpcode::RdShared);
                req.cqid
            }
            other => panic!("expected D2HReq, got {other:?}"),
        };

        h.upstream
            .host_to_target
            .send(CxlCachePacket::h2d_go(0, H2DRspState::Shared, cqid));
        h.upstream
            .host_to_target
            .send(CxlCachePacket::h2d_data(0, cqid, CacheLineData::from_u64(0xAA)));

        let response = h.requests_in.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspS);
        assert_eq!(response.data.as_u64(), 0xAA);

        h.dcoh.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn crossing_snpinv_during_writeback_answers_rspihiti() {
        let h = harness();
        let runner = h.dcoh.clone();
        let task = tokio::spawn(async move { runner.run().await });
        h.dcoh.wait_for_ready().await;

        // Device starts evicting a dirty line.
        h.requests_in.request.send(CacheRequest::with_data(
            CacheRequestOp::WriteBack,
            0x80,
            CacheLineData::from_u64(0xBEEF),
        ));
        let d2h = h.upstream.target_to_host.recv().await.unwrap();
        let cqid = match d2h {
            CxlCachePacket::D2HReq(req) => {
                assert_eq!(req.opcode, D2HReqOpcode::DirtyEvict);
                req.cqid
            }
            other => panic!("expected D2HReq, got {other:?}"),
        };

        // A host invalidation for the same line crosses the eviction.
        h.upstream
            .host_to_target
            .send(CxlCachePacket::h2d_req(H2DReqOpcode::SnpInv, 0x80, 0, 0x33));
        let rsp = h.upstream.target_to_host.recv().await.unwrap();
        assert_eq!(rsp, CxlCachePacket::d2h_rsp(D2HRspOpcode::RspIHitI, 0x33));

        // The writeback still completes.
        h.upstream
            .host_to_target
            .send(CxlCachePacket::h2d_go_write_pull(0, 0x77, cqid));
        let data = h.upstream.target_to_host.recv().await.unwrap();
        match data {
            CxlCachePacket::D2HData(d) => {
                assert_eq!(d.uqid, 0x77);
                assert_eq!(d.data.as_u64(), 0xBEEF);
            }
            other => panic!("expected D2HData, got {other:?}"),
        }
        let response = h.requests_in.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::Ok);

        h.dcoh.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn inbound_snoop_forwards_modified_data() {
        let h = harness();
        let runner = h.dcoh.clone();
        let task = tokio::spawn(async move { runner.run().await });
        h.dcoh.wait_for_ready().await;

        // LLC stand-in: answer the snoop with modified data.
        let snoops = h.snoops_out.clone();
        let llc = tokio::spawn(async move {
            let request = snoops.request.recv().await.unwrap();
            assert_eq!(request.op, CacheRequestOp::SnpData);
            snoops.response.send(CacheResponse::with_data(
                CacheResponseStatus::RspS,
                CacheLineData::from_u64(0x5555),
            ));
        });

        h.upstream
            .host_to_target
            .send(CxlCachePacket::h2d_req(H2DReqOpcode::SnpData, 0x100, 0, 0x21));
        let rsp = h.upstream.target_to_host.recv().await.unwrap();
        assert_eq!(rsp, CxlCachePacket::d2h_rsp(D2HRspOpcode::RspSFwdM, 0x21));
        let data = h.upstream.target_to_host.recv().await.unwrap();
        match data {
            CxlCachePacket::D2HData(d) => assert_eq!(d.data.as_u64(), 0x5555),
            other => panic!("expected D2HData, got {other:?}"),
        }

        llc.await.unwrap();
        h.dcoh.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
