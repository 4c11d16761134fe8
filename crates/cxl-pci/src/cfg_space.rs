//! Config-space manager actor.
//!
//! Serves type 0 configuration requests from its function's register file and
//! completes them; bridges convert type 1 requests to type 0 when the target
//! bus equals their secondary bus and forward them downstream. Endpoints
//! complete unexpected type 1 requests with UR, as they do for functions
//! other than 0 and (except below a downstream bridge) devices other than 0.

use std::sync::{Arc, Mutex};

use tokio::join;
use tracing::{debug, warn};

use cxl_protocol::fifo::FifoPair;
use cxl_protocol::packet::{CfgRequest, CplStatus, CxlIoPacket};
use cxl_protocol::{ComponentError, ComponentState};
use cxl_regs::config_space::ConfigSpace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PciDeviceKind {
    Endpoint,
    UpstreamBridge,
    DownstreamBridge,
}

pub struct ConfigSpaceManager {
    state: ComponentState,
    register: Arc<Mutex<ConfigSpace>>,
    upstream: FifoPair<CxlIoPacket>,
    downstream: Option<FifoPair<CxlIoPacket>>,
    kind: PciDeviceKind,
    label: String,
}

impl ConfigSpaceManager {
    pub fn new(
        register: Arc<Mutex<ConfigSpace>>,
        upstream: FifoPair<CxlIoPacket>,
        downstream: Option<FifoPair<CxlIoPacket>>,
        kind: PciDeviceKind,
        label: impl Into<String>,
    ) -> Self {
        ConfigSpaceManager {
            state: ComponentState::new(),
            register,
            upstream,
            downstream,
            kind,
            label: label.into(),
        }
    }

    pub fn register(&self) -> &Arc<Mutex<ConfigSpace>> {
        &self.register
    }

    fn is_bridge(&self) -> bool {
        self.kind != PciDeviceKind::Endpoint
    }

    fn send_unsupported_request(&self, req_id: u16, tag: u8) {
        self.upstream
            .target_to_host
            .send(CxlIoPacket::cpl(req_id, tag, CplStatus::Ur));
    }

    fn handle_type0(&self, request: CfgRequest, is_read: bool) {
        if request.bdf.function() != 0 {
            debug!(
                "[{}:CfgSpace] {} targets function {}, single-function device",
                self.label,
                request.bdf,
                request.bdf.function()
            );
            self.send_unsupported_request(request.req_id, request.tag);
            return;
        }
        if self.kind != PciDeviceKind::DownstreamBridge && request.bdf.device() != 0 {
            debug!(
                "[{}:CfgSpace] {} targets device {}, device 0 only",
                self.label,
                request.bdf,
                request.bdf.device()
            );
            self.send_unsupported_request(request.req_id, request.tag);
            return;
        }

        let size = usize::from(request.size);
        if is_read {
            let value = self.register.lock().unwrap().read(request.offset, size);
            debug!(
                "[{}:CfgSpace] RD 0x{:03x}[{size}] = 0x{value:x}",
                self.label, request.offset
            );
            self.upstream.target_to_host.send(CxlIoPacket::cpl_d(
                request.req_id,
                request.tag,
                u64::from(value),
                request.size,
            ));
        } else if let Some(value) = request.value {
            debug!(
                "[{}:CfgSpace] WR 0x{:03x}[{size}] = 0x{value:x}",
                self.label, request.offset
            );
            self.register.lock().unwrap().write(request.offset, size, value);
            self.upstream
                .target_to_host
                .send(CxlIoPacket::cpl(request.req_id, request.tag, CplStatus::Sc));
        }
    }

    fn handle_type1(&self, mut request: CfgRequest, is_read: bool) {
        let Some(downstream) = &self.downstream else {
            warn!(
                "[{}:CfgSpace] endpoint received a type 1 request, completing UR",
                self.label
            );
            self.send_unsupported_request(request.req_id, request.tag);
            return;
        };
        let secondary_bus = self.register.lock().unwrap().secondary_bus();
        if request.bdf.bus() == secondary_bus {
            debug!("[{}:CfgSpace] converting type 1 to type 0", self.label);
            request.type0 = true;
        }
        let packet = if is_read {
            CxlIoPacket::CfgRd(request)
        } else {
            CxlIoPacket::CfgWr(request)
        };
        downstream.host_to_target.send(packet);
    }

    async fn process_host_to_target(&self) {
        while let Some(packet) = self.upstream.host_to_target.recv().await {
            match packet {
                CxlIoPacket::CfgRd(request) if request.type0 => self.handle_type0(request, true),
                CxlIoPacket::CfgWr(request) if request.type0 => self.handle_type0(request, false),
                CxlIoPacket::CfgRd(request) => self.handle_type1(request, true),
                CxlIoPacket::CfgWr(request) => self.handle_type1(request, false),
                other => {
                    warn!("[{}:CfgSpace] unexpected packet {other:?}, dropped", self.label);
                }
            }
        }
        debug!("[{}:CfgSpace] host-to-target loop stopped", self.label);
    }

    async fn process_target_to_host(&self) {
        let Some(downstream) = &self.downstream else {
            return;
        };
        while let Some(packet) = downstream.target_to_host.recv().await {
            self.upstream.target_to_host.send(packet);
        }
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        join!(self.process_host_to_target(), self.process_target_to_host());
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.upstream.host_to_target.shutdown();
        if let Some(downstream) = &self.downstream {
            downstream.target_to_host.shutdown();
        }
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }

    pub fn kind(&self) -> PciDeviceKind {
        self.kind
    }

    pub fn is_bridge_device(&self) -> bool {
        self.is_bridge()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxl_protocol::packet::Bdf;
    use cxl_regs::config_space::{ConfigSpaceBuilder, NoHooks, VENDOR_ID};
    use cxl_regs::identity::{PciIdentity, EMU_VID, SLD_DID};

    fn endpoint_manager() -> (Arc<ConfigSpaceManager>, FifoPair<CxlIoPacket>) {
        let space = ConfigSpaceBuilder::endpoint(PciIdentity::memory_device(SLD_DID))
            .bar(0, 0x10000)
            .build(Arc::new(NoHooks));
        let upstream = FifoPair::new();
        let manager = Arc::new(ConfigSpaceManager::new(
            Arc::new(Mutex::new(space)),
            upstream.clone(),
            None,
            PciDeviceKind::Endpoint,
            "sld",
        ));
        (manager, upstream)
    }

    #[tokio::test]
    async fn type0_read_completes_with_register_data() {
        let (manager, upstream) = endpoint_manager();
        let runner = manager.clone();
        let task = tokio::spawn(async move { runner.run().await });
        manager.wait_for_ready().await;

        upstream
            .host_to_target
            .send(CxlIoPacket::cfg_rd(Bdf::new(3, 0, 0), VENDOR_ID, 2, true, 0, 1));
        let response = upstream.target_to_host.recv().await.unwrap();
        assert_eq!(response, CxlIoPacket::cpl_d(0, 1, u64::from(EMU_VID), 2));

        manager.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn nonzero_function_and_type1_complete_ur() {
        let (manager, upstream) = endpoint_manager();
        let runner = manager.clone();
        let task = tokio::spawn(async move { runner.run().await });
        manager.wait_for_ready().await;

        upstream
            .host_to_target
            .send(CxlIoPacket::cfg_rd(Bdf::new(3, 0, 1), VENDOR_ID, 2, true, 0, 2));
        let response = upstream.target_to_host.recv().await.unwrap();
        assert_eq!(response, CxlIoPacket::cpl(0, 2, CplStatus::Ur));

        upstream
            .host_to_target
            .send(CxlIoPacket::cfg_rd(Bdf::new(4, 0, 0), VENDOR_ID, 2, false, 0, 3));
        let response = upstream.target_to_host.recv().await.unwrap();
        assert_eq!(response, CxlIoPacket::cpl(0, 3, CplStatus::Ur));

        manager.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
