//! Virtual CXL switch.
//!
//! A VCS owns one upstream port (fixed at construction, never rebindable),
//! a set of permanent vPPB bridges with their dummy endpoints, the routing
//! table, the port binder and the four routers. Binding attaches a physical
//! DSP below a vPPB and records the port mapping in the routing table;
//! unbinding reattaches the dummy endpoint. Registered event handlers observe
//! every transition.

use std::sync::{Arc, Mutex};

use futures::future::join_all;
use thiserror::Error;
use tokio::join;
use tracing::info;

use cxl_pci::routing::RoutingTable;
use cxl_protocol::{ComponentError, ComponentState};

use crate::binder::{BindError, BindStatus, PortBinder};
use crate::ports::{PhysicalPort, UpstreamPort};
use crate::routers::VcsRouters;
use crate::vppb::{DummyEndpoint, VppbBridge};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PpbBindingStatus {
    Unbound = 0x00,
    BindOrUnbindInProgress = 0x01,
    BoundPhysicalPort = 0x02,
    BoundLd = 0x03,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchUpdateEvent {
    pub vcs_id: usize,
    pub vppb_id: usize,
    pub binding_status: PpbBindingStatus,
}

pub type SwitchEventHandler = Box<dyn Fn(SwitchUpdateEvent) + Send + Sync>;

#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("port_index is out of bound")]
    PortOutOfRange,
    #[error("Upstream Port Index is out of bound")]
    UspIndexOutOfRange,
    #[error("physical port {0} is not USP")]
    NotUsp(usize),
    #[error("physical port {0} is not DSP")]
    NotDsp(usize),
    #[error("vppb_index is out of bound")]
    VppbOutOfRange,
    #[error("length of initial_bounds and vppb_count must be the same")]
    InitialBoundsMismatch,
    #[error("physical port {0} is already bound")]
    PortAlreadyBound(u8),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Component(#[from] ComponentError),
}

pub struct CxlVirtualSwitch {
    id: usize,
    state: ComponentState,
    routing_table: Arc<RoutingTable>,
    usp: Arc<UpstreamPort>,
    physical_ports: Vec<PhysicalPort>,
    vppbs: Vec<Arc<VppbBridge>>,
    dummies: Vec<Arc<DummyEndpoint>>,
    binder: PortBinder,
    routers: VcsRouters,
    initial_bounds: Vec<Option<u8>>,
    event_handler: Mutex<Option<SwitchEventHandler>>,
}

impl CxlVirtualSwitch {
    /// `initial_bounds` holds, per vPPB, the index into `physical_ports` to
    /// bind at start, or `None` to start unbound.
    pub fn new(
        id: usize,
        upstream_port_index: usize,
        vppb_count: usize,
        initial_bounds: Vec<Option<u8>>,
        physical_ports: Vec<PhysicalPort>,
    ) -> Result<Self, SwitchError> {
        if initial_bounds.len() != vppb_count {
            return Err(SwitchError::InitialBoundsMismatch);
        }
        let port = physical_ports
            .get(upstream_port_index)
            .ok_or(SwitchError::UspIndexOutOfRange)?;
        let PhysicalPort::Usp(usp) = port else {
            return Err(SwitchError::NotUsp(upstream_port_index));
        };
        let usp = usp.clone();

        let routing_table = RoutingTable::new(vppb_count, format!("VCS{id}"));
        usp.set_routing_table(&routing_table);

        let vppbs: Vec<_> = (0..vppb_count)
            .map(|vppb| VppbBridge::new(id, vppb, &routing_table))
            .collect();
        let dummies: Vec<_> = (0..vppb_count)
            .map(|vppb| DummyEndpoint::new(id, vppb))
            .collect();
        let binder = PortBinder::new(id, vppb_count);
        let routers = VcsRouters::new(
            id,
            routing_table.clone(),
            binder.status_board(),
            usp.downstream_connection().clone(),
            vppbs.iter().map(|b| b.upstream_connection().clone()).collect(),
        );

        Ok(CxlVirtualSwitch {
            id,
            state: ComponentState::new(),
            routing_table,
            usp,
            physical_ports,
            vppbs,
            dummies,
            binder,
            routers,
            initial_bounds,
            event_handler: Mutex::new(None),
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn routing_table(&self) -> &Arc<RoutingTable> {
        &self.routing_table
    }

    pub fn register_event_handler(&self, handler: SwitchEventHandler) {
        *self.event_handler.lock().unwrap() = Some(handler);
    }

    fn emit_event(&self, vppb_id: usize, binding_status: PpbBindingStatus) {
        if let Some(handler) = self.event_handler.lock().unwrap().as_ref() {
            handler(SwitchUpdateEvent {
                vcs_id: self.id,
                vppb_id,
                binding_status,
            });
        }
    }

    pub fn vppb_count(&self) -> usize {
        self.vppbs.len()
    }

    pub fn bound_vppb_count(&self) -> usize {
        self.binder.bound_count()
    }

    pub fn is_vppb_bound(&self, vppb: usize) -> bool {
        self.binder.status(vppb) == BindStatus::Bound
    }

    pub fn usp_port_id(&self) -> u8 {
        self.usp.port_index()
    }

    pub fn bound_port_id(&self, vppb: usize) -> Option<u8> {
        self.binder.bound_port(vppb)
    }

    pub fn vppb_binding_status(&self, vppb: usize) -> PpbBindingStatus {
        match self.binder.status(vppb) {
            BindStatus::Bound => PpbBindingStatus::BoundLd,
            BindStatus::InProgress => PpbBindingStatus::BindOrUnbindInProgress,
            BindStatus::Init | BindStatus::Unbound => PpbBindingStatus::Unbound,
        }
    }

    /// Binds a physical DSP (by index into the port list) to a vPPB.
    pub async fn bind_vppb(
        &self,
        port_index: usize,
        vppb_index: usize,
        ld_id: u8,
    ) -> Result<(), SwitchError> {
        let port = self
            .physical_ports
            .get(port_index)
            .ok_or(SwitchError::PortOutOfRange)?;
        let PhysicalPort::Dsp(dsp) = port else {
            return Err(SwitchError::NotDsp(port_index));
        };
        if vppb_index >= self.vppbs.len() {
            return Err(SwitchError::VppbOutOfRange);
        }
        let physical_port = dsp.port_index();
        // A DSP may host several LDs, but each (port, LD) binds once.
        let already_bound = (0..self.vppbs.len()).any(|vppb| {
            self.binder.bound_port(vppb) == Some(physical_port)
                && self.binder.bound_ld(vppb) == ld_id
        });
        if already_bound {
            return Err(SwitchError::PortAlreadyBound(physical_port));
        }

        info!(
            "[VCS{}] binding physical port {physical_port} to vPPB {vppb_index}",
            self.id
        );
        self.emit_event(vppb_index, PpbBindingStatus::BindOrUnbindInProgress);
        let connection = dsp.bind_ld(ld_id);
        self.binder
            .bind_vppb(
                vppb_index,
                self.vppbs[vppb_index].downstream_connection(),
                connection,
                physical_port,
                ld_id,
            )
            .await?;
        self.routing_table.bind_port(physical_port, vppb_index);
        self.vppbs[vppb_index].set_port_number(physical_port);
        self.emit_event(vppb_index, PpbBindingStatus::BoundLd);
        Ok(())
    }

    /// Unbinds a vPPB, reattaching its dummy endpoint.
    pub async fn unbind_vppb(&self, vppb_index: usize) -> Result<(), SwitchError> {
        if vppb_index >= self.vppbs.len() {
            return Err(SwitchError::VppbOutOfRange);
        }
        info!("[VCS{}] unbinding vPPB {vppb_index}", self.id);
        self.emit_event(vppb_index, PpbBindingStatus::BindOrUnbindInProgress);
        if let Some(port) = self.binder.bound_port(vppb_index) {
            self.routing_table.unbind_port(port);
        }
        self.binder
            .unbind_vppb(
                vppb_index,
                self.vppbs[vppb_index].downstream_connection(),
                self.dummies[vppb_index].connection().clone(),
            )
            .await?;
        self.emit_event(vppb_index, PpbBindingStatus::Unbound);
        Ok(())
    }

    async fn apply_initial_bounds(&self) -> Result<(), SwitchError> {
        for (vppb, bound) in self.initial_bounds.clone().into_iter().enumerate() {
            match bound {
                Some(port_index) => self.bind_vppb(usize::from(port_index), vppb, 0).await?,
                None => self.unbind_vppb(vppb).await?,
            }
        }
        Ok(())
    }

    pub async fn run(&self) -> Result<(), SwitchError> {
        self.state.begin_run()?;
        self.apply_initial_bounds().await?;
        self.state.set_running();

        let vppb_runs = async {
            join_all(self.vppbs.iter().map(|vppb| vppb.run())).await;
        };
        let dummy_runs = async {
            join_all(self.dummies.iter().map(|dummy| dummy.run())).await;
        };
        let (routers, _, _) = join!(self.routers.run(), vppb_runs, dummy_runs);
        routers?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), SwitchError> {
        self.state.begin_stop()?;
        self.routers.stop().await?;
        for vppb in &self.vppbs {
            vppb.stop().await?;
        }
        for dummy in &self.dummies {
            let _ = dummy.stop().await;
        }
        self.binder.shutdown().await;
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
