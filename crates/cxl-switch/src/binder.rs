//! Port binder: attaches what sits below each vPPB bridge.
//!
//! Each bind slot carries a relay between the vPPB's below-bridge connection
//! and either a physical DSP's per-LD connection (bound) or the slot's dummy
//! endpoint (unbound). Bind and unbind stop the old relay, start the new one
//! and update the slot status; while a transition is in flight the routers
//! observe `InProgress` and complete traffic to the slot with UR.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use cxl_pci::relay::ConnectionRelay;
use cxl_protocol::fifo::CxlConnection;
use cxl_protocol::ComponentError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BindStatus {
    Init,
    Bound,
    Unbound,
    InProgress,
}

impl BindStatus {
    fn as_u8(self) -> u8 {
        match self {
            BindStatus::Init => 0,
            BindStatus::Bound => 1,
            BindStatus::Unbound => 2,
            BindStatus::InProgress => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => BindStatus::Bound,
            2 => BindStatus::Unbound,
            3 => BindStatus::InProgress,
            _ => BindStatus::Init,
        }
    }
}

/// Shared, router-visible view of the slot states.
pub struct BindStatusBoard {
    slots: Vec<AtomicU8>,
}

impl BindStatusBoard {
    fn new(count: usize) -> Arc<Self> {
        Arc::new(BindStatusBoard {
            slots: (0..count).map(|_| AtomicU8::new(0)).collect(),
        })
    }

    pub fn status(&self, vppb: usize) -> BindStatus {
        self.slots
            .get(vppb)
            .map(|slot| BindStatus::from_u8(slot.load(Ordering::SeqCst)))
            .unwrap_or(BindStatus::Init)
    }

    fn set(&self, vppb: usize, status: BindStatus) {
        if let Some(slot) = self.slots.get(vppb) {
            slot.store(status.as_u8(), Ordering::SeqCst);
        }
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("vppb_index is out of bound")]
    VppbOutOfRange,
    #[error("vPPB {0} is already bound")]
    AlreadyBound(usize),
    #[error("vPPB {0} is already unbound")]
    AlreadyUnbound(usize),
    #[error(transparent)]
    Component(#[from] ComponentError),
}

struct BindSlot {
    relay: Option<Arc<ConnectionRelay>>,
    relay_task: Option<JoinHandle<()>>,
    bound_port: Option<u8>,
    ld_id: u8,
}

pub struct PortBinder {
    vcs_id: usize,
    slots: Mutex<Vec<BindSlot>>,
    board: Arc<BindStatusBoard>,
}

impl PortBinder {
    pub fn new(vcs_id: usize, vppb_count: usize) -> Self {
        PortBinder {
            vcs_id,
            slots: Mutex::new(
                (0..vppb_count)
                    .map(|_| BindSlot {
                        relay: None,
                        relay_task: None,
                        bound_port: None,
                        ld_id: 0,
                    })
                    .collect(),
            ),
            board: BindStatusBoard::new(vppb_count),
        }
    }

    pub fn status_board(&self) -> Arc<BindStatusBoard> {
        self.board.clone()
    }

    pub fn status(&self, vppb: usize) -> BindStatus {
        self.board.status(vppb)
    }

    pub fn bound_port(&self, vppb: usize) -> Option<u8> {
        self.slots
            .lock()
            .unwrap()
            .get(vppb)
            .and_then(|slot| slot.bound_port)
    }

    pub fn bound_ld(&self, vppb: usize) -> u8 {
        self.slots
            .lock()
            .unwrap()
            .get(vppb)
            .map(|slot| slot.ld_id)
            .unwrap_or(0)
    }

    pub fn bound_count(&self) -> usize {
        (0..self.slots.lock().unwrap().len())
            .filter(|&vppb| self.board.status(vppb) == BindStatus::Bound)
            .count()
    }

    pub fn vppb_count(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    async fn swap_relay(
        &self,
        vppb: usize,
        bridge_downstream: &CxlConnection,
        target: CxlConnection,
        bound_port: Option<u8>,
        ld_id: u8,
    ) -> Result<(), BindError> {
        let old = {
            let mut slots = self.slots.lock().unwrap();
            let slot = slots.get_mut(vppb).ok_or(BindError::VppbOutOfRange)?;
            (slot.relay.take(), slot.relay_task.take())
        };
        if let (Some(relay), Some(task)) = old {
            relay.stop().await?;
            let _ = task.await;
        }

        let relay = Arc::new(ConnectionRelay::new(
            bridge_downstream,
            &target,
            format!("VCS{}:vPPB{vppb}", self.vcs_id),
        ));
        let runner = relay.clone();
        let task = tokio::spawn(async move {
            let _ = runner.run().await;
        });
        relay.wait_for_ready().await;

        let mut slots = self.slots.lock().unwrap();
        let slot = slots.get_mut(vppb).ok_or(BindError::VppbOutOfRange)?;
        slot.relay = Some(relay);
        slot.relay_task = Some(task);
        slot.bound_port = bound_port;
        slot.ld_id = ld_id;
        Ok(())
    }

    /// Relays the vPPB onto a physical DSP connection.
    pub async fn bind_vppb(
        &self,
        vppb: usize,
        bridge_downstream: &CxlConnection,
        dsp_connection: CxlConnection,
        physical_port: u8,
        ld_id: u8,
    ) -> Result<(), BindError> {
        if vppb >= self.vppb_count() {
            return Err(BindError::VppbOutOfRange);
        }
        if self.board.status(vppb) == BindStatus::Bound {
            return Err(BindError::AlreadyBound(vppb));
        }
        self.board.set(vppb, BindStatus::InProgress);
        self.swap_relay(
            vppb,
            bridge_downstream,
            dsp_connection,
            Some(physical_port),
            ld_id,
        )
        .await?;
        self.board.set(vppb, BindStatus::Bound);
        info!(
            "[VCS{}] bound physical port {physical_port} (LD {ld_id}) to vPPB {vppb}",
            self.vcs_id
        );
        Ok(())
    }

    /// Reattaches the slot's dummy endpoint.
    pub async fn unbind_vppb(
        &self,
        vppb: usize,
        bridge_downstream: &CxlConnection,
        dummy_connection: CxlConnection,
    ) -> Result<(), BindError> {
        if vppb >= self.vppb_count() {
            return Err(BindError::VppbOutOfRange);
        }
        if self.board.status(vppb) == BindStatus::Unbound {
            return Err(BindError::AlreadyUnbound(vppb));
        }
        self.board.set(vppb, BindStatus::InProgress);
        self.swap_relay(vppb, bridge_downstream, dummy_connection, None, 0)
            .await?;
        self.board.set(vppb, BindStatus::Unbound);
        info!("[VCS{}] unbound vPPB {vppb}", self.vcs_id);
        Ok(())
    }

    pub async fn shutdown(&self) {
        let slots: Vec<_> = {
            let mut slots = self.slots.lock().unwrap();
            slots
                .iter_mut()
                .map(|slot| (slot.relay.take(), slot.relay_task.take()))
                .collect()
        };
        for (relay, task) in slots {
            if let (Some(relay), Some(task)) = (relay, task) {
                let _ = relay.stop().await;
                let _ = task.await;
            }
        }
    }
}
