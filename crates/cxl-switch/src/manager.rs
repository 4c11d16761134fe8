//! Physical-port and virtual-switch managers.

use std::sync::Arc;

use futures::future::join_all;
use thiserror::Error;
use tokio::join;

use cxl_protocol::fifo::CxlConnection;
use cxl_protocol::{ComponentError, ComponentState};

use crate::ports::{DownstreamPort, PhysicalPort, UpstreamPort};
use crate::vcs::{CxlVirtualSwitch, SwitchError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PortKind {
    Usp,
    Dsp,
}

#[derive(Clone, Copy, Debug)]
pub struct PortConfig {
    pub port_index: u8,
    pub kind: PortKind,
}

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Switch(#[from] SwitchError),
}

/// Owns the physical ports of the switch in port-index order.
pub struct PhysicalPortManager {
    state: ComponentState,
    ports: Vec<PhysicalPort>,
}

impl PhysicalPortManager {
    pub fn new(configs: &[PortConfig]) -> Arc<Self> {
        let ports = configs
            .iter()
            .map(|config| {
                let transport = CxlConnection::new();
                match config.kind {
                    PortKind::Usp => {
                        PhysicalPort::Usp(UpstreamPort::new(transport, config.port_index))
                    }
                    PortKind::Dsp => {
                        PhysicalPort::Dsp(DownstreamPort::new(transport, config.port_index))
                    }
                }
            })
            .collect();
        Arc::new(PhysicalPortManager {
            state: ComponentState::new(),
            ports,
        })
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    pub fn ports(&self) -> &[PhysicalPort] {
        &self.ports
    }

    pub fn get_port(&self, index: usize) -> Option<&PhysicalPort> {
        self.ports.get(index)
    }

    pub fn get_dsp(&self, index: usize) -> Option<&Arc<DownstreamPort>> {
        match self.ports.get(index) {
            Some(PhysicalPort::Dsp(dsp)) => Some(dsp),
            _ => None,
        }
    }

    pub fn get_usp(&self, index: usize) -> Option<&Arc<UpstreamPort>> {
        match self.ports.get(index) {
            Some(PhysicalPort::Usp(usp)) => Some(usp),
            _ => None,
        }
    }

    pub async fn run(&self) -> Result<(), ManagerError> {
        self.state.begin_run()?;
        self.state.set_running();
        let runs = self.ports.iter().map(|port| async move {
            match port {
                PhysicalPort::Usp(usp) => usp.run().await,
                PhysicalPort::Dsp(dsp) => dsp.run().await,
            }
        });
        join_all(runs).await;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ManagerError> {
        self.state.begin_stop()?;
        for port in &self.ports {
            match port {
                PhysicalPort::Usp(usp) => usp.stop().await?,
                PhysicalPort::Dsp(dsp) => dsp.stop().await?,
            }
        }
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}

/// Owns the virtual switches.
pub struct VirtualSwitchManager {
    state: ComponentState,
    switches: Vec<Arc<CxlVirtualSwitch>>,
}

impl VirtualSwitchManager {
    pub fn new(switches: Vec<Arc<CxlVirtualSwitch>>) -> Arc<Self> {
        Arc::new(VirtualSwitchManager {
            state: ComponentState::new(),
            switches,
        })
    }

    pub fn virtual_switch_count(&self) -> usize {
        self.switches.len()
    }

    pub fn get_virtual_switch(&self, vcs_id: usize) -> Option<&Arc<CxlVirtualSwitch>> {
        self.switches.get(vcs_id)
    }

    pub fn switches(&self) -> &[Arc<CxlVirtualSwitch>] {
        &self.switches
    }

    pub async fn run(&self) -> Result<(), ManagerError> {
        self.state.begin_run()?;
        let wait_ready = async {
            join_all(self.switches.iter().map(|vcs| vcs.wait_for_ready())).await;
            self.state.set_running();
        };
        let runs = async {
            join_all(self.switches.iter().map(|vcs| vcs.run())).await;
        };
        join!(wait_ready, runs);
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ManagerError> {
        self.state.begin_stop()?;
        for vcs in &self.switches {
            vcs.stop().await?;
        }
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
