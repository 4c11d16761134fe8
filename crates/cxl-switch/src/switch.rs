//! Top-level switch composition: physical ports, virtual switches, the TCP
//! port fabric and the FM CCI server.

use std::sync::Arc;

use thiserror::Error;
use tokio::join;

use cxl_protocol::wire::WireError;
use cxl_protocol::{ComponentError, ComponentState};

use crate::fabric::SwitchConnectionManager;
use crate::fm::cci::CciExecutor;
use crate::fm::commands::{SwitchCciBackend, SwitchInfo};
use crate::fm::mctp::{FmCciServer, Notification};
use crate::manager::{ManagerError, PhysicalPortManager, PortConfig, VirtualSwitchManager};
use crate::vcs::{CxlVirtualSwitch, SwitchError};

#[derive(Clone, Debug)]
pub struct VcsConfig {
    pub upstream_port_index: usize,
    pub vppb_count: usize,
    /// Per vPPB: physical-port list index to bind at start, or `None`.
    pub initial_bounds: Vec<Option<u8>>,
}

#[derive(Default)]
pub struct CxlSwitchConfig {
    pub ports: Vec<PortConfig>,
    pub vcs: Vec<VcsConfig>,
    /// TCP endpoint of the port fabric; `None` keeps the switch in-process.
    pub fabric_addr: Option<String>,
    /// TCP endpoint of the FM CCI; `None` disables the management server.
    pub fm_addr: Option<String>,
}

#[derive(Debug, Error)]
pub enum CxlSwitchError {
    #[error(transparent)]
    Switch(#[from] SwitchError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Component(#[from] ComponentError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

pub struct CxlSwitch {
    state: ComponentState,
    ports: Arc<PhysicalPortManager>,
    switches: Arc<VirtualSwitchManager>,
    backend: Arc<SwitchCciBackend>,
    executor: Arc<CciExecutor<SwitchCciBackend>>,
    fabric: Option<SwitchConnectionManager>,
    fm_server: Option<Arc<FmCciServer<SwitchCciBackend>>>,
}

impl CxlSwitch {
    pub async fn new(config: CxlSwitchConfig) -> Result<Self, CxlSwitchError> {
        let ports = PhysicalPortManager::new(&config.ports);

        let mut switches = Vec::new();
        for (vcs_id, vcs_config) in config.vcs.iter().enumerate() {
            switches.push(Arc::new(CxlVirtualSwitch::new(
                vcs_id,
                vcs_config.upstream_port_index,
                vcs_config.vppb_count,
                vcs_config.initial_bounds.clone(),
                ports.ports().to_vec(),
            )?));
        }
        let switches = VirtualSwitchManager::new(switches);

        let backend = SwitchCciBackend::new(SwitchInfo::default(), ports.clone(), switches.clone());
        let executor = Arc::new(CciExecutor::new(backend.clone()));

        let fabric = match &config.fabric_addr {
            Some(addr) => Some(SwitchConnectionManager::bind(addr.as_str(), ports.clone()).await?),
            None => None,
        };
        let fm_server = match &config.fm_addr {
            Some(addr) => Some(Arc::new(
                FmCciServer::bind(addr.as_str(), executor.clone()).await?,
            )),
            None => None,
        };

        // Bind/unbind transitions surface as FM notifications.
        if let Some(fm_server) = &fm_server {
            for vcs in switches.switches() {
                let fm_server = fm_server.clone();
                vcs.register_event_handler(Box::new(move |event| {
                    fm_server.notify(Notification::SwitchUpdate {
                        vcs_id: event.vcs_id as u8,
                        vppb_id: event.vppb_id as u8,
                        binding_status: event.binding_status as u8,
                    });
                }));
            }
        }

        Ok(CxlSwitch {
            state: ComponentState::new(),
            ports,
            switches,
            backend,
            executor,
            fabric,
            fm_server,
        })
    }

    pub fn physical_ports(&self) -> &Arc<PhysicalPortManager> {
        &self.ports
    }

    pub fn virtual_switches(&self) -> &Arc<VirtualSwitchManager> {
        &self.switches
    }

    pub fn cci_backend(&self) -> &Arc<SwitchCciBackend> {
        &self.backend
    }

    pub fn cci_executor(&self) -> &Arc<CciExecutor<SwitchCciBackend>> {
        &self.executor
    }

    pub fn fabric_addr(&self) -> Option<std::net::SocketAddr> {
        self.fabric.as_ref().and_then(|f| f.local_addr().ok())
    }

    pub fn fm_addr(&self) -> Option<std::net::SocketAddr> {
        self.fm_server.as_ref().and_then(|f| f.local_addr().ok())
    }

    pub async fn run(&self) -> Result<(), CxlSwitchError> {
        self.state.begin_run()?;
        let ready = async {
            self.ports.wait_for_ready().await;
            self.switches.wait_for_ready().await;
            self.state.set_running();
        };
        let serve_fabric = async {
            if let Some(fabric) = &self.fabric {
                fabric.serve().await;
            }
        };
        let serve_fm = async {
            if let Some(fm_server) = &self.fm_server {
                fm_server.serve().await;
            }
        };
        let core = async { join!(self.ports.run(), self.switches.run(), ready) };
        let services = async {
            join!(serve_fabric, serve_fm);
            // Disabled or torn-down listeners must not end the select below;
            // only the managers decide when the switch stops.
            std::future::pending::<()>().await
        };
        // The accept loops never finish on their own; dropping them when the
        // managers stop tears the listeners down.
        let (ports, switches, _) = tokio::select! {
            result = core => result,
            _ = services => unreachable!(),
        };
        ports?;
        switches?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), CxlSwitchError> {
        self.state.begin_stop()?;
        self.switches.stop().await?;
        self.ports.stop().await?;
        if let Some(fabric) = &self.fabric {
            fabric.shutdown();
        }
        if let Some(fm_server) = &self.fm_server {
            fm_server.shutdown();
        }
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
