//! In-process machine composition.
//!
//! Builds a complete topology — switch with one VCS, endpoint devices on the
//! downstream ports, and either a raw root-port accessor or a full host on
//! the upstream port — wired through channels, no sockets. The integration
//! scenarios under `tests/` drive these machines end to end.

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::error;

use cxl_cache::accessor::BackingStore;
use cxl_device::devices::{CxlType1Device, CxlType2Device, CxlType3Device, DeviceError};
use cxl_device::mld::MultiLogicalDevice;
use cxl_host::drivers::RootPortDevice;
use cxl_host::host::{CxlHost, CxlHostConfig, RootPortLink};
use cxl_host::HostError;
use cxl_protocol::fifo::CxlConnection;
use cxl_switch::switch::{CxlSwitch, CxlSwitchConfig, CxlSwitchError, VcsConfig};
use cxl_switch::{PortConfig, PortKind};

pub use cxl_host::home_agent::CohPolicy;

#[derive(Debug, Error)]
pub enum MachineError {
    #[error(transparent)]
    Switch(#[from] CxlSwitchError),
    #[error(transparent)]
    Device(#[from] DeviceError),
    #[error(transparent)]
    Host(#[from] HostError),
}

/// What sits on a downstream port.
pub enum EndpointKind {
    /// Empty slot: the DSP exists, nothing is plugged in.
    Empty,
    Type3 {
        memory_size: u64,
        backing: BackingStore,
    },
    Type1,
    Type2 {
        memory_size: u64,
        backing: BackingStore,
    },
    Mld {
        ld_count: usize,
        memory_size_per_ld: u64,
    },
}

pub enum Endpoint {
    Empty,
    Type3(Arc<CxlType3Device>),
    Type1(Arc<CxlType1Device>),
    Type2(Arc<CxlType2Device>),
    Mld(Arc<MultiLogicalDevice>),
}

/// One-VCS machine: USP on physical port 0, DSPs on ports 1..=N.
pub struct MachineBuilder {
    endpoints: Vec<EndpointKind>,
    initial_bounds: Vec<Option<u8>>,
    fabric_addr: Option<String>,
    fm_addr: Option<String>,
}

impl MachineBuilder {
    pub fn new() -> Self {
        MachineBuilder {
            endpoints: Vec::new(),
            initial_bounds: Vec::new(),
            fabric_addr: None,
            fm_addr: None,
        }
    }

    /// Adds a downstream port carrying `endpoint`, bound to the next vPPB at
    /// start when `bound` is set.
    pub fn endpoint(mut self, endpoint: EndpointKind, bound: bool) -> Self {
        let port_index = self.endpoints.len() as u8 + 1;
        self.endpoints.push(endpoint);
        self.initial_bounds
            .push(bound.then_some(port_index));
        self
    }

    pub fn with_fm_server(mut self, addr: impl Into<String>) -> Self {
        self.fm_addr = Some(addr.into());
        self
    }

    pub fn with_fabric_server(mut self, addr: impl Into<String>) -> Self {
        self.fabric_addr = Some(addr.into());
        self
    }

    pub async fn build(self) -> Result<Machine, MachineError> {
        let mut ports = vec![PortConfig {
            port_index: 0,
            kind: PortKind::Usp,
        }];
        for index in 0..self.endpoints.len() {
            ports.push(PortConfig {
                port_index: index as u8 + 1,
                kind: PortKind::Dsp,
            });
        }

        let switch = Arc::new(
            CxlSwitch::new(CxlSwitchConfig {
                ports,
                vcs: vec![VcsConfig {
                    upstream_port_index: 0,
                    vppb_count: self.endpoints.len(),
                    initial_bounds: self.initial_bounds,
                }],
                fabric_addr: self.fabric_addr,
                fm_addr: self.fm_addr,
            })
            .await?,
        );

        let mut endpoints = Vec::new();
        for (index, kind) in self.endpoints.into_iter().enumerate() {
            let port_index = index as u8 + 1;
            let dsp = switch
                .physical_ports()
                .get_dsp(index + 1)
                .expect("builder created this DSP")
                .clone();
            let transport = dsp.transport().clone();
            if !matches!(kind, EndpointKind::Empty) {
                dsp.set_connected(true);
            }
            let label = format!("dev{port_index}");
            let endpoint = match kind {
                EndpointKind::Empty => Endpoint::Empty,
                EndpointKind::Type3 {
                    memory_size,
                    backing,
                } => Endpoint::Type3(Arc::new(CxlType3Device::new(
                    &transport,
                    memory_size,
                    backing,
                    port_index,
                    label,
                )?)),
                EndpointKind::Type1 => Endpoint::Type1(Arc::new(CxlType1Device::new(
                    &transport, 0, label,
                )?)),
                EndpointKind::Type2 {
                    memory_size,
                    backing,
                } => Endpoint::Type2(Arc::new(CxlType2Device::new(
                    &transport,
                    memory_size,
                    backing,
                    port_index,
                    label,
                )?)),
                EndpointKind::Mld {
                    ld_count,
                    memory_size_per_ld,
                } => {
                    let mld = Arc::new(MultiLogicalDevice::new(
                        &transport,
                        ld_count,
                        memory_size_per_ld,
                        |_| BackingStore::Anonymous,
                        label,
                    )?);
                    switch.cci_backend().register_mld(port_index, mld.clone());
                    Endpoint::Mld(mld)
                }
            };
            endpoints.push(endpoint);
        }

        Ok(Machine {
            switch,
            endpoints,
            tasks: Vec::new(),
            host: None,
        })
    }
}

impl Default for MachineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Machine {
    pub switch: Arc<CxlSwitch>,
    pub endpoints: Vec<Endpoint>,
    tasks: Vec<JoinHandle<()>>,
    host: Option<Arc<CxlHost>>,
}

impl Machine {
    /// Starts the switch and every endpoint, and waits until they are ready.
    pub async fn start(&mut self) {
        let switch = self.switch.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(err) = switch.run().await {
                error!("switch stopped with error: {err}");
            }
        }));
        for endpoint in &self.endpoints {
            match endpoint {
                Endpoint::Empty => {}
                Endpoint::Type3(device) => {
                    let device = device.clone();
                    self.tasks.push(tokio::spawn(async move {
                        if let Err(err) = device.run().await {
                            error!("type 3 device stopped with error: {err}");
                        }
                    }));
                }
                Endpoint::Type1(device) => {
                    let device = device.clone();
                    self.tasks.push(tokio::spawn(async move {
                        if let Err(err) = device.run().await {
                            error!("type 1 device stopped with error: {err}");
                        }
                    }));
                }
                Endpoint::Type2(device) => {
                    let device = device.clone();
                    self.tasks.push(tokio::spawn(async move {
                        if let Err(err) = device.run().await {
                            error!("type 2 device stopped with error: {err}");
                        }
                    }));
                }
                Endpoint::Mld(device) => {
                    let device = device.clone();
                    self.tasks.push(tokio::spawn(async move {
                        if let Err(err) = device.run().await {
                            error!("MLD stopped with error: {err}");
                        }
                    }));
                }
            }
        }
        self.switch.wait_for_ready().await;
        for endpoint in &self.endpoints {
            match endpoint {
                Endpoint::Empty => {}
                Endpoint::Type3(device) => device.wait_for_ready().await,
                Endpoint::Type1(device) => device.wait_for_ready().await,
                Endpoint::Type2(device) => device.wait_for_ready().await,
                Endpoint::Mld(device) => device.wait_for_ready().await,
            }
        }
    }

    /// The raw root-port accessor on the USP, for driver-level scenarios.
    pub fn root_port(&self) -> RootPortDevice {
        let transport = self
            .switch
            .physical_ports()
            .get_usp(0)
            .expect("port 0 is the USP")
            .transport()
            .clone();
        RootPortDevice::new(transport)
    }

    /// Attaches and starts a full host on the USP.
    pub async fn start_host(
        &mut self,
        sys_mem_size: u64,
        coh_policy: CohPolicy,
    ) -> Result<Arc<CxlHost>, MachineError> {
        let transport: CxlConnection = self
            .switch
            .physical_ports()
            .get_usp(0)
            .expect("port 0 is the USP")
            .transport()
            .clone();
        let mut config = CxlHostConfig::new("host0", sys_mem_size, RootPortLink::Direct(transport));
        config.coh_policy = coh_policy;
        let host = Arc::new(CxlHost::new(config).await?);
        let runner = host.clone();
        self.tasks.push(tokio::spawn(async move {
            if let Err(err) = runner.run().await {
                error!("host stopped with error: {err}");
            }
        }));
        host.wait_for_ready().await;
        self.host = Some(host.clone());
        Ok(host)
    }

    pub async fn stop(&mut self) {
        if let Some(host) = &self.host {
            let _ = host.stop().await;
        }
        for endpoint in &self.endpoints {
            match endpoint {
                Endpoint::Empty => {}
                Endpoint::Type3(device) => {
                    let _ = device.stop().await;
                }
                Endpoint::Type1(device) => {
                    let _ = device.stop().await;
                }
                Endpoint::Type2(device) => {
                    let _ = device.stop().await;
                }
                Endpoint::Mld(device) => {
                    let _ = device.stop().await;
                }
            }
        }
        let _ = self.switch.stop().await;
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}
