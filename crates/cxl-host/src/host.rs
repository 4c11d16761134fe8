//! Host composition: memory hub + CPU, linked to a switch port either
//! directly (in-process connection) or through the TCP fabric.

use std::sync::Arc;
use std::time::Duration;

use cxl_cache::accessor::BackingStore;
use cxl_protocol::fabric::FabricPortClient;
use cxl_protocol::fifo::CxlConnection;
use cxl_protocol::wire::PortClientKind;
use cxl_protocol::ComponentState;

use crate::cpu::Cpu;
use crate::home_agent::{CohPolicy, DEFAULT_MEM_TIMEOUT};
use crate::io_bridge::DEFAULT_MMIO_TIMEOUT;
use crate::memory_hub::{CxlMemoryHub, CxlMemoryHubConfig};
use crate::HostError;

/// How the host's root port reaches the switch.
pub enum RootPortLink {
    Direct(CxlConnection),
    Tcp { addr: String, port_index: u8 },
}

pub struct CxlHostConfig {
    pub host_name: String,
    pub root_bus: u8,
    pub mmio_base: u64,
    pub sys_mem_size: u64,
    pub sys_mem_backing: BackingStore,
    pub coh_policy: CohPolicy,
    pub link: RootPortLink,
    pub mem_timeout: Duration,
    pub mmio_timeout: Duration,
}

impl CxlHostConfig {
    pub fn new(host_name: impl Into<String>, sys_mem_size: u64, link: RootPortLink) -> Self {
        CxlHostConfig {
            host_name: host_name.into(),
            root_bus: 0,
            mmio_base: 0x8000_0000,
            sys_mem_size,
            sys_mem_backing: BackingStore::Anonymous,
            coh_policy: CohPolicy::DotMemBi,
            link,
            mem_timeout: DEFAULT_MEM_TIMEOUT,
            mmio_timeout: DEFAULT_MMIO_TIMEOUT,
        }
    }
}

pub struct CxlHost {
    state: ComponentState,
    hub: Arc<CxlMemoryHub>,
    cpu: Arc<Cpu>,
    fabric_client: Option<FabricPortClient>,
}

impl CxlHost {
    pub async fn new(config: CxlHostConfig) -> Result<Self, HostError> {
        let (downstream, fabric_client) = match config.link {
            RootPortLink::Direct(connection) => (connection, None),
            RootPortLink::Tcp { addr, port_index } => {
                let client =
                    FabricPortClient::connect(addr.as_str(), port_index, PortClientKind::RootPort)
                        .await?;
                (client.connection().clone(), Some(client))
            }
        };

        let hub = Arc::new(CxlMemoryHub::new(CxlMemoryHubConfig {
            host_name: config.host_name,
            root_bus: config.root_bus,
            mmio_base: config.mmio_base,
            sys_mem_size: config.sys_mem_size,
            sys_mem_backing: config.sys_mem_backing,
            coh_policy: config.coh_policy,
            mem_timeout: config.mem_timeout,
            mmio_timeout: config.mmio_timeout,
            downstream,
        })?);
        let cpu = Cpu::new(hub.clone());

        Ok(CxlHost {
            state: ComponentState::new(),
            hub,
            cpu,
            fabric_client,
        })
    }

    pub fn memory_hub(&self) -> &Arc<CxlMemoryHub> {
        &self.hub
    }

    pub fn cpu(&self) -> &Arc<Cpu> {
        &self.cpu
    }

    pub async fn run(&self) -> Result<(), HostError> {
        self.state.begin_run()?;
        self.state.set_running();
        self.hub.run().await?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), HostError> {
        self.state.begin_stop()?;
        self.hub.stop().await?;
        if let Some(client) = &self.fabric_client {
            client.shutdown();
        }
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
