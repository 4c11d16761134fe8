//! Root complex: the host's PCIe/CXL root.
//!
//! Composes the pass-through root port (four verbatim relays to the
//! downstream connection), the IO bridge, the cache coherency bridge, the
//! home agent and the system memory controller, wiring the internal memory
//! FIFOs between them.

use std::time::Duration;

use tokio::join;

use cxl_cache::accessor::BackingStore;
use cxl_pci::relay::ConnectionRelay;
use cxl_protocol::fifo::{CacheFifoPair, CxlConnection, MemoryFifoPair};
use cxl_protocol::packet::Bdf;
use cxl_protocol::{ComponentError, ComponentState};

use crate::coh_bridge::{CacheCoherencyBridge, CacheCoherencyBridgeConfig};
use crate::home_agent::{CohPolicy, HomeAgent, HomeAgentConfig};
use crate::io_bridge::IoBridge;
use crate::memory_controller::MemoryController;
use crate::HostError;

pub struct RootComplexConfig {
    pub host_name: String,
    pub root_bus: u8,
    pub mmio_base: u64,
    pub sys_mem_size: u64,
    pub sys_mem_backing: BackingStore,
    pub coh_policy: CohPolicy,
    pub mem_timeout: Duration,
    pub mmio_timeout: Duration,
    /// LLC <-> home agent.
    pub cache_to_home_agent: CacheFifoPair,
    pub home_agent_to_cache: CacheFifoPair,
    /// LLC <-> cache coherency bridge.
    pub cache_to_coh_bridge: CacheFifoPair,
    pub coh_bridge_to_cache: CacheFifoPair,
    /// Connection toward the switch (or directly toward a device).
    pub downstream: CxlConnection,
}

pub struct RootComplex {
    state: ComponentState,
    root_bus: u8,
    mmio_base: u64,
    root_port: ConnectionRelay,
    io_bridge: IoBridge,
    coh_bridge: CacheCoherencyBridge,
    home_agent: HomeAgent,
    memory_controller: MemoryController,
}

impl RootComplex {
    pub fn new(config: RootComplexConfig) -> Result<Self, HostError> {
        let upstream = CxlConnection::new();
        let root_port = ConnectionRelay::new(
            &upstream,
            &config.downstream,
            format!("{}:RootPort{}", config.host_name, config.root_bus),
        );

        let io_bridge = IoBridge::new(
            config.root_bus,
            upstream.cfg.clone(),
            upstream.mmio.clone(),
            config.mmio_timeout,
            config.host_name.clone(),
        );

        let io_to_home_agent = MemoryFifoPair::new();
        let coh_to_home_agent = MemoryFifoPair::new();
        let home_agent_to_memory = MemoryFifoPair::new();

        let coh_bridge = CacheCoherencyBridge::new(CacheCoherencyBridgeConfig {
            host_name: config.host_name.clone(),
            num_cache_devices: 1,
            upstream_cache: config.cache_to_coh_bridge,
            upstream_snoop: config.coh_bridge_to_cache,
            memory_producer: coh_to_home_agent.clone(),
            downstream: upstream.cxl_cache.clone(),
        });

        let home_agent = HomeAgent::new(HomeAgentConfig {
            host_name: config.host_name.clone(),
            coh_policy: config.coh_policy,
            mem_timeout: config.mem_timeout,
            upstream_cache: config.cache_to_home_agent,
            upstream_snoop: config.home_agent_to_cache,
            memory_consumer_io: io_to_home_agent,
            memory_consumer_coh: coh_to_home_agent,
            memory_producer: home_agent_to_memory.clone(),
            downstream: upstream.cxl_mem.clone(),
        });

        let memory_controller = MemoryController::new(
            home_agent_to_memory,
            config.sys_mem_backing.open(config.sys_mem_size)?,
            format!("{}:MemoryController", config.host_name),
        );

        Ok(RootComplex {
            state: ComponentState::new(),
            root_bus: config.root_bus,
            mmio_base: config.mmio_base,
            root_port,
            io_bridge,
            coh_bridge,
            home_agent,
            memory_controller,
        })
    }

    /// First bus behind the root port; enumeration starts here.
    pub fn enumeration_start_bus(&self) -> u8 {
        self.root_bus + 1
    }

    pub fn mmio_base(&self) -> u64 {
        self.mmio_base
    }

    pub fn set_cache_device_count(&self, count: usize) {
        self.coh_bridge.set_cache_device_count(count);
    }

    pub async fn read_config(&self, bdf: Bdf, offset: u16, size: usize) -> Result<u32, HostError> {
        self.io_bridge.read_config(bdf, offset, size).await
    }

    pub async fn write_config(
        &self,
        bdf: Bdf,
        offset: u16,
        size: usize,
        value: u32,
    ) -> Result<(), HostError> {
        self.io_bridge.write_config(bdf, offset, size, value).await
    }

    pub async fn read_mmio(&self, addr: u64, size: usize) -> Result<u64, HostError> {
        self.io_bridge.read_mmio(addr, size).await
    }

    pub async fn write_mmio(&self, addr: u64, size: usize, value: u64) -> Result<(), HostError> {
        self.io_bridge.write_mmio(addr, size, value).await
    }

    pub async fn run(&self) -> Result<(), HostError> {
        self.state.begin_run()?;
        self.state.set_running();
        let (root_port, io, coh, home, memory) = join!(
            self.root_port.run(),
            self.io_bridge.run(),
            self.coh_bridge.run(),
            self.home_agent.run(),
            self.memory_controller.run()
        );
        root_port?;
        io?;
        coh?;
        home?;
        memory?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), HostError> {
        self.state.begin_stop()?;
        self.root_port.stop().await?;
        self.io_bridge.stop().await?;
        self.coh_bridge.stop().await?;
        self.home_agent.stop().await?;
        self.memory_controller.stop().await?;
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
