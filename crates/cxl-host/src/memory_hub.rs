//! Memory hub: the CPU's window onto the host memory map.
//!
//! Owns the ordered memory-range map and dispatches loads/stores by address
//! class: DRAM and CXL-cached ranges go through the LLC, uncached CXL ranges
//! bypass it, MMIO goes to the IO bridge and CFG accesses are decoded into
//! configuration requests. The LLC only ever sees whole 64-byte lines; the
//! hub read-modify-writes the containing line for narrower accesses.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::join;
use tracing::debug;

use cxl_cache::accessor::BackingStore;
use cxl_cache::controller::{CacheController, CacheControllerConfig, MemAddrType, MemoryRange};
use cxl_protocol::fifo::{
    CacheFifoPair, CxlConnection, MemoryFifoPair, MemoryRequest, MemoryRequestOp,
    MemoryResponseStatus,
};
use cxl_protocol::packet::{Bdf, CacheLineData, CACHE_LINE_SIZE};
use cxl_protocol::ComponentState;

use crate::home_agent::CohPolicy;
use crate::root_complex::{RootComplex, RootComplexConfig};
use crate::HostError;

pub struct CxlMemoryHubConfig {
    pub host_name: String,
    pub root_bus: u8,
    pub mmio_base: u64,
    pub sys_mem_size: u64,
    pub sys_mem_backing: BackingStore,
    pub coh_policy: CohPolicy,
    pub mem_timeout: Duration,
    pub mmio_timeout: Duration,
    pub downstream: CxlConnection,
}

pub struct CxlMemoryHub {
    state: ComponentState,
    processor_fifo: MemoryFifoPair,
    llc: Arc<CacheController>,
    root_complex: Arc<RootComplex>,
    ranges: Mutex<Vec<MemoryRange>>,
    label: String,
}

impl CxlMemoryHub {
    pub fn new(config: CxlMemoryHubConfig) -> Result<Self, HostError> {
        let processor_fifo = MemoryFifoPair::new();
        let cache_to_home_agent = CacheFifoPair::new();
        let home_agent_to_cache = CacheFifoPair::new();
        let cache_to_coh_bridge = CacheFifoPair::new();
        let coh_bridge_to_cache = CacheFifoPair::new();

        let root_complex = Arc::new(RootComplex::new(RootComplexConfig {
            host_name: config.host_name.clone(),
            root_bus: config.root_bus,
            mmio_base: config.mmio_base,
            sys_mem_size: config.sys_mem_size,
            sys_mem_backing: config.sys_mem_backing,
            coh_policy: config.coh_policy,
            mem_timeout: config.mem_timeout,
            mmio_timeout: config.mmio_timeout,
            cache_to_home_agent: cache_to_home_agent.clone(),
            home_agent_to_cache: home_agent_to_cache.clone(),
            cache_to_coh_bridge: cache_to_coh_bridge.clone(),
            coh_bridge_to_cache: coh_bridge_to_cache.clone(),
            downstream: config.downstream,
        })?);

        let llc = Arc::new(CacheController::new(CacheControllerConfig {
            name: config.host_name.clone(),
            processor_fifo: Some(processor_fifo.clone()),
            cache_to_coh_agent: cache_to_home_agent,
            coh_agent_to_cache: home_agent_to_cache,
            cache_to_coh_bridge: Some(cache_to_coh_bridge),
            coh_bridge_to_cache: Some(coh_bridge_to_cache),
            num_assoc: 4,
            num_sets: 8,
        })?);

        Ok(CxlMemoryHub {
            state: ComponentState::new(),
            processor_fifo,
            llc,
            root_complex,
            ranges: Mutex::new(Vec::new()),
            label: config.host_name,
        })
    }

    pub fn root_complex(&self) -> &Arc<RootComplex> {
        &self.root_complex
    }

    pub fn add_mem_range(&self, base: u64, size: u64, addr_type: MemAddrType) {
        debug!(
            "[{}:MemoryHub] adding range 0x{base:x}+0x{size:x} {addr_type:?}",
            self.label
        );
        self.ranges.lock().unwrap().push(MemoryRange {
            base,
            size,
            addr_type,
        });
        self.llc.add_mem_range(base, size, addr_type);
    }

    fn addr_type(&self, addr: u64) -> MemAddrType {
        self.ranges
            .lock()
            .unwrap()
            .iter()
            .find(|range| range.contains(addr))
            .map(|range| range.addr_type)
            .unwrap_or(MemAddrType::Oob)
    }

    fn cfg_addr_to_bdf(addr: u64) -> (Bdf, u16) {
        let bus = (addr >> 20) as u8;
        let device = (addr >> 15 & 0x1F) as u8;
        let function = (addr >> 12 & 0x7) as u8;
        (Bdf::new(bus, device, function), (addr & 0xFFF) as u16)
    }

    async fn cached_line(&self, line_addr: u64, uncached: bool) -> Result<CacheLineData, HostError> {
        let op = if uncached {
            MemoryRequestOp::UncachedRead
        } else {
            MemoryRequestOp::Read
        };
        self.processor_fifo.request.send(MemoryRequest {
            op,
            addr: line_addr,
            size: CACHE_LINE_SIZE,
            data: CacheLineData::zeroed(),
        });
        match self.processor_fifo.response.recv().await {
            Some(response) if response.status == MemoryResponseStatus::Ok => Ok(response.data),
            _ => Err(HostError::OutOfBounds(line_addr)),
        }
    }

    async fn store_cached_line(
        &self,
        line_addr: u64,
        data: CacheLineData,
        uncached: bool,
    ) -> Result<(), HostError> {
        let op = if uncached {
            MemoryRequestOp::UncachedWrite
        } else {
            MemoryRequestOp::Write
        };
        self.processor_fifo.request.send(MemoryRequest {
            op,
            addr: line_addr,
            size: CACHE_LINE_SIZE,
            data,
        });
        match self.processor_fifo.response.recv().await {
            Some(response) if response.status == MemoryResponseStatus::Ok => Ok(()),
            _ => Err(HostError::OutOfBounds(line_addr)),
        }
    }

    /// Loads one full line from a cacheable (or uncached CXL) range.
    pub async fn load_line(&self, addr: u64) -> Result<CacheLineData, HostError> {
        let uncached = self.addr_type(addr) == MemAddrType::CxlUncached;
        self.cached_line(addr & !(CACHE_LINE_SIZE as u64 - 1), uncached)
            .await
    }

    pub async fn store_line(&self, addr: u64, data: CacheLineData) -> Result<(), HostError> {
        let uncached = self.addr_type(addr) == MemAddrType::CxlUncached;
        self.store_cached_line(addr & !(CACHE_LINE_SIZE as u64 - 1), data, uncached)
            .await
    }

    pub async fn load(&self, addr: u64, size: usize) -> Result<u64, HostError> {
        match self.addr_type(addr) {
            MemAddrType::Dram
            | MemAddrType::CxlCached
            | MemAddrType::CxlCachedBi
            | MemAddrType::CxlUncached => {
                let line = self.load_line(addr).await?;
                let offset = (addr as usize) % CACHE_LINE_SIZE;
                let mut bytes = [0u8; 8];
                let take = size.min(8).min(CACHE_LINE_SIZE - offset);
                bytes[..take].copy_from_slice(&line.0[offset..offset + take]);
                Ok(u64::from_le_bytes(bytes))
            }
            MemAddrType::Mmio => self.root_complex.read_mmio(addr, size).await,
            MemAddrType::Cfg => {
                let (bdf, offset) = Self::cfg_addr_to_bdf(addr);
                Ok(u64::from(self.root_complex.read_config(bdf, offset, size).await?))
            }
            MemAddrType::Oob => Err(HostError::OutOfBounds(addr)),
        }
    }

    pub async fn store(&self, addr: u64, size: usize, value: u64) -> Result<(), HostError> {
        match self.addr_type(addr) {
            MemAddrType::Dram
            | MemAddrType::CxlCached
            | MemAddrType::CxlCachedBi
            | MemAddrType::CxlUncached => {
                let uncached = self.addr_type(addr) == MemAddrType::CxlUncached;
                let line_addr = addr & !(CACHE_LINE_SIZE as u64 - 1);
                let offset = (addr as usize) % CACHE_LINE_SIZE;
                if size == CACHE_LINE_SIZE && offset == 0 {
                    return self
                        .store_cached_line(line_addr, CacheLineData::from_u64(value), uncached)
                        .await;
                }
                // Narrow store: read-modify-write the containing line.
                let mut line = self.cached_line(line_addr, uncached).await?;
                let take = size.min(8).min(CACHE_LINE_SIZE - offset);
                line.0[offset..offset + take].copy_from_slice(&value.to_le_bytes()[..take]);
                self.store_cached_line(line_addr, line, uncached).await
            }
            MemAddrType::Mmio => self.root_complex.write_mmio(addr, size, value).await,
            MemAddrType::Cfg => {
                let (bdf, offset) = Self::cfg_addr_to_bdf(addr);
                self.root_complex
                    .write_config(bdf, offset, size, value as u32)
                    .await
            }
            MemAddrType::Oob => Err(HostError::OutOfBounds(addr)),
        }
    }

    pub async fn run(&self) -> Result<(), HostError> {
        self.state.begin_run()?;
        self.state.set_running();
        let (llc, root_complex) = join!(self.llc.run(), self.root_complex.run());
        llc?;
        root_complex?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), HostError> {
        self.state.begin_stop()?;
        self.llc.stop().await?;
        self.root_complex.stop().await?;
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
