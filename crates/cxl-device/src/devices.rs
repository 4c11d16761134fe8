//! Endpoint devices: Type 3 (memory), Type 1 (cache-only accelerator) and
//! Type 2 (cache + memory).
//!
//! Each device owns its config-space and MMIO manager actors, the DCOHs its
//! type calls for, and (for cache-bearing types) a device LLC plus a
//! processor surrogate. The device's BAR0 exposes the CXL component register
//! block; the DVSEC chain advertises the device's capabilities and memory
//! ranges exactly as the enumeration drivers expect to find them.

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::join;

use cxl_cache::accessor::{AccessorError, MemoryAccessor};
use cxl_cache::controller::{CacheController, CacheControllerConfig, CacheError, MemAddrType};
use cxl_pci::cfg_space::{ConfigSpaceManager, PciDeviceKind};
use cxl_pci::mmio::{BarEntry, EndpointMmioHooks, MmioBackend, MmioManager, MmioState};
use cxl_protocol::fifo::{CacheFifoPair, CxlConnection, MemoryFifoPair};
use cxl_protocol::{ComponentError, ComponentState};
use cxl_regs::component::{
    BiDecoder, ComponentRegisterBlock, ComponentRegisterConfig, HdmBackend,
};
use cxl_regs::config_space::{ConfigSpaceBuilder, RegisterLocatorBlock};
use cxl_regs::identity::{DvsecDeviceType, PciIdentity, SLD_DID, TYPE1_DID, TYPE2_DID};

use crate::cache_dcoh::CxlCacheDcoh;
use crate::llc_iogen::DeviceLlcIoGen;
use crate::mem_dcoh::{CxlMemDcoh, DcohLlcLink};
use crate::memory_device::{CxlMemoryDeviceComponent, MemoryDeviceIdentity};

const COMPONENT_BAR_SIZE: u64 = 0x10000;
const DEVICE_DECODER_COUNT: usize = 4;

#[derive(Debug, Error)]
pub enum DeviceError {
    #[error(transparent)]
    Accessor(#[from] AccessorError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Component(#[from] ComponentError),
}

/// Where a device's memory lives.
pub use cxl_cache::accessor::BackingStore as MemoryBacking;

fn component_bar(block: Arc<ComponentRegisterBlock>) -> (Arc<MmioState>, Vec<RegisterLocatorBlock>) {
    let state = MmioState::new(vec![BarEntry {
        backend: MmioBackend::Component(block),
        size: COMPONENT_BAR_SIZE,
    }]);
    let locator = vec![RegisterLocatorBlock {
        bir: 0,
        block_id: 0x01,
        offset: 0,
    }];
    (state, locator)
}

/// Type 3 memory expander (single logical device).
pub struct CxlType3Device {
    state: ComponentState,
    cfg_manager: ConfigSpaceManager,
    mmio_manager: MmioManager,
    mem_dcoh: CxlMemDcoh,
    mem_component: Arc<CxlMemoryDeviceComponent>,
}

impl CxlType3Device {
    pub fn new(
        transport: &CxlConnection,
        memory_size: u64,
        backing: MemoryBacking,
        device_id: u8,
        label: impl Into<String>,
    ) -> Result<Self, DeviceError> {
        Self::with_pci_device_id(transport, memory_size, backing, device_id, SLD_DID, label)
    }

    /// Same function with a caller-chosen PCI device ID, so the logical
    /// devices of an MLD identify as MLD rather than SLD.
    pub(crate) fn with_pci_device_id(
        transport: &CxlConnection,
        memory_size: u64,
        backing: MemoryBacking,
        device_id: u8,
        pci_device_id: u16,
        label: impl Into<String>,
    ) -> Result<Self, DeviceError> {
        let label = label.into();
        let accessor = backing.open(memory_size)?;
        let mem_component = CxlMemoryDeviceComponent::new(
            MemoryDeviceIdentity::new("CXL-EMU-1.0", memory_size),
            DEVICE_DECODER_COUNT,
            accessor,
            label.clone(),
        );

        let block = ComponentRegisterBlock::new(
            ComponentRegisterConfig {
                hdm: Some(HdmBackend::Device(mem_component.hdm_decoder_manager().clone())),
                bi_rt: None,
                bi_decoder: Some(BiDecoder::new(false)),
                cache_rt: None,
            },
            label.clone(),
        );
        let (mmio_state, locator) = component_bar(block);

        let config_space = ConfigSpaceBuilder::endpoint(PciIdentity::memory_device(pci_device_id))
            .bar(0, COMPONENT_BAR_SIZE)
            .cxl_device_dvsec(DvsecDeviceType::Ld, false, true, [memory_size, 0])
            .register_locator(locator)
            .build(Arc::new(EndpointMmioHooks {
                mmio: mmio_state.clone(),
            }));

        let cfg_manager = ConfigSpaceManager::new(
            Arc::new(Mutex::new(config_space)),
            transport.cfg.clone(),
            None,
            PciDeviceKind::Endpoint,
            label.clone(),
        );
        let mmio_manager = MmioManager::new(mmio_state, transport.mmio.clone(), None, label.clone());
        let mem_dcoh = CxlMemDcoh::new(
            None,
            transport.cxl_mem.clone(),
            mem_component.clone(),
            device_id,
            label,
        );

        Ok(CxlType3Device {
            state: ComponentState::new(),
            cfg_manager,
            mmio_manager,
            mem_dcoh,
            mem_component,
        })
    }

    pub fn memory_component(&self) -> &Arc<CxlMemoryDeviceComponent> {
        &self.mem_component
    }

    pub async fn run(&self) -> Result<(), DeviceError> {
        self.state.begin_run()?;
        self.state.set_running();
        let (cfg, mmio, mem) = join!(
            self.cfg_manager.run(),
            self.mmio_manager.run(),
            self.mem_dcoh.run()
        );
        cfg?;
        mmio?;
        mem?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        self.state.begin_stop()?;
        let (cfg, mmio, mem) = join!(
            self.cfg_manager.stop(),
            self.mmio_manager.stop(),
            self.mem_dcoh.stop()
        );
        cfg?;
        mmio?;
        mem?;
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}

/// Type 1 cache-only accelerator.
pub struct CxlType1Device {
    state: ComponentState,
    cfg_manager: ConfigSpaceManager,
    mmio_manager: MmioManager,
    cache_dcoh: CxlCacheDcoh,
    llc: CacheController,
    iogen: DeviceLlcIoGen,
}

impl CxlType1Device {
    pub fn new(
        transport: &CxlConnection,
        cache_id: u8,
        label: impl Into<String>,
    ) -> Result<Self, DeviceError> {
        let label = label.into();

        // The accelerator still exposes a component block; its HDM capability
        // is present but never programmed (no device memory).
        let placeholder_mem = CxlMemoryDeviceComponent::new(
            MemoryDeviceIdentity::new("CXL-EMU-1.0", 0),
            1,
            MemoryAccessor::anonymous(0),
            label.clone(),
        );
        let block = ComponentRegisterBlock::new(
            ComponentRegisterConfig {
                hdm: Some(HdmBackend::Device(placeholder_mem.hdm_decoder_manager().clone())),
                bi_rt: None,
                bi_decoder: None,
                cache_rt: None,
            },
            label.clone(),
        );
        let (mmio_state, locator) = component_bar(block);

        let identity = PciIdentity::endpoint(TYPE1_DID, 0x12, 0x00, 0x00);
        let config_space = ConfigSpaceBuilder::endpoint(identity)
            .bar(0, COMPONENT_BAR_SIZE)
            .cxl_device_dvsec(DvsecDeviceType::AccelT1, true, false, [0, 0])
            .register_locator(locator)
            .build(Arc::new(EndpointMmioHooks {
                mmio: mmio_state.clone(),
            }));

        let cfg_manager = ConfigSpaceManager::new(
            Arc::new(Mutex::new(config_space)),
            transport.cfg.clone(),
            None,
            PciDeviceKind::Endpoint,
            label.clone(),
        );
        let mmio_manager = MmioManager::new(mmio_state, transport.mmio.clone(), None, label.clone());

        let processor_fifo = MemoryFifoPair::new();
        let cache_to_coh_agent = CacheFifoPair::new();
        let coh_agent_to_cache = CacheFifoPair::new();

        let llc = CacheController::new(CacheControllerConfig::device_side(
            label.clone(),
            processor_fifo.clone(),
            cache_to_coh_agent.clone(),
            coh_agent_to_cache.clone(),
        ))?;
        let cache_dcoh = CxlCacheDcoh::new(
            DcohLlcLink {
                requests_in: cache_to_coh_agent,
                snoops_out: coh_agent_to_cache,
            },
            transport.cxl_cache.clone(),
            cache_id,
            label.clone(),
        );
        let iogen = DeviceLlcIoGen::new(label, processor_fifo);

        Ok(CxlType1Device {
            state: ComponentState::new(),
            cfg_manager,
            mmio_manager,
            cache_dcoh,
            llc,
            iogen,
        })
    }

    /// The accelerator's compute side.
    pub fn processor(&self) -> &DeviceLlcIoGen {
        &self.iogen
    }

    pub async fn run(&self) -> Result<(), DeviceError> {
        self.state.begin_run()?;
        self.state.set_running();
        let (cfg, mmio, cache, llc) = join!(
            self.cfg_manager.run(),
            self.mmio_manager.run(),
            self.cache_dcoh.run(),
            self.llc.run()
        );
        cfg?;
        mmio?;
        cache?;
        llc?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        self.state.begin_stop()?;
        let (cfg, mmio, cache, llc) = join!(
            self.cfg_manager.stop(),
            self.mmio_manager.stop(),
            self.cache_dcoh.stop(),
            self.llc.stop()
        );
        cfg?;
        mmio?;
        cache?;
        llc?;
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}

/// Type 2 accelerator with device memory.
pub struct CxlType2Device {
    state: ComponentState,
    cfg_manager: ConfigSpaceManager,
    mmio_manager: MmioManager,
    mem_dcoh: CxlMemDcoh,
    cache_dcoh: CxlCacheDcoh,
    llc: Arc<CacheController>,
    iogen: DeviceLlcIoGen,
    mem_component: Arc<CxlMemoryDeviceComponent>,
}

impl CxlType2Device {
    pub fn new(
        transport: &CxlConnection,
        memory_size: u64,
        backing: MemoryBacking,
        device_id: u8,
        label: impl Into<String>,
    ) -> Result<Self, DeviceError> {
        let label = label.into();
        let accessor = backing.open(memory_size)?;
        let mem_component = CxlMemoryDeviceComponent::new(
            MemoryDeviceIdentity::new("CXL-EMU-1.0", memory_size),
            DEVICE_DECODER_COUNT,
            accessor,
            label.clone(),
        );

        let block = ComponentRegisterBlock::new(
            ComponentRegisterConfig {
                hdm: Some(HdmBackend::Device(mem_component.hdm_decoder_manager().clone())),
                bi_rt: None,
                bi_decoder: Some(BiDecoder::new(false)),
                cache_rt: None,
            },
            label.clone(),
        );
        let (mmio_state, locator) = component_bar(block);

        let config_space = ConfigSpaceBuilder::endpoint(PciIdentity::memory_device(TYPE2_DID))
            .bar(0, COMPONENT_BAR_SIZE)
            .cxl_device_dvsec(DvsecDeviceType::AccelT2, true, true, [memory_size, 0])
            .register_locator(locator)
            .build(Arc::new(EndpointMmioHooks {
                mmio: mmio_state.clone(),
            }));

        let cfg_manager = ConfigSpaceManager::new(
            Arc::new(Mutex::new(config_space)),
            transport.cfg.clone(),
            None,
            PciDeviceKind::Endpoint,
            label.clone(),
        );
        let mmio_manager = MmioManager::new(mmio_state, transport.mmio.clone(), None, label.clone());

        // The device LLC caches both device memory (kept coherent with the
        // host through CXL.mem back-invalidation) and host memory (through
        // CXL.cache). The two paths hang off the LLC's two coherency ports,
        // selected by address range.
        let processor_fifo = MemoryFifoPair::new();
        let to_mem_dcoh = CacheFifoPair::new();
        let mem_dcoh_snoops = CacheFifoPair::new();
        let to_cache_dcoh = CacheFifoPair::new();
        let cache_dcoh_snoops = CacheFifoPair::new();

        let llc = Arc::new(CacheController::new(CacheControllerConfig {
            name: label.clone(),
            processor_fifo: Some(processor_fifo.clone()),
            cache_to_coh_agent: to_mem_dcoh.clone(),
            coh_agent_to_cache: mem_dcoh_snoops.clone(),
            cache_to_coh_bridge: Some(to_cache_dcoh.clone()),
            coh_bridge_to_cache: Some(cache_dcoh_snoops.clone()),
            num_assoc: 4,
            num_sets: 8,
        })?);
        // Device-local memory is device-biased; everything routed as DRAM
        // goes out over CXL.cache.
        llc.add_mem_range(0, memory_size, MemAddrType::CxlCachedBi);

        let mem_dcoh = CxlMemDcoh::new(
            Some(DcohLlcLink {
                requests_in: to_mem_dcoh,
                snoops_out: mem_dcoh_snoops,
            }),
            transport.cxl_mem.clone(),
            mem_component.clone(),
            device_id,
            label.clone(),
        );
        let cache_dcoh = CxlCacheDcoh::new(
            DcohLlcLink {
                requests_in: to_cache_dcoh,
                snoops_out: cache_dcoh_snoops,
            },
            transport.cxl_cache.clone(),
            device_id,
            label.clone(),
        );
        let iogen = DeviceLlcIoGen::new(label, processor_fifo);

        Ok(CxlType2Device {
            state: ComponentState::new(),
            cfg_manager,
            mmio_manager,
            mem_dcoh,
            cache_dcoh,
            llc,
            iogen,
            mem_component,
        })
    }

    pub fn memory_component(&self) -> &Arc<CxlMemoryDeviceComponent> {
        &self.mem_component
    }

    pub fn processor(&self) -> &DeviceLlcIoGen {
        &self.iogen
    }

    /// Declares the host-memory window the accelerator may cache over
    /// CXL.cache.
    pub fn add_host_mem_range(&self, base: u64, size: u64) {
        self.llc.add_mem_range(base, size, MemAddrType::Dram);
    }

    pub async fn run(&self) -> Result<(), DeviceError> {
        self.state.begin_run()?;
        self.state.set_running();
        let (cfg, mmio, mem, cache, llc) = join!(
            self.cfg_manager.run(),
            self.mmio_manager.run(),
            self.mem_dcoh.run(),
            self.cache_dcoh.run(),
            self.llc.run()
        );
        cfg?;
        mmio?;
        mem?;
        cache?;
        llc?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        self.state.begin_stop()?;
        let (cfg, mmio, mem, cache, llc) = join!(
            self.cfg_manager.stop(),
            self.mmio_manager.stop(),
            self.mem_dcoh.stop(),
            self.cache_dcoh.stop(),
            self.llc.stop()
        );
        cfg?;
        mmio?;
        mem?;
        cache?;
        llc?;
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
