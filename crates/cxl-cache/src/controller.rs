//! MESI-like set-associative last-level cache.
//!
//! The controller serves loads and stores from a local processor over a
//! memory FIFO, and answers snoops from the coherency engines over cache
//! FIFOs. Host-side instances route misses by address class: DRAM lines go
//! to the cache coherency bridge, CXL-cached lines to the coherency agent
//! (home agent). Device-side instances have a single coherency agent FIFO.
//!
//! Invariants: a Modified line is unique across the coherence domain; Shared
//! lines may be replicated but never alongside a Modified copy; invalidation
//! drops the line without data. Eviction picks the minimum-priority way of
//! the set, where priority is a per-set monotone counter bumped on every hit
//! and install.

use std::sync::Mutex;

use thiserror::Error;
use tokio::join;
use tracing::{debug, warn};

use cxl_protocol::fifo::{
    CacheFifoPair, CacheRequest, CacheRequestOp, CacheResponse, CacheResponseStatus,
    MemoryFifoPair, MemoryRequestOp, MemoryResponse, MemoryResponseStatus,
};
use cxl_protocol::packet::{CacheLineData, CACHE_LINE_SIZE};
use cxl_protocol::{ComponentError, ComponentState};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache geometry must be a power of two (assoc {assoc}, sets {sets})")]
    BadGeometry { assoc: usize, sets: usize },
    #[error(transparent)]
    Component(#[from] ComponentError),
}

/// Address classes of the host memory map.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemAddrType {
    Dram,
    Cfg,
    Mmio,
    CxlCached,
    CxlCachedBi,
    CxlUncached,
    Oob,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRange {
    pub base: u64,
    pub size: u64,
    pub addr_type: MemAddrType,
}

impl MemoryRange {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.size
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheState {
    Invalid,
    Shared,
    Exclusive,
    Modified,
}

#[derive(Clone, Copy)]
struct CacheBlock {
    state: CacheState,
    tag: u64,
    priority: u64,
    data: CacheLineData,
}

impl CacheBlock {
    fn invalid() -> Self {
        CacheBlock {
            state: CacheState::Invalid,
            tag: 0,
            priority: 0,
            data: CacheLineData::zeroed(),
        }
    }
}

struct CacheArray {
    sets: Vec<Vec<CacheBlock>>,
    set_counters: Vec<u64>,
    set_bits: u32,
    assoc: usize,
}

const BLK_BITS: u32 = CACHE_LINE_SIZE.trailing_zeros();

impl CacheArray {
    fn new(assoc: usize, num_sets: usize) -> Self {
        CacheArray {
            sets: vec![vec![CacheBlock::invalid(); assoc]; num_sets],
            set_counters: vec![0; num_sets],
            set_bits: num_sets.trailing_zeros(),
            assoc,
        }
    }

    fn extract_tag(&self, addr: u64) -> u64 {
        addr >> (self.set_bits + BLK_BITS)
    }

    fn extract_set(&self, addr: u64) -> usize {
        ((addr >> BLK_BITS) & ((1 << self.set_bits) - 1)) as usize
    }

    fn assemble_addr(&self, set: usize, way: usize) -> u64 {
        let block = &self.sets[set][way];
        debug_assert_ne!(block.state, CacheState::Invalid);
        block.tag << (self.set_bits + BLK_BITS) | (set as u64) << BLK_BITS
    }

    fn bump_priority(&mut self, set: usize, way: usize) {
        self.sets[set][way].priority = self.set_counters[set];
        self.set_counters[set] += 1;
    }

    fn find_valid(&self, tag: u64, set: usize) -> Option<usize> {
        self.sets[set]
            .iter()
            .position(|b| b.state != CacheState::Invalid && b.tag == tag)
    }

    fn find_invalid(&self, set: usize) -> Option<usize> {
        self.sets[set]
            .iter()
            .position(|b| b.state == CacheState::Invalid)
    }

    fn find_victim(&self, set: usize) -> usize {
        let mut min_way = 0;
        for way in 1..self.assoc {
            if self.sets[set][way].priority < self.sets[set][min_way].priority {
                min_way = way;
            }
        }
        min_way
    }

    fn state(&self, set: usize, way: usize) -> CacheState {
        self.sets[set][way].state
    }

    fn set_state(&mut self, tag: u64, set: usize, way: usize, state: CacheState) {
        if state != CacheState::Invalid {
            self.bump_priority(set, way);
        }
        self.sets[set][way].tag = tag;
        self.sets[set][way].state = state;
    }

    fn read_data(&mut self, set: usize, way: usize) -> CacheLineData {
        self.bump_priority(set, way);
        self.sets[set][way].data
    }

    fn write_data(&mut self, set: usize, way: usize, data: CacheLineData) {
        self.bump_priority(set, way);
        self.sets[set][way].data = data;
    }
}

pub struct CacheControllerConfig {
    pub name: String,
    /// Present on cache controllers with a local processor.
    pub processor_fifo: Option<MemoryFifoPair>,
    pub cache_to_coh_agent: CacheFifoPair,
    pub coh_agent_to_cache: CacheFifoPair,
    /// Host-side only: the DRAM coherency path.
    pub cache_to_coh_bridge: Option<CacheFifoPair>,
    pub coh_bridge_to_cache: Option<CacheFifoPair>,
    pub num_assoc: usize,
    pub num_sets: usize,
}

impl CacheControllerConfig {
    pub fn device_side(
        name: impl Into<String>,
        processor_fifo: MemoryFifoPair,
        cache_to_coh_agent: CacheFifoPair,
        coh_agent_to_cache: CacheFifoPair,
    ) -> Self {
        CacheControllerConfig {
            name: name.into(),
            processor_fifo: Some(processor_fifo),
            cache_to_coh_agent,
            coh_agent_to_cache,
            cache_to_coh_bridge: None,
            coh_bridge_to_cache: None,
            num_assoc: 4,
            num_sets: 8,
        }
    }
}

pub struct CacheController {
    name: String,
    state: ComponentState,
    cache: Mutex<CacheArray>,
    memory_ranges: Mutex<Vec<MemoryRange>>,
    processor_fifo: Option<MemoryFifoPair>,
    cache_to_coh_agent: CacheFifoPair,
    coh_agent_to_cache: CacheFifoPair,
    cache_to_coh_bridge: Option<CacheFifoPair>,
    coh_bridge_to_cache: Option<CacheFifoPair>,
}

impl CacheController {
    pub fn new(config: CacheControllerConfig) -> Result<Self, CacheError> {
        if !config.num_assoc.is_power_of_two() || !config.num_sets.is_power_of_two() {
            return Err(CacheError::BadGeometry {
                assoc: config.num_assoc,
                sets: config.num_sets,
            });
        }
        debug!("[{}:CacheController] LLC created", config.name);
        Ok(CacheController {
            name: config.name,
            state: ComponentState::new(),
            cache: Mutex::new(CacheArray::new(config.num_assoc, config.num_sets)),
            memory_ranges: Mutex::new(Vec::new()),
            processor_fifo: config.processor_fifo,
            cache_to_coh_agent: config.cache_to_coh_agent,
            coh_agent_to_cache: config.coh_agent_to_cache,
            cache_to_coh_bridge: config.cache_to_coh_bridge,
            coh_bridge_to_cache: config.coh_bridge_to_cache,
        })
    }

    pub fn add_mem_range(&self, base: u64, size: u64, addr_type: MemAddrType) {
        debug!(
            "[{}:CacheController] adding range 0x{base:x}+0x{size:x} {addr_type:?}",
            self.name
        );
        self.memory_ranges.lock().unwrap().push(MemoryRange {
            base,
            size,
            addr_type,
        });
    }

    pub fn mem_addr_type(&self, addr: u64) -> MemAddrType {
        self.memory_ranges
            .lock()
            .unwrap()
            .iter()
            .find(|range| range.contains(addr))
            .map(|range| range.addr_type)
            .unwrap_or(MemAddrType::Oob)
    }

    fn is_device_side(&self) -> bool {
        self.cache_to_coh_bridge.is_none()
    }

    /// FIFO that owns coherency for `addr` on the fill/writeback path.
    fn coherency_fifo(&self, addr: u64) -> &CacheFifoPair {
        if self.is_device_side() {
            return &self.cache_to_coh_agent;
        }
        match self.mem_addr_type(addr) {
            MemAddrType::Dram => self.cache_to_coh_bridge.as_ref().unwrap(),
            MemAddrType::CxlCached | MemAddrType::CxlCachedBi => &self.cache_to_coh_agent,
            other => {
                warn!(
                    "[{}:CacheController] 0x{addr:x} ({other:?}) is not cacheable",
                    self.name
                );
                &self.cache_to_coh_agent
            }
        }
    }

    async fn memory_load(&self, addr: u64) -> CacheResponse {
        let fifo = self.coherency_fifo(addr);
        fifo.request
            .send(CacheRequest::new(CacheRequestOp::SnpData, addr));
        fifo.response
            .recv()
            .await
            .unwrap_or(CacheResponse::new(CacheResponseStatus::Failed))
    }

    async fn memory_store(&self, addr: u64, data: CacheLineData) {
        let fifo = self.coherency_fifo(addr);
        fifo.request
            .send(CacheRequest::with_data(CacheRequestOp::WriteBack, addr, data));
        let _ = fifo.response.recv().await;
    }

    /// Upstream invalidation before taking ownership of a line.
    async fn invalidate_upstream(&self, addr: u64) {
        let fifo = if self.is_device_side() {
            &self.cache_to_coh_agent
        } else {
            match self.mem_addr_type(addr) {
                MemAddrType::Dram => self.cache_to_coh_bridge.as_ref().unwrap(),
                MemAddrType::CxlCachedBi => &self.cache_to_coh_agent,
                // HDM-H memory has no device-side coherency to resolve.
                _ => return,
            }
        };
        fifo.request
            .send(CacheRequest::new(CacheRequestOp::SnpInv, addr));
        if let Some(response) = fifo.response.recv().await {
            debug_assert_eq!(response.status, CacheResponseStatus::RspI);
        }
    }

    fn fill_state(response: &CacheResponse) -> CacheState {
        match response.status {
            CacheResponseStatus::Ok => CacheState::Exclusive,
            CacheResponseStatus::RspS => CacheState::Shared,
            CacheResponseStatus::RspI => CacheState::Exclusive,
            CacheResponseStatus::RspV => CacheState::Invalid,
            other => {
                warn!("unexpected fill response {other:?}, treating as bypass");
                CacheState::Invalid
            }
        }
    }

    /// Evicts a way if the set is full. Returns the way to fill.
    async fn make_room(&self, set: usize) -> usize {
        let victim = {
            let cache = self.cache.lock().unwrap();
            match cache.find_invalid(set) {
                Some(way) => return way,
                None => cache.find_victim(set),
            }
        };
        let (victim_addr, victim_data) = {
            let mut cache = self.cache.lock().unwrap();
            let addr = cache.assemble_addr(set, victim);
            let data = cache.read_data(set, victim);
            (addr, data)
        };
        // Flush the victim before reusing the way.
        self.memory_store(victim_addr, victim_data).await;
        let mut cache = self.cache.lock().unwrap();
        cache.set_state(0, set, victim, CacheState::Invalid);
        victim
    }

    /// Coherent 64-byte load.
    pub async fn cache_coherent_load(&self, addr: u64) -> CacheLineData {
        let (tag, set) = {
            let cache = self.cache.lock().unwrap();
            (cache.extract_tag(addr), cache.extract_set(addr))
        };

        let hit = {
            let mut cache = self.cache.lock().unwrap();
            cache.find_valid(tag, set).map(|way| cache.read_data(set, way))
        };
        if let Some(data) = hit {
            return data;
        }

        let way = self.make_room(set).await;
        let response = self.memory_load(addr).await;
        let data = response.data;

        let fill_state = Self::fill_state(&response);
        if fill_state == CacheState::Invalid {
            // Bypass: the line stays uncached here.
            return data;
        }

        let mut cache = self.cache.lock().unwrap();
        cache.set_state(tag, set, way, fill_state);
        cache.write_data(set, way, data);
        data
    }

    /// Coherent 64-byte store.
    pub async fn cache_coherent_store(&self, addr: u64, data: CacheLineData) {
        let (tag, set) = {
            let cache = self.cache.lock().unwrap();
            (cache.extract_tag(addr), cache.extract_set(addr))
        };

        let hit_state = {
            let cache = self.cache.lock().unwrap();
            cache.find_valid(tag, set).map(|way| (way, cache.state(set, way)))
        };

        if let Some((way, state)) = hit_state {
            if state == CacheState::Shared {
                // Could be truly shared; take ownership first.
                self.invalidate_upstream(addr).await;
            }
            let mut cache = self.cache.lock().unwrap();
            cache.set_state(tag, set, way, CacheState::Modified);
            cache.write_data(set, way, data);
            return;
        }

        let way = self.make_room(set).await;
        self.invalidate_upstream(addr).await;
        let mut cache = self.cache.lock().unwrap();
        cache.set_state(tag, set, way, CacheState::Modified);
        cache.write_data(set, way, data);
    }

    async fn uncached_load(&self, addr: u64) -> CacheLineData {
        self.cache_to_coh_agent
            .request
            .send(CacheRequest::new(CacheRequestOp::UncachedRead, addr));
        self.cache_to_coh_agent
            .response
            .recv()
            .await
            .map(|response| response.data)
            .unwrap_or_default()
    }

    async fn uncached_store(&self, addr: u64, data: CacheLineData) {
        self.cache_to_coh_agent
            .request
            .send(CacheRequest::with_data(CacheRequestOp::UncachedWrite, addr, data));
        let _ = self.cache_to_coh_agent.response.recv().await;
    }

    /// Applies an inbound snoop to the local cache, returning the response
    /// the coherency engine forwards upstream.
    fn snoop(&self, op: CacheRequestOp, addr: u64) -> CacheResponse {
        let mut cache = self.cache.lock().unwrap();
        let tag = cache.extract_tag(addr);
        let set = cache.extract_set(addr);

        let Some(way) = cache.find_valid(tag, set) else {
            return CacheResponse::new(CacheResponseStatus::RspMiss);
        };
        let data = cache.read_data(set, way);
        match op {
            CacheRequestOp::SnpData => {
                cache.set_state(tag, set, way, CacheState::Shared);
                CacheResponse::with_data(CacheResponseStatus::RspS, data)
            }
            CacheRequestOp::SnpInv => {
                cache.set_state(tag, set, way, CacheState::Invalid);
                CacheResponse::with_data(CacheResponseStatus::RspI, data)
            }
            CacheRequestOp::SnpCur => CacheResponse::with_data(CacheResponseStatus::RspV, data),
            CacheRequestOp::WriteBack => {
                CacheResponse::with_data(CacheResponseStatus::RspV, data)
            }
            other => {
                warn!(
                    "[{}:CacheController] unexpected snoop op {other:?}, dropping",
                    self.name
                );
                CacheResponse::new(CacheResponseStatus::Failed)
            }
        }
    }

    async fn processor_loop(&self) {
        let Some(fifo) = &self.processor_fifo else {
            return;
        };
        while let Some(request) = fifo.request.recv().await {
            if request.size != CACHE_LINE_SIZE
                && matches!(request.op, MemoryRequestOp::Read | MemoryRequestOp::Write)
            {
                warn!(
                    "[{}:CacheController] cached access must be a full line, got {}",
                    self.name, request.size
                );
                fifo.response.send(MemoryResponse::failed());
                continue;
            }
            let response = match request.op {
                MemoryRequestOp::Read => {
                    MemoryResponse::ok_with_data(self.cache_coherent_load(request.addr).await)
                }
                MemoryRequestOp::Write => {
                    self.cache_coherent_store(request.addr, request.data).await;
                    MemoryResponse::ok()
                }
                MemoryRequestOp::UncachedRead => {
                    MemoryResponse::ok_with_data(self.uncached_load(request.addr).await)
                }
                MemoryRequestOp::UncachedWrite => {
                    self.uncached_store(request.addr, request.data).await;
                    MemoryResponse::ok()
                }
            };
            fifo.response.send(response);
        }
        debug!("[{}:CacheController] processor loop stopped", self.name);
    }

    async fn snoop_loop(&self, fifo: &CacheFifoPair) {
        while let Some(request) = fifo.request.recv().await {
            let response = self.snoop(request.op, request.addr);
            fifo.response.send(response);
        }
        debug!("[{}:CacheController] snoop loop stopped", self.name);
    }

    pub async fn run(&self) -> Result<(), CacheError> {
        self.state.begin_run()?;
        self.state.set_running();
        let bridge_loop = async {
            if let Some(fifo) = &self.coh_bridge_to_cache {
                self.snoop_loop(fifo).await;
            }
        };
        join!(
            self.processor_loop(),
            self.snoop_loop(&self.coh_agent_to_cache),
            bridge_loop
        );
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), CacheError> {
        self.state.begin_stop()?;
        if let Some(fifo) = &self.processor_fifo {
            fifo.request.shutdown();
        }
        self.coh_agent_to_cache.request.shutdown();
        if let Some(fifo) = &self.coh_bridge_to_cache {
            fifo.request.shutdown();
        }
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cxl_protocol::fifo::MemoryRequest;
    use std::sync::Arc;

    struct Harness {
        controller: Arc<CacheController>,
        processor: MemoryFifoPair,
        coh_agent: CacheFifoPair,
        snoop_in: CacheFifoPair,
    }

    fn device_harness() -> Harness {
        let processor = MemoryFifoPair::new();
        let coh_agent = CacheFifoPair::new();
        let snoop_in = CacheFifoPair::new();
        let controller = Arc::new(
            CacheController::new(CacheControllerConfig::device_side(
                "dev0",
                processor.clone(),
                coh_agent.clone(),
                snoop_in.clone(),
            ))
            .unwrap(),
        );
        Harness {
            controller,
            processor,
            coh_agent,
            snoop_in,
        }
    }

    /// Backstop coherency agent: grants everything exclusively, remembers
    /// written-back lines.
    async fn run_backing_agent(fifo: CacheFifoPair, backing: Arc<Mutex<Vec<(u64, u64)>>>) {
        while let Some(request) = fifo.request.recv().await {
            let response = match request.op {
                CacheRequestOp::SnpData => {
                    let stored = backing
                        .lock()
                        .unwrap()
                        .iter()
                        .rev()
                        .find(|(addr, _)| *addr == request.addr)
                        .map(|(_, value)| *value)
                        .unwrap_or(0);
                    CacheResponse::with_data(CacheResponseStatus::Ok, CacheLineData::from_u64(stored))
                }
                CacheRequestOp::SnpInv => CacheResponse::new(CacheResponseStatus::RspI),
                CacheRequestOp::WriteBack => {
                    backing
                        .lock()
                        .unwrap()
                        .push((request.addr, request.data.as_u64()));
                    CacheResponse::new(CacheResponseStatus::Ok)
                }
                _ => CacheResponse::new(CacheResponseStatus::Ok),
            };
            fifo.response.send(response);
        }
    }

    #[tokio::test]
    async fn store_then_load_hits_locally() {
        let harness = device_harness();
        let backing = Arc::new(Mutex::new(Vec::new()));
        let agent = tokio::spawn(run_backing_agent(harness.coh_agent.clone(), backing.clone()));
        let controller = harness.controller.clone();
        let run = tokio::spawn(async move { controller.run().await });
        harness.controller.wait_for_ready().await;

        harness
            .processor
            .request
            .send(MemoryRequest::write(0x40, 64, CacheLineData::from_u64(0xAB)));
        assert_eq!(
            harness.processor.response.recv().await.unwrap().status,
            MemoryResponseStatus::Ok
        );
        harness.processor.request.send(MemoryRequest::read(0x40, 64));
        let response = harness.processor.response.recv().await.unwrap();
        assert_eq!(response.data.as_u64(), 0xAB);

        harness.controller.stop().await.unwrap();
        run.await.unwrap().unwrap();
        agent.abort();
    }

    #[tokio::test]
    async fn eviction_writes_back_the_victim() {
        let harness = device_harness();
        let backing = Arc::new(Mutex::new(Vec::new()));
        let agent = tokio::spawn(run_backing_agent(harness.coh_agent.clone(), backing.clone()));
        let controller = harness.controller.clone();
        let run = tokio::spawn(async move { controller.run().await });
        harness.controller.wait_for_ready().await;

        // Default geometry: 8 sets * 64B blocks, so addresses 0x200 apart
        // share a set. Five distinct tags overflow a 4-way set.
        for i in 0..5u64 {
            let addr = i * 0x200;
            harness
                .processor
                .request
                .send(MemoryRequest::write(addr, 64, CacheLineData::from_u64(i + 1)));
            harness.processor.response.recv().await.unwrap();
        }
        let evicted = backing.lock().unwrap().clone();
        assert_eq!(evicted, vec![(0x0, 1)]);

        // The evicted line is still readable through the coherency agent.
        harness.processor.request.send(MemoryRequest::read(0x0, 64));
        let response = harness.processor.response.recv().await.unwrap();
        assert_eq!(response.data.as_u64(), 1);

        harness.controller.stop().await.unwrap();
        run.await.unwrap().unwrap();
        agent.abort();
    }

    #[tokio::test]
    async fn snoops_degrade_and_invalidate_lines() {
        let harness = device_harness();
        let backing = Arc::new(Mutex::new(Vec::new()));
        let agent = tokio::spawn(run_backing_agent(harness.coh_agent.clone(), backing.clone()));
        let controller = harness.controller.clone();
        let run = tokio::spawn(async move { controller.run().await });
        harness.controller.wait_for_ready().await;

        harness
            .processor
            .request
            .send(MemoryRequest::write(0x80, 64, CacheLineData::from_u64(0x42)));
        harness.processor.response.recv().await.unwrap();

        // SnpData on a Modified line: data forwarded, line degraded to S.
        harness
            .snoop_in
            .request
            .send(CacheRequest::new(CacheRequestOp::SnpData, 0x80));
        let response = harness.snoop_in.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspS);
        assert_eq!(response.data.as_u64(), 0x42);

        // SnpInv drops the line entirely.
        harness
            .snoop_in
            .request
            .send(CacheRequest::new(CacheRequestOp::SnpInv, 0x80));
        let response = harness.snoop_in.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspI);

        // A further snoop misses.
        harness
            .snoop_in
            .request
            .send(CacheRequest::new(CacheRequestOp::SnpCur, 0x80));
        let response = harness.snoop_in.response.recv().await.unwrap();
        assert_eq!(response.status, CacheResponseStatus::RspMiss);

        harness.controller.stop().await.unwrap();
        run.await.unwrap().unwrap();
        agent.abort();
    }

    #[test]
    fn geometry_must_be_power_of_two() {
        let processor = MemoryFifoPair::new();
        let coh_agent = CacheFifoPair::new();
        let snoop_in = CacheFifoPair::new();
        let mut config = CacheControllerConfig::device_side("bad", processor, coh_agent, snoop_in);
        config.num_assoc = 3;
        assert!(matches!(
            CacheController::new(config),
            Err(CacheError::BadGeometry { .. })
        ));
    }
}
