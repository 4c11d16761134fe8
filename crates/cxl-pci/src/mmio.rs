//! MMIO manager actor.
//!
//! Dispatches inbound MMIO requests to the BAR-mapped register blocks of its
//! function. Bridge instances additionally forward requests that fall inside
//! their `[memory_base, memory_limit]` window to the downstream FIFO.
//! Out-of-bound reads complete with zero data; out-of-bound writes are
//! dropped with a log line. MMIO writes are posted (no completion).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::join;
use tracing::{debug, warn};

use cxl_protocol::fifo::FifoPair;
use cxl_protocol::packet::{CxlIoPacket, MmioRequest};
use cxl_protocol::{ComponentError, ComponentState};
use cxl_regs::component::ComponentRegisterBlock;

#[derive(Clone)]
pub enum MmioBackend {
    /// CXL component register block with live capability state.
    Component(Arc<ComponentRegisterBlock>),
    /// Plain byte memory.
    Bytes(Arc<Mutex<Vec<u8>>>),
}

impl MmioBackend {
    pub fn bytes(size: usize) -> Self {
        MmioBackend::Bytes(Arc::new(Mutex::new(vec![0; size])))
    }

    fn read(&self, offset: u64, size: usize) -> u64 {
        match self {
            MmioBackend::Component(block) => block.read(offset, size),
            MmioBackend::Bytes(bytes) => {
                let bytes = bytes.lock().unwrap();
                let mut value = 0u64;
                for i in (0..size.min(8)).rev() {
                    let byte = bytes.get(offset as usize + i).copied().unwrap_or(0);
                    value = value << 8 | u64::from(byte);
                }
                value
            }
        }
    }

    fn write(&self, offset: u64, size: usize, value: u64) {
        match self {
            MmioBackend::Component(block) => block.write(offset, size, value),
            MmioBackend::Bytes(bytes) => {
                let mut bytes = bytes.lock().unwrap();
                let le = value.to_le_bytes();
                for i in 0..size.min(8) {
                    if let Some(byte) = bytes.get_mut(offset as usize + i) {
                        *byte = le[i];
                    }
                }
            }
        }
    }
}

pub struct BarEntry {
    pub backend: MmioBackend,
    pub size: u64,
}

struct BarSlot {
    entry: BarEntry,
    base: AtomicU64,
}

/// BAR bases and the bridge forwarding window, shared between the config
/// space (which programs them) and the MMIO dispatch loop.
pub struct MmioState {
    bars: Vec<BarSlot>,
    window_base: AtomicU64,
    window_limit: AtomicU64,
}

impl MmioState {
    pub fn new(bars: Vec<BarEntry>) -> Arc<Self> {
        Arc::new(MmioState {
            bars: bars
                .into_iter()
                .map(|entry| BarSlot {
                    entry,
                    base: AtomicU64::new(0),
                })
                .collect(),
            window_base: AtomicU64::new(0),
            window_limit: AtomicU64::new(0),
        })
    }

    pub fn bar_size(&self, index: usize) -> u64 {
        self.bars.get(index).map(|slot| slot.entry.size).unwrap_or(0)
    }

    pub fn set_bar_base(&self, index: usize, base: u64) {
        if let Some(slot) = self.bars.get(index) {
            slot.base.store(base, Ordering::SeqCst);
        }
    }

    pub fn set_window_base(&self, base: u64) {
        self.window_base.store(base, Ordering::SeqCst);
    }

    pub fn set_window_limit(&self, limit: u64) {
        self.window_limit.store(limit, Ordering::SeqCst);
    }

    fn lookup(&self, addr: u64, size: usize) -> Option<(&MmioBackend, u64)> {
        for slot in &self.bars {
            let base = slot.base.load(Ordering::SeqCst);
            if base == 0 || slot.entry.size == 0 {
                continue;
            }
            let end = addr + size as u64 - 1;
            if addr >= base && end < base + slot.entry.size {
                return Some((&slot.entry.backend, addr - base));
            }
        }
        None
    }

    fn window_contains(&self, addr: u64, size: usize) -> bool {
        let base = self.window_base.load(Ordering::SeqCst);
        let limit = self.window_limit.load(Ordering::SeqCst);
        limit != 0 && addr >= base && addr + size as u64 - 1 <= limit
    }
}

/// Config-space hooks of a non-bridge function: BAR writes reposition the
/// MMIO decode windows, nothing else routes.
pub struct EndpointMmioHooks {
    pub mmio: Arc<MmioState>,
}

impl cxl_regs::config_space::ConfigSpaceHooks for EndpointMmioHooks {
    fn bar_changed(&self, index: usize, base: u64, _size: u64) {
        self.mmio.set_bar_base(index, base);
    }
}

pub struct MmioManager {
    state_machine: ComponentState,
    state: Arc<MmioState>,
    upstream: FifoPair<CxlIoPacket>,
    downstream: Option<FifoPair<CxlIoPacket>>,
    label: String,
}

impl MmioManager {
    pub fn new(
        state: Arc<MmioState>,
        upstream: FifoPair<CxlIoPacket>,
        downstream: Option<FifoPair<CxlIoPacket>>,
        label: impl Into<String>,
    ) -> Self {
        MmioManager {
            state_machine: ComponentState::new(),
            state,
            upstream,
            downstream,
            label: label.into(),
        }
    }

    pub fn state(&self) -> &Arc<MmioState> {
        &self.state
    }

    async fn handle_request(&self, request: MmioRequest, is_read: bool) {
        let addr = request.addr;
        let size = usize::from(request.size);

        if let Some((backend, offset)) = self.state.lookup(addr, size) {
            if is_read {
                let data = backend.read(offset, size);
                debug!("[{}:Mmio] RD 0x{addr:x}[{size}] = 0x{data:x}", self.label);
                self.upstream
                    .target_to_host
                    .send(CxlIoPacket::cpl_d(request.req_id, request.tag, data, request.size));
            } else if let Some(value) = request.value {
                debug!("[{}:Mmio] WR 0x{addr:x}[{size}] = 0x{value:x}", self.label);
                backend.write(offset, size, value);
            }
            return;
        }

        if let Some(downstream) = &self.downstream {
            if self.state.window_contains(addr, size) {
                let packet = if is_read {
                    CxlIoPacket::MemRd(request)
                } else {
                    CxlIoPacket::MemWr(request)
                };
                downstream.host_to_target.send(packet);
                return;
            }
        }

        if is_read {
            debug!("[{}:Mmio] RD 0x{addr:x}[{size}] OOB", self.label);
            self.upstream
                .target_to_host
                .send(CxlIoPacket::cpl_d(request.req_id, request.tag, 0, request.size));
        } else {
            debug!("[{}:Mmio] WR 0x{addr:x}[{size}] OOB, dropped", self.label);
        }
    }

    async fn process_host_to_target(&self) {
        while let Some(packet) = self.upstream.host_to_target.recv().await {
            match packet {
                CxlIoPacket::MemRd(request) => self.handle_request(request, true).await,
                CxlIoPacket::MemWr(request) => self.handle_request(request, false).await,
                other => {
                    warn!("[{}:Mmio] unexpected packet {other:?}, dropped", self.label);
                }
            }
        }
        debug!("[{}:Mmio] host-to-target loop stopped", self.label);
    }

    async fn process_target_to_host(&self) {
        let Some(downstream) = &self.downstream else {
            return;
        };
        while let Some(packet) = downstream.target_to_host.recv().await {
            self.upstream.target_to_host.send(packet);
        }
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state_machine.begin_run()?;
        self.state_machine.set_running();
        join!(self.process_host_to_target(), self.process_target_to_host());
        self.state_machine.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state_machine.begin_stop()?;
        self.upstream.host_to_target.shutdown();
        if let Some(downstream) = &self.downstream {
            downstream.target_to_host.shutdown();
        }
        self.state_machine.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state_machine.wait_for_ready().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bar_dispatch_and_oob_semantics() {
        let state = MmioState::new(vec![BarEntry {
            backend: MmioBackend::bytes(0x1000),
            size: 0x1000,
        }]);
        state.set_bar_base(0, 0xFE00_0000);

        let upstream = FifoPair::new();
        let manager = Arc::new(MmioManager::new(state, upstream.clone(), None, "ep"));
        let runner = manager.clone();
        let task = tokio::spawn(async move { runner.run().await });
        manager.wait_for_ready().await;

        // In-BAR write then read back.
        upstream
            .host_to_target
            .send(CxlIoPacket::mem_wr(0xFE00_0020, 4, 0xDEAD_BEEF, 0, 1));
        upstream
            .host_to_target
            .send(CxlIoPacket::mem_rd(0xFE00_0020, 4, 0, 2));
        let response = upstream.target_to_host.recv().await.unwrap();
        assert_eq!(response, CxlIoPacket::cpl_d(0, 2, 0xDEAD_BEEF, 4));

        // OOB read completes with zero.
        upstream
            .host_to_target
            .send(CxlIoPacket::mem_rd(0xFD00_0000, 4, 0, 3));
        let response = upstream.target_to_host.recv().await.unwrap();
        assert_eq!(response, CxlIoPacket::cpl_d(0, 3, 0, 4));

        manager.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn bridge_forwards_window_hits_downstream() {
        let state = MmioState::new(vec![]);
        state.set_window_base(0xFE10_0000);
        state.set_window_limit(0xFE1F_FFFF);

        let upstream = FifoPair::new();
        let downstream = FifoPair::new();
        let manager = Arc::new(MmioManager::new(
            state,
            upstream.clone(),
            Some(downstream.clone()),
            "usp",
        ));
        let runner = manager.clone();
        let task = tokio::spawn(async move { runner.run().await });
        manager.wait_for_ready().await;

        let request = CxlIoPacket::mem_rd(0xFE10_0040, 4, 0, 9);
        upstream.host_to_target.send(request);
        assert_eq!(downstream.host_to_target.recv().await, Some(request));

        // Return path is a straight relay.
        downstream
            .target_to_host
            .send(CxlIoPacket::cpl_d(0, 9, 0x77, 4));
        assert_eq!(
            upstream.target_to_host.recv().await,
            Some(CxlIoPacket::cpl_d(0, 9, 0x77, 4))
        );

        manager.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
