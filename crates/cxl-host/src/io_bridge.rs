//! IO bridge: the host's CFG and MMIO initiator.
//!
//! Requests carry a rolling 8-bit tag from the bridge's allocator; the
//! response pumps pair completions back to their waiters by tag, so
//! interleaved completions resolve to the right caller. Unsupported-request
//! completions surface as all-ones reads, the way absent devices look on
//! real hardware. Waits are bounded; a missing completion surfaces a timeout
//! error rather than deadlocking the fabric.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::join;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use cxl_protocol::fifo::FifoPair;
use cxl_protocol::packet::{Bdf, CxlIoPacket};
use cxl_protocol::{ComponentError, ComponentState};

use crate::HostError;

pub const DEFAULT_MMIO_TIMEOUT: Duration = Duration::from_secs(10);

pub struct IoBridge {
    state: ComponentState,
    root_bus: u8,
    cfg: FifoPair<CxlIoPacket>,
    mmio: FifoPair<CxlIoPacket>,
    next_tag: Mutex<u8>,
    pending_cfg: Mutex<HashMap<u8, oneshot::Sender<CxlIoPacket>>>,
    pending_mmio: Mutex<HashMap<u8, oneshot::Sender<CxlIoPacket>>>,
    timeout: Duration,
    label: String,
}

impl IoBridge {
    pub fn new(
        root_bus: u8,
        cfg: FifoPair<CxlIoPacket>,
        mmio: FifoPair<CxlIoPacket>,
        timeout: Duration,
        label: impl Into<String>,
    ) -> Self {
        IoBridge {
            state: ComponentState::new(),
            root_bus,
            cfg,
            mmio,
            next_tag: Mutex::new(0),
            pending_cfg: Mutex::new(HashMap::new()),
            pending_mmio: Mutex::new(HashMap::new()),
            timeout,
            label: label.into(),
        }
    }

    fn alloc_tag(&self) -> u8 {
        let mut tag = self.next_tag.lock().unwrap();
        *tag = tag.wrapping_add(1);
        *tag
    }

    fn secondary_bus(&self) -> u8 {
        self.root_bus + 1
    }

    async fn await_completion(
        &self,
        pending: &Mutex<HashMap<u8, oneshot::Sender<CxlIoPacket>>>,
        tag: u8,
        addr_for_error: u64,
    ) -> Result<CxlIoPacket, HostError> {
        let (tx, rx) = oneshot::channel();
        pending.lock().unwrap().insert(tag, tx);
        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(packet)) => Ok(packet),
            _ => {
                pending.lock().unwrap().remove(&tag);
                warn!("[{}:IoBridge] completion for tag {tag} timed out", self.label);
                Err(HostError::Timeout(addr_for_error))
            }
        }
    }

    pub async fn read_config(&self, bdf: Bdf, offset: u16, size: usize) -> Result<u32, HostError> {
        debug_assert!(offset as usize + size <= (offset as usize / 4 + 1) * 4);
        let bit_mask = if size >= 4 {
            0xFFFF_FFFF
        } else {
            (1u32 << (size * 8)) - 1
        };
        if bdf.bus() == self.root_bus {
            return Err(HostError::RootBusAccess);
        }
        let type0 = bdf.bus() == self.secondary_bus();
        if type0 && bdf.device() != 0 {
            // Non-ARI: only device 0 exists on a link.
            return Ok(0xFFFF_FFFF & bit_mask);
        }

        let tag = self.alloc_tag();
        self.cfg
            .host_to_target
            .send(CxlIoPacket::cfg_rd(bdf, offset, size as u8, type0, 0, tag));
        let packet = self
            .await_completion(&self.pending_cfg, tag, u64::from(offset))
            .await?;

        match packet {
            CxlIoPacket::CplD(cpl) => {
                let value = cpl.data as u32 & bit_mask;
                debug!(
                    "[{}:IoBridge] [{bdf}] CFG RD @ 0x{offset:x}[{size}B] = 0x{value:x}",
                    self.label
                );
                Ok(value)
            }
            other => {
                debug!(
                    "[{}:IoBridge] [{bdf}] CFG RD @ 0x{offset:x}[{size}B] unsuccessful: {other:?}",
                    self.label
                );
                Ok(0xFFFF_FFFF & bit_mask)
            }
        }
    }

    pub async fn write_config(
        &self,
        bdf: Bdf,
        offset: u16,
        size: usize,
        value: u32,
    ) -> Result<(), HostError> {
        if bdf.bus() == self.root_bus {
            return Err(HostError::RootBusAccess);
        }
        let type0 = bdf.bus() == self.secondary_bus();
        if type0 && bdf.device() != 0 {
            return Ok(());
        }

        let tag = self.alloc_tag();
        self.cfg.host_to_target.send(CxlIoPacket::cfg_wr(
            bdf, offset, size as u8, value, type0, 0, tag,
        ));
        let packet = self
            .await_completion(&self.pending_cfg, tag, u64::from(offset))
            .await?;
        if !packet.is_successful_completion() {
            debug!(
                "[{}:IoBridge] [{bdf}] CFG WR @ 0x{offset:x}[{size}B] unsuccessful",
                self.label
            );
        }
        Ok(())
    }

    pub async fn read_mmio(&self, addr: u64, size: usize) -> Result<u64, HostError> {
        let tag = self.alloc_tag();
        self.mmio
            .host_to_target
            .send(CxlIoPacket::mem_rd(addr, size as u8, 0, tag));
        let packet = self.await_completion(&self.pending_mmio, tag, addr).await?;
        match packet {
            CxlIoPacket::CplD(cpl) => Ok(cpl.data),
            _ => Ok(0),
        }
    }

    /// MMIO writes are posted.
    pub async fn write_mmio(&self, addr: u64, size: usize, value: u64) -> Result<(), HostError> {
        let tag = self.alloc_tag();
        self.mmio
            .host_to_target
            .send(CxlIoPacket::mem_wr(addr, size as u8, value, 0, tag));
        Ok(())
    }

    async fn pump_completions(
        &self,
        fifo: &FifoPair<CxlIoPacket>,
        pending: &Mutex<HashMap<u8, oneshot::Sender<CxlIoPacket>>>,
        what: &str,
    ) {
        while let Some(packet) = fifo.target_to_host.recv().await {
            if !packet.is_completion() {
                warn!(
                    "[{}:IoBridge] unexpected {what} packet {packet:?}, dropped",
                    self.label
                );
                continue;
            }
            let (_, tag) = packet.req_tag();
            match pending.lock().unwrap().remove(&tag) {
                Some(waiter) => {
                    let _ = waiter.send(packet);
                }
                None => {
                    warn!(
                        "[{}:IoBridge] {what} completion with unknown tag {tag}, dropped",
                        self.label
                    );
                }
            }
        }
        debug!("[{}:IoBridge] {what} completion pump stopped", self.label);
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        join!(
            self.pump_completions(&self.cfg, &self.pending_cfg, "CFG"),
            self.pump_completions(&self.mmio, &self.pending_mmio, "MMIO")
        );
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.cfg.target_to_host.shutdown();
        self.mmio.target_to_host.shutdown();
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
