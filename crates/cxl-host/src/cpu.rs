//! CPU: issues loads and stores against the memory hub.
//!
//! Word-sized accesses go straight through; larger transfers are split into
//! line-sized chunks, which is also the alignment contract the hub enforces
//! for bulk data.

use std::sync::Arc;

use cxl_protocol::packet::{CacheLineData, CACHE_LINE_SIZE};

use crate::memory_hub::CxlMemoryHub;
use crate::HostError;

pub struct Cpu {
    hub: Arc<CxlMemoryHub>,
}

impl Cpu {
    pub fn new(hub: Arc<CxlMemoryHub>) -> Arc<Self> {
        Arc::new(Cpu { hub })
    }

    pub fn hub(&self) -> &Arc<CxlMemoryHub> {
        &self.hub
    }

    pub async fn load(&self, addr: u64, size: usize) -> Result<u64, HostError> {
        self.hub.load(addr, size).await
    }

    pub async fn store(&self, addr: u64, size: usize, value: u64) -> Result<(), HostError> {
        self.hub.store(addr, size, value).await
    }

    /// Bulk read; `addr` and the buffer length must be line-aligned.
    pub async fn load_bytes(&self, addr: u64, buf: &mut [u8]) -> Result<(), HostError> {
        if addr % CACHE_LINE_SIZE as u64 != 0 || buf.len() % CACHE_LINE_SIZE != 0 {
            return Err(HostError::Misaligned);
        }
        for (index, chunk) in buf.chunks_mut(CACHE_LINE_SIZE).enumerate() {
            let line = self
                .hub
                .load_line(addr + (index * CACHE_LINE_SIZE) as u64)
                .await?;
            chunk.copy_from_slice(&line.0);
        }
        Ok(())
    }

    /// Bulk write; `addr` and the buffer length must be line-aligned.
    pub async fn store_bytes(&self, addr: u64, data: &[u8]) -> Result<(), HostError> {
        if addr % CACHE_LINE_SIZE as u64 != 0 || data.len() % CACHE_LINE_SIZE != 0 {
            return Err(HostError::Misaligned);
        }
        for (index, chunk) in data.chunks(CACHE_LINE_SIZE).enumerate() {
            let mut line = CacheLineData::zeroed();
            line.0.copy_from_slice(chunk);
            self.hub
                .store_line(addr + (index * CACHE_LINE_SIZE) as u64, line)
                .await?;
        }
        Ok(())
    }
}
