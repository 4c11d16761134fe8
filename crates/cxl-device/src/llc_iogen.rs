//! Device-side processor surrogate.
//!
//! Issues loads and stores into the device LLC over the processor memory
//! FIFO, the way an accelerator core would. Type 1 and Type 2 devices expose
//! this as their compute side; tests drive it directly.

use tracing::debug;

use cxl_protocol::fifo::{MemoryFifoPair, MemoryRequest, MemoryResponseStatus};
use cxl_protocol::packet::{CacheLineData, CACHE_LINE_SIZE};

pub struct DeviceLlcIoGen {
    name: String,
    processor_fifo: MemoryFifoPair,
}

impl DeviceLlcIoGen {
    pub fn new(name: impl Into<String>, processor_fifo: MemoryFifoPair) -> Self {
        DeviceLlcIoGen {
            name: name.into(),
            processor_fifo,
        }
    }

    pub async fn load(&self, addr: u64) -> CacheLineData {
        self.processor_fifo
            .request
            .send(MemoryRequest::read(addr, CACHE_LINE_SIZE));
        match self.processor_fifo.response.recv().await {
            Some(response) if response.status == MemoryResponseStatus::Ok => response.data,
            _ => CacheLineData::zeroed(),
        }
    }

    pub async fn store(&self, addr: u64, data: CacheLineData) {
        self.processor_fifo
            .request
            .send(MemoryRequest::write(addr, CACHE_LINE_SIZE, data));
        let _ = self.processor_fifo.response.recv().await;
        debug!("[{}] stored line at 0x{addr:x}", self.name);
    }
}
