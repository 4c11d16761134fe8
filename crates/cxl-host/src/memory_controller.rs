//! System memory controller: serves the home agent's DRAM requests from the
//! backing store.

use cxl_cache::accessor::MemoryAccessor;
use cxl_protocol::fifo::{MemoryFifoPair, MemoryRequestOp, MemoryResponse};
use cxl_protocol::packet::CacheLineData;
use cxl_protocol::{ComponentError, ComponentState};
use tracing::{debug, warn};

pub struct MemoryController {
    state: ComponentState,
    consumer: MemoryFifoPair,
    accessor: MemoryAccessor,
    label: String,
}

impl MemoryController {
    pub fn new(
        consumer: MemoryFifoPair,
        accessor: MemoryAccessor,
        label: impl Into<String>,
    ) -> Self {
        MemoryController {
            state: ComponentState::new(),
            consumer,
            accessor,
            label: label.into(),
        }
    }

    async fn process_requests(&self) {
        while let Some(request) = self.consumer.request.recv().await {
            let size = request.size.min(64);
            let response = match request.op {
                MemoryRequestOp::Write | MemoryRequestOp::UncachedWrite => {
                    match self.accessor.write(request.addr, &request.data.0[..size]) {
                        Ok(()) => MemoryResponse::ok(),
                        Err(error) => {
                            warn!("[{}] write 0x{:x} failed: {error}", self.label, request.addr);
                            MemoryResponse::failed()
                        }
                    }
                }
                MemoryRequestOp::Read | MemoryRequestOp::UncachedRead => {
                    let mut line = CacheLineData::zeroed();
                    match self.accessor.read(request.addr, &mut line.0[..size]) {
                        Ok(()) => MemoryResponse::ok_with_data(line),
                        Err(error) => {
                            warn!("[{}] read 0x{:x} failed: {error}", self.label, request.addr);
                            MemoryResponse::failed()
                        }
                    }
                }
            };
            self.consumer.response.send(response);
        }
        debug!("[{}] memory controller stopped", self.label);
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        self.process_requests().await;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.consumer.request.shutdown();
        self.state.wait_for_stopped().await;
        Ok(())
    }

    pub async fn wait_for_ready(&self) {
        self.state.wait_for_ready().await;
    }
}
