//! Verbatim FIFO relays.
//!
//! A relay moves packets between two adjacent FIFO pairs without looking at
//! them: host-to-target traffic flows from the upstream pair into the
//! downstream pair, target-to-host the other way. A [`ConnectionRelay`]
//! binds all four traffic classes of two connections, which is what a
//! pass-through root port and the vPPB bind processors are made of.

use tokio::join;
use tracing::debug;

use cxl_protocol::fifo::{CxlConnection, FifoPair};
use cxl_protocol::{ComponentError, ComponentState};

pub struct FifoRelay<T> {
    upstream: FifoPair<T>,
    downstream: FifoPair<T>,
}

impl<T> FifoRelay<T> {
    pub fn new(upstream: FifoPair<T>, downstream: FifoPair<T>) -> Self {
        FifoRelay {
            upstream,
            downstream,
        }
    }

    pub async fn pump(&self) {
        let down = async {
            while let Some(packet) = self.upstream.host_to_target.recv().await {
                self.downstream.host_to_target.send(packet);
            }
        };
        let up = async {
            while let Some(packet) = self.downstream.target_to_host.recv().await {
                self.upstream.target_to_host.send(packet);
            }
        };
        join!(down, up);
    }

    pub fn shutdown(&self) {
        self.upstream.host_to_target.shutdown();
        self.downstream.target_to_host.shutdown();
    }
}

/// Relays all four traffic classes between two connections.
pub struct ConnectionRelay {
    state: ComponentState,
    cfg: FifoRelay<cxl_protocol::packet::CxlIoPacket>,
    mmio: FifoRelay<cxl_protocol::packet::CxlIoPacket>,
    cxl_mem: FifoRelay<cxl_protocol::packet::CxlMemPacket>,
    cxl_cache: FifoRelay<cxl_protocol::packet::CxlCachePacket>,
    label: String,
}

impl ConnectionRelay {
    pub fn new(
        upstream: &CxlConnection,
        downstream: &CxlConnection,
        label: impl Into<String>,
    ) -> Self {
        ConnectionRelay {
            state: ComponentState::new(),
            cfg: FifoRelay::new(upstream.cfg.clone(), downstream.cfg.clone()),
            mmio: FifoRelay::new(upstream.mmio.clone(), downstream.mmio.clone()),
            cxl_mem: FifoRelay::new(upstream.cxl_mem.clone(), downstream.cxl_mem.clone()),
            cxl_cache: FifoRelay::new(upstream.cxl_cache.clone(), downstream.cxl_cache.clone()),
            label: label.into(),
        }
    }

    pub async fn run(&self) -> Result<(), ComponentError> {
        self.state.begin_run()?;
        self.state.set_running();
        join!(
            self.cfg.pump(),
            self.mmio.pump(),
            self.cxl_mem.pump(),
            self.cxl_cache.pump()
        );
        debug!("[{}:Relay] stopped", self.label);
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), ComponentError> {
        self.state.begin_stop()?;
        self.cfg.shutdown();
        self.mmio.shutdown();
        self.cxl_mem.shutdown();
        self.cxl_cache.shutdown();
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
    use cxl_protocol::packet::{Bdf, CxlIoPacket};
    use std::sync::Arc;

    #[tokio::test]
    async fn relay_moves_packets_both_ways() {
        let upstream = CxlConnection::new();
        let downstream = CxlConnection::new();
        let relay = Arc::new(ConnectionRelay::new(&upstream, &downstream, "rp0"));
        let runner = relay.clone();
        let task = tokio::spawn(async move { runner.run().await });
        relay.wait_for_ready().await;

        let request = CxlIoPacket::cfg_rd(Bdf::new(1, 0, 0), 0, 2, false, 0, 1);
        upstream.cfg.host_to_target.send(request);
        assert_eq!(downstream.cfg.host_to_target.recv().await, Some(request));

        let completion = CxlIoPacket::cpl_d(0, 1, 0xABCD, 2);
        downstream.cfg.target_to_host.send(completion);
        assert_eq!(upstream.cfg.target_to_host.recv().await, Some(completion));

        relay.stop().await.unwrap();
        task.await.unwrap().unwrap();
    }
}
