//! Multi-logical device: one physical port presenting N logical devices.
//!
//! The wrapper owns one Type 3 instance per LD and a router that fans the
//! single LD-ID-tagged transport out to the per-LD connections. CFG, MMIO
//! and CXL.mem requests carry the LD-ID in their headers; BI and CXL.cache
//! traffic is pinned to LD 0. Per-LD capacity allocations are queryable and
//! settable through the FM API.

use std::sync::Mutex;

use futures::future::join_all;
use tokio::join;
use tracing::{debug, warn};

use cxl_protocol::fifo::CxlConnection;
use cxl_protocol::packet::CxlMemPacket;
use cxl_protocol::{ComponentError, ComponentState};
use cxl_regs::identity::MLD_DID;

use crate::devices::{CxlType3Device, DeviceError, MemoryBacking};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LdInfo {
    pub memory_size: u64,
    pub ld_count: u16,
}

pub struct MultiLogicalDevice {
    state: ComponentState,
    transport: CxlConnection,
    ld_connections: Vec<CxlConnection>,
    lds: Vec<CxlType3Device>,
    allocations: Mutex<Vec<u64>>,
    total_capacity: u64,
    label: String,
}

impl MultiLogicalDevice {
    pub fn new(
        transport: &CxlConnection,
        ld_count: usize,
        memory_size_per_ld: u64,
        backing: impl Fn(usize) -> MemoryBacking,
        label: impl Into<String>,
    ) -> Result<Self, DeviceError> {
        let label = label.into();
        let mut ld_connections = Vec::with_capacity(ld_count);
        let mut lds = Vec::with_capacity(ld_count);
        for ld in 0..ld_count {
            let connection = CxlConnection::new();
            let device = CxlType3Device::with_pci_device_id(
                &connection,
                memory_size_per_ld,
                backing(ld),
                ld as u8,
                MLD_DID,
                format!("{label}:LD{ld}"),
            )?;
            ld_connections.push(connection);
            lds.push(device);
        }
        Ok(MultiLogicalDevice {
            state: ComponentState::new(),
            transport: transport.clone(),
            ld_connections,
            lds,
            allocations: Mutex::new(vec![memory_size_per_ld; ld_count]),
            total_capacity: memory_size_per_ld * ld_count as u64,
            label,
        })
    }

    pub fn ld_count(&self) -> usize {
        self.lds.len()
    }

    pub fn get_ld_info(&self) -> LdInfo {
        LdInfo {
            memory_size: self.total_capacity,
            ld_count: self.lds.len() as u16,
        }
    }

    pub fn get_ld_allocations(&self) -> Vec<u64> {
        self.allocations.lock().unwrap().clone()
    }

    /// Updates the allocation list. Entries beyond the LD count are ignored;
    /// the total may not exceed the device capacity.
    pub fn set_ld_allocations(&self, requested: &[u64]) -> Vec<u64> {
        let mut allocations = self.allocations.lock().unwrap();
        let count = allocations.len().min(requested.len());
        let total: u64 = requested[..count].iter().sum();
        if total > self.total_capacity {
            warn!(
                "[{}] allocation request 0x{total:x} exceeds capacity 0x{:x}",
                self.label, self.total_capacity
            );
            return allocations.clone();
        }
        allocations[..count].copy_from_slice(&requested[..count]);
        allocations.clone()
    }

    fn ld_index(&self, ld_id: u8) -> Option<usize> {
        let index = usize::from(ld_id);
        if index < self.ld_connections.len() {
            Some(index)
        } else {
            warn!("[{}] packet for unknown LD {ld_id}, dropped", self.label);
            None
        }
    }

    async fn route_downstream(&self) {
        let cfg = async {
            while let Some(packet) = self.transport.cfg.host_to_target.recv().await {
                if let Some(ld) = self.ld_index(packet.ld_id()) {
                    self.ld_connections[ld].cfg.host_to_target.send(packet);
                }
            }
            for connection in &self.ld_connections {
                connection.cfg.host_to_target.shutdown();
            }
        };
        let mmio = async {
            while let Some(packet) = self.transport.mmio.host_to_target.recv().await {
                if let Some(ld) = self.ld_index(packet.ld_id()) {
                    self.ld_connections[ld].mmio.host_to_target.send(packet);
                }
            }
            for connection in &self.ld_connections {
                connection.mmio.host_to_target.shutdown();
            }
        };
        let mem = async {
            while let Some(packet) = self.transport.cxl_mem.host_to_target.recv().await {
                let ld_id = match &packet {
                    CxlMemPacket::M2SReq(req) => req.ld_id,
                    CxlMemPacket::M2SRwD(rwd) => rwd.ld_id,
                    // BI responses carry no LD-ID.
                    CxlMemPacket::M2SBIRsp(_) => 0,
                    other => {
                        warn!("[{}] unexpected CXL.mem packet {other:?}", self.label);
                        continue;
                    }
                };
                if let Some(ld) = self.ld_index(ld_id) {
                    self.ld_connections[ld].cxl_mem.host_to_target.send(packet);
                }
            }
            for connection in &self.ld_connections {
                connection.cxl_mem.host_to_target.shutdown();
            }
        };
        join!(cfg, mmio, mem);
        debug!("[{}] downstream router stopped", self.label);
    }

    async fn route_upstream(&self) {
        let mut pumps = Vec::new();
        for (ld, connection) in self.ld_connections.iter().enumerate() {
            let ld_id = ld as u8;
            let cfg = connection.cfg.target_to_host.clone();
            let cfg_out = self.transport.cfg.target_to_host.clone();
            pumps.push(Box::pin(async move {
                while let Some(mut packet) = cfg.recv().await {
                    packet.set_ld_id(ld_id);
                    cfg_out.send(packet);
                }
            }) as futures::future::BoxFuture<'_, ()>);

            let mmio = connection.mmio.target_to_host.clone();
            let mmio_out = self.transport.mmio.target_to_host.clone();
            pumps.push(Box::pin(async move {
                while let Some(mut packet) = mmio.recv().await {
                    packet.set_ld_id(ld_id);
                    mmio_out.send(packet);
                }
            }));

            let mem = connection.cxl_mem.target_to_host.clone();
            let mem_out = self.transport.cxl_mem.target_to_host.clone();
            pumps.push(Box::pin(async move {
                while let Some(mut packet) = mem.recv().await {
                    match &mut packet {
                        CxlMemPacket::S2MNdr(ndr) => ndr.ld_id = ld_id,
                        CxlMemPacket::S2MDrs(drs) => drs.ld_id = ld_id,
                        CxlMemPacket::S2MBISnp(_) => {}
                        _ => {}
                    }
                    mem_out.send(packet);
                }
            }));
        }
        join_all(pumps).await;
        debug!("[{}] upstream router stopped", self.label);
    }

    pub async fn run(&self) -> Result<(), DeviceError> {
        self.state.begin_run()?;
        self.state.set_running();
        let device_runs = async {
            let results = join_all(self.lds.iter().map(|ld| ld.run())).await;
            results.into_iter().collect::<Result<Vec<_>, _>>().map(|_| ())
        };
        let (_, _, devices) = join!(self.route_downstream(), self.route_upstream(), device_runs);
        devices?;
        self.state.set_stopped();
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), DeviceError> {
        self.state.begin_stop()?;
        self.transport.shutdown_host_to_target();
        for (connection, ld) in self.ld_connections.iter().zip(self.lds.iter()) {
            connection.cxl_mem.target_to_host.shutdown();
            connection.cfg.target_to_host.shutdown();
            connection.mmio.target_to_host.shutdown();
            ld.stop().await?;
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

    #[test]
    fn allocations_are_bounded_by_capacity() {
        let transport = CxlConnection::new();
        let mld = MultiLogicalDevice::new(
            &transport,
            2,
            0x1000_0000,
            |_| MemoryBacking::Anonymous,
            "mld0",
        )
        .unwrap();

        assert_eq!(
            mld.get_ld_info(),
            LdInfo {
                memory_size: 0x2000_0000,
                ld_count: 2
            }
        );
        assert_eq!(mld.get_ld_allocations(), vec![0x1000_0000, 0x1000_0000]);

        // Over-commit is rejected, leaving allocations untouched.
        let result = mld.set_ld_allocations(&[0x2000_0000, 0x2000_0000]);
        assert_eq!(result, vec![0x1000_0000, 0x1000_0000]);

        let result = mld.set_ld_allocations(&[0x1800_0000, 0x0800_0000]);
        assert_eq!(result, vec![0x1800_0000, 0x0800_0000]);
    }
}
