//! Raw root-port accessor.
//!
//! Speaks directly on a `CxlConnection` (the integration harness' root
//! port): config/MMIO requests with tagged completions, CXL.mem reads and
//! writes, and the enumeration entry points. One request is in flight per
//! traffic class at a time, so completions pair positionally, with a bounded
//! wait backing every response.

use std::sync::Mutex;
use std::time::Duration;

use futures::future::BoxFuture;

use cxl_protocol::fifo::CxlConnection;
use cxl_protocol::packet::{Bdf, CacheLineData, CxlIoPacket, CxlMemPacket};

use super::cxl_bus::CxlBusDriver;
use super::pci_bus::{EnumerationInfo, PciBusDriver};
use super::HostIo;
use crate::HostError;

pub struct RootPortDevice {
    connection: CxlConnection,
    next_tag: Mutex<u8>,
    op_lock: tokio::sync::Mutex<()>,
    timeout: Duration,
    /// Bus of the first device behind this root port.
    start_bus: u8,
}

impl RootPortDevice {
    pub fn new(connection: CxlConnection) -> Self {
        RootPortDevice {
            connection,
            next_tag: Mutex::new(0),
            op_lock: tokio::sync::Mutex::new(()),
            timeout: Duration::from_secs(3),
            start_bus: 1,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn alloc_tag(&self) -> u8 {
        let mut tag = self.next_tag.lock().unwrap();
        *tag = tag.wrapping_add(1);
        *tag
    }

    async fn do_read_config(&self, bdf: Bdf, offset: u16, size: usize) -> Result<u32, HostError> {
        let _guard = self.op_lock.lock().await;
        let bit_mask = if size >= 4 {
            0xFFFF_FFFF
        } else {
            (1u32 << (size * 8)) - 1
        };
        let type0 = bdf.bus() == self.start_bus;
        let tag = self.alloc_tag();
        self.connection
            .cfg
            .host_to_target
            .send(CxlIoPacket::cfg_rd(bdf, offset, size as u8, type0, 0, tag));
        let response =
            tokio::time::timeout(self.timeout, self.connection.cfg.target_to_host.recv())
                .await
                .map_err(|_| HostError::Timeout(u64::from(offset)))?;
        match response {
            Some(CxlIoPacket::CplD(cpl)) => Ok(cpl.data as u32 & bit_mask),
            Some(_) => Ok(0xFFFF_FFFF & bit_mask),
            None => Err(HostError::Timeout(u64::from(offset))),
        }
    }

    async fn do_write_config(
        &self,
        bdf: Bdf,
        offset: u16,
        size: usize,
        value: u32,
    ) -> Result<(), HostError> {
        let _guard = self.op_lock.lock().await;
        let type0 = bdf.bus() == self.start_bus;
        let tag = self.alloc_tag();
        self.connection.cfg.host_to_target.send(CxlIoPacket::cfg_wr(
            bdf, offset, size as u8, value, type0, 0, tag,
        ));
        let _ = tokio::time::timeout(self.timeout, self.connection.cfg.target_to_host.recv())
            .await
            .map_err(|_| HostError::Timeout(u64::from(offset)))?;
        Ok(())
    }

    async fn do_read_mmio(&self, addr: u64, size: usize) -> Result<u64, HostError> {
        let _guard = self.op_lock.lock().await;
        let tag = self.alloc_tag();
        self.connection
            .mmio
            .host_to_target
            .send(CxlIoPacket::mem_rd(addr, size as u8, 0, tag));
        let response =
            tokio::time::timeout(self.timeout, self.connection.mmio.target_to_host.recv())
                .await
                .map_err(|_| HostError::Timeout(addr))?;
        match response {
            Some(CxlIoPacket::CplD(cpl)) => Ok(cpl.data),
            _ => Ok(0),
        }
    }

    async fn do_write_mmio(&self, addr: u64, size: usize, value: u64) -> Result<(), HostError> {
        let _guard = self.op_lock.lock().await;
        let tag = self.alloc_tag();
        self.connection
            .mmio
            .host_to_target
            .send(CxlIoPacket::mem_wr(addr, size as u8, value, 0, tag));
        Ok(())
    }

    /// Reads one line over CXL.mem; the HDM decoders must already map `hpa`.
    pub async fn cxl_mem_read(&self, hpa: u64) -> Result<CacheLineData, HostError> {
        let _guard = self.op_lock.lock().await;
        self.connection
            .cxl_mem
            .host_to_target
            .send(CxlMemPacket::mem_rd(hpa));
        loop {
            let response =
                tokio::time::timeout(self.timeout, self.connection.cxl_mem.target_to_host.recv())
                    .await
                    .map_err(|_| HostError::Timeout(hpa))?;
            match response {
                Some(CxlMemPacket::S2MDrs(drs)) => return Ok(drs.data),
                Some(_) => continue,
                None => return Err(HostError::Timeout(hpa)),
            }
        }
    }

    pub async fn cxl_mem_write(&self, hpa: u64, data: CacheLineData) -> Result<(), HostError> {
        let _guard = self.op_lock.lock().await;
        self.connection
            .cxl_mem
            .host_to_target
            .send(CxlMemPacket::mem_wr(hpa, data));
        loop {
            let response =
                tokio::time::timeout(self.timeout, self.connection.cxl_mem.target_to_host.recv())
                    .await
                    .map_err(|_| HostError::Timeout(hpa))?;
            match response {
                Some(CxlMemPacket::S2MNdr(_)) => return Ok(()),
                Some(_) => continue,
                None => return Err(HostError::Timeout(hpa)),
            }
        }
    }

    pub async fn read_vid_did(&self, bdf: Bdf) -> Result<Option<u32>, HostError> {
        let vid = self.do_read_config(bdf, 0x00, 2).await?;
        let did = self.do_read_config(bdf, 0x02, 2).await?;
        if vid == 0xFFFF && did == 0xFFFF {
            return Ok(None);
        }
        Ok(Some(did << 16 | vid))
    }

    /// Depth-first enumeration starting behind this root port.
    pub async fn enumerate(&self, mmio_base: u64) -> Result<EnumerationInfo, HostError> {
        PciBusDriver::new(self).scan(self.start_bus, mmio_base).await
    }

    /// Read-only rescan of the enumerated tree.
    pub async fn scan_devices(&self) -> Result<EnumerationInfo, HostError> {
        PciBusDriver::new(self).rescan(self.start_bus).await
    }

    /// DVSEC / component-register discovery over an enumerated tree.
    pub async fn scan_cxl_devices<'d>(
        &'d self,
        enumeration: &EnumerationInfo,
    ) -> Result<CxlBusDriver<'d>, HostError> {
        let mut driver = CxlBusDriver::new(self);
        driver.init(&enumeration.devices).await?;
        Ok(driver)
    }
}

impl HostIo for RootPortDevice {
    fn read_config(
        &self,
        bdf: Bdf,
        offset: u16,
        size: usize,
    ) -> BoxFuture<'_, Result<u32, HostError>> {
        Box::pin(self.do_read_config(bdf, offset, size))
    }

    fn write_config(
        &self,
        bdf: Bdf,
        offset: u16,
        size: usize,
        value: u32,
    ) -> BoxFuture<'_, Result<(), HostError>> {
        Box::pin(self.do_write_config(bdf, offset, size, value))
    }

    fn read_mmio(&self, addr: u64, size: usize) -> BoxFuture<'_, Result<u64, HostError>> {
        Box::pin(self.do_read_mmio(addr, size))
    }

    fn write_mmio(
        &self,
        addr: u64,
        size: usize,
        value: u64,
    ) -> BoxFuture<'_, Result<(), HostError>> {
        Box::pin(self.do_write_mmio(addr, size, value))
    }
}
