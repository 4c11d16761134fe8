//! The FIFO fabric: ordered queues binding adjacent actors.
//!
//! A [`Fifo`] behaves like the reference fabric's queues: any task may
//! enqueue, one logical consumer dequeues, delivery is in enqueue order, and a
//! sentinel shutdown token makes `recv` return `None`. FIFOs are cheap
//! handles: cloning shares the underlying queue, which is how one pair gets
//! borrowed by exactly one upstream and one downstream actor per direction.
//! A [`FifoPair`] is the bidirectional bundle (`host_to_target` /
//! `target_to_host`), and a [`CxlConnection`] groups the four traffic-class
//! pairs that bind any two adjacent components.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::packet::{CacheLineData, CxlCachePacket, CxlIoPacket, CxlMemPacket};

struct FifoInner<T> {
    tx: mpsc::UnboundedSender<Option<T>>,
    rx: Mutex<mpsc::UnboundedReceiver<Option<T>>>,
}

/// Unbounded in-order queue with a shutdown sentinel.
pub struct Fifo<T> {
    inner: Arc<FifoInner<T>>,
}

impl<T> Clone for Fifo<T> {
    fn clone(&self) -> Self {
        Fifo {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Fifo<T> {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Fifo {
            inner: Arc::new(FifoInner {
                tx,
                rx: Mutex::new(rx),
            }),
        }
    }

    /// Enqueues a message. Sending to a dropped consumer is a no-op: the
    /// consumer has already shut down and the packet is simply lost, which is
    /// the drop-on-shutdown semantics the fabric wants.
    pub fn send(&self, value: T) {
        let _ = self.inner.tx.send(Some(value));
    }

    /// Enqueues the shutdown token. The consumer's `recv` returns `None` once
    /// every message enqueued before this call has been drained.
    pub fn shutdown(&self) {
        let _ = self.inner.tx.send(None);
    }

    /// Dequeues the next message, or `None` on shutdown.
    pub async fn recv(&self) -> Option<T> {
        self.inner.rx.lock().await.recv().await.flatten()
    }
}

impl<T> Default for Fifo<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A bidirectional pair of FIFOs for one traffic class.
pub struct FifoPair<T> {
    pub host_to_target: Fifo<T>,
    pub target_to_host: Fifo<T>,
}

impl<T> FifoPair<T> {
    pub fn new() -> Self {
        FifoPair {
            host_to_target: Fifo::new(),
            target_to_host: Fifo::new(),
        }
    }
}

impl<T> Clone for FifoPair<T> {
    fn clone(&self) -> Self {
        FifoPair {
            host_to_target: self.host_to_target.clone(),
            target_to_host: self.target_to_host.clone(),
        }
    }
}

impl<T> Default for FifoPair<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The four FIFO pairs binding two adjacent CXL components.
#[derive(Clone, Default)]
pub struct CxlConnection {
    pub cfg: FifoPair<CxlIoPacket>,
    pub mmio: FifoPair<CxlIoPacket>,
    pub cxl_mem: FifoPair<CxlMemPacket>,
    pub cxl_cache: FifoPair<CxlCachePacket>,
}

impl CxlConnection {
    pub fn new() -> Self {
        CxlConnection::default()
    }

    /// Enqueues shutdown tokens on every host-to-target queue.
    pub fn shutdown_host_to_target(&self) {
        self.cfg.host_to_target.shutdown();
        self.mmio.host_to_target.shutdown();
        self.cxl_mem.host_to_target.shutdown();
        self.cxl_cache.host_to_target.shutdown();
    }

    /// Enqueues shutdown tokens on every target-to-host queue.
    pub fn shutdown_target_to_host(&self) {
        self.cfg.target_to_host.shutdown();
        self.mmio.target_to_host.shutdown();
        self.cxl_mem.target_to_host.shutdown();
        self.cxl_cache.target_to_host.shutdown();
    }
}

// ---------------------------------------------------------------------------
// Internal request channels (LLC <-> coherency engines, hub <-> LLC, home
// agent <-> memory controller)
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheRequestOp {
    Read,
    Write,
    SnpData,
    SnpInv,
    SnpCur,
    WriteBack,
    WriteBackClean,
    UncachedRead,
    UncachedWrite,
}

#[derive(Clone, Copy, Debug)]
pub struct CacheRequest {
    pub op: CacheRequestOp,
    pub addr: u64,
    pub data: CacheLineData,
}

impl CacheRequest {
    pub fn new(op: CacheRequestOp, addr: u64) -> Self {
        CacheRequest {
            op,
            addr,
            data: CacheLineData::zeroed(),
        }
    }

    pub fn with_data(op: CacheRequestOp, addr: u64, data: CacheLineData) -> Self {
        CacheRequest { op, addr, data }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheResponseStatus {
    Ok,
    Failed,
    RspV,
    RspM,
    RspE,
    RspS,
    RspI,
    RspMiss,
}

#[derive(Clone, Copy, Debug)]
pub struct CacheResponse {
    pub status: CacheResponseStatus,
    pub data: CacheLineData,
}

impl CacheResponse {
    pub fn new(status: CacheResponseStatus) -> Self {
        CacheResponse {
            status,
            data: CacheLineData::zeroed(),
        }
    }

    pub fn with_data(status: CacheResponseStatus, data: CacheLineData) -> Self {
        CacheResponse { status, data }
    }
}

/// Request/response pair between a cache controller and a coherency engine.
#[derive(Clone, Default)]
pub struct CacheFifoPair {
    pub request: Fifo<CacheRequest>,
    pub response: Fifo<CacheResponse>,
}

impl CacheFifoPair {
    pub fn new() -> Self {
        CacheFifoPair::default()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryRequestOp {
    Read,
    Write,
    UncachedRead,
    UncachedWrite,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryRequest {
    pub op: MemoryRequestOp,
    pub addr: u64,
    pub size: usize,
    pub data: CacheLineData,
}

impl MemoryRequest {
    pub fn read(addr: u64, size: usize) -> Self {
        MemoryRequest {
            op: MemoryRequestOp::Read,
            addr,
            size,
            data: CacheLineData::zeroed(),
        }
    }

    pub fn write(addr: u64, size: usize, data: CacheLineData) -> Self {
        MemoryRequest {
            op: MemoryRequestOp::Write,
            addr,
            size,
            data,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryResponseStatus {
    Ok,
    Failed,
}

#[derive(Clone, Copy, Debug)]
pub struct MemoryResponse {
    pub status: MemoryResponseStatus,
    pub data: CacheLineData,
}

impl MemoryResponse {
    pub fn ok() -> Self {
        MemoryResponse {
            status: MemoryResponseStatus::Ok,
            data: CacheLineData::zeroed(),
        }
    }

    pub fn ok_with_data(data: CacheLineData) -> Self {
        MemoryResponse {
            status: MemoryResponseStatus::Ok,
            data,
        }
    }

    pub fn failed() -> Self {
        MemoryResponse {
            status: MemoryResponseStatus::Failed,
            data: CacheLineData::zeroed(),
        }
    }
}

/// Request/response pair between a memory consumer and producer.
#[derive(Clone, Default)]
pub struct MemoryFifoPair {
    pub request: Fifo<MemoryRequest>,
    pub response: Fifo<MemoryResponse>,
}

impl MemoryFifoPair {
    pub fn new() -> Self {
        MemoryFifoPair::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fifo_preserves_order() {
        let fifo = Fifo::new();
        for i in 0..16 {
            fifo.send(i);
        }
        for i in 0..16 {
            assert_eq!(fifo.recv().await, Some(i));
        }
    }

    #[tokio::test]
    async fn shutdown_drains_pending_messages_first() {
        let fifo = Fifo::new();
        fifo.send(1);
        fifo.send(2);
        fifo.shutdown();
        assert_eq!(fifo.recv().await, Some(1));
        assert_eq!(fifo.recv().await, Some(2));
        assert_eq!(fifo.recv().await, None);
    }

    #[tokio::test]
    async fn clones_share_the_underlying_queue() {
        let producer_side = Fifo::new();
        let consumer_side = producer_side.clone();
        producer_side.send(7u32);
        assert_eq!(consumer_side.recv().await, Some(7));
    }
}
