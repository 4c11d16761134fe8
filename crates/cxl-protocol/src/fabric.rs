//! Fabric edge pumps: moving packet frames between a socket and a
//! [`CxlConnection`].
//!
//! The same pump serves both sides of the TCP port fabric. `host_side`
//! selects the direction packets flow: a pump on the switch handling a
//! root-port client injects host-to-target traffic, while the pump inside
//! that root-port client injects target-to-host traffic.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::fifo::CxlConnection;
use crate::wire::{
    recv_frame, send_frame, FabricFrame, PortClientKind, PortPrologue, PrologueAck, WireError,
};

pub async fn pump_connection<S>(stream: S, connection: CxlConnection, host_side: bool)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, mut writer) = tokio::io::split(stream);

    let inbound = {
        let connection = connection.clone();
        async move {
            loop {
                match recv_frame::<_, FabricFrame>(&mut reader).await {
                    Ok(frame) => dispatch_inbound(&connection, frame, host_side),
                    Err(WireError::Io(_)) => break,
                    Err(error) => {
                        warn!("dropping undecodable fabric frame: {error}");
                        break;
                    }
                }
            }
        }
    };

    let outbound = async move {
        loop {
            let Some(frame) = next_outbound(&connection, host_side).await else {
                break;
            };
            if send_frame(&mut writer, &frame).await.is_err() {
                break;
            }
        }
    };

    tokio::join!(inbound, outbound);
}

fn dispatch_inbound(connection: &CxlConnection, frame: FabricFrame, host_side: bool) {
    match (frame, host_side) {
        (FabricFrame::Cfg(packet), true) => connection.cfg.host_to_target.send(packet),
        (FabricFrame::Cfg(packet), false) => connection.cfg.target_to_host.send(packet),
        (FabricFrame::Mmio(packet), true) => connection.mmio.host_to_target.send(packet),
        (FabricFrame::Mmio(packet), false) => connection.mmio.target_to_host.send(packet),
        (FabricFrame::Mem(packet), true) => connection.cxl_mem.host_to_target.send(packet),
        (FabricFrame::Mem(packet), false) => connection.cxl_mem.target_to_host.send(packet),
        (FabricFrame::Cache(packet), true) => connection.cxl_cache.host_to_target.send(packet),
        (FabricFrame::Cache(packet), false) => connection.cxl_cache.target_to_host.send(packet),
    }
}

async fn next_outbound(connection: &CxlConnection, host_side: bool) -> Option<FabricFrame> {
    if host_side {
        tokio::select! {
            packet = connection.cfg.target_to_host.recv() => packet.map(FabricFrame::Cfg),
            packet = connection.mmio.target_to_host.recv() => packet.map(FabricFrame::Mmio),
            packet = connection.cxl_mem.target_to_host.recv() => packet.map(FabricFrame::Mem),
            packet = connection.cxl_cache.target_to_host.recv() => packet.map(FabricFrame::Cache),
        }
    } else {
        tokio::select! {
            packet = connection.cfg.host_to_target.recv() => packet.map(FabricFrame::Cfg),
            packet = connection.mmio.host_to_target.recv() => packet.map(FabricFrame::Mmio),
            packet = connection.cxl_mem.host_to_target.recv() => packet.map(FabricFrame::Mem),
            packet = connection.cxl_cache.host_to_target.recv() => packet.map(FabricFrame::Cache),
        }
    }
}

/// Client-side fabric edge: connects a local `CxlConnection` to a switch
/// port over TCP. Hosts connect as `RootPort`, devices as their device kind.
pub struct FabricPortClient {
    connection: CxlConnection,
    task: JoinHandle<()>,
}

impl FabricPortClient {
    pub async fn connect(
        addr: impl ToSocketAddrs,
        port_index: u8,
        kind: PortClientKind,
    ) -> Result<Self, WireError> {
        let mut stream = TcpStream::connect(addr).await?;
        send_frame(&mut stream, &PortPrologue { port_index, kind }).await?;
        let ack: PrologueAck = recv_frame(&mut stream).await?;
        if !ack.accepted {
            return Err(WireError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                ack.reason.unwrap_or_else(|| "rejected".to_string()),
            )));
        }

        let connection = CxlConnection::new();
        // The client mirrors the switch's pump: a root-port client writes
        // host-to-target locally, so its pump runs with the opposite sense.
        let host_side = kind != PortClientKind::RootPort;
        let task = {
            let connection = connection.clone();
            tokio::spawn(async move {
                pump_connection(stream, connection, host_side).await;
            })
        };
        Ok(FabricPortClient { connection, task })
    }

    pub fn connection(&self) -> &CxlConnection {
        &self.connection
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}
