//! Out-of-band readiness/shutdown choreography between emulator processes.
//!
//! Multi-process topologies need to sequence `switch ready -> host ready ->
//! devices ready -> start IO -> shutdown` without touching the packet fabric.
//! This channel carries exactly that sequence as typed messages over a framed
//! TCP connection.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};

use crate::wire::{recv_frame, send_frame, WireError};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SidebandMessage {
    SwitchReady,
    HostReady,
    DevicesReady,
    StartIo,
    Shutdown,
}

pub struct SidebandServer {
    listener: TcpListener,
}

impl SidebandServer {
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, WireError> {
        Ok(SidebandServer {
            listener: TcpListener::bind(addr).await?,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, WireError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<SidebandPeer, WireError> {
        let (stream, _) = self.listener.accept().await?;
        Ok(SidebandPeer { stream })
    }
}

pub struct SidebandPeer {
    stream: TcpStream,
}

impl SidebandPeer {
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, WireError> {
        Ok(SidebandPeer {
            stream: TcpStream::connect(addr).await?,
        })
    }

    pub async fn send(&mut self, message: SidebandMessage) -> Result<(), WireError> {
        send_frame(&mut self.stream, &message).await
    }

    pub async fn recv(&mut self) -> Result<SidebandMessage, WireError> {
        recv_frame(&mut self.stream).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ready_sequence_is_preserved() {
        let server = SidebandServer::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let mut peer = SidebandPeer::connect(addr).await.unwrap();
            assert_eq!(peer.recv().await.unwrap(), SidebandMessage::SwitchReady);
            peer.send(SidebandMessage::HostReady).await.unwrap();
            assert_eq!(peer.recv().await.unwrap(), SidebandMessage::StartIo);
            peer.send(SidebandMessage::Shutdown).await.unwrap();
        });

        let mut peer = server.accept().await.unwrap();
        peer.send(SidebandMessage::SwitchReady).await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), SidebandMessage::HostReady);
        peer.send(SidebandMessage::StartIo).await.unwrap();
        assert_eq!(peer.recv().await.unwrap(), SidebandMessage::Shutdown);

        client.await.unwrap();
    }
}
