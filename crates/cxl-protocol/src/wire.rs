//! Wire format for fabric edges that cross a TCP socket.
//!
//! Frames are a `u32` little-endian length prefix followed by a `postcard`
//! body. The first frame on a fabric connection is the client's
//! [`PortPrologue`] identifying its physical port and role; the switch answers
//! with a [`PrologueAck`] and then both sides exchange [`FabricFrame`]s, one
//! per packet, tagged by traffic class through the enum discriminant.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::packet::{CxlCachePacket, CxlIoPacket, CxlMemPacket};

/// Frames larger than this are treated as protocol corruption.
pub const MAX_FRAME_LEN: u32 = 1 << 20;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec error: {0}")]
    Codec(#[from] postcard::Error),
    #[error("frame length {0} exceeds limit")]
    FrameTooLarge(u32),
}

/// One packet on the wire, tagged by traffic class. CFG and MMIO share the
/// CXL.io packet type but are distinct classes on the wire, so completions
/// land back on the pair that produced the request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum FabricFrame {
    Cfg(CxlIoPacket),
    Mmio(CxlIoPacket),
    Mem(CxlMemPacket),
    Cache(CxlCachePacket),
}

/// The role a fabric client declares at connect time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortClientKind {
    RootPort,
    Usp,
    Dsp,
    Ld,
    Fmld,
    Type1,
    Type2,
    Type3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortPrologue {
    pub port_index: u8,
    pub kind: PortClientKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrologueAck {
    pub accepted: bool,
    pub reason: Option<String>,
}

pub async fn send_frame<W, T>(stream: &mut W, value: &T) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = postcard::to_allocvec(value)?;
    stream.write_u32_le(body.len() as u32).await?;
    stream.write_all(&body).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn recv_frame<R, T>(stream: &mut R) -> Result<T, WireError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = stream.read_u32_le().await?;
    if len > MAX_FRAME_LEN {
        return Err(WireError::FrameTooLarge(len));
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(postcard::from_bytes(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Bdf;

    #[tokio::test]
    async fn frame_round_trips_through_a_duplex_stream() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let frame = FabricFrame::Cfg(CxlIoPacket::cfg_rd(Bdf::new(1, 0, 0), 0x00, 2, false, 0, 3));
        send_frame(&mut a, &frame).await.unwrap();
        let received: FabricFrame = recv_frame(&mut b).await.unwrap();
        assert_eq!(frame, received);

        let prologue = PortPrologue {
            port_index: 2,
            kind: PortClientKind::Type3,
        };
        send_frame(&mut b, &prologue).await.unwrap();
        let received: PortPrologue = recv_frame(&mut a).await.unwrap();
        assert_eq!(prologue, received);
    }
}
