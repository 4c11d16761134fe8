//! Packet taxonomy for the four traffic classes.
//!
//! Each traffic class is a tagged union; the FIFO fabric is typed per class,
//! so a packet can never end up on a queue of the wrong class. Consumers that
//! receive an unexpected *subtype* (e.g. a completion on a request-only path)
//! log and drop it.

use std::fmt;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Size of a cache line / CXL.mem data payload, in bytes.
pub const CACHE_LINE_SIZE: usize = 64;

/// A 64-byte data payload carried by CXL.mem DRS/RwD and CXL.cache data
/// messages, and by the internal cache/memory channels.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct CacheLineData(pub [u8; CACHE_LINE_SIZE]);

impl CacheLineData {
    pub fn zeroed() -> Self {
        CacheLineData([0; CACHE_LINE_SIZE])
    }

    /// Builds a line whose first eight bytes hold `value` little-endian.
    /// Test traffic and word-sized round trips use this.
    pub fn from_u64(value: u64) -> Self {
        let mut data = [0u8; CACHE_LINE_SIZE];
        data[..8].copy_from_slice(&value.to_le_bytes());
        CacheLineData(data)
    }

    /// First eight bytes as a little-endian word.
    pub fn as_u64(&self) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.0[..8]);
        u64::from_le_bytes(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; CACHE_LINE_SIZE] {
        &self.0
    }
}

impl Default for CacheLineData {
    fn default() -> Self {
        Self::zeroed()
    }
}

impl fmt::Debug for CacheLineData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Full 64-byte dumps drown the logs; the head is enough to identify a line.
        write!(
            f,
            "CacheLineData({:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5], self.0[6], self.0[7]
        )
    }
}

// serde's derive stops at 32-element arrays, so the 64-byte payload carries
// its own impl, encoded as a plain byte sequence.
impl Serialize for CacheLineData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> Deserialize<'de> for CacheLineData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LineVisitor;

        impl<'de> Visitor<'de> for LineVisitor {
            type Value = CacheLineData;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{CACHE_LINE_SIZE} bytes")
            }

            fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
                let bytes: [u8; CACHE_LINE_SIZE] = v
                    .try_into()
                    .map_err(|_| E::invalid_length(v.len(), &self))?;
                Ok(CacheLineData(bytes))
            }

            fn visit_seq<A: de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut bytes = [0u8; CACHE_LINE_SIZE];
                for (i, byte) in bytes.iter_mut().enumerate() {
                    *byte = seq
                        .next_element()?
                        .ok_or_else(|| de::Error::invalid_length(i, &self))?;
                }
                Ok(CacheLineData(bytes))
            }
        }

        deserializer.deserialize_bytes(LineVisitor)
    }
}

/// Bus/device/function identifier, packed as `bus[15:8] dev[7:3] fn[2:0]`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Bdf(pub u16);

impl Bdf {
    pub fn new(bus: u8, device: u8, function: u8) -> Self {
        Bdf(u16::from(bus) << 8 | u16::from(device & 0x1F) << 3 | u16::from(function & 0x07))
    }

    pub fn bus(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn device(&self) -> u8 {
        ((self.0 >> 3) & 0x1F) as u8
    }

    pub fn function(&self) -> u8 {
        (self.0 & 0x07) as u8
    }
}

impl fmt::Display for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02x}:{:02x}.{}", self.bus(), self.device(), self.function())
    }
}

impl fmt::Debug for Bdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bdf({self})")
    }
}

// ---------------------------------------------------------------------------
// CXL.io (PCIe CFG + MMIO)
// ---------------------------------------------------------------------------

/// PCIe completion status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CplStatus {
    /// Successful completion.
    Sc,
    /// Unsupported request.
    Ur,
    /// Completer abort.
    Ca,
}

/// A configuration-space request. `value` is present for writes only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CfgRequest {
    pub bdf: Bdf,
    /// Byte offset into the 4 KiB config space. Requests never cross a DWORD.
    pub offset: u16,
    pub size: u8,
    pub value: Option<u32>,
    /// Type 0 (for the addressed bus) vs type 1 (to be forwarded).
    pub type0: bool,
    pub req_id: u16,
    pub tag: u8,
    pub ld_id: u8,
}

/// An MMIO request. `value` is present for writes only.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MmioRequest {
    pub addr: u64,
    pub size: u8,
    pub value: Option<u64>,
    pub req_id: u16,
    pub tag: u8,
    pub ld_id: u8,
}

/// A completion without data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Completion {
    pub req_id: u16,
    pub tag: u8,
    pub status: CplStatus,
    pub ld_id: u8,
}

/// A completion carrying read data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionWithData {
    pub req_id: u16,
    pub tag: u8,
    pub data: u64,
    pub size: u8,
    pub ld_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CxlIoPacket {
    CfgRd(CfgRequest),
    CfgWr(CfgRequest),
    MemRd(MmioRequest),
    MemWr(MmioRequest),
    Cpl(Completion),
    CplD(CompletionWithData),
}

impl CxlIoPacket {
    pub fn cfg_rd(bdf: Bdf, offset: u16, size: u8, type0: bool, req_id: u16, tag: u8) -> Self {
        CxlIoPacket::CfgRd(CfgRequest {
            bdf,
            offset,
            size,
            value: None,
            type0,
            req_id,
            tag,
            ld_id: 0,
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn cfg_wr(
        bdf: Bdf,
        offset: u16,
        size: u8,
        value: u32,
        type0: bool,
        req_id: u16,
        tag: u8,
    ) -> Self {
        CxlIoPacket::CfgWr(CfgRequest {
            bdf,
            offset,
            size,
            value: Some(value),
            type0,
            req_id,
            tag,
            ld_id: 0,
        })
    }

    pub fn mem_rd(addr: u64, size: u8, req_id: u16, tag: u8) -> Self {
        CxlIoPacket::MemRd(MmioRequest {
            addr,
            size,
            value: None,
            req_id,
            tag,
            ld_id: 0,
        })
    }

    pub fn mem_wr(addr: u64, size: u8, value: u64, req_id: u16, tag: u8) -> Self {
        CxlIoPacket::MemWr(MmioRequest {
            addr,
            size,
            value: Some(value),
            req_id,
            tag,
            ld_id: 0,
        })
    }

    pub fn cpl(req_id: u16, tag: u8, status: CplStatus) -> Self {
        CxlIoPacket::Cpl(Completion {
            req_id,
            tag,
            status,
            ld_id: 0,
        })
    }

    pub fn cpl_d(req_id: u16, tag: u8, data: u64, size: u8) -> Self {
        CxlIoPacket::CplD(CompletionWithData {
            req_id,
            tag,
            data,
            size,
            ld_id: 0,
        })
    }

    pub fn is_cfg(&self) -> bool {
        matches!(self, CxlIoPacket::CfgRd(_) | CxlIoPacket::CfgWr(_))
    }

    /// Address of an MMIO request; CFG requests and completions carry none.
    pub fn address(&self) -> Option<u64> {
        match self {
            CxlIoPacket::MemRd(r) | CxlIoPacket::MemWr(r) => Some(r.addr),
            _ => None,
        }
    }

    /// Size in bytes of the request's or completion's data.
    pub fn data_size(&self) -> usize {
        match self {
            CxlIoPacket::CfgRd(r) | CxlIoPacket::CfgWr(r) => usize::from(r.size),
            CxlIoPacket::MemRd(r) | CxlIoPacket::MemWr(r) => usize::from(r.size),
            CxlIoPacket::Cpl(_) => 0,
            CxlIoPacket::CplD(c) => usize::from(c.size),
        }
    }

    /// `(config offset, size)` of a CFG request.
    pub fn cfg_read_info(&self) -> Option<(u16, usize)> {
        match self {
            CxlIoPacket::CfgRd(r) | CxlIoPacket::CfgWr(r) => {
                Some((r.offset, usize::from(r.size)))
            }
            _ => None,
        }
    }

    pub fn is_mmio(&self) -> bool {
        matches!(self, CxlIoPacket::MemRd(_) | CxlIoPacket::MemWr(_))
    }

    pub fn is_completion(&self) -> bool {
        matches!(self, CxlIoPacket::Cpl(_) | CxlIoPacket::CplD(_))
    }

    /// Completion with SC status, either flavor.
    pub fn is_successful_completion(&self) -> bool {
        match self {
            CxlIoPacket::Cpl(cpl) => cpl.status == CplStatus::Sc,
            CxlIoPacket::CplD(_) => true,
            _ => false,
        }
    }

    /// `(req_id, tag)` of a request or completion.
    pub fn req_tag(&self) -> (u16, u8) {
        match self {
            CxlIoPacket::CfgRd(r) | CxlIoPacket::CfgWr(r) => (r.req_id, r.tag),
            CxlIoPacket::MemRd(r) | CxlIoPacket::MemWr(r) => (r.req_id, r.tag),
            CxlIoPacket::Cpl(c) => (c.req_id, c.tag),
            CxlIoPacket::CplD(c) => (c.req_id, c.tag),
        }
    }

    pub fn ld_id(&self) -> u8 {
        match self {
            CxlIoPacket::CfgRd(r) | CxlIoPacket::CfgWr(r) => r.ld_id,
            CxlIoPacket::MemRd(r) | CxlIoPacket::MemWr(r) => r.ld_id,
            CxlIoPacket::Cpl(c) => c.ld_id,
            CxlIoPacket::CplD(c) => c.ld_id,
        }
    }

    pub fn set_ld_id(&mut self, ld_id: u8) {
        match self {
            CxlIoPacket::CfgRd(r) | CxlIoPacket::CfgWr(r) => r.ld_id = ld_id,
            CxlIoPacket::MemRd(r) | CxlIoPacket::MemWr(r) => r.ld_id = ld_id,
            CxlIoPacket::Cpl(c) => c.ld_id = ld_id,
            CxlIoPacket::CplD(c) => c.ld_id = ld_id,
        }
    }
}

// ---------------------------------------------------------------------------
// CXL.mem
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemMetaField {
    NoOp,
    Meta0State,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemMetaValue {
    Invalid,
    Any,
    Shared,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemSnpType {
    NoOp,
    SnpData,
    SnpInv,
    SnpCur,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum M2SReqOpcode {
    MemInv,
    MemRd,
    MemRdData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum S2MNdrOpcode {
    Cmp,
    CmpS,
    CmpE,
    CmpM,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum S2MBISnpOpcode {
    BISnpCur,
    BISnpData,
    BISnpInv,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum M2SBIRspOpcode {
    BIRspI,
    BIRspS,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct M2SReq {
    pub opcode: M2SReqOpcode,
    pub meta_field: MemMetaField,
    pub meta_value: MemMetaValue,
    pub snp_type: MemSnpType,
    pub addr: u64,
    pub ld_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct M2SRwD {
    pub meta_field: MemMetaField,
    pub meta_value: MemMetaValue,
    pub snp_type: MemSnpType,
    pub addr: u64,
    pub data: CacheLineData,
    pub ld_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct M2SBIRsp {
    pub opcode: M2SBIRspOpcode,
    pub bi_id: u8,
    pub bi_tag: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct S2MNdr {
    pub opcode: S2MNdrOpcode,
    pub meta_field: MemMetaField,
    pub meta_value: MemMetaValue,
    pub ld_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct S2MDrs {
    pub data: CacheLineData,
    pub meta_field: MemMetaField,
    pub meta_value: MemMetaValue,
    pub ld_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct S2MBISnp {
    pub opcode: S2MBISnpOpcode,
    pub addr: u64,
    pub bi_id: u8,
    pub bi_tag: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CxlMemPacket {
    M2SReq(M2SReq),
    M2SRwD(M2SRwD),
    M2SBIRsp(M2SBIRsp),
    S2MNdr(S2MNdr),
    S2MDrs(S2MDrs),
    S2MBISnp(S2MBISnp),
}

impl CxlMemPacket {
    /// A plain host read: `MemRd` with no coherence metadata.
    pub fn mem_rd(addr: u64) -> Self {
        CxlMemPacket::M2SReq(M2SReq {
            opcode: M2SReqOpcode::MemRd,
            meta_field: MemMetaField::NoOp,
            meta_value: MemMetaValue::Any,
            snp_type: MemSnpType::NoOp,
            addr,
            ld_id: 0,
        })
    }

    pub fn m2s_req(
        opcode: M2SReqOpcode,
        meta_field: MemMetaField,
        meta_value: MemMetaValue,
        snp_type: MemSnpType,
        addr: u64,
    ) -> Self {
        CxlMemPacket::M2SReq(M2SReq {
            opcode,
            meta_field,
            meta_value,
            snp_type,
            addr,
            ld_id: 0,
        })
    }

    /// A plain host write: `MemWr` with no coherence metadata.
    pub fn mem_wr(addr: u64, data: CacheLineData) -> Self {
        CxlMemPacket::M2SRwD(M2SRwD {
            meta_field: MemMetaField::NoOp,
            meta_value: MemMetaValue::Any,
            snp_type: MemSnpType::NoOp,
            addr,
            data,
            ld_id: 0,
        })
    }

    pub fn m2s_rwd(
        meta_field: MemMetaField,
        meta_value: MemMetaValue,
        snp_type: MemSnpType,
        addr: u64,
        data: CacheLineData,
    ) -> Self {
        CxlMemPacket::M2SRwD(M2SRwD {
            meta_field,
            meta_value,
            snp_type,
            addr,
            data,
            ld_id: 0,
        })
    }

    pub fn bi_rsp(opcode: M2SBIRspOpcode, bi_id: u8, bi_tag: u16) -> Self {
        CxlMemPacket::M2SBIRsp(M2SBIRsp { opcode, bi_id, bi_tag })
    }

    pub fn ndr(opcode: S2MNdrOpcode, meta_field: MemMetaField, meta_value: MemMetaValue) -> Self {
        CxlMemPacket::S2MNdr(S2MNdr {
            opcode,
            meta_field,
            meta_value,
            ld_id: 0,
        })
    }

    pub fn drs(data: CacheLineData, meta_field: MemMetaField, meta_value: MemMetaValue) -> Self {
        CxlMemPacket::S2MDrs(S2MDrs {
            data,
            meta_field,
            meta_value,
            ld_id: 0,
        })
    }

    pub fn bi_snp(opcode: S2MBISnpOpcode, addr: u64, bi_id: u8, bi_tag: u16) -> Self {
        CxlMemPacket::S2MBISnp(S2MBISnp {
            opcode,
            addr,
            bi_id,
            bi_tag,
        })
    }

    /// Address of an M2S request or a BI snoop; responses carry none.
    pub fn address(&self) -> Option<u64> {
        match self {
            CxlMemPacket::M2SReq(req) => Some(req.addr),
            CxlMemPacket::M2SRwD(rwd) => Some(rwd.addr),
            CxlMemPacket::S2MBISnp(snp) => Some(snp.addr),
            _ => None,
        }
    }

    pub fn is_m2s(&self) -> bool {
        matches!(
            self,
            CxlMemPacket::M2SReq(_) | CxlMemPacket::M2SRwD(_) | CxlMemPacket::M2SBIRsp(_)
        )
    }
}

// ---------------------------------------------------------------------------
// CXL.cache
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum H2DReqOpcode {
    SnpData,
    SnpInv,
    SnpCur,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum H2DRspOpcode {
    Go,
    GoWritePull,
}

/// Cache state granted by an H2D `Go` response.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum H2DRspState {
    Invalid,
    Shared,
    Exclusive,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum D2HReqOpcode {
    RdShared,
    RdAny,
    RdOwnNoData,
    DirtyEvict,
    CleanEvict,
    CleanEvictNoData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum D2HRspOpcode {
    RspIHitI,
    RspIHitSE,
    RspSHitSE,
    RspSFwdM,
    RspIFwdM,
    RspVHitV,
    RspVFwdV,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct H2DReq {
    pub opcode: H2DReqOpcode,
    pub addr: u64,
    pub cache_id: u8,
    pub uqid: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct H2DRsp {
    pub opcode: H2DRspOpcode,
    pub state: H2DRspState,
    /// Write-pull identifier allocated by the host for `GoWritePull`.
    pub uqid: u16,
    pub cache_id: u8,
    /// Echo of the device request's CQID.
    pub cqid: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct H2DData {
    pub cqid: u16,
    pub data: CacheLineData,
    pub cache_id: u8,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct D2HReq {
    pub opcode: D2HReqOpcode,
    pub addr: u64,
    pub cache_id: u8,
    pub cqid: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct D2HRsp {
    pub opcode: D2HRspOpcode,
    pub uqid: u16,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct D2HData {
    pub uqid: u16,
    pub data: CacheLineData,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CxlCachePacket {
    H2DReq(H2DReq),
    H2DRsp(H2DRsp),
    H2DData(H2DData),
    D2HReq(D2HReq),
    D2HRsp(D2HRsp),
    D2HData(D2HData),
}

impl CxlCachePacket {
    pub fn h2d_req(opcode: H2DReqOpcode, addr: u64, cache_id: u8, uqid: u16) -> Self {
        CxlCachePacket::H2DReq(H2DReq {
            opcode,
            addr,
            cache_id,
            uqid,
        })
    }

    pub fn h2d_go(cache_id: u8, state: H2DRspState, cqid: u16) -> Self {
        CxlCachePacket::H2DRsp(H2DRsp {
            opcode: H2DRspOpcode::Go,
            state,
            uqid: 0,
            cache_id,
            cqid,
        })
    }

    pub fn h2d_go_write_pull(cache_id: u8, uqid: u16, cqid: u16) -> Self {
        CxlCachePacket::H2DRsp(H2DRsp {
            opcode: H2DRspOpcode::GoWritePull,
            state: H2DRspState::Invalid,
            uqid,
            cache_id,
            cqid,
        })
    }

    pub fn h2d_data(cache_id: u8, cqid: u16, data: CacheLineData) -> Self {
        CxlCachePacket::H2DData(H2DData {
            cqid,
            data,
            cache_id,
        })
    }

    pub fn d2h_req(opcode: D2HReqOpcode, addr: u64, cache_id: u8, cqid: u16) -> Self {
        CxlCachePacket::D2HReq(D2HReq {
            opcode,
            addr,
            cache_id,
            cqid,
        })
    }

    pub fn d2h_rsp(opcode: D2HRspOpcode, uqid: u16) -> Self {
        CxlCachePacket::D2HRsp(D2HRsp { opcode, uqid })
    }

    pub fn d2h_data(uqid: u16, data: CacheLineData) -> Self {
        CxlCachePacket::D2HData(D2HData { uqid, data })
    }

    pub fn address(&self) -> Option<u64> {
        match self {
            CxlCachePacket::H2DReq(req) => Some(req.addr),
            CxlCachePacket::D2HReq(req) => Some(req.addr),
            _ => None,
        }
    }

    pub fn cache_id(&self) -> Option<u8> {
        match self {
            CxlCachePacket::H2DReq(req) => Some(req.cache_id),
            CxlCachePacket::H2DRsp(rsp) => Some(rsp.cache_id),
            CxlCachePacket::H2DData(data) => Some(data.cache_id),
            CxlCachePacket::D2HReq(req) => Some(req.cache_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bdf_packing_round_trips() {
        let bdf = Bdf::new(2, 1, 0);
        assert_eq!(bdf.bus(), 2);
        assert_eq!(bdf.device(), 1);
        assert_eq!(bdf.function(), 0);
        assert_eq!(bdf.to_string(), "02:01.0");
        assert_eq!(Bdf::new(0xFF, 0x1F, 0x7).0, 0xFFFF);
    }

    #[test]
    fn cache_line_word_accessors() {
        let line = CacheLineData::from_u64(0xDEAD_BEEF);
        assert_eq!(line.as_u64(), 0xDEAD_BEEF);
        assert_eq!(line.0[4..].iter().all(|b| *b == 0), true);
    }

    #[test]
    fn cache_line_serde_round_trips() {
        let mut line = CacheLineData::zeroed();
        for (i, byte) in line.0.iter_mut().enumerate() {
            *byte = i as u8;
        }
        let encoded = postcard::to_allocvec(&line).unwrap();
        let decoded: CacheLineData = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(line, decoded);
    }

    #[test]
    fn completion_status_accessors() {
        let ur = CxlIoPacket::cpl(0, 7, CplStatus::Ur);
        assert!(!ur.is_successful_completion());
        assert_eq!(ur.req_tag(), (0, 7));

        let cpld = CxlIoPacket::cpl_d(0, 7, 0x1234, 4);
        assert!(cpld.is_successful_completion());
    }

    #[test]
    fn mem_packet_addresses() {
        let rd = CxlMemPacket::mem_rd(0x1_0000_0000);
        assert_eq!(rd.address(), Some(0x1_0000_0000));
        assert!(rd.is_m2s());

        let ndr = CxlMemPacket::ndr(S2MNdrOpcode::Cmp, MemMetaField::NoOp, MemMetaValue::Invalid);
        assert_eq!(ndr.address(), None);
        assert!(!ndr.is_m2s());
    }
}
