//! CXL component register block.
//!
//! This is the 64 KiB register file a port or device exposes through BAR0.
//! Offsets `0x0000..0x1000` are a plain read-write scratch region (the
//! CXL.io registers of the block); the CXL.cache/CXL.mem capability directory
//! sits at `0x1000` and points at the capability register files (HDM decoder,
//! BI route table, BI decoder, cache ID route table). Register writes are
//! staged until the capability's commit bit is written, at which point the
//! backing manager is updated atomically and the committed bit becomes
//! observable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::hdm::{
    decoder_count_code, DeviceHdmDecoderManager, HdmDecoderConfig, SwitchHdmDecoderManager,
};

pub const COMPONENT_BLOCK_SIZE: usize = 0x10000;
pub const CACHEMEM_OFFSET: u64 = 0x1000;

pub const CAP_ID_CXL: u16 = 0x0001;
pub const CAP_ID_HDM_DECODER: u16 = 0x0005;
pub const CAP_ID_BI_ROUTE_TABLE: u16 = 0x000B;
pub const CAP_ID_BI_DECODER: u16 = 0x000C;
pub const CAP_ID_CACHE_ID_ROUTE_TABLE: u16 = 0x000D;

// Capability register files, relative to the cachemem directory base.
const HDM_DECODER_OFFSET: u64 = 0x100;
const BI_RT_OFFSET: u64 = 0x600;
const BI_DECODER_OFFSET: u64 = 0x680;
const CACHE_ID_RT_OFFSET: u64 = 0x700;

const HDM_CONTROL_COMMIT: u32 = 1 << 9;
const HDM_CONTROL_COMMITTED: u32 = 1 << 10;

/// Cache-ID route table shared between the register file and the CXL.cache
/// router. 16 entries in 256B flit mode.
pub struct CacheIdRouteTable {
    entries: Mutex<[u8; 16]>,
    committed: AtomicBool,
}

impl CacheIdRouteTable {
    pub fn new() -> Arc<Self> {
        Arc::new(CacheIdRouteTable {
            entries: Mutex::new([0; 16]),
            committed: AtomicBool::new(false),
        })
    }

    pub fn commit(&self, entries: [u8; 16]) {
        *self.entries.lock().unwrap() = entries;
        self.committed.store(true, Ordering::SeqCst);
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }

    /// Downstream port bound to `cache_id`, once the table is committed.
    pub fn get_target(&self, cache_id: u8) -> Option<u8> {
        if !self.is_committed() {
            return None;
        }
        self.entries
            .lock()
            .unwrap()
            .get(cache_id as usize)
            .copied()
    }
}

/// BI route table commit state (upstream ports).
pub struct BiRouteTable {
    committed: AtomicBool,
}

impl BiRouteTable {
    pub fn new() -> Arc<Self> {
        Arc::new(BiRouteTable {
            committed: AtomicBool::new(false),
        })
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }
}

/// BI decoder state (downstream ports and BI-capable devices).
pub struct BiDecoder {
    bi_enable: AtomicBool,
    bi_forward: AtomicBool,
    committed: AtomicBool,
}

impl BiDecoder {
    pub fn new(bi_forward: bool) -> Arc<Self> {
        Arc::new(BiDecoder {
            bi_enable: AtomicBool::new(false),
            bi_forward: AtomicBool::new(bi_forward),
            committed: AtomicBool::new(false),
        })
    }

    pub fn bi_enable(&self) -> bool {
        self.bi_enable.load(Ordering::SeqCst)
    }

    pub fn bi_forward(&self) -> bool {
        self.bi_forward.load(Ordering::SeqCst)
    }

    pub fn is_committed(&self) -> bool {
        self.committed.load(Ordering::SeqCst)
    }
}

/// Which decoder manager backs the HDM capability of this block.
#[derive(Clone)]
pub enum HdmBackend {
    Switch(Arc<SwitchHdmDecoderManager>),
    Device(Arc<DeviceHdmDecoderManager>),
}

impl HdmBackend {
    fn decoder_count(&self) -> usize {
        match self {
            HdmBackend::Switch(manager) => manager.decoder_count(),
            HdmBackend::Device(manager) => manager.decoder_count(),
        }
    }

    fn is_committed(&self, index: usize) -> bool {
        match self {
            HdmBackend::Switch(manager) => manager.is_committed(index),
            HdmBackend::Device(manager) => manager.is_committed(index),
        }
    }

    fn commit(&self, index: usize, config: HdmDecoderConfig) -> bool {
        match self {
            HdmBackend::Switch(manager) => manager.commit(index, config),
            HdmBackend::Device(manager) => manager.commit(index, config),
        }
    }
}

pub struct ComponentRegisterConfig {
    pub hdm: Option<HdmBackend>,
    pub bi_rt: Option<Arc<BiRouteTable>>,
    pub bi_decoder: Option<Arc<BiDecoder>>,
    pub cache_rt: Option<Arc<CacheIdRouteTable>>,
}

#[derive(Clone, Copy, Default)]
struct StagedDecoder {
    base_low: u32,
    base_high: u32,
    size_low: u32,
    size_high: u32,
    control: u32,
    extra_low: u32,
    extra_high: u32,
}

#[derive(Default)]
struct Staged {
    global_control: u32,
    decoders: Vec<StagedDecoder>,
    bi_rt_control: u32,
    bi_decoder_control: u32,
    cache_rt_control: u32,
    cache_rt_entries: [u32; 16],
}

pub struct ComponentRegisterBlock {
    scratch: Mutex<Vec<u8>>,
    directory: Vec<(u16, u64)>,
    hdm: Option<HdmBackend>,
    bi_rt: Option<Arc<BiRouteTable>>,
    bi_decoder: Option<Arc<BiDecoder>>,
    cache_rt: Option<Arc<CacheIdRouteTable>>,
    staged: Mutex<Staged>,
    label: String,
}

impl ComponentRegisterBlock {
    pub fn new(config: ComponentRegisterConfig, label: impl Into<String>) -> Arc<Self> {
        let mut directory = Vec::new();
        if config.hdm.is_some() {
            directory.push((CAP_ID_HDM_DECODER, HDM_DECODER_OFFSET));
        }
        if config.bi_rt.is_some() {
            directory.push((CAP_ID_BI_ROUTE_TABLE, BI_RT_OFFSET));
        }
        if config.bi_decoder.is_some() {
            directory.push((CAP_ID_BI_DECODER, BI_DECODER_OFFSET));
        }
        if config.cache_rt.is_some() {
            directory.push((CAP_ID_CACHE_ID_ROUTE_TABLE, CACHE_ID_RT_OFFSET));
        }
        let staged = Staged {
            decoders: vec![
                StagedDecoder::default();
                config.hdm.as_ref().map_or(0, |hdm| hdm.decoder_count())
            ],
            ..Default::default()
        };
        Arc::new(ComponentRegisterBlock {
            scratch: Mutex::new(vec![0; CACHEMEM_OFFSET as usize]),
            directory,
            hdm: config.hdm,
            bi_rt: config.bi_rt,
            bi_decoder: config.bi_decoder,
            cache_rt: config.cache_rt,
            staged: Mutex::new(staged),
            label: label.into(),
        })
    }

    pub fn size(&self) -> usize {
        COMPONENT_BLOCK_SIZE
    }

    pub fn read(&self, offset: u64, size: usize) -> u64 {
        if offset < CACHEMEM_OFFSET {
            let scratch = self.scratch.lock().unwrap();
            let mut value = 0u64;
            for i in (0..size.min(8)).rev() {
                let byte = scratch.get(offset as usize + i).copied().unwrap_or(0);
                value = value << 8 | u64::from(byte);
            }
            return value;
        }
        let rel = offset - CACHEMEM_OFFSET;
        u64::from(self.read_cachemem_dword(rel & !3))
    }

    pub fn write(&self, offset: u64, size: usize, value: u64) {
        if offset < CACHEMEM_OFFSET {
            let mut scratch = self.scratch.lock().unwrap();
            let bytes = value.to_le_bytes();
            for i in 0..size.min(8) {
                if let Some(byte) = scratch.get_mut(offset as usize + i) {
                    *byte = bytes[i];
                }
            }
            return;
        }
        let rel = offset - CACHEMEM_OFFSET;
        self.write_cachemem_dword(rel & !3, value as u32);
    }

    fn read_cachemem_dword(&self, rel: u64) -> u32 {
        let n = self.directory.len() as u32;
        if rel == 0 {
            return u32::from(CAP_ID_CXL) | 1 << 16 | 1 << 20 | n << 24;
        }
        let entry_index = (rel / 4).wrapping_sub(1);
        if rel % 4 == 0 && (entry_index as usize) < self.directory.len() && rel < 0x100 {
            let (id, offset) = self.directory[entry_index as usize];
            return u32::from(id) | 1 << 16 | (offset as u32) << 20;
        }
        if let Some(o) = rel.checked_sub(HDM_DECODER_OFFSET) {
            if rel < BI_RT_OFFSET {
                return self.read_hdm_dword(o);
            }
        }
        if let Some(o) = rel.checked_sub(BI_RT_OFFSET) {
            if rel < BI_DECODER_OFFSET {
                return self.read_bi_rt_dword(o);
            }
        }
        if let Some(o) = rel.checked_sub(BI_DECODER_OFFSET) {
            if rel < CACHE_ID_RT_OFFSET {
                return self.read_bi_decoder_dword(o);
            }
        }
        if let Some(o) = rel.checked_sub(CACHE_ID_RT_OFFSET) {
            return self.read_cache_rt_dword(o);
        }
        0
    }

    fn write_cachemem_dword(&self, rel: u64, value: u32) {
        if let Some(o) = rel.checked_sub(HDM_DECODER_OFFSET) {
            if rel < BI_RT_OFFSET {
                self.write_hdm_dword(o, value);
                return;
            }
        }
        if let Some(o) = rel.checked_sub(BI_RT_OFFSET) {
            if rel < BI_DECODER_OFFSET {
                self.write_bi_rt_dword(o, value);
                return;
            }
        }
        if let Some(o) = rel.checked_sub(BI_DECODER_OFFSET) {
            if rel < CACHE_ID_RT_OFFSET {
                self.write_bi_decoder_dword(o, value);
                return;
            }
        }
        if let Some(o) = rel.checked_sub(CACHE_ID_RT_OFFSET) {
            self.write_cache_rt_dword(o, value);
            return;
        }
        debug!("[{}] dropped write to cachemem offset 0x{rel:x}", self.label);
    }

    fn read_hdm_dword(&self, o: u64) -> u32 {
        let Some(hdm) = &self.hdm else { return 0 };
        let staged = self.staged.lock().unwrap();
        match o {
            0x0 => {
                let code = decoder_count_code(staged.decoders.len()).unwrap_or(0);
                u32::from(code) | 0x8 << 4
            }
            0x4 => staged.global_control,
            _ => {
                let Some(rel) = o.checked_sub(0x10) else { return 0 };
                let index = (rel / 0x20) as usize;
                let Some(decoder) = staged.decoders.get(index) else {
                    return 0;
                };
                match rel % 0x20 {
                    0x00 => decoder.base_low,
                    0x04 => decoder.base_high,
                    0x08 => decoder.size_low,
                    0x0C => decoder.size_high,
                    0x10 => {
                        let committed = if hdm.is_committed(index) {
                            HDM_CONTROL_COMMITTED
                        } else {
                            0
                        };
                        decoder.control | committed
                    }
                    0x14 => decoder.extra_low,
                    0x18 => decoder.extra_high,
                    _ => 0,
                }
            }
        }
    }

    fn write_hdm_dword(&self, o: u64, value: u32) {
        let Some(hdm) = &self.hdm else { return };
        let mut staged = self.staged.lock().unwrap();
        match o {
            0x0 => {}
            0x4 => staged.global_control = value,
            _ => {
                let Some(rel) = o.checked_sub(0x10) else { return };
                let index = (rel / 0x20) as usize;
                let Some(decoder) = staged.decoders.get_mut(index) else {
                    warn!("[{}] write to nonexistent decoder {index}", self.label);
                    return;
                };
                match rel % 0x20 {
                    0x00 => decoder.base_low = value,
                    0x04 => decoder.base_high = value,
                    0x08 => decoder.size_low = value,
                    0x0C => decoder.size_high = value,
                    0x10 => {
                        decoder.control = value & !HDM_CONTROL_COMMITTED;
                        if value & HDM_CONTROL_COMMIT != 0 {
                            let config = Self::decode_staged(decoder, hdm);
                            hdm.commit(index, config);
                        }
                    }
                    0x14 => decoder.extra_low = value,
                    0x18 => decoder.extra_high = value,
                    _ => {}
                }
            }
        }
    }

    fn decode_staged(decoder: &StagedDecoder, backend: &HdmBackend) -> HdmDecoderConfig {
        let mut config = HdmDecoderConfig {
            hpa_base: u64::from(decoder.base_high) << 32 | u64::from(decoder.base_low),
            hpa_size: u64::from(decoder.size_high) << 32 | u64::from(decoder.size_low),
            ig: (decoder.control & 0xF) as u8,
            iw: (decoder.control >> 4 & 0xF) as u8,
            ..Default::default()
        };
        match backend {
            HdmBackend::Switch(_) => {
                let low = decoder.extra_low.to_le_bytes();
                let high = decoder.extra_high.to_le_bytes();
                config.targets[..4].copy_from_slice(&low);
                config.targets[4..].copy_from_slice(&high);
            }
            HdmBackend::Device(_) => {
                config.dpa_skip =
                    u64::from(decoder.extra_high) << 32 | u64::from(decoder.extra_low);
            }
        }
        config
    }

    fn read_bi_rt_dword(&self, o: u64) -> u32 {
        let Some(bi_rt) = &self.bi_rt else { return 0 };
        match o {
            0x0 => 1, // explicit commit required
            0x4 => self.staged.lock().unwrap().bi_rt_control,
            0x8 => u32::from(bi_rt.is_committed()),
            _ => 0,
        }
    }

    fn write_bi_rt_dword(&self, o: u64, value: u32) {
        let Some(bi_rt) = &self.bi_rt else { return };
        if o == 0x4 {
            self.staged.lock().unwrap().bi_rt_control = value & !1;
            if value & 1 != 0 {
                bi_rt.committed.store(true, Ordering::SeqCst);
            }
        }
    }

    fn read_bi_decoder_dword(&self, o: u64) -> u32 {
        let Some(decoder) = &self.bi_decoder else { return 0 };
        match o {
            0x0 => 1, // explicit commit required
            0x4 => {
                u32::from(decoder.bi_forward()) | u32::from(decoder.bi_enable()) << 1
            }
            0x8 => u32::from(decoder.is_committed()),
            _ => 0,
        }
    }

    fn write_bi_decoder_dword(&self, o: u64, value: u32) {
        let Some(decoder) = &self.bi_decoder else { return };
        if o == 0x4 {
            self.staged.lock().unwrap().bi_decoder_control = value;
            decoder.bi_forward.store(value & 1 != 0, Ordering::SeqCst);
            decoder.bi_enable.store(value & 2 != 0, Ordering::SeqCst);
            if value & 4 != 0 {
                decoder.committed.store(true, Ordering::SeqCst);
            }
        }
    }

    fn read_cache_rt_dword(&self, o: u64) -> u32 {
        let Some(cache_rt) = &self.cache_rt else { return 0 };
        let staged = self.staged.lock().unwrap();
        match o {
            0x0 => 16, // cache ID target count
            0x4 => staged.cache_rt_control,
            0x8 => u32::from(cache_rt.is_committed()),
            _ => {
                let Some(rel) = o.checked_sub(0x10) else { return 0 };
                let index = (rel / 4) as usize;
                staged.cache_rt_entries.get(index).copied().unwrap_or(0)
            }
        }
    }

    fn write_cache_rt_dword(&self, o: u64, value: u32) {
        let Some(cache_rt) = &self.cache_rt else { return };
        let mut staged = self.staged.lock().unwrap();
        match o {
            0x0 | 0x8 => {}
            0x4 => {
                staged.cache_rt_control = value & !1;
                if value & 1 != 0 {
                    let mut entries = [0u8; 16];
                    for (entry, raw) in entries.iter_mut().zip(staged.cache_rt_entries.iter()) {
                        *entry = (*raw & 0xFF) as u8;
                    }
                    cache_rt.commit(entries);
                }
            }
            _ => {
                if let Some(rel) = o.checked_sub(0x10) {
                    let index = (rel / 4) as usize;
                    if let Some(entry) = staged.cache_rt_entries.get_mut(index) {
                        *entry = value;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn switch_block() -> (Arc<ComponentRegisterBlock>, Arc<SwitchHdmDecoderManager>) {
        let manager = Arc::new(SwitchHdmDecoderManager::new(4, "usp"));
        let cache_rt = CacheIdRouteTable::new();
        let block = ComponentRegisterBlock::new(
            ComponentRegisterConfig {
                hdm: Some(HdmBackend::Switch(manager.clone())),
                bi_rt: Some(BiRouteTable::new()),
                bi_decoder: None,
                cache_rt: Some(cache_rt),
            },
            "usp",
        );
        (block, manager)
    }

    #[test]
    fn scratch_region_round_trips() {
        let (block, _) = switch_block();
        block.write(0x0, 4, 0xDEAD_BEEF);
        assert_eq!(block.read(0x0, 4), 0xDEAD_BEEF);
    }

    #[test]
    fn capability_directory_lists_hdm_decoder() {
        let (block, _) = switch_block();
        let header = block.read(CACHEMEM_OFFSET, 4) as u32;
        assert_eq!(header & 0xFFFF, u32::from(CAP_ID_CXL));
        let array_size = header >> 24;
        let mut found = None;
        for i in 0..array_size as u64 {
            let entry = block.read(CACHEMEM_OFFSET + 4 + 4 * i, 4) as u32;
            if entry & 0xFFFF == u32::from(CAP_ID_HDM_DECODER) {
                found = Some(entry >> 20 & 0xFFF);
            }
        }
        assert_eq!(found, Some(HDM_DECODER_OFFSET as u32));
    }

    #[test]
    fn hdm_commit_is_observable_and_programs_the_manager() {
        let (block, manager) = switch_block();
        let hdm = CACHEMEM_OFFSET + HDM_DECODER_OFFSET;

        // Decoder 0 registers.
        block.write(hdm + 0x10, 4, 0x0000_0000); // base low
        block.write(hdm + 0x14, 4, 0x1); // base high -> 0x1_0000_0000
        block.write(hdm + 0x18, 4, 0x1000_0000); // size low
        block.write(hdm + 0x1C, 4, 0);
        block.write(hdm + 0x24, 4, 0x0000_0002); // target list: port 2
        assert_eq!(block.read(hdm + 0x20, 4) as u32 & HDM_CONTROL_COMMITTED, 0);

        block.write(hdm + 0x20, 4, u64::from(HDM_CONTROL_COMMIT));
        assert_ne!(block.read(hdm + 0x20, 4) as u32 & HDM_CONTROL_COMMITTED, 0);
        assert_eq!(manager.get_target(0x1_0000_0040), Some(2));
    }

    #[test]
    fn cache_route_table_commits_entries() {
        let manager = Arc::new(SwitchHdmDecoderManager::new(1, "usp"));
        let cache_rt = CacheIdRouteTable::new();
        let block = ComponentRegisterBlock::new(
            ComponentRegisterConfig {
                hdm: Some(HdmBackend::Switch(manager)),
                bi_rt: None,
                bi_decoder: None,
                cache_rt: Some(cache_rt.clone()),
            },
            "usp",
        );
        let rt = CACHEMEM_OFFSET + CACHE_ID_RT_OFFSET;
        block.write(rt + 0x10, 4, 3); // cache_id 0 -> port 3
        assert_eq!(cache_rt.get_target(0), None);
        block.write(rt + 0x4, 4, 1); // commit
        assert_eq!(cache_rt.get_target(0), Some(3));
        assert_eq!(block.read(rt + 0x8, 4), 1);
    }
}
