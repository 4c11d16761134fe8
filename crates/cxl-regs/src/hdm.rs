//! HDM decoder managers.
//!
//! A decoder maps an HPA window onto either a downstream port (switch
//! decoders) or a device physical address (device decoders). Decoders only
//! participate in lookups once committed; commit happens atomically when the
//! control register is written with the commit bit set.
//!
//! Interleaving follows the CXL 3.0 modulo layout: with `iw` encoding
//! 2^iw ways and granularity `2^(ig + 8)` bytes, the target way is
//! `(hpa >> (ig + 8)) % ways` and the DPA compresses the way-select bits out
//! of the window offset.

use std::sync::Mutex;

use tracing::{info, warn};

/// Decoder-count encoding of the HDM decoder capability register.
pub const DECODER_COUNT_MAP: [usize; 13] = [1, 2, 4, 6, 8, 10, 12, 14, 16, 20, 24, 28, 32];

pub fn decoder_count_code(count: usize) -> Option<u8> {
    DECODER_COUNT_MAP
        .iter()
        .position(|&c| c == count)
        .map(|i| i as u8)
}

#[derive(Clone, Copy, Debug, Default)]
pub struct HdmDecoderConfig {
    pub hpa_base: u64,
    pub hpa_size: u64,
    /// Interleave granularity code: granularity is `2^(ig + 8)` bytes.
    pub ig: u8,
    /// Interleave ways code: `2^iw` ways; 0 means no interleaving.
    pub iw: u8,
    /// Switch decoders: target port per way.
    pub targets: [u8; 8],
    /// Device decoders: DPA offset preceding this decoder's window.
    pub dpa_skip: u64,
}

#[derive(Clone, Copy, Debug, Default)]
struct Decoder {
    config: HdmDecoderConfig,
    committed: bool,
}

impl Decoder {
    fn contains(&self, hpa: u64) -> bool {
        self.committed
            && hpa >= self.config.hpa_base
            && hpa < self.config.hpa_base.wrapping_add(self.config.hpa_size)
    }

    fn ways(&self) -> u64 {
        1u64 << self.config.iw
    }

    fn way_shift(&self) -> u32 {
        u32::from(self.config.ig) + 8
    }

    fn way(&self, hpa: u64) -> u64 {
        (hpa >> self.way_shift()) % self.ways()
    }

    /// Window offset with the way-select bits compressed out.
    fn compress(&self, offset: u64) -> u64 {
        if self.config.iw == 0 {
            return offset;
        }
        let shift = self.way_shift();
        let low_mask = (1u64 << shift) - 1;
        (offset >> (shift + u32::from(self.config.iw))) << shift | (offset & low_mask)
    }

    /// Inverse of `compress` for a given way.
    fn decompress(&self, dpa_offset: u64, way: u64) -> u64 {
        if self.config.iw == 0 {
            return dpa_offset;
        }
        let shift = self.way_shift();
        let low_mask = (1u64 << shift) - 1;
        (dpa_offset >> shift) << (shift + u32::from(self.config.iw))
            | way << shift
            | (dpa_offset & low_mask)
    }
}

/// Switch-side decoder set: HPA -> downstream port index.
pub struct SwitchHdmDecoderManager {
    decoders: Mutex<Vec<Decoder>>,
    label: String,
}

impl SwitchHdmDecoderManager {
    pub fn new(decoder_count: usize, label: impl Into<String>) -> Self {
        SwitchHdmDecoderManager {
            decoders: Mutex::new(vec![Decoder::default(); decoder_count]),
            label: label.into(),
        }
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.lock().unwrap().len()
    }

    pub fn is_committed(&self, index: usize) -> bool {
        self.decoders
            .lock()
            .unwrap()
            .get(index)
            .is_some_and(|d| d.committed)
    }

    pub fn commit(&self, index: usize, config: HdmDecoderConfig) -> bool {
        let mut decoders = self.decoders.lock().unwrap();
        let Some(decoder) = decoders.get_mut(index) else {
            warn!("[{}] decoder index {index} out of range", self.label);
            return false;
        };
        decoder.config = config;
        decoder.committed = true;
        info!(
            "[{}] decoder {index} committed: base 0x{:x} size 0x{:x} iw {} ig {}",
            self.label, config.hpa_base, config.hpa_size, config.iw, config.ig
        );
        true
    }

    /// Downstream port for `hpa`, from the first committed decoder whose
    /// window contains it.
    pub fn get_target(&self, hpa: u64) -> Option<u8> {
        let decoders = self.decoders.lock().unwrap();
        let decoder = decoders.iter().find(|d| d.contains(hpa))?;
        let way = decoder.way(hpa - decoder.config.hpa_base);
        Some(decoder.config.targets[way as usize % decoder.config.targets.len()])
    }
}

/// Device-side decoder set: HPA -> DPA and back.
pub struct DeviceHdmDecoderManager {
    decoders: Mutex<Vec<Decoder>>,
    label: String,
}

impl DeviceHdmDecoderManager {
    pub fn new(decoder_count: usize, label: impl Into<String>) -> Self {
        DeviceHdmDecoderManager {
            decoders: Mutex::new(vec![Decoder::default(); decoder_count]),
            label: label.into(),
        }
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.lock().unwrap().len()
    }

    pub fn is_committed(&self, index: usize) -> bool {
        self.decoders
            .lock()
            .unwrap()
            .get(index)
            .is_some_and(|d| d.committed)
    }

    pub fn commit(&self, index: usize, config: HdmDecoderConfig) -> bool {
        let mut decoders = self.decoders.lock().unwrap();
        let Some(decoder) = decoders.get_mut(index) else {
            warn!("[{}] decoder index {index} out of range", self.label);
            return false;
        };
        decoder.config = config;
        decoder.committed = true;
        info!(
            "[{}] decoder {index} committed: base 0x{:x} size 0x{:x} skip 0x{:x}",
            self.label, config.hpa_base, config.hpa_size, config.dpa_skip
        );
        true
    }

    pub fn get_dpa(&self, hpa: u64) -> Option<u64> {
        let decoders = self.decoders.lock().unwrap();
        let decoder = decoders.iter().find(|d| d.contains(hpa))?;
        let offset = hpa - decoder.config.hpa_base;
        Some(decoder.config.dpa_skip + decoder.compress(offset))
    }

    /// Inverse mapping used when raising back-invalidation snoops.
    pub fn get_hpa(&self, dpa: u64) -> Option<u64> {
        let decoders = self.decoders.lock().unwrap();
        for decoder in decoders.iter().filter(|d| d.committed) {
            if dpa < decoder.config.dpa_skip {
                continue;
            }
            let dpa_offset = dpa - decoder.config.dpa_skip;
            let window = decoder.config.hpa_size >> decoder.config.iw;
            if dpa_offset >= window {
                continue;
            }
            // Without interleaving the way is irrelevant; with it, this
            // device serves exactly one way of the set, which the driver
            // records in targets[0] at commit time.
            let way = u64::from(decoder.config.targets[0]) % decoder.ways();
            return Some(decoder.config.hpa_base + decoder.decompress(dpa_offset, way));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uncommitted_decoders_do_not_decode() {
        let manager = SwitchHdmDecoderManager::new(4, "usp");
        assert_eq!(manager.get_target(0x1_0000_0000), None);
    }

    #[test]
    fn switch_targets_whole_window() {
        let manager = SwitchHdmDecoderManager::new(4, "usp");
        let mut targets = [0u8; 8];
        targets[0] = 3;
        manager.commit(
            0,
            HdmDecoderConfig {
                hpa_base: 0x1_0000_0000,
                hpa_size: 0x1000_0000,
                targets,
                ..Default::default()
            },
        );
        for hpa in [0x1_0000_0000u64, 0x1_0800_0040, 0x1_0FFF_FFC0] {
            assert_eq!(manager.get_target(hpa), Some(3));
        }
        assert_eq!(manager.get_target(0x1_1000_0000), None);
        assert_eq!(manager.get_target(0x0_FFFF_FFC0), None);
    }

    #[test]
    fn two_way_interleave_alternates_targets() {
        let manager = SwitchHdmDecoderManager::new(4, "usp");
        let mut targets = [0u8; 8];
        targets[0] = 1;
        targets[1] = 2;
        manager.commit(
            0,
            HdmDecoderConfig {
                hpa_base: 0,
                hpa_size: 0x10000,
                ig: 0, // 256-byte granules
                iw: 1, // two ways
                targets,
                ..Default::default()
            },
        );
        assert_eq!(manager.get_target(0x000), Some(1));
        assert_eq!(manager.get_target(0x100), Some(2));
        assert_eq!(manager.get_target(0x200), Some(1));
        assert_eq!(manager.get_target(0x340), Some(2));
    }

    #[test]
    fn device_dpa_applies_skip_and_round_trips() {
        let manager = DeviceHdmDecoderManager::new(4, "dev");
        manager.commit(
            0,
            HdmDecoderConfig {
                hpa_base: 0x1_0000_0000,
                hpa_size: 0x1000_0000,
                dpa_skip: 0x100000,
                ..Default::default()
            },
        );
        assert_eq!(manager.get_dpa(0x1_0000_0040), Some(0x100040));
        assert_eq!(manager.get_hpa(0x100040), Some(0x1_0000_0040));
        assert_eq!(manager.get_dpa(0x2_0000_0000), None);
    }

    #[test]
    fn interleaved_device_compresses_way_bits() {
        let manager = DeviceHdmDecoderManager::new(1, "dev");
        // Two-way set, this device serving way 1, 256-byte granules.
        let mut targets = [0u8; 8];
        targets[0] = 1;
        manager.commit(
            0,
            HdmDecoderConfig {
                hpa_base: 0,
                hpa_size: 0x2000,
                ig: 0,
                iw: 1,
                targets,
                ..Default::default()
            },
        );
        // HPA 0x100 is granule 1 -> way 1, first granule of this device.
        assert_eq!(manager.get_dpa(0x100), Some(0x000));
        // HPA 0x300 is granule 3 -> way 1, second granule.
        assert_eq!(manager.get_dpa(0x300), Some(0x100));
        assert_eq!(manager.get_hpa(0x000), Some(0x100));
        assert_eq!(manager.get_hpa(0x100), Some(0x300));
    }
}
