//! Flat-byte-buffer register file with attribute-aware masking.
//!
//! A register file is declared as a set of `(byte range, attribute, default)`
//! fields over a shared buffer. Reads return raw bytes; writes are filtered
//! through a per-bit write mask derived from the field attributes, and
//! write-1-to-clear bits are cleared when written with one. Hardware-side
//! updates bypass the masks through [`RegisterBlock::set`].

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldAttr {
    /// Read-only, software writes ignored.
    Ro,
    /// Read-write.
    Rw,
    /// Write 1 to clear.
    Rw1c,
    /// Initialized by hardware, read-only afterwards.
    HwInit,
    /// Reserved, reads zero, writes ignored.
    Reserved,
}

#[derive(Clone)]
pub struct RegisterBlock {
    bytes: Vec<u8>,
    write_mask: Vec<u8>,
    w1c_mask: Vec<u8>,
}

impl RegisterBlock {
    pub fn new(size: usize) -> Self {
        RegisterBlock {
            bytes: vec![0; size],
            write_mask: vec![0; size],
            w1c_mask: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Declares a field over `start..=end` (inclusive byte offsets) with every
    /// bit of the range governed by `attr`.
    pub fn add_field(&mut self, start: usize, end: usize, attr: FieldAttr, default: u64) {
        let mask = if end - start >= 7 {
            u64::MAX
        } else {
            (1u64 << ((end - start + 1) * 8)) - 1
        };
        self.add_field_masked(start, end, attr, default, mask);
    }

    /// Declares a field where only the bits set in `bit_mask` follow `attr`
    /// (BARs: address bits writable, type bits hardwired).
    pub fn add_field_masked(
        &mut self,
        start: usize,
        end: usize,
        attr: FieldAttr,
        default: u64,
        bit_mask: u64,
    ) {
        let default = default.to_le_bytes();
        let bit_mask = bit_mask.to_le_bytes();
        for (i, offset) in (start..=end).enumerate() {
            if i < 8 {
                self.bytes[offset] |= default[i];
            }
            let mask_byte = if i < 8 { bit_mask[i] } else { 0 };
            match attr {
                FieldAttr::Rw => self.write_mask[offset] |= mask_byte,
                FieldAttr::Rw1c => self.w1c_mask[offset] |= mask_byte,
                FieldAttr::Ro | FieldAttr::HwInit | FieldAttr::Reserved => {}
            }
        }
    }

    pub fn read(&self, offset: usize, size: usize) -> u64 {
        let mut value = 0u64;
        for i in (0..size.min(8)).rev() {
            value = value << 8 | u64::from(*self.bytes.get(offset + i).unwrap_or(&0));
        }
        value
    }

    /// Software write: masked by field attributes.
    pub fn write(&mut self, offset: usize, size: usize, value: u64) {
        let value = value.to_le_bytes();
        for i in 0..size.min(8) {
            let Some(byte) = self.bytes.get_mut(offset + i) else {
                return;
            };
            let wmask = self.write_mask[offset + i];
            let w1c = self.w1c_mask[offset + i];
            *byte = (*byte & !wmask) | (value[i] & wmask);
            *byte &= !(value[i] & w1c);
        }
    }

    /// Hardware-side update: ignores attributes.
    pub fn set(&mut self, offset: usize, size: usize, value: u64) {
        let value = value.to_le_bytes();
        for i in 0..size.min(8) {
            if let Some(byte) = self.bytes.get_mut(offset + i) {
                *byte = value[i];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_only_fields_ignore_writes() {
        let mut regs = RegisterBlock::new(8);
        regs.add_field(0, 1, FieldAttr::HwInit, 0x1234);
        regs.write(0, 2, 0xFFFF);
        assert_eq!(regs.read(0, 2), 0x1234);
    }

    #[test]
    fn rw_fields_round_trip() {
        let mut regs = RegisterBlock::new(8);
        regs.add_field(4, 7, FieldAttr::Rw, 0);
        regs.write(4, 4, 0xDEAD_BEEF);
        assert_eq!(regs.read(4, 4), 0xDEAD_BEEF);
    }

    #[test]
    fn w1c_bits_clear_on_one() {
        let mut regs = RegisterBlock::new(2);
        regs.add_field(0, 1, FieldAttr::Rw1c, 0);
        regs.set(0, 2, 0b1010);
        // Writing zero leaves the bits alone.
        regs.write(0, 2, 0);
        assert_eq!(regs.read(0, 2), 0b1010);
        // Writing one clears exactly the written bits.
        regs.write(0, 2, 0b0010);
        assert_eq!(regs.read(0, 2), 0b1000);
    }

    #[test]
    fn masked_field_limits_writable_bits() {
        let mut regs = RegisterBlock::new(4);
        // BAR-style: top bits writable, low nibble hardwired.
        regs.add_field_masked(0, 3, FieldAttr::Rw, 0x0000_0008, 0xFFFF_F000);
        regs.write(0, 4, 0xFFFF_FFFF);
        assert_eq!(regs.read(0, 4), 0xFFFF_F008);
        regs.write(0, 4, 0xFE00_0000);
        assert_eq!(regs.read(0, 4), 0xFE00_0008);
    }
}
