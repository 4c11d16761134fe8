//! Byte-addressable backing store for DRAM and device memory.
//!
//! Backs onto a regular file (grown to capacity at creation) or anonymous
//! memory. 64-byte aligned accesses are the common case; no caching happens
//! at this layer. Out-of-range accesses are backend errors surfaced to the
//! caller.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Mutex;

use std::os::unix::fs::FileExt;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AccessorError {
    #[error("access at 0x{offset:x}+{len} exceeds capacity 0x{capacity:x}")]
    OutOfRange {
        offset: u64,
        len: usize,
        capacity: u64,
    },
    #[error("backing i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a backing store lives. Devices and the system DRAM both pick one.
pub enum BackingStore {
    File(std::path::PathBuf),
    Anonymous,
}

impl BackingStore {
    pub fn open(&self, capacity: u64) -> Result<MemoryAccessor, AccessorError> {
        match self {
            BackingStore::File(path) => MemoryAccessor::file(path, capacity),
            BackingStore::Anonymous => Ok(MemoryAccessor::anonymous(capacity)),
        }
    }
}

enum Backing {
    File(File),
    Anon(Mutex<Vec<u8>>),
}

pub struct MemoryAccessor {
    backing: Backing,
    capacity: u64,
}

impl MemoryAccessor {
    /// Opens (or creates) a regular file or character device of `capacity`
    /// bytes. Regular files are grown to the full capacity so the image on
    /// disk always matches the device's advertised size.
    pub fn file(path: impl AsRef<Path>, capacity: u64) -> Result<Self, AccessorError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let metadata = file.metadata()?;
        if metadata.is_file() && metadata.len() < capacity {
            file.set_len(capacity)?;
        }
        Ok(MemoryAccessor {
            backing: Backing::File(file),
            capacity,
        })
    }

    pub fn anonymous(capacity: u64) -> Self {
        MemoryAccessor {
            backing: Backing::Anon(Mutex::new(vec![0; capacity as usize])),
            capacity,
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<(), AccessorError> {
        if offset.checked_add(len as u64).map_or(true, |end| end > self.capacity) {
            return Err(AccessorError::OutOfRange {
                offset,
                len,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) -> Result<(), AccessorError> {
        self.check_range(offset, buf.len())?;
        match &self.backing {
            Backing::File(file) => file.read_exact_at(buf, offset)?,
            Backing::Anon(bytes) => {
                let bytes = bytes.lock().unwrap();
                let start = offset as usize;
                buf.copy_from_slice(&bytes[start..start + buf.len()]);
            }
        }
        Ok(())
    }

    pub fn write(&self, offset: u64, data: &[u8]) -> Result<(), AccessorError> {
        self.check_range(offset, data.len())?;
        match &self.backing {
            Backing::File(file) => file.write_all_at(data, offset)?,
            Backing::Anon(bytes) => {
                let mut bytes = bytes.lock().unwrap();
                let start = offset as usize;
                bytes[start..start + data.len()].copy_from_slice(data);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_round_trip() {
        let accessor = MemoryAccessor::anonymous(0x1000);
        accessor.write(0x40, &[0xAA; 64]).unwrap();
        let mut buf = [0u8; 64];
        accessor.read(0x40, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; 64]);
    }

    #[test]
    fn file_backing_persists_and_sizes_the_image() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mem.bin");
        let accessor = MemoryAccessor::file(&path, 0x2000).unwrap();
        accessor.write(0x1FC0, &[0x5A; 64]).unwrap();
        drop(accessor);

        assert_eq!(std::fs::metadata(&path).unwrap().len(), 0x2000);
        let accessor = MemoryAccessor::file(&path, 0x2000).unwrap();
        let mut buf = [0u8; 64];
        accessor.read(0x1FC0, &mut buf).unwrap();
        assert_eq!(buf, [0x5A; 64]);
    }

    #[test]
    fn out_of_range_is_an_error() {
        let accessor = MemoryAccessor::anonymous(0x100);
        let mut buf = [0u8; 64];
        assert!(matches!(
            accessor.read(0xC1, &mut buf),
            Err(AccessorError::OutOfRange { .. })
        ));
    }
}
