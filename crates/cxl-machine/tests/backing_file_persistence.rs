//! Device memory backing files are raw byte images of the device capacity:
//! a line written over CXL.mem lands at its DPA in the file and survives the
//! machine.

use std::io::Read;

use cxl_cache::accessor::BackingStore;
use cxl_host::drivers::CxlMemDriver;
use cxl_machine::{EndpointKind, MachineBuilder};
use cxl_protocol::packet::CacheLineData;

const SIZE_256MB: u64 = 256 << 20;
const HPA_BASE: u64 = 0x1_0000_0000;

#[tokio::test]
async fn writes_land_in_the_backing_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mem1.bin");

    let mut machine = MachineBuilder::new()
        .endpoint(
            EndpointKind::Type3 {
                memory_size: SIZE_256MB,
                backing: BackingStore::File(path.clone()),
            },
            true,
        )
        .build()
        .await
        .unwrap();
    machine.start().await;

    let root_port = machine.root_port();
    let enumeration = root_port.enumerate(0xFE00_0000).await.unwrap();
    let cxl = root_port.scan_cxl_devices(&enumeration).await.unwrap();
    let usp = cxl
        .devices()
        .iter()
        .find(|device| device.is_upstream_port())
        .unwrap();
    cxl.enable_hdm_decoder(usp).await.unwrap();
    let device = cxl
        .devices()
        .iter()
        .find(|device| device.is_cxl_memory_device())
        .unwrap();
    assert!(
        CxlMemDriver::attach_single_mem_device(&cxl, device, HPA_BASE, SIZE_256MB)
            .await
            .unwrap()
    );

    let dpa = 0x8040u64;
    root_port
        .cxl_mem_write(HPA_BASE + dpa, CacheLineData::from_u64(0x0123_4567_89AB_CDEF))
        .await
        .unwrap();
    machine.stop().await;

    // The image is the full capacity, with the line at its DPA.
    let mut file = std::fs::File::open(&path).unwrap();
    assert_eq!(file.metadata().unwrap().len(), SIZE_256MB);
    let mut buf = [0u8; 8];
    std::io::Seek::seek(&mut file, std::io::SeekFrom::Start(dpa)).unwrap();
    file.read_exact(&mut buf).unwrap();
    assert_eq!(u64::from_le_bytes(buf), 0x0123_4567_89AB_CDEF);
}
