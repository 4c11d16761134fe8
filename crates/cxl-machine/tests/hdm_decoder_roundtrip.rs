//! HDM decoder attach + CXL.mem round trip across three 256 MiB devices:
//! each device is mapped 256 MiB apart and a write through the fabric reads
//! back from the right device.

use cxl_cache::accessor::BackingStore;
use cxl_host::drivers::CxlMemDriver;
use cxl_machine::{EndpointKind, MachineBuilder};
use cxl_protocol::packet::CacheLineData;

const SIZE_256MB: u64 = 256 << 20;
const HPA_BASE: u64 = 0x1_0000_0000;

fn type3() -> EndpointKind {
    EndpointKind::Type3 {
        memory_size: SIZE_256MB,
        backing: BackingStore::Anonymous,
    }
}

#[tokio::test]
async fn cxl_mem_round_trip_across_three_devices() {
    let mut machine = MachineBuilder::new()
        .endpoint(type3(), true)
        .endpoint(type3(), true)
        .endpoint(type3(), true)
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
        .expect("USP found");
    cxl.enable_hdm_decoder(usp).await.unwrap();

    let devices = CxlMemDriver::memory_devices(&cxl);
    assert_eq!(devices.len(), 3);
    for (index, device) in devices.iter().enumerate() {
        let attached = CxlMemDriver::attach_single_mem_device(
            &cxl,
            device,
            HPA_BASE + index as u64 * SIZE_256MB,
            SIZE_256MB,
        )
        .await
        .unwrap();
        assert!(attached, "device {index} attached");
    }

    // Distinct value per device; each one must come back from its own
    // backing store.
    for index in 0..3u64 {
        let hpa = HPA_BASE + index * SIZE_256MB;
        root_port
            .cxl_mem_write(hpa, CacheLineData::from_u64(0xDEAD_BEEF + index))
            .await
            .unwrap();
    }
    for index in 0..3u64 {
        let hpa = HPA_BASE + index * SIZE_256MB;
        let line = root_port.cxl_mem_read(hpa).await.unwrap();
        assert_eq!(line.as_u64(), 0xDEAD_BEEF + index);
    }

    // An HPA within a window but off the first line still round-trips.
    let hpa = HPA_BASE + SIZE_256MB + 0x40;
    root_port
        .cxl_mem_write(hpa, CacheLineData::from_u64(0xCAFE))
        .await
        .unwrap();
    assert_eq!(root_port.cxl_mem_read(hpa).await.unwrap().as_u64(), 0xCAFE);

    machine.stop().await;
}
