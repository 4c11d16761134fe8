//! HDM-DB with back-invalidation: the host caches device memory, the
//! accelerator's own store forces a BISnp that pulls the line back, and both
//! sides keep observing the latest data.

use cxl_cache::accessor::BackingStore;
use cxl_cache::controller::MemAddrType;
use cxl_host::drivers::{CxlMemDriver, PciBusDriver};
use cxl_machine::{CohPolicy, Endpoint, EndpointKind, MachineBuilder};
use cxl_protocol::packet::CacheLineData;

const SIZE_256MB: u64 = 256 << 20;
const HPA_BASE: u64 = 0x1_0000_0000;

#[tokio::test]
async fn device_store_back_invalidates_the_host_copy() {
    let mut machine = MachineBuilder::new()
        .endpoint(
            EndpointKind::Type2 {
                memory_size: SIZE_256MB,
                backing: BackingStore::Anonymous,
            },
            true,
        )
        .build()
        .await
        .unwrap();
    machine.start().await;
    let host = machine
        .start_host(0x10000, CohPolicy::DotMemBi)
        .await
        .unwrap();

    let root_complex = host.memory_hub().root_complex().clone();
    let pci = PciBusDriver::new(root_complex.as_ref());
    let enumeration = pci
        .scan(root_complex.enumeration_start_bus(), 0xFE00_0000)
        .await
        .unwrap();
    let mut cxl = cxl_host::drivers::CxlBusDriver::new(root_complex.as_ref());
    cxl.init(&enumeration.devices).await.unwrap();

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
    host.memory_hub()
        .add_mem_range(HPA_BASE, SIZE_256MB, MemAddrType::CxlCachedBi);

    let accelerator = match &machine.endpoints[0] {
        Endpoint::Type2(device) => device.clone(),
        _ => unreachable!(),
    };
    let cpu = host.cpu().clone();

    // Host takes the line exclusively; the device tracks the host copy.
    cpu.store_bytes(HPA_BASE, CacheLineData::from_u64(0x11).as_bytes())
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    cpu.load_bytes(HPA_BASE, &mut buf).await.unwrap();
    assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0x11);

    // The accelerator stores to the same DPA: the snoop filter forces a
    // back-invalidation of the host copy before the device takes ownership.
    accelerator
        .processor()
        .store(0x0, CacheLineData::from_u64(0x22))
        .await;

    // The host's next read misses locally and observes the device's data.
    cpu.load_bytes(HPA_BASE, &mut buf).await.unwrap();
    assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0x22);

    // The accelerator still sees its own line.
    assert_eq!(accelerator.processor().load(0x0).await.as_u64(), 0x22);

    machine.stop().await;
}
