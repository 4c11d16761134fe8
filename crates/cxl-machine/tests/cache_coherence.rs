//! CXL.cache coherence between the host CPU and a Type 1 accelerator
//! sharing a host DRAM line: each writer's store is observed by the other
//! reader, with ownership migrating through snoops.

use cxl_host::drivers::PciBusDriver;
use cxl_machine::{CohPolicy, EndpointKind, MachineBuilder};
use cxl_machine::Endpoint;
use cxl_cache::controller::MemAddrType;
use cxl_protocol::packet::{Bdf, CacheLineData};

const SYS_MEM_SIZE: u64 = 0x10000;
const LINE: u64 = 0x40;

#[tokio::test]
async fn host_and_accelerator_observe_each_others_stores() {
    let mut machine = MachineBuilder::new()
        .endpoint(EndpointKind::Type1, true)
        .build()
        .await
        .unwrap();
    machine.start().await;
    let host = machine
        .start_host(SYS_MEM_SIZE, CohPolicy::DotCache)
        .await
        .unwrap();

    // Enumerate through the root complex and program the cache route table:
    // cache ID 0 lives behind physical port 1.
    let root_complex = host.memory_hub().root_complex().clone();
    let driver = PciBusDriver::new(root_complex.as_ref());
    let enumeration = driver
        .scan(root_complex.enumeration_start_bus(), 0xFE00_0000)
        .await
        .unwrap();
    let usp_bar = enumeration.find(Bdf::new(1, 0, 0)).unwrap().bar_base;
    let cache_rt = usp_bar + 0x1000 + 0x700;
    root_complex.write_mmio(cache_rt + 0x10, 4, 1).await.unwrap(); // entry 0 -> port 1
    root_complex.write_mmio(cache_rt + 0x4, 4, 1).await.unwrap(); // commit
    assert_eq!(root_complex.read_mmio(cache_rt + 0x8, 4).await.unwrap(), 1);

    host.memory_hub()
        .add_mem_range(0, SYS_MEM_SIZE, MemAddrType::Dram);

    let accelerator = match &machine.endpoints[0] {
        Endpoint::Type1(device) => device.clone(),
        _ => unreachable!(),
    };
    let cpu = host.cpu().clone();

    // CPU-A writes, CPU-B reads it through CXL.cache.
    cpu.store_bytes(LINE, CacheLineData::from_u64(0xAA).as_bytes())
        .await
        .unwrap();
    let observed = accelerator.processor().load(LINE).await;
    assert_eq!(observed.as_u64(), 0xAA);

    // CPU-B takes ownership and writes; CPU-A re-reads the new value.
    accelerator
        .processor()
        .store(LINE, CacheLineData::from_u64(0xBB))
        .await;
    let mut buf = [0u8; 64];
    cpu.load_bytes(LINE, &mut buf).await.unwrap();
    assert_eq!(u64::from_le_bytes(buf[..8].try_into().unwrap()), 0xBB);

    // Another round trip the other way keeps the line coherent.
    cpu.store_bytes(LINE, CacheLineData::from_u64(0xCC).as_bytes())
        .await
        .unwrap();
    assert_eq!(accelerator.processor().load(LINE).await.as_u64(), 0xCC);

    machine.stop().await;
}
