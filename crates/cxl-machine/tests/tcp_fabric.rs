//! Port fabric over TCP: a host edge and a device edge both connect through
//! sockets, enumerate, and run a CXL.mem round trip end to end.

use std::sync::Arc;

use cxl_cache::accessor::BackingStore;
use cxl_device::devices::CxlType3Device;
use cxl_host::drivers::{CxlMemDriver, RootPortDevice};
use cxl_machine::{EndpointKind, MachineBuilder};
use cxl_protocol::fabric::FabricPortClient;
use cxl_protocol::packet::CacheLineData;
use cxl_protocol::wire::PortClientKind;

const SIZE_256MB: u64 = 256 << 20;
const HPA_BASE: u64 = 0x1_0000_0000;

#[tokio::test]
async fn fabric_round_trip_over_sockets() {
    // The switch owns the DSP slot; the device itself arrives over TCP.
    let mut machine = MachineBuilder::new()
        .endpoint(EndpointKind::Empty, true)
        .with_fabric_server("127.0.0.1:0")
        .build()
        .await
        .unwrap();
    machine.start().await;
    let fabric_addr = machine.switch.fabric_addr().expect("fabric listening");

    // Device side: a Type 3 behind a fabric client on port 1.
    let device_edge = FabricPortClient::connect(fabric_addr, 1, PortClientKind::Type3)
        .await
        .unwrap();
    let device = Arc::new(
        CxlType3Device::new(
            device_edge.connection(),
            SIZE_256MB,
            BackingStore::Anonymous,
            1,
            "remote-sld",
        )
        .unwrap(),
    );
    let device_runner = device.clone();
    let device_task = tokio::spawn(async move { device_runner.run().await });
    device.wait_for_ready().await;

    // Host side: the raw root-port accessor behind a fabric client on port 0.
    let host_edge = FabricPortClient::connect(fabric_addr, 0, PortClientKind::RootPort)
        .await
        .unwrap();
    let root_port = RootPortDevice::new(host_edge.connection().clone());

    let enumeration = root_port.enumerate(0xFE00_0000).await.unwrap();
    let cxl = root_port.scan_cxl_devices(&enumeration).await.unwrap();
    let usp = cxl
        .devices()
        .iter()
        .find(|device| device.is_upstream_port())
        .expect("USP visible over the fabric");
    cxl.enable_hdm_decoder(usp).await.unwrap();
    let mem_device = cxl
        .devices()
        .iter()
        .find(|device| device.is_cxl_memory_device())
        .expect("remote device visible over the fabric");
    assert!(
        CxlMemDriver::attach_single_mem_device(&cxl, mem_device, HPA_BASE, SIZE_256MB)
            .await
            .unwrap()
    );

    root_port
        .cxl_mem_write(HPA_BASE, CacheLineData::from_u64(0xFACE_FEED))
        .await
        .unwrap();
    assert_eq!(
        root_port.cxl_mem_read(HPA_BASE).await.unwrap().as_u64(),
        0xFACE_FEED
    );

    let _ = device.stop().await;
    device_task.abort();
    host_edge.shutdown();
    device_edge.shutdown();
    machine.stop().await;
}
