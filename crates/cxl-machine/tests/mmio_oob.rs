//! MMIO out-of-bounds semantics: writes outside every BAR and bridge window
//! are dropped, reads complete with zero data.

use cxl_cache::accessor::BackingStore;
use cxl_host::drivers::HostIo;
use cxl_machine::{EndpointKind, MachineBuilder};
use cxl_protocol::packet::Bdf;

const MEM_SIZE: u64 = 1 << 20;
const MMIO_BASE: u64 = 0xFE00_0000;

#[tokio::test]
async fn oob_mmio_reads_zero_and_writes_are_dropped() {
    let mut machine = MachineBuilder::new()
        .endpoint(
            EndpointKind::Type3 {
                memory_size: MEM_SIZE,
                backing: BackingStore::Anonymous,
            },
            true,
        )
        .build()
        .await
        .unwrap();
    machine.start().await;

    let root_port = machine.root_port();
    let enumeration = root_port.enumerate(MMIO_BASE).await.unwrap();
    let usp = enumeration.find(Bdf::new(1, 0, 0)).expect("USP enumerated");
    assert_ne!(usp.memory_limit, 0, "enumeration set the bridge window");

    // Inside the endpoint's BAR the scratch region reads back what was
    // written, which pins down the working path before probing the edges.
    let endpoint = enumeration.find(Bdf::new(3, 0, 0)).unwrap();
    root_port
        .write_mmio(endpoint.bar_base + 0x20, 4, 0x1234_5678)
        .await
        .unwrap();
    assert_eq!(
        root_port.read_mmio(endpoint.bar_base + 0x20, 4).await.unwrap(),
        0x1234_5678
    );

    // Below the window: dropped write, zero read.
    let below = usp.memory_base - 4;
    root_port.write_mmio(below, 4, 0xDEAD_BEEF).await.unwrap();
    assert_eq!(root_port.read_mmio(below, 4).await.unwrap(), 0);

    // Above the window.
    let above = usp.memory_limit + 4;
    root_port.write_mmio(above, 4, 0xDEAD_BEEF).await.unwrap();
    assert_eq!(root_port.read_mmio(above, 4).await.unwrap(), 0);

    // Just past the endpoint's BAR, inside the bridge windows: the endpoint's
    // MMIO manager answers the zero read itself.
    let past_bar = endpoint.bar_base + endpoint.bar_size + 4;
    root_port.write_mmio(past_bar, 4, 0xDEAD_BEEF).await.unwrap();
    assert_eq!(root_port.read_mmio(past_bar, 4).await.unwrap(), 0);

    machine.stop().await;
}
