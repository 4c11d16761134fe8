//! Single-device topology: USP + one DSP + one 256 MiB Type 3. Enumeration
//! finds the bridge tree, places BARs above the requested base, and the CXL
//! scan reports the device capacity through the DVSEC.

use cxl_cache::accessor::BackingStore;
use cxl_machine::{EndpointKind, MachineBuilder};
use cxl_protocol::packet::Bdf;
use cxl_regs::identity::{EMU_VID, SLD_DID, SW_DSP_DID, SW_USP_DID};

const SIZE_256MB: u64 = 256 << 20;
const MMIO_BASE: u64 = 0xFE00_0000;

#[tokio::test]
async fn enumerate_single_type3_device() {
    let mut machine = MachineBuilder::new()
        .endpoint(
            EndpointKind::Type3 {
                memory_size: SIZE_256MB,
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

    // The USP, the vPPB bridge and the endpoint answer with their IDs.
    let vid_did = |did: u16| u32::from(did) << 16 | u32::from(EMU_VID);
    assert_eq!(
        root_port.read_vid_did(Bdf::new(1, 0, 0)).await.unwrap(),
        Some(vid_did(SW_USP_DID))
    );
    assert_eq!(
        root_port.read_vid_did(Bdf::new(2, 0, 0)).await.unwrap(),
        Some(vid_did(SW_DSP_DID))
    );
    assert_eq!(
        root_port.read_vid_did(Bdf::new(3, 0, 0)).await.unwrap(),
        Some(vid_did(SLD_DID))
    );

    let dsp = enumeration.find(Bdf::new(2, 0, 0)).expect("DSP enumerated");
    assert!(dsp.is_bridge);
    assert_eq!(dsp.secondary_bus, 3);
    assert_eq!(dsp.subordinate_bus, 3);

    // The endpoint's BAR lands at or above the USP's own window.
    let endpoint = enumeration.find(Bdf::new(3, 0, 0)).expect("endpoint enumerated");
    assert!(!endpoint.is_bridge);
    assert!(endpoint.bar_size > 0);
    assert!(endpoint.bar_base >= MMIO_BASE + 0x10_0000);

    // DVSEC range 1 advertises the full 256 MiB.
    let cxl = root_port.scan_cxl_devices(&enumeration).await.unwrap();
    let device = cxl
        .devices()
        .iter()
        .find(|device| device.is_cxl_memory_device())
        .expect("CXL memory device found");
    let dvsec = device.device_dvsec.expect("device DVSEC present");
    assert!(dvsec.mem_capable);
    assert_eq!(dvsec.memory_size(), SIZE_256MB);
    assert!(device.component_register_base.is_some());

    machine.stop().await;
}
