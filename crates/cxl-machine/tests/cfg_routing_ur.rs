//! CFG routing negative paths: probing a BDF nothing answers for completes
//! UR, which the root port reports as "no device".

use cxl_cache::accessor::BackingStore;
use cxl_machine::{EndpointKind, MachineBuilder};
use cxl_protocol::packet::Bdf;

const MEM_SIZE: u64 = 1 << 20;

fn type3() -> EndpointKind {
    EndpointKind::Type3 {
        memory_size: MEM_SIZE,
        backing: BackingStore::Anonymous,
    }
}

#[tokio::test]
async fn unroutable_bdfs_complete_unsupported_request() {
    let mut machine = MachineBuilder::new()
        .endpoint(type3(), true)
        .endpoint(type3(), true)
        .endpoint(type3(), true)
        .build()
        .await
        .unwrap();
    machine.start().await;

    let root_port = machine.root_port();
    root_port.enumerate(0xFE00_0000).await.unwrap();

    // Known-good BDFs respond.
    for bus in 1..=5u8 {
        assert!(
            root_port
                .read_vid_did(Bdf::new(bus, 0, 0))
                .await
                .unwrap()
                .is_some(),
            "bus {bus} device 0 should answer"
        );
    }

    // Device number beyond the vPPB count on the USP secondary bus.
    assert_eq!(
        root_port.read_vid_did(Bdf::new(2, 3, 0)).await.unwrap(),
        None
    );
    // Bus beyond every bridge's subordinate range.
    assert_eq!(
        root_port.read_vid_did(Bdf::new(6, 0, 0)).await.unwrap(),
        None
    );
    // Functions other than 0 do not exist anywhere in the tree.
    assert_eq!(
        root_port.read_vid_did(Bdf::new(3, 0, 1)).await.unwrap(),
        None
    );
    // Non-zero device numbers below a DSP link.
    assert_eq!(
        root_port.read_vid_did(Bdf::new(3, 1, 0)).await.unwrap(),
        None
    );

    machine.stop().await;
}
