//! Bind -> unbind -> rebind: the bridge tree is identical across rebinds in
//! BDFs, class codes and MMIO windows, because vPPB bridge registers persist
//! while only what hangs below them changes.

use cxl_cache::accessor::BackingStore;
use cxl_host::drivers::EnumerationInfo;
use cxl_machine::{EndpointKind, MachineBuilder};
use pretty_assertions::assert_eq;

const MEM_SIZE: u64 = 1 << 20;

fn type3() -> EndpointKind {
    EndpointKind::Type3 {
        memory_size: MEM_SIZE,
        backing: BackingStore::Anonymous,
    }
}

fn bridge_view(info: &EnumerationInfo) -> Vec<(u16, u32, u8, u8, u64, u64)> {
    info.bridges()
        .map(|bridge| {
            (
                bridge.bdf.0,
                bridge.class_code,
                bridge.secondary_bus,
                bridge.subordinate_bus,
                bridge.memory_base,
                bridge.memory_limit,
            )
        })
        .collect()
}

#[tokio::test]
async fn bridge_tree_is_stable_across_rebind() {
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
    let before = root_port.scan_devices().await.unwrap();
    assert_eq!(bridge_view(&before).len(), 4, "USP + three vPPBs");

    let vcs = machine
        .switch
        .virtual_switches()
        .get_virtual_switch(0)
        .unwrap()
        .clone();

    for vppb in 0..3 {
        vcs.unbind_vppb(vppb).await.unwrap();
    }
    let unbound = root_port.scan_devices().await.unwrap();
    assert_eq!(bridge_view(&before), bridge_view(&unbound));
    // The endpoints are gone while unbound.
    assert_eq!(unbound.endpoints().count(), 0);

    for vppb in 0..3 {
        vcs.bind_vppb(vppb + 1, vppb, 0).await.unwrap();
    }
    let rebound = root_port.scan_devices().await.unwrap();
    assert_eq!(bridge_view(&before), bridge_view(&rebound));
    // And back, with their config intact from the first enumeration.
    assert_eq!(rebound.endpoints().count(), 3);
    for (before_ep, after_ep) in before.endpoints().zip(rebound.endpoints()) {
        assert_eq!(before_ep.bdf, after_ep.bdf);
        assert_eq!(before_ep.bar_base, after_ep.bar_base);
    }

    machine.stop().await;
}
