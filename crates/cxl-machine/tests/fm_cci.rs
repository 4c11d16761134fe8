//! Fabric Manager surface over the MCTP-style TCP transport: identify,
//! background bind, switch info, connected devices, LD allocations and the
//! unsolicited switch-update notification.

use std::time::Duration;

use cxl_cache::accessor::BackingStore;
use cxl_machine::{EndpointKind, MachineBuilder};
use cxl_switch::fm::mctp::{FmApiClient, Notification};
use cxl_switch::fm::cci::CciReturnCode;

const MEM_SIZE: u64 = 1 << 20;

const OPCODE_BACKGROUND_STATUS: u16 = 0x0002;
const OPCODE_IDENTIFY_SWITCH: u16 = 0x5100;
const OPCODE_GET_PORT_STATE: u16 = 0x5101;
const OPCODE_GET_VCS_INFO: u16 = 0x5200;
const OPCODE_BIND_VPPB: u16 = 0x5201;
const OPCODE_GET_LD_INFO: u16 = 0x5400;
const OPCODE_SET_LD_ALLOCATIONS: u16 = 0x5402;
const OPCODE_GET_CONNECTED_DEVICES: u16 = 0xC000;

#[tokio::test]
async fn fm_commands_drive_the_switch() {
    let mut machine = MachineBuilder::new()
        .endpoint(
            EndpointKind::Type3 {
                memory_size: MEM_SIZE,
                backing: BackingStore::Anonymous,
            },
            false,
        )
        .endpoint(
            EndpointKind::Mld {
                ld_count: 2,
                memory_size_per_ld: MEM_SIZE,
            },
            false,
        )
        .endpoint(EndpointKind::Empty, false)
        .with_fm_server("127.0.0.1:0")
        .build()
        .await
        .unwrap();
    machine.start().await;

    let fm_addr = machine.switch.fm_addr().expect("FM server is listening");
    let client = FmApiClient::connect(fm_addr).await.unwrap();

    // IDENTIFY_SWITCH_DEVICE: 4 ports, 1 VCS, 3 vPPBs, none active yet.
    let identify = client.request(OPCODE_IDENTIFY_SWITCH, Vec::new()).await.unwrap();
    assert_eq!(identify.return_code, CciReturnCode::Success);
    assert_eq!(identify.payload[2], 4, "physical ports");
    assert_eq!(identify.payload[3], 1, "virtual switches");
    let total_vppbs = u16::from_le_bytes([identify.payload[68], identify.payload[69]]);
    let active_vppbs = u16::from_le_bytes([identify.payload[70], identify.payload[71]]);
    assert_eq!(total_vppbs, 3);
    assert_eq!(active_vppbs, 0);

    // GET_PHYSICAL_PORT_STATE tells connected SLD/MLD slots from the empty
    // DSP and from an id nothing answers for.
    let ports = client
        .request(OPCODE_GET_PORT_STATE, vec![5, 0, 1, 2, 3, 9])
        .await
        .unwrap();
    assert_eq!(ports.return_code, CciReturnCode::Success);
    let record = |index: usize| &ports.payload[4 + index * 16..4 + (index + 1) * 16];
    assert_eq!(record(0)[1], 0x04, "port 0 is the USP");
    assert_eq!(record(1)[4], 0x04, "port 1 carries a Type 3 SLD");
    assert_eq!(record(2)[4], 0x05, "port 2 carries an MLD");
    assert_eq!(record(3)[1], 0x03, "port 3 is a DSP");
    assert_eq!(record(3)[4], 0x00, "port 3 has no device detected");
    assert_eq!(record(4)[1], 0x0F, "port 9 does not exist");

    // BIND_VPPB is a background command: started, then polled to success.
    let bind = client
        .request(OPCODE_BIND_VPPB, vec![0, 0, 1, 0, 0xFF, 0xFF])
        .await
        .unwrap();
    assert!(bind.bo_flag);
    assert_eq!(bind.return_code, CciReturnCode::BackgroundCommandStarted);
    loop {
        let status = client
            .request(OPCODE_BACKGROUND_STATUS, Vec::new())
            .await
            .unwrap();
        let opcode = u16::from_le_bytes([status.payload[0], status.payload[1]]);
        if opcode == OPCODE_BIND_VPPB && status.payload[2] == 100 {
            let return_code = u16::from_le_bytes([status.payload[4], status.payload[5]]);
            assert_eq!(return_code, CciReturnCode::Success as u16);
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The bind transition was pushed as a notification.
    let notification = tokio::time::timeout(Duration::from_secs(1), client.recv_notification())
        .await
        .expect("notification arrives")
        .expect("stream open");
    assert!(matches!(notification, Notification::SwitchUpdate { vcs_id: 0, vppb_id: 0, .. }));

    // GET_VIRTUAL_CXL_SWITCH_INFO reflects the bind.
    let info = client
        .request(OPCODE_GET_VCS_INFO, vec![0, 0xFF, 1, 0])
        .await
        .unwrap();
    assert_eq!(info.return_code, CciReturnCode::Success);
    assert_eq!(info.payload[4], 0, "vcs id");
    assert_eq!(info.payload[6], 0, "usp port id");
    assert_eq!(info.payload[7], 3, "vppb count");
    assert_eq!(info.payload[8], 0x03, "vPPB 0 bound to an LD");
    assert_eq!(info.payload[9], 1, "vPPB 0 behind physical port 1");
    assert_eq!(info.payload[12], 0x00, "vPPB 1 unbound");

    // GET_CONNECTED_DEVICES lists the bound DSP.
    let connected = client
        .request(OPCODE_GET_CONNECTED_DEVICES, Vec::new())
        .await
        .unwrap();
    assert_eq!(connected.payload[0], 1);
    assert_eq!(connected.payload[1], 1);

    // LD management against the MLD behind port 2.
    let ld_info = client.request(OPCODE_GET_LD_INFO, vec![2]).await.unwrap();
    assert_eq!(ld_info.return_code, CciReturnCode::Success);
    let memory_size = u64::from_le_bytes(ld_info.payload[0..8].try_into().unwrap());
    let ld_count = u16::from_le_bytes([ld_info.payload[8], ld_info.payload[9]]);
    assert_eq!(memory_size, 2 * MEM_SIZE);
    assert_eq!(ld_count, 2);

    let mut set_payload = vec![2u8, 2];
    set_payload.extend_from_slice(&(MEM_SIZE + 0x1000).to_le_bytes());
    set_payload.extend_from_slice(&(MEM_SIZE - 0x1000).to_le_bytes());
    let set = client
        .request(OPCODE_SET_LD_ALLOCATIONS, set_payload)
        .await
        .unwrap();
    assert_eq!(set.return_code, CciReturnCode::Success);
    let first = u64::from_le_bytes(set.payload[4..12].try_into().unwrap());
    assert_eq!(first, MEM_SIZE + 0x1000);

    client.shutdown();
    machine.stop().await;
}
