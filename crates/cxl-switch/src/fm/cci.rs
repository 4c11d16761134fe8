//! CCI request/response plumbing and the background-command slot.
//!
//! Foreground commands execute inline. A background command occupies the
//! single background slot; a second submission answers `Busy`, and the
//! outcome stays in the slot for `BACKGROUND_OPERATION_STATUS` to read.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::debug;

/// FM API and generic command opcodes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum Opcode {
    BackgroundOperationStatus = 0x0002,
    IdentifySwitchDevice = 0x5100,
    GetPhysicalPortState = 0x5101,
    GetVirtualCxlSwitchInfo = 0x5200,
    BindVppb = 0x5201,
    UnbindVppb = 0x5202,
    GetLdInfo = 0x5400,
    GetLdAllocations = 0x5401,
    SetLdAllocations = 0x5402,
    GetConnectedDevices = 0xC000,
    NotifySwitchUpdate = 0xC001,
    NotifyPortUpdate = 0xC002,
    NotifyDeviceUpdate = 0xC003,
}

impl Opcode {
    pub fn from_u16(value: u16) -> Option<Self> {
        Some(match value {
            0x0002 => Opcode::BackgroundOperationStatus,
            0x5100 => Opcode::IdentifySwitchDevice,
            0x5101 => Opcode::GetPhysicalPortState,
            0x5200 => Opcode::GetVirtualCxlSwitchInfo,
            0x5201 => Opcode::BindVppb,
            0x5202 => Opcode::UnbindVppb,
            0x5400 => Opcode::GetLdInfo,
            0x5401 => Opcode::GetLdAllocations,
            0x5402 => Opcode::SetLdAllocations,
            0xC000 => Opcode::GetConnectedDevices,
            0xC001 => Opcode::NotifySwitchUpdate,
            0xC002 => Opcode::NotifyPortUpdate,
            0xC003 => Opcode::NotifyDeviceUpdate,
            _ => return None,
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u16)]
pub enum CciReturnCode {
    Success = 0x0000,
    BackgroundCommandStarted = 0x0001,
    InvalidInput = 0x0002,
    Unsupported = 0x0003,
    InternalError = 0x0004,
    Busy = 0x0007,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CciRequest {
    pub opcode: u16,
    pub payload: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CciResponse {
    pub bo_flag: bool,
    pub return_code: CciReturnCode,
    pub vendor_specific_status: u16,
    pub payload: Vec<u8>,
}

impl CciResponse {
    pub fn success(payload: Vec<u8>) -> Self {
        CciResponse {
            bo_flag: false,
            return_code: CciReturnCode::Success,
            vendor_specific_status: 0,
            payload,
        }
    }

    pub fn error(return_code: CciReturnCode) -> Self {
        CciResponse {
            bo_flag: false,
            return_code,
            vendor_specific_status: 0,
            payload: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CciBackgroundStatus {
    pub opcode: u16,
    pub percentage_complete: u8,
    pub return_code: u16,
    pub vendor_specific_status: u16,
}

/// How a command executes: inline or through the background slot.
pub trait CciBackend: Send + Sync + 'static {
    fn is_background(&self, opcode: Opcode) -> bool;
    fn execute(
        &self,
        opcode: Opcode,
        payload: &[u8],
    ) -> futures::future::BoxFuture<'_, CciResponse>;
}

struct BackgroundSlot {
    busy: bool,
    status: CciBackgroundStatus,
}

pub struct CciExecutor<B: CciBackend> {
    backend: Arc<B>,
    slot: Arc<Mutex<BackgroundSlot>>,
}

impl<B: CciBackend> CciExecutor<B> {
    pub fn new(backend: Arc<B>) -> Self {
        CciExecutor {
            backend,
            slot: Arc::new(Mutex::new(BackgroundSlot {
                busy: false,
                status: CciBackgroundStatus::default(),
            })),
        }
    }

    pub async fn execute(&self, request: CciRequest) -> CciResponse {
        let Some(opcode) = Opcode::from_u16(request.opcode) else {
            debug!("unsupported CCI opcode 0x{:04X}", request.opcode);
            return CciResponse::error(CciReturnCode::Unsupported);
        };

        if opcode == Opcode::BackgroundOperationStatus {
            let status = self.background_status().await;
            let mut payload = Vec::with_capacity(8);
            payload.extend_from_slice(&status.opcode.to_le_bytes());
            payload.push(status.percentage_complete);
            payload.push(0);
            payload.extend_from_slice(&status.return_code.to_le_bytes());
            payload.extend_from_slice(&status.vendor_specific_status.to_le_bytes());
            return CciResponse::success(payload);
        }

        if !self.backend.is_background(opcode) {
            return self.backend.execute(opcode, &request.payload).await;
        }

        // Claim the background slot.
        {
            let mut slot = self.slot.lock().await;
            if slot.busy {
                return CciResponse {
                    bo_flag: true,
                    return_code: CciReturnCode::Busy,
                    vendor_specific_status: 0,
                    payload: Vec::new(),
                };
            }
            slot.busy = true;
            slot.status = CciBackgroundStatus {
                opcode: request.opcode,
                percentage_complete: 0,
                return_code: 0,
                vendor_specific_status: 0,
            };
        }

        let backend = self.backend.clone();
        let slot = self.slot.clone();
        let payload = request.payload.clone();
        let opcode_value = request.opcode;
        tokio::spawn(async move {
            let response = backend.execute(opcode, &payload).await;
            let mut slot = slot.lock().await;
            slot.busy = false;
            slot.status = CciBackgroundStatus {
                opcode: opcode_value,
                percentage_complete: 100,
                return_code: response.return_code as u16,
                vendor_specific_status: response.vendor_specific_status,
            };
        });

        CciResponse {
            bo_flag: true,
            return_code: CciReturnCode::BackgroundCommandStarted,
            vendor_specific_status: 0,
            payload: Vec::new(),
        }
    }

    pub async fn background_status(&self) -> CciBackgroundStatus {
        self.slot.lock().await.status
    }
}
