//! Fabric Manager command interface of the switch.

pub mod cci;
pub mod commands;
pub mod mctp;

pub use cci::{
    CciBackgroundStatus, CciExecutor, CciRequest, CciResponse, CciReturnCode, Opcode,
};
pub use commands::{SwitchCciBackend, SwitchInfo};
pub use mctp::{FmApiClient, FmCciServer, Notification};
