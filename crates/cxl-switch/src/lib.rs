//! The emulated CXL switch: physical ports, virtual switches with vPPBs,
//! per-VCS routers, the TCP port fabric, and the Fabric Manager CCI surface.

pub mod binder;
pub mod fabric;
pub mod fm;
pub mod manager;
pub mod ports;
pub mod routers;
pub mod switch;
pub mod vcs;
pub mod vppb;

pub use fabric::SwitchConnectionManager;
pub use manager::{PhysicalPortManager, PortConfig, PortKind, VirtualSwitchManager};
pub use ports::{DownstreamPort, PhysicalPort, UpstreamPort};
pub use switch::{CxlSwitch, CxlSwitchConfig, VcsConfig};
pub use vcs::{CxlVirtualSwitch, PpbBindingStatus, SwitchUpdateEvent};
