//! PCI plumbing shared by the switch ports and the endpoint devices:
//! config-space and MMIO manager actors, the per-VCS routing table, and the
//! verbatim FIFO relays that stitch adjacent connections together.

pub mod cfg_space;
pub mod mmio;
pub mod relay;
pub mod routing;

pub use cfg_space::{ConfigSpaceManager, PciDeviceKind};
pub use mmio::{BarEntry, EndpointMmioHooks, MmioBackend, MmioManager, MmioState};
pub use relay::{ConnectionRelay, FifoRelay};
pub use routing::{BridgeRole, BridgeRouting, RoutingTable};
