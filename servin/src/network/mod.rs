//! Bridge networking: device management, address allocation and port NAT.

mod bridge;
mod ipam;
mod nat;

pub use bridge::{Bridge, DEFAULT_BRIDGE, DEFAULT_SUBNET, setup_loopback_only};
pub use ipam::{BridgeNetworkRecord, IpamPool};
pub use nat::{apply_port_mappings, remove_port_mappings};
