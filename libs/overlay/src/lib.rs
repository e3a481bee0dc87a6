#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The overlay dataplane: MAC-keyed forwarding tables and the
//! virtual-network dispatch engine.

pub mod peer_network;
mod vnet;

pub use peer_network::{PeerLink, PeerNetwork, TopologyError};
pub use vnet::{ControllerHandle, NodeInfo, VirtualNetwork, VnetDescriptor};
