//! Per-node agent for VPC host NICs.
//!
//! Three subsystems make up the core: the NIC allocator (per-subnet cache of
//! cloud NICs with crash-safe local persistence), the host network
//! configurator (policy routing, SNAT, per-NIC route tables) and the IPAM
//! core (pools/blocks/handles over a compare-and-swap datastore).

pub mod allocator;
pub mod cloud;
pub mod config;
pub mod daemon;
pub mod ipam;
pub mod network;
pub mod store;

// Generated protobuf types. These double as the agent's domain types: the
// allocator persists `HostNic`/`PodInfo` records and the RPC server hands
// them out unchanged.
pub mod hostnic {
    tonic::include_proto!("hostnic");
}
