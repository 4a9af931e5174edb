//! Fleet-wide IP address management over a compare-and-swap datastore.
//!
//! Three record kinds: a `Pool` declares an address space, a `Block` is a
//! lazily materialized sub-CIDR carrying the allocation arrays, and a
//! `Handle` counts the addresses a caller holds per block. All mutations are
//! optimistic: read, mutate a copy, write with the expected version, retry on
//! conflict up to a fixed cap.

pub mod broken;
pub mod client;
pub mod datastore;
pub mod pods;
pub mod types;

pub use broken::{BrokenBlock, IpAllocatedInfo, UsedIpOption};
pub use client::{AssignResult, AutoAssignArgs, IpamClient};
pub use datastore::{Datastore, MemoryDatastore, StoreError, Versioned};
pub use pods::{PodLister, PodPhase, PodState};
pub use types::{
    AllocationAttribute, Block, BlockUtilization, Handle, Pool, PoolBlocksUtilization, PoolDns,
    PoolRoute, PoolType, PoolUtilization,
};

/// Number of retries when a write to the datastore conflicts.
pub const DATASTORE_RETRIES: usize = 10;

/// Attribute keys stored with allocations created by repair paths.
pub const ATTR_POD: &str = "pod";
pub const ATTR_NAMESPACE: &str = "namespace";
pub const ATTR_NODE: &str = "node";
pub const ATTR_IP: &str = "ip";
pub const ATTR_TIMESTAMP: &str = "timestamp";

/// Handle name of the sentinel attribute marking range-reserved ordinals.
pub const RESERVED_HANDLE: &str = "reserved";
pub const RESERVED_NOTE: &str = "address reserved by pool range";

#[derive(Debug, thiserror::Error)]
pub enum IpamError {
    #[error("cannot find a qualified ippool")]
    NoQualifiedPool,

    #[error("unknown ippool type")]
    UnknownPoolType,

    #[error("no free blocks in ippool")]
    NoFreeBlocks,

    #[error("max retries hit - excessive concurrent IPAM requests")]
    MaxRetry,

    #[error("datastore error: {0}")]
    Store(#[from] StoreError),

    #[error("{0}")]
    Invalid(String),
}

pub type IpamResult<T> = Result<T, IpamError>;
