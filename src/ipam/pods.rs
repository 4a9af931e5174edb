use std::net::Ipv4Addr;

use crate::ipam::datastore::StoreError;

/// Lifecycle phase of a live pod as the orchestrator reports it. Completed
/// and failed pods no longer hold their IPs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl PodPhase {
    /// Whether the pod still owns its address.
    pub fn holds_ip(&self) -> bool {
        !matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Snapshot of a pod used by leak detection and repair. `created` is the
/// orchestrator's creation timestamp, stored verbatim in repair attributes.
#[derive(Debug, Clone)]
pub struct PodState {
    pub namespace: String,
    pub name: String,
    pub node: String,
    pub ip: Option<Ipv4Addr>,
    pub phase: PodPhase,
    pub deleting: bool,
    pub created: String,
}

impl PodState {
    /// The `namespace-podname` key handles are matched against.
    pub fn handle_key(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

/// Live pod state, as maintained by the orchestrator watch caches. The IPAM
/// core only reads; the production implementation is wired up by the
/// controller embedding this crate.
pub trait PodLister: Send + Sync {
    fn list_pods(&self) -> Result<Vec<PodState>, StoreError>;

    fn get_pod(&self, namespace: &str, name: &str) -> Result<Option<PodState>, StoreError> {
        Ok(self
            .list_pods()?
            .into_iter()
            .find(|p| p.namespace == namespace && p.name == name))
    }
}

/// Fixed pod list, for tests and offline repair runs.
#[derive(Default)]
pub struct StaticPodLister {
    pub pods: Vec<PodState>,
}

impl StaticPodLister {
    pub fn new(pods: Vec<PodState>) -> StaticPodLister {
        StaticPodLister { pods }
    }
}

impl PodLister for StaticPodLister {
    fn list_pods(&self) -> Result<Vec<PodState>, StoreError> {
        Ok(self.pods.clone())
    }
}
