//! Per-node cache of host NICs keyed by subnet.
//!
//! The allocator owns its records exclusively: a single async lock
//! serializes pod-level operations and the background sweeps. Every mutation
//! writes through to the local store first and rolls the in-memory copy back
//! if the write fails, so a crash never leaves the store ahead of or behind
//! memory.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::cloud::{CloudApi, CloudError};
use crate::hostnic::{HostNic, NicInfo, Phase, PodInfo, VxNet};
use crate::network::{NetworkOps, TUNNEL_TYPE_VLAN};
use crate::store::{NicStore, NicStoreError};

#[derive(Debug, thiserror::Error)]
pub enum AllocatorError {
    #[error("no available NIC on this node")]
    NoAvailableNic,

    #[error("store error: {0}")]
    Store(#[from] NicStoreError),

    #[error("cloud error: {0}")]
    Cloud(#[from] CloudError),

    #[error("network error: {0}")]
    Network(#[from] crate::network::error::NetworkError),

    #[error("{0}")]
    Invalid(String),
}

pub type AllocatorResult<T> = Result<T, AllocatorError>;

#[derive(Debug, Clone)]
pub struct AllocatorConf {
    pub max_nic: usize,
    pub route_table_base: u32,
    pub sync_interval: Duration,
    pub free_interval: Duration,
    pub lease_interval: Duration,
}

/// One cached NIC and the pods currently bound to it. This is the record
/// persisted under the subnet id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NicStatus {
    pub nic: HostNic,
    pub pods: HashMap<String, PodInfo>,
}

impl NicStatus {
    pub fn is_ok(&self) -> bool {
        self.nic.phase() == Phase::Succeeded
    }

    pub fn phase_name(&self) -> &'static str {
        self.nic.phase().as_str_name()
    }
}

pub struct Allocator {
    nics: Mutex<HashMap<String, NicStatus>>,
    conf: AllocatorConf,
    store: Arc<dyn NicStore>,
    cloud: Arc<dyn CloudApi>,
    network: Arc<dyn NetworkOps>,
}

fn nic_subnet_id(nic: &HostNic) -> AllocatorResult<String> {
    nic.vx_net
        .as_ref()
        .map(|v| v.id.clone())
        .ok_or_else(|| AllocatorError::Invalid(format!("nic {} has no subnet", nic.id)))
}

fn nic_key(nic: &HostNic) -> String {
    match &nic.vx_net {
        Some(v) => format!("{}/{}", v.id, nic.id),
        None => nic.id.clone(),
    }
}

impl Allocator {
    pub fn new(
        conf: AllocatorConf,
        store: Arc<dyn NicStore>,
        cloud: Arc<dyn CloudApi>,
        network: Arc<dyn NetworkOps>,
    ) -> Allocator {
        Allocator {
            nics: Mutex::new(HashMap::new()),
            conf,
            store,
            cloud,
            network,
        }
    }

    // ── Requests ──────────────────────────────────────────────────────

    /// Assign (or reuse) the NIC for the pod's subnet.
    pub async fn alloc_host_nic(&self, pod: &PodInfo) -> AllocatorResult<HostNic> {
        let mut nics = self.nics.lock().await;
        let subnet = pod.vx_net.clone();

        if let Some(status) = nics.get(&subnet) {
            let nic = status.nic.clone();
            tracing::info!(nic = %nic_key(&nic), phase = status.phase_name(), "found cached nic");
            if status.is_ok() {
                if let Err(err) = self.add_nic_pod(&mut nics, &nic, pod).await {
                    tracing::error!(nic = %nic_key(&nic), %err, "failed to record pod");
                }
                self.install_pod_rule(&nic, pod).await;
                return Ok(nic);
            }
            // Not ready yet: walk the setup again and move the phase along.
            return match self.network.setup_network(&nic).await {
                Ok(_) => {
                    if let Err(err) = self.add_nic_pod(&mut nics, &nic, pod).await {
                        tracing::error!(nic = %nic_key(&nic), %err, "failed to record pod");
                    }
                    self.install_pod_rule(&nic, pod).await;
                    Ok(nic)
                }
                Err(failure) => {
                    if let Err(err) = self.set_nic_status(&mut nics, &nic, failure.phase).await {
                        tracing::error!(nic = %nic_key(&nic), %err, "failed to record phase");
                    }
                    Err(AllocatorError::Network(failure.error))
                }
            };
        }

        if nics.len() >= self.conf.max_nic {
            return Err(AllocatorError::NoAvailableNic);
        }

        let vxnet = self.get_vxnet(&nics, &subnet).await?;
        let mut created = self
            .cloud
            .create_nics_and_attach(&vxnet, 1, None, true)
            .await?;
        let mut nic = created
            .pop()
            .ok_or_else(|| AllocatorError::Invalid("cloud created no nic".to_string()))?;
        tracing::info!(nic = %nic_key(&nic), "created and attached nic");

        nic.reserved = true;
        nic.route_table_num = self.next_route_table(&nics);

        match self.network.setup_network(&nic).await {
            Ok(_) => {
                if let Err(err) = self.add_nic_pod(&mut nics, &nic, pod).await {
                    tracing::error!(nic = %nic_key(&nic), %err, "failed to record pod");
                }
                self.install_pod_rule(&nic, pod).await;
                Ok(nic)
            }
            Err(failure) => {
                // Keep the record; the sync sweep retries from the failed
                // phase.
                if let Err(err) = self.set_nic_status(&mut nics, &nic, failure.phase).await {
                    tracing::error!(nic = %nic_key(&nic), %err, "failed to record phase");
                }
                Err(AllocatorError::Network(failure.error))
            }
        }
    }

    /// Pod egress only reaches the NIC's table through its source rule.
    /// Installed once the NIC serves and the pod entry is recorded; a pod
    /// without an address yet gets its rule on the next request for it.
    async fn install_pod_rule(&self, nic: &HostNic, pod: &PodInfo) {
        let pod_ip: Ipv4Addr = match pod.pod_ip.parse() {
            Ok(ip) => ip,
            Err(_) => {
                tracing::debug!(container = %pod.container, "pod has no address, skipping rule");
                return;
            }
        };
        if let Err(err) = self
            .network
            .add_pod_rule(pod_ip, nic.route_table_num as u32)
            .await
        {
            tracing::error!(nic = %nic_key(nic), ip = %pod_ip, %err, "failed to install pod rule");
        }
    }

    /// Release the pod's binding. Peek returns the record without mutating;
    /// commit removes the pod entry but keeps the NIC for reuse.
    pub async fn free_host_nic(
        &self,
        pod: &PodInfo,
        peek: bool,
    ) -> AllocatorResult<Option<(HostNic, String)>> {
        let mut nics = self.nics.lock().await;
        let key = pod.container.clone();

        let found = nics.iter().find_map(|(subnet, status)| {
            status
                .pods
                .get(&key)
                .map(|p| (subnet.clone(), status.nic.clone(), p.pod_ip.clone()))
        });
        let (subnet, nic, pod_ip) = match found {
            Some(f) => f,
            None => {
                tracing::info!(container = %key, "no record for pod");
                return Ok(None);
            }
        };

        if peek {
            tracing::info!(nic = %nic_key(&nic), ip = %pod_ip, "peek pod record");
            return Ok(Some((nic, pod_ip)));
        }

        self.del_nic_pod(&mut nics, &subnet, pod).await?;
        if let Ok(ip) = pod_ip.parse::<Ipv4Addr>() {
            if let Err(err) = self.network.delete_pod_rules(ip).await {
                tracing::error!(nic = %nic_key(&nic), %ip, %err, "failed to remove pod rules");
            }
        }
        tracing::info!(nic = %nic_key(&nic), ip = %pod_ip, "removed pod record");
        Ok(Some((nic, pod_ip)))
    }

    pub async fn show_nics(&self) -> Vec<NicInfo> {
        let nics = self.nics.lock().await;
        let mut out: Vec<NicInfo> = nics
            .values()
            .map(|status| NicInfo {
                id: status.nic.id.clone(),
                vx_net: status
                    .nic
                    .vx_net
                    .as_ref()
                    .map(|v| v.id.clone())
                    .unwrap_or_default(),
                phase: status.phase_name().to_string(),
                pods: status.pods.len() as i32,
            })
            .collect();
        out.sort_by(|a, b| a.vx_net.cmp(&b.vx_net));
        out
    }

    // ── Periodic sweeps ───────────────────────────────────────────────

    /// Repair sweep: any cached NIC that is not Succeeded, or whose link
    /// vanished, gets the setup walk re-run.
    pub async fn host_nic_check(&self) {
        let mut nics = self.nics.lock().await;
        let keys: Vec<String> = nics.keys().cloned().collect();

        for key in keys {
            let (nic, healthy) = match nics.get(&key) {
                Some(status) => (status.nic.clone(), status.is_ok()),
                None => continue,
            };
            let exists = self.network.link_exists(&nic.hardware_addr).await;
            if healthy && exists {
                continue;
            }

            tracing::info!(nic = %nic_key(&nic), exists, "repairing nic");
            let phase = match self.network.check_and_repair(&nic).await {
                Ok(phase) => phase,
                Err(failure) => {
                    tracing::warn!(nic = %nic_key(&nic), err = %failure.error, "repair failed");
                    failure.phase
                }
            };
            if let Err(err) = self.set_nic_status(&mut nics, &nic, phase).await {
                tracing::error!(nic = %nic_key(&nic), %err, "failed to record phase");
            }
        }
    }

    /// Eviction sweep: NICs with no pods (or all, when forced) are cleaned
    /// up locally, detached and deleted in the cloud, and forgotten.
    pub async fn clear_free_host_nic(&self, force: bool) -> AllocatorResult<()> {
        let mut nics = self.nics.lock().await;
        let keys: Vec<String> = nics.keys().cloned().collect();
        tracing::info!(total = nics.len(), force, "eviction sweep");

        let mut freed: Vec<String> = Vec::new();
        for key in keys {
            let (nic, pod_count) = match nics.get(&key) {
                Some(status) => (status.nic.clone(), status.pods.len()),
                None => continue,
            };
            if pod_count != 0 && !force {
                continue;
            }
            if force && pod_count != 0 {
                tracing::info!(subnet = %key, pods = pod_count, "forcing nic eviction");
            }

            match self.free_nic(&nic).await {
                Ok(()) => {
                    if let Err(err) = self.del_nic(&mut nics, &key).await {
                        tracing::error!(nic = %nic_key(&nic), %err, "failed to drop record");
                    } else {
                        freed.push(nic_key(&nic));
                    }
                }
                Err(err) => {
                    tracing::error!(nic = %nic_key(&nic), %err, "freeing nic failed");
                    // Reset so the next sync sweep repairs whatever half
                    // state cleanup left behind.
                    if let Err(err) = self.set_nic_status(&mut nics, &nic, Phase::Init).await {
                        tracing::error!(nic = %nic_key(&nic), %err, "failed to record phase");
                    }
                }
            }
        }
        tracing::info!(count = freed.len(), nics = ?freed, "eviction sweep done");
        Ok(())
    }

    /// Remove a NIC from the node: kernel cleanup, synchronous detach, then
    /// delete. A NIC the cloud no longer knows counts as freed.
    async fn free_nic(&self, nic: &HostNic) -> AllocatorResult<()> {
        self.network.cleanup_network(nic).await?;

        match self.cloud.detach_nics(&[nic.id.clone()], true).await {
            Ok(_) => {}
            Err(err) if err.is_not_found() => {
                tracing::info!(nic = %nic_key(nic), "nic gone from cloud, skipping detach/delete");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        }

        if let Err(err) = self.cloud.delete_nics(&[nic.id.clone()]).await {
            if !err.is_not_found() {
                // already detached, so the record can still be dropped
                tracing::error!(nic = %nic_key(nic), %err, "delete nic failed");
            }
        }
        Ok(())
    }

    /// Renew the DHCP leases of healthy VLAN NICs.
    pub async fn ip_addr_renew(&self) {
        let nics = self.nics.lock().await;
        for status in nics.values() {
            let is_vlan = status
                .nic
                .vx_net
                .as_ref()
                .map(|v| v.tunnel_type == TUNNEL_TYPE_VLAN)
                .unwrap_or(false);
            if !status.is_ok() || !is_vlan {
                continue;
            }
            match self.network.renew_lease(&status.nic).await {
                Ok(()) => tracing::info!(nic = %nic_key(&status.nic), "lease renewed"),
                Err(err) => {
                    tracing::error!(nic = %nic_key(&status.nic), %err, "lease renewal failed")
                }
            }
        }
    }

    // ── Startup ───────────────────────────────────────────────────────

    /// Replay the local store, then reconcile with NICs the cloud already
    /// created under this node's name: records present on both sides are
    /// reset to Init for a fresh setup walk; cloud NICs unknown locally are
    /// left alone for future reuse.
    pub async fn restore(&self) -> AllocatorResult<()> {
        let rows = self.store.iterate().await?;
        let mut nics = self.nics.lock().await;
        for (subnet, value) in rows {
            match serde_json::from_slice::<NicStatus>(&value) {
                Ok(status) => {
                    nics.insert(subnet, status);
                }
                Err(err) => {
                    tracing::error!(subnet = %subnet, %err, "skipping corrupt nic record")
                }
            }
        }

        let created = self
            .cloud
            .get_created_nics(self.conf.max_nic + 1, 0)
            .await?;
        for nic in created {
            let subnet = match &nic.vx_net {
                Some(v) => v.id.clone(),
                None => continue,
            };
            if let Some(status) = nics.get(&subnet) {
                let cached = status.nic.clone();
                tracing::info!(
                    nic = %nic_key(&cached),
                    table = cached.route_table_num,
                    "restoring nic"
                );
                if let Err(err) = self.set_nic_status(&mut nics, &cached, Phase::Init).await {
                    tracing::error!(nic = %nic_key(&cached), %err, "failed to reset phase");
                }
            }
        }
        Ok(())
    }

    /// Background routine: repair, eviction and lease timers until the stop
    /// signal flips.
    pub async fn run(self: Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let mut sync = tokio::time::interval(self.conf.sync_interval);
        let mut free = tokio::time::interval(self.conf.free_interval);
        let mut lease = tokio::time::interval(self.conf.lease_interval);
        // intervals fire immediately once; consume that
        sync.tick().await;
        free.tick().await;
        lease.tick().await;

        loop {
            tokio::select! {
                _ = stop.changed() => {
                    tracing::info!("allocator stopped");
                    return;
                }
                _ = sync.tick() => {
                    tracing::debug!("periodic nic sync");
                    self.host_nic_check().await;
                }
                _ = free.tick() => {
                    tracing::debug!("periodic free sweep");
                    if let Err(err) = self.clear_free_host_nic(false).await {
                        tracing::error!(%err, "free sweep failed");
                    }
                }
                _ = lease.tick() => {
                    tracing::debug!("periodic lease renewal");
                    self.ip_addr_renew().await;
                }
            }
        }
    }

    // ── Record mutation (write-through with rollback) ─────────────────

    async fn persist(&self, subnet: &str, status: &NicStatus) -> AllocatorResult<()> {
        let bytes = serde_json::to_vec(status).map_err(NicStoreError::from)?;
        self.store.set(subnet, &bytes).await?;
        Ok(())
    }

    async fn set_nic_status(
        &self,
        nics: &mut HashMap<String, NicStatus>,
        nic: &HostNic,
        phase: Phase,
    ) -> AllocatorResult<()> {
        let subnet = nic_subnet_id(nic)?;
        tracing::info!(nic = %nic_key(nic), phase = phase.as_str_name(), "set nic status");

        if let Some(status) = nics.get_mut(&subnet) {
            let saved = status.nic.phase;
            status.nic.phase = phase as i32;
            if let Err(err) = self.persist(&subnet, status).await {
                status.nic.phase = saved;
                return Err(err);
            }
        } else {
            let mut status = NicStatus {
                nic: nic.clone(),
                pods: HashMap::new(),
            };
            status.nic.phase = phase as i32;
            self.persist(&subnet, &status).await?;
            nics.insert(subnet, status);
        }
        Ok(())
    }

    /// Recording a pod always implies the NIC is serving, so the phase is
    /// forced to Succeeded in the same write.
    async fn add_nic_pod(
        &self,
        nics: &mut HashMap<String, NicStatus>,
        nic: &HostNic,
        pod: &PodInfo,
    ) -> AllocatorResult<()> {
        let subnet = nic_subnet_id(nic)?;
        let key = pod.container.clone();

        if let Some(status) = nics.get_mut(&subnet) {
            let saved_pod = status.pods.get(&key).cloned();
            let saved_phase = status.nic.phase;
            status.pods.insert(key.clone(), pod.clone());
            status.nic.phase = Phase::Succeeded as i32;
            if let Err(err) = self.persist(&subnet, status).await {
                match saved_pod {
                    Some(saved) => {
                        status.pods.insert(key, saved);
                    }
                    None => {
                        status.pods.remove(&key);
                    }
                }
                status.nic.phase = saved_phase;
                return Err(err);
            }
        } else {
            let mut status = NicStatus {
                nic: nic.clone(),
                pods: HashMap::new(),
            };
            status.pods.insert(key, pod.clone());
            status.nic.phase = Phase::Succeeded as i32;
            self.persist(&subnet, &status).await?;
            nics.insert(subnet, status);
        }
        Ok(())
    }

    async fn del_nic_pod(
        &self,
        nics: &mut HashMap<String, NicStatus>,
        subnet: &str,
        pod: &PodInfo,
    ) -> AllocatorResult<()> {
        let key = pod.container.clone();
        if let Some(status) = nics.get_mut(subnet) {
            let saved = status.pods.remove(&key);
            if saved.is_some() {
                if let Err(err) = self.persist(subnet, status).await {
                    if let Some(saved) = saved {
                        status.pods.insert(key, saved);
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn del_nic(
        &self,
        nics: &mut HashMap<String, NicStatus>,
        subnet: &str,
    ) -> AllocatorResult<()> {
        self.store.delete(subnet).await?;
        nics.remove(subnet);
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────

    async fn get_vxnet(
        &self,
        nics: &HashMap<String, NicStatus>,
        vxnet_id: &str,
    ) -> AllocatorResult<VxNet> {
        for status in nics.values() {
            if let Some(vxnet) = &status.nic.vx_net {
                if vxnet.id == vxnet_id {
                    return Ok(vxnet.clone());
                }
            }
        }
        let mut result = self.cloud.get_vxnets(&[vxnet_id.to_string()]).await?;
        result
            .remove(vxnet_id)
            .ok_or_else(|| AllocatorError::Invalid(format!("subnet {} not found", vxnet_id)))
    }

    /// Smallest table number at or above the base not already taken.
    fn next_route_table(&self, nics: &HashMap<String, NicStatus>) -> i32 {
        let used: HashSet<i32> = nics.values().map(|s| s.nic.route_table_num).collect();
        let mut candidate = self.conf.route_table_base as i32;
        while used.contains(&candidate) {
            candidate += 1;
        }
        tracing::debug!(table = candidate, "assigned route table");
        candidate
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{CloudResult, PendingJobs, Vip};
    use crate::network::error::{NetworkError, NetworkResult};
    use crate::network::SetupFailure;
    use crate::store::SqliteNicStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    fn vxnet(id: &str) -> VxNet {
        VxNet {
            id: id.to_string(),
            gateway: "172.16.10.1".to_string(),
            network: "172.16.10.0/24".to_string(),
            ip_start: "172.16.10.2".to_string(),
            ip_end: "172.16.10.242".to_string(),
            tunnel_type: "vxlan".to_string(),
        }
    }

    fn pod(container: &str, subnet: &str, ip: &str) -> PodInfo {
        PodInfo {
            namespace: "ns1".to_string(),
            name: container.to_string(),
            container: container.to_string(),
            netns: format!("/var/run/netns/{}", container),
            if_name: "eth0".to_string(),
            vx_net: subnet.to_string(),
            pod_ip: ip.to_string(),
        }
    }

    #[derive(Default)]
    struct MockCloud {
        create_calls: AtomicUsize,
        counter: AtomicUsize,
        detached: StdMutex<Vec<String>>,
        deleted: StdMutex<Vec<String>>,
        created_nics: StdMutex<Vec<HostNic>>,
    }

    #[async_trait::async_trait]
    impl CloudApi for MockCloud {
        fn instance_id(&self) -> &str {
            "i-test"
        }

        async fn get_created_nics(&self, _: usize, _: usize) -> CloudResult<Vec<HostNic>> {
            Ok(self.created_nics.lock().unwrap().clone())
        }

        async fn get_attached_nics(&self) -> CloudResult<Vec<HostNic>> {
            Ok(Vec::new())
        }

        async fn create_nics_and_attach(
            &self,
            vxnet: &VxNet,
            _count: usize,
            _ips: Option<Vec<String>>,
            _disable_ip: bool,
        ) -> CloudResult<Vec<HostNic>> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            let n = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
            let id = format!("nic-{}", n);
            Ok(vec![HostNic {
                id: id.clone(),
                vx_net: Some(vxnet.clone()),
                hardware_addr: id,
                primary_address: String::new(),
                route_table_num: 0,
                is_primary: false,
                using: false,
                reserved: false,
                phase: Phase::Init as i32,
            }])
        }

        async fn detach_nics(&self, nic_ids: &[String], _wait: bool) -> CloudResult<String> {
            self.detached.lock().unwrap().extend_from_slice(nic_ids);
            Ok(String::new())
        }

        async fn delete_nics(&self, nic_ids: &[String]) -> CloudResult<()> {
            self.deleted.lock().unwrap().extend_from_slice(nic_ids);
            Ok(())
        }

        async fn get_vxnets(
            &self,
            ids: &[String],
        ) -> CloudResult<HashMap<String, VxNet>> {
            Ok(ids.iter().map(|id| (id.clone(), vxnet(id))).collect())
        }

        async fn describe_nic_jobs(&self, _: &[String]) -> CloudResult<PendingJobs> {
            Ok(PendingJobs::default())
        }

        async fn create_vips(&self, _: &VxNet) -> CloudResult<String> {
            Ok(String::new())
        }

        async fn describe_vips(&self, _: &VxNet) -> CloudResult<Vec<Vip>> {
            Ok(Vec::new())
        }

        async fn delete_vips(&self, _: &[String]) -> CloudResult<String> {
            Ok(String::new())
        }
    }

    #[derive(Default)]
    struct MockNetwork {
        fail_setup: AtomicBool,
        fail_cleanup: AtomicBool,
        setup_calls: AtomicUsize,
        cleanup_calls: AtomicUsize,
        pod_rules: StdMutex<Vec<(Ipv4Addr, u32)>>,
        removed_rules: StdMutex<Vec<Ipv4Addr>>,
    }

    #[async_trait::async_trait]
    impl NetworkOps for MockNetwork {
        async fn setup_network(&self, _nic: &HostNic) -> Result<Phase, SetupFailure> {
            self.setup_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_setup.load(Ordering::SeqCst) {
                return Err(SetupFailure {
                    phase: Phase::CreateAndAttach,
                    error: NetworkError::NotFound("link".to_string()),
                });
            }
            Ok(Phase::Succeeded)
        }

        async fn cleanup_network(&self, nic: &HostNic) -> NetworkResult<()> {
            self.cleanup_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_cleanup.load(Ordering::SeqCst) {
                return Err(NetworkError::Invalid(format!("cleanup {} failed", nic.id)));
            }
            Ok(())
        }

        async fn add_pod_rule(&self, pod_ip: Ipv4Addr, table: u32) -> NetworkResult<()> {
            self.pod_rules.lock().unwrap().push((pod_ip, table));
            Ok(())
        }

        async fn delete_pod_rules(&self, pod_ip: Ipv4Addr) -> NetworkResult<()> {
            self.removed_rules.lock().unwrap().push(pod_ip);
            Ok(())
        }

        async fn link_exists(&self, _mac: &str) -> bool {
            true
        }

        async fn renew_lease(&self, _nic: &HostNic) -> NetworkResult<()> {
            Ok(())
        }
    }

    struct Fixture {
        allocator: Allocator,
        cloud: Arc<MockCloud>,
        network: Arc<MockNetwork>,
        store: Arc<SqliteNicStore>,
        _dir: tempfile::TempDir,
    }

    async fn fixture(max_nic: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nics.db");
        let store = Arc::new(SqliteNicStore::open(path.to_str().unwrap()).await.unwrap());
        let cloud = Arc::new(MockCloud::default());
        let network = Arc::new(MockNetwork::default());
        let conf = AllocatorConf {
            max_nic,
            route_table_base: 100,
            sync_interval: Duration::from_secs(30),
            free_interval: Duration::from_secs(300),
            lease_interval: Duration::from_secs(1800),
        };
        let allocator = Allocator::new(conf, store.clone(), cloud.clone(), network.clone());
        Fixture {
            allocator,
            cloud,
            network,
            store,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn first_alloc_creates_then_caches() {
        let f = fixture(4).await;

        let nic = f
            .allocator
            .alloc_host_nic(&pod("p1", "vxnet-a", "172.16.10.5"))
            .await
            .unwrap();
        assert_eq!(nic.id, "nic-1");
        assert_eq!(nic.route_table_num, 100);
        assert!(nic.reserved);
        assert_eq!(f.cloud.create_calls.load(Ordering::SeqCst), 1);
        assert!(f.store.get("vxnet-a").await.unwrap().is_some());

        // second pod on the same subnet reuses the cached NIC, no cloud call
        let nic2 = f
            .allocator
            .alloc_host_nic(&pod("p2", "vxnet-a", "172.16.10.6"))
            .await
            .unwrap();
        assert_eq!(nic2.id, "nic-1");
        assert_eq!(f.cloud.create_calls.load(Ordering::SeqCst), 1);

        let infos = f.allocator.show_nics().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].pods, 2);
        assert_eq!(infos[0].phase, "Succeeded");

        // each pod got its source rule into the NIC's table
        let rules = f.network.pod_rules.lock().unwrap().clone();
        assert_eq!(
            rules,
            vec![
                ("172.16.10.5".parse().unwrap(), 100),
                ("172.16.10.6".parse().unwrap(), 100),
            ]
        );
    }

    #[tokio::test]
    async fn budget_limits_nics_per_node() {
        let f = fixture(1).await;
        f.allocator
            .alloc_host_nic(&pod("p1", "vxnet-a", "172.16.10.5"))
            .await
            .unwrap();
        let err = f
            .allocator
            .alloc_host_nic(&pod("p2", "vxnet-b", "172.16.11.5"))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::NoAvailableNic));
    }

    #[tokio::test]
    async fn route_tables_are_distinct() {
        let f = fixture(4).await;
        let a = f
            .allocator
            .alloc_host_nic(&pod("p1", "vxnet-a", "172.16.10.5"))
            .await
            .unwrap();
        let b = f
            .allocator
            .alloc_host_nic(&pod("p2", "vxnet-b", "172.16.11.5"))
            .await
            .unwrap();
        assert_eq!(a.route_table_num, 100);
        assert_eq!(b.route_table_num, 101);
    }

    #[tokio::test]
    async fn peek_keeps_record_commit_removes_it() {
        let f = fixture(4).await;
        let p1 = pod("p1", "vxnet-a", "172.16.10.5");
        f.allocator.alloc_host_nic(&p1).await.unwrap();

        let peeked = f.allocator.free_host_nic(&p1, true).await.unwrap();
        let (nic, ip) = peeked.expect("record exists");
        assert_eq!(nic.id, "nic-1");
        assert_eq!(ip, "172.16.10.5");
        assert_eq!(f.allocator.show_nics().await[0].pods, 1);
        assert!(f.network.removed_rules.lock().unwrap().is_empty());

        let committed = f.allocator.free_host_nic(&p1, false).await.unwrap();
        assert!(committed.is_some());
        assert_eq!(f.allocator.show_nics().await[0].pods, 0);
        assert_eq!(
            f.network.removed_rules.lock().unwrap().as_slice(),
            ["172.16.10.5".parse::<Ipv4Addr>().unwrap()]
        );

        // unknown pods are not an error
        let missing = f
            .allocator
            .free_host_nic(&pod("ghost", "vxnet-a", ""), false)
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn eviction_frees_idle_nics() {
        let f = fixture(4).await;
        let p1 = pod("p1", "vxnet-a", "172.16.10.5");
        let p2 = pod("p2", "vxnet-a", "172.16.10.6");
        f.allocator.alloc_host_nic(&p1).await.unwrap();
        f.allocator.alloc_host_nic(&p2).await.unwrap();

        f.allocator.free_host_nic(&p1, false).await.unwrap();
        // a NIC with pods is not evicted
        f.allocator.clear_free_host_nic(false).await.unwrap();
        assert_eq!(f.allocator.show_nics().await.len(), 1);

        f.allocator.free_host_nic(&p2, false).await.unwrap();
        f.allocator.clear_free_host_nic(false).await.unwrap();

        assert!(f.allocator.show_nics().await.is_empty());
        assert_eq!(f.network.cleanup_calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.cloud.detached.lock().unwrap().as_slice(), ["nic-1"]);
        assert_eq!(f.cloud.deleted.lock().unwrap().as_slice(), ["nic-1"]);
        assert!(f.store.get("vxnet-a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_eviction_resets_phase_for_repair() {
        let f = fixture(4).await;
        let p1 = pod("p1", "vxnet-a", "172.16.10.5");
        f.allocator.alloc_host_nic(&p1).await.unwrap();
        f.allocator.free_host_nic(&p1, false).await.unwrap();

        f.network.fail_cleanup.store(true, Ordering::SeqCst);
        f.allocator.clear_free_host_nic(false).await.unwrap();

        let infos = f.allocator.show_nics().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].phase, "Init");
        assert!(f.cloud.detached.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_setup_keeps_record_and_sync_repairs() {
        let f = fixture(4).await;
        f.network.fail_setup.store(true, Ordering::SeqCst);

        let err = f
            .allocator
            .alloc_host_nic(&pod("p1", "vxnet-a", "172.16.10.5"))
            .await
            .unwrap_err();
        assert!(matches!(err, AllocatorError::Network(_)));

        let infos = f.allocator.show_nics().await;
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].phase, "CreateAndAttach");

        f.network.fail_setup.store(false, Ordering::SeqCst);
        f.allocator.host_nic_check().await;
        assert_eq!(f.allocator.show_nics().await[0].phase, "Succeeded");
    }

    #[tokio::test]
    async fn restore_replays_store_and_resets_cloud_known_nics() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nics.db");
        let store = Arc::new(SqliteNicStore::open(path.to_str().unwrap()).await.unwrap());
        let cloud = Arc::new(MockCloud::default());
        let network = Arc::new(MockNetwork::default());

        // seed a persisted Succeeded record
        let nic = HostNic {
            id: "nic-9".to_string(),
            vx_net: Some(vxnet("vxnet-a")),
            hardware_addr: "nic-9".to_string(),
            primary_address: String::new(),
            route_table_num: 103,
            is_primary: false,
            using: true,
            reserved: true,
            phase: Phase::Succeeded as i32,
        };
        let status = NicStatus {
            nic: nic.clone(),
            pods: HashMap::new(),
        };
        store
            .set("vxnet-a", &serde_json::to_vec(&status).unwrap())
            .await
            .unwrap();
        cloud.created_nics.lock().unwrap().push(nic);

        let conf = AllocatorConf {
            max_nic: 4,
            route_table_base: 100,
            sync_interval: Duration::from_secs(30),
            free_interval: Duration::from_secs(300),
            lease_interval: Duration::from_secs(1800),
        };
        let allocator = Allocator::new(conf, store.clone(), cloud, network);
        allocator.restore().await.unwrap();

        let infos = allocator.show_nics().await;
        assert_eq!(infos.len(), 1);
        // reset for a fresh setup walk by the sync sweep
        assert_eq!(infos[0].phase, "Init");

        // the route table assignment survives the restart
        let p1 = pod("p1", "vxnet-b", "172.16.11.5");
        let fresh = allocator.alloc_host_nic(&p1).await.unwrap();
        assert_ne!(fresh.route_table_num, 103);
    }

    /// Store that always fails writes, for the rollback path.
    struct BrokenStore;

    #[async_trait::async_trait]
    impl NicStore for BrokenStore {
        async fn get(&self, _: &str) -> crate::store::NicStoreResult<Option<Vec<u8>>> {
            Ok(None)
        }
        async fn set(&self, _: &str, _: &[u8]) -> crate::store::NicStoreResult<()> {
            Err(NicStoreError::Database(sqlx::Error::PoolClosed))
        }
        async fn delete(&self, _: &str) -> crate::store::NicStoreResult<()> {
            Ok(())
        }
        async fn iterate(&self) -> crate::store::NicStoreResult<Vec<(String, Vec<u8>)>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn persistence_failure_rolls_back_memory() {
        let cloud = Arc::new(MockCloud::default());
        let network = Arc::new(MockNetwork::default());
        let conf = AllocatorConf {
            max_nic: 4,
            route_table_base: 100,
            sync_interval: Duration::from_secs(30),
            free_interval: Duration::from_secs(300),
            lease_interval: Duration::from_secs(1800),
        };
        let allocator = Allocator::new(conf, Arc::new(BrokenStore), cloud, network);

        // the NIC is handed out (setup succeeded) but nothing may be cached
        // when the write-through fails
        let nic = allocator
            .alloc_host_nic(&pod("p1", "vxnet-a", "172.16.10.5"))
            .await
            .unwrap();
        assert_eq!(nic.id, "nic-1");
        assert!(allocator.show_nics().await.is_empty());
    }
}
