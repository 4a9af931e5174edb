use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::ipam::client::IpamClient;
use crate::ipam::types::{BlockUtilization, PoolBlocksUtilization};
use crate::ipam::{IpamError, IpamResult};

/// Identity of the pod found holding an address, as needed to re-record it.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UsedIpOption {
    pub pod_namespace: String,
    pub pod_name: String,
    pub node_name: String,
    pub block_name: String,
    pub handle_id: String,
}

/// An allocation whose recorded handle does not match the pod now using the
/// address.
#[derive(Debug, Clone, Serialize)]
pub struct IpAllocatedInfo {
    pub record_handle_id: String,
    pub current_used_pod: UsedIpOption,
}

/// Inconsistencies found in one block. The first two maps are actionable:
/// `ip_not_alloc_exists_pod` entries are repaired with
/// [`IpamClient::record_used_ip`], `ip_alloc_not_exists_pod` entries with
/// [`IpamClient::release_leak_ip`]. The rest are advisory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BrokenBlock {
    pub name: String,
    /// ip -> names of pods using it (more than one means unrepairable)
    pub ip_to_pods: HashMap<String, Vec<String>>,
    /// ip used by a pod but marked free in the block
    pub ip_not_alloc_exists_pod: HashMap<String, UsedIpOption>,
    /// ip allocated in the block but no pod holds it -> recorded handle
    pub ip_alloc_not_exists_pod: HashMap<String, String>,
    /// allocated ip whose handle record no longer exists
    pub used_handles_missing: HashMap<String, String>,
    /// allocated ip whose handle does not match the pod using it
    pub ip_alloc_record_not_match: HashMap<String, IpAllocatedInfo>,
}

impl IpamClient {
    /// Scan the pools' blocks against live pod state and report the broken
    /// ones. `ns_to_blocks` maps namespaces to the blocks they draw from;
    /// blocks absent from the map are skipped, since a free block cannot be
    /// judged leaky without knowing its consumers. The two flags enable the
    /// advisory handle checks.
    pub fn get_broken_blocks(
        &self,
        pools: &[String],
        missing_handles: bool,
        mismatch_handles: bool,
        ns_to_blocks: &HashMap<String, Vec<String>>,
    ) -> IpamResult<Vec<PoolBlocksUtilization>> {
        let all_pools = self.datastore().list_pools()?;
        if all_pools.is_empty() {
            return Err(IpamError::Invalid("no pools found".to_string()));
        }

        let mut block_to_ns: HashMap<&str, Vec<&str>> = HashMap::new();
        for (ns, blocks) in ns_to_blocks {
            for block in blocks {
                let entry = block_to_ns.entry(block.as_str()).or_default();
                if !entry.contains(&ns.as_str()) {
                    entry.push(ns.as_str());
                }
            }
        }

        let all_handles = self.datastore().list_handles()?;
        let all_pods = self.pod_lister().list_pods()?;

        let want_all = pools.is_empty();
        let mut usage = Vec::new();
        for vpool in &all_pools {
            let pool = &vpool.value;
            if !want_all && !pools.contains(&pool.name) {
                continue;
            }
            let capacity = pool.num_addresses();
            let reserved = pool.num_reserved_addresses();
            let mut util = PoolBlocksUtilization {
                name: pool.name.clone(),
                capacity,
                reserved,
                allocate: 0,
                unallocated: capacity - reserved,
                ..Default::default()
            };

            let blocks = self.datastore().list_blocks(&pool.name)?;
            if !blocks.is_empty() {
                util.reserved = 0;
                util.allocate = 0;
            }

            for vblock in &blocks {
                let block = &vblock.value;
                let cap = block.num_addresses();
                let free = block.num_free_addresses();
                let res = block.num_reserved_addresses();
                util.allocate += cap - free - res;
                util.reserved += res;
                util.blocks.push(BlockUtilization {
                    name: block.name.clone(),
                    capacity: cap,
                    reserved: res,
                    allocate: cap - free - res,
                    unallocated: free,
                });

                let block_ns = match block_to_ns.get(block.name.as_str()) {
                    Some(ns) => ns,
                    // unmapped block: skip, do not misreport
                    None => continue,
                };

                let mut broken = false;
                let mut report = BrokenBlock {
                    name: block.name.clone(),
                    ..Default::default()
                };

                // Live pods of the attached namespaces whose IP falls inside
                // this block and whose phase still owns the address.
                let mut ip_to_pod: HashMap<Ipv4Addr, &crate::ipam::pods::PodState> =
                    HashMap::new();
                let mut pods_by_key: HashMap<String, &crate::ipam::pods::PodState> =
                    HashMap::new();
                for pod in &all_pods {
                    if !block_ns.iter().any(|ns| *ns == pod.namespace) {
                        continue;
                    }
                    // pods still creating containers may hold an allocation
                    // without reporting an IP yet
                    pods_by_key.insert(pod.handle_key(), pod);
                    if let Some(ip) = pod.ip {
                        if block.contains(ip) && pod.phase.holds_ip() {
                            let names = report.ip_to_pods.entry(ip.to_string()).or_default();
                            if !names.contains(&pod.name) {
                                names.push(pod.name.clone());
                                ip_to_pod.insert(ip, pod);
                            }
                        }
                    }
                }

                for (ordinal, slot) in block.allocations.iter().enumerate() {
                    if *slot == Some(0) {
                        // range-reserved
                        continue;
                    }
                    let ip = block.ordinal_to_ip(ordinal)?;
                    let ip_str = ip.to_string();
                    let pod_names = report
                        .ip_to_pods
                        .get(&ip_str)
                        .map(|v| v.len())
                        .unwrap_or(0);

                    if pod_names > 1 {
                        // shared address: nothing automatic can fix this
                        broken = true;
                        continue;
                    }

                    match slot {
                        None => {
                            if pod_names == 0 {
                                continue;
                            }
                            let pod = match ip_to_pod.get(&ip) {
                                Some(pod) => *pod,
                                None => continue,
                            };
                            if pod.deleting {
                                continue;
                            }
                            broken = true;

                            let handle_id = all_handles
                                .iter()
                                .find(|h| h.value.id.contains(&pod.handle_key()))
                                .map(|h| h.value.id.clone())
                                .unwrap_or_default();
                            report.ip_not_alloc_exists_pod.insert(
                                ip_str,
                                UsedIpOption {
                                    pod_namespace: pod.namespace.clone(),
                                    pod_name: pod.name.clone(),
                                    node_name: pod.node.clone(),
                                    block_name: block.name.clone(),
                                    handle_id,
                                },
                            );
                        }
                        Some(idx) => {
                            let handle_id = match block.attributes.get(*idx) {
                                Some(attr) => attr.handle.clone(),
                                None => {
                                    tracing::warn!(block = %block.name, index = idx,
                                        "allocation points past the attribute table");
                                    continue;
                                }
                            };

                            if pod_names == 0 {
                                // a matching pod still in Pending holds the
                                // allocation legitimately
                                let pending = pods_by_key.iter().any(|(key, pod)| {
                                    handle_id.contains(key.as_str())
                                        && pod.phase == crate::ipam::pods::PodPhase::Pending
                                });
                                if pending {
                                    continue;
                                }
                                broken = true;
                                report.ip_alloc_not_exists_pod.insert(ip_str, handle_id);
                            } else {
                                let pod = match ip_to_pod.get(&ip) {
                                    Some(pod) => *pod,
                                    None => continue,
                                };
                                if handle_id == pod.handle_key() {
                                    continue;
                                }
                                if missing_handles
                                    && !all_handles.iter().any(|h| h.value.id == handle_id)
                                {
                                    broken = true;
                                    report
                                        .used_handles_missing
                                        .insert(ip_str.clone(), handle_id.clone());
                                }
                                if mismatch_handles && !handle_id.starts_with(&pod.handle_key()) {
                                    broken = true;
                                    report.ip_alloc_record_not_match.insert(
                                        ip_str.clone(),
                                        IpAllocatedInfo {
                                            record_handle_id: handle_id.clone(),
                                            current_used_pod: UsedIpOption {
                                                pod_namespace: pod.namespace.clone(),
                                                pod_name: pod.name.clone(),
                                                node_name: pod.node.clone(),
                                                block_name: block.name.clone(),
                                                handle_id: String::new(),
                                            },
                                        },
                                    );
                                }
                            }
                        }
                    }
                }

                if broken {
                    util.broken_block_names.push(block.name.clone());
                    util.broken_blocks.push(report);
                }
            }

            if !blocks.is_empty() {
                util.unallocated = util.capacity - util.allocate - util.reserved;
            }
            usage.push(util);
        }

        Ok(usage)
    }
}
