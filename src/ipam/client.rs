use std::collections::{BTreeMap, HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnet::Ipv4Net;

use crate::ipam::datastore::{Datastore, Versioned};
use crate::ipam::pods::PodLister;
use crate::ipam::types::{
    end_reserved_count, start_reserved_count, Block, BlockUtilization, Handle, Pool,
    PoolBlocksUtilization, PoolDns, PoolRoute, PoolType, PoolUtilization,
};
use crate::ipam::{
    IpamError, IpamResult, ATTR_IP, ATTR_NAMESPACE, ATTR_NODE, ATTR_POD, ATTR_TIMESTAMP,
    DATASTORE_RETRIES,
};

/// Arguments for assigning one address from a named pool.
#[derive(Debug, Clone, Default)]
pub struct AutoAssignArgs {
    pub handle_id: String,
    pub attrs: BTreeMap<String, String>,
    pub pool: String,
}

/// A completed assignment, with everything the caller needs to plumb the
/// address: the pool's gateway/routes/DNS and, for VLAN pools, a MAC derived
/// from the address.
#[derive(Debug, Clone)]
pub struct AssignResult {
    pub ip: Ipv4Addr,
    pub prefix_len: u8,
    pub pool: String,
    pub block: String,
    pub gateway: Option<Ipv4Addr>,
    pub routes: Vec<PoolRoute>,
    pub dns: PoolDns,
    pub vlan_mac: Option<String>,
}

/// The IPAM core. Stateless besides its datastore and pod-lister references;
/// every operation works on fresh snapshots and relies on per-record
/// compare-and-swap, retried up to [`DATASTORE_RETRIES`] times.
pub struct IpamClient {
    store: Arc<dyn Datastore>,
    pods: Arc<dyn PodLister>,
}

impl IpamClient {
    pub fn new(store: Arc<dyn Datastore>, pods: Arc<dyn PodLister>) -> IpamClient {
        IpamClient { store, pods }
    }

    // ── Assignment ────────────────────────────────────────────────────

    /// Assign one address from the named pool, claiming a new block when no
    /// existing block has room.
    pub fn auto_assign(&self, args: &AutoAssignArgs) -> IpamResult<AssignResult> {
        for _ in 0..DATASTORE_RETRIES {
            let pool = match self.store.get_pool(&args.pool) {
                Ok(p) => p.value,
                Err(_) => return Err(IpamError::NoQualifiedPool),
            };
            if pool.disabled {
                tracing::info!(pool = %pool.name, "pool is disabled");
                return Err(IpamError::NoQualifiedPool);
            }
            if pool.type_invalid() {
                return Err(IpamError::UnknownPoolType);
            }

            let block = match self.find_or_claim_block(&pool, 1) {
                Ok(b) => b,
                Err(IpamError::NoFreeBlocks) => return Err(IpamError::NoFreeBlocks),
                Err(err) => {
                    tracing::debug!(pool = %pool.name, %err, "claiming block failed, retrying");
                    continue;
                }
            };

            match self.auto_assign_from_block(&args.handle_id, &args.attrs, block) {
                Ok((ip, block_name, prefix_len)) => {
                    return Ok(result_for(ip, prefix_len, &pool, block_name))
                }
                Err(err) => {
                    tracing::debug!(pool = %pool.name, %err, "assignment failed, retrying");
                    continue;
                }
            }
        }
        Err(IpamError::MaxRetry)
    }

    /// Try the given pools in order, skipping any whose remaining unallocated
    /// count is not comfortably above zero.
    pub fn auto_assign_from_pools(
        &self,
        handle_id: &str,
        attrs: &BTreeMap<String, String>,
        pools: &[String],
    ) -> IpamResult<AssignResult> {
        let utils = self.get_utilization(pools)?;
        for name in pools {
            let unallocated = utils
                .iter()
                .find(|u| u.name == *name)
                .map(|u| u.unallocated)
                .unwrap_or(0);
            if unallocated <= 1 {
                continue;
            }
            let args = AutoAssignArgs {
                handle_id: handle_id.to_string(),
                attrs: attrs.clone(),
                pool: name.clone(),
            };
            match self.auto_assign(&args) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    tracing::warn!(pool = %name, %err, "auto assign from pool failed");
                    continue;
                }
            }
        }
        Err(IpamError::NoQualifiedPool)
    }

    /// Try the given blocks in order, bypassing pool-level selection.
    pub fn auto_assign_from_blocks(
        &self,
        handle_id: &str,
        attrs: &BTreeMap<String, String>,
        blocks: &[String],
    ) -> IpamResult<AssignResult> {
        for name in blocks {
            let vblock = match self.store.get_block(name) {
                Ok(b) => b,
                Err(err) => {
                    tracing::warn!(block = %name, %err, "get block failed");
                    continue;
                }
            };
            if vblock.value.num_free_addresses() < 1 {
                continue;
            }
            let pool_name = vblock.value.pool.clone();
            match self.auto_assign_from_block(handle_id, attrs, vblock) {
                Ok((ip, block_name, prefix_len)) => {
                    let pool = match self.store.get_pool(&pool_name) {
                        Ok(p) => p.value,
                        Err(err) => {
                            tracing::error!(block = %block_name, pool = %pool_name, %err,
                                "assigned block has no pool record");
                            continue;
                        }
                    };
                    return Ok(result_for(ip, prefix_len, &pool, block_name));
                }
                Err(err) => {
                    tracing::warn!(block = %name, %err, "auto assign from block failed");
                    continue;
                }
            }
        }
        Err(IpamError::MaxRetry)
    }

    /// Assign one of the requested addresses exactly, from the given pools or
    /// blocks.
    pub fn assign_fixed_ips(
        &self,
        handle_id: &str,
        attrs: &BTreeMap<String, String>,
        ip_list: &[Ipv4Addr],
        pools: &[String],
        blocks: &[String],
    ) -> IpamResult<AssignResult> {
        if !pools.is_empty() {
            return self.fix_ips_from_pools(handle_id, attrs, ip_list, pools);
        }
        if !blocks.is_empty() {
            return self.fix_ips_from_blocks(handle_id, attrs, ip_list, blocks);
        }
        Err(IpamError::Invalid(
            "no suitable pool and block for fixed assignment".to_string(),
        ))
    }

    fn fix_ips_from_pools(
        &self,
        handle_id: &str,
        attrs: &BTreeMap<String, String>,
        ip_list: &[Ipv4Addr],
        pools: &[String],
    ) -> IpamResult<AssignResult> {
        for pool_name in pools {
            let blocks = self.store.list_blocks(pool_name)?;
            for vblock in blocks {
                if vblock.value.num_free_addresses() < 1 {
                    continue;
                }
                let pool = vblock.value.pool.clone();
                match self.retry_fix_ip(vblock, &pool, handle_id, ip_list, attrs) {
                    Ok(result) => return Ok(result),
                    Err(err) => {
                        tracing::warn!(pool = %pool, %err, "fixed assignment failed");
                    }
                }
            }
        }
        Err(IpamError::Invalid(format!(
            "fixed assignment of {:?} from pools {:?} failed",
            ip_list, pools
        )))
    }

    fn fix_ips_from_blocks(
        &self,
        handle_id: &str,
        attrs: &BTreeMap<String, String>,
        ip_list: &[Ipv4Addr],
        blocks: &[String],
    ) -> IpamResult<AssignResult> {
        for name in blocks {
            let vblock = match self.store.get_block(name) {
                Ok(b) => b,
                Err(err) => {
                    tracing::warn!(block = %name, %err, "get block failed");
                    continue;
                }
            };
            if vblock.value.num_free_addresses() < 1 {
                continue;
            }
            let pool = vblock.value.pool.clone();
            match self.retry_fix_ip(vblock, &pool, handle_id, ip_list, attrs) {
                Ok(result) => return Ok(result),
                Err(err) => {
                    tracing::warn!(block = %name, %err, "fixed assignment failed");
                }
            }
        }
        Err(IpamError::Invalid(format!(
            "fixed assignment of {:?} from blocks {:?} failed",
            ip_list, blocks
        )))
    }

    fn retry_fix_ip(
        &self,
        mut vblock: Versioned<Block>,
        pool_name: &str,
        handle_id: &str,
        ip_list: &[Ipv4Addr],
        attrs: &BTreeMap<String, String>,
    ) -> IpamResult<AssignResult> {
        for _ in 0..DATASTORE_RETRIES {
            let pool = self
                .store
                .get_pool(pool_name)
                .map_err(|_| IpamError::NoQualifiedPool)?
                .value;
            if pool.disabled {
                return Err(IpamError::NoQualifiedPool);
            }
            if pool.type_invalid() {
                return Err(IpamError::UnknownPoolType);
            }

            match self.fix_ip(&mut vblock, handle_id, ip_list, attrs) {
                Ok(ip) => {
                    let prefix_len = vblock.value.cidr.prefix_len();
                    return Ok(result_for(ip, prefix_len, &pool, vblock.value.name.clone()));
                }
                Err(IpamError::Store(err)) if err.is_conflict() => {
                    vblock = self.query_block(&vblock.value.name)?;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(IpamError::MaxRetry)
    }

    fn fix_ip(
        &self,
        vblock: &mut Versioned<Block>,
        handle_id: &str,
        ip_list: &[Ipv4Addr],
        attrs: &BTreeMap<String, String>,
    ) -> IpamResult<Ipv4Addr> {
        for target in ip_list {
            if !vblock.value.contains(*target) {
                continue;
            }
            let ordinal = vblock.value.ip_to_ordinal(*target)?;
            let mut attrs = attrs.clone();
            attrs.insert(ATTR_IP.to_string(), target.to_string());

            if !vblock.value.assign_ordinal(ordinal, handle_id, &attrs) {
                continue;
            }
            self.increment_handle(handle_id, &vblock.value.name, 1)?;
            if let Err(err) = self.store.update_block(&vblock.value, vblock.version) {
                if let Err(dec) = self.decrement_handle(handle_id, &vblock.value.name, 1) {
                    tracing::error!(handle = %handle_id, %dec, "failed to roll back handle");
                }
                return Err(err.into());
            }
            return Ok(*target);
        }
        Err(IpamError::Invalid(format!(
            "no assignable ip in block {}",
            vblock.value.name
        )))
    }

    /// Assign from a specific block, reloading and retrying on write
    /// conflict. Returns (ip, block name, block prefix length).
    fn auto_assign_from_block(
        &self,
        handle_id: &str,
        attrs: &BTreeMap<String, String>,
        mut vblock: Versioned<Block>,
    ) -> IpamResult<(Ipv4Addr, String, u8)> {
        for _ in 0..DATASTORE_RETRIES {
            match self.assign_from_existing_block(&mut vblock, handle_id, attrs) {
                Ok(ip) => {
                    return Ok((
                        ip,
                        vblock.value.name.clone(),
                        vblock.value.cidr.prefix_len(),
                    ))
                }
                Err(IpamError::Store(err)) if err.is_conflict() => {
                    vblock = self.query_block(&vblock.value.name)?;
                    continue;
                }
                Err(err) => return Err(err),
            }
        }
        Err(IpamError::MaxRetry)
    }

    fn assign_from_existing_block(
        &self,
        vblock: &mut Versioned<Block>,
        handle_id: &str,
        attrs: &BTreeMap<String, String>,
    ) -> IpamResult<Ipv4Addr> {
        let ip = vblock.value.auto_assign(handle_id, attrs).ok_or_else(|| {
            IpamError::Invalid(format!("block {} has no available ip", vblock.value.name))
        })?;

        self.increment_handle(handle_id, &vblock.value.name, 1)?;
        if let Err(err) = self.store.update_block(&vblock.value, vblock.version) {
            if let Err(dec) = self.decrement_handle(handle_id, &vblock.value.name, 1) {
                tracing::error!(handle = %handle_id, %dec, "failed to roll back handle");
            }
            return Err(err.into());
        }
        Ok(ip)
    }

    // ── Block selection and generation ────────────────────────────────

    /// Return the first existing block with at least `min_free` addresses,
    /// or claim the next unclaimed block of the pool.
    fn find_or_claim_block(&self, pool: &Pool, min_free: usize) -> IpamResult<Versioned<Block>> {
        for vblock in self.store.list_blocks(&pool.name)? {
            if !vblock.value.is_deleted() && vblock.value.num_free_addresses() >= min_free {
                return Ok(vblock);
            }
        }

        let fresh = self.find_unclaimed_block(pool)?;
        let name = fresh.name.clone();
        match self.store.create_block(&fresh) {
            Ok(()) => {}
            Err(err) if err.is_already_exists() => {}
            Err(err) => return Err(err.into()),
        }

        let vblock = self.query_block(&name)?;
        if vblock.value.num_free_addresses() >= min_free {
            Ok(vblock)
        } else {
            Err(IpamError::Invalid(format!(
                "block {} has {} free addresses, {} required",
                name,
                vblock.value.num_free_addresses(),
                min_free
            )))
        }
    }

    /// Build the next block record not yet present in the datastore. The
    /// returned block is not reserved; a concurrent claimer may win the
    /// create, which the caller absorbs as already-exists.
    fn find_unclaimed_block(&self, pool: &Pool) -> IpamResult<Block> {
        let existing: HashSet<Ipv4Net> = self
            .store
            .list_blocks(&pool.name)?
            .into_iter()
            .map(|b| b.value.cidr)
            .collect();

        match pool.pool_type {
            PoolType::Vlan => {
                // A VLAN pool is one block covering the whole pool CIDR.
                if !existing.contains(&pool.cidr) {
                    let (start, end) = match (pool.range_start, pool.range_end) {
                        (Some(_), Some(_)) => (
                            start_reserved_count(&pool.cidr, pool.range_start),
                            end_reserved_count(&pool.cidr, pool.range_end),
                        ),
                        _ => (0, 0),
                    };
                    return Ok(Block::new(pool, pool.cidr, start, end));
                }
            }
            _ => {
                for subnet in block_cidrs(pool) {
                    if !existing.contains(&subnet) {
                        return Ok(Block::new(
                            pool,
                            subnet,
                            start_reserved_count(&subnet, pool.range_start),
                            end_reserved_count(&subnet, pool.range_end),
                        ));
                    }
                }
            }
        }
        Err(IpamError::NoFreeBlocks)
    }

    /// Materialize every missing block of the pool, pre-marking addresses
    /// already used by live pods according to the namespace→blocks map.
    pub fn auto_generate_blocks_from_pool(
        &self,
        pool_name: &str,
        ns_to_blocks: &HashMap<String, Vec<String>>,
    ) -> IpamResult<()> {
        let pool = self
            .store
            .get_pool(pool_name)
            .map_err(|_| IpamError::NoQualifiedPool)?
            .value;

        let existing: HashSet<Ipv4Net> = self
            .store
            .list_blocks(&pool.name)?
            .into_iter()
            .map(|b| b.value.cidr)
            .collect();

        for subnet in block_cidrs(&pool) {
            if existing.contains(&subnet) {
                continue;
            }
            let mut block = Block::new(
                &pool,
                subnet,
                start_reserved_count(&subnet, pool.range_start),
                end_reserved_count(&subnet, pool.range_end),
            );
            self.set_block_attributes(&mut block, ns_to_blocks)?;
            match self.store.create_block(&block) {
                Ok(()) => {}
                Err(err) if err.is_already_exists() => {
                    self.query_block(&block.name)?;
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Pre-mark ordinals already used by live pods of the namespaces this
    /// block serves. Runs against the local block before it is created.
    fn set_block_attributes(
        &self,
        block: &mut Block,
        ns_to_blocks: &HashMap<String, Vec<String>>,
    ) -> IpamResult<()> {
        let block_ns: Vec<&String> = ns_to_blocks
            .iter()
            .filter(|(_, blocks)| blocks.iter().any(|b| *b == block.name))
            .map(|(ns, _)| ns)
            .collect();
        if block_ns.is_empty() {
            tracing::debug!(block = %block.name, "block not mapped to any namespace");
            return Ok(());
        }

        let handles = self.store.list_handles()?;
        for pod in self.pods.list_pods()? {
            if !block_ns.iter().any(|ns| **ns == pod.namespace) {
                continue;
            }
            let ip = match pod.ip {
                Some(ip) if block.contains(ip) && pod.phase.holds_ip() => ip,
                _ => continue,
            };

            let key = pod.handle_key();
            let handle_id = handles
                .iter()
                .find(|h| h.value.id.contains(&key))
                .map(|h| h.value.id.clone())
                .unwrap_or_else(|| {
                    tracing::info!(ip = %ip, pod = %key, block = %block.name,
                        "no handle record found, synthesizing id");
                    key.clone()
                });

            let ordinal = block.ip_to_ordinal(ip)?;
            let attrs = pod_attrs(&pod, ip);
            block.assign_ordinal(ordinal, &handle_id, &attrs);
        }
        Ok(())
    }

    // ── Release ───────────────────────────────────────────────────────

    /// Release every address held by the handle. Blocks the handle points at
    /// that no longer exist are treated as already released.
    pub fn release_by_handle(&self, handle_id: &str) -> IpamResult<()> {
        let vhandle = match self.query_handle(handle_id) {
            Ok(v) => v,
            Err(IpamError::Store(err)) if err.is_not_found() => return Ok(()),
            Err(err) => return Err(err),
        };

        for block_name in vhandle.value.blocks.keys() {
            self.release_by_handle_from_block(handle_id, block_name)?;
        }
        Ok(())
    }

    fn release_by_handle_from_block(&self, handle_id: &str, block_name: &str) -> IpamResult<()> {
        for _ in 0..DATASTORE_RETRIES {
            let vblock = match self.query_block(block_name) {
                Ok(v) => v,
                // Handles can overestimate; a missing block means all of its
                // addresses are already free.
                Err(IpamError::Store(err)) if err.is_not_found() => return Ok(()),
                Err(err) => return Err(err),
            };

            let mut block = vblock.value;
            let num = block.release_by_handle(handle_id);
            if num == 0 {
                return Ok(());
            }

            match self.store.update_block(&block, vblock.version) {
                Ok(()) => {
                    if let Err(err) = self.decrement_handle(handle_id, block_name, num) {
                        tracing::error!(handle = %handle_id, %err, "failed to decrement handle");
                    }
                    return Ok(());
                }
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(IpamError::MaxRetry)
    }

    /// Free one address of a block regardless of its handle.
    pub fn release_ip(&self, ip: Ipv4Addr, block_name: &str) -> IpamResult<()> {
        let vblock = self.query_block(block_name)?;
        let mut block = vblock.value;
        if !block.contains(ip) {
            return Err(IpamError::Invalid(format!(
                "ip {} not in block {}",
                ip, block_name
            )));
        }
        let ordinal = block.ip_to_ordinal(ip)?;
        block.release_ordinal(ordinal)?;
        self.store.update_block(&block, vblock.version)?;
        Ok(())
    }

    /// Free a leaked allocation after verifying no live pod still uses the
    /// address. Prefers release-by-handle so the handle refcount stays
    /// consistent; falls back to release-by-ip when the handle record is
    /// gone.
    pub fn release_leak_ip(
        &self,
        ip: Ipv4Addr,
        block_name: Option<&str>,
        ignore_error: bool,
    ) -> IpamResult<()> {
        for pod in self.pods.list_pods()? {
            if pod.ip == Some(ip) && pod.phase.holds_ip() {
                if ignore_error {
                    tracing::info!(%ip, pod = %pod.handle_key(), "ip still in use, skipping release");
                    return Ok(());
                }
                return Err(IpamError::Invalid(format!(
                    "ip {} still used by pod {}/{}",
                    ip, pod.namespace, pod.name
                )));
            }
        }

        let vblock = match block_name {
            Some(name) => {
                let vblock = self.query_block(name)?;
                if !vblock.value.contains(ip) {
                    return Err(IpamError::Invalid(format!(
                        "ip {} not in block {}",
                        ip, name
                    )));
                }
                vblock
            }
            None => self.block_for_ip(ip)?,
        };

        let block = &vblock.value;
        let ordinal = block.ip_to_ordinal(ip)?;
        let attr_index = match block.allocations[ordinal] {
            None => {
                if ignore_error {
                    tracing::info!(%ip, block = %block.name, "ip not allocated, nothing to release");
                    return Ok(());
                }
                return Err(IpamError::Invalid(format!(
                    "ip {} not allocated in block {}",
                    ip, block.name
                )));
            }
            Some(0) => {
                return Err(IpamError::Invalid(format!(
                    "ip {} is range-reserved in block {}",
                    ip, block.name
                )))
            }
            Some(idx) => idx,
        };

        let handle_id = match block.attributes.get(attr_index) {
            Some(attr) if !attr.handle.is_empty() => attr.handle.clone(),
            _ => {
                tracing::info!(%ip, block = %block.name, "allocation has no handle, releasing directly");
                return self.release_ip(ip, &block.name);
            }
        };

        match self.query_handle(&handle_id) {
            Ok(_) => {
                tracing::info!(%ip, handle = %handle_id, "releasing by handle");
                if let Err(err) = self.release_by_handle(&handle_id) {
                    tracing::error!(handle = %handle_id, %err, "release by handle failed");
                }
                Ok(())
            }
            Err(IpamError::Store(err)) if err.is_not_found() => {
                tracing::info!(%ip, handle = %handle_id, "handle record missing, releasing directly");
                self.release_ip(ip, &block.name)
            }
            Err(err) => Err(err),
        }
    }

    // ── Repair: re-record a used address the block lost ──────────────

    /// Reconstruct the allocation for an address a live pod holds but the
    /// block marks free. With `fix` unset an already-allocated ordinal is an
    /// error; with it set the stale allocation is replaced.
    pub fn record_used_ip(
        &self,
        ip: Ipv4Addr,
        mut option: crate::ipam::broken::UsedIpOption,
        fix: bool,
    ) -> IpamResult<()> {
        let vblock = self.block_for_ip(ip)?;
        let ordinal = vblock.value.ip_to_ordinal(ip)?;
        if vblock.value.allocations[ordinal].is_some() && !fix {
            return Err(IpamError::Invalid(format!(
                "ip {} already allocated in block {}",
                ip, vblock.value.name
            )));
        }
        option.block_name = vblock.value.name.clone();

        if option.pod_namespace.is_empty() || option.pod_name.is_empty() || option.handle_id.is_empty()
        {
            let pods = self.pods.list_pods()?;
            let holders: Vec<_> = pods.iter().filter(|p| p.ip == Some(ip)).collect();
            if holders.is_empty() {
                return Err(IpamError::Invalid(format!(
                    "ip {} does not belong to any pod",
                    ip
                )));
            }
            if holders.len() > 1 {
                let names: Vec<String> = holders.iter().map(|p| p.handle_key()).collect();
                return Err(IpamError::Invalid(format!(
                    "ip {} belongs to multiple pods {:?}, cannot determine which to record",
                    ip, names
                )));
            }
            let pod = holders[0];
            option.pod_namespace = pod.namespace.clone();
            option.pod_name = pod.name.clone();
            option.handle_id = pod.handle_key();
        }

        tracing::info!(%ip, ?option, "recording used ip");
        self.record_used_ip_in_block(ip, &option, fix)
    }

    fn record_used_ip_in_block(
        &self,
        ip: Ipv4Addr,
        option: &crate::ipam::broken::UsedIpOption,
        fix: bool,
    ) -> IpamResult<()> {
        let pod = match self.pods.get_pod(&option.pod_namespace, &option.pod_name)? {
            Some(pod) => pod,
            None => {
                tracing::info!(pod = %option.pod_namespace, name = %option.pod_name,
                    "pod gone, nothing to record");
                return Ok(());
            }
        };
        if pod.ip != Some(ip) {
            return Err(IpamError::Invalid(format!(
                "ip {} is not held by pod {}/{}",
                ip, option.pod_namespace, option.pod_name
            )));
        }

        let vblock = self.query_block(&option.block_name)?;
        let mut block = vblock.value;
        let ordinal = block.ip_to_ordinal(ip)?;
        if block.allocations[ordinal].is_some() {
            if !fix {
                return Err(IpamError::Invalid(format!(
                    "ip {} already allocated in block {}",
                    ip, block.name
                )));
            }
            block.release_ordinal(ordinal)?;
        }

        let attrs = pod_attrs(&pod, ip);
        block.assign_ordinal(ordinal, &option.handle_id, &attrs);
        self.store.update_block(&block, vblock.version)?;
        Ok(())
    }

    // ── Utilization ───────────────────────────────────────────────────

    /// Per-pool capacity/allocated/reserved/unallocated. With no names
    /// given, reports every pool.
    pub fn get_utilization(&self, pools: &[String]) -> IpamResult<Vec<PoolUtilization>> {
        let all_pools = self.store.list_pools()?;
        if all_pools.is_empty() {
            return Err(IpamError::Invalid("no pools found".to_string()));
        }

        let want_all = pools.is_empty();
        let mut usage = Vec::new();
        for vpool in &all_pools {
            let pool = &vpool.value;
            if !want_all && !pools.contains(&pool.name) {
                continue;
            }
            let capacity = pool.num_addresses();
            let reserved = pool.num_reserved_addresses();
            let mut util = PoolUtilization {
                name: pool.name.clone(),
                capacity,
                reserved,
                allocate: 0,
                unallocated: capacity - reserved,
            };

            let blocks = self.store.list_blocks(&pool.name)?;
            if !blocks.is_empty() {
                util.reserved = 0;
                util.allocate = 0;
                for vblock in &blocks {
                    let b = &vblock.value;
                    util.allocate +=
                        b.num_addresses() - b.num_free_addresses() - b.num_reserved_addresses();
                    util.reserved += b.num_reserved_addresses();
                }
                util.unallocated = util.capacity - util.allocate - util.reserved;
            }
            usage.push(util);
        }
        Ok(usage)
    }

    /// Like [`get_utilization`], with per-block detail.
    ///
    /// [`get_utilization`]: IpamClient::get_utilization
    pub fn get_pool_blocks_utilization(
        &self,
        pools: &[String],
    ) -> IpamResult<Vec<PoolBlocksUtilization>> {
        let all_pools = self.store.list_pools()?;
        if all_pools.is_empty() {
            return Err(IpamError::Invalid("no pools found".to_string()));
        }

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

            let blocks = self.store.list_blocks(&pool.name)?;
            if !blocks.is_empty() {
                util.reserved = 0;
                util.allocate = 0;
                for vblock in &blocks {
                    let b = &vblock.value;
                    let cap = b.num_addresses();
                    let free = b.num_free_addresses();
                    let res = b.num_reserved_addresses();
                    util.allocate += cap - free - res;
                    util.reserved += res;
                    util.blocks.push(BlockUtilization {
                        name: b.name.clone(),
                        capacity: cap,
                        reserved: res,
                        allocate: cap - free - res,
                        unallocated: free,
                    });
                }
                util.unallocated = util.capacity - util.allocate - util.reserved;
            }
            usage.push(util);
        }
        Ok(usage)
    }

    // ── Lookups ───────────────────────────────────────────────────────

    /// The handle recorded for an allocated address.
    pub fn get_handle_id_for_ip(&self, ip: Ipv4Addr) -> IpamResult<String> {
        let vblock = self.block_for_ip(ip)?;
        let block = &vblock.value;
        let ordinal = block.ip_to_ordinal(ip)?;
        let idx = block.allocations[ordinal].ok_or_else(|| {
            IpamError::Invalid(format!("ip {} not allocated in block {}", ip, block.name))
        })?;
        block
            .attributes
            .get(idx)
            .map(|a| a.handle.clone())
            .ok_or_else(|| {
                IpamError::Invalid(format!("ip {} not allocated in block {}", ip, block.name))
            })
    }

    /// Every address currently held by the handle.
    pub fn get_ips_by_handle(&self, handle_id: &str) -> IpamResult<Vec<Ipv4Addr>> {
        let vhandle = match self.query_handle(handle_id) {
            Ok(v) => v,
            Err(IpamError::Store(err)) if err.is_not_found() => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };

        let mut ips = Vec::new();
        for block_name in vhandle.value.blocks.keys() {
            let vblock = match self.query_block(block_name) {
                Ok(v) => v,
                Err(IpamError::Store(err)) if err.is_not_found() => continue,
                Err(err) => return Err(err),
            };
            for ordinal in vblock.value.handle_ordinals(handle_id) {
                ips.push(vblock.value.ordinal_to_ip(ordinal)?);
            }
        }
        Ok(ips)
    }

    /// Locate the block containing an address by scanning pools.
    pub(crate) fn block_for_ip(&self, ip: Ipv4Addr) -> IpamResult<Versioned<Block>> {
        let mut pool_name = None;
        for vpool in self.store.list_pools()? {
            if vpool.value.contains(ip) {
                pool_name = Some(vpool.value.name);
            }
        }
        let pool_name = pool_name
            .ok_or_else(|| IpamError::Invalid(format!("ip {} not in any pool", ip)))?;

        for vblock in self.store.list_blocks(&pool_name)? {
            if !vblock.value.is_deleted() && vblock.value.contains(ip) {
                return Ok(vblock);
            }
        }
        Err(IpamError::Invalid(format!(
            "ip {} not in any existing block",
            ip
        )))
    }

    // ── Pool deletion support ─────────────────────────────────────────

    /// Whether the pool can be deleted. Deletes every empty block along the
    /// way; returns false as soon as a block still holds allocations. This is
    /// the only path that removes blocks.
    pub fn delete_pool_blocks(&self, pool_name: &str) -> IpamResult<bool> {
        for vblock in self.store.list_blocks(pool_name)? {
            if vblock.value.empty() {
                self.delete_block(vblock)?;
            } else {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Tombstone then delete a block, so concurrent readers observe it as
    /// absent even if the hard delete races.
    fn delete_block(&self, mut vblock: Versioned<Block>) -> IpamResult<()> {
        if !vblock.value.is_deleted() {
            vblock.value.mark_deleted();
            self.store.update_block(&vblock.value, vblock.version)?;
        }
        match self.store.delete_block(&vblock.value.name) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // ── Handle bookkeeping ────────────────────────────────────────────

    fn increment_handle(&self, handle_id: &str, block_name: &str, num: usize) -> IpamResult<()> {
        for _ in 0..DATASTORE_RETRIES {
            let (mut handle, version, create) = match self.query_handle(handle_id) {
                Ok(v) => (v.value, v.version, false),
                Err(IpamError::Store(err)) if err.is_not_found() => {
                    (Handle::new(handle_id), 0, true)
                }
                Err(err) => return Err(err),
            };

            handle.increment_block(block_name, num);

            let result = if create {
                self.store.create_handle(&handle)
            } else {
                self.store.update_handle(&handle, version)
            };
            match result {
                Ok(()) => return Ok(()),
                Err(err) if err.is_already_exists() || err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(IpamError::MaxRetry)
    }

    fn decrement_handle(&self, handle_id: &str, block_name: &str, num: usize) -> IpamResult<()> {
        for _ in 0..DATASTORE_RETRIES {
            let vhandle = self.query_handle(handle_id)?;
            let mut handle = vhandle.value;
            handle.decrement_block(block_name, num)?;

            if handle.empty() {
                match self.delete_handle(handle, vhandle.version) {
                    Ok(()) => return Ok(()),
                    Err(IpamError::Store(err)) if err.is_conflict() => continue,
                    Err(IpamError::Store(err)) if err.is_not_found() => return Ok(()),
                    Err(err) => return Err(err),
                }
            } else {
                match self.store.update_handle(&handle, vhandle.version) {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_conflict() => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        }
        Err(IpamError::MaxRetry)
    }

    fn delete_handle(&self, mut handle: Handle, version: u64) -> IpamResult<()> {
        if !handle.is_deleted() {
            handle.mark_deleted();
            self.store.update_handle(&handle, version)?;
        }
        match self.store.delete_handle(&handle.id) {
            Ok(()) => Ok(()),
            Err(err) if err.is_not_found() => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    // ── Tombstone-aware reads ─────────────────────────────────────────

    /// Read a block, finishing the deletion of tombstoned records and
    /// reporting them as absent.
    pub(crate) fn query_block(&self, name: &str) -> IpamResult<Versioned<Block>> {
        let vblock = self.store.get_block(name).map_err(IpamError::Store)?;
        if vblock.value.is_deleted() {
            self.delete_block(vblock)?;
            return Err(IpamError::Store(
                crate::ipam::datastore::StoreError::NotFound(name.to_string()),
            ));
        }
        Ok(vblock)
    }

    pub(crate) fn query_handle(&self, id: &str) -> IpamResult<Versioned<Handle>> {
        let vhandle = self.store.get_handle(id).map_err(IpamError::Store)?;
        if vhandle.value.is_deleted() {
            let version = vhandle.version;
            self.delete_handle(vhandle.value, version)?;
            return Err(IpamError::Store(
                crate::ipam::datastore::StoreError::NotFound(id.to_string()),
            ));
        }
        Ok(vhandle)
    }

    pub(crate) fn datastore(&self) -> &Arc<dyn Datastore> {
        &self.store
    }

    pub(crate) fn pod_lister(&self) -> &Arc<dyn PodLister> {
        &self.pods
    }
}

/// Block CIDRs covering the pool, lowest first. Empty when the pool's block
/// size does not nest inside its CIDR.
fn block_cidrs(pool: &Pool) -> Box<dyn Iterator<Item = Ipv4Net> + '_> {
    if pool.block_size > 32 || pool.block_size < pool.cidr.prefix_len() {
        return Box::new(std::iter::empty());
    }
    let stride = 1u64 << (32 - pool.block_size);
    let base = u64::from(u32::from(pool.cidr.network()));
    let end = base + crate::ipam::types::cidr_capacity(&pool.cidr) as u64;
    let block_size = pool.block_size;
    Box::new(
        (0u64..)
            .map(move |i| base + i * stride)
            .take_while(move |addr| *addr < end)
            .filter_map(move |addr| Ipv4Net::new(Ipv4Addr::from(addr as u32), block_size).ok()),
    )
}

fn result_for(ip: Ipv4Addr, prefix_len: u8, pool: &Pool, block: String) -> AssignResult {
    AssignResult {
        ip,
        prefix_len,
        pool: pool.name.clone(),
        block,
        gateway: pool.gateway,
        routes: pool.routes.clone(),
        dns: pool.dns.clone(),
        vlan_mac: match pool.pool_type {
            PoolType::Vlan => Some(mac_for_ip(ip)),
            _ => None,
        },
    }
}

/// Deterministic locally-administered MAC for a VLAN address.
fn mac_for_ip(ip: Ipv4Addr) -> String {
    let o = ip.octets();
    format!("52:54:{:02x}:{:02x}:{:02x}:{:02x}", o[0], o[1], o[2], o[3])
}

fn pod_attrs(pod: &crate::ipam::pods::PodState, ip: Ipv4Addr) -> BTreeMap<String, String> {
    let mut attrs = BTreeMap::new();
    attrs.insert(ATTR_NAMESPACE.to_string(), pod.namespace.clone());
    attrs.insert(ATTR_POD.to_string(), pod.name.clone());
    attrs.insert(ATTR_NODE.to_string(), pod.node.clone());
    attrs.insert(ATTR_IP.to_string(), ip.to_string());
    attrs.insert(ATTR_TIMESTAMP.to_string(), pod.created.clone());
    attrs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipam::datastore::{MemoryDatastore, StoreError};
    use crate::ipam::pods::StaticPodLister;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn pool(name: &str, cidr: &str, block_size: u8) -> Pool {
        Pool {
            name: name.to_string(),
            cidr: cidr.parse().unwrap(),
            block_size,
            range_start: None,
            range_end: None,
            pool_type: PoolType::Routed,
            gateway: Some("10.20.0.1".parse().unwrap()),
            routes: Vec::new(),
            dns: PoolDns::default(),
            disabled: false,
        }
    }

    fn client_with(pools: Vec<Pool>) -> (IpamClient, Arc<MemoryDatastore>) {
        let ds = Arc::new(MemoryDatastore::new());
        for p in pools {
            ds.create_pool(&p).unwrap();
        }
        let client = IpamClient::new(ds.clone(), Arc::new(StaticPodLister::default()));
        (client, ds)
    }

    fn args(handle: &str, pool: &str) -> AutoAssignArgs {
        AutoAssignArgs {
            handle_id: handle.to_string(),
            attrs: BTreeMap::new(),
            pool: pool.to_string(),
        }
    }

    #[test]
    fn auto_assign_claims_block_and_counts_handle() {
        let (client, ds) = client_with(vec![pool("p1", "10.20.0.0/24", 26)]);

        let result = client.auto_assign(&args("ns1-pod1", "p1")).unwrap();
        assert_eq!(result.pool, "p1");
        assert_eq!(result.block, "10-20-0-0-26");
        assert_eq!(result.ip, "10.20.0.0".parse::<Ipv4Addr>().unwrap());
        assert_eq!(result.prefix_len, 26);

        let block = ds.get_block("10-20-0-0-26").unwrap().value;
        assert_eq!(block.num_free_addresses(), 63);
        let handle = ds.get_handle("ns1-pod1").unwrap().value;
        assert_eq!(handle.blocks["10-20-0-0-26"], 1);
    }

    #[test]
    fn auto_assign_rejects_disabled_and_unknown_pools() {
        let mut disabled = pool("p1", "10.20.0.0/24", 26);
        disabled.disabled = true;
        let mut unknown = pool("p2", "10.21.0.0/24", 26);
        unknown.pool_type = PoolType::Unknown;
        let (client, _) = client_with(vec![disabled, unknown]);

        assert!(matches!(
            client.auto_assign(&args("h", "p1")),
            Err(IpamError::NoQualifiedPool)
        ));
        assert!(matches!(
            client.auto_assign(&args("h", "p2")),
            Err(IpamError::UnknownPoolType)
        ));
        assert!(matches!(
            client.auto_assign(&args("h", "absent")),
            Err(IpamError::NoQualifiedPool)
        ));
    }

    #[test]
    fn pool_exhaustion_reports_no_free_blocks() {
        // /30 pool with /30 blocks: one block of 4 addresses.
        let (client, _) = client_with(vec![pool("p1", "10.9.0.0/30", 30)]);
        for i in 0..4 {
            client.auto_assign(&args(&format!("h{}", i), "p1")).unwrap();
        }
        assert!(matches!(
            client.auto_assign(&args("h5", "p1")),
            Err(IpamError::NoFreeBlocks)
        ));
    }

    #[test]
    fn release_by_handle_is_inverse_of_assign() {
        let (client, ds) = client_with(vec![pool("p1", "10.20.0.0/24", 26)]);

        // Claim the block with a different handle first so the block record
        // exists both before and after.
        client.auto_assign(&args("keeper", "p1")).unwrap();
        let before = ds.get_block("10-20-0-0-26").unwrap().value;

        client.auto_assign(&args("ns1-pod1", "p1")).unwrap();
        client.release_by_handle("ns1-pod1").unwrap();

        let after = ds.get_block("10-20-0-0-26").unwrap().value;
        assert_eq!(
            before.num_free_addresses(),
            after.num_free_addresses()
        );
        assert!(after.handle_ordinals("ns1-pod1").is_empty());
        // empty handle records are deleted
        assert!(ds.get_handle("ns1-pod1").unwrap_err().is_not_found());
    }

    #[test]
    fn handle_counts_match_block_contents() {
        let (client, ds) = client_with(vec![pool("p1", "10.20.0.0/24", 26)]);
        for _ in 0..3 {
            client.auto_assign(&args("ns1-pod1", "p1")).unwrap();
        }
        client.auto_assign(&args("ns1-pod2", "p1")).unwrap();

        let block = ds.get_block("10-20-0-0-26").unwrap().value;
        let handle1 = ds.get_handle("ns1-pod1").unwrap().value;
        let handle2 = ds.get_handle("ns1-pod2").unwrap().value;
        assert_eq!(
            handle1.blocks["10-20-0-0-26"],
            block.handle_ordinals("ns1-pod1").len()
        );
        assert_eq!(
            handle2.blocks["10-20-0-0-26"],
            block.handle_ordinals("ns1-pod2").len()
        );
        let allocated =
            block.num_addresses() - block.num_free_addresses() - block.num_reserved_addresses();
        assert_eq!(allocated, 4);
    }

    /// Delegates to a memory store but fails the first block update with a
    /// conflict, emulating a concurrent writer winning the round.
    struct ConflictOnce {
        inner: MemoryDatastore,
        tripped: AtomicBool,
    }

    impl Datastore for ConflictOnce {
        fn get_pool(&self, name: &str) -> Result<Versioned<Pool>, StoreError> {
            self.inner.get_pool(name)
        }
        fn list_pools(&self) -> Result<Vec<Versioned<Pool>>, StoreError> {
            self.inner.list_pools()
        }
        fn create_pool(&self, pool: &Pool) -> Result<(), StoreError> {
            self.inner.create_pool(pool)
        }
        fn update_pool(&self, pool: &Pool, expected: u64) -> Result<(), StoreError> {
            self.inner.update_pool(pool, expected)
        }
        fn get_block(&self, name: &str) -> Result<Versioned<Block>, StoreError> {
            self.inner.get_block(name)
        }
        fn list_blocks(&self, pool: &str) -> Result<Vec<Versioned<Block>>, StoreError> {
            self.inner.list_blocks(pool)
        }
        fn create_block(&self, block: &Block) -> Result<(), StoreError> {
            self.inner.create_block(block)
        }
        fn update_block(&self, block: &Block, expected: u64) -> Result<(), StoreError> {
            if !self.tripped.swap(true, Ordering::SeqCst) {
                return Err(StoreError::Conflict(block.name.clone()));
            }
            self.inner.update_block(block, expected)
        }
        fn delete_block(&self, name: &str) -> Result<(), StoreError> {
            self.inner.delete_block(name)
        }
        fn get_handle(&self, id: &str) -> Result<Versioned<Handle>, StoreError> {
            self.inner.get_handle(id)
        }
        fn list_handles(&self) -> Result<Vec<Versioned<Handle>>, StoreError> {
            self.inner.list_handles()
        }
        fn create_handle(&self, handle: &Handle) -> Result<(), StoreError> {
            self.inner.create_handle(handle)
        }
        fn update_handle(&self, handle: &Handle, expected: u64) -> Result<(), StoreError> {
            self.inner.update_handle(handle, expected)
        }
        fn delete_handle(&self, id: &str) -> Result<(), StoreError> {
            self.inner.delete_handle(id)
        }
    }

    #[test]
    fn conflicting_write_is_retried() {
        let ds = Arc::new(ConflictOnce {
            inner: MemoryDatastore::new(),
            tripped: AtomicBool::new(false),
        });
        ds.create_pool(&pool("p1", "10.20.0.0/24", 26)).unwrap();
        let client = IpamClient::new(ds.clone(), Arc::new(StaticPodLister::default()));

        let r1 = client.auto_assign(&args("ns1-pod1", "p1")).unwrap();
        let r2 = client.auto_assign(&args("ns1-pod2", "p1")).unwrap();
        assert_ne!(r1.ip, r2.ip);

        let h1 = ds.get_handle("ns1-pod1").unwrap().value;
        let h2 = ds.get_handle("ns1-pod2").unwrap().value;
        assert_eq!(h1.blocks["10-20-0-0-26"], 1);
        assert_eq!(h2.blocks["10-20-0-0-26"], 1);
    }

    #[test]
    fn generate_blocks_covers_pool() {
        let mut p = pool("p1", "10.20.0.0/16", 24);
        p.range_start = Some("10.20.0.10".parse().unwrap());
        p.range_end = Some("10.20.0.250".parse().unwrap());
        let (client, ds) = client_with(vec![p]);

        client
            .auto_generate_blocks_from_pool("p1", &HashMap::new())
            .unwrap();

        let blocks = ds.list_blocks("p1").unwrap();
        assert_eq!(blocks.len(), 256);
        assert_eq!(blocks[0].value.name, "10-20-0-0-24");
        assert_eq!(blocks[255].value.name, "10-20-255-0-24");

        // first block: ordinals 0-9 and the 5 past the range end reserved
        let first = &blocks[0].value;
        assert_eq!(first.num_addresses(), 256);
        assert_eq!(first.num_reserved_addresses(), 15);
        assert_eq!(first.num_free_addresses(), 241);

        // the range lies entirely below every later block, so those are
        // fully reserved
        let second = &blocks[1].value;
        assert_eq!(second.num_reserved_addresses(), 256);
        assert_eq!(second.num_free_addresses(), 0);

        // idempotent
        client
            .auto_generate_blocks_from_pool("p1", &HashMap::new())
            .unwrap();
        assert_eq!(ds.list_blocks("p1").unwrap().len(), 256);
    }

    #[test]
    fn vlan_pool_is_one_block() {
        let mut p = pool("v1", "172.22.0.0/24", 24);
        p.pool_type = PoolType::Vlan;
        let (client, ds) = client_with(vec![p.clone()]);

        let result = client.auto_assign(&args("h1", "v1")).unwrap();
        assert_eq!(result.block, "172-22-0-0-24");
        assert!(result.vlan_mac.is_some());

        let blocks = ds.list_blocks("v1").unwrap();
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].value.cidr, p.cidr);

        // once the block exists there is nothing left to claim
        assert!(matches!(
            client.find_unclaimed_block(&p),
            Err(IpamError::NoFreeBlocks)
        ));
    }

    #[test]
    fn assign_from_pools_skips_nearly_full() {
        // p1 is a /30: capacity 4; drain to 1 free so it gets skipped.
        let (client, ds) = client_with(vec![
            pool("p1", "10.9.0.0/30", 30),
            pool("p2", "10.10.0.0/24", 26),
        ]);
        for i in 0..3 {
            client.auto_assign(&args(&format!("h{}", i), "p1")).unwrap();
        }
        let util = client.get_utilization(&["p1".to_string()]).unwrap();
        assert_eq!(util[0].unallocated, 1);

        let result = client
            .auto_assign_from_pools("h-next", &BTreeMap::new(), &["p1".into(), "p2".into()])
            .unwrap();
        assert_eq!(result.pool, "p2");
        assert!(ds.list_blocks("p2").unwrap().len() == 1);
    }

    #[test]
    fn assign_from_blocks_in_order() {
        let (client, ds) = client_with(vec![pool("p1", "10.20.0.0/24", 26)]);
        client
            .auto_generate_blocks_from_pool("p1", &HashMap::new())
            .unwrap();
        let names: Vec<String> = ds
            .list_blocks("p1")
            .unwrap()
            .iter()
            .map(|b| b.value.name.clone())
            .collect();

        let result = client
            .auto_assign_from_blocks("h1", &BTreeMap::new(), &names)
            .unwrap();
        assert_eq!(result.block, names[0]);

        assert!(matches!(
            client.auto_assign_from_blocks("h2", &BTreeMap::new(), &["missing".to_string()]),
            Err(IpamError::MaxRetry)
        ));
    }

    #[test]
    fn fixed_ip_assignment() {
        let (client, ds) = client_with(vec![pool("p1", "10.20.0.0/24", 26)]);
        client
            .auto_generate_blocks_from_pool("p1", &HashMap::new())
            .unwrap();

        let wanted: Vec<Ipv4Addr> = vec!["10.20.0.7".parse().unwrap()];
        let result = client
            .assign_fixed_ips("ns1-pod1", &BTreeMap::new(), &wanted, &["p1".to_string()], &[])
            .unwrap();
        assert_eq!(result.ip, wanted[0]);

        let block = ds.get_block("10-20-0-0-26").unwrap().value;
        assert!(block.handle_ordinals("ns1-pod1").contains(&7));

        // the exact address is taken now
        assert!(client
            .assign_fixed_ips("ns1-pod2", &BTreeMap::new(), &wanted, &["p1".to_string()], &[])
            .is_err());
    }

    #[test]
    fn release_ip_frees_exact_ordinal() {
        let (client, ds) = client_with(vec![pool("p1", "10.20.0.0/24", 26)]);
        let result = client.auto_assign(&args("h1", "p1")).unwrap();

        client.release_ip(result.ip, &result.block).unwrap();
        let block = ds.get_block(&result.block).unwrap().value;
        assert_eq!(block.num_free_addresses(), 64);
    }

    #[test]
    fn get_ips_by_handle_walks_blocks() {
        let (client, _) = client_with(vec![pool("p1", "10.20.0.0/24", 26)]);
        let r1 = client.auto_assign(&args("h1", "p1")).unwrap();
        let r2 = client.auto_assign(&args("h1", "p1")).unwrap();

        let mut ips = client.get_ips_by_handle("h1").unwrap();
        ips.sort();
        assert_eq!(ips, vec![r1.ip, r2.ip]);
        assert!(client.get_ips_by_handle("absent").unwrap().is_empty());
    }

    #[test]
    fn handle_id_for_ip() {
        let (client, _) = client_with(vec![pool("p1", "10.20.0.0/24", 26)]);
        let result = client.auto_assign(&args("ns1-pod1", "p1")).unwrap();
        assert_eq!(
            client.get_handle_id_for_ip(result.ip).unwrap(),
            "ns1-pod1"
        );
        assert!(client
            .get_handle_id_for_ip("10.20.0.200".parse().unwrap())
            .is_err());
    }

    #[test]
    fn pool_deletability() {
        let (client, ds) = client_with(vec![pool("p1", "10.20.0.0/24", 26)]);
        let result = client.auto_assign(&args("h1", "p1")).unwrap();
        assert!(!client.delete_pool_blocks("p1").unwrap());

        client.release_by_handle("h1").unwrap();
        assert!(client.delete_pool_blocks("p1").unwrap());
        assert!(ds.get_block(&result.block).unwrap_err().is_not_found());
    }
}
