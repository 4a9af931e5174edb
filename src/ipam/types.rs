use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::ipam::{IpamError, IpamResult, RESERVED_HANDLE, RESERVED_NOTE};

/// How addresses from a pool reach the VPC fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolType {
    Routed,
    Vlan,
    /// Present in the record but not understood by this agent version.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolRoute {
    pub dst: Ipv4Net,
    pub gw: Option<Ipv4Addr>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolDns {
    pub nameservers: Vec<String>,
    pub search: Vec<String>,
    pub options: Vec<String>,
    pub domain: Option<String>,
}

/// A declared address space. Blocks are carved out of `cidr` at
/// `block_size`; `range_start`/`range_end` bound the usable addresses, the
/// remainder of every block being pre-reserved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub name: String,
    pub cidr: Ipv4Net,
    /// Prefix length of the blocks carved from this pool.
    pub block_size: u8,
    pub range_start: Option<Ipv4Addr>,
    pub range_end: Option<Ipv4Addr>,
    pub pool_type: PoolType,
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub routes: Vec<PoolRoute>,
    #[serde(default)]
    pub dns: PoolDns,
    #[serde(default)]
    pub disabled: bool,
}

impl Pool {
    pub fn num_addresses(&self) -> usize {
        cidr_capacity(&self.cidr)
    }

    /// Addresses of the pool CIDR that fall outside the configured range.
    pub fn num_reserved_addresses(&self) -> usize {
        let cap = self.num_addresses();
        let start = start_reserved_count(&self.cidr, self.range_start);
        let end = end_reserved_count(&self.cidr, self.range_end);
        (start + end).min(cap)
    }

    pub fn type_invalid(&self) -> bool {
        self.pool_type == PoolType::Unknown
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.cidr.contains(&ip)
    }
}

/// One deduplicated attribute record; allocations refer to these by index so
/// identical (handle, metadata) pairs share a single entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationAttribute {
    pub handle: String,
    #[serde(default)]
    pub attrs: BTreeMap<String, String>,
}

/// A materialized sub-CIDR of a pool.
///
/// For every ordinal `i` exactly one of the following holds:
/// `allocations[i] == None && unallocated contains i`, or
/// `allocations[i] == Some(k)` with `k < attributes.len()` and `i` absent
/// from `unallocated`. Attribute index 0 is the range-reservation sentinel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub pool: String,
    pub cidr: Ipv4Net,
    pub allocations: Vec<Option<usize>>,
    pub unallocated: Vec<usize>,
    pub attributes: Vec<AllocationAttribute>,
    #[serde(default)]
    pub deleted: bool,
}

impl Block {
    /// Derive the record name from a block CIDR: `10.20.0.0/24` becomes
    /// `10-20-0-0-24`.
    pub fn name_for_cidr(cidr: &Ipv4Net) -> String {
        format!("{}", cidr).replace(['.', '/'], "-")
    }

    /// Create a block for `cidr` with the pool's range already reserved.
    /// Ordinals below `start_reserved` and the top `end_reserved` ordinals
    /// are marked allocated against the sentinel attribute.
    pub fn new(pool: &Pool, cidr: Ipv4Net, start_reserved: usize, end_reserved: usize) -> Block {
        let cap = cidr_capacity(&cidr);
        let mut allocations = vec![None; cap];

        let mut note = BTreeMap::new();
        note.insert("note".to_string(), RESERVED_NOTE.to_string());
        let attributes = vec![AllocationAttribute {
            handle: RESERVED_HANDLE.to_string(),
            attrs: note,
        }];

        let start = start_reserved.min(cap);
        let end = end_reserved.min(cap - start);
        for slot in allocations.iter_mut().take(start) {
            *slot = Some(0);
        }
        for slot in allocations.iter_mut().skip(cap - end) {
            *slot = Some(0);
        }

        let unallocated = (0..cap).filter(|i| allocations[*i].is_none()).collect();

        Block {
            name: Block::name_for_cidr(&cidr),
            pool: pool.name.clone(),
            cidr,
            allocations,
            unallocated,
            attributes,
            deleted: false,
        }
    }

    pub fn num_addresses(&self) -> usize {
        self.allocations.len()
    }

    pub fn num_free_addresses(&self) -> usize {
        self.unallocated.len()
    }

    pub fn num_reserved_addresses(&self) -> usize {
        self.allocations.iter().filter(|a| **a == Some(0)).count()
    }

    /// True when nothing but range reservations remain allocated.
    pub fn empty(&self) -> bool {
        self.allocations
            .iter()
            .all(|a| a.is_none() || *a == Some(0))
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        self.cidr.contains(&ip)
    }

    pub fn ip_to_ordinal(&self, ip: Ipv4Addr) -> IpamResult<usize> {
        if !self.contains(ip) {
            return Err(IpamError::Invalid(format!(
                "ip {} not in block {}",
                ip, self.name
            )));
        }
        Ok((u32::from(ip) - u32::from(self.cidr.network())) as usize)
    }

    pub fn ordinal_to_ip(&self, ordinal: usize) -> IpamResult<Ipv4Addr> {
        if ordinal >= self.num_addresses() {
            return Err(IpamError::Invalid(format!(
                "ordinal {} out of range for block {}",
                ordinal, self.name
            )));
        }
        Ok(Ipv4Addr::from(
            u32::from(self.cidr.network()) + ordinal as u32,
        ))
    }

    /// Find an attribute equal to (handle, attrs) or append a new one.
    fn attribute_index(&mut self, handle: &str, attrs: &BTreeMap<String, String>) -> usize {
        let candidate = AllocationAttribute {
            handle: handle.to_string(),
            attrs: attrs.clone(),
        };
        if let Some(idx) = self.attributes.iter().position(|a| *a == candidate) {
            return idx;
        }
        self.attributes.push(candidate);
        self.attributes.len() - 1
    }

    /// Pop the next free ordinal and allocate it to `handle`.
    pub fn auto_assign(
        &mut self,
        handle: &str,
        attrs: &BTreeMap<String, String>,
    ) -> Option<Ipv4Addr> {
        if self.unallocated.is_empty() {
            return None;
        }
        let ordinal = self.unallocated.remove(0);
        let idx = self.attribute_index(handle, attrs);
        self.allocations[ordinal] = Some(idx);
        // Ordinal came from unallocated, so it is in range.
        self.ordinal_to_ip(ordinal).ok()
    }

    /// Allocate a specific ordinal if it is currently free. Returns false
    /// when the ordinal is not in the unallocated list.
    pub fn assign_ordinal(
        &mut self,
        ordinal: usize,
        handle: &str,
        attrs: &BTreeMap<String, String>,
    ) -> bool {
        match self.unallocated.iter().position(|o| *o == ordinal) {
            Some(pos) => {
                self.unallocated.remove(pos);
                let idx = self.attribute_index(handle, attrs);
                self.allocations[ordinal] = Some(idx);
                true
            }
            None => false,
        }
    }

    /// Free every ordinal whose attribute names `handle`. Returns how many
    /// were released.
    pub fn release_by_handle(&mut self, handle: &str) -> usize {
        let mut released = 0;
        for ordinal in 0..self.allocations.len() {
            if let Some(idx) = self.allocations[ordinal] {
                if idx != 0 && self.attributes.get(idx).map(|a| a.handle.as_str()) == Some(handle)
                {
                    self.allocations[ordinal] = None;
                    self.unallocated.push(ordinal);
                    released += 1;
                }
            }
        }
        released
    }

    /// Free one allocated ordinal.
    pub fn release_ordinal(&mut self, ordinal: usize) -> IpamResult<()> {
        match self.allocations.get(ordinal) {
            Some(Some(0)) => Err(IpamError::Invalid(format!(
                "ordinal {} in block {} is range-reserved",
                ordinal, self.name
            ))),
            Some(Some(_)) => {
                self.allocations[ordinal] = None;
                self.unallocated.push(ordinal);
                Ok(())
            }
            Some(None) => Err(IpamError::Invalid(format!(
                "ordinal {} in block {} is not allocated",
                ordinal, self.name
            ))),
            None => Err(IpamError::Invalid(format!(
                "ordinal {} out of range for block {}",
                ordinal, self.name
            ))),
        }
    }

    /// Ordinals currently held by `handle`.
    pub fn handle_ordinals(&self, handle: &str) -> Vec<usize> {
        self.allocations
            .iter()
            .enumerate()
            .filter_map(|(ordinal, slot)| match slot {
                Some(idx)
                    if *idx != 0
                        && self.attributes.get(*idx).map(|a| a.handle.as_str())
                            == Some(handle) =>
                {
                    Some(ordinal)
                }
                _ => None,
            })
            .collect()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

/// Reference counter grouping the allocations that must be freed together.
/// Keyed by a caller-chosen identifier, `namespace-podname` in practice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Handle {
    pub id: String,
    /// block name -> number of addresses held there
    pub blocks: BTreeMap<String, usize>,
    #[serde(default)]
    pub deleted: bool,
}

impl Handle {
    pub fn new(id: &str) -> Handle {
        Handle {
            id: id.to_string(),
            blocks: BTreeMap::new(),
            deleted: false,
        }
    }

    pub fn increment_block(&mut self, block: &str, num: usize) {
        *self.blocks.entry(block.to_string()).or_insert(0) += num;
    }

    pub fn decrement_block(&mut self, block: &str, num: usize) -> IpamResult<()> {
        let count = self.blocks.get_mut(block).ok_or_else(|| {
            IpamError::Invalid(format!("handle {} has no count for block {}", self.id, block))
        })?;
        if *count < num {
            return Err(IpamError::Invalid(format!(
                "handle {} holds {} addresses in block {}, cannot release {}",
                self.id, count, block, num
            )));
        }
        *count -= num;
        if *count == 0 {
            self.blocks.remove(block);
        }
        Ok(())
    }

    pub fn empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    pub fn mark_deleted(&mut self) {
        self.deleted = true;
    }
}

// ── Utilization reporting ─────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolUtilization {
    pub name: String,
    pub capacity: usize,
    pub unallocated: usize,
    pub allocate: usize,
    pub reserved: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BlockUtilization {
    pub name: String,
    pub capacity: usize,
    pub unallocated: usize,
    pub allocate: usize,
    pub reserved: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolBlocksUtilization {
    pub name: String,
    pub capacity: usize,
    pub unallocated: usize,
    pub allocate: usize,
    pub reserved: usize,
    pub blocks: Vec<BlockUtilization>,
    pub broken_blocks: Vec<crate::ipam::broken::BrokenBlock>,
    pub broken_block_names: Vec<String>,
}

// ── Reservation math ──────────────────────────────────────────────────

pub fn cidr_capacity(cidr: &Ipv4Net) -> usize {
    1usize << (32 - cidr.prefix_len())
}

/// Ordinals reserved at the front of `cidr` by a range start. A range start
/// outside the block reserves nothing at the front.
pub fn start_reserved_count(cidr: &Ipv4Net, range_start: Option<Ipv4Addr>) -> usize {
    let start = match range_start {
        Some(ip) => ip,
        None => return 0,
    };
    let total = cidr_capacity(cidr) as i64;
    let ord = i64::from(u32::from(start)) - i64::from(u32::from(cidr.network()));
    if ord < 0 || ord >= total {
        return 0;
    }
    ord as usize
}

/// Ordinals reserved at the tail of `cidr` by a range end. A range end below
/// the block means the whole block lies past the usable range, so every
/// ordinal is reserved; a range end at or past the block's top reserves
/// nothing.
pub fn end_reserved_count(cidr: &Ipv4Net, range_end: Option<Ipv4Addr>) -> usize {
    let end = match range_end {
        Some(ip) => ip,
        None => return 0,
    };
    let total = cidr_capacity(cidr) as i64;
    let ord = i64::from(u32::from(end)) - i64::from(u32::from(cidr.network()));
    if ord < 0 {
        return total as usize;
    }
    if ord >= total {
        return 0;
    }
    (total - ord - 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(cidr: &str, block_size: u8) -> Pool {
        Pool {
            name: "pool1".to_string(),
            cidr: cidr.parse().unwrap(),
            block_size,
            range_start: None,
            range_end: None,
            pool_type: PoolType::Routed,
            gateway: None,
            routes: Vec::new(),
            dns: PoolDns::default(),
            disabled: false,
        }
    }

    fn attrs(k: &str, v: &str) -> BTreeMap<String, String> {
        let mut m = BTreeMap::new();
        m.insert(k.to_string(), v.to_string());
        m
    }

    fn assert_block_invariants(b: &Block) {
        let cap = b.num_addresses();
        for ordinal in 0..cap {
            let free = b.unallocated.contains(&ordinal);
            match b.allocations[ordinal] {
                None => assert!(free, "ordinal {} free but not listed", ordinal),
                Some(idx) => {
                    assert!(idx < b.attributes.len());
                    assert!(!free, "ordinal {} allocated and listed free", ordinal);
                }
            }
        }
        let allocated = b.allocations.iter().filter(|a| a.is_some()).count();
        assert_eq!(allocated + b.unallocated.len(), cap);
    }

    #[test]
    fn block_name_from_cidr() {
        let cidr: Ipv4Net = "10.20.0.0/24".parse().unwrap();
        assert_eq!(Block::name_for_cidr(&cidr), "10-20-0-0-24");
    }

    #[test]
    fn new_block_reserves_window() {
        let p = pool("10.20.0.0/16", 24);
        let cidr: Ipv4Net = "10.20.0.0/24".parse().unwrap();
        let b = Block::new(&p, cidr, 10, 5);

        assert_eq!(b.num_addresses(), 256);
        assert_eq!(b.num_reserved_addresses(), 15);
        assert_eq!(b.num_free_addresses(), 241);
        for i in 0..10 {
            assert_eq!(b.allocations[i], Some(0));
        }
        for i in 251..256 {
            assert_eq!(b.allocations[i], Some(0));
        }
        assert_eq!(b.allocations[10], None);
        assert_block_invariants(&b);
    }

    #[test]
    fn fully_reserved_block() {
        let p = pool("10.20.0.0/16", 24);
        let cidr: Ipv4Net = "10.20.1.0/24".parse().unwrap();
        let b = Block::new(&p, cidr, 0, 256);
        assert_eq!(b.num_free_addresses(), 0);
        assert_eq!(b.num_reserved_addresses(), 256);
        assert_block_invariants(&b);
    }

    #[test]
    fn auto_assign_pops_lowest_free() {
        let p = pool("10.20.0.0/16", 26);
        let cidr: Ipv4Net = "10.20.0.0/26".parse().unwrap();
        let mut b = Block::new(&p, cidr, 2, 0);

        let ip = b.auto_assign("ns1-pod1", &attrs("pod", "pod1")).unwrap();
        assert_eq!(ip, "10.20.0.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b.num_free_addresses(), 61);
        assert_block_invariants(&b);
    }

    #[test]
    fn identical_attrs_share_one_record() {
        let p = pool("10.20.0.0/16", 28);
        let cidr: Ipv4Net = "10.20.0.16/28".parse().unwrap();
        let mut b = Block::new(&p, cidr, 0, 0);

        let a = attrs("pod", "pod1");
        b.auto_assign("ns1-pod1", &a).unwrap();
        b.auto_assign("ns1-pod1", &a).unwrap();
        // sentinel + one shared record
        assert_eq!(b.attributes.len(), 2);
        assert_eq!(b.allocations[0], b.allocations[1]);
    }

    #[test]
    fn release_by_handle_restores_free_list() {
        let p = pool("10.20.0.0/16", 28);
        let cidr: Ipv4Net = "10.20.0.0/28".parse().unwrap();
        let mut b = Block::new(&p, cidr, 1, 1);
        let before = b.clone();

        b.auto_assign("ns1-pod1", &attrs("pod", "pod1")).unwrap();
        b.auto_assign("ns1-pod1", &attrs("pod", "pod1")).unwrap();
        assert_eq!(b.release_by_handle("ns1-pod1"), 2);
        assert!(b.empty());
        assert_eq!(b.num_free_addresses(), before.num_free_addresses());
        assert_block_invariants(&b);
    }

    #[test]
    fn release_ordinal_rejects_reserved_and_free() {
        let p = pool("10.20.0.0/16", 28);
        let cidr: Ipv4Net = "10.20.0.0/28".parse().unwrap();
        let mut b = Block::new(&p, cidr, 2, 0);

        assert!(b.release_ordinal(0).is_err());
        assert!(b.release_ordinal(5).is_err());

        b.auto_assign("h", &BTreeMap::new()).unwrap();
        assert!(b.release_ordinal(2).is_ok());
        assert_block_invariants(&b);
    }

    #[test]
    fn assign_specific_ordinal() {
        let p = pool("10.20.0.0/16", 28);
        let cidr: Ipv4Net = "10.20.0.0/28".parse().unwrap();
        let mut b = Block::new(&p, cidr, 0, 0);

        assert!(b.assign_ordinal(7, "h", &BTreeMap::new()));
        assert!(!b.assign_ordinal(7, "h2", &BTreeMap::new()));
        assert_eq!(b.handle_ordinals("h"), vec![7]);
        assert_block_invariants(&b);
    }

    #[test]
    fn ordinal_ip_round_trip() {
        let p = pool("10.20.0.0/16", 24);
        let cidr: Ipv4Net = "10.20.3.0/24".parse().unwrap();
        let b = Block::new(&p, cidr, 0, 0);

        let ip = b.ordinal_to_ip(7).unwrap();
        assert_eq!(ip, "10.20.3.7".parse::<Ipv4Addr>().unwrap());
        assert_eq!(b.ip_to_ordinal(ip).unwrap(), 7);
        assert!(b.ip_to_ordinal("10.20.4.1".parse().unwrap()).is_err());
    }

    #[test]
    fn handle_refcounts() {
        let mut h = Handle::new("ns1-pod1");
        h.increment_block("b1", 2);
        h.increment_block("b1", 1);
        assert_eq!(h.blocks["b1"], 3);

        h.decrement_block("b1", 3).unwrap();
        assert!(h.empty());
        assert!(h.decrement_block("b1", 1).is_err());
    }

    #[test]
    fn start_reserved_math() {
        let cidr: Ipv4Net = "10.20.0.0/24".parse().unwrap();
        assert_eq!(start_reserved_count(&cidr, None), 0);
        assert_eq!(
            start_reserved_count(&cidr, Some("10.20.0.10".parse().unwrap())),
            10
        );
        // outside the block -> nothing reserved at the front
        assert_eq!(
            start_reserved_count(&cidr, Some("10.19.0.10".parse().unwrap())),
            0
        );
        assert_eq!(
            start_reserved_count(&cidr, Some("10.20.1.10".parse().unwrap())),
            0
        );
    }

    #[test]
    fn end_reserved_math() {
        let cidr: Ipv4Net = "10.20.0.0/24".parse().unwrap();
        assert_eq!(end_reserved_count(&cidr, None), 0);
        assert_eq!(
            end_reserved_count(&cidr, Some("10.20.0.250".parse().unwrap())),
            5
        );
        // range end below the block reserves the whole block
        assert_eq!(
            end_reserved_count(&cidr, Some("10.19.255.250".parse().unwrap())),
            256
        );
        // range end past the block reserves nothing
        assert_eq!(
            end_reserved_count(&cidr, Some("10.20.1.5".parse().unwrap())),
            0
        );
    }

    #[test]
    fn pool_reserved_addresses() {
        let mut p = pool("10.20.0.0/24", 26);
        p.range_start = Some("10.20.0.10".parse().unwrap());
        p.range_end = Some("10.20.0.250".parse().unwrap());
        assert_eq!(p.num_addresses(), 256);
        assert_eq!(p.num_reserved_addresses(), 15);
    }
}
