//! Kernel-level plumbing for host NICs: policy routing, SNAT, per-NIC route
//! tables and the VLAN bridge/DHCP machinery.

pub mod error;
pub mod host;
pub mod iptables;
pub mod netlink;
pub mod nic;
pub mod rules;
pub mod vlan;

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::hostnic::{HostNic, Phase};
use crate::network::error::{NetworkError, NetworkResult};
use crate::network::host::HostNetworkConf;
use crate::network::netlink::NetlinkHandle;
use crate::network::rules::RuleManager;

pub use error::NetworkError as Error;

/// Subnet tunnel type for which the agent owns a bridge and a DHCP lease.
pub const TUNNEL_TYPE_VLAN: &str = "vlan";

/// A per-NIC setup that stopped early: the last phase that completed, and
/// what failed after it.
#[derive(Debug, thiserror::Error)]
#[error("setup stopped after {phase:?}: {error}")]
pub struct SetupFailure {
    pub phase: Phase,
    pub error: NetworkError,
}

/// The NIC-level operations the allocator drives. Implemented against the
/// real kernel by [`LinuxNetwork`]; tests substitute a scripted double.
#[async_trait::async_trait]
pub trait NetworkOps: Send + Sync {
    /// Drive the NIC towards Succeeded. Returns the phase reached; on error,
    /// the last phase that completed plus the failure.
    async fn setup_network(&self, nic: &HostNic) -> Result<Phase, SetupFailure>;

    /// Re-run setup for a NIC the sync sweep found unhealthy. Every step is
    /// idempotent, so repair is the same walk.
    async fn check_and_repair(&self, nic: &HostNic) -> Result<Phase, SetupFailure> {
        self.setup_network(nic).await
    }

    /// Remove the kernel state owned by this NIC before detach.
    async fn cleanup_network(&self, nic: &HostNic) -> NetworkResult<()>;

    /// Install the source rule steering one pod's traffic into the NIC's
    /// routing table.
    async fn add_pod_rule(&self, pod_ip: Ipv4Addr, table: u32) -> NetworkResult<()>;

    /// Remove every policy rule with the pod's address as source.
    async fn delete_pod_rules(&self, pod_ip: Ipv4Addr) -> NetworkResult<()>;

    /// Whether a link with this MAC is currently visible.
    async fn link_exists(&self, mac: &str) -> bool;

    /// Renew the DHCP lease of a VLAN NIC's bridge.
    async fn renew_lease(&self, nic: &HostNic) -> NetworkResult<()>;
}

/// The real configurator.
pub struct LinuxNetwork {
    nl: NetlinkHandle,
    rules: RuleManager,
    conf: HostNetworkConf,
}

impl LinuxNetwork {
    pub fn new(conf: HostNetworkConf) -> NetworkResult<LinuxNetwork> {
        Ok(LinuxNetwork {
            nl: NetlinkHandle::new()?,
            rules: RuleManager,
            conf,
        })
    }

    pub fn netlink(&self) -> &NetlinkHandle {
        &self.nl
    }

    pub fn rule_manager(&self) -> &RuleManager {
        &self.rules
    }

    pub fn conf(&self) -> &HostNetworkConf {
        &self.conf
    }

    /// Host-wide setup, run once at agent start.
    pub async fn setup_host(
        &self,
        ipt: &iptables::Iptables,
        vpc_cidr: Ipv4Net,
        vpc_cidrs: &[Ipv4Net],
        primary_mac: &str,
        primary_addr: Ipv4Addr,
    ) -> NetworkResult<()> {
        host::setup_host_network(
            &self.conf,
            &self.nl,
            &self.rules,
            ipt,
            vpc_cidr,
            vpc_cidrs,
            primary_mac,
            primary_addr,
        )
        .await
    }

    fn nic_subnet(nic: &HostNic) -> Result<Ipv4Net, NetworkError> {
        let vxnet = nic
            .vx_net
            .as_ref()
            .ok_or_else(|| NetworkError::Invalid(format!("nic {} has no subnet", nic.id)))?;
        vxnet
            .network
            .parse::<Ipv4Net>()
            .map_err(|e| NetworkError::Invalid(format!("subnet {}: {}", vxnet.network, e)))
    }

    fn is_vlan(nic: &HostNic) -> bool {
        nic.vx_net
            .as_ref()
            .map(|v| v.tunnel_type == TUNNEL_TYPE_VLAN)
            .unwrap_or(false)
    }
}

#[async_trait::async_trait]
impl NetworkOps for LinuxNetwork {
    async fn setup_network(&self, nic: &HostNic) -> Result<Phase, SetupFailure> {
        let mut phase = Phase::Init;

        let subnet = Self::nic_subnet(nic).map_err(|error| SetupFailure { phase, error })?;

        // The cloud has created and attached the NIC; it has completed
        // CreateAndAttach once the kernel shows the link.
        let (ifindex, _) = self
            .nl
            .wait_link_by_mac(&nic.hardware_addr)
            .await
            .map_err(|error| SetupFailure { phase, error })?;
        phase = Phase::CreateAndAttach;

        if Self::is_vlan(nic) {
            let table = nic.route_table_num as u32;
            vlan::ensure_bridge(&self.nl, ifindex, table)
                .await
                .map_err(|error| SetupFailure { phase, error })?;
            vlan::run_dhcp(table)
                .await
                .map_err(|error| SetupFailure { phase, error })?;
        }
        phase = Phase::JoinBridge;

        let nic_ip = nic.primary_address.parse::<Ipv4Addr>().ok();
        nic::setup_nic_network(
            &self.nl,
            nic_ip,
            &nic.hardware_addr,
            nic.route_table_num as u32,
            subnet,
        )
        .await
        .map_err(|error| SetupFailure { phase, error })?;

        tracing::info!(nic = %nic.id, "NIC network ready");
        Ok(Phase::Succeeded)
    }

    async fn cleanup_network(&self, nic: &HostNic) -> NetworkResult<()> {
        let table = nic.route_table_num as u32;
        let subnet = Self::nic_subnet(nic)?;

        // Drop any pod rules still pointing at this table.
        let rules = self.rules.list_rules().await?;
        for rule in rules.iter().filter(|r| r.table == table.to_string()) {
            self.rules.del_rule(rule).await?;
        }

        nic::cleanup_nic_network(&self.nl, table, subnet).await?;

        if Self::is_vlan(nic) {
            vlan::remove_bridge(&self.nl, table).await?;
        }
        tracing::info!(nic = %nic.id, "NIC network cleaned up");
        Ok(())
    }

    async fn add_pod_rule(&self, pod_ip: Ipv4Addr, table: u32) -> NetworkResult<()> {
        self.rules
            .add_rule(&rules::Rule::pod_rule(pod_ip, table))
            .await
    }

    async fn delete_pod_rules(&self, pod_ip: Ipv4Addr) -> NetworkResult<()> {
        self.rules.delete_rules_by_src(pod_ip).await
    }

    async fn link_exists(&self, mac: &str) -> bool {
        self.nl.link_exists_by_mac(mac).await
    }

    async fn renew_lease(&self, nic: &HostNic) -> NetworkResult<()> {
        if !Self::is_vlan(nic) {
            return Ok(());
        }
        vlan::renew_lease(nic.route_table_num as u32).await
    }
}
