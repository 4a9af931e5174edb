use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::network::error::{NetworkError, NetworkResult};
use crate::network::netlink::NetlinkHandle;

/// Fixed MTU of cloud NICs, matching the veth MTU used by the plugin.
pub const NIC_MTU: u32 = 9001;

/// The subnet's gateway is its first usable address.
pub fn subnet_gateway(subnet: Ipv4Net) -> NetworkResult<Ipv4Addr> {
    let base = u32::from(subnet.network());
    let gw = base
        .checked_add(1)
        .ok_or_else(|| NetworkError::Invalid(format!("subnet {} overflows", subnet)))?;
    Ok(Ipv4Addr::from(gw))
}

/// Per-NIC setup: bring the link up at the fixed MTU, clear stale addresses
/// and install the NIC's routing table (link-scope /32 to the gateway plus a
/// default via it). Runs each time a NIC moves towards Succeeded and is
/// idempotent throughout.
pub async fn setup_nic_network(
    nl: &NetlinkHandle,
    nic_ip: Option<Ipv4Addr>,
    mac: &str,
    table: u32,
    subnet: Ipv4Net,
) -> NetworkResult<()> {
    let table = u8::try_from(table)
        .map_err(|_| NetworkError::Invalid(format!("route table {} out of range", table)))?;

    tracing::info!(mac, table, subnet = %subnet, "setting up NIC network");

    let (ifindex, name) = nl.wait_link_by_mac(mac).await?;
    tracing::debug!(mac, link = %name, ifindex, "link is visible");

    nl.set_mtu(ifindex, NIC_MTU).await?;
    nl.set_link_up(ifindex).await?;

    let gateway = subnet_gateway(subnet)?;

    // Stale addresses survive re-attachment on older kernels.
    nl.flush_v4_addresses(ifindex).await?;

    nl.delete_table_routes(table, Some((gateway, 32))).await?;
    nl.add_gateway_link_route(table, ifindex, gateway).await?;
    nl.delete_table_routes(table, None).await?;
    nl.add_default_route(table, ifindex, gateway).await?;

    // The kernel auto-installs a subnet route in the main table sourced at
    // the NIC's address; it would short-circuit the policy rules.
    if let Some(ip) = nic_ip {
        nl.delete_main_subnet_route(subnet.network(), subnet.prefix_len(), ip)
            .await?;
    }

    Ok(())
}

/// Tear down what `setup_nic_network` installed.
pub async fn cleanup_nic_network(
    nl: &NetlinkHandle,
    table: u32,
    subnet: Ipv4Net,
) -> NetworkResult<()> {
    let table = u8::try_from(table)
        .map_err(|_| NetworkError::Invalid(format!("route table {} out of range", table)))?;

    let gateway = subnet_gateway(subnet)?;
    nl.delete_table_routes(table, None).await?;
    nl.delete_table_routes(table, Some((gateway, 32))).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_is_first_usable_address() {
        let subnet: Ipv4Net = "172.16.3.0/24".parse().unwrap();
        assert_eq!(
            subnet_gateway(subnet).unwrap(),
            "172.16.3.1".parse::<Ipv4Addr>().unwrap()
        );
    }

    #[test]
    fn gateway_overflow_is_an_error() {
        let subnet: Ipv4Net = "255.255.255.255/32".parse().unwrap();
        assert!(subnet_gateway(subnet).is_err());
    }
}
