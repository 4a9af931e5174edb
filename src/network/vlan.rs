use tokio::process::Command;

use crate::network::error::{NetworkError, NetworkResult};
use crate::network::netlink::NetlinkHandle;

/// Bridges owned by the agent for VLAN NICs are named after the NIC's
/// routing table number.
pub fn bridge_name(table: u32) -> String {
    format!("host-nic-br-{}", table)
}

/// Create the VLAN bridge (if missing), enslave the NIC and bring both up.
/// Returns the bridge ifindex.
pub async fn ensure_bridge(
    nl: &NetlinkHandle,
    nic_ifindex: u32,
    table: u32,
) -> NetworkResult<u32> {
    let name = bridge_name(table);
    let bridge = nl.create_bridge(&name).await?;
    nl.set_link_master(nic_ifindex, bridge).await?;
    nl.set_link_up(nic_ifindex).await?;
    nl.set_link_up(bridge).await?;
    tracing::info!(bridge = %name, "VLAN bridge ready");
    Ok(bridge)
}

pub async fn remove_bridge(nl: &NetlinkHandle, table: u32) -> NetworkResult<()> {
    nl.delete_link(&bridge_name(table)).await
}

/// Obtain (or renew) the bridge's address via DHCP. dhclient renews an
/// existing lease when re-invoked, so lease renewal is the same call.
pub async fn run_dhcp(table: u32) -> NetworkResult<()> {
    let name = bridge_name(table);
    let output = Command::new("dhclient").args(["-1", &name]).output().await?;
    if output.status.success() {
        return Ok(());
    }
    Err(NetworkError::Command {
        cmd: format!("dhclient -1 {}", name),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

pub async fn renew_lease(table: u32) -> NetworkResult<()> {
    run_dhcp(table).await
}
