use std::net::Ipv4Addr;
use std::time::Duration;

use futures::TryStreamExt;
use netlink_packet_route::link::nlas::Nla as LinkNla;
use netlink_packet_route::route::nlas::Nla as RouteNla;

use crate::network::error::{NetworkError, NetworkResult};

/// Attempts to find a link after the cloud reports a NIC attached. Attach is
/// asynchronous on the cloud side, so the link can trail the API response.
pub const LINK_BY_MAC_ATTEMPTS: usize = 5;
pub const LINK_BY_MAC_INTERVAL: Duration = Duration::from_secs(5);

/// Route installs into a freshly created table can race interface bring-up.
pub const ROUTE_ADD_ATTEMPTS: usize = 5;
pub const ROUTE_ADD_INTERVAL: Duration = Duration::from_secs(5);

const MAIN_TABLE: u8 = 254;
const SCOPE_LINK: u8 = 253;

/// Persistent netlink handle for all link/address/route operations. One per
/// process, shared by the configurator and the allocator sweeps.
pub struct NetlinkHandle {
    handle: rtnetlink::Handle,
    // Keep the connection task alive
    _conn_task: tokio::task::JoinHandle<()>,
}

impl NetlinkHandle {
    pub fn new() -> NetworkResult<Self> {
        let (conn, handle, _) = rtnetlink::new_connection()?;
        let conn_task = tokio::spawn(conn);
        Ok(Self {
            handle,
            _conn_task: conn_task,
        })
    }

    // ── Link lookup ───────────────────────────────────────────────────

    /// Find a link by its MAC address. Returns (ifindex, name).
    pub async fn link_by_mac(&self, mac: &str) -> NetworkResult<(u32, String)> {
        let wanted = mac.to_ascii_lowercase();
        let mut links = self.handle.link().get().execute();

        while let Some(msg) = links.try_next().await.map_err(NetworkError::Netlink)? {
            let mut name = None;
            let mut addr = None;
            for nla in &msg.nlas {
                match nla {
                    LinkNla::IfName(n) => name = Some(n.clone()),
                    LinkNla::Address(bytes) => addr = Some(format_mac(bytes)),
                    _ => {}
                }
            }
            if addr.as_deref() == Some(wanted.as_str()) {
                if let Some(name) = name {
                    return Ok((msg.header.index, name));
                }
            }
        }
        Err(NetworkError::NotFound(format!("link with mac {}", mac)))
    }

    /// Wait for a link to appear after attach, polling up to
    /// [`LINK_BY_MAC_ATTEMPTS`] times.
    pub async fn wait_link_by_mac(&self, mac: &str) -> NetworkResult<(u32, String)> {
        let mut last = NetworkError::NotFound(format!("link with mac {}", mac));
        for attempt in 1..=LINK_BY_MAC_ATTEMPTS {
            match self.link_by_mac(mac).await {
                Ok(found) => return Ok(found),
                Err(err) => {
                    tracing::debug!(
                        mac,
                        attempt,
                        total = LINK_BY_MAC_ATTEMPTS,
                        %err,
                        "link not visible yet"
                    );
                    last = err;
                }
            }
            if attempt < LINK_BY_MAC_ATTEMPTS {
                tokio::time::sleep(LINK_BY_MAC_INTERVAL).await;
            }
        }
        Err(last)
    }

    pub async fn link_exists_by_mac(&self, mac: &str) -> bool {
        self.link_by_mac(mac).await.is_ok()
    }

    pub async fn get_link_index(&self, name: &str) -> NetworkResult<u32> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(msg)) => Ok(msg.header.index),
            Ok(None) => Err(NetworkError::NotFound(format!("link {}", name))),
            Err(e) => {
                if e.to_string().contains("No such device") {
                    Err(NetworkError::NotFound(format!("link {}", name)))
                } else {
                    Err(NetworkError::Netlink(e))
                }
            }
        }
    }

    // ── Link configuration ────────────────────────────────────────────

    pub async fn set_mtu(&self, index: u32, mtu: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .mtu(mtu)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_up(&self, index: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    pub async fn set_link_master(&self, index: u32, master: u32) -> NetworkResult<()> {
        self.handle
            .link()
            .set(index)
            .master(master)
            .execute()
            .await
            .map_err(NetworkError::Netlink)
    }

    /// Create a bridge, idempotently. Returns its ifindex.
    pub async fn create_bridge(&self, name: &str) -> NetworkResult<u32> {
        if let Ok(idx) = self.get_link_index(name).await {
            return Ok(idx);
        }

        let result = self
            .handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await;
        match result {
            Ok(()) => {}
            Err(e) if e.to_string().contains("File exists") => {}
            Err(e) => return Err(NetworkError::Netlink(e)),
        }
        self.get_link_index(name).await
    }

    /// Delete a link by name. Already-absent links are success.
    pub async fn delete_link(&self, name: &str) -> NetworkResult<()> {
        let index = match self.get_link_index(name).await {
            Ok(idx) => idx,
            Err(NetworkError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        match self.handle.link().del(index).execute().await {
            Ok(()) => Ok(()),
            Err(e) if e.to_string().contains("No such device") => Ok(()),
            Err(e) => Err(NetworkError::Netlink(e)),
        }
    }

    /// Remove every IPv4 address from a link. Older kernels leave stale
    /// addresses on re-attached NICs, so per-NIC setup starts clean.
    pub async fn flush_v4_addresses(&self, index: u32) -> NetworkResult<()> {
        let mut addrs = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();

        let mut messages = Vec::new();
        while let Some(msg) = addrs.try_next().await.map_err(NetworkError::Netlink)? {
            messages.push(msg);
        }
        for msg in messages {
            match self.handle.address().del(msg).execute().await {
                Ok(()) => {}
                Err(e) if e.to_string().contains("Cannot assign") => {}
                Err(e) => return Err(NetworkError::Netlink(e)),
            }
        }
        Ok(())
    }

    // ── Routes ────────────────────────────────────────────────────────

    /// Install the per-NIC table's link-scope route to the gateway.
    pub async fn add_gateway_link_route(
        &self,
        table: u8,
        ifindex: u32,
        gateway: Ipv4Addr,
    ) -> NetworkResult<()> {
        self.retry_route_add(|replace| {
            let mut request = self
                .handle
                .route()
                .add()
                .v4()
                .destination_prefix(gateway, 32)
                .output_interface(ifindex)
                .scope(SCOPE_LINK)
                .table(table);
            if replace {
                request = request.replace();
            }
            request.execute()
        })
        .await
    }

    /// Install the per-NIC table's default route via the gateway.
    pub async fn add_default_route(
        &self,
        table: u8,
        ifindex: u32,
        gateway: Ipv4Addr,
    ) -> NetworkResult<()> {
        self.retry_route_add(|replace| {
            let mut request = self
                .handle
                .route()
                .add()
                .v4()
                .gateway(gateway)
                .output_interface(ifindex)
                .table(table);
            if replace {
                request = request.replace();
            }
            request.execute()
        })
        .await
    }

    /// Route adds into a fresh table can fail with ENETUNREACH until the
    /// link settles; retry a few times. An already-present route from a
    /// concurrent setup is replaced.
    async fn retry_route_add<F, Fut>(&self, attempt_fn: F) -> NetworkResult<()>
    where
        F: Fn(bool) -> Fut,
        Fut: std::future::Future<Output = Result<(), rtnetlink::Error>>,
    {
        let mut attempts = 0;
        loop {
            match attempt_fn(false).await {
                Ok(()) => return Ok(()),
                Err(e) if e.to_string().contains("Network is unreachable") => {
                    attempts += 1;
                    if attempts >= ROUTE_ADD_ATTEMPTS {
                        return Err(NetworkError::Netlink(e));
                    }
                    tracing::debug!(
                        attempt = attempts,
                        total = ROUTE_ADD_ATTEMPTS,
                        "route add: network unreachable, retrying"
                    );
                    tokio::time::sleep(ROUTE_ADD_INTERVAL).await;
                }
                Err(e) if e.to_string().contains("File exists") => {
                    return match attempt_fn(true).await {
                        Ok(()) => Ok(()),
                        Err(e) => Err(NetworkError::Netlink(e)),
                    };
                }
                Err(e) => return Err(NetworkError::Netlink(e)),
            }
        }
    }

    /// Delete routes in `table` matching `dst` (None matches the default
    /// route). Absent routes are success.
    pub async fn delete_table_routes(
        &self,
        table: u8,
        dst: Option<(Ipv4Addr, u8)>,
    ) -> NetworkResult<()> {
        let mut routes = self
            .handle
            .route()
            .get(rtnetlink::IpVersion::V4)
            .execute();

        let mut to_delete = Vec::new();
        while let Some(route) = routes.try_next().await.map_err(NetworkError::Netlink)? {
            if route.header.table != table {
                continue;
            }
            let matches = match dst {
                None => route.header.destination_prefix_length == 0,
                Some((addr, prefix)) => {
                    route.header.destination_prefix_length == prefix
                        && route_destination(&route) == Some(addr)
                }
            };
            if matches {
                to_delete.push(route);
            }
        }

        for route in to_delete {
            match self.handle.route().del(route).execute().await {
                Ok(()) => {}
                Err(e) if e.to_string().contains("No such process") => {}
                Err(e) => return Err(NetworkError::Netlink(e)),
            }
        }
        Ok(())
    }

    /// Remove the main-table link-scope route for the NIC's subnet sourced
    /// at the NIC's address. Left in place it would let return traffic
    /// bypass the policy rules.
    pub async fn delete_main_subnet_route(
        &self,
        subnet: Ipv4Addr,
        prefix: u8,
        src: Ipv4Addr,
    ) -> NetworkResult<()> {
        let mut routes = self
            .handle
            .route()
            .get(rtnetlink::IpVersion::V4)
            .execute();

        let mut to_delete = Vec::new();
        while let Some(route) = routes.try_next().await.map_err(NetworkError::Netlink)? {
            if route.header.table != MAIN_TABLE
                || route.header.destination_prefix_length != prefix
            {
                continue;
            }
            if route_destination(&route) == Some(subnet) && route_pref_source(&route) == Some(src)
            {
                to_delete.push(route);
            }
        }

        for route in to_delete {
            match self.handle.route().del(route).execute().await {
                Ok(()) => {}
                Err(e) if e.to_string().contains("No such process") => {}
                Err(e) => return Err(NetworkError::Netlink(e)),
            }
        }
        Ok(())
    }
}

fn route_destination(route: &netlink_packet_route::RouteMessage) -> Option<Ipv4Addr> {
    for nla in &route.nlas {
        if let RouteNla::Destination(bytes) = nla {
            if bytes.len() == 4 {
                return Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
            }
        }
    }
    None
}

fn route_pref_source(route: &netlink_packet_route::RouteMessage) -> Option<Ipv4Addr> {
    for nla in &route.nlas {
        if let RouteNla::PrefSource(bytes) = nla {
            if bytes.len() == 4 {
                return Some(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]));
            }
        }
    }
    None
}

pub fn format_mac(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
