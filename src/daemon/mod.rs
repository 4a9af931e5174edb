//! Agent assembly: cloud client, host network setup, allocator restore,
//! background sweeps and the unix-socket RPC server.

pub mod server;

use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;

use crate::allocator::{Allocator, AllocatorConf};
use crate::cloud::http::QingCloudClient;
use crate::cloud::{CloudApi, INSTANCE_ID_FILE};
use crate::config::AgentConfig;
use crate::hostnic::host_nic_service_server::HostNicServiceServer;
use crate::network::host::HostNetworkConf;
use crate::network::iptables::Iptables;
use crate::network::LinuxNetwork;
use crate::store::SqliteNicStore;

pub async fn run(config: AgentConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.validate()?;

    let vpc_cidr: Ipv4Net = config.vpc_cidr.parse()?;
    let mut vpc_cidrs = vec![vpc_cidr];
    for extra in &config.vpc_extra_cidrs {
        vpc_cidrs.push(extra.parse()?);
    }

    let cloud = Arc::new(QingCloudClient::new(
        &config.api_endpoint,
        &config.access_key_id,
        &config.secret_access_key,
        &config.zone,
        Path::new(INSTANCE_ID_FILE),
        config.tag.clone(),
    )?);
    tracing::info!(instance = %cloud.instance_id(), "cloud client ready");

    let network = Arc::new(LinuxNetwork::new(HostNetworkConf::from_env())?);

    // Host-wide plumbing needs the primary NIC's identity.
    let attached = cloud.get_attached_nics().await?;
    let primary = attached
        .iter()
        .find(|nic| nic.is_primary)
        .ok_or("no primary NIC attached to this instance")?;
    let primary_addr: Ipv4Addr = primary.primary_address.parse()?;

    let iptables = Iptables::new().await;
    network
        .setup_host(
            &iptables,
            vpc_cidr,
            &vpc_cidrs,
            &primary.hardware_addr,
            primary_addr,
        )
        .await?;

    if let Some(parent) = Path::new(&config.db_path).parent() {
        std::fs::create_dir_all(parent)?;
    }
    let store = Arc::new(SqliteNicStore::open(&config.db_path).await?);

    let allocator = Arc::new(Allocator::new(
        AllocatorConf {
            max_nic: config.max_nic,
            route_table_base: config.route_table_base,
            sync_interval: Duration::from_secs(config.sync_interval),
            free_interval: Duration::from_secs(config.free_interval * 60),
            lease_interval: Duration::from_secs(config.lease_interval * 60),
        },
        store,
        cloud.clone(),
        network.clone(),
    ));
    allocator.restore().await?;

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let background = tokio::spawn(allocator.clone().run(stop_rx));

    let socket = Path::new(&config.socket_path);
    if let Some(parent) = socket.parent() {
        std::fs::create_dir_all(parent)?;
    }
    // a previous run's socket file would fail the bind
    let _ = std::fs::remove_file(socket);
    let listener = UnixListener::bind(socket)?;
    let incoming = UnixListenerStream::new(listener);
    tracing::info!(socket = %config.socket_path, "serving backend rpc");

    let service = HostNicServiceServer::new(server::HostNicServiceImpl::new(allocator.clone()));
    tonic::transport::Server::builder()
        .add_service(service)
        .serve_with_incoming_shutdown(incoming, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    // Stop the periodic timers; in-flight requests have already drained.
    let _ = stop_tx.send(true);
    let _ = background.await;
    tracing::info!("agent stopped");
    Ok(())
}
