use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::allocator::{Allocator, AllocatorError};
use crate::hostnic::host_nic_service_server::HostNicService;
use crate::hostnic::{ClearNicsRequest, Empty, IpamMessage, NicInfoList};

/// Backend RPC for the thin CNI plugin, served on a local unix socket.
pub struct HostNicServiceImpl {
    allocator: Arc<Allocator>,
}

impl HostNicServiceImpl {
    pub fn new(allocator: Arc<Allocator>) -> HostNicServiceImpl {
        HostNicServiceImpl { allocator }
    }
}

#[tonic::async_trait]
impl HostNicService for HostNicServiceImpl {
    async fn add_network(
        &self,
        request: Request<IpamMessage>,
    ) -> Result<Response<IpamMessage>, Status> {
        let mut msg = request.into_inner();
        let args = msg
            .args
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing pod info"))?;

        tracing::info!(
            pod = %format!("{}/{}", args.namespace, args.name),
            subnet = %args.vx_net,
            "AddNetwork"
        );
        match self.allocator.alloc_host_nic(&args).await {
            Ok(nic) => {
                msg.nic = Some(nic);
                Ok(Response::new(msg))
            }
            Err(AllocatorError::NoAvailableNic) => Err(Status::resource_exhausted(
                AllocatorError::NoAvailableNic.to_string(),
            )),
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    async fn del_network(
        &self,
        request: Request<IpamMessage>,
    ) -> Result<Response<IpamMessage>, Status> {
        let mut msg = request.into_inner();
        let args = msg
            .args
            .clone()
            .ok_or_else(|| Status::invalid_argument("missing pod info"))?;

        tracing::info!(
            pod = %format!("{}/{}", args.namespace, args.name),
            peek = msg.peek,
            "DelNetwork"
        );
        match self.allocator.free_host_nic(&args, msg.peek).await {
            Ok(Some((nic, pod_ip))) => {
                msg.nic = Some(nic);
                msg.ip = pod_ip;
                Ok(Response::new(msg))
            }
            // nothing recorded for this pod: deletion is idempotent
            Ok(None) => Ok(Response::new(msg)),
            Err(err) => Err(Status::internal(err.to_string())),
        }
    }

    async fn show_nics(&self, _request: Request<Empty>) -> Result<Response<NicInfoList>, Status> {
        Ok(Response::new(NicInfoList {
            items: self.allocator.show_nics().await,
        }))
    }

    async fn clear_nics(
        &self,
        request: Request<ClearNicsRequest>,
    ) -> Result<Response<Empty>, Status> {
        let force = request.into_inner().force;
        tracing::info!(force, "ClearNics");
        self.allocator
            .clear_free_host_nic(force)
            .await
            .map_err(|err| Status::internal(err.to_string()))?;
        Ok(Response::new(Empty {}))
    }
}
