use std::collections::HashMap;
use std::path::Path;

use serde_json::{json, Value};

use crate::cloud::{
    ip_end_after_reserved, CloudApi, CloudError, CloudResult, PendingJobs, Vip, JOB_POLL_INTERVAL,
    JOB_TIMEOUT, NIC_PREFIX, RESERVED_VIP_COUNT,
};
use crate::hostnic::{HostNic, Phase, VxNet};

const NIC_NUM_LIMIT: usize = 60;
const VIP_NUM_LIMIT: usize = 255;

/// JSON-action client for the cloud API. Requests are POSTed to the
/// endpoint as `{action, zone, access_key_id, ...}`; responses carry a
/// `ret_code` plus the action's result set.
pub struct QingCloudClient {
    http: reqwest::Client,
    endpoint: String,
    access_key_id: String,
    secret_access_key: String,
    zone: String,
    instance_id: String,
    tag: Option<String>,
}

impl QingCloudClient {
    pub fn new(
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        zone: &str,
        instance_id_path: &Path,
        tag: Option<String>,
    ) -> CloudResult<QingCloudClient> {
        let instance_id = std::fs::read_to_string(instance_id_path)?
            .trim()
            .to_string();
        if instance_id.is_empty() {
            return Err(CloudError::Invalid(format!(
                "empty instance id in {}",
                instance_id_path.display()
            )));
        }

        Ok(QingCloudClient {
            http: reqwest::Client::new(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            access_key_id: access_key_id.to_string(),
            secret_access_key: secret_access_key.to_string(),
            zone: zone.to_string(),
            instance_id,
            tag,
        })
    }

    fn nic_name(&self) -> String {
        format!("{}{}", NIC_PREFIX, self.instance_id)
    }

    async fn request(&self, action: &str, mut params: Value) -> CloudResult<Value> {
        let body = params.as_object_mut().ok_or_else(|| {
            CloudError::Invalid(format!("params for {} must be an object", action))
        })?;
        body.insert("action".to_string(), json!(action));
        body.insert("zone".to_string(), json!(self.zone));
        body.insert("access_key_id".to_string(), json!(self.access_key_id));

        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.access_key_id, Some(&self.secret_access_key))
            .json(&params)
            .send()
            .await?
            .error_for_status()?;
        let value: Value = response.json().await?;

        let ret_code = value["ret_code"].as_i64().unwrap_or(-1);
        if ret_code != 0 {
            let message = value["message"].as_str().unwrap_or("").to_string();
            tracing::error!(action, ret_code, %message, "cloud api error");
            if message.to_ascii_lowercase().contains("not found") {
                return Err(CloudError::ResourceNotFound(message));
            }
            return Err(CloudError::Api {
                code: ret_code,
                message,
            });
        }
        Ok(value)
    }

    /// Poll a job until it leaves the working/pending states.
    async fn wait_job(&self, job_id: &str) -> CloudResult<()> {
        let deadline = tokio::time::Instant::now() + JOB_TIMEOUT;
        loop {
            let value = self
                .request("DescribeJobs", json!({ "jobs": [job_id], "limit": 1 }))
                .await?;
            let status = value["job_set"][0]["status"].as_str().unwrap_or("");
            match status {
                "successful" => return Ok(()),
                "failed" | "done with failure" => {
                    return Err(CloudError::Api {
                        code: -1,
                        message: format!("job {} failed", job_id),
                    })
                }
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CloudError::JobTimeout(job_id.to_string()));
            }
            tokio::time::sleep(JOB_POLL_INTERVAL).await;
        }
    }

    fn nic_from_value(nic: &Value, vxnet: Option<VxNet>) -> HostNic {
        let vxnet = vxnet.unwrap_or_else(|| VxNet {
            id: nic["vxnet_id"].as_str().unwrap_or("").to_string(),
            ..Default::default()
        });
        let nic_id = nic["nic_id"].as_str().unwrap_or("").to_string();
        HostNic {
            id: nic_id.clone(),
            vx_net: Some(vxnet),
            // NIC ids are their MAC addresses
            hardware_addr: nic_id,
            primary_address: nic["private_ip"].as_str().unwrap_or("").to_string(),
            route_table_num: 0,
            is_primary: nic["role"].as_i64() == Some(1),
            using: nic["status"].as_str() == Some("in-use"),
            reserved: false,
            phase: Phase::Init as i32,
        }
    }

    async fn attach_tag(&self, nic_ids: &[String]) {
        let tag = match &self.tag {
            Some(tag) => tag.clone(),
            None => return,
        };
        for nic in nic_ids {
            let params = json!({
                "resource_tag_pairs": [{
                    "resource_id": nic,
                    "resource_type": "nic",
                    "tag_id": tag,
                }],
            });
            if let Err(err) = self.request("AttachTags", params).await {
                tracing::warn!(nic = %nic, %err, "failed to tag nic");
            }
        }
    }

    async fn attach_nics(&self, nic_ids: &[String]) -> CloudResult<String> {
        let value = self
            .request(
                "AttachNics",
                json!({ "nics": nic_ids, "instance": self.instance_id }),
            )
            .await?;
        value["job_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CloudError::Invalid("AttachNics returned no job id".to_string()))
    }
}

#[async_trait::async_trait]
impl CloudApi for QingCloudClient {
    fn instance_id(&self) -> &str {
        &self.instance_id
    }

    async fn get_created_nics(&self, limit: usize, offset: usize) -> CloudResult<Vec<HostNic>> {
        let value = self
            .request(
                "DescribeNics",
                json!({ "nic_name": self.nic_name(), "limit": limit, "offset": offset }),
            )
            .await?;

        let mut nics = Vec::new();
        let mut vxnet_ids = Vec::new();
        for nic in value["nic_set"].as_array().into_iter().flatten() {
            // secondary NICs only
            if nic["role"].as_i64() != Some(0) {
                continue;
            }
            let hostnic = Self::nic_from_value(nic, None);
            if let Some(vxnet) = &hostnic.vx_net {
                if !vxnet_ids.contains(&vxnet.id) {
                    vxnet_ids.push(vxnet.id.clone());
                }
            }
            nics.push(hostnic);
        }

        if !vxnet_ids.is_empty() {
            let vxnets = self.get_vxnets(&vxnet_ids).await?;
            for nic in &mut nics {
                if let Some(vxnet) = &nic.vx_net {
                    if let Some(full) = vxnets.get(&vxnet.id) {
                        nic.vx_net = Some(full.clone());
                    }
                }
            }
        }

        Ok(nics)
    }

    async fn get_attached_nics(&self) -> CloudResult<Vec<HostNic>> {
        let value = self
            .request(
                "DescribeNics",
                json!({
                    "instances": [self.instance_id],
                    "status": "in-use",
                    "limit": NIC_NUM_LIMIT + 1,
                }),
            )
            .await?;

        Ok(value["nic_set"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|nic| Self::nic_from_value(nic, None))
            .collect())
    }

    async fn create_nics_and_attach(
        &self,
        vxnet: &VxNet,
        count: usize,
        ips: Option<Vec<String>>,
        disable_ip: bool,
    ) -> CloudResult<Vec<HostNic>> {
        let mut params = json!({
            "vxnet": vxnet.id,
            "nic_name": self.nic_name(),
            "count": count,
            "disable_ip": if disable_ip { 1 } else { 0 },
        });
        if let Some(ips) = &ips {
            params["count"] = json!(ips.len());
            params["private_ips"] = json!(ips);
        }

        let value = self.request("CreateNics", params).await?;

        let mut nics = Vec::new();
        let mut nic_ids = Vec::new();
        for nic in value["nics"].as_array().into_iter().flatten() {
            let nic_id = nic["nic_id"].as_str().unwrap_or("").to_string();
            nics.push(HostNic {
                id: nic_id.clone(),
                vx_net: Some(vxnet.clone()),
                hardware_addr: nic_id.clone(),
                primary_address: if disable_ip {
                    String::new()
                } else {
                    nic["private_ip"].as_str().unwrap_or("").to_string()
                },
                route_table_num: 0,
                is_primary: false,
                using: false,
                reserved: false,
                phase: Phase::Init as i32,
            });
            nic_ids.push(nic_id);
        }

        self.attach_tag(&nic_ids).await;

        if let Err(err) = self.attach_nics(&nic_ids).await {
            tracing::error!(%err, "attach failed, deleting created nics");
            let _ = self.delete_nics(&nic_ids).await;
            return Err(err);
        }

        Ok(nics)
    }

    async fn detach_nics(&self, nic_ids: &[String], wait: bool) -> CloudResult<String> {
        if nic_ids.is_empty() {
            return Ok(String::new());
        }
        let value = self
            .request("DetachNics", json!({ "nics": nic_ids }))
            .await?;
        let job_id = value["job_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CloudError::Invalid("DetachNics returned no job id".to_string()))?;

        if wait {
            self.wait_job(&job_id).await?;
            return Ok(String::new());
        }
        Ok(job_id)
    }

    async fn delete_nics(&self, nic_ids: &[String]) -> CloudResult<()> {
        if nic_ids.is_empty() {
            return Ok(());
        }
        self.request("DeleteNics", json!({ "nics": nic_ids }))
            .await?;
        Ok(())
    }

    async fn get_vxnets(&self, ids: &[String]) -> CloudResult<HashMap<String, VxNet>> {
        if ids.is_empty() {
            return Err(CloudError::Invalid(
                "get_vxnets called with no ids".to_string(),
            ));
        }
        let value = self
            .request(
                "DescribeVxNets",
                json!({ "vxnets": ids, "limit": NIC_NUM_LIMIT }),
            )
            .await?;

        let mut result = HashMap::new();
        for vxnet in value["vxnet_set"].as_array().into_iter().flatten() {
            let id = vxnet["vxnet_id"].as_str().unwrap_or("").to_string();
            let router = &vxnet["router"];
            if router.is_null() {
                return Err(CloudError::Invalid(format!(
                    "vxnet {} is not bound to a vpc",
                    id
                )));
            }
            let ip_start = router["dyn_ip_start"].as_str().unwrap_or("");
            let ip_end = router["dyn_ip_end"].as_str().unwrap_or("");
            if ip_start.is_empty() || ip_end.is_empty() {
                return Err(CloudError::Invalid(format!(
                    "vxnet {} has no dhcp range",
                    id
                )));
            }
            result.insert(
                id.clone(),
                VxNet {
                    id,
                    gateway: router["manager_ip"].as_str().unwrap_or("").to_string(),
                    network: router["ip_network"].as_str().unwrap_or("").to_string(),
                    ip_start: ip_start.to_string(),
                    ip_end: ip_end_after_reserved(ip_end, RESERVED_VIP_COUNT)?,
                    tunnel_type: vxnet["tunnel_type"].as_str().unwrap_or("").to_string(),
                },
            );
        }
        Ok(result)
    }

    async fn describe_nic_jobs(&self, job_ids: &[String]) -> CloudResult<PendingJobs> {
        let value = self
            .request(
                "DescribeJobs",
                json!({ "jobs": job_ids, "limit": NIC_NUM_LIMIT }),
            )
            .await?;

        let mut pending = PendingJobs::default();
        for job in value["job_set"].as_array().into_iter().flatten() {
            let action = job["job_action"].as_str().unwrap_or("");
            let status = job["status"].as_str().unwrap_or("");
            if (action == "AttachNics" || action == "DetachNics")
                && (status == "working" || status == "pending")
            {
                if let Some(id) = job["job_id"].as_str() {
                    pending.jobs.push(id.to_string());
                }
                // the job directive carries the nic ids it operates on
                if let Some(directive) = job["directive"].as_str() {
                    if let Ok(parsed) = serde_json::from_str::<Value>(directive) {
                        for nic in parsed["nics"].as_array().into_iter().flatten() {
                            if let Some(id) = nic.as_str() {
                                pending.nics.insert(id.to_string());
                            }
                        }
                    }
                }
            }
        }
        Ok(pending)
    }

    async fn create_vips(&self, vxnet: &VxNet) -> CloudResult<String> {
        let count = crate::cloud::ip_range_count(&vxnet.ip_start, &vxnet.ip_end)?;
        let params = json!({
            "vip_name": format!("{}{}", NIC_PREFIX, vxnet.id),
            "vxnet_id": vxnet.id,
            "vip_range": format!("{}-{}", vxnet.ip_start, vxnet.ip_end),
            "count": count,
        });
        let value = self.request("CreateVips", params).await?;
        value["job_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CloudError::Invalid("CreateVips returned no job id".to_string()))
    }

    async fn describe_vips(&self, vxnet: &VxNet) -> CloudResult<Vec<Vip>> {
        let value = self
            .request(
                "DescribeVxnetsVips",
                json!({
                    "vip_name": format!("{}{}", NIC_PREFIX, vxnet.id),
                    "vxnets": [vxnet.id],
                    "limit": VIP_NUM_LIMIT,
                }),
            )
            .await?;

        Ok(value["vip_set"]
            .as_array()
            .into_iter()
            .flatten()
            .map(|vip| Vip {
                id: vip["vip_id"].as_str().unwrap_or("").to_string(),
                name: vip["vip_name"].as_str().unwrap_or("").to_string(),
                addr: vip["vip_addr"].as_str().unwrap_or("").to_string(),
                vxnet_id: vip["vxnet_id"].as_str().unwrap_or("").to_string(),
            })
            .collect())
    }

    async fn delete_vips(&self, vip_ids: &[String]) -> CloudResult<String> {
        if vip_ids.is_empty() {
            return Ok(String::new());
        }
        let value = self
            .request("DeleteVips", json!({ "vips": vip_ids }))
            .await?;
        value["job_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| CloudError::Invalid("DeleteVips returned no job id".to_string()))
    }
}
