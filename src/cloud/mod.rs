//! The capability set the allocator needs from the cloud: NIC lifecycle,
//! subnet descriptions, virtual IPs and job tracking.

pub mod http;

use std::collections::{HashMap, HashSet};

use crate::hostnic::{HostNic, VxNet};

/// NICs created by an agent are named `hostnic-<instanceID>` so a restarted
/// agent can find them again.
pub const NIC_PREFIX: &str = "hostnic-";

/// Well-known path carrying this instance's cloud identity.
pub const INSTANCE_ID_FILE: &str = "/etc/qingcloud/instance-id";

/// The provider keeps the tail of every subnet's dynamic range for its own
/// virtual IPs; those addresses are excluded from the usable range.
pub const RESERVED_VIP_COUNT: u32 = 12;

/// Cloud-side job polling: detach/attach jobs complete within this window
/// or the operation is treated as failed.
pub const JOB_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(180);
pub const JOB_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error {code}: {message}")]
    Api { code: i64, message: String },

    #[error("resource not found: {0}")]
    ResourceNotFound(String),

    #[error("job {0} did not finish in time")]
    JobTimeout(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Invalid(String),
}

impl CloudError {
    /// Detach/delete racing an outside deletion surfaces as not-found,
    /// which callers treat as success.
    pub fn is_not_found(&self) -> bool {
        match self {
            CloudError::ResourceNotFound(_) => true,
            CloudError::Api { message, .. } => message.to_ascii_lowercase().contains("not found"),
            _ => false,
        }
    }
}

pub type CloudResult<T> = Result<T, CloudError>;

/// A virtual IP reserved in a subnet.
#[derive(Debug, Clone, PartialEq)]
pub struct Vip {
    pub id: String,
    pub name: String,
    pub addr: String,
    pub vxnet_id: String,
}

/// Jobs still in flight: the job ids plus the NIC ids they operate on.
#[derive(Debug, Clone, Default)]
pub struct PendingJobs {
    pub jobs: Vec<String>,
    pub nics: HashSet<String>,
}

#[async_trait::async_trait]
pub trait CloudApi: Send + Sync {
    fn instance_id(&self) -> &str;

    /// NICs created with this node's naming prefix, regardless of
    /// attachment state.
    async fn get_created_nics(&self, limit: usize, offset: usize) -> CloudResult<Vec<HostNic>>;

    /// NICs currently attached to this instance.
    async fn get_attached_nics(&self) -> CloudResult<Vec<HostNic>>;

    /// Create `count` NICs in the subnet (optionally with fixed addresses)
    /// and submit their attachment to this instance. Created NICs are
    /// deleted again if the attach submission fails.
    async fn create_nics_and_attach(
        &self,
        vxnet: &VxNet,
        count: usize,
        ips: Option<Vec<String>>,
        disable_ip: bool,
    ) -> CloudResult<Vec<HostNic>>;

    /// Detach NICs; with `wait` the call returns once the detach job
    /// completed (or the job window elapsed).
    async fn detach_nics(&self, nic_ids: &[String], wait: bool) -> CloudResult<String>;

    async fn delete_nics(&self, nic_ids: &[String]) -> CloudResult<()>;

    /// Describe subnets. The returned dynamic range already excludes the
    /// provider-reserved tail.
    async fn get_vxnets(&self, ids: &[String]) -> CloudResult<HashMap<String, VxNet>>;

    /// Attach/detach jobs still pending among the given job ids.
    async fn describe_nic_jobs(&self, job_ids: &[String]) -> CloudResult<PendingJobs>;

    async fn create_vips(&self, vxnet: &VxNet) -> CloudResult<String>;
    async fn describe_vips(&self, vxnet: &VxNet) -> CloudResult<Vec<Vip>>;
    async fn delete_vips(&self, vip_ids: &[String]) -> CloudResult<String>;
}

/// Shorten a dynamic range's end by the provider-reserved VIP tail.
pub fn ip_end_after_reserved(end: &str, reserved: u32) -> CloudResult<String> {
    let ip: std::net::Ipv4Addr = end
        .parse()
        .map_err(|_| CloudError::Invalid(format!("invalid range end: {}", end)))?;
    let shortened = u32::from(ip)
        .checked_sub(reserved)
        .ok_or_else(|| CloudError::Invalid(format!("range end {} too low", end)))?;
    Ok(std::net::Ipv4Addr::from(shortened).to_string())
}

/// Number of addresses in an inclusive range.
pub fn ip_range_count(from: &str, to: &str) -> CloudResult<u32> {
    let from: std::net::Ipv4Addr = from
        .parse()
        .map_err(|_| CloudError::Invalid(format!("invalid range start: {}", from)))?;
    let to: std::net::Ipv4Addr = to
        .parse()
        .map_err(|_| CloudError::Invalid(format!("invalid range end: {}", to)))?;
    let (from, to) = (u32::from(from), u32::from(to));
    if to < from {
        return Err(CloudError::Invalid("range end below start".to_string()));
    }
    Ok(to - from + 1)
}
