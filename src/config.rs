use clap::Args;

/// Agent configuration, from flags with env fallbacks.
///
/// Behavioral toggles for the SNAT/connmark plumbing keep their published
/// environment variable names and are read by the network configurator
/// directly (see `network::host`).
#[derive(Args, Debug, Clone)]
pub struct AgentConfig {
    /// Unix socket the backend RPC listens on
    #[clap(long, default_value = "/var/run/hostnic/hostnic.sock")]
    pub socket_path: String,

    /// Path of the local NIC-status database
    #[clap(long, default_value = "/var/lib/hostnic/hostnic.db")]
    pub db_path: String,

    /// Maximum number of secondary NICs attached to this node
    #[clap(long, default_value_t = 60)]
    pub max_nic: usize,

    /// First routing table number handed to secondary NICs
    #[clap(long, default_value_t = 100)]
    pub route_table_base: u32,

    /// Seconds between NIC repair sweeps
    #[clap(long, default_value_t = 30)]
    pub sync_interval: u64,

    /// Minutes between idle-NIC eviction sweeps
    #[clap(long, default_value_t = 5)]
    pub free_interval: u64,

    /// Minutes between DHCP lease renewals for VLAN NICs
    #[clap(long, default_value_t = 30)]
    pub lease_interval: u64,

    /// VPC CIDR this node belongs to
    #[clap(long)]
    pub vpc_cidr: String,

    /// Additional VPC CIDRs excluded from SNAT (repeatable)
    #[clap(long = "vpc-extra-cidr")]
    pub vpc_extra_cidrs: Vec<String>,

    /// Cloud API endpoint
    #[clap(
        long,
        env = "QINGCLOUD_API_ENDPOINT",
        default_value = "https://api.qingcloud.com/iaas"
    )]
    pub api_endpoint: String,

    #[clap(long, env = "QINGCLOUD_ACCESS_KEY_ID")]
    pub access_key_id: String,

    #[clap(long, env = "QINGCLOUD_SECRET_ACCESS_KEY", hide_env_values = true)]
    pub secret_access_key: String,

    #[clap(long, env = "QINGCLOUD_ZONE")]
    pub zone: String,

    /// Optional tag attached to NICs created by this node
    #[clap(long)]
    pub tag: Option<String>,
}

impl AgentConfig {
    /// Routing table numbers are written into the kernel's rtm_table byte, so
    /// the whole assignable window must stay below 253 (253-255 are the
    /// kernel's default/main/local tables).
    pub fn validate(&self) -> Result<(), String> {
        if self.route_table_base == 0 {
            return Err("route-table-base must be positive".to_string());
        }
        let top = self.route_table_base as usize + self.max_nic;
        if top > 252 {
            return Err(format!(
                "route-table-base {} + max-nic {} exceeds table 252",
                self.route_table_base, self.max_nic
            ));
        }
        if self.vpc_cidr.parse::<ipnet::Ipv4Net>().is_err() {
            return Err(format!("invalid VPC CIDR: {}", self.vpc_cidr));
        }
        for cidr in &self.vpc_extra_cidrs {
            if cidr.parse::<ipnet::Ipv4Net>().is_err() {
                return Err(format!("invalid VPC CIDR: {}", cidr));
            }
        }
        Ok(())
    }
}
