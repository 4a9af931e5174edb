use std::net::Ipv4Addr;

use ipnet::Ipv4Net;

use crate::network::error::{NetworkError, NetworkResult};
use crate::network::iptables::{Iptables, RuleSpec};
use crate::network::netlink::NetlinkHandle;
use crate::network::rules::{Rule, RuleManager};

// Environment variables controlling the SNAT/connmark plumbing. The names
// are part of the deployment interface and stay as published.
pub const ENV_EXTERNAL_SNAT: &str = "QINGCLOUD_VPC_K8S_CNI_EXTERNALSNAT";
pub const ENV_RANDOMIZE_SNAT: &str = "QINGCLOUD_VPC_K8S_CNI_RANDOMIZESNAT";
pub const ENV_NODE_PORT_SUPPORT: &str = "QINGCLOUD_VPC_CNI_NODE_PORT_SUPPORT";
pub const ENV_CONNMARK: &str = "QINGCLOUD_VPC_K8S_CNI_CONNMARK";

/// Traffic from the primary NIC to local addresses is marked with this so
/// NodePort return traffic leaves through the primary NIC again. kube-proxy
/// uses 0x0000c000 and Calico 0xffff0000, so the default stays clear of
/// both.
pub const DEFAULT_CONNMARK: u32 = 0x80;

const SNAT_CHAIN_PREFIX: &str = "SNAT-CHAIN-";

/// Port randomization applied to the SNAT target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnatMode {
    Sequential,
    HashRandom,
    Prng,
}

/// Host-wide network behavior, resolved from the environment once at start.
#[derive(Debug, Clone)]
pub struct HostNetworkConf {
    pub external_snat: bool,
    pub snat_mode: SnatMode,
    pub node_port_support: bool,
    pub connmark: u32,
}

impl HostNetworkConf {
    pub fn from_env() -> HostNetworkConf {
        HostNetworkConf {
            external_snat: parse_bool(std::env::var(ENV_EXTERNAL_SNAT).ok().as_deref(), false),
            snat_mode: parse_snat_mode(std::env::var(ENV_RANDOMIZE_SNAT).ok().as_deref()),
            node_port_support: parse_bool(
                std::env::var(ENV_NODE_PORT_SUPPORT).ok().as_deref(),
                true,
            ),
            connmark: parse_connmark(std::env::var(ENV_CONNMARK).ok().as_deref()),
        }
    }
}

pub fn parse_bool(value: Option<&str>, default: bool) -> bool {
    match value {
        None | Some("") => default,
        Some(s) => match s.parse::<bool>() {
            Ok(v) => v,
            Err(_) => {
                tracing::error!(value = s, default, "unparsable boolean, using default");
                default
            }
        },
    }
}

pub fn parse_snat_mode(value: Option<&str>) -> SnatMode {
    match value {
        None | Some("") | Some("hashrandom") => SnatMode::HashRandom,
        Some("prng") => SnatMode::Prng,
        Some("none") => SnatMode::Sequential,
        Some(other) => {
            tracing::error!(value = other, "unknown SNAT mode, using hashrandom");
            SnatMode::HashRandom
        }
    }
}

/// Connection marks are 32-bit; zero and out-of-range values fall back to
/// the default.
pub fn parse_connmark(value: Option<&str>) -> u32 {
    let raw = match value {
        None | Some("") => return DEFAULT_CONNMARK,
        Some(s) => s,
    };
    let parsed = if let Some(hex) = raw.strip_prefix("0x") {
        i64::from_str_radix(hex, 16)
    } else {
        raw.parse::<i64>()
    };
    match parsed {
        Ok(mark) if mark > 0 && mark <= i64::from(u32::MAX) => mark as u32,
        Ok(_) => {
            tracing::error!(value = raw, "connmark out of range, using default");
            DEFAULT_CONNMARK
        }
        Err(_) => {
            tracing::error!(value = raw, "unparsable connmark, using default");
            DEFAULT_CONNMARK
        }
    }
}

fn snat_chain(i: usize) -> String {
    format!("{}{}", SNAT_CHAIN_PREFIX, i)
}

/// The full iptables rule set for the host: the SNAT chain ladder over the
/// VPC CIDRs, FORWARD accepts for `nic+` interfaces, and the connmark
/// pair. Pure so the exact rules are testable.
pub fn host_rule_specs(
    conf: &HostNetworkConf,
    vpc_cidrs: &[Ipv4Net],
    vpc_cidr: Ipv4Net,
    primary_addr: Ipv4Addr,
    primary_iface: &str,
    has_random_fully: bool,
) -> Vec<RuleSpec> {
    let mut specs = Vec::new();

    specs.push(RuleSpec::new(
        "first SNAT rule for non-VPC outbound traffic",
        !conf.external_snat,
        "nat",
        "POSTROUTING",
        &[
            "-m",
            "comment",
            "--comment",
            "hostnic SNAT",
            "-j",
            &snat_chain(0),
        ],
    ));

    for (i, cidr) in vpc_cidrs.iter().enumerate() {
        let cidr = cidr.to_string();
        let next = snat_chain(i + 1);
        specs.push(RuleSpec {
            name: format!("SNAT chain hop {}", i),
            should_exist: !conf.external_snat,
            table: "nat".to_string(),
            chain: snat_chain(i),
            rule: vec![
                "!".to_string(),
                "-d".to_string(),
                cidr,
                "-m".to_string(),
                "comment".to_string(),
                "--comment".to_string(),
                "hostnic SNAT".to_string(),
                "-j".to_string(),
                next,
            ],
        });
    }

    let mut snat_rule: Vec<String> = [
        "-m",
        "comment",
        "--comment",
        "hostnic SNAT",
        "-m",
        "addrtype",
        "!",
        "--dst-type",
        "LOCAL",
        "-j",
        "SNAT",
        "--to-source",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    snat_rule.push(primary_addr.to_string());
    match conf.snat_mode {
        SnatMode::HashRandom => snat_rule.push("--random".to_string()),
        SnatMode::Prng => {
            if has_random_fully {
                snat_rule.push("--random-fully".to_string());
            } else {
                tracing::warn!(
                    "prng (--random-fully) requested but iptables does not support it, \
                     falling back to --random"
                );
                snat_rule.push("--random".to_string());
            }
        }
        SnatMode::Sequential => {}
    }
    specs.push(RuleSpec {
        name: "last SNAT rule for non-VPC outbound traffic".to_string(),
        should_exist: !conf.external_snat,
        table: "nat".to_string(),
        chain: snat_chain(vpc_cidrs.len()),
        rule: snat_rule,
    });

    specs.push(RuleSpec::new(
        "accept forwarded traffic from NICs",
        true,
        "filter",
        "FORWARD",
        &["-i", "nic+", "-j", "ACCEPT"],
    ));
    specs.push(RuleSpec::new(
        "accept forwarded traffic to NICs",
        true,
        "filter",
        "FORWARD",
        &["-o", "nic+", "-j", "ACCEPT"],
    ));

    let mark = format!("{:#x}/{:#x}", conf.connmark, conf.connmark);
    specs.push(RuleSpec::new(
        "connmark for primary NIC",
        conf.node_port_support,
        "mangle",
        "PREROUTING",
        &[
            "-m",
            "comment",
            "--comment",
            "hostnic, primary NIC",
            "-i",
            primary_iface,
            "-m",
            "addrtype",
            "--dst-type",
            "LOCAL",
            "--limit-iface-in",
            "-j",
            "CONNMARK",
            "--set-mark",
            &mark,
        ],
    ));
    specs.push(RuleSpec::new(
        "connmark restore for NIC traffic",
        conf.node_port_support,
        "mangle",
        "PREROUTING",
        &[
            "-m",
            "comment",
            "--comment",
            "hostnic, primary NIC",
            "-i",
            "nic+",
            "-j",
            "CONNMARK",
            "--restore-mark",
            "--mask",
            &format!("{:#x}", conf.connmark),
        ],
    ));

    // Direct POSTROUTING SNAT written by older agent versions; always
    // removed in favor of the chain ladder.
    specs.push(RuleSpec {
        name: format!("legacy SNAT rule for {}", primary_addr),
        should_exist: false,
        table: "nat".to_string(),
        chain: "POSTROUTING".to_string(),
        rule: vec![
            "!".to_string(),
            "-d".to_string(),
            vpc_cidr.to_string(),
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            "hostnic SNAT".to_string(),
            "-m".to_string(),
            "addrtype".to_string(),
            "!".to_string(),
            "--dst-type".to_string(),
            "LOCAL".to_string(),
            "-j".to_string(),
            "SNAT".to_string(),
            "--to-source".to_string(),
            primary_addr.to_string(),
        ],
    });

    specs
}

/// Host-wide setup, run once at agent start. Every step is idempotent:
/// policy rules are delete-then-add singletons, iptables rules converge via
/// the should-exist pass.
pub async fn setup_host_network(
    conf: &HostNetworkConf,
    nl: &NetlinkHandle,
    rules: &RuleManager,
    ipt: &Iptables,
    vpc_cidr: Ipv4Net,
    vpc_cidrs: &[Ipv4Net],
    primary_mac: &str,
    primary_addr: Ipv4Addr,
) -> NetworkResult<()> {
    tracing::info!("setting up host network");

    // Traffic leaving the VPC must use the main table (and so the primary
    // NIC). Replace any stale copy.
    let host_rule = Rule::host_rule(vpc_cidr);
    rules.del_rule(&host_rule).await?;
    rules.add_rule(&host_rule).await?;

    let mut primary_iface = "eth0".to_string();
    if conf.node_port_support {
        let (_, name) = nl.link_by_mac(primary_mac).await?;
        primary_iface = name;

        // NodePort DNAT happens before the RPF check; with source-based
        // routing towards secondary NICs the strict check would drop the
        // packet, so the primary interface runs loose.
        let rp_filter = format!("/proc/sys/net/ipv4/conf/{}/rp_filter", primary_iface);
        tracing::debug!(path = %rp_filter, "setting reverse path filter to loose");
        std::fs::write(&rp_filter, "2").map_err(NetworkError::Io)?;
    }

    // Marked (NodePort) traffic is forced back out of the main table.
    let connmark_rule = Rule::connmark_rule(conf.connmark);
    rules.del_rule(&connmark_rule).await?;
    if conf.node_port_support {
        rules.add_rule(&connmark_rule).await?;
    }

    // Chain ladder: POSTROUTING -> SNAT-CHAIN-0 -> ... -> SNAT-CHAIN-N,
    // where the last chain SNATs whatever is destined outside every VPC
    // CIDR.
    for i in 0..=vpc_cidrs.len() {
        ipt.new_chain("nat", &snat_chain(i)).await?;
    }

    let specs = host_rule_specs(
        conf,
        vpc_cidrs,
        vpc_cidr,
        primary_addr,
        &primary_iface,
        ipt.has_random_fully(),
    );
    ipt.ensure(&specs).await?;

    tracing::info!("host network ready");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf() -> HostNetworkConf {
        HostNetworkConf {
            external_snat: false,
            snat_mode: SnatMode::HashRandom,
            node_port_support: true,
            connmark: DEFAULT_CONNMARK,
        }
    }

    #[test]
    fn bool_parsing() {
        assert!(parse_bool(None, true));
        assert!(!parse_bool(None, false));
        assert!(parse_bool(Some("true"), false));
        assert!(!parse_bool(Some("false"), true));
        assert!(parse_bool(Some("nonsense"), true));
    }

    #[test]
    fn snat_mode_parsing() {
        assert_eq!(parse_snat_mode(None), SnatMode::HashRandom);
        assert_eq!(parse_snat_mode(Some("hashrandom")), SnatMode::HashRandom);
        assert_eq!(parse_snat_mode(Some("prng")), SnatMode::Prng);
        assert_eq!(parse_snat_mode(Some("none")), SnatMode::Sequential);
        assert_eq!(parse_snat_mode(Some("bogus")), SnatMode::HashRandom);
    }

    #[test]
    fn connmark_parsing() {
        assert_eq!(parse_connmark(None), 0x80);
        assert_eq!(parse_connmark(Some("0x42")), 0x42);
        assert_eq!(parse_connmark(Some("66")), 66);
        assert_eq!(parse_connmark(Some("0")), 0x80);
        assert_eq!(parse_connmark(Some("0x1ffffffff")), 0x80);
        assert_eq!(parse_connmark(Some("junk")), 0x80);
    }

    #[test]
    fn snat_chain_ladder_layout() {
        let cidrs: Vec<Ipv4Net> =
            vec!["172.16.0.0/16".parse().unwrap(), "172.17.0.0/16".parse().unwrap()];
        let specs = host_rule_specs(
            &conf(),
            &cidrs,
            cidrs[0],
            "172.16.0.10".parse().unwrap(),
            "eth0",
            true,
        );

        // POSTROUTING jumps into chain 0
        let first = &specs[0];
        assert_eq!(first.chain, "POSTROUTING");
        assert!(first.rule.contains(&"SNAT-CHAIN-0".to_string()));
        assert!(first.should_exist);

        // chain 0 skips the first CIDR into chain 1
        let hop = &specs[1];
        assert_eq!(hop.chain, "SNAT-CHAIN-0");
        assert_eq!(hop.rule[0], "!");
        assert_eq!(hop.rule[2], "172.16.0.0/16");
        assert!(hop.rule.contains(&"SNAT-CHAIN-1".to_string()));

        // last chain SNATs to the primary address with --random
        let last = specs
            .iter()
            .find(|s| s.chain == "SNAT-CHAIN-2")
            .expect("terminal chain");
        assert!(last.rule.contains(&"SNAT".to_string()));
        assert!(last.rule.contains(&"172.16.0.10".to_string()));
        assert!(last.rule.contains(&"--random".to_string()));
    }

    #[test]
    fn external_snat_removes_chain_rules() {
        let mut c = conf();
        c.external_snat = true;
        let cidrs: Vec<Ipv4Net> = vec!["172.16.0.0/16".parse().unwrap()];
        let specs = host_rule_specs(
            &c,
            &cidrs,
            cidrs[0],
            "172.16.0.10".parse().unwrap(),
            "eth0",
            false,
        );

        for spec in specs.iter().filter(|s| s.chain.starts_with("SNAT-CHAIN-") || s.chain == "POSTROUTING") {
            assert!(!spec.should_exist, "{} should be removed", spec.name);
        }
        // FORWARD accepts stay regardless
        assert!(specs
            .iter()
            .filter(|s| s.chain == "FORWARD")
            .all(|s| s.should_exist));
    }

    #[test]
    fn prng_without_support_falls_back() {
        let mut c = conf();
        c.snat_mode = SnatMode::Prng;
        let cidrs: Vec<Ipv4Net> = vec!["172.16.0.0/16".parse().unwrap()];
        let specs = host_rule_specs(
            &c,
            &cidrs,
            cidrs[0],
            "172.16.0.10".parse().unwrap(),
            "eth0",
            false,
        );
        let last = specs
            .iter()
            .find(|s| s.chain == "SNAT-CHAIN-1")
            .expect("terminal chain");
        assert!(last.rule.contains(&"--random".to_string()));
        assert!(!last.rule.contains(&"--random-fully".to_string()));
    }

    #[test]
    fn sequential_mode_adds_no_random_flag() {
        let mut c = conf();
        c.snat_mode = SnatMode::Sequential;
        let cidrs: Vec<Ipv4Net> = vec!["172.16.0.0/16".parse().unwrap()];
        let specs = host_rule_specs(
            &c,
            &cidrs,
            cidrs[0],
            "172.16.0.10".parse().unwrap(),
            "eth0",
            true,
        );
        let last = specs
            .iter()
            .find(|s| s.chain == "SNAT-CHAIN-1")
            .expect("terminal chain");
        assert!(!last.rule.contains(&"--random".to_string()));
        assert!(!last.rule.contains(&"--random-fully".to_string()));
    }

    #[test]
    fn nodeport_disabled_drops_connmark_rules() {
        let mut c = conf();
        c.node_port_support = false;
        let cidrs: Vec<Ipv4Net> = vec!["172.16.0.0/16".parse().unwrap()];
        let specs = host_rule_specs(
            &c,
            &cidrs,
            cidrs[0],
            "172.16.0.10".parse().unwrap(),
            "eth0",
            true,
        );
        for spec in specs.iter().filter(|s| s.table == "mangle") {
            assert!(!spec.should_exist);
        }
    }
}
