use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tokio::process::Command;

use crate::network::error::{NetworkError, NetworkResult};

// The policy-routing priority bands. 0-511 stay free for operators,
// 513-1023 and 1025-1535 are fallback bands.
pub const TO_POD_RULE_PRIORITY: u32 = 512;
pub const HOST_RULE_PRIORITY: u32 = 1024;
pub const FROM_POD_RULE_PRIORITY: u32 = 1536;

pub const MAIN_TABLE: &str = "main";

/// One IPv4 policy-routing rule, as `ip rule` models it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Rule {
    pub priority: u32,
    pub invert: bool,
    pub src: Option<Ipv4Net>,
    pub dst: Option<Ipv4Net>,
    pub table: String,
    pub fwmark: Option<u32>,
    pub fwmask: Option<u32>,
}

impl Rule {
    pub fn host_rule(vpc_cidr: Ipv4Net) -> Rule {
        Rule {
            priority: HOST_RULE_PRIORITY,
            invert: true,
            dst: Some(vpc_cidr),
            table: MAIN_TABLE.to_string(),
            ..Default::default()
        }
    }

    pub fn connmark_rule(mark: u32) -> Rule {
        Rule {
            priority: HOST_RULE_PRIORITY,
            table: MAIN_TABLE.to_string(),
            fwmark: Some(mark),
            fwmask: Some(mark),
            ..Default::default()
        }
    }

    /// Source rule steering one pod's traffic into a NIC's routing table.
    pub fn pod_rule(pod_ip: Ipv4Addr, table: u32) -> Rule {
        Rule {
            priority: FROM_POD_RULE_PRIORITY,
            src: Some(Ipv4Net::from(pod_ip)),
            table: table.to_string(),
            ..Default::default()
        }
    }

    /// `ip -4 rule {add,del}` arguments for this rule.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["pref".to_string(), self.priority.to_string()];
        if self.invert {
            args.push("not".to_string());
        }
        match &self.src {
            Some(src) => args.extend(["from".to_string(), src.to_string()]),
            None => args.extend(["from".to_string(), "all".to_string()]),
        }
        if let Some(dst) = &self.dst {
            args.extend(["to".to_string(), dst.to_string()]);
        }
        if let Some(mark) = self.fwmark {
            let mark = match self.fwmask {
                Some(mask) => format!("{:#x}/{:#x}", mark, mask),
                None => format!("{:#x}", mark),
            };
            args.extend(["fwmark".to_string(), mark]);
        }
        args.extend(["table".to_string(), self.table.clone()]);
        args
    }
}

/// Parse the entries of `ip -json -4 rule show`.
pub fn parse_rule_list(json: &str) -> NetworkResult<Vec<Rule>> {
    let entries: Vec<serde_json::Value> = serde_json::from_str(json)?;
    let mut rules = Vec::new();
    for entry in entries {
        let mut rule = Rule {
            priority: entry["priority"].as_u64().unwrap_or(0) as u32,
            invert: entry["not"].as_bool().unwrap_or(false),
            table: entry["table"].as_str().unwrap_or("").to_string(),
            ..Default::default()
        };
        rule.src = parse_prefix(&entry, "src", "srclen");
        rule.dst = parse_prefix(&entry, "dst", "dstlen");
        if let Some(mark) = entry["fwmark"].as_str() {
            let mut parts = mark.splitn(2, '/');
            rule.fwmark = parts.next().and_then(parse_u32);
            rule.fwmask = parts.next().and_then(parse_u32);
        }
        rules.push(rule);
    }
    Ok(rules)
}

fn parse_prefix(entry: &serde_json::Value, key: &str, len_key: &str) -> Option<Ipv4Net> {
    let addr = entry[key].as_str()?;
    if addr == "all" {
        return None;
    }
    let ip: Ipv4Addr = addr.parse().ok()?;
    let prefix = entry[len_key].as_u64().unwrap_or(32) as u8;
    Ipv4Net::new(ip, prefix).ok()
}

fn parse_u32(s: &str) -> Option<u32> {
    if let Some(hex) = s.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

/// Policy-rule manipulation via the `ip` tool. Every operation is
/// idempotent: adds absorb "File exists", deletes absorb missing rules.
pub struct RuleManager;

impl RuleManager {
    pub async fn list_rules(&self) -> NetworkResult<Vec<Rule>> {
        let output = Command::new("ip")
            .args(["-json", "-4", "rule", "show"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(NetworkError::Command {
                cmd: "ip -json -4 rule show".to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        parse_rule_list(&String::from_utf8_lossy(&output.stdout))
    }

    pub async fn add_rule(&self, rule: &Rule) -> NetworkResult<()> {
        self.run("add", rule).await
    }

    pub async fn del_rule(&self, rule: &Rule) -> NetworkResult<()> {
        self.run("del", rule).await
    }

    async fn run(&self, verb: &str, rule: &Rule) -> NetworkResult<()> {
        let mut args = vec!["-4".to_string(), "rule".to_string(), verb.to_string()];
        args.extend(rule.to_args());

        let output = Command::new("ip").args(&args).output().await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // "add" of a present rule and "del" of an absent one are both fine
        if stderr.contains("File exists") || stderr.contains("No such file or directory") {
            return Ok(());
        }
        Err(NetworkError::Command {
            cmd: format!("ip {}", args.join(" ")),
            stderr,
        })
    }

    pub fn rules_by_src(rules: &[Rule], src: Ipv4Addr) -> Vec<Rule> {
        rules
            .iter()
            .filter(|r| r.src.map(|s| s.addr()) == Some(src))
            .cloned()
            .collect()
    }

    /// Remove every rule whose source is the pod address. Idempotent.
    pub async fn delete_rules_by_src(&self, src: Ipv4Addr) -> NetworkResult<()> {
        let rules = self.list_rules().await?;
        for rule in Self::rules_by_src(&rules, src) {
            tracing::debug!(?rule, "removing pod rule");
            self.del_rule(&rule).await?;
        }
        Ok(())
    }

    /// Re-point the pod's source rules: delete all of them, then re-add one
    /// rule into the old table, or one per egress CIDR when external SNAT
    /// carries the off-VPC traffic.
    pub async fn update_rules_by_src(
        &self,
        src: Ipv4Addr,
        egress_cidrs: &[Ipv4Net],
        external_snat: bool,
    ) -> NetworkResult<()> {
        let rules = self.list_rules().await?;
        let existing = Self::rules_by_src(&rules, src);
        for rule in &existing {
            self.del_rule(rule).await?;
        }
        let table = match existing.first() {
            Some(rule) => rule.table.clone(),
            None => {
                tracing::debug!(%src, "no rules for source, nothing to update");
                return Ok(());
            }
        };

        if external_snat {
            for cidr in egress_cidrs {
                let rule = Rule {
                    priority: FROM_POD_RULE_PRIORITY,
                    src: Some(Ipv4Net::from(src)),
                    dst: Some(*cidr),
                    table: table.clone(),
                    ..Default::default()
                };
                self.add_rule(&rule).await?;
            }
        } else {
            let rule = Rule {
                priority: FROM_POD_RULE_PRIORITY,
                src: Some(Ipv4Net::from(src)),
                table,
                ..Default::default()
            };
            self.add_rule(&rule).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_rule_args() {
        let rule = Rule::host_rule("172.16.0.0/16".parse().unwrap());
        assert_eq!(
            rule.to_args(),
            vec!["pref", "1024", "not", "from", "all", "to", "172.16.0.0/16", "table", "main"]
        );
    }

    #[test]
    fn connmark_rule_args() {
        let rule = Rule::connmark_rule(0x80);
        assert_eq!(
            rule.to_args(),
            vec!["pref", "1024", "from", "all", "fwmark", "0x80/0x80", "table", "main"]
        );
    }

    #[test]
    fn pod_rule_args() {
        let rule = Rule::pod_rule("172.16.3.7".parse().unwrap(), 101);
        assert_eq!(
            rule.to_args(),
            vec!["pref", "1536", "from", "172.16.3.7/32", "table", "101"]
        );
    }

    #[test]
    fn parses_ip_json_output() {
        let json = r#"[
            {"priority":0,"src":"all","table":"local"},
            {"priority":1024,"not":true,"src":"all","dst":"172.16.0.0","dstlen":16,"table":"main"},
            {"priority":1024,"src":"all","fwmark":"0x80/0x80","table":"main"},
            {"priority":1536,"src":"172.16.3.7","srclen":32,"table":"101"},
            {"priority":32766,"src":"all","table":"main"}
        ]"#;
        let rules = parse_rule_list(json).unwrap();
        assert_eq!(rules.len(), 5);

        assert!(rules[1].invert);
        assert_eq!(rules[1].dst, Some("172.16.0.0/16".parse().unwrap()));

        assert_eq!(rules[2].fwmark, Some(0x80));
        assert_eq!(rules[2].fwmask, Some(0x80));

        assert_eq!(
            rules[3].src,
            Some("172.16.3.7/32".parse().unwrap())
        );
        assert_eq!(rules[3].table, "101");
    }

    #[test]
    fn filter_by_source() {
        let json = r#"[
            {"priority":1536,"src":"172.16.3.7","srclen":32,"table":"101"},
            {"priority":1536,"src":"172.16.3.8","srclen":32,"table":"101"},
            {"priority":1536,"src":"172.16.3.7","srclen":32,"table":"102"}
        ]"#;
        let rules = parse_rule_list(json).unwrap();
        let matched = RuleManager::rules_by_src(&rules, "172.16.3.7".parse().unwrap());
        assert_eq!(matched.len(), 2);
        let none = RuleManager::rules_by_src(&rules, "172.16.9.9".parse().unwrap());
        assert!(none.is_empty());
    }

    #[test]
    fn round_trip_parsed_rule_to_args() {
        let json = r#"[{"priority":1536,"src":"172.16.3.7","srclen":32,"table":"101"}]"#;
        let rules = parse_rule_list(json).unwrap();
        assert_eq!(
            rules[0].to_args(),
            vec!["pref", "1536", "from", "172.16.3.7/32", "table", "101"]
        );
    }
}
