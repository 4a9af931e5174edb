use tokio::process::Command;

use crate::network::error::{NetworkError, NetworkResult};

/// One desired (or desired-absent) iptables rule. The ensure pass converges
/// the kernel to `should_exist` without disturbing anything else.
#[derive(Debug, Clone)]
pub struct RuleSpec {
    pub name: String,
    pub should_exist: bool,
    pub table: String,
    pub chain: String,
    pub rule: Vec<String>,
}

impl RuleSpec {
    pub fn new(name: &str, should_exist: bool, table: &str, chain: &str, rule: &[&str]) -> Self {
        RuleSpec {
            name: name.to_string(),
            should_exist,
            table: table.to_string(),
            chain: chain.to_string(),
            rule: rule.iter().map(|s| s.to_string()).collect(),
        }
    }
}

/// Thin wrapper over the `iptables` tool in the same spirit as the rule
/// manager: checks with `-C`, appends with `-A`, removes with `-D`.
pub struct Iptables {
    random_fully: bool,
}

impl Iptables {
    pub async fn new() -> Iptables {
        let random_fully = match Command::new("iptables").arg("--version").output().await {
            Ok(out) => supports_random_fully(&String::from_utf8_lossy(&out.stdout)),
            Err(_) => false,
        };
        Iptables { random_fully }
    }

    /// Whether this iptables accepts `--random-fully` on SNAT targets.
    pub fn has_random_fully(&self) -> bool {
        self.random_fully
    }

    pub async fn new_chain(&self, table: &str, chain: &str) -> NetworkResult<()> {
        let output = Command::new("iptables")
            .args(["-t", table, "-N", chain])
            .output()
            .await?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        // warm start
        if stderr.contains("Chain already exists") {
            return Ok(());
        }
        Err(NetworkError::Command {
            cmd: format!("iptables -t {} -N {}", table, chain),
            stderr,
        })
    }

    pub async fn exists(&self, table: &str, chain: &str, rule: &[String]) -> NetworkResult<bool> {
        let mut args = vec!["-t".to_string(), table.to_string(), "-C".to_string(), chain.to_string()];
        args.extend(rule.iter().cloned());
        let output = Command::new("iptables").args(&args).output().await?;
        Ok(output.status.success())
    }

    pub async fn append(&self, table: &str, chain: &str, rule: &[String]) -> NetworkResult<()> {
        self.edit("-A", table, chain, rule).await
    }

    pub async fn delete(&self, table: &str, chain: &str, rule: &[String]) -> NetworkResult<()> {
        self.edit("-D", table, chain, rule).await
    }

    async fn edit(
        &self,
        verb: &str,
        table: &str,
        chain: &str,
        rule: &[String],
    ) -> NetworkResult<()> {
        let mut args = vec![
            "-t".to_string(),
            table.to_string(),
            verb.to_string(),
            chain.to_string(),
        ];
        args.extend(rule.iter().cloned());
        let output = Command::new("iptables").args(&args).output().await?;
        if output.status.success() {
            return Ok(());
        }
        Err(NetworkError::Command {
            cmd: format!("iptables {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    /// Converge the kernel to the given rule set: append what should exist
    /// and is missing, delete what exists but should not.
    pub async fn ensure(&self, rules: &[RuleSpec]) -> NetworkResult<()> {
        for spec in rules {
            let exists = self.exists(&spec.table, &spec.chain, &spec.rule).await?;
            if !exists && spec.should_exist {
                tracing::debug!(rule = %spec.name, "installing iptables rule");
                self.append(&spec.table, &spec.chain, &spec.rule).await?;
            } else if exists && !spec.should_exist {
                tracing::debug!(rule = %spec.name, "removing iptables rule");
                self.delete(&spec.table, &spec.chain, &spec.rule).await?;
            }
        }
        Ok(())
    }
}

/// `--random-fully` needs iptables >= 1.6.2.
pub fn supports_random_fully(version_output: &str) -> bool {
    let version = version_output
        .split_whitespace()
        .find(|word| word.starts_with('v'))
        .map(|word| word.trim_start_matches('v'))
        .unwrap_or("");

    let mut parts = version
        .split(|c: char| !c.is_ascii_digit())
        .filter_map(|p| p.parse::<u32>().ok());
    let (major, minor, patch) = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    (major, minor, patch) >= (1, 6, 2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_fully_version_gate() {
        assert!(supports_random_fully("iptables v1.8.7 (nf_tables)"));
        assert!(supports_random_fully("iptables v1.6.2"));
        assert!(!supports_random_fully("iptables v1.6.1"));
        assert!(!supports_random_fully("iptables v1.4.21"));
        assert!(!supports_random_fully("garbage"));
    }
}
