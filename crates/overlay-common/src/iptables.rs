//! Firewall capability and its `iptables` implementation.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::error::{OverlayError, OverlayResult};
use crate::shell::{self, shellquote};

/// First iptables release with `--random-fully` in the MASQUERADE target.
const RANDOM_FULLY_MIN_VERSION: (u32, u32, u32) = (1, 6, 2);

static VERSION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"v(\d+)\.(\d+)\.(\d+)").expect("Invalid regex pattern"));

/// Host firewall primitives. Each call is one atomic rule operation.
#[async_trait]
pub trait IpTables: Send + Sync {
    /// Append the rule unless an identical one is already in the chain.
    async fn append_unique(&self, table: &str, chain: &str, rulespec: &[String])
        -> OverlayResult<()>;

    async fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> OverlayResult<()>;

    async fn exists(&self, table: &str, chain: &str, rulespec: &[String]) -> OverlayResult<bool>;

    /// Rules of a chain in `-S` form.
    async fn list(&self, table: &str, chain: &str) -> OverlayResult<Vec<String>>;

    /// Whether MASQUERADE accepts `--random-fully`.
    async fn has_random_fully(&self) -> bool;
}

/// Build a rule command (`-A`, `-D`, `-C`, ...)
pub fn build_rule_cmd(op: &str, table: &str, chain: &str, rulespec: &[String]) -> String {
    let mut cmd = format!(
        "{} -w -t {} {} {}",
        shell::IPTABLES_CMD,
        shellquote(table),
        op,
        shellquote(chain)
    );
    for arg in rulespec {
        cmd.push(' ');
        cmd.push_str(&shellquote(arg));
    }
    cmd
}

/// Parse `iptables --version` output into (major, minor, patch).
pub fn parse_version(output: &str) -> Option<(u32, u32, u32)> {
    let caps = VERSION_RE.captures(output)?;
    let part = |i: usize| caps.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    Some((part(1)?, part(2)?, part(3)?))
}

/// `iptables` driven through the shell; waits on the xtables lock (`-w`).
#[derive(Debug, Default)]
pub struct ShellIpTables {
    random_fully: OnceCell<bool>,
}

impl ShellIpTables {
    pub fn new() -> Self {
        Self::default()
    }

    async fn probe_random_fully() -> bool {
        let cmd = format!("{} --version", shell::IPTABLES_CMD);
        match shell::exec_or_throw(&cmd).await {
            Ok(out) => match parse_version(&out) {
                Some(v) => v >= RANDOM_FULLY_MIN_VERSION,
                None => {
                    warn!(output = %out, "Unrecognized iptables version");
                    false
                }
            },
            Err(e) => {
                warn!(error = %e, "Failed to query iptables version");
                false
            }
        }
    }
}

#[async_trait]
impl IpTables for ShellIpTables {
    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[String],
    ) -> OverlayResult<()> {
        if self.exists(table, chain, rulespec).await? {
            return Ok(());
        }
        shell::exec_or_throw(&build_rule_cmd("-A", table, chain, rulespec)).await?;
        Ok(())
    }

    async fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> OverlayResult<()> {
        shell::exec_or_throw(&build_rule_cmd("-D", table, chain, rulespec)).await?;
        Ok(())
    }

    async fn exists(&self, table: &str, chain: &str, rulespec: &[String]) -> OverlayResult<bool> {
        let result = shell::exec(&build_rule_cmd("-C", table, chain, rulespec)).await?;
        match result.exit_code {
            0 => Ok(true),
            // "Bad rule (does a matching rule exist in that chain?)"
            1 => Ok(false),
            code => Err(OverlayError::RuleExistenceCheck {
                message: format!("iptables exited with {}: {}", code, result.message()),
            }),
        }
    }

    async fn list(&self, table: &str, chain: &str) -> OverlayResult<Vec<String>> {
        let cmd = format!(
            "{} -w -t {} -S {}",
            shell::IPTABLES_CMD,
            shellquote(table),
            shellquote(chain)
        );
        let out = shell::exec_or_throw(&cmd).await?;
        Ok(out.lines().map(str::to_string).collect())
    }

    async fn has_random_fully(&self) -> bool {
        let supported = *self.random_fully.get_or_init(Self::probe_random_fully).await;
        debug!(supported, "iptables --random-fully support");
        supported
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_build_rule_cmd() {
        let cmd = build_rule_cmd(
            "-C",
            "nat",
            "POSTROUTING",
            &spec(&["!", "-s", "10.1.0.0/16", "-d", "10.1.15.0/24", "-j", "RETURN"]),
        );
        assert_eq!(
            cmd,
            "/sbin/iptables -w -t \"nat\" -C \"POSTROUTING\" \"!\" \"-s\" \"10.1.0.0/16\" \"-d\" \"10.1.15.0/24\" \"-j\" \"RETURN\""
        );
    }

    #[test]
    fn test_parse_version() {
        assert_eq!(parse_version("iptables v1.8.7 (nf_tables)"), Some((1, 8, 7)));
        assert_eq!(parse_version("iptables v1.6.1"), Some((1, 6, 1)));
        assert_eq!(parse_version("garbage"), None);
    }

    #[test]
    fn test_random_fully_threshold() {
        assert!(parse_version("iptables v1.6.2").unwrap() >= RANDOM_FULLY_MIN_VERSION);
        assert!(parse_version("iptables v1.6.1").unwrap() < RANDOM_FULLY_MIN_VERSION);
        assert!(parse_version("iptables v1.10.0").unwrap() >= RANDOM_FULLY_MIN_VERSION);
    }
}
