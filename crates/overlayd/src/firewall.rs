//! Firewall rule reconciler.
//!
//! Rule groups are plain data. The reconciler keeps a group installed as a
//! whole: when any rule is missing the group is torn down and re-appended
//! in order, because earlier RETURN rules must short-circuit the
//! MASQUERADE rules that follow them.

use ipnet::Ipv4Net;
use overlay_common::{IpTables, OverlayError, OverlayResult};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

/// Default interval between rule checks.
pub const DEFAULT_RESYNC: Duration = Duration::from_secs(5);

const MULTICAST_NET: &str = "224.0.0.0/4";

/// One rule: table, chain and the arguments after the chain name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpTablesRule {
    pub table: String,
    pub chain: String,
    pub rulespec: Vec<String>,
}

impl IpTablesRule {
    pub fn new(table: &str, chain: &str, rulespec: &[&str]) -> Self {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            rulespec: rulespec.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn with_args(mut self, args: &[&str]) -> Self {
        self.rulespec.extend(args.iter().map(|s| s.to_string()));
        self
    }
}

impl fmt::Display for IpTablesRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.rulespec.join(" "))
    }
}

/// NAT rules for `network` with `subnet` owned by this node.
pub fn masq_rules_with(network: Ipv4Net, subnet: Ipv4Net, random_fully: bool) -> Vec<IpTablesRule> {
    let n = network.to_string();
    let s = subnet.to_string();
    let extra: &[&str] = if random_fully { &["--random-fully"] } else { &[] };

    vec![
        // No NAT inside the overlay.
        IpTablesRule::new("nat", "POSTROUTING", &["-s", &n, "-d", &n, "-j", "RETURN"]),
        // Overlay to the outside world, except multicast.
        IpTablesRule::new(
            "nat",
            "POSTROUTING",
            &["-s", &n, "!", "-d", MULTICAST_NET, "-j", "MASQUERADE"],
        )
        .with_args(extra),
        // External traffic for pods on this node keeps its source.
        IpTablesRule::new("nat", "POSTROUTING", &["!", "-s", &n, "-d", &s, "-j", "RETURN"]),
        // Host traffic to remote pods.
        IpTablesRule::new(
            "nat",
            "POSTROUTING",
            &["!", "-s", &n, "-d", &n, "-j", "MASQUERADE"],
        )
        .with_args(extra),
    ]
}

/// NAT rules, probing the firewall for `--random-fully` support.
pub async fn masq_rules(ipt: &dyn IpTables, network: Ipv4Net, subnet: Ipv4Net) -> Vec<IpTablesRule> {
    let random_fully = ipt.has_random_fully().await;
    debug!(random_fully, "Probed MASQUERADE capabilities");
    masq_rules_with(network, subnet, random_fully)
}

/// Accept forwarded traffic to and from the overlay.
pub fn forward_rules(network: Ipv4Net) -> Vec<IpTablesRule> {
    let n = network.to_string();
    vec![
        IpTablesRule::new("filter", "FORWARD", &["-s", &n, "-j", "ACCEPT"]),
        IpTablesRule::new("filter", "FORWARD", &["-d", &n, "-j", "ACCEPT"]),
    ]
}

/// True if every rule is installed.
pub async fn rules_exist(ipt: &dyn IpTables, rules: &[IpTablesRule]) -> OverlayResult<bool> {
    for rule in rules {
        let exists = ipt
            .exists(&rule.table, &rule.chain, &rule.rulespec)
            .await
            .map_err(|e| match e {
                OverlayError::RuleExistenceCheck { .. } => e,
                other => OverlayError::RuleExistenceCheck {
                    message: other.to_string(),
                },
            })?;
        if !exists {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Append every rule in order; stops at the first failure.
pub async fn setup_rules(ipt: &dyn IpTables, rules: &[IpTablesRule]) -> OverlayResult<()> {
    for rule in rules {
        info!(rule = %rule, "Adding iptables rule");
        ipt.append_unique(&rule.table, &rule.chain, &rule.rulespec)
            .await?;
    }
    Ok(())
}

/// Delete every rule; failures mean the rule was already gone.
pub async fn teardown_rules(ipt: &dyn IpTables, rules: &[IpTablesRule]) {
    for rule in rules {
        info!(rule = %rule, "Deleting iptables rule");
        if let Err(e) = ipt.delete(&rule.table, &rule.chain, &rule.rulespec).await {
            debug!(rule = %rule, error = %e, "Rule delete ignored");
        }
    }
}

/// Leave the full group installed. A no-op when nothing is missing.
pub async fn ensure_rules(ipt: &dyn IpTables, rules: &[IpTablesRule]) -> OverlayResult<()> {
    if rules_exist(ipt, rules).await? {
        return Ok(());
    }
    info!("Some iptables rules are missing; deleting and recreating rules");
    teardown_rules(ipt, rules).await;
    setup_rules(ipt, rules).await
}

/// Remove a rule group outside of a running reconciler.
pub async fn delete_rules(ipt: &dyn IpTables, rules: &[IpTablesRule]) {
    teardown_rules(ipt, rules).await;
}

/// Periodically re-installs one rule group until cancelled.
pub struct FirewallReconciler {
    ipt: Arc<dyn IpTables>,
    rules: Vec<IpTablesRule>,
    resync: Duration,
}

impl FirewallReconciler {
    pub fn new(ipt: Arc<dyn IpTables>, rules: Vec<IpTablesRule>) -> Self {
        Self {
            ipt,
            rules,
            resync: DEFAULT_RESYNC,
        }
    }

    pub fn with_resync(mut self, resync: Duration) -> Self {
        self.resync = resync;
        self
    }

    pub fn rules(&self) -> &[IpTablesRule] {
        &self.rules
    }

    /// Ensure the rules every resync interval; remove them on cancellation.
    #[instrument(skip_all, fields(rules = self.rules.len()))]
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.resync);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = ensure_rules(self.ipt.as_ref(), &self.rules).await {
                        error!(error = %e, "Failed to ensure iptables rules");
                    }
                }
            }
        }

        teardown_rules(self.ipt.as_ref(), &self.rules).await;
        info!("Firewall reconciler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    #[test]
    fn test_forward_rules() {
        let rules = forward_rules(net("10.1.0.0/16"));
        assert_eq!(
            rules,
            vec![
                IpTablesRule::new("filter", "FORWARD", &["-s", "10.1.0.0/16", "-j", "ACCEPT"]),
                IpTablesRule::new("filter", "FORWARD", &["-d", "10.1.0.0/16", "-j", "ACCEPT"]),
            ]
        );
    }

    #[test]
    fn test_random_fully_only_on_masquerade() {
        let rules = masq_rules_with(net("10.1.0.0/16"), net("10.1.15.0/24"), true);
        let flagged: Vec<bool> = rules
            .iter()
            .map(|r| r.rulespec.last().map(String::as_str) == Some("--random-fully"))
            .collect();
        assert_eq!(flagged, vec![false, true, false, true]);
    }

    #[test]
    fn test_rule_display() {
        let rule = IpTablesRule::new("nat", "POSTROUTING", &["-s", "10.1.0.0/16", "-j", "RETURN"]);
        assert_eq!(rule.to_string(), "-t nat POSTROUTING -s 10.1.0.0/16 -j RETURN");
    }
}
