//! In-memory firewall implementing [`IpTables`].

use async_trait::async_trait;
use overlay_common::{IpTables, OverlayError, OverlayResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

/// One installed rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledRule {
    pub table: String,
    pub chain: String,
    pub rulespec: Vec<String>,
}

impl InstalledRule {
    pub fn new(table: &str, chain: &str, rulespec: &[String]) -> Self {
        Self {
            table: table.to_string(),
            chain: chain.to_string(),
            rulespec: rulespec.to_vec(),
        }
    }

    fn matches(&self, table: &str, chain: &str, rulespec: &[String]) -> bool {
        self.table == table && self.chain == chain && self.rulespec == rulespec
    }
}

/// Ordered rule list with a mutation counter.
#[derive(Debug, Default)]
pub struct FakeIpTables {
    rules: Mutex<Vec<InstalledRule>>,
    mutations: AtomicUsize,
    random_fully: AtomicBool,
    fail_exists: AtomicBool,
}

impl FakeIpTables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Firewall reporting `--random-fully` support.
    pub fn with_random_fully() -> Self {
        let fw = Self::default();
        fw.random_fully.store(true, Ordering::SeqCst);
        fw
    }

    fn lock(&self) -> MutexGuard<'_, Vec<InstalledRule>> {
        self.rules.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Installed rules in chain order.
    pub fn rules(&self) -> Vec<InstalledRule> {
        self.lock().clone()
    }

    /// Appends and deletes performed through the trait.
    pub fn mutations(&self) -> usize {
        self.mutations.load(Ordering::SeqCst)
    }

    /// Make `exists` return an error.
    pub fn set_fail_exists(&self, fail: bool) {
        self.fail_exists.store(fail, Ordering::SeqCst);
    }

    /// Remove a rule as an outside actor would; not counted as a mutation.
    pub fn drop_rule(&self, index: usize) -> Option<InstalledRule> {
        let mut rules = self.lock();
        (index < rules.len()).then(|| rules.remove(index))
    }

    /// Insert a rule as an outside actor would.
    pub fn inject_rule(&self, rule: InstalledRule) {
        self.lock().push(rule);
    }
}

#[async_trait]
impl IpTables for FakeIpTables {
    async fn append_unique(
        &self,
        table: &str,
        chain: &str,
        rulespec: &[String],
    ) -> OverlayResult<()> {
        let mut rules = self.lock();
        if rules.iter().any(|r| r.matches(table, chain, rulespec)) {
            return Ok(());
        }
        rules.push(InstalledRule::new(table, chain, rulespec));
        self.mutations.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, table: &str, chain: &str, rulespec: &[String]) -> OverlayResult<()> {
        let mut rules = self.lock();
        match rules.iter().position(|r| r.matches(table, chain, rulespec)) {
            Some(pos) => {
                rules.remove(pos);
                self.mutations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(OverlayError::ShellCommandFailed {
                command: format!("iptables -t {} -D {} {}", table, chain, rulespec.join(" ")),
                exit_code: 1,
                output: "Bad rule (does a matching rule exist in that chain?)".to_string(),
            }),
        }
    }

    async fn exists(&self, table: &str, chain: &str, rulespec: &[String]) -> OverlayResult<bool> {
        if self.fail_exists.load(Ordering::SeqCst) {
            return Err(OverlayError::RuleExistenceCheck {
                message: "xtables lock held".to_string(),
            });
        }
        Ok(self
            .lock()
            .iter()
            .any(|r| r.matches(table, chain, rulespec)))
    }

    async fn list(&self, table: &str, chain: &str) -> OverlayResult<Vec<String>> {
        Ok(self
            .lock()
            .iter()
            .filter(|r| r.table == table && r.chain == chain)
            .map(|r| format!("-A {} {}", r.chain, r.rulespec.join(" ")))
            .collect())
    }

    async fn has_random_fully(&self) -> bool {
        self.random_fully.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(args: &[&str]) -> Vec<String> {
        args.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_append_unique_and_list() {
        let fw = FakeIpTables::new();
        let rule = spec(&["-s", "10.1.0.0/16", "-j", "ACCEPT"]);

        fw.append_unique("filter", "FORWARD", &rule).await.unwrap();
        fw.append_unique("filter", "FORWARD", &rule).await.unwrap();
        assert_eq!(fw.mutations(), 1);
        assert_eq!(
            fw.list("filter", "FORWARD").await.unwrap(),
            vec!["-A FORWARD -s 10.1.0.0/16 -j ACCEPT".to_string()]
        );
    }

    #[tokio::test]
    async fn test_delete_missing_fails() {
        let fw = FakeIpTables::new();
        let rule = spec(&["-d", "10.1.0.0/16", "-j", "ACCEPT"]);
        assert!(fw.delete("filter", "FORWARD", &rule).await.is_err());
        assert_eq!(fw.mutations(), 0);
    }
}
