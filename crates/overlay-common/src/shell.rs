//! iproute2 and iptables invocation.
//!
//! The host link layer and firewall are driven through the `ip`, `bridge`
//! and `iptables` tools. Every argument that comes from configuration or
//! from a lease is passed through [`shellquote`] before it reaches `/bin/sh`.
//!
//! Three flavours of call are used by the data plane:
//! - [`exec_or_throw`] for `ip -j` queries, decoded with [`decode_json`],
//! - [`exec_mutation`] for kernel changes, failing with
//!   [`OverlayError::KernelMutation`],
//! - [`exec`] where the exit code itself carries meaning (`iptables -C`).
//!
//! ```ignore
//! use overlay_common::shell::{self, IP_CMD, shellquote};
//!
//! let cmd = format!("{} link set dev {} up", IP_CMD, shellquote("overlay.1"));
//! shell::exec_mutation("link set up", &cmd).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::process::{Output, Stdio};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::error::{OverlayError, OverlayResult};

/// Path to the `ip` command for link, address, neighbor and route configuration.
pub const IP_CMD: &str = "/sbin/ip";

/// Path to the `bridge` command for forwarding-database configuration.
pub const BRIDGE_CMD: &str = "/sbin/bridge";

/// Path to the `iptables` command for NAT/filter rules.
pub const IPTABLES_CMD: &str = "/sbin/iptables";

/// Characters that keep their meaning inside shell double quotes.
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Wrap `s` in double quotes, escaping `$`, `` ` ``, `"`, `\` and newline.
///
/// ```
/// use overlay_common::shell::shellquote;
///
/// assert_eq!(shellquote("overlay.1"), "\"overlay.1\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    format!("\"{}\"", SHELL_ESCAPE_RE.replace_all(s, r"\$1"))
}

/// Exit status and trimmed output of one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// Exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    fn from_output(output: Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Diagnostic text for an error message.
    ///
    /// iproute2 and iptables report on stderr; stdout is only used when
    /// stderr is empty.
    pub fn message(&self) -> &str {
        if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Run `cmd` through `/bin/sh -c`.
///
/// Fails only when the shell cannot be spawned; a non-zero exit is returned
/// in [`ExecResult::exit_code`]. The child is killed if the future is
/// dropped, so a cancelled reconciliation does not leave commands behind.
pub async fn exec(cmd: &str) -> OverlayResult<ExecResult> {
    debug!(command = %cmd, "Executing shell command");

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(cmd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| OverlayError::ShellExec {
            command: cmd.to_string(),
            source: e,
        })?;

    let result = ExecResult::from_output(output);
    if result.success() {
        trace!(command = %cmd, "Command succeeded");
    } else {
        warn!(
            command = %cmd,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }
    Ok(result)
}

/// Run `cmd` and return its stdout, failing on a non-zero exit.
pub async fn exec_or_throw(cmd: &str) -> OverlayResult<String> {
    let result = exec(cmd).await?;
    if !result.success() {
        return Err(OverlayError::ShellCommandFailed {
            command: cmd.to_string(),
            exit_code: result.exit_code,
            output: result.message().to_string(),
        });
    }
    Ok(result.stdout)
}

/// Apply one kernel change. A non-zero exit becomes
/// [`OverlayError::KernelMutation`] tagged with `operation`.
pub async fn exec_mutation(operation: &str, cmd: &str) -> OverlayResult<()> {
    match exec_or_throw(cmd).await {
        Ok(_) => Ok(()),
        Err(OverlayError::ShellCommandFailed { output, .. }) => {
            Err(OverlayError::kernel(operation, output))
        }
        Err(e) => Err(e),
    }
}

/// Decode `ip -j` output. Some iproute2 versions print nothing instead of
/// `[]` when there is nothing to list.
pub fn decode_json<T: DeserializeOwned>(what: &str, json: &str) -> OverlayResult<Vec<T>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(json).map_err(|e| OverlayError::parse(what, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    struct Entry {
        ifname: String,
    }

    #[test]
    fn test_shellquote() {
        assert_eq!(shellquote("overlay.1"), "\"overlay.1\"");
        assert_eq!(shellquote("10.1.15.0/24"), "\"10.1.15.0/24\"");
        assert_eq!(shellquote("!"), "\"!\"");
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hello\""), "\"say \\\"hello\\\"\"");
        assert_eq!(shellquote("path\\to"), "\"path\\\\to\"");
        assert_eq!(shellquote("line1\nline2"), "\"line1\\\nline2\"");
    }

    #[test]
    fn test_message_prefers_stderr() {
        let mut result = ExecResult {
            exit_code: 2,
            stdout: "partial".to_string(),
            stderr: "RTNETLINK answers: File exists".to_string(),
        };
        assert!(!result.success());
        assert_eq!(result.message(), "RTNETLINK answers: File exists");

        result.stderr.clear();
        assert_eq!(result.message(), "partial");
    }

    #[test]
    fn test_decode_json() {
        let entries: Vec<Entry> = decode_json("links", r#"[{"ifname":"eth0"}]"#).unwrap();
        assert_eq!(entries, vec![Entry { ifname: "eth0".to_string() }]);

        let empty: Vec<Entry> = decode_json("links", "  \n").unwrap();
        assert!(empty.is_empty());

        let err = decode_json::<Entry>("links", "not json").unwrap_err();
        assert!(matches!(err, OverlayError::Parse { ref what, .. } if what == "links"));
    }

    #[tokio::test]
    async fn test_exec_echo() {
        let result = exec("echo hello").await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "hello");
    }

    #[tokio::test]
    async fn test_exec_or_throw_failure() {
        match exec_or_throw("echo oops >&2; exit 3").await {
            Err(OverlayError::ShellCommandFailed {
                exit_code, output, ..
            }) => {
                assert_eq!(exit_code, 3);
                assert_eq!(output, "oops");
            }
            other => panic!("expected ShellCommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_exec_mutation_failure_is_kernel_error() {
        let err = exec_mutation("route replace", "echo 'Nexthop has invalid gateway' >&2; exit 2")
            .await
            .unwrap_err();
        match err {
            OverlayError::KernelMutation { operation, message } => {
                assert_eq!(operation, "route replace");
                assert_eq!(message, "Nexthop has invalid gateway");
            }
            other => panic!("expected KernelMutation, got {:?}", other),
        }
        assert!(exec_mutation("link set up", "true").await.is_ok());
    }
}
