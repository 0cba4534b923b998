//! `virsh`-backed hypervisor control.
//!
//! Each call shells out to `virsh -c <uri>` with a per-call timeout. The child
//! is killed if the timeout elapses.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

use crate::types::{DomainState, DomainStateInfo, DomainStats};
use crate::{Domain, HypervisorControl, HypervisorError, Result};

/// Configuration for [`VirshControl`].
#[derive(Debug, Clone)]
pub struct VirshConfig {
    /// Path or name of the `virsh` binary.
    pub binary: String,
    /// Connection URI passed with `-c`.
    pub uri: String,
    /// Upper bound for a single call.
    pub timeout: Duration,
}

impl Default for VirshConfig {
    fn default() -> Self {
        Self {
            binary: "virsh".to_string(),
            uri: "qemu:///system".to_string(),
            timeout: Duration::from_secs(30),
        }
    }
}

/// Hypervisor control through the `virsh` command line.
#[derive(Clone)]
pub struct VirshControl {
    config: Arc<VirshConfig>,
}

impl VirshControl {
    /// Create a new control handle.
    #[must_use]
    pub fn new(config: VirshConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// The connection URI.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.config.uri
    }

    /// Run one `virsh` subcommand about `identity` and return its stdout.
    async fn run(&self, identity: &str, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("-c")
            .arg(&self.config.uri)
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.timeout, cmd.output())
            .await
            .map_err(|_| HypervisorError::Timeout(self.config.timeout))?
            .map_err(|e| {
                HypervisorError::Connection(format!("failed to run {}: {e}", self.config.binary))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_failure(identity, stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

/// Arguments for `command` on one domain, with the identity never read as an option.
fn domain_args<'a>(command: &'a str, flags: &[&'a str], identity: &'a str) -> Vec<&'a str> {
    let mut args = vec![command];
    args.extend_from_slice(flags);
    if command == "domstats" {
        // domstats only takes a positional domain list.
        args.extend(["--", identity]);
    } else {
        args.extend(["--domain", identity]);
    }
    args
}

#[async_trait]
impl HypervisorControl for VirshControl {
    #[instrument(skip(self))]
    async fn lookup_by_identity(&self, identity: &str) -> Result<Arc<dyn Domain>> {
        let uuid = self.run(identity, &domain_args("domuuid", &[], identity)).await?;
        debug!(uuid = uuid.trim(), "domain found");

        Ok(Arc::new(VirshDomain {
            identity: identity.to_string(),
            control: self.clone(),
        }))
    }
}

/// A domain reached through [`VirshControl`].
struct VirshDomain {
    identity: String,
    control: VirshControl,
}

#[async_trait]
impl Domain for VirshDomain {
    fn identity(&self) -> &str {
        &self.identity
    }

    async fn state(&self) -> Result<DomainStateInfo> {
        let out = self
            .control
            .run(&self.identity, &domain_args("domstate", &["--reason"], &self.identity))
            .await?;
        parse_domstate(&out)
    }

    async fn xml_description(&self) -> Result<String> {
        self.control
            .run(&self.identity, &domain_args("dumpxml", &[], &self.identity))
            .await
    }

    async fn stats(&self) -> Result<DomainStats> {
        let out = self
            .control
            .run(
                &self.identity,
                &domain_args(
                    "domstats",
                    &["--cpu-total", "--balloon", "--vcpu", "--interface"],
                    &self.identity,
                ),
            )
            .await?;
        Ok(parse_domstats(&out))
    }
}

fn classify_failure(identity: &str, stderr: &str) -> HypervisorError {
    let lower = stderr.to_ascii_lowercase();
    if lower.contains("failed to get domain")
        || lower.contains("domain not found")
        || lower.contains("no domain with matching")
    {
        HypervisorError::DomainNotFound(identity.to_string())
    } else if lower.contains("failed to connect") {
        HypervisorError::Connection(stderr.to_string())
    } else {
        HypervisorError::Command(stderr.to_string())
    }
}

/// Parse `virsh domstate --reason` output such as `running (booted)`.
///
/// # Errors
///
/// Returns `HypervisorError::Parse` for unrecognized state text.
pub fn parse_domstate(output: &str) -> Result<DomainStateInfo> {
    let line = output.lines().map(str::trim).find(|l| !l.is_empty()).unwrap_or("");

    let (state_text, reason_text) = match line.split_once('(') {
        Some((state, rest)) => (state.trim(), rest.trim_end_matches(')').trim()),
        None => (line, ""),
    };

    let state = DomainState::from_virsh_text(state_text)
        .ok_or_else(|| HypervisorError::Parse(format!("unknown domain state: {line:?}")))?;

    Ok(DomainStateInfo::new(state, state.reason_code(reason_text)))
}

/// Parse `virsh domstats` key=value output into counters.
///
/// Missing fields are left at zero.
#[must_use]
pub fn parse_domstats(output: &str) -> DomainStats {
    let mut stats = DomainStats::default();
    let mut balloon_current = None;
    let mut balloon_maximum = None;
    let mut balloon_available = None;
    let mut balloon_unused = None;
    let mut balloon_rss = None;

    for line in output.lines() {
        let Some((key, value)) = line.trim().split_once('=') else {
            continue;
        };
        let Ok(value) = value.trim().parse::<u64>() else {
            continue;
        };

        match key {
            "cpu.time" => stats.cpu_time_ns = value,
            "vcpu.current" => stats.vcpus = u32::try_from(value).unwrap_or(u32::MAX),
            "balloon.current" => balloon_current = Some(value),
            "balloon.maximum" => balloon_maximum = Some(value),
            "balloon.available" => balloon_available = Some(value),
            "balloon.unused" => balloon_unused = Some(value),
            "balloon.rss" => balloon_rss = Some(value),
            _ if key.starts_with("net.") && key.ends_with(".rx.bytes") => {
                stats.net_rx_bytes = stats.net_rx_bytes.saturating_add(value);
            }
            _ if key.starts_with("net.") && key.ends_with(".tx.bytes") => {
                stats.net_tx_bytes = stats.net_tx_bytes.saturating_add(value);
            }
            _ => {}
        }
    }

    stats.memory_total_kib = balloon_current.or(balloon_maximum).unwrap_or(0);
    stats.memory_used_kib = match (balloon_available, balloon_unused) {
        (Some(available), Some(unused)) => available.saturating_sub(unused),
        _ => balloon_rss.unwrap_or(stats.memory_total_kib),
    };

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn domstate_with_reason() {
        let info = parse_domstate("running (booted)\n\n").unwrap();
        assert_eq!(info.state, DomainState::Running);
        assert_eq!(info.reason, 1);

        let info = parse_domstate("shut off (destroyed)\n").unwrap();
        assert_eq!(info.state, DomainState::Shutoff);
        assert_eq!(info.reason, 2);

        let info = parse_domstate("paused (user)").unwrap();
        assert_eq!(info.state, DomainState::Paused);
        assert_eq!(info.reason, 1);
    }

    #[test]
    fn domstate_without_reason() {
        let info = parse_domstate("crashed\n").unwrap();
        assert_eq!(info.state, DomainState::Crashed);
        assert_eq!(info.reason, 0);
    }

    #[test]
    fn domstate_garbage_is_parse_error() {
        assert!(matches!(
            parse_domstate("\n"),
            Err(HypervisorError::Parse(_))
        ));
        assert!(matches!(
            parse_domstate("melting (fast)"),
            Err(HypervisorError::Parse(_))
        ));
    }

    #[test]
    fn domstats_fields() {
        let out = "Domain: 'web-01'\n\
                   \x20 state.state=1\n\
                   \x20 cpu.time=5000000000\n\
                   \x20 vcpu.current=2\n\
                   \x20 balloon.current=2097152\n\
                   \x20 balloon.maximum=4194304\n\
                   \x20 balloon.available=2000000\n\
                   \x20 balloon.unused=500000\n\
                   \x20 net.count=2\n\
                   \x20 net.0.name=vnet0\n\
                   \x20 net.0.rx.bytes=1000\n\
                   \x20 net.0.tx.bytes=200\n\
                   \x20 net.1.rx.bytes=24\n\
                   \x20 net.1.tx.bytes=6\n";

        let stats = parse_domstats(out);
        assert_eq!(stats.cpu_time_ns, 5_000_000_000);
        assert_eq!(stats.vcpus, 2);
        assert_eq!(stats.memory_total_kib, 2_097_152);
        assert_eq!(stats.memory_used_kib, 1_500_000);
        assert_eq!(stats.net_rx_bytes, 1024);
        assert_eq!(stats.net_tx_bytes, 206);
    }

    #[test]
    fn domstats_memory_falls_back_to_rss() {
        let stats = parse_domstats("balloon.current=1024\nballoon.rss=512\n");
        assert_eq!(stats.memory_total_kib, 1024);
        assert_eq!(stats.memory_used_kib, 512);
    }

    #[test]
    fn classify_not_found() {
        let err = classify_failure(
            "web-01",
            "error: failed to get domain 'web-01'\nerror: Domain not found",
        );
        assert!(err.is_not_found());

        let err = classify_failure("x", "error: failed to connect to the hypervisor");
        assert!(matches!(err, HypervisorError::Connection(_)));
        assert!(err.is_retriable());

        let err = classify_failure("x", "error: operation failed");
        assert!(matches!(err, HypervisorError::Command(_)));
    }

    #[test]
    fn identity_is_never_an_option() {
        assert_eq!(
            domain_args("domstate", &["--reason"], "--help"),
            ["domstate", "--reason", "--domain", "--help"]
        );
        assert_eq!(domain_args("dumpxml", &[], "-x"), ["dumpxml", "--domain", "-x"]);
        assert_eq!(
            domain_args("domstats", &["--balloon"], "-web"),
            ["domstats", "--balloon", "--", "-web"]
        );
    }

    #[tokio::test]
    async fn missing_binary_is_connection_error() {
        let control = VirshControl::new(VirshConfig {
            binary: "/nonexistent/virsh-binary".to_string(),
            ..VirshConfig::default()
        });
        let err = control.lookup_by_identity("web-01").await.err().unwrap();
        assert!(matches!(err, HypervisorError::Connection(_)));
    }
}
