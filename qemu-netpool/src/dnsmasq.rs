//! DHCP/DNS for every leased network, served by a single supervised
//! `dnsmasq` child.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot};
use tracing::{error, trace, warn};

use crate::error::PoolError;
use crate::process;

const METADATA_HOST_RECORD: &str = "169.254.169.254";
const DHCP_LEASE_TIME: &str = "20m";

/// Render the single `dnsmasq` config covering every entry's interface and
/// DHCP range, piped to `dnsmasq --conf-file=-` on stdin.
pub(crate) fn render_config(entries: &[(String, String)]) -> String {
    let mut config = String::new();
    config.push_str("strict-order\n");
    config.push_str("bind-interfaces\n");
    config.push_str("except-interface=lo\n");
    config.push_str("dhcp-no-override\n");
    config.push_str(&format!("host-record=taskcluster,{METADATA_HOST_RECORD}\n"));
    config.push_str("keep-in-foreground\n");
    config.push_str("bogus-priv\n");
    config.push_str("domain-needed\n");

    for (tap, prefix) in entries {
        config.push_str(&format!("interface={tap}\n"));
        config.push_str(&format!(
            "dhcp-range=tag:{tap},{prefix}.2,{prefix}.254,255.255.255.0,{DHCP_LEASE_TIME}\n"
        ));
        config.push_str(&format!("dhcp-option=tag:{tap},option:router,{prefix}.1\n"));
    }

    config
}

/// Owns the `dnsmasq` child process and the task that awaits its exit.
pub(crate) struct DnsmasqSupervisor {
    /// `None` only for the test double that owns no real child.
    pid: Option<i32>,
    expected_exit: Arc<AtomicBool>,
    exited: Mutex<Option<oneshot::Receiver<()>>>,
}

impl DnsmasqSupervisor {
    pub async fn start(entries: &[(String, String)]) -> Result<Self, PoolError> {
        let config = render_config(entries);

        let mut child = Command::new("dnsmasq")
            .arg("--conf-file=-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PoolError::Setup(format!("failed to start dnsmasq: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::Setup("dnsmasq: child has no stdin".to_string()))?;
        stdin
            .write_all(config.as_bytes())
            .await
            .map_err(|e| PoolError::Setup(format!("failed to write dnsmasq config: {e}")))?;
        drop(stdin);

        let pid = child
            .id()
            .ok_or_else(|| PoolError::Setup("dnsmasq exited immediately after spawn".to_string()))?
            as i32;

        let stderr = child.stderr.take();
        if let Some(stderr) = stderr {
            tokio::spawn(forward_stderr(stderr));
        }

        let expected_exit = Arc::new(AtomicBool::new(false));
        let (exited_tx, exited_rx) = oneshot::channel();
        let flag = Arc::clone(&expected_exit);

        tokio::spawn(async move {
            let status = child.wait().await;
            let _ = exited_tx.send(());
            if !flag.load(Ordering::SeqCst) {
                error!(?status, "dnsmasq exited unexpectedly");
                panic!("dnsmasq exited unexpectedly: {status:?}");
            }
        });

        Ok(Self {
            pid: Some(pid),
            expected_exit,
            exited: Mutex::new(Some(exited_rx)),
        })
    }

    /// Mark the next exit as expected, kill the child, and wait for the
    /// supervisor task to observe it. No-op on the test double, which owns
    /// no real child.
    pub async fn kill_and_wait(&self) {
        self.expected_exit.store(true, Ordering::SeqCst);
        if let Some(pid) = self.pid {
            if let Err(e) = process::kill(pid) {
                warn!(pid, error = %e, "failed to signal dnsmasq, it may already be gone");
            }
        }
        if let Some(rx) = self.exited.lock().await.take() {
            let _ = rx.await;
        }
    }
}

#[cfg(test)]
impl DnsmasqSupervisor {
    /// A supervisor that owns no real child, for tests exercising pool
    /// provisioning logic without a real `dnsmasq` binary available.
    pub(crate) fn noop_for_test() -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(());
        Self {
            pid: None,
            expected_exit: Arc::new(AtomicBool::new(true)),
            exited: Mutex::new(Some(rx)),
        }
    }
}

async fn forward_stderr(stderr: tokio::process::ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => warn!(target: "dnsmasq", "{line}"),
            Ok(None) => break,
            Err(e) => {
                trace!(error = %e, "dnsmasq stderr pipe closed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_config_includes_global_directives() {
        let config = render_config(&[]);
        assert!(config.contains("strict-order"));
        assert!(config.contains("except-interface=lo"));
        assert!(config.contains("host-record=taskcluster,169.254.169.254"));
        assert!(config.contains("keep-in-foreground"));
    }

    #[test]
    fn render_config_empty_pool_has_no_interfaces() {
        let config = render_config(&[]);
        assert!(!config.contains("interface="));
        assert!(!config.contains("dhcp-range="));
    }

    #[test]
    fn render_config_emits_one_block_per_entry() {
        let entries = vec![
            ("tctap0".to_string(), "192.168.150".to_string()),
            ("tctap1".to_string(), "192.168.151".to_string()),
        ];
        let config = render_config(&entries);
        assert!(config.contains("interface=tctap0"));
        assert!(config.contains("interface=tctap1"));
        assert!(config.contains("dhcp-range=tag:tctap0,192.168.150.2,192.168.150.254,255.255.255.0,20m"));
        assert!(config.contains("dhcp-option=tag:tctap1,option:router,192.168.151.1"));
    }
}
