//! Host capability checks run before a pool touches any kernel state.

use crate::command::{Privilege, ShellRunner};
use crate::entry::MAX_ENTRIES;
use crate::error::PoolError;

const REQUIRED_COMMANDS: &[&str] = &["ip", "iptables", "iptables-save", "sysctl", "dnsmasq"];

/// Verify every external command the pool needs is on `PATH`, that
/// privileged commands can actually run, and that the requested pool size
/// is within the hard cap, aggregating every failure instead of stopping at
/// the first.
pub(crate) async fn check_prerequisites(runner: &dyn ShellRunner, size: usize) -> Result<(), PoolError> {
    let mut errors = Vec::new();

    if size > MAX_ENTRIES {
        errors.push(format!("pool size {size} exceeds the maximum of {MAX_ENTRIES}"));
    }

    for command in REQUIRED_COMMANDS {
        if which::which(command).is_err() {
            errors.push(format!("required command not found on PATH: {command}"));
        }
    }

    let sudo_check = vec![vec![
        "sudo".to_string(),
        "-n".to_string(),
        "true".to_string(),
    ]];
    if runner.run_script(&sudo_check, Privilege::User).await.is_err() {
        errors.push("passwordless sudo access is required for network configuration".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(PoolError::Unavailable(errors.join("; ")))
    }
}
