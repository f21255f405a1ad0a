//! Privileged command execution.
//!
//! Every mutation of host kernel state (TAP devices, routes, iptables
//! rules, sysctl) goes through [`exec`] so that a failing command is
//! observable with its own stderr rather than folded into a generic I/O
//! error. [`ShellRunner`] exists so the pool's construction/teardown logic
//! can be exercised in tests without a real privileged host.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::trace;

/// A command that failed, carrying enough context to act on without
/// re-running it.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}\n{detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// Whether a command should be re-invoked through `sudo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    Sudo,
    User,
}

fn format_command_display(program: &str, args: &[&str], privilege: Privilege) -> String {
    let mut parts = Vec::with_capacity(args.len() + 2);
    if privilege == Privilege::Sudo {
        parts.push("sudo");
    }
    parts.push(program);
    parts.extend_from_slice(args);
    parts.join(" ")
}

/// Run one command to completion, returning its trimmed stdout on success.
pub async fn exec(program: &str, args: &[&str], privilege: Privilege) -> Result<String, CommandError> {
    let display = format_command_display(program, args, privilege);
    trace!(command = %display, "exec");

    let output = match privilege {
        Privilege::Sudo => {
            let mut full_args = Vec::with_capacity(args.len() + 1);
            full_args.push(program);
            full_args.extend_from_slice(args);
            Command::new("sudo").args(&full_args).output().await
        }
        Privilege::User => Command::new(program).args(args).output().await,
    };

    let output = output.map_err(|e| CommandError {
        command: display.clone(),
        detail: e.to_string(),
    })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: display,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Run an ordered sequence of full argument vectors (`command[0]` is the
/// program, the rest its arguments), aborting on the first failure.
pub async fn run_script(commands: &[Vec<String>], privilege: Privilege) -> Result<(), CommandError> {
    for command in commands {
        let (program, args) = command.split_first().ok_or_else(|| CommandError {
            command: String::new(),
            detail: "empty command in script".to_string(),
        })?;
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        exec(program, &arg_refs, privilege).await?;
    }
    Ok(())
}

/// Run an ordered sequence of full argument vectors, continuing past
/// failures and collecting all of them instead of aborting on the first.
pub async fn run_best_effort(commands: &[Vec<String>], privilege: Privilege) -> Vec<CommandError> {
    let mut errors = Vec::new();
    for command in commands {
        let Some((program, args)) = command.split_first() else {
            continue;
        };
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        if let Err(e) = exec(program, &arg_refs, privilege).await {
            errors.push(e);
        }
    }
    errors
}

/// Seam between the pool and the host shell, so pool construction/teardown
/// can be driven by a fake in tests.
#[async_trait]
pub(crate) trait ShellRunner: Send + Sync {
    async fn run_script(&self, commands: &[Vec<String>], privilege: Privilege) -> Result<(), CommandError>;
    async fn run_best_effort(&self, commands: &[Vec<String>], privilege: Privilege) -> Vec<CommandError>;
}

pub(crate) struct RealRunner;

#[async_trait]
impl ShellRunner for RealRunner {
    async fn run_script(&self, commands: &[Vec<String>], privilege: Privilege) -> Result<(), CommandError> {
        run_script(commands, privilege).await
    }

    async fn run_best_effort(&self, commands: &[Vec<String>], privilege: Privilege) -> Vec<CommandError> {
        run_best_effort(commands, privilege).await
    }
}
