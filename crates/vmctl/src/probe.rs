//! Network (ICMP) and application (SSH) reachability probes.
//!
//! Ping and SSH are separate stages: a host often answers ping well before
//! its SSH daemon accepts sessions.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::VmError;
use crate::runner::{CommandLine, CommandOutput, CommandRunner};

/// Interval between ping polls.
pub const PING_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between SSH attempts.
pub const SSH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Per-attempt SSH connection timeout, in seconds.
const SSH_CONNECT_TIMEOUT_SECS: u32 = 2;

/// Where and as whom to SSH.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    /// Address.
    pub ip: String,
    /// Login user.
    pub user: String,
    /// Private key file, if any.
    pub key_file: Option<String>,
}

impl SshTarget {
    fn base_command(&self) -> CommandLine {
        let cmd = CommandLine::new("ssh");
        let cmd = match &self.key_file {
            Some(key) => cmd.opt("-i", key.clone()),
            None => cmd,
        };
        cmd.arg(format!("{}@{}", self.user, self.ip))
    }
}

/// Reachability checks used by the lifecycle controller.
#[async_trait]
pub trait Reachability: Send + Sync {
    /// Single ICMP echo with a ~1s timeout.
    async fn ping(&self, ip: &str) -> Result<bool, VmError>;

    /// Poll until ping reachability equals `desired`.
    async fn wait_for_ping_state(
        &self,
        ip: &str,
        desired: bool,
        timeout: Duration,
    ) -> Result<(), VmError>;

    /// Poll by running `probe_command` remotely until it succeeds.
    async fn wait_for_ssh(
        &self,
        target: &SshTarget,
        probe_command: &str,
        timeout: Duration,
    ) -> Result<(), VmError>;

    /// Run a remote command, capturing its output.
    async fn ssh(&self, target: &SshTarget, argv: &[String]) -> Result<CommandOutput, VmError>;

    /// Open an interactive session, returning the exit code.
    async fn ssh_interactive(&self, target: &SshTarget) -> Result<i32, VmError>;

    /// Multi-echo ping for the `ping` command.
    async fn ping_report(&self, ip: &str) -> Result<CommandOutput, VmError>;

    /// Forget the host key recorded for `ip`.
    async fn remove_known_host(&self, ip: &str);
}

/// [`Reachability`] implemented with the system `ping`, `ssh` and `ssh-keygen`.
#[derive(Clone)]
pub struct Probe {
    runner: Arc<dyn CommandRunner>,
    ping_interval: Duration,
    ssh_interval: Duration,
}

impl Probe {
    /// Create a probe running commands through `runner`.
    #[must_use]
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            ping_interval: PING_POLL_INTERVAL,
            ssh_interval: SSH_POLL_INTERVAL,
        }
    }
}

#[async_trait]
impl Reachability for Probe {
    async fn ping(&self, ip: &str) -> Result<bool, VmError> {
        let cmd = CommandLine::new("ping").args(["-c", "1", "-W", "1"]).arg(ip);
        Ok(self.runner.run(&cmd).await?.success())
    }

    async fn wait_for_ping_state(
        &self,
        ip: &str,
        desired: bool,
        timeout: Duration,
    ) -> Result<(), VmError> {
        let operation = if desired {
            format!("{ip} to answer ping")
        } else {
            format!("{ip} to stop answering ping")
        };
        let start = Instant::now();
        let deadline = start + timeout;

        loop {
            let reachable = self.ping(ip).await?;
            debug!(ip, reachable, desired, elapsed_ms = start.elapsed().as_millis(), "Ping poll");
            if reachable == desired {
                return Ok(());
            }
            if Instant::now() >= deadline {
                warn!(ip, desired, "Ping wait timed out");
                return Err(VmError::Timeout {
                    operation,
                    elapsed_secs: start.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.ping_interval).await;
        }
    }

    async fn wait_for_ssh(
        &self,
        target: &SshTarget,
        probe_command: &str,
        timeout: Duration,
    ) -> Result<(), VmError> {
        // Host key prompts are suppressed for this probe only.
        let cmd = CommandLine::new("ssh")
            .opt("-o", "StrictHostKeyChecking=no")
            .opt("-o", format!("ConnectTimeout={SSH_CONNECT_TIMEOUT_SECS}"))
            .opt("-o", "BatchMode=yes");
        let cmd = match &target.key_file {
            Some(key) => cmd.opt("-i", key.clone()),
            None => cmd,
        };
        let cmd = cmd
            .arg(format!("{}@{}", target.user, target.ip))
            .arg(probe_command);

        let start = Instant::now();
        let deadline = start + timeout;
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            let output = self.runner.run(&cmd).await?;
            if output.success() {
                info!(ip = %target.ip, attempts, "SSH is available");
                return Ok(());
            }
            debug!(ip = %target.ip, attempts, code = output.code, "Waiting for SSH");
            if Instant::now() >= deadline {
                warn!(ip = %target.ip, attempts, stderr = %output.stderr.trim(), "SSH wait timed out");
                return Err(VmError::Timeout {
                    operation: format!("SSH on {}", target.ip),
                    elapsed_secs: start.elapsed().as_secs(),
                });
            }
            tokio::time::sleep(self.ssh_interval).await;
        }
    }

    async fn ssh(&self, target: &SshTarget, argv: &[String]) -> Result<CommandOutput, VmError> {
        let cmd = target.base_command().args(argv.iter().cloned());
        self.runner.run(&cmd).await
    }

    async fn ssh_interactive(&self, target: &SshTarget) -> Result<i32, VmError> {
        self.runner.run_interactive(&target.base_command()).await
    }

    async fn ping_report(&self, ip: &str) -> Result<CommandOutput, VmError> {
        let cmd = CommandLine::new("ping").args(["-c", "3", "-W", "3"]).arg(ip);
        self.runner.run(&cmd).await
    }

    async fn remove_known_host(&self, ip: &str) {
        let cmd = CommandLine::new("ssh-keygen").opt("-R", ip);
        match self.runner.run(&cmd).await {
            Ok(output) if output.success() => debug!(ip, "Removed known_hosts entry"),
            Ok(output) => debug!(ip, code = output.code, "No known_hosts entry removed"),
            Err(e) => warn!(ip, error = %e, "Could not run ssh-keygen"),
        }
    }
}
