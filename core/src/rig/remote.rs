//! Remote command execution.
//!
//! `RemoteShell` is the one seam through which every component touches a
//! target: liveness probes, synchronous commands, stdin-fed commands, local
//! pipelines into a remote command, rsync transfers, and long-lived output
//! streams. `SshExecutor` implements it by building ssh/rsync command lines
//! and handing them to a `CommandRunner`. It works the same whether the
//! target uses a permanent key or ambient short-lived credentials, since it
//! only passes `-i` when a key file is configured.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::error::{OutpostError, Result};
use crate::infrastructure::runner::{CommandOutput, CommandRunner, LineSink, StreamHandle};
use crate::infrastructure::tmux::shell_escape;
use crate::rig::config::Target;
use crate::rig::sync::{build_rsync_args, parse_bytes_sent, SyncJob, TransferReport};

/// Exit code ssh itself uses for connection-level failures.
const SSH_CONNECTION_FAILURE: i32 = 255;
/// rsync: error in the protocol data stream, typically a dropped transport.
const RSYNC_STREAM_ERROR: i32 = 12;


// ---------------------------------------------------------------------------
// RemoteShell
// ---------------------------------------------------------------------------

/// Execution and transfer against a resolved target.
pub trait RemoteShell: Send + Sync {
    /// Non-mutating liveness probe. Never blocks longer than `timeout`.
    fn reachable(&self, target: &Target, timeout: Duration) -> bool;

    /// Run `command` on the target and wait for it. A non-zero exit of the
    /// remote command is reported in the output, not as an error.
    fn run(&self, target: &Target, command: &str) -> Result<CommandOutput>;

    /// Like `run`, with `input` written to the remote command's stdin.
    fn run_with_input(&self, target: &Target, command: &str, input: &str) -> Result<CommandOutput>;

    /// Pipe the stdout of a local command into a remote command's stdin.
    fn pipe_from_local(
        &self,
        local_command: &str,
        target: &Target,
        remote_command: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput>;

    /// Bulk file synchronisation. Safe to re-run with the same job.
    fn transfer(
        &self,
        target: &Target,
        job: &SyncJob,
        progress: &mut dyn FnMut(&str),
    ) -> Result<TransferReport>;

    /// Start `command` on the target and deliver its stdout lines to `sink`
    /// until the handle is stopped.
    fn stream(&self, target: &Target, command: &str, sink: LineSink) -> Result<Box<dyn StreamHandle>>;
}

/// Probe `target` and turn a failed probe into `Connectivity`.
pub fn ensure_reachable(shell: &dyn RemoteShell, target: &Target, timeout: Duration) -> Result<()> {
    if shell.reachable(target, timeout) {
        Ok(())
    } else {
        Err(connectivity(
            target,
            &format!("no response to liveness probe within {}s", timeout.as_secs()),
        ))
    }
}

/// Run a command that must succeed; non-zero exit becomes `Remote`.
pub fn run_checked(shell: &dyn RemoteShell, target: &Target, command: &str) -> Result<String> {
    let out = shell.run(target, command)?;
    if out.success() {
        Ok(out.stdout)
    } else {
        Err(OutpostError::Remote {
            target: target.name.clone(),
            command: command.to_string(),
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

/// Build a `Connectivity` error carrying the target's coordinates.
pub fn connectivity(target: &Target, reason: &str) -> OutpostError {
    OutpostError::Connectivity {
        target: target.name.clone(),
        host: target.host.clone(),
        user: target.user.clone(),
        reason: reason.trim().to_string(),
    }
}


// ---------------------------------------------------------------------------
// SshExecutor
// ---------------------------------------------------------------------------

/// `RemoteShell` over the system `ssh` and `rsync` binaries.
pub struct SshExecutor {
    runner: Arc<dyn CommandRunner>,
    connect_timeout_secs: u64,
}

impl SshExecutor {
    pub fn new(runner: Arc<dyn CommandRunner>, connect_timeout_secs: u64) -> Self {
        SshExecutor {
            runner,
            connect_timeout_secs,
        }
    }

    /// The full local command line that runs `remote_command` on `target`.
    pub fn ssh_command(&self, target: &Target, remote_command: &str) -> String {
        let args: Vec<String> = target
            .ssh_base_args(self.connect_timeout_secs)
            .iter()
            .map(|a| shell_escape(a))
            .collect();
        format!("ssh {} {}", args.join(" "), shell_escape(remote_command))
    }

    fn classify(&self, target: &Target, result: std::result::Result<CommandOutput, String>) -> Result<CommandOutput> {
        match result {
            Err(e) => Err(connectivity(target, &e)),
            Ok(out) if out.exit_code == SSH_CONNECTION_FAILURE => {
                Err(connectivity(target, &out.stderr))
            }
            Ok(out) => Ok(out),
        }
    }
}

impl RemoteShell for SshExecutor {
    fn reachable(&self, target: &Target, timeout: Duration) -> bool {
        let cmd = self.ssh_command(target, "true");
        match self.runner.run_with_timeout(&cmd, timeout) {
            Ok(out) => out.success(),
            Err(e) => {
                debug!(remote = %target.name, error = %e, "liveness probe failed");
                false
            }
        }
    }

    fn run(&self, target: &Target, command: &str) -> Result<CommandOutput> {
        debug!(remote = %target.name, command, "remote run");
        let cmd = self.ssh_command(target, command);
        self.classify(target, self.runner.run(&cmd))
    }

    fn run_with_input(&self, target: &Target, command: &str, input: &str) -> Result<CommandOutput> {
        debug!(remote = %target.name, command, "remote run with stdin");
        let cmd = self.ssh_command(target, command);
        self.classify(target, self.runner.run_with_input(&cmd, input))
    }

    fn pipe_from_local(
        &self,
        local_command: &str,
        target: &Target,
        remote_command: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        debug!(remote = %target.name, local_command, remote_command, "pipe to remote");
        let cmd = format!(
            "{} | {}",
            local_command,
            self.ssh_command(target, remote_command)
        );
        self.classify(target, self.runner.run_streaming(&cmd, progress))
    }

    fn transfer(
        &self,
        target: &Target,
        job: &SyncJob,
        progress: &mut dyn FnMut(&str),
    ) -> Result<TransferReport> {
        let args: Vec<String> = build_rsync_args(job, target, self.connect_timeout_secs)
            .iter()
            .map(|a| shell_escape(a))
            .collect();
        let cmd = format!("rsync {}", args.join(" "));
        debug!(remote = %target.name, direction = ?job.direction, "rsync");
        let out = self
            .runner
            .run_streaming(&cmd, progress)
            .map_err(|e| connectivity(target, &e))?;
        match out.exit_code {
            0 => Ok(TransferReport {
                bytes_sent: parse_bytes_sent(&out.stdout),
            }),
            SSH_CONNECTION_FAILURE | RSYNC_STREAM_ERROR => Err(connectivity(target, &out.stderr)),
            code => Err(OutpostError::Remote {
                target: target.name.clone(),
                command: cmd,
                exit_code: code,
                stderr: out.stderr.trim().to_string(),
            }),
        }
    }

    fn stream(&self, target: &Target, command: &str, sink: LineSink) -> Result<Box<dyn StreamHandle>> {
        let cmd = self.ssh_command(target, command);
        self.runner
            .stream(&cmd, sink)
            .map_err(|e| connectivity(target, &e))
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
