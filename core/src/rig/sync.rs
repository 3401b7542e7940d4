//! File synchronisation via rsync.
//!
//! A `SyncJob` describes one push or pull between a local path and a path on
//! a target. `build_rsync_args` turns it into an rsync argument vector; the
//! transfer itself runs through `RemoteShell::transfer`. rsync compares
//! content on both sides, so re-running the same job converges on the same
//! remote state and resumes partially sent files.

use serde::{Deserialize, Serialize};

use crate::rig::config::Target;


// ---------------------------------------------------------------------------
// SyncDirection / SyncJob
// ---------------------------------------------------------------------------

/// Whether a sync job pushes files to or pulls files from a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncDirection {
    /// Local -> Remote.
    Push,
    /// Remote -> Local.
    Pull,
}

/// Patterns excluded from every transfer unless a job clears them.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    ".git",
    "__pycache__",
    "*.pyc",
    "target/",
    "node_modules/",
];

/// A single file synchronisation operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncJob {
    pub direction: SyncDirection,
    /// Local filesystem path.
    pub local_path: String,
    /// Path on the target.
    pub remote_path: String,
    /// Glob patterns to exclude from the transfer.
    pub exclude_patterns: Vec<String>,
    /// Remove remote files that no longer exist locally (push only).
    pub mirror: bool,
}

impl SyncJob {
    /// A mirroring push of `local` into `remote`.
    pub fn push(local: &str, remote: &str) -> Self {
        SyncJob {
            direction: SyncDirection::Push,
            local_path: local.to_string(),
            remote_path: remote.to_string(),
            exclude_patterns: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            mirror: true,
        }
    }

    /// A pull of `remote` into `local`. Never deletes local files.
    pub fn pull(remote: &str, local: &str) -> Self {
        SyncJob {
            direction: SyncDirection::Pull,
            local_path: local.to_string(),
            remote_path: remote.to_string(),
            exclude_patterns: DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect(),
            mirror: false,
        }
    }

    /// Add exclusion patterns, skipping ones already present.
    pub fn exclude<I, S>(mut self, patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for p in patterns {
            let p = p.as_ref().to_string();
            if !self.exclude_patterns.contains(&p) {
                self.exclude_patterns.push(p);
            }
        }
        self
    }
}


// ---------------------------------------------------------------------------
// TransferReport
// ---------------------------------------------------------------------------

/// What a finished transfer reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReport {
    /// Bytes put on the wire, when the tool reported them.
    pub bytes_sent: Option<u64>,
}


// ---------------------------------------------------------------------------
// rsync argument building
// ---------------------------------------------------------------------------

/// Build the rsync argument vector for a job (without the `rsync` program).
pub fn build_rsync_args(job: &SyncJob, target: &Target, connect_timeout_secs: u64) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-az".to_string(),
        "--partial".to_string(),
        "--progress".to_string(),
        "--stats".to_string(),
    ];
    if job.mirror && job.direction == SyncDirection::Push {
        args.push("--delete".to_string());
    }

    // SSH transport with the same options as remote execution.
    let mut ssh_cmd = "ssh".to_string();
    let base = target.ssh_base_args(connect_timeout_secs);
    // Drop the trailing user@host; rsync puts it in the path spec.
    for arg in &base[..base.len() - 1] {
        ssh_cmd.push(' ');
        ssh_cmd.push_str(arg);
    }
    args.push("-e".to_string());
    args.push(ssh_cmd);

    for pattern in &job.exclude_patterns {
        args.push("--exclude".to_string());
        args.push(pattern.clone());
    }

    let remote_spec = format!(
        "{}:{}",
        target.user_at_host(),
        ensure_trailing_slash(&job.remote_path)
    );
    match job.direction {
        SyncDirection::Push => {
            args.push(ensure_trailing_slash(&job.local_path));
            args.push(remote_spec);
        }
        SyncDirection::Pull => {
            args.push(remote_spec);
            args.push(ensure_trailing_slash(&job.local_path));
        }
    }
    args
}

/// Extract the byte count from rsync's `--stats` or summary output.
///
/// Understands `Total bytes sent: 1,234` and `sent 1,234 bytes  received ...`.
pub fn parse_bytes_sent(output: &str) -> Option<u64> {
    for line in output.lines() {
        let line = line.trim();
        let rest = if let Some(r) = line.strip_prefix("Total bytes sent:") {
            r
        } else if let Some(r) = line.strip_prefix("sent ") {
            r.split_whitespace().next().unwrap_or("")
        } else {
            continue;
        };
        let digits: String = rest.chars().filter(|c| c.is_ascii_digit()).collect();
        if let Ok(n) = digits.parse::<u64>() {
            return Some(n);
        }
    }
    None
}

/// Ensure a path ends with `/` (rsync convention for syncing directory contents).
fn ensure_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{}/", path)
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rig::config::TargetKind;

    fn target() -> Target {
        Target {
            name: "controller".into(),
            kind: TargetKind::Edge,
            host: "10.0.0.1".into(),
            port: 2222,
            user: "root".into(),
            base_dir: "/data".into(),
            identity_file: Some("/keys/edge.pem".into()),
        }
    }

    #[test]
    fn push_args_mirror_and_order() {
        let job = SyncJob::push("/src/app", "/data/app");
        let args = build_rsync_args(&job, &target(), 10);
        assert!(args.contains(&"--delete".to_string()));
        assert!(args.contains(&"--partial".to_string()));
        let n = args.len();
        assert_eq!(args[n - 2], "/src/app/");
        assert_eq!(args[n - 1], "root@10.0.0.1:/data/app/");
    }

    #[test]
    fn pull_never_deletes_locally() {
        let job = SyncJob::pull("/data/out", "/tmp/out");
        let args = build_rsync_args(&job, &target(), 10);
        assert!(!args.contains(&"--delete".to_string()));
        let n = args.len();
        assert_eq!(args[n - 2], "root@10.0.0.1:/data/out/");
        assert_eq!(args[n - 1], "/tmp/out/");
    }

    #[test]
    fn ssh_transport_carries_port_and_key_but_not_host() {
        let args = build_rsync_args(&SyncJob::push("a", "b"), &target(), 7);
        let idx = args.iter().position(|a| a == "-e").unwrap();
        let ssh = &args[idx + 1];
        assert!(ssh.starts_with("ssh -p 2222"));
        assert!(ssh.contains("-i /keys/edge.pem"));
        assert!(ssh.contains("ConnectTimeout=7"));
        assert!(!ssh.contains("root@10.0.0.1"));
    }

    #[test]
    fn exclude_deduplicates() {
        let job = SyncJob::push("a", "b").exclude(["build/", ".git", "build/"]);
        let builds = job.exclude_patterns.iter().filter(|p| *p == "build/").count();
        let gits = job.exclude_patterns.iter().filter(|p| *p == ".git").count();
        assert_eq!(builds, 1);
        assert_eq!(gits, 1);
    }

    #[test]
    fn parse_bytes_sent_from_stats() {
        let out = "Number of files: 3\nTotal bytes sent: 12,345\nTotal bytes received: 35\n";
        assert_eq!(parse_bytes_sent(out), Some(12_345));
    }

    #[test]
    fn parse_bytes_sent_from_summary() {
        let out = "sent 1,024 bytes  received 35 bytes  2,118.00 bytes/sec\n";
        assert_eq!(parse_bytes_sent(out), Some(1_024));
    }

    #[test]
    fn parse_bytes_sent_absent() {
        assert_eq!(parse_bytes_sent("nothing here"), None);
    }
}
