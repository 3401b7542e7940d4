//! Target health snapshot.
//!
//! One remote command collects uptime, disk usage of the base directory and
//! the number of running containers. Each field is parsed independently; a
//! field whose section cannot be parsed is reported as `None` instead of
//! failing the whole check.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::infrastructure::tmux::shell_escape;
use crate::rig::config::Target;
use crate::rig::remote::{run_checked, RemoteShell};

const SECTION_MARK: &str = "--outpost--";

/// Disk usage at or above this percentage is flagged.
pub const DISK_PRESSURE_PERCENT: u8 = 90;

/// What a health check observed on a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetHealth {
    pub target: String,
    pub uptime_seconds: Option<u64>,
    /// Use% of the filesystem holding the base directory.
    pub disk_percent: Option<u8>,
    pub containers_running: Option<u32>,
}

impl TargetHealth {
    /// Human-readable problems worth an operator's attention.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        match self.disk_percent {
            Some(p) if p >= DISK_PRESSURE_PERCENT => {
                out.push(format!("disk {}% full on {}", p, self.target))
            }
            None => out.push("disk usage unavailable".to_string()),
            _ => {}
        }
        if self.uptime_seconds.is_none() {
            out.push("uptime unavailable".to_string());
        }
        if self.containers_running.is_none() {
            out.push("container runtime not answering".to_string());
        }
        out
    }
}

/// Printed in the container section when `docker ps` itself fails.
const DOCKER_UNAVAILABLE: &str = "unavailable";

/// The remote command that gathers all three sections. The container count
/// is only printed when `docker ps` succeeds.
pub fn health_command(target: &Target) -> String {
    format!(
        "cat /proc/uptime; echo {m}; df -P {dir} | tail -n 1; echo {m}; \
         if ids=$(docker ps -q 2>/dev/null); then printf '%s\\n' \"$ids\" | sed '/^$/d' | wc -l; \
         else echo {none}; fi",
        none = DOCKER_UNAVAILABLE,
        m = SECTION_MARK,
        dir = shell_escape(&target.base_dir),
    )
}

/// Run the health command on `target` and parse its output.
pub fn check(shell: &dyn RemoteShell, target: &Target) -> Result<TargetHealth> {
    let stdout = run_checked(shell, target, &health_command(target))?;
    Ok(parse_health(&target.name, &stdout))
}

/// Parse the three marker-separated sections of `health_command` output.
pub fn parse_health(target: &str, output: &str) -> TargetHealth {
    let mut sections = output.split(SECTION_MARK).map(str::trim);
    let uptime = sections.next().unwrap_or("");
    let disk = sections.next().unwrap_or("");
    let containers = sections.next().unwrap_or("");

    TargetHealth {
        target: target.to_string(),
        uptime_seconds: parse_uptime(uptime),
        disk_percent: parse_disk_percent(disk),
        containers_running: containers.lines().last().and_then(|l| l.trim().parse().ok()),
    }
}

fn parse_uptime(section: &str) -> Option<u64> {
    let first = section.split_whitespace().next()?;
    let secs: f64 = first.parse().ok()?;
    if secs.is_finite() && secs >= 0.0 {
        Some(secs as u64)
    } else {
        None
    }
}

fn parse_disk_percent(section: &str) -> Option<u8> {
    // df -P columns: Filesystem 1024-blocks Used Available Capacity Mounted-on
    let line = section.lines().last()?;
    let field = line.split_whitespace().nth(4)?;
    field.strip_suffix('%')?.parse().ok()
}
