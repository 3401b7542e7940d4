//! Uptime alerting for the billed build instance.
//!
//! An instance left running past `threshold_hours` triggers an alert, and
//! again every `interval_hours` after that.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::cloud::{InstanceDescription, InstanceState};

fn default_threshold() -> i64 {
    4
}

fn default_interval() -> i64 {
    2
}

/// When to warn about a long-running instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UptimeAlert {
    #[serde(default = "default_threshold")]
    pub threshold_hours: i64,
    #[serde(default = "default_interval")]
    pub interval_hours: i64,
}

impl Default for UptimeAlert {
    fn default() -> Self {
        UptimeAlert {
            threshold_hours: default_threshold(),
            interval_hours: default_interval(),
        }
    }
}

/// Whole hours between `launch` and `now`, truncated. Never negative.
pub fn uptime_hours(launch: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - launch).num_hours().max(0)
}

/// False below the threshold; at or past it, true on the threshold hour and
/// every `interval` hours after. An interval of zero alerts only once.
pub fn should_alert(uptime: i64, threshold: i64, interval: i64) -> bool {
    if uptime < threshold {
        return false;
    }
    let over = uptime - threshold;
    if interval <= 0 {
        return over == 0;
    }
    over % interval == 0
}

/// Uptime of a running instance. `None` when it is not running or the
/// provider reported no launch time.
pub fn running_hours(desc: &InstanceDescription, now: DateTime<Utc>) -> Option<i64> {
    if desc.state != InstanceState::Running {
        return None;
    }
    desc.launch_time.map(|t| uptime_hours(t, now))
}

/// A cost warning for the operator, if one is due.
///
/// Fires on the alert schedule, and also whenever the instance is past the
/// threshold with auto-stop off, since nothing will stop it.
pub fn cost_warning(
    desc: &InstanceDescription,
    now: DateTime<Utc>,
    alert: &UptimeAlert,
    auto_stop_enabled: bool,
) -> Option<String> {
    let hours = running_hours(desc, now)?;
    let scheduled = should_alert(hours, alert.threshold_hours, alert.interval_hours);
    let unattended = hours > alert.threshold_hours && !auto_stop_enabled;
    if scheduled || unattended {
        let hint = if auto_stop_enabled {
            ""
        } else {
            " and auto-stop is off"
        };
        Some(format!(
            "instance {} has been running for {}h{}",
            desc.id, hours, hint
        ))
    } else {
        None
    }
}
