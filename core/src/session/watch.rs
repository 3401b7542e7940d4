//! Attaching to a running session.
//!
//! Two activities run side by side: a follower streams the job log to the
//! caller's sink on its own thread, while the calling thread polls whether
//! the session still exists. The poller owns the follower's stream handle
//! and is the only side that stops it: once the session is gone it waits
//! out the grace period so buffered output drains, stops the follower, and
//! scans the log tail for failure tokens.
//!
//! Cancellation stops local streaming only; the remote job is untouched.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::Result;
use crate::infrastructure::runner::LineSink;
use crate::infrastructure::SessionBackend;
use crate::rig::config::Target;

use super::scan::{scan_for_failure, BuildFailure, DEFAULT_SCAN_WINDOW};

/// Longest uninterrupted sleep while waiting, so cancellation is noticed
/// promptly even with long poll intervals.
const CANCEL_CHECK: Duration = Duration::from_millis(50);


// ---------------------------------------------------------------------------
// Configuration and results
// ---------------------------------------------------------------------------

/// Timing of a watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchConfig {
    /// How often session existence is checked.
    pub poll_interval: Duration,
    /// How long the log keeps streaming after the session is gone.
    pub grace: Duration,
    /// Trailing lines scanned for failure tokens.
    pub scan_window: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            poll_interval: Duration::from_secs(2),
            grace: Duration::from_secs(1),
            scan_window: DEFAULT_SCAN_WINDOW,
        }
    }
}

/// Shared flag that detaches a watch. Clones share the flag.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Why a watch returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WatchEndReason {
    /// The session ended while being watched.
    Ended,
    /// The session had already ended when the watch began.
    AlreadyEnded,
    /// The caller detached; the job may still be running.
    Cancelled,
}

/// Result of a watch. `failure` is only ever set for ended sessions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchOutcome {
    pub reason: WatchEndReason,
    pub failure: Option<BuildFailure>,
}

impl WatchOutcome {
    /// Whether the watched job is known to be finished.
    pub fn session_ended(&self) -> bool {
        self.reason != WatchEndReason::Cancelled
    }
}


// ---------------------------------------------------------------------------
// Watch loop
// ---------------------------------------------------------------------------

/// Sleep up to `total`, returning early (with `true`) if cancelled.
fn sleep_unless_cancelled(total: Duration, cancel: &CancelFlag) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return true;
        }
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        thread::sleep((deadline - now).min(CANCEL_CHECK));
    }
}

/// Follow `log_path` into `sink` until session `name` disappears or the
/// watch is cancelled. The session must exist when this is called.
pub fn follow_until_ended(
    backend: &dyn SessionBackend,
    target: &Target,
    name: &str,
    log_path: &str,
    config: &WatchConfig,
    sink: LineSink,
    cancel: &CancelFlag,
) -> Result<WatchOutcome> {
    let follower = backend.follow_log(target, log_path, sink)?;
    debug!(remote = %target.name, session = name, "following log");

    loop {
        if sleep_unless_cancelled(config.poll_interval, cancel) {
            follower.stop();
            info!(remote = %target.name, session = name, "watch detached; job left running");
            return Ok(WatchOutcome {
                reason: WatchEndReason::Cancelled,
                failure: None,
            });
        }
        match backend.session_exists(target, name) {
            Ok(true) => continue,
            Ok(false) => break,
            Err(e) => {
                follower.stop();
                return Err(e);
            }
        }
    }

    info!(remote = %target.name, session = name, "session ended");
    thread::sleep(config.grace);
    follower.stop();

    let tail = backend.tail_log(target, log_path, config.scan_window)?;
    Ok(WatchOutcome {
        reason: WatchEndReason::Ended,
        failure: scan_for_failure(&tail, config.scan_window),
    })
}
