//! Session controller: start, status, watch, tail and terminate one
//! well-known detached job per target.
//!
//! The remote session is the single source of truth for "is the job still
//! running". Its log file outliving the session is what distinguishes an
//! ended job from one that never started (or was terminated, which retires
//! the log).

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{OutpostError, Result};
use crate::infrastructure::runner::LineSink;
use crate::infrastructure::{SessionBackend, SessionLaunch};
use crate::rig::config::Target;
use crate::rig::remote::{ensure_reachable, RemoteShell};

use super::scan::scan_for_failure;
use super::watch::{follow_until_ended, CancelFlag, WatchConfig, WatchEndReason, WatchOutcome};


// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Observable state of the well-known session on a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SessionStatus {
    NotFound,
    Running,
    Ended,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            SessionStatus::NotFound => "not-found",
            SessionStatus::Running => "running",
            SessionStatus::Ended => "ended",
        })
    }
}

/// Name and log location of the job kind this controller manages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSpec {
    pub name: String,
    /// Log path; relative paths are taken under the target's base dir.
    pub log_file: String,
}

impl SessionSpec {
    pub fn new(name: &str, log_file: &str) -> Self {
        SessionSpec {
            name: name.to_string(),
            log_file: log_file.to_string(),
        }
    }

    pub fn log_path(&self, target: &Target) -> String {
        target.path(&self.log_file)
    }
}

/// A session as observed on one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub name: String,
    pub target: String,
    pub log_path: String,
    pub status: SessionStatus,
}

/// What `terminate` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminateOutcome {
    Terminated,
    NotRunning,
}


// ---------------------------------------------------------------------------
// SessionController
// ---------------------------------------------------------------------------

/// Runs one well-known job kind on targets through a `SessionBackend`.
///
/// Every operation probes the target first, so an unreachable target fails
/// with `Connectivity` before anything is changed.
pub struct SessionController {
    shell: Arc<dyn RemoteShell>,
    backend: Arc<dyn SessionBackend>,
    spec: SessionSpec,
    probe_timeout: Duration,
    watch: WatchConfig,
}

impl SessionController {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        backend: Arc<dyn SessionBackend>,
        spec: SessionSpec,
        probe_timeout: Duration,
        watch: WatchConfig,
    ) -> Self {
        SessionController {
            shell,
            backend,
            spec,
            probe_timeout,
            watch,
        }
    }

    fn probe(&self, target: &Target) -> Result<()> {
        ensure_reachable(self.shell.as_ref(), target, self.probe_timeout)
    }

    fn not_found(&self, target: &Target) -> OutpostError {
        OutpostError::SessionNotFound {
            session: self.spec.name.clone(),
            target: target.name.clone(),
        }
    }

    /// Launch `command` in the well-known detached session and return at
    /// once. Fails with `AlreadyRunning`, leaving the running session and
    /// its log alone, if the session exists.
    pub fn start(&self, target: &Target, command: &str) -> Result<Session> {
        self.probe(target)?;
        if self.backend.session_exists(target, &self.spec.name)? {
            return Err(OutpostError::AlreadyRunning {
                session: self.spec.name.clone(),
                target: target.name.clone(),
            });
        }
        let log_path = self.spec.log_path(target);
        self.backend.create_session(
            target,
            &SessionLaunch {
                name: self.spec.name.clone(),
                cwd: target.base_dir.clone(),
                command: command.to_string(),
                log_path: log_path.clone(),
            },
        )?;
        info!(remote = %target.name, session = %self.spec.name, log = %log_path, "session started");
        Ok(Session {
            name: self.spec.name.clone(),
            target: target.name.clone(),
            log_path,
            status: SessionStatus::Running,
        })
    }

    pub fn status(&self, target: &Target) -> Result<SessionStatus> {
        self.probe(target)?;
        self.observe(target)
    }

    fn observe(&self, target: &Target) -> Result<SessionStatus> {
        if self.backend.session_exists(target, &self.spec.name)? {
            return Ok(SessionStatus::Running);
        }
        if self.backend.log_exists(target, &self.spec.log_path(target))? {
            Ok(SessionStatus::Ended)
        } else {
            Ok(SessionStatus::NotFound)
        }
    }

    /// Stream the job log into `sink` until the session ends or `cancel`
    /// is raised.
    ///
    /// A session that already ended has its log tail replayed into the sink
    /// and is scanned at once. No session at all is `SessionNotFound`.
    pub fn watch(&self, target: &Target, mut sink: LineSink, cancel: &CancelFlag) -> Result<WatchOutcome> {
        self.probe(target)?;
        let log_path = self.spec.log_path(target);
        match self.observe(target)? {
            SessionStatus::NotFound => Err(self.not_found(target)),
            SessionStatus::Ended => {
                let tail = self.backend.tail_log(target, &log_path, self.watch.scan_window)?;
                let failure = scan_for_failure(&tail, self.watch.scan_window);
                for line in tail {
                    sink(line);
                }
                Ok(WatchOutcome {
                    reason: WatchEndReason::AlreadyEnded,
                    failure,
                })
            }
            SessionStatus::Running => follow_until_ended(
                self.backend.as_ref(),
                target,
                &self.spec.name,
                &log_path,
                &self.watch,
                sink,
                cancel,
            ),
        }
    }

    /// The last `lines` lines of the job log, without attaching.
    pub fn tail(&self, target: &Target, lines: usize) -> Result<Vec<String>> {
        self.probe(target)?;
        let log_path = self.spec.log_path(target);
        if !self.backend.log_exists(target, &log_path)? {
            return Err(self.not_found(target));
        }
        self.backend.tail_log(target, &log_path, lines)
    }

    /// Kill the session if present and retire its log. Idempotent.
    pub fn terminate(&self, target: &Target) -> Result<TerminateOutcome> {
        self.probe(target)?;
        let killed = self.backend.kill_session(target, &self.spec.name)?;
        self.backend.retire_log(target, &self.spec.log_path(target))?;
        if killed {
            info!(remote = %target.name, session = %self.spec.name, "session terminated");
            Ok(TerminateOutcome::Terminated)
        } else {
            Ok(TerminateOutcome::NotRunning)
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::FakeRemote;
    use crate::rig::config::TargetKind;
    use std::sync::Mutex;

    const LOG: &str = "/home/ubuntu/work/logs/build.log";

    fn target() -> Target {
        Target {
            name: "builder".into(),
            kind: TargetKind::Instance,
            host: "1.2.3.4".into(),
            port: 22,
            user: "ubuntu".into(),
            base_dir: "/home/ubuntu/work".into(),
            identity_file: None,
        }
    }

    fn controller(fake: &FakeRemote) -> SessionController {
        SessionController::new(
            Arc::new(fake.clone()),
            Arc::new(fake.clone()),
            SessionSpec::new("build", "logs/build.log"),
            Duration::from_secs(5),
            WatchConfig {
                poll_interval: Duration::from_millis(10),
                grace: Duration::from_millis(10),
                scan_window: 50,
            },
        )
    }

    fn null_sink() -> LineSink {
        Box::new(|_| {})
    }

    #[test]
    fn lifecycle_not_found_running_ended() {
        let fake = FakeRemote::new();
        let c = controller(&fake);
        assert_eq!(c.status(&target()).unwrap(), SessionStatus::NotFound);

        let session = c.start(&target(), "bitbake core-image-minimal").unwrap();
        assert_eq!(session.log_path, LOG);
        assert_eq!(c.status(&target()).unwrap(), SessionStatus::Running);

        fake.end_session("builder", "build");
        assert_eq!(c.status(&target()).unwrap(), SessionStatus::Ended);
    }

    #[test]
    fn second_start_is_rejected_and_log_untouched() {
        let fake = FakeRemote::new();
        let c = controller(&fake);
        c.start(&target(), "make").unwrap();
        fake.append_log("builder", LOG, "compiling 1/900");

        let err = c.start(&target(), "make").unwrap_err();
        assert!(matches!(err, OutpostError::AlreadyRunning { .. }));
        assert_eq!(fake.file("builder", LOG).unwrap(), vec!["compiling 1/900"]);
    }

    #[test]
    fn start_after_ended_truncates_log() {
        let fake = FakeRemote::new();
        let c = controller(&fake);
        c.start(&target(), "make").unwrap();
        fake.append_log("builder", LOG, "old run");
        fake.end_session("builder", "build");
        c.start(&target(), "make").unwrap();
        assert!(fake.file("builder", LOG).unwrap().is_empty());
    }

    #[test]
    fn terminate_is_idempotent_and_resets_status() {
        let fake = FakeRemote::new();
        let c = controller(&fake);
        c.start(&target(), "make").unwrap();
        assert_eq!(c.terminate(&target()).unwrap(), TerminateOutcome::Terminated);
        assert_eq!(c.status(&target()).unwrap(), SessionStatus::NotFound);
        assert_eq!(c.terminate(&target()).unwrap(), TerminateOutcome::NotRunning);
    }

    #[test]
    fn similarly_named_session_is_left_alone() {
        let fake = FakeRemote::new();
        fake.add_session("builder", "build-x");
        let c = controller(&fake);
        assert_eq!(c.status(&target()).unwrap(), SessionStatus::NotFound);
        assert_eq!(c.terminate(&target()).unwrap(), TerminateOutcome::NotRunning);
        assert!(fake.has_session("builder", "build-x"));
        c.start(&target(), "make").unwrap();
        assert!(fake.has_session("builder", "build"));
    }

    #[test]
    fn watch_without_session_fails() {
        let fake = FakeRemote::new();
        let c = controller(&fake);
        let err = c.watch(&target(), null_sink(), &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, OutpostError::SessionNotFound { .. }));
    }

    #[test]
    fn watch_after_end_replays_tail_and_scans() {
        let fake = FakeRemote::new();
        let c = controller(&fake);
        c.start(&target(), "make").unwrap();
        fake.append_log("builder", LOG, "building");
        fake.append_log("builder", LOG, "make: *** [all] Error 2");
        fake.end_session("builder", "build");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let inner = seen.clone();
        let outcome = c
            .watch(&target(), Box::new(move |l| inner.lock().unwrap().push(l)), &CancelFlag::new())
            .unwrap();
        assert_eq!(outcome.reason, WatchEndReason::AlreadyEnded);
        assert!(outcome.failure.is_some());
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn unreachable_target_fails_before_any_change() {
        let fake = FakeRemote::new();
        fake.set_reachable("builder", false);
        let c = controller(&fake);
        let err = c.start(&target(), "make").unwrap_err();
        assert!(matches!(err, OutpostError::Connectivity { .. }));
        assert!(fake.non_probe_calls().is_empty());
    }

    #[test]
    fn tail_requires_a_log() {
        let fake = FakeRemote::new();
        let c = controller(&fake);
        assert!(matches!(
            c.tail(&target(), 10),
            Err(OutpostError::SessionNotFound { .. })
        ));
        c.start(&target(), "make").unwrap();
        for i in 0..5 {
            fake.append_log("builder", LOG, &format!("line {}", i));
        }
        assert_eq!(c.tail(&target(), 2).unwrap(), vec!["line 3", "line 4"]);
    }
}
