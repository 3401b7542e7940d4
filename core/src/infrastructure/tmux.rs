//! Tmux command builder and the production `SessionBackend`.
//!
//! `TmuxCommandBuilder` builds tmux CLI command strings without executing
//! them. `TmuxBackend` sends those strings to a target through a
//! `RemoteShell`, so the job runs inside a detached tmux session on the
//! remote host and outlives the ssh connection that started it.

use std::sync::Arc;

use tracing::debug;

use crate::error::{OutpostError, Result};
use crate::infrastructure::runner::{LineSink, StreamHandle};
use crate::rig::config::Target;
use crate::rig::remote::RemoteShell;

use super::{SessionBackend, SessionLaunch};


// ---------------------------------------------------------------------------
// Command builder
// ---------------------------------------------------------------------------

/// Builds tmux CLI command strings without executing them.
pub struct TmuxCommandBuilder;

impl TmuxCommandBuilder {
    pub fn new() -> Self {
        TmuxCommandBuilder
    }

    /// `tmux has-session -t =<name>`; exit 0 when the session exists.
    pub fn has_session(&self, name: &str) -> String {
        format!("tmux has-session -t {} 2>/dev/null", exact_target(name))
    }

    /// `tmux new-session -d -s <name> -c <cwd> <job>` where the job runs
    /// `command` with stdout and stderr written to `log_path`. The log is
    /// truncated by the job itself, so a refused launch leaves it intact.
    pub fn new_detached(&self, launch: &SessionLaunch) -> String {
        let job = format!(
            "( {} ) > {} 2>&1",
            launch.command,
            shell_escape(&launch.log_path)
        );
        format!(
            "tmux new-session -d -s {} -c {} {}",
            shell_escape(&launch.name),
            shell_escape(&launch.cwd),
            shell_escape(&job)
        )
    }

    /// `tmux kill-session -t =<name>`
    pub fn kill_session(&self, name: &str) -> String {
        format!("tmux kill-session -t {}", exact_target(name))
    }
}

/// Target spec matching only the session named exactly `name`. A bare name
/// lets tmux fall back to a prefix match.
fn exact_target(name: &str) -> String {
    shell_escape(&format!("={}", name))
}

impl Default for TmuxCommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}


// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

/// Whether tmux stderr says the session (or the whole server) is absent.
pub fn is_missing_session(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("can't find session")
        || lower.contains("session not found")
        || lower.contains("no server running")
        || lower.contains("error connecting to")
}

/// Whether tmux refused `new-session` because the name is taken.
pub fn is_duplicate_session(stderr: &str) -> bool {
    stderr.to_ascii_lowercase().contains("duplicate session")
}


// ---------------------------------------------------------------------------
// Shell escaping
// ---------------------------------------------------------------------------

/// Escape a string for safe use in a shell command.
///
/// Wraps the value in single quotes and escapes any embedded single quotes
/// using the `'\''` idiom.
pub fn shell_escape(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(|c| {
        c.is_ascii_alphanumeric()
            || c == '-'
            || c == '_'
            || c == '.'
            || c == '/'
            || c == '%'
            || c == ':'
            || c == '@'
            || c == '='
            || c == ','
    }) {
        return s.to_string();
    }
    let escaped = s.replace('\'', "'\\''");
    format!("'{}'", escaped)
}


// ---------------------------------------------------------------------------
// TmuxBackend (SessionBackend implementation)
// ---------------------------------------------------------------------------

/// A `SessionBackend` that drives tmux and the job log on a remote target.
pub struct TmuxBackend {
    builder: TmuxCommandBuilder,
    shell: Arc<dyn RemoteShell>,
}

impl TmuxBackend {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        TmuxBackend {
            builder: TmuxCommandBuilder::new(),
            shell,
        }
    }

    fn require_success(&self, target: &Target, command: &str) -> Result<String> {
        let out = self.shell.run(target, command)?;
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
}

impl SessionBackend for TmuxBackend {
    fn session_exists(&self, target: &Target, name: &str) -> Result<bool> {
        let out = self.shell.run(target, &self.builder.has_session(name))?;
        Ok(out.success())
    }

    fn create_session(&self, target: &Target, launch: &SessionLaunch) -> Result<()> {
        let log_dir = parent_dir(&launch.log_path);
        let cmd = format!(
            "mkdir -p {} && {}",
            shell_escape(log_dir),
            self.builder.new_detached(launch)
        );
        let out = self.shell.run(target, &cmd)?;
        if out.success() {
            return Ok(());
        }
        if is_duplicate_session(&out.stderr) {
            return Err(OutpostError::AlreadyRunning {
                session: launch.name.clone(),
                target: target.name.clone(),
            });
        }
        Err(OutpostError::Remote {
            target: target.name.clone(),
            command: cmd,
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        })
    }

    fn kill_session(&self, target: &Target, name: &str) -> Result<bool> {
        let cmd = self.builder.kill_session(name);
        let out = self.shell.run(target, &cmd)?;
        if out.success() {
            return Ok(true);
        }
        if is_missing_session(&out.stderr) {
            debug!(remote = %target.name, session = name, "kill-session: no such session");
            return Ok(false);
        }
        Err(OutpostError::Remote {
            target: target.name.clone(),
            command: cmd,
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        })
    }

    fn log_exists(&self, target: &Target, path: &str) -> Result<bool> {
        let out = self
            .shell
            .run(target, &format!("test -f {}", shell_escape(path)))?;
        Ok(out.success())
    }

    fn tail_log(&self, target: &Target, path: &str, lines: usize) -> Result<Vec<String>> {
        let out = self.require_success(
            target,
            &format!("tail -n {} {}", lines, shell_escape(path)),
        )?;
        Ok(out.lines().map(|l| l.to_string()).collect())
    }

    fn follow_log(
        &self,
        target: &Target,
        path: &str,
        sink: LineSink,
    ) -> Result<Box<dyn StreamHandle>> {
        // -F keeps following across truncation and re-creation of the log.
        let cmd = format!("tail -n +1 -F {} 2>/dev/null", shell_escape(path));
        self.shell.stream(target, &cmd, sink)
    }

    fn retire_log(&self, target: &Target, path: &str) -> Result<()> {
        let p = shell_escape(path);
        let prev = shell_escape(&format!("{}.prev", path));
        self.require_success(
            target,
            &format!("if [ -f {p} ]; then mv -f {p} {prev}; fi"),
        )?;
        Ok(())
    }
}

fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(idx) => &path[..idx],
        None => ".",
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::runner::{CommandOutput, MockRunner};
    use crate::rig::config::TargetKind;
    use crate::rig::remote::SshExecutor;

    fn target() -> Target {
        Target {
            name: "builder".into(),
            kind: TargetKind::Instance,
            host: "3.14.15.92".into(),
            port: 22,
            user: "ubuntu".into(),
            base_dir: "/home/ubuntu/work".into(),
            identity_file: None,
        }
    }

    fn backend(responses: Vec<std::result::Result<CommandOutput, String>>) -> (TmuxBackend, Arc<MockRunner>) {
        let runner = Arc::new(MockRunner::with_responses(responses));
        let shell = Arc::new(SshExecutor::new(runner.clone(), 10));
        (TmuxBackend::new(shell), runner)
    }

    #[test]
    fn shell_escape_bare_and_quoted() {
        assert_eq!(shell_escape("build"), "build");
        assert_eq!(shell_escape("/home/ubuntu/work"), "/home/ubuntu/work");
        assert_eq!(shell_escape("make all"), "'make all'");
        assert_eq!(shell_escape("it's"), "'it'\\''s'");
        assert_eq!(shell_escape(""), "''");
    }

    #[test]
    fn new_detached_redirects_into_log() {
        let builder = TmuxCommandBuilder::new();
        let cmd = builder.new_detached(&SessionLaunch {
            name: "build".into(),
            cwd: "/work".into(),
            command: "bitbake core-image".into(),
            log_path: "/work/build.log".into(),
        });
        assert!(cmd.starts_with("tmux new-session -d -s build -c /work "));
        assert!(cmd.contains("bitbake core-image"));
        assert!(cmd.contains(") > /work/build.log 2>&1"));
        assert!(!cmd.contains(">>"));
    }

    #[test]
    fn session_targets_match_exact_name() {
        let builder = TmuxCommandBuilder::new();
        assert_eq!(builder.has_session("build"), "tmux has-session -t =build 2>/dev/null");
        assert_eq!(builder.kill_session("build"), "tmux kill-session -t =build");
        assert_eq!(builder.kill_session("my build"), "tmux kill-session -t '=my build'");
    }

    #[test]
    fn only_longer_named_session_is_not_ours() {
        // With only `build-x` on the server, `-t =build` matches nothing.
        let (b, runner) = backend(vec![
            Ok(CommandOutput::failed(1, "")),
            Ok(CommandOutput::failed(1, "can't find session: =build")),
        ]);
        assert!(!b.session_exists(&target(), "build").unwrap());
        assert!(!b.kill_session(&target(), "build").unwrap());
        let cmds = runner.executed_commands();
        assert!(cmds[0].contains("has-session -t =build"));
        assert!(cmds[1].contains("kill-session -t =build"));
    }

    #[test]
    fn session_exists_maps_exit_code() {
        let (b, _) = backend(vec![
            Ok(CommandOutput::ok("")),
            Ok(CommandOutput::failed(1, "")),
        ]);
        assert!(b.session_exists(&target(), "build").unwrap());
        assert!(!b.session_exists(&target(), "build").unwrap());
    }

    #[test]
    fn kill_missing_session_is_not_an_error() {
        let (b, _) = backend(vec![Ok(CommandOutput::failed(1, "can't find session: build"))]);
        assert!(!b.kill_session(&target(), "build").unwrap());
    }

    #[test]
    fn kill_other_failure_surfaces() {
        let (b, _) = backend(vec![Ok(CommandOutput::failed(1, "permission denied"))]);
        let err = b.kill_session(&target(), "build").unwrap_err();
        assert!(matches!(err, OutpostError::Remote { .. }));
    }

    #[test]
    fn create_session_launches_without_touching_log() {
        let (b, runner) = backend(vec![]);
        b.create_session(
            &target(),
            &SessionLaunch {
                name: "build".into(),
                cwd: "/home/ubuntu/work".into(),
                command: "make".into(),
                log_path: "/home/ubuntu/work/logs/build.log".into(),
            },
        )
        .unwrap();
        let cmds = runner.executed_commands();
        assert_eq!(cmds.len(), 1);
        assert!(cmds[0].starts_with("ssh "));
        assert!(cmds[0].contains("mkdir -p /home/ubuntu/work/logs"));
        assert!(cmds[0].contains("tmux new-session"));
        assert!(!cmds[0].contains(": >"));
    }

    #[test]
    fn duplicate_session_is_already_running() {
        let (b, _) = backend(vec![Ok(CommandOutput::failed(1, "duplicate session: build"))]);
        let err = b
            .create_session(
                &target(),
                &SessionLaunch {
                    name: "build".into(),
                    cwd: "/home/ubuntu/work".into(),
                    command: "make".into(),
                    log_path: "/home/ubuntu/work/logs/build.log".into(),
                },
            )
            .unwrap_err();
        match err {
            OutpostError::AlreadyRunning { session, target } => {
                assert_eq!(session, "build");
                assert_eq!(target, "builder");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    #[test]
    fn tail_log_splits_lines() {
        let (b, _) = backend(vec![Ok(CommandOutput::ok("a\nb\nc\n"))]);
        let lines = b.tail_log(&target(), "/w/build.log", 3).unwrap();
        assert_eq!(lines, vec!["a", "b", "c"]);
    }

    #[test]
    fn parent_dir_variants() {
        assert_eq!(parent_dir("/a/b/c.log"), "/a/b");
        assert_eq!(parent_dir("/c.log"), "/");
        assert_eq!(parent_dir("c.log"), ".");
    }
}
