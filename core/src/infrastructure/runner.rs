//! Command runner abstraction for executing local shell commands.
//!
//! `CommandRunner` is the trait every component uses to spawn processes on the
//! operator's machine (ssh, rsync, docker, aws). `ShellRunner` is the
//! production implementation that spawns `sh -c`. `MockRunner` is the test
//! double that records calls and returns preset responses.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::Mutex;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};


// ---------------------------------------------------------------------------
// CommandOutput
// ---------------------------------------------------------------------------

/// Exit status and captured output of a finished command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// A successful result with the given stdout.
    pub fn ok(stdout: &str) -> Self {
        CommandOutput {
            exit_code: 0,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    /// A failed result with the given exit code and stderr.
    pub fn failed(exit_code: i32, stderr: &str) -> Self {
        CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}


// ---------------------------------------------------------------------------
// Streaming
// ---------------------------------------------------------------------------

/// Receives lines from a streaming command as they arrive.
pub type LineSink = Box<dyn FnMut(String) + Send>;

/// Handle on a background streaming command. Dropping it without calling
/// `stop` leaves the stream running until its process exits.
pub trait StreamHandle: Send {
    /// Stop the stream and wait for the reader to finish. Lines already read
    /// are delivered before this returns.
    fn stop(self: Box<Self>);
}


// ---------------------------------------------------------------------------
// CommandRunner
// ---------------------------------------------------------------------------

/// Trait for executing shell command strings on the local machine.
///
/// `Err` means the process could not be run at all (spawn failure, timeout);
/// a non-zero exit is reported through `CommandOutput::exit_code`.
pub trait CommandRunner: Send + Sync {
    /// Run to completion.
    fn run(&self, cmd: &str) -> Result<CommandOutput, String>;

    /// Run to completion, killing the process if it outlives `timeout`.
    fn run_with_timeout(&self, cmd: &str, timeout: Duration) -> Result<CommandOutput, String>;

    /// Run to completion with `input` written to stdin.
    fn run_with_input(&self, cmd: &str, input: &str) -> Result<CommandOutput, String>;

    /// Run to completion, handing each stdout line (or `\r`-terminated
    /// progress update) to `progress` as it is produced.
    fn run_streaming(
        &self,
        cmd: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput, String>;

    /// Spawn in the background, delivering stdout lines to `sink` until the
    /// returned handle is stopped or the process exits.
    fn stream(&self, cmd: &str, sink: LineSink) -> Result<Box<dyn StreamHandle>, String>;
}


// ---------------------------------------------------------------------------
// ShellRunner
// ---------------------------------------------------------------------------

/// Production runner that spawns `sh -c <cmd>`.
pub struct ShellRunner;

impl ShellRunner {
    fn command(cmd: &str) -> Command {
        let mut command = Command::new("sh");
        command.arg("-c").arg(cmd);
        command
    }
}

impl CommandRunner for ShellRunner {
    fn run(&self, cmd: &str) -> Result<CommandOutput, String> {
        let output = Self::command(cmd)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| format!("Failed to execute: {}", e))?;
        Ok(to_output(output))
    }

    fn run_with_timeout(&self, cmd: &str, timeout: Duration) -> Result<CommandOutput, String> {
        let mut child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("Failed to execute: {}", e))?;

        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(_)) => break,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!("timed out after {}ms", timeout.as_millis()));
                }
                Ok(None) => thread::sleep(Duration::from_millis(20)),
                Err(e) => return Err(format!("Failed to wait: {}", e)),
            }
        }
        let output = child
            .wait_with_output()
            .map_err(|e| format!("Failed to collect output: {}", e))?;
        Ok(to_output(output))
    }

    fn run_with_input(&self, cmd: &str, input: &str) -> Result<CommandOutput, String> {
        let mut child = Self::command(cmd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("Failed to execute: {}", e))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input.as_bytes())
                .map_err(|e| format!("Failed to write stdin: {}", e))?;
        }
        let output = child
            .wait_with_output()
            .map_err(|e| format!("Failed to collect output: {}", e))?;
        Ok(to_output(output))
    }

    fn run_streaming(
        &self,
        cmd: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput, String> {
        let mut child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| format!("Failed to execute: {}", e))?;

        // stderr is drained on its own thread so a chatty process cannot
        // block on a full pipe while we read stdout.
        let stderr_reader = child.stderr.take().map(|mut err| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = err.read_to_string(&mut buf);
                buf
            })
        });

        let mut stdout_text = String::new();
        if let Some(out) = child.stdout.take() {
            for segment in ProgressSegments::new(out) {
                progress(&segment);
                stdout_text.push_str(&segment);
                stdout_text.push('\n');
            }
        }

        let status = child
            .wait()
            .map_err(|e| format!("Failed to wait: {}", e))?;
        let stderr = stderr_reader
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout: stdout_text,
            stderr,
        })
    }

    fn stream(&self, cmd: &str, mut sink: LineSink) -> Result<Box<dyn StreamHandle>, String> {
        let mut child = Self::command(cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| format!("Failed to execute: {}", e))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| "Failed to capture stdout".to_string())?;
        let reader = thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                match line {
                    Ok(l) => sink(l),
                    Err(_) => break,
                }
            }
        });
        Ok(Box::new(ShellStream {
            child,
            reader: Some(reader),
        }))
    }
}

fn to_output(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    }
}

struct ShellStream {
    child: Child,
    reader: Option<JoinHandle<()>>,
}

impl StreamHandle for ShellStream {
    fn stop(mut self: Box<Self>) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}


// ---------------------------------------------------------------------------
// Progress splitting
// ---------------------------------------------------------------------------

/// Splits a byte stream on `\n` and `\r`, so rsync-style progress updates
/// (which rewrite one terminal line with `\r`) surface as separate segments.
struct ProgressSegments<R: Read> {
    inner: R,
    pending: VecDeque<String>,
    partial: Vec<u8>,
    done: bool,
}

impl<R: Read> ProgressSegments<R> {
    fn new(inner: R) -> Self {
        ProgressSegments {
            inner,
            pending: VecDeque::new(),
            partial: Vec::new(),
            done: false,
        }
    }

    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            let seg = String::from_utf8_lossy(&self.partial).trim().to_string();
            self.partial.clear();
            if !seg.is_empty() {
                self.pending.push_back(seg);
            }
        }
    }
}

impl<R: Read> Iterator for ProgressSegments<R> {
    type Item = String;

    fn next(&mut self) -> Option<String> {
        let mut buf = [0u8; 4096];
        while self.pending.is_empty() && !self.done {
            match self.inner.read(&mut buf) {
                Ok(0) | Err(_) => {
                    self.done = true;
                    self.flush_partial();
                }
                Ok(n) => {
                    for &b in &buf[..n] {
                        if b == b'\n' || b == b'\r' {
                            self.flush_partial();
                        } else {
                            self.partial.push(b);
                        }
                    }
                }
            }
        }
        self.pending.pop_front()
    }
}


// ---------------------------------------------------------------------------
// MockRunner
// ---------------------------------------------------------------------------

/// Test-double runner that records commands and returns pre-configured
/// responses in order. Once the script is exhausted every call succeeds with
/// empty output.
pub struct MockRunner {
    responses: Mutex<VecDeque<Result<CommandOutput, String>>>,
    commands: Mutex<Vec<String>>,
    inputs: Mutex<Vec<String>>,
    stream_lines: Mutex<Vec<String>>,
}

impl MockRunner {
    pub fn with_responses(responses: Vec<Result<CommandOutput, String>>) -> Self {
        MockRunner {
            responses: Mutex::new(responses.into()),
            commands: Mutex::new(Vec::new()),
            inputs: Mutex::new(Vec::new()),
            stream_lines: Mutex::new(Vec::new()),
        }
    }

    pub fn new() -> Self {
        Self::with_responses(Vec::new())
    }

    /// Lines delivered by `stream` and `run_streaming`.
    pub fn set_stream_lines(&self, lines: &[&str]) {
        let mut stored = self.stream_lines.lock().unwrap_or_else(|p| p.into_inner());
        *stored = lines.iter().map(|s| s.to_string()).collect();
    }

    pub fn executed_commands(&self) -> Vec<String> {
        self.commands.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Everything written to stdin via `run_with_input`, in call order.
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn next_response(&self, cmd: &str) -> Result<CommandOutput, String> {
        self.commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(cmd.to_string());
        self.responses
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .unwrap_or_else(|| Ok(CommandOutput::ok("")))
    }

    fn lines(&self) -> Vec<String> {
        self.stream_lines
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, cmd: &str) -> Result<CommandOutput, String> {
        self.next_response(cmd)
    }

    fn run_with_timeout(&self, cmd: &str, _timeout: Duration) -> Result<CommandOutput, String> {
        self.next_response(cmd)
    }

    fn run_with_input(&self, cmd: &str, input: &str) -> Result<CommandOutput, String> {
        self.inputs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(input.to_string());
        self.next_response(cmd)
    }

    fn run_streaming(
        &self,
        cmd: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput, String> {
        for line in self.lines() {
            progress(&line);
        }
        self.next_response(cmd)
    }

    fn stream(&self, cmd: &str, mut sink: LineSink) -> Result<Box<dyn StreamHandle>, String> {
        self.next_response(cmd)?;
        for line in self.lines() {
            sink(line);
        }
        Ok(Box::new(NoopStream))
    }
}

struct NoopStream;

impl StreamHandle for NoopStream {
    fn stop(self: Box<Self>) {}
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn mock_runner_records_commands() {
        let runner = MockRunner::with_responses(vec![
            Ok(CommandOutput::ok("ok")),
            Ok(CommandOutput::ok("ok2")),
        ]);
        assert!(runner.run("echo hello").is_ok());
        assert!(runner.run("echo world").is_ok());
        let cmds = runner.executed_commands();
        assert_eq!(cmds, vec!["echo hello", "echo world"]);
    }

    #[test]
    fn mock_runner_returns_responses_in_order() {
        let runner = MockRunner::with_responses(vec![
            Ok(CommandOutput::ok("first")),
            Err("spawn failed".into()),
            Ok(CommandOutput::failed(1, "third")),
        ]);
        assert_eq!(runner.run("cmd1").unwrap().stdout, "first");
        assert_eq!(runner.run("cmd2").unwrap_err(), "spawn failed");
        let third = runner.run("cmd3").unwrap();
        assert!(!third.success());
        assert_eq!(third.stderr, "third");
    }

    #[test]
    fn mock_runner_defaults_to_empty_ok() {
        let runner = MockRunner::new();
        let out = runner.run("anything").unwrap();
        assert!(out.success());
        assert_eq!(out.stdout, "");
    }

    #[test]
    fn mock_runner_captures_stdin() {
        let runner = MockRunner::new();
        runner.run_with_input("docker login --password-stdin", "s3cret").unwrap();
        assert_eq!(runner.inputs(), vec!["s3cret"]);
    }

    #[test]
    fn mock_runner_streams_preset_lines() {
        let runner = MockRunner::new();
        runner.set_stream_lines(&["one", "two"]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let handle = runner
            .stream("tail -F log", Box::new(move |l| sink_seen.lock().unwrap().push(l)))
            .unwrap();
        handle.stop();
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn progress_segments_split_on_carriage_return() {
        let data: &[u8] = b"  1,024  10%\r  10,240 100%\nsent 10,300 bytes\n";
        let segs: Vec<String> = ProgressSegments::new(data).collect();
        assert_eq!(segs, vec!["1,024  10%", "10,240 100%", "sent 10,300 bytes"]);
    }

    #[test]
    fn shell_runner_reports_exit_code_and_stderr() {
        let out = ShellRunner.run("echo oops >&2; exit 3").unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stderr.trim(), "oops");
    }

    #[test]
    fn shell_runner_timeout_kills_process() {
        let started = Instant::now();
        let result = ShellRunner.run_with_timeout("sleep 5", Duration::from_millis(100));
        assert!(result.is_err());
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn shell_runner_passes_stdin() {
        let out = ShellRunner.run_with_input("cat", "piped").unwrap();
        assert_eq!(out.stdout, "piped");
    }
}
