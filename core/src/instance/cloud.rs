//! Cloud control API.
//!
//! `CloudApi` is the narrow slice of the provider API the lifecycle manager
//! consumes: find the instance by its name tag, describe it by ID, and
//! request start and stop. `AwsCli` implements it over the `aws` CLI and
//! parses its JSON output; `FakeCloud` simulates state progressions for
//! tests and counts every state-changing call.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{OutpostError, Result};
use crate::infrastructure::runner::CommandRunner;
use crate::infrastructure::tmux::shell_escape;


// ---------------------------------------------------------------------------
// Instance model
// ---------------------------------------------------------------------------

/// Power state of the compute instance as the provider reports it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Absent,
    Pending,
    Running,
    Stopping,
    Stopped,
    Terminated,
}

impl InstanceState {
    /// Map a provider state string. `shutting-down` counts as terminated;
    /// anything unrecognised is a `CloudApi` error.
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(InstanceState::Pending),
            "running" => Ok(InstanceState::Running),
            "stopping" => Ok(InstanceState::Stopping),
            "stopped" => Ok(InstanceState::Stopped),
            "shutting-down" | "terminated" => Ok(InstanceState::Terminated),
            other => Err(OutpostError::CloudApi {
                operation: "describe-instances".into(),
                message: format!("unexpected instance state '{}'", other),
            }),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceState::Absent => "absent",
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Terminated => "terminated",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One observation of the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDescription {
    pub id: String,
    pub state: InstanceState,
    pub public_address: Option<String>,
    pub launch_time: Option<DateTime<Utc>>,
}


// ---------------------------------------------------------------------------
// CloudApi
// ---------------------------------------------------------------------------

/// Control-plane operations on instances. Errors are not retried.
pub trait CloudApi: Send + Sync {
    /// The live instance carrying the name tag, if any.
    fn find_by_tag(&self, name: &str) -> Result<Option<InstanceDescription>>;

    fn describe(&self, id: &str) -> Result<Option<InstanceDescription>>;

    fn start_instance(&self, id: &str) -> Result<()>;

    fn stop_instance(&self, id: &str) -> Result<()>;
}


// ---------------------------------------------------------------------------
// AwsCli
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeResponse {
    #[serde(default)]
    reservations: Vec<Reservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Reservation {
    #[serde(default)]
    instances: Vec<AwsInstance>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsInstance {
    instance_id: String,
    state: AwsState,
    #[serde(default)]
    public_ip_address: Option<String>,
    #[serde(default)]
    launch_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsState {
    name: String,
}

/// States worth considering when looking an instance up by tag.
const LIVE_STATES: &str = "pending,running,stopping,stopped";

/// `CloudApi` over the `aws ec2` CLI.
pub struct AwsCli {
    runner: Arc<dyn CommandRunner>,
    region: String,
}

impl AwsCli {
    pub fn new(runner: Arc<dyn CommandRunner>, region: &str) -> Self {
        AwsCli {
            runner,
            region: region.to_string(),
        }
    }

    fn call(&self, operation: &str, args: &str) -> Result<String> {
        let cmd = format!(
            "aws ec2 {} --region {} --output json {}",
            operation,
            shell_escape(&self.region),
            args
        );
        debug!(command = %cmd, "cloud api");
        let out = self.runner.run(&cmd).map_err(|e| OutpostError::CloudApi {
            operation: operation.to_string(),
            message: e,
        })?;
        if !out.success() {
            return Err(OutpostError::CloudApi {
                operation: operation.to_string(),
                message: out.stderr.trim().to_string(),
            });
        }
        Ok(out.stdout)
    }

    fn describe_with(&self, args: &str) -> Result<Vec<InstanceDescription>> {
        let stdout = self.call("describe-instances", args)?;
        parse_describe(&stdout)
    }
}

/// Parse `describe-instances` JSON into descriptions.
pub fn parse_describe(json: &str) -> Result<Vec<InstanceDescription>> {
    let response: DescribeResponse =
        serde_json::from_str(json).map_err(|e| OutpostError::CloudApi {
            operation: "describe-instances".into(),
            message: format!("unparseable response: {}", e),
        })?;
    let mut out = Vec::new();
    for reservation in response.reservations {
        for inst in reservation.instances {
            out.push(InstanceDescription {
                id: inst.instance_id,
                state: InstanceState::parse(&inst.state.name)?,
                public_address: inst.public_ip_address.filter(|a| !a.is_empty()),
                launch_time: inst.launch_time,
            });
        }
    }
    Ok(out)
}

/// Pick the most relevant of several tagged instances: running beats
/// pending beats stopping beats stopped.
fn most_relevant(mut found: Vec<InstanceDescription>) -> Option<InstanceDescription> {
    let rank = |s: InstanceState| match s {
        InstanceState::Running => 0,
        InstanceState::Pending => 1,
        InstanceState::Stopping => 2,
        InstanceState::Stopped => 3,
        _ => 4,
    };
    found.sort_by_key(|d| rank(d.state));
    found.into_iter().next()
}

impl CloudApi for AwsCli {
    fn find_by_tag(&self, name: &str) -> Result<Option<InstanceDescription>> {
        let args = format!(
            "--filters {} {}",
            shell_escape(&format!("Name=tag:Name,Values={}", name)),
            shell_escape(&format!("Name=instance-state-name,Values={}", LIVE_STATES)),
        );
        Ok(most_relevant(self.describe_with(&args)?))
    }

    fn describe(&self, id: &str) -> Result<Option<InstanceDescription>> {
        let args = format!("--instance-ids {}", shell_escape(id));
        Ok(self.describe_with(&args)?.into_iter().next())
    }

    fn start_instance(&self, id: &str) -> Result<()> {
        self.call("start-instances", &format!("--instance-ids {}", shell_escape(id)))?;
        Ok(())
    }

    fn stop_instance(&self, id: &str) -> Result<()> {
        self.call("stop-instances", &format!("--instance-ids {}", shell_escape(id)))?;
        Ok(())
    }
}


// ---------------------------------------------------------------------------
// FakeCloud
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct FakeCloudState {
    instance: Option<InstanceDescription>,
    address: String,
    pending_polls: u32,
    stopping_polls: u32,
    remaining: u32,
    never_ready: bool,
    fail_next: Option<String>,
    start_calls: u32,
    stop_calls: u32,
    describe_calls: u32,
}

/// Simulated control API holding one instance.
///
/// A started instance stays `pending` for `pending_polls` observations
/// before turning `running` (with its address); a stopped one stays
/// `stopping` for `stopping_polls` observations.
pub struct FakeCloud {
    inner: Mutex<FakeCloudState>,
}

impl FakeCloud {
    fn with(instance: Option<InstanceDescription>, address: &str) -> Self {
        FakeCloud {
            inner: Mutex::new(FakeCloudState {
                instance,
                address: address.to_string(),
                pending_polls: 2,
                stopping_polls: 2,
                remaining: 0,
                never_ready: false,
                fail_next: None,
                start_calls: 0,
                stop_calls: 0,
                describe_calls: 0,
            }),
        }
    }

    /// An instance in `state`. The address is only visible while running.
    pub fn in_state(id: &str, state: InstanceState, address: &str) -> Self {
        let visible = (state == InstanceState::Running).then(|| address.to_string());
        let fake = Self::with(
            Some(InstanceDescription {
                id: id.to_string(),
                state,
                public_address: visible,
                launch_time: Some(Utc::now()),
            }),
            address,
        );
        {
            let mut s = fake.lock();
            s.remaining = match state {
                InstanceState::Pending => s.pending_polls,
                InstanceState::Stopping => s.stopping_polls,
                _ => 0,
            };
        }
        fake
    }

    pub fn running(id: &str, address: &str) -> Self {
        Self::in_state(id, InstanceState::Running, address)
    }

    pub fn stopped(id: &str, address: &str) -> Self {
        Self::in_state(id, InstanceState::Stopped, address)
    }

    /// No instance carries the tag.
    pub fn absent() -> Self {
        Self::with(None, "")
    }

    /// Observations spent in `pending` after a start.
    pub fn pending_polls(self, n: u32) -> Self {
        {
            let mut s = self.lock();
            if s.instance.as_ref().map(|i| i.state) == Some(InstanceState::Pending) {
                s.remaining = n;
            }
            s.pending_polls = n;
        }
        self
    }

    pub fn stopping_polls(self, n: u32) -> Self {
        {
            let mut s = self.lock();
            if s.instance.as_ref().map(|i| i.state) == Some(InstanceState::Stopping) {
                s.remaining = n;
            }
            s.stopping_polls = n;
        }
        self
    }

    /// Started instances never leave `pending`.
    pub fn never_ready(self) -> Self {
        self.lock().never_ready = true;
        self
    }

    /// Fail the next API call with `message`.
    pub fn fail_next(&self, message: &str) {
        self.lock().fail_next = Some(message.to_string());
    }

    pub fn set_launch_time(&self, at: DateTime<Utc>) {
        if let Some(inst) = self.lock().instance.as_mut() {
            inst.launch_time = Some(at);
        }
    }

    pub fn start_calls(&self) -> u32 {
        self.lock().start_calls
    }

    pub fn stop_calls(&self) -> u32 {
        self.lock().stop_calls
    }

    pub fn describe_calls(&self) -> u32 {
        self.lock().describe_calls
    }

    /// Calls that asked the provider to change something.
    pub fn state_changing_calls(&self) -> u32 {
        let s = self.lock();
        s.start_calls + s.stop_calls
    }

    pub fn current_state(&self) -> InstanceState {
        self.lock()
            .instance
            .as_ref()
            .map(|i| i.state)
            .unwrap_or(InstanceState::Absent)
    }

    fn lock(&self) -> MutexGuard<'_, FakeCloudState> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn take_failure(s: &mut FakeCloudState, operation: &str) -> Result<()> {
        match s.fail_next.take() {
            Some(message) => Err(OutpostError::CloudApi {
                operation: operation.to_string(),
                message,
            }),
            None => Ok(()),
        }
    }

    /// One observation: advance transitional states, then report.
    fn observe(s: &mut FakeCloudState) -> Option<InstanceDescription> {
        s.describe_calls += 1;
        let never_ready = s.never_ready;
        let address = s.address.clone();
        let inst = s.instance.as_mut()?;
        match inst.state {
            InstanceState::Pending if !never_ready => {
                if s.remaining == 0 {
                    inst.state = InstanceState::Running;
                    inst.public_address = Some(address);
                    inst.launch_time = Some(Utc::now());
                } else {
                    s.remaining -= 1;
                }
            }
            InstanceState::Stopping => {
                if s.remaining == 0 {
                    inst.state = InstanceState::Stopped;
                } else {
                    s.remaining -= 1;
                }
            }
            _ => {}
        }
        Some(inst.clone())
    }
}

impl CloudApi for FakeCloud {
    fn find_by_tag(&self, _name: &str) -> Result<Option<InstanceDescription>> {
        let mut s = self.lock();
        Self::take_failure(&mut s, "describe-instances")?;
        let found = Self::observe(&mut s);
        Ok(found.filter(|i| i.state != InstanceState::Terminated))
    }

    fn describe(&self, id: &str) -> Result<Option<InstanceDescription>> {
        let mut s = self.lock();
        Self::take_failure(&mut s, "describe-instances")?;
        Ok(Self::observe(&mut s).filter(|i| i.id == id))
    }

    fn start_instance(&self, id: &str) -> Result<()> {
        let mut guard = self.lock();
        let s = &mut *guard;
        Self::take_failure(s, "start-instances")?;
        s.start_calls += 1;
        let polls = s.pending_polls;
        match s.instance.as_mut() {
            Some(inst) if inst.id == id && inst.state == InstanceState::Stopped => {
                inst.state = InstanceState::Pending;
                s.remaining = polls;
                Ok(())
            }
            Some(inst) if inst.id == id => Err(OutpostError::CloudApi {
                operation: "start-instances".into(),
                message: format!("IncorrectInstanceState: instance is {}", inst.state),
            }),
            _ => Err(OutpostError::CloudApi {
                operation: "start-instances".into(),
                message: format!("InvalidInstanceID.NotFound: {}", id),
            }),
        }
    }

    fn stop_instance(&self, id: &str) -> Result<()> {
        let mut guard = self.lock();
        let s = &mut *guard;
        Self::take_failure(s, "stop-instances")?;
        s.stop_calls += 1;
        let polls = s.stopping_polls;
        match s.instance.as_mut() {
            Some(inst) if inst.id == id => {
                if matches!(inst.state, InstanceState::Running | InstanceState::Pending) {
                    inst.state = InstanceState::Stopping;
                    inst.public_address = None;
                    s.remaining = polls;
                }
                Ok(())
            }
            _ => Err(OutpostError::CloudApi {
                operation: "stop-instances".into(),
                message: format!("InvalidInstanceID.NotFound: {}", id),
            }),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::runner::{CommandOutput, MockRunner};

    const DESCRIBE: &str = r#"{
      "Reservations": [{
        "Instances": [{
          "InstanceId": "i-0abc123",
          "State": {"Code": 16, "Name": "running"},
          "PublicIpAddress": "3.14.15.92",
          "LaunchTime": "2024-01-15T10:30:45+00:00"
        }]
      }]
    }"#;

    #[test]
    fn parse_describe_reads_fields() {
        let found = parse_describe(DESCRIBE).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, "i-0abc123");
        assert_eq!(found[0].state, InstanceState::Running);
        assert_eq!(found[0].public_address.as_deref(), Some("3.14.15.92"));
        assert!(found[0].launch_time.is_some());
    }

    #[test]
    fn parse_describe_empty() {
        assert!(parse_describe(r#"{"Reservations": []}"#).unwrap().is_empty());
    }

    #[test]
    fn unknown_state_is_cloud_error() {
        assert!(matches!(
            InstanceState::parse("rebooting"),
            Err(OutpostError::CloudApi { .. })
        ));
        assert_eq!(InstanceState::parse("shutting-down").unwrap(), InstanceState::Terminated);
    }

    #[test]
    fn most_relevant_prefers_running() {
        let mk = |id: &str, state| InstanceDescription {
            id: id.into(),
            state,
            public_address: None,
            launch_time: None,
        };
        let pick = most_relevant(vec![
            mk("i-old", InstanceState::Stopped),
            mk("i-live", InstanceState::Running),
        ])
        .unwrap();
        assert_eq!(pick.id, "i-live");
    }

    #[test]
    fn aws_find_by_tag_builds_filters() {
        let runner = Arc::new(MockRunner::with_responses(vec![Ok(CommandOutput::ok(DESCRIBE))]));
        let api = AwsCli::new(runner.clone(), "us-east-2");
        let found = api.find_by_tag("yocto-builder").unwrap().unwrap();
        assert_eq!(found.id, "i-0abc123");
        let cmd = &runner.executed_commands()[0];
        assert!(cmd.starts_with("aws ec2 describe-instances --region us-east-2 --output json"));
        assert!(cmd.contains("Name=tag:Name,Values=yocto-builder"));
        assert!(cmd.contains("Values=pending,running,stopping,stopped"));
    }

    #[test]
    fn aws_error_surfaces_verbatim() {
        let runner = Arc::new(MockRunner::with_responses(vec![Ok(CommandOutput::failed(
            255,
            "An error occurred (UnauthorizedOperation) when calling the StartInstances operation",
        ))]));
        let api = AwsCli::new(runner, "us-east-2");
        match api.start_instance("i-0abc123").unwrap_err() {
            OutpostError::CloudApi { operation, message } => {
                assert_eq!(operation, "start-instances");
                assert!(message.contains("UnauthorizedOperation"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn fake_progresses_through_pending() {
        let cloud = FakeCloud::stopped("i-1", "1.2.3.4").pending_polls(1);
        cloud.start_instance("i-1").unwrap();
        assert_eq!(cloud.describe("i-1").unwrap().unwrap().state, InstanceState::Pending);
        let up = cloud.describe("i-1").unwrap().unwrap();
        assert_eq!(up.state, InstanceState::Running);
        assert_eq!(up.public_address.as_deref(), Some("1.2.3.4"));
    }
}
