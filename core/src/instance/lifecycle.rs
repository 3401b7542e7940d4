//! Instance lifecycle: start, stop, status and address of the ephemeral
//! build instance, with wait-until-ready semantics on start.
//!
//! The instance is identified by its name tag. Every operation starts with a
//! fresh lookup, so nothing is cached between calls.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::error::{OutpostError, Result};

use super::cloud::{CloudApi, InstanceDescription, InstanceState};

/// What `stop` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing to do: absent, stopped, stopping or terminated.
    AlreadyStopped,
    /// A stop request was issued; the instance may still be stopping.
    StopRequested,
}

/// Drives one tagged instance through the cloud API.
pub struct InstanceManager {
    api: Arc<dyn CloudApi>,
    name: String,
    region: String,
    poll_interval: Duration,
    timeout: Duration,
}

impl InstanceManager {
    pub fn new(
        api: Arc<dyn CloudApi>,
        name: &str,
        region: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Self {
        InstanceManager {
            api,
            name: name.to_string(),
            region: region.to_string(),
            poll_interval,
            timeout,
        }
    }

    /// The same instance with a different poll interval and start timeout.
    pub fn with_timing(self, poll_interval: Duration, timeout: Duration) -> Self {
        InstanceManager {
            poll_interval,
            timeout,
            ..self
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Budget shared by the start poll and any readiness wait after it.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Full description, `None` when no live instance carries the tag.
    pub fn describe(&self) -> Result<Option<InstanceDescription>> {
        self.api.find_by_tag(&self.name)
    }

    /// Current power state; `Absent` when no instance matches.
    pub fn status(&self) -> Result<InstanceState> {
        Ok(self
            .describe()?
            .map(|d| d.state)
            .unwrap_or(InstanceState::Absent))
    }

    /// Bring the instance to `running` and return its description.
    ///
    /// Already running: returns at once without any state-changing call.
    /// Pending: only polls. Stopped: issues one start, then polls. Stopping:
    /// waits for stopped, then issues one start. All waiting shares the
    /// configured timeout and fails with `StartTimeout` once it is spent.
    pub fn start(&self) -> Result<InstanceDescription> {
        let deadline = Instant::now() + self.timeout;
        let desc = self.describe()?.ok_or_else(|| self.no_instance())?;
        match desc.state {
            InstanceState::Running => {
                debug!(instance = %desc.id, "already running");
                return Ok(desc);
            }
            InstanceState::Pending => {
                info!(instance = %desc.id, "instance pending, waiting");
            }
            InstanceState::Stopped => {
                info!(instance = %desc.id, "starting instance");
                self.api.start_instance(&desc.id)?;
            }
            InstanceState::Stopping => {
                info!(instance = %desc.id, "instance stopping, waiting before start");
                self.wait_for(&desc.id, InstanceState::Stopped, deadline)?;
                info!(instance = %desc.id, "starting instance");
                self.api.start_instance(&desc.id)?;
            }
            InstanceState::Absent | InstanceState::Terminated => {
                return Err(self.no_instance());
            }
        }
        let up = self.wait_for(&desc.id, InstanceState::Running, deadline)?;
        info!(instance = %up.id, address = ?up.public_address, "instance running");
        Ok(up)
    }

    /// Request a stop without waiting for it to complete. No-op when the
    /// instance is absent or already stopped or stopping.
    pub fn stop(&self) -> Result<StopOutcome> {
        let desc = match self.describe()? {
            Some(d) => d,
            None => return Ok(StopOutcome::AlreadyStopped),
        };
        match desc.state {
            InstanceState::Running | InstanceState::Pending => {
                info!(instance = %desc.id, "stopping instance");
                self.api.stop_instance(&desc.id)?;
                Ok(StopOutcome::StopRequested)
            }
            _ => {
                debug!(instance = %desc.id, state = %desc.state, "stop: nothing to do");
                Ok(StopOutcome::AlreadyStopped)
            }
        }
    }

    /// Public address of the running instance.
    pub fn address(&self) -> Result<String> {
        match self.describe()? {
            Some(InstanceDescription {
                state: InstanceState::Running,
                public_address: Some(addr),
                ..
            }) => Ok(addr),
            Some(desc) => Err(OutpostError::NoAddress {
                instance: self.name.clone(),
                state: desc.state.to_string(),
            }),
            None => Err(OutpostError::NoAddress {
                instance: self.name.clone(),
                state: InstanceState::Absent.to_string(),
            }),
        }
    }

    fn wait_for(&self, id: &str, wanted: InstanceState, deadline: Instant) -> Result<InstanceDescription> {
        let started = Instant::now();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            thread::sleep(self.poll_interval.min(remaining));
            let desc = self.api.describe(id)?.ok_or_else(|| self.no_instance())?;
            debug!(instance = %id, state = %desc.state, "poll");
            if desc.state == wanted {
                return Ok(desc);
            }
            if desc.state == InstanceState::Terminated {
                return Err(self.no_instance());
            }
            if Instant::now() >= deadline {
                return Err(OutpostError::StartTimeout {
                    instance: self.name.clone(),
                    expected: wanted.to_string(),
                    waited_secs: started.elapsed().as_secs(),
                    last_seen: desc.state.to_string(),
                });
            }
        }
    }

    fn no_instance(&self) -> OutpostError {
        OutpostError::NoInstance {
            name: self.name.clone(),
            region: self.region.clone(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::cloud::FakeCloud;

    fn manager(cloud: Arc<FakeCloud>) -> InstanceManager {
        InstanceManager::new(
            cloud,
            "yocto-builder",
            "us-east-2",
            Duration::from_millis(1),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn start_twice_on_running_changes_nothing() {
        let cloud = Arc::new(FakeCloud::running("i-1", "3.14.15.92"));
        let mgr = manager(cloud.clone());
        let first = mgr.start().unwrap();
        let second = mgr.start().unwrap();
        assert_eq!(cloud.state_changing_calls(), 0);
        assert_eq!(first.public_address, second.public_address);
        assert_eq!(mgr.address().unwrap(), "3.14.15.92");
    }

    #[test]
    fn start_from_stopped_issues_one_start_and_polls() {
        let cloud = Arc::new(FakeCloud::stopped("i-1", "3.14.15.92").pending_polls(3));
        let mgr = manager(cloud.clone());
        let desc = mgr.start().unwrap();
        assert_eq!(desc.state, InstanceState::Running);
        assert_eq!(cloud.start_calls(), 1);
        assert_eq!(desc.public_address.as_deref(), Some("3.14.15.92"));
    }

    #[test]
    fn start_from_pending_only_polls() {
        let cloud = Arc::new(FakeCloud::in_state("i-1", InstanceState::Pending, "1.1.1.1"));
        let mgr = manager(cloud.clone());
        mgr.start().unwrap();
        assert_eq!(cloud.start_calls(), 0);
    }

    #[test]
    fn start_from_stopping_waits_then_starts_once() {
        let cloud = Arc::new(
            FakeCloud::in_state("i-1", InstanceState::Stopping, "1.1.1.1").stopping_polls(2),
        );
        let mgr = manager(cloud.clone());
        let desc = mgr.start().unwrap();
        assert_eq!(desc.state, InstanceState::Running);
        assert_eq!(cloud.start_calls(), 1);
    }

    #[test]
    fn start_times_out() {
        let cloud = Arc::new(FakeCloud::stopped("i-1", "1.1.1.1").never_ready());
        let mgr = InstanceManager::new(
            cloud,
            "yocto-builder",
            "us-east-2",
            Duration::from_millis(5),
            Duration::from_millis(30),
        );
        match mgr.start().unwrap_err() {
            OutpostError::StartTimeout { expected, last_seen, .. } => {
                assert_eq!(expected, "running");
                assert_eq!(last_seen, "pending");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn start_absent_is_no_instance() {
        let mgr = manager(Arc::new(FakeCloud::absent()));
        assert!(matches!(mgr.start(), Err(OutpostError::NoInstance { .. })));
        assert_eq!(mgr.status().unwrap(), InstanceState::Absent);
    }

    #[test]
    fn stop_is_idempotent() {
        let cloud = Arc::new(FakeCloud::running("i-1", "1.1.1.1"));
        let mgr = manager(cloud.clone());
        assert_eq!(mgr.stop().unwrap(), StopOutcome::StopRequested);
        assert_eq!(mgr.stop().unwrap(), StopOutcome::AlreadyStopped);
        assert_eq!(cloud.stop_calls(), 1);

        let absent = manager(Arc::new(FakeCloud::absent()));
        assert_eq!(absent.stop().unwrap(), StopOutcome::AlreadyStopped);
    }

    #[test]
    fn address_requires_running() {
        let mgr = manager(Arc::new(FakeCloud::stopped("i-1", "1.1.1.1")));
        assert!(matches!(mgr.address(), Err(OutpostError::NoAddress { .. })));
    }

    #[test]
    fn cloud_error_surfaces_without_retry() {
        let cloud = Arc::new(FakeCloud::stopped("i-1", "1.1.1.1"));
        cloud.fail_next("RequestLimitExceeded");
        let mgr = manager(cloud.clone());
        assert!(matches!(mgr.start(), Err(OutpostError::CloudApi { .. })));
        assert_eq!(cloud.start_calls(), 0);
    }
}
