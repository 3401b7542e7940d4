//! Orchestrator: the one entry point the CLI talks to.
//!
//! `Orchestrator` owns the resolved settings and wires the components
//! together over injected backends (`Backends::production` in the binary,
//! fakes in tests). Operations are strictly sequential within one call: an
//! instance-backed target is brought to `running` and reachable before a
//! session is started on it, a watch that sees its session end consults the
//! auto-stop policy once, and so on.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::deploy::secrets::{AwsSecretsManager, SecretsStore};
use crate::deploy::syncer::{DeployOutcome, DeploymentSyncer, UnitState};
use crate::error::{OutpostError, Result};
use crate::infrastructure::docker::DockerBackend;
use crate::infrastructure::runner::{CommandRunner, LineSink, ShellRunner};
use crate::infrastructure::tmux::TmuxBackend;
use crate::infrastructure::{ContainerBackend, SessionBackend};
use crate::instance::cloud::{AwsCli, CloudApi, InstanceDescription};
use crate::instance::lifecycle::{InstanceManager, StopOutcome};
use crate::instance::uptime::{cost_warning, running_hours};
use crate::policy::autostop::{AutoStopAction, AutoStopPolicy};
use crate::policy::store::{FileStore, StateStore};
use crate::rig::config::{Target, TargetKind, TargetRegistry};
use crate::rig::health::{self, TargetHealth};
use crate::rig::remote::{connectivity, ensure_reachable, RemoteShell, SshExecutor};
use crate::rig::sync::{SyncJob, TransferReport};
use crate::session::controller::{Session, SessionController, SessionStatus, TerminateOutcome};
use crate::session::watch::{CancelFlag, WatchOutcome};
use crate::settings::{Settings, STATE_FILE};


// ---------------------------------------------------------------------------
// Backends
// ---------------------------------------------------------------------------

/// The external collaborators the orchestrator drives.
#[derive(Clone)]
pub struct Backends {
    pub shell: Arc<dyn RemoteShell>,
    pub sessions: Arc<dyn SessionBackend>,
    pub containers: Arc<dyn ContainerBackend>,
    pub cloud: Arc<dyn CloudApi>,
    pub store: Arc<dyn StateStore>,
    pub secrets: Arc<dyn SecretsStore>,
}

impl Backends {
    /// ssh, tmux, docker and the aws CLI, with state kept under `config_dir`.
    pub fn production(settings: &Settings, config_dir: &Path) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(ShellRunner);
        let shell: Arc<dyn RemoteShell> =
            Arc::new(SshExecutor::new(runner.clone(), settings.ssh_connect_timeout_secs));
        Backends {
            sessions: Arc::new(TmuxBackend::new(shell.clone())),
            containers: Arc::new(DockerBackend::new(runner.clone(), shell.clone())),
            cloud: Arc::new(AwsCli::new(runner.clone(), &settings.region)),
            store: Arc::new(FileStore::new(&config_dir.join(STATE_FILE))),
            secrets: Arc::new(AwsSecretsManager::new(runner, &settings.region)),
            shell,
        }
    }
}


// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// A finished watch and what auto-stop made of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchReport {
    pub outcome: WatchOutcome,
    /// `None` when the watch was cancelled and the policy was not consulted.
    pub auto_stop: Option<AutoStopAction>,
}

/// Instance state as shown to the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceReport {
    pub name: String,
    pub description: Option<InstanceDescription>,
    pub uptime_hours: Option<i64>,
    pub auto_stop: bool,
    pub warning: Option<String>,
}


// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator {
    settings: Settings,
    registry: TargetRegistry,
    shell: Arc<dyn RemoteShell>,
    sessions: SessionController,
    instance: InstanceManager,
    auto_stop: AutoStopPolicy,
    deployer: DeploymentSyncer,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("environment", &self.settings.environment)
            .field("targets", &self.registry.list())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(settings: Settings, backends: Backends) -> Result<Self> {
        let registry = settings.registry()?;
        let probe_timeout = settings.connect_timeout();
        let sessions = SessionController::new(
            backends.shell.clone(),
            backends.sessions.clone(),
            settings.session_spec(),
            probe_timeout,
            settings.watch_config(),
        );
        let instance = InstanceManager::new(
            backends.cloud.clone(),
            &settings.instance_name,
            &settings.region,
            settings.start_poll_interval(),
            settings.start_timeout(),
        );
        let auto_stop = AutoStopPolicy::new(backends.store.clone(), &settings.environment);
        let deployer = DeploymentSyncer::new(
            backends.shell.clone(),
            backends.containers.clone(),
            backends.secrets.clone(),
            probe_timeout,
        );
        Ok(Orchestrator {
            settings,
            registry,
            shell: backends.shell,
            sessions,
            instance,
            auto_stop,
            deployer,
        })
    }

    /// Replace the instance poll interval and start timeout from settings.
    pub fn with_start_timing(mut self, poll_interval: Duration, timeout: Duration) -> Self {
        self.instance = self.instance.with_timing(poll_interval, timeout);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &TargetRegistry {
        &self.registry
    }

    // -- targets -----------------------------------------------------------

    /// Resolve a target name into connection parameters. Instance-backed
    /// targets take the instance's current address, so the instance must be
    /// running.
    pub fn target(&self, name: Option<&str>) -> Result<Target> {
        let config = self.registry.resolve(name)?;
        match config.kind {
            TargetKind::Edge => config.with_host(None),
            TargetKind::Instance => {
                let address = self.instance.address()?;
                config.with_host(Some(&address))
            }
        }
    }

    /// Resolve a target and make sure it can take work: an instance-backed
    /// target has its instance started and is polled until it answers the
    /// liveness probe, all within the start timeout.
    pub fn ensure_ready(&self, name: Option<&str>) -> Result<Target> {
        let config = self.registry.resolve(name)?;
        if config.kind == TargetKind::Edge {
            let target = config.with_host(None)?;
            ensure_reachable(self.shell.as_ref(), &target, self.settings.connect_timeout())?;
            return Ok(target);
        }

        let deadline = Instant::now() + self.instance.timeout();
        let desc = self.instance.start()?;
        let address = desc.public_address.clone().ok_or_else(|| OutpostError::NoAddress {
            instance: self.instance.name().to_string(),
            state: desc.state.to_string(),
        })?;
        let target = config.with_host(Some(&address))?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let probe = self.settings.connect_timeout().min(remaining).max(Duration::from_millis(1));
            if self.shell.reachable(&target, probe) {
                debug!(remote = %target.name, host = %target.host, "target ready");
                return Ok(target);
            }
            if Instant::now() >= deadline {
                return Err(connectivity(
                    &target,
                    &format!(
                        "instance running but not answering within {}s",
                        self.instance.timeout().as_secs()
                    ),
                ));
            }
            thread::sleep(self.instance.poll_interval().min(remaining));
        }
    }

    // -- sessions ----------------------------------------------------------

    pub fn start_session(&self, target: Option<&str>, command: &str) -> Result<Session> {
        let target = self.ensure_ready(target)?;
        self.sessions.start(&target, command)
    }

    pub fn session_status(&self, target: Option<&str>) -> Result<SessionStatus> {
        let target = self.target(target)?;
        self.sessions.status(&target)
    }

    /// Watch the session, then consult auto-stop once if it ended.
    pub fn watch(&self, target: Option<&str>, sink: LineSink, cancel: &CancelFlag) -> Result<WatchReport> {
        let target = self.target(target)?;
        let outcome = self.sessions.watch(&target, sink, cancel)?;
        if !outcome.session_ended() {
            info!(remote = %target.name, "detached; job keeps running");
            return Ok(WatchReport {
                outcome,
                auto_stop: None,
            });
        }
        let action = self.auto_stop.on_session_ended(&target, &self.instance)?;
        Ok(WatchReport {
            outcome,
            auto_stop: Some(action),
        })
    }

    pub fn tail(&self, target: Option<&str>, lines: usize) -> Result<Vec<String>> {
        let target = self.target(target)?;
        self.sessions.tail(&target, lines)
    }

    pub fn terminate(&self, target: Option<&str>) -> Result<TerminateOutcome> {
        let target = self.target(target)?;
        self.sessions.terminate(&target)
    }

    // -- auto-stop ---------------------------------------------------------

    pub fn set_auto_stop(&self) -> Result<()> {
        self.auto_stop.enable()
    }

    pub fn unset_auto_stop(&self) -> Result<()> {
        self.auto_stop.disable()
    }

    pub fn auto_stop_enabled(&self) -> Result<bool> {
        self.auto_stop.is_enabled()
    }

    // -- deploy ------------------------------------------------------------

    /// Deploy a configured unit. The target is the explicit one, else the
    /// unit's own, else the registry default.
    pub fn deploy(
        &self,
        unit: &str,
        target: Option<&str>,
        progress: &mut dyn FnMut(&str),
    ) -> Result<DeployOutcome> {
        let unit = self.settings.unit(unit)?;
        let target = self.target(target.or(unit.target.as_deref()))?;
        self.deployer.deploy(unit, &target, progress)
    }

    pub fn deploy_check(&self, unit: &str, target: Option<&str>) -> Result<UnitState> {
        let unit = self.settings.unit(unit)?;
        let target = self.target(target.or(unit.target.as_deref()))?;
        self.deployer.inspect(unit, &target)
    }

    // -- files -------------------------------------------------------------

    /// Mirror a local directory into `remote` (relative to the base dir).
    pub fn push(
        &self,
        target: Option<&str>,
        local: &str,
        remote: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<TransferReport> {
        let target = self.target(target)?;
        ensure_reachable(self.shell.as_ref(), &target, self.settings.connect_timeout())?;
        let job = SyncJob::push(local, &target.path(remote));
        self.shell.transfer(&target, &job, progress)
    }

    /// Copy `remote` (relative to the base dir) down to `local`.
    pub fn pull(
        &self,
        target: Option<&str>,
        remote: &str,
        local: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<TransferReport> {
        let target = self.target(target)?;
        ensure_reachable(self.shell.as_ref(), &target, self.settings.connect_timeout())?;
        let job = SyncJob::pull(&target.path(remote), local);
        self.shell.transfer(&target, &job, progress)
    }

    pub fn health(&self, target: Option<&str>) -> Result<TargetHealth> {
        let target = self.target(target)?;
        ensure_reachable(self.shell.as_ref(), &target, self.settings.connect_timeout())?;
        health::check(self.shell.as_ref(), &target)
    }

    // -- instance ----------------------------------------------------------

    pub fn instance_report(&self, now: DateTime<Utc>) -> Result<InstanceReport> {
        let description = self.instance.describe()?;
        let auto_stop = self.auto_stop.is_enabled()?;
        let uptime_hours = description.as_ref().and_then(|d| running_hours(d, now));
        let warning = description
            .as_ref()
            .and_then(|d| cost_warning(d, now, &self.settings.uptime_alert, auto_stop));
        Ok(InstanceReport {
            name: self.instance.name().to_string(),
            description,
            uptime_hours,
            auto_stop,
            warning,
        })
    }

    pub fn instance_start(&self) -> Result<InstanceDescription> {
        self.instance.start()
    }

    pub fn instance_stop(&self) -> Result<StopOutcome> {
        self.instance.stop()
    }

    pub fn instance_address(&self) -> Result<String> {
        self.instance.address()
    }
}
