//! In-memory remote hosts for testing.
//!
//! `FakeRemote` plays every remote collaborator at once: it is a
//! `RemoteShell`, a `SessionBackend` and a `ContainerBackend`. Each target
//! name gets its own simulated host with sessions, log files, an image store
//! and containers. The operator's local image store is shared. Every call is
//! recorded so tests can assert on what did (and did not) happen, and a
//! handful of switches inject failures.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sha2::{Digest, Sha256};

use crate::deploy::identity::Identity;
use crate::deploy::unit::DeployUnit;
use crate::error::{OutpostError, Result};
use crate::infrastructure::runner::{CommandOutput, LineSink, StreamHandle};
use crate::rig::config::Target;
use crate::rig::remote::{connectivity, RemoteShell};
use crate::rig::sync::{SyncJob, TransferReport};

use super::{ContainerBackend, LocalImage, SessionBackend, SessionLaunch};


// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct FakeImage {
    id: String,
    source_digest: Option<String>,
}

#[derive(Debug, Default)]
struct Host {
    unreachable: bool,
    sessions: HashSet<String>,
    files: HashMap<String, Vec<String>>,
    images: HashMap<String, FakeImage>,
    containers: HashMap<String, FakeImage>,
    run_responses: VecDeque<CommandOutput>,
}

#[derive(Debug, Default)]
struct State {
    hosts: HashMap<String, Host>,
    local_images: HashMap<String, FakeImage>,
    calls: Vec<String>,
    inputs: Vec<String>,
    transfers: Vec<SyncJob>,
    builds: usize,
    remote_builds: usize,
    shipments: usize,
    bytes_shipped: u64,
    fail_build: bool,
    fail_ship: bool,
    fail_load: bool,
    fail_pull: bool,
}

/// Bytes a simulated image shipment reports.
pub const SHIPMENT_BYTES: u64 = 1 << 20;

/// Deterministic fake image ID for an image built from `digest`.
pub fn fake_image_id(image: &str, digest: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.as_bytes());
    hasher.update([0u8]);
    hasher.update(digest.as_bytes());
    format!("sha256:{}", hex::encode(hasher.finalize()))
}


// ---------------------------------------------------------------------------
// FakeRemote
// ---------------------------------------------------------------------------

/// Shared handle on a set of simulated hosts. Clones see the same state.
#[derive(Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<State>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record a call against a reachable target and hand back its host.
    fn with_host<T>(
        &self,
        target: &Target,
        call: String,
        f: impl FnOnce(&mut Host) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.lock();
        state.calls.push(call);
        let host = state.hosts.entry(target.name.clone()).or_default();
        if host.unreachable {
            return Err(connectivity(target, "connection timed out"));
        }
        f(host)
    }

    // -- switches ----------------------------------------------------------

    pub fn set_reachable(&self, target: &str, reachable: bool) {
        self.lock()
            .hosts
            .entry(target.to_string())
            .or_default()
            .unreachable = !reachable;
    }

    /// Queue a response for the next `run` on `target`. Unscripted runs
    /// succeed with empty output.
    pub fn push_run_response(&self, target: &str, output: CommandOutput) {
        self.lock()
            .hosts
            .entry(target.to_string())
            .or_default()
            .run_responses
            .push_back(output);
    }

    pub fn fail_build(&self, fail: bool) {
        self.lock().fail_build = fail;
    }

    pub fn fail_ship(&self, fail: bool) {
        self.lock().fail_ship = fail;
    }

    /// Shipments complete but the image never lands in the target's store.
    pub fn fail_load(&self, fail: bool) {
        self.lock().fail_load = fail;
    }

    pub fn fail_pull(&self, fail: bool) {
        self.lock().fail_pull = fail;
    }

    // -- sessions and logs -------------------------------------------------

    /// Mark a session as running without launching anything.
    pub fn add_session(&self, target: &str, name: &str) {
        self.lock()
            .hosts
            .entry(target.to_string())
            .or_default()
            .sessions
            .insert(name.to_string());
    }

    /// Simulate the job exiting: the session disappears, the log stays.
    pub fn end_session(&self, target: &str, name: &str) {
        self.lock()
            .hosts
            .entry(target.to_string())
            .or_default()
            .sessions
            .remove(name);
    }

    pub fn has_session(&self, target: &str, name: &str) -> bool {
        self.lock()
            .hosts
            .get(target)
            .map(|h| h.sessions.contains(name))
            .unwrap_or(false)
    }

    pub fn append_log(&self, target: &str, path: &str, line: &str) {
        self.lock()
            .hosts
            .entry(target.to_string())
            .or_default()
            .files
            .entry(path.to_string())
            .or_default()
            .push(line.to_string());
    }

    /// Contents of a file on a host, `None` when it does not exist.
    pub fn file(&self, target: &str, path: &str) -> Option<Vec<String>> {
        self.lock()
            .hosts
            .get(target)
            .and_then(|h| h.files.get(path).cloned())
    }

    // -- images and containers ---------------------------------------------

    pub fn add_local_image(&self, image: &str, id: &str, source_digest: Option<&str>) {
        self.lock().local_images.insert(
            image.to_string(),
            FakeImage {
                id: id.to_string(),
                source_digest: source_digest.map(|s| s.to_string()),
            },
        );
    }

    pub fn add_remote_image(&self, target: &str, image: &str, id: &str) {
        self.lock()
            .hosts
            .entry(target.to_string())
            .or_default()
            .images
            .insert(
                image.to_string(),
                FakeImage {
                    id: id.to_string(),
                    source_digest: None,
                },
            );
    }

    /// Put a running container on a host.
    pub fn add_container(&self, target: &str, name: &str, image_id: &str, source_digest: Option<&str>) {
        self.lock()
            .hosts
            .entry(target.to_string())
            .or_default()
            .containers
            .insert(
                name.to_string(),
                FakeImage {
                    id: image_id.to_string(),
                    source_digest: source_digest.map(|s| s.to_string()),
                },
            );
    }

    /// Image ID behind a running container.
    pub fn container_image(&self, target: &str, name: &str) -> Option<String> {
        self.lock()
            .hosts
            .get(target)
            .and_then(|h| h.containers.get(name).map(|c| c.id.clone()))
    }

    // -- observations ------------------------------------------------------

    /// Every call made, in order, as `op:target[:detail]`.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls other than liveness probes.
    pub fn non_probe_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.starts_with("probe:"))
            .collect()
    }

    pub fn inputs(&self) -> Vec<String> {
        self.lock().inputs.clone()
    }

    pub fn transfers(&self) -> Vec<SyncJob> {
        self.lock().transfers.clone()
    }

    pub fn builds(&self) -> usize {
        self.lock().builds
    }

    pub fn remote_builds(&self) -> usize {
        self.lock().remote_builds
    }

    pub fn shipments(&self) -> usize {
        self.lock().shipments
    }

    pub fn bytes_shipped(&self) -> u64 {
        self.lock().bytes_shipped
    }
}


// ---------------------------------------------------------------------------
// RemoteShell
// ---------------------------------------------------------------------------

impl RemoteShell for FakeRemote {
    fn reachable(&self, target: &Target, _timeout: Duration) -> bool {
        let mut state = self.lock();
        state.calls.push(format!("probe:{}", target.name));
        !state
            .hosts
            .get(&target.name)
            .map(|h| h.unreachable)
            .unwrap_or(false)
    }

    fn run(&self, target: &Target, command: &str) -> Result<CommandOutput> {
        self.with_host(target, format!("run:{}:{}", target.name, command), |host| {
            Ok(host
                .run_responses
                .pop_front()
                .unwrap_or_else(|| CommandOutput::ok("")))
        })
    }

    fn run_with_input(&self, target: &Target, command: &str, input: &str) -> Result<CommandOutput> {
        self.lock().inputs.push(input.to_string());
        self.run(target, command)
    }

    fn pipe_from_local(
        &self,
        local_command: &str,
        target: &Target,
        remote_command: &str,
        _progress: &mut dyn FnMut(&str),
    ) -> Result<CommandOutput> {
        let call = format!("pipe:{}:{} | {}", target.name, local_command, remote_command);
        self.with_host(target, call, |_| Ok(CommandOutput::ok("")))
    }

    fn transfer(
        &self,
        target: &Target,
        job: &SyncJob,
        progress: &mut dyn FnMut(&str),
    ) -> Result<TransferReport> {
        let fail = self.lock().fail_ship;
        self.with_host(target, format!("transfer:{}:{}", target.name, job.remote_path), |_| {
            if fail {
                return Err(connectivity(target, "connection reset by peer"));
            }
            Ok(())
        })?;
        progress("sending incremental file list");
        self.lock().transfers.push(job.clone());
        Ok(TransferReport {
            bytes_sent: Some(4096),
        })
    }

    fn stream(&self, target: &Target, command: &str, _sink: LineSink) -> Result<Box<dyn StreamHandle>> {
        self.with_host(target, format!("stream:{}:{}", target.name, command), |_| Ok(()))?;
        Ok(Box::new(FakeStream {
            stop: Arc::new(AtomicBool::new(true)),
            reader: None,
        }))
    }
}


// ---------------------------------------------------------------------------
// SessionBackend
// ---------------------------------------------------------------------------

struct FakeStream {
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl StreamHandle for FakeStream {
    fn stop(mut self: Box<Self>) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

impl SessionBackend for FakeRemote {
    fn session_exists(&self, target: &Target, name: &str) -> Result<bool> {
        self.with_host(target, format!("has_session:{}:{}", target.name, name), |host| {
            Ok(host.sessions.contains(name))
        })
    }

    fn create_session(&self, target: &Target, launch: &SessionLaunch) -> Result<()> {
        self.with_host(target, format!("create_session:{}:{}", target.name, launch.name), |host| {
            if host.sessions.contains(&launch.name) {
                return Err(OutpostError::AlreadyRunning {
                    session: launch.name.clone(),
                    target: target.name.clone(),
                });
            }
            host.files.insert(launch.log_path.clone(), Vec::new());
            host.sessions.insert(launch.name.clone());
            Ok(())
        })
    }

    fn kill_session(&self, target: &Target, name: &str) -> Result<bool> {
        self.with_host(target, format!("kill_session:{}:{}", target.name, name), |host| {
            Ok(host.sessions.remove(name))
        })
    }

    fn log_exists(&self, target: &Target, path: &str) -> Result<bool> {
        self.with_host(target, format!("log_exists:{}:{}", target.name, path), |host| {
            Ok(host.files.contains_key(path))
        })
    }

    fn tail_log(&self, target: &Target, path: &str, lines: usize) -> Result<Vec<String>> {
        self.with_host(target, format!("tail:{}:{}", target.name, path), |host| {
            let content = host.files.get(path).cloned().unwrap_or_default();
            let start = content.len().saturating_sub(lines);
            Ok(content[start..].to_vec())
        })
    }

    fn follow_log(&self, target: &Target, path: &str, mut sink: LineSink) -> Result<Box<dyn StreamHandle>> {
        self.with_host(target, format!("follow:{}:{}", target.name, path), |_| Ok(()))?;
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = stop.clone();
        let state = self.state.clone();
        let host_name = target.name.clone();
        let path = path.to_string();
        let reader = thread::spawn(move || {
            let mut delivered = 0usize;
            loop {
                let stopping = stop_flag.load(Ordering::SeqCst);
                let fresh: Vec<String> = {
                    let state = state.lock().unwrap_or_else(|p| p.into_inner());
                    state
                        .hosts
                        .get(&host_name)
                        .and_then(|h| h.files.get(&path))
                        .map(|lines| lines.iter().skip(delivered).cloned().collect())
                        .unwrap_or_default()
                };
                delivered += fresh.len();
                for line in fresh {
                    sink(line);
                }
                if stopping {
                    break;
                }
                thread::sleep(Duration::from_millis(5));
            }
        });
        Ok(Box::new(FakeStream {
            stop,
            reader: Some(reader),
        }))
    }

    fn retire_log(&self, target: &Target, path: &str) -> Result<()> {
        self.with_host(target, format!("retire_log:{}:{}", target.name, path), |host| {
            if let Some(content) = host.files.remove(path) {
                host.files.insert(format!("{}.prev", path), content);
            }
            Ok(())
        })
    }
}


// ---------------------------------------------------------------------------
// ContainerBackend
// ---------------------------------------------------------------------------

impl ContainerBackend for FakeRemote {
    fn local_image(&self, image: &str) -> Result<Option<LocalImage>> {
        let mut state = self.lock();
        state.calls.push(format!("local_image:{}", image));
        Ok(state.local_images.get(image).map(|i| LocalImage {
            id: i.id.clone(),
            source_digest: i.source_digest.clone(),
        }))
    }

    fn build_local(&self, unit: &DeployUnit, source_digest: &str) -> Result<String> {
        let mut state = self.lock();
        state.calls.push(format!("build_local:{}", unit.name));
        if state.fail_build {
            return Err(OutpostError::DeploymentBuild {
                unit: unit.name.clone(),
                message: "simulated build failure".into(),
            });
        }
        state.builds += 1;
        let id = fake_image_id(&unit.image, source_digest);
        state.local_images.insert(
            unit.image.clone(),
            FakeImage {
                id: id.clone(),
                source_digest: Some(source_digest.to_string()),
            },
        );
        Ok(id)
    }

    fn running_identity(&self, target: &Target, container: &str) -> Result<Identity> {
        self.with_host(target, format!("inspect:{}:{}", target.name, container), |host| {
            Ok(host
                .containers
                .get(container)
                .map(|c| Identity::Known(c.id.clone()))
                .unwrap_or(Identity::Absent))
        })
    }

    fn running_label(&self, target: &Target, container: &str, _label: &str) -> Result<Option<String>> {
        self.with_host(target, format!("inspect_label:{}:{}", target.name, container), |host| {
            Ok(host
                .containers
                .get(container)
                .and_then(|c| c.source_digest.clone()))
        })
    }

    fn image_identity(&self, target: &Target, image: &str) -> Result<Identity> {
        self.with_host(target, format!("image_inspect:{}:{}", target.name, image), |host| {
            Ok(host
                .images
                .get(image)
                .map(|i| Identity::Known(i.id.clone()))
                .unwrap_or(Identity::Absent))
        })
    }

    fn ship(&self, target: &Target, image: &str, progress: &mut dyn FnMut(&str)) -> Result<Option<u64>> {
        let (local, fail_ship, fail_load) = {
            let state = self.lock();
            (state.local_images.get(image).cloned(), state.fail_ship, state.fail_load)
        };
        let local = local.ok_or_else(|| OutpostError::Local {
            command: format!("docker save {}", image),
            message: format!("No such image: {}", image),
        })?;
        self.with_host(target, format!("ship:{}:{}", target.name, image), |host| {
            if fail_ship {
                return Err(connectivity(target, "broken pipe"));
            }
            if !fail_load {
                host.images.insert(image.to_string(), local.clone());
            }
            Ok(())
        })?;
        progress("Loaded image");
        let mut state = self.lock();
        state.shipments += 1;
        state.bytes_shipped += SHIPMENT_BYTES;
        Ok(Some(SHIPMENT_BYTES))
    }

    fn registry_login(&self, target: &Target, registry: &str, _username: &str, token: &str) -> Result<()> {
        self.lock().inputs.push(token.to_string());
        self.with_host(target, format!("login:{}:{}", target.name, registry), |_| Ok(()))
    }

    fn pull_image(&self, target: &Target, image: &str) -> Result<()> {
        let fail = self.lock().fail_pull;
        self.with_host(target, format!("pull:{}:{}", target.name, image), |host| {
            if fail {
                return Err(OutpostError::Remote {
                    target: target.name.clone(),
                    command: format!("docker pull {}", image),
                    exit_code: 1,
                    stderr: "unauthorized: authentication required".into(),
                });
            }
            host.images.insert(
                image.to_string(),
                FakeImage {
                    id: fake_image_id(image, "registry"),
                    source_digest: None,
                },
            );
            Ok(())
        })
    }

    fn build_remote(
        &self,
        target: &Target,
        unit: &DeployUnit,
        _context_dir: &str,
        source_digest: &str,
    ) -> Result<Identity> {
        let fail = self.lock().fail_build;
        let base = unit.base.as_ref().map(|b| b.image.clone());
        let id = self.with_host(target, format!("build_remote:{}:{}", target.name, unit.name), |host| {
            if fail {
                return Err(OutpostError::DeploymentBuild {
                    unit: unit.name.clone(),
                    message: "simulated remote build failure".into(),
                });
            }
            if let Some(base) = &base {
                if !host.images.contains_key(base) {
                    return Err(OutpostError::DeploymentBuild {
                        unit: unit.name.clone(),
                        message: format!("base image {} not present", base),
                    });
                }
            }
            let id = fake_image_id(&unit.image, source_digest);
            host.images.insert(
                unit.image.clone(),
                FakeImage {
                    id: id.clone(),
                    source_digest: Some(source_digest.to_string()),
                },
            );
            Ok(id)
        })?;
        self.lock().remote_builds += 1;
        Ok(Identity::Known(id))
    }

    fn replace(&self, target: &Target, unit: &DeployUnit, image: &str) -> Result<()> {
        self.with_host(target, format!("replace:{}:{}", target.name, unit.name), |host| {
            let loaded = host.images.get(image).cloned().ok_or_else(|| OutpostError::Remote {
                target: target.name.clone(),
                command: format!("docker run {}", image),
                exit_code: 125,
                stderr: format!("Unable to find image '{}' locally", image),
            })?;
            host.containers.insert(unit.name.clone(), loaded);
            Ok(())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::rig::config::TargetKind;

    fn target(name: &str) -> Target {
        Target {
            name: name.into(),
            kind: TargetKind::Edge,
            host: format!("{}.local", name),
            port: 22,
            user: "root".into(),
            base_dir: "/data".into(),
            identity_file: None,
        }
    }

    #[test]
    fn hosts_are_independent() {
        let fake = FakeRemote::new();
        fake.create_session(
            &target("a"),
            &SessionLaunch {
                name: "build".into(),
                cwd: "/data".into(),
                command: "make".into(),
                log_path: "/data/build.log".into(),
            },
        )
        .unwrap();
        assert!(fake.session_exists(&target("a"), "build").unwrap());
        assert!(!fake.session_exists(&target("b"), "build").unwrap());
    }

    #[test]
    fn second_create_keeps_running_log() {
        let fake = FakeRemote::new();
        let launch = SessionLaunch {
            name: "build".into(),
            cwd: "/data".into(),
            command: "make".into(),
            log_path: "/data/build.log".into(),
        };
        fake.create_session(&target("a"), &launch).unwrap();
        fake.append_log("a", "/data/build.log", "compiling");
        let err = fake.create_session(&target("a"), &launch).unwrap_err();
        assert!(matches!(err, OutpostError::AlreadyRunning { .. }));
        assert_eq!(fake.file("a", "/data/build.log").unwrap(), vec!["compiling"]);
    }

    #[test]
    fn unreachable_host_fails_calls_with_connectivity() {
        let fake = FakeRemote::new();
        fake.set_reachable("a", false);
        assert!(!fake.reachable(&target("a"), Duration::from_secs(1)));
        let err = fake.run(&target("a"), "true").unwrap_err();
        assert!(matches!(err, OutpostError::Connectivity { .. }));
    }

    #[test]
    fn follow_delivers_existing_and_appended_lines() {
        let fake = FakeRemote::new();
        fake.append_log("a", "/log", "one");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let handle = fake
            .follow_log(&target("a"), "/log", Box::new(move |l| sink_seen.lock().unwrap().push(l)))
            .unwrap();
        fake.append_log("a", "/log", "two");
        thread::sleep(Duration::from_millis(30));
        handle.stop();
        assert_eq!(*seen.lock().unwrap(), vec!["one", "two"]);
    }

    #[test]
    fn retire_log_moves_to_prev() {
        let fake = FakeRemote::new();
        fake.append_log("a", "/log", "x");
        fake.retire_log(&target("a"), "/log").unwrap();
        assert!(fake.file("a", "/log").is_none());
        assert_eq!(fake.file("a", "/log.prev").unwrap(), vec!["x"]);
    }

    #[test]
    fn failed_load_leaves_image_store_untouched() {
        let fake = FakeRemote::new();
        fake.add_local_image("cam:latest", "sha256:new", None);
        fake.fail_load(true);
        fake.ship(&target("a"), "cam:latest", &mut |_| {}).unwrap();
        assert_eq!(
            fake.image_identity(&target("a"), "cam:latest").unwrap(),
            Identity::Absent
        );
    }
}
