//! Deployment syncer: content-aware, idempotent deploys of container
//! workloads to targets.
//!
//! Single-phase units are built on the operator's machine, identified by
//! their full image ID, and shipped only when the target runs something
//! else. Two-phase units (those with a base layer) are identified by the
//! digest of their build context: the target pulls the base once from its
//! registry, receives only the application context, and builds it locally.
//!
//! The running container is replaced only after the new image is confirmed
//! present on the target. Any earlier failure leaves it untouched.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{OutpostError, Result};
use crate::infrastructure::{ContainerBackend, SOURCE_DIGEST_LABEL};
use crate::rig::config::Target;
use crate::rig::remote::{ensure_reachable, RemoteShell};
use crate::rig::sync::SyncJob;

use super::identity::{source_digest, Identity};
use super::secrets::SecretsStore;
use super::unit::{BaseLayer, DeployUnit};


// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployStatus {
    Deployed,
    Skipped,
}

/// Result of one deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub unit: String,
    pub target: String,
    pub status: DeployStatus,
    /// Identity now running on the target.
    pub identity: String,
    /// Digest of the build context the identity was built from.
    pub source_digest: String,
    /// Whether this deploy built an image.
    pub built: bool,
    /// Bytes put on the wire for the artifact or context, when the
    /// transport reported them. `Some(0)` for a skipped deploy.
    pub bytes_sent: Option<u64>,
}

/// Identities on both sides of a unit, computed without changing anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitState {
    pub unit: String,
    pub target: String,
    pub source_digest: String,
    /// For single-phase units, the local image when it was built from the
    /// current context.
    pub local_identity: Identity,
    pub remote_identity: Identity,
    pub up_to_date: bool,
}


// ---------------------------------------------------------------------------
// DeploymentSyncer
// ---------------------------------------------------------------------------

pub struct DeploymentSyncer {
    shell: Arc<dyn RemoteShell>,
    containers: Arc<dyn ContainerBackend>,
    secrets: Arc<dyn SecretsStore>,
    probe_timeout: Duration,
}

impl DeploymentSyncer {
    pub fn new(
        shell: Arc<dyn RemoteShell>,
        containers: Arc<dyn ContainerBackend>,
        secrets: Arc<dyn SecretsStore>,
        probe_timeout: Duration,
    ) -> Self {
        DeploymentSyncer {
            shell,
            containers,
            secrets,
            probe_timeout,
        }
    }

    /// Deploy `unit` to `target`, skipping every transfer and restart when
    /// the target already runs the current artifact.
    pub fn deploy(
        &self,
        unit: &DeployUnit,
        target: &Target,
        progress: &mut dyn FnMut(&str),
    ) -> Result<DeployOutcome> {
        unit.validate()?;
        ensure_reachable(self.shell.as_ref(), target, self.probe_timeout)?;
        let digest = self.digest(unit)?;
        match &unit.base {
            Some(base) => self.deploy_two_phase(unit, base, target, &digest, progress),
            None => self.deploy_image(unit, target, &digest, progress),
        }
    }

    /// Report both identities of `unit` without building or shipping.
    pub fn inspect(&self, unit: &DeployUnit, target: &Target) -> Result<UnitState> {
        unit.validate()?;
        ensure_reachable(self.shell.as_ref(), target, self.probe_timeout)?;
        let digest = self.digest(unit)?;
        let remote_identity = self.containers.running_identity(target, &unit.name)?;
        let (local_identity, up_to_date) = if unit.is_two_phase() {
            let label = self
                .containers
                .running_label(target, &unit.name, SOURCE_DIGEST_LABEL)?;
            (Identity::Absent, label.as_deref() == Some(digest.as_str()))
        } else {
            let local = match self.containers.local_image(&unit.image)? {
                Some(img) if img.source_digest.as_deref() == Some(digest.as_str()) => {
                    Identity::Known(img.id)
                }
                _ => Identity::Absent,
            };
            let same = local.matches(&remote_identity);
            (local, same)
        };
        Ok(UnitState {
            unit: unit.name.clone(),
            target: target.name.clone(),
            source_digest: digest,
            local_identity,
            remote_identity,
            up_to_date,
        })
    }

    fn digest(&self, unit: &DeployUnit) -> Result<String> {
        source_digest(Path::new(&unit.context), &unit.context_excludes()).map_err(|e| match e {
            OutpostError::DeploymentBuild { message, .. } => OutpostError::DeploymentBuild {
                unit: unit.name.clone(),
                message,
            },
            other => other,
        })
    }

    // -- single phase ------------------------------------------------------

    fn deploy_image(
        &self,
        unit: &DeployUnit,
        target: &Target,
        digest: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<DeployOutcome> {
        let (local_id, built) = self.local_artifact(unit, digest)?;
        let local = Identity::Known(local_id.clone());
        let remote = self.containers.running_identity(target, &unit.name)?;

        if local.matches(&remote) {
            info!(unit = %unit.name, remote = %target.name, identity = %local_id, "unchanged; skipped");
            return Ok(self.outcome(unit, target, DeployStatus::Skipped, local_id, digest, built, Some(0)));
        }
        debug!(unit = %unit.name, local = %local, remote = %remote, "identities differ");

        let bytes_sent = self
            .containers
            .ship(target, &unit.image, progress)
            .map_err(|e| transfer_error(unit, target, e))?;

        let loaded = self
            .containers
            .image_identity(target, &unit.image)
            .map_err(|e| load_error(unit, target, e.to_string()))?;
        if !loaded.matches(&local) {
            return Err(load_error(
                unit,
                target,
                format!("target has {} after load, expected {}", loaded, local_id),
            ));
        }

        self.containers.replace(target, unit, &unit.image)?;
        info!(unit = %unit.name, remote = %target.name, identity = %local_id, "deployed");
        Ok(self.outcome(unit, target, DeployStatus::Deployed, local_id, digest, built, bytes_sent))
    }

    /// The local image for the current context, building only when the
    /// existing image was built from different sources.
    fn local_artifact(&self, unit: &DeployUnit, digest: &str) -> Result<(String, bool)> {
        if let Some(image) = self.containers.local_image(&unit.image)? {
            if image.source_digest.as_deref() == Some(digest) {
                debug!(unit = %unit.name, id = %image.id, "local image is current");
                return Ok((image.id, false));
            }
        }
        info!(unit = %unit.name, "building image");
        Ok((self.containers.build_local(unit, digest)?, true))
    }

    // -- two phase ---------------------------------------------------------

    fn deploy_two_phase(
        &self,
        unit: &DeployUnit,
        base: &BaseLayer,
        target: &Target,
        digest: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<DeployOutcome> {
        let running = self
            .containers
            .running_label(target, &unit.name, SOURCE_DIGEST_LABEL)?;
        if running.as_deref() == Some(digest) {
            let identity = self.containers.running_identity(target, &unit.name)?;
            info!(unit = %unit.name, remote = %target.name, "unchanged; skipped");
            return Ok(self.outcome(
                unit,
                target,
                DeployStatus::Skipped,
                identity.to_string(),
                digest,
                false,
                Some(0),
            ));
        }

        self.ensure_base(unit, base, target)?;

        let context_dir = target.path(&format!("deploy/{}", unit.name));
        let job = SyncJob::push(&unit.context, &context_dir).exclude(unit.context_excludes());
        let report = self
            .shell
            .transfer(target, &job, progress)
            .map_err(|e| transfer_error(unit, target, e))?;

        info!(unit = %unit.name, remote = %target.name, "building on target");
        let identity = self
            .containers
            .build_remote(target, unit, &context_dir, digest)
            .map_err(|e| match e {
                OutpostError::DeploymentBuild { .. } => e,
                other => OutpostError::DeploymentBuild {
                    unit: unit.name.clone(),
                    message: other.to_string(),
                },
            })?;

        self.containers.replace(target, unit, &unit.image)?;
        info!(unit = %unit.name, remote = %target.name, identity = %identity, "deployed");
        Ok(self.outcome(
            unit,
            target,
            DeployStatus::Deployed,
            identity.to_string(),
            digest,
            true,
            report.bytes_sent,
        ))
    }

    /// Make sure the base image is in the target's store, having the target
    /// pull it from its registry when it is not.
    fn ensure_base(&self, unit: &DeployUnit, base: &BaseLayer, target: &Target) -> Result<()> {
        if let Identity::Known(id) = self.containers.image_identity(target, &base.image)? {
            debug!(unit = %unit.name, base = %base.image, %id, "base layer cached on target");
            return Ok(());
        }
        info!(unit = %unit.name, base = %base.image, remote = %target.name, "fetching base layer on target");
        let token = self.secrets.resolve(&base.secret_key)?;
        self.containers
            .registry_login(target, &base.registry, &base.username, &token)
            .map_err(|e| transfer_error(unit, target, e))?;
        self.containers
            .pull_image(target, &base.image)
            .map_err(|e| transfer_error(unit, target, e))?;
        match self.containers.image_identity(target, &base.image)? {
            Identity::Known(_) => Ok(()),
            Identity::Absent => Err(OutpostError::DeploymentTransfer {
                unit: unit.name.clone(),
                target: target.name.clone(),
                message: format!("base image {} missing after pull", base.image),
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn outcome(
        &self,
        unit: &DeployUnit,
        target: &Target,
        status: DeployStatus,
        identity: String,
        digest: &str,
        built: bool,
        bytes_sent: Option<u64>,
    ) -> DeployOutcome {
        DeployOutcome {
            unit: unit.name.clone(),
            target: target.name.clone(),
            status,
            identity,
            source_digest: digest.to_string(),
            built,
            bytes_sent,
        }
    }
}

fn transfer_error(unit: &DeployUnit, target: &Target, e: OutpostError) -> OutpostError {
    OutpostError::DeploymentTransfer {
        unit: unit.name.clone(),
        target: target.name.clone(),
        message: e.to_string(),
    }
}

fn load_error(unit: &DeployUnit, target: &Target, message: String) -> OutpostError {
    OutpostError::DeploymentLoad {
        unit: unit.name.clone(),
        target: target.name.clone(),
        message,
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::deploy::secrets::StaticSecrets;
    use crate::infrastructure::mock::FakeRemote;
    use crate::rig::config::TargetKind;
    use std::fs;

    fn target() -> Target {
        Target {
            name: "controller".into(),
            kind: TargetKind::Edge,
            host: "edge-controller.local".into(),
            port: 22,
            user: "root".into(),
            base_dir: "/data".into(),
            identity_file: None,
        }
    }

    fn syncer(fake: &FakeRemote) -> DeploymentSyncer {
        DeploymentSyncer::new(
            Arc::new(fake.clone()),
            Arc::new(fake.clone()),
            Arc::new(StaticSecrets::new().with("ngc/api-key", "nvapi-123")),
            Duration::from_secs(5),
        )
    }

    fn context(main: &str) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Dockerfile"), "FROM python:3.11-slim\nCOPY . /app\n").unwrap();
        fs::write(dir.path().join("main.py"), main).unwrap();
        dir
    }

    fn unit(ctx: &tempfile::TempDir) -> DeployUnit {
        DeployUnit::new("squirrel-cam", &ctx.path().display().to_string(), "squirrel-cam:latest")
    }

    fn two_phase(ctx: &tempfile::TempDir) -> DeployUnit {
        let mut u = DeployUnit::new("detector", &ctx.path().display().to_string(), "detector:latest");
        u.base = Some(BaseLayer {
            image: "nvcr.io/nvidia/deepstream:7.0-triton".into(),
            registry: "nvcr.io".into(),
            username: "$oauthtoken".into(),
            secret_key: "ngc/api-key".into(),
        });
        u
    }

    #[test]
    fn fresh_deploy_ships_and_swaps() {
        let fake = FakeRemote::new();
        let ctx = context("print('v1')\n");
        let out = syncer(&fake).deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap();
        assert_eq!(out.status, DeployStatus::Deployed);
        assert!(out.built);
        assert_eq!(fake.shipments(), 1);
        assert_eq!(out.bytes_sent, Some(fake.bytes_shipped()));
        assert!(out.bytes_sent.unwrap_or(0) > 0);
        assert_eq!(
            fake.container_image("controller", "squirrel-cam").as_deref(),
            Some(out.identity.as_str())
        );
    }

    #[test]
    fn unchanged_redeploy_builds_once_and_skips() {
        let fake = FakeRemote::new();
        let ctx = context("print('v1')\n");
        let s = syncer(&fake);
        let first = s.deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap();
        let second = s.deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap();
        assert_eq!(second.status, DeployStatus::Skipped);
        assert_eq!(second.identity, first.identity);
        assert_eq!(second.bytes_sent, Some(0));
        assert_eq!(fake.builds(), 1);
        assert_eq!(fake.shipments(), 1);
    }

    #[test]
    fn changed_redeploy_replaces_container() {
        let fake = FakeRemote::new();
        let ctx = context("print('v1')\n");
        let s = syncer(&fake);
        let first = s.deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap();
        fs::write(ctx.path().join("main.py"), "print('v2')\n").unwrap();
        let second = s.deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap();
        assert_eq!(second.status, DeployStatus::Deployed);
        assert_ne!(second.identity, first.identity);
        assert_eq!(
            fake.container_image("controller", "squirrel-cam").as_deref(),
            Some(second.identity.as_str())
        );
    }

    #[test]
    fn failed_load_keeps_old_unit_running() {
        let fake = FakeRemote::new();
        let ctx = context("print('v1')\n");
        let s = syncer(&fake);
        let first = s.deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap();

        fs::write(ctx.path().join("main.py"), "print('v2')\n").unwrap();
        fake.fail_load(true);
        let err = s.deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap_err();
        assert!(matches!(err, OutpostError::DeploymentLoad { .. }));
        assert_eq!(
            fake.container_image("controller", "squirrel-cam").as_deref(),
            Some(first.identity.as_str())
        );
    }

    #[test]
    fn failed_transfer_keeps_old_unit_running() {
        let fake = FakeRemote::new();
        let ctx = context("print('v1')\n");
        let s = syncer(&fake);
        let first = s.deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap();

        fs::write(ctx.path().join("main.py"), "print('v2')\n").unwrap();
        fake.fail_ship(true);
        let err = s.deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap_err();
        assert!(matches!(err, OutpostError::DeploymentTransfer { .. }));
        assert_eq!(
            fake.container_image("controller", "squirrel-cam").as_deref(),
            Some(first.identity.as_str())
        );
    }

    #[test]
    fn build_failure_touches_nothing_remote() {
        let fake = FakeRemote::new();
        fake.fail_build(true);
        let ctx = context("print('v1')\n");
        let err = syncer(&fake).deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap_err();
        assert!(matches!(err, OutpostError::DeploymentBuild { .. }));
        assert_eq!(fake.shipments(), 0);
        assert!(!fake.calls().iter().any(|c| c.starts_with("replace:")));
    }

    #[test]
    fn unreachable_target_is_probed_before_build() {
        let fake = FakeRemote::new();
        fake.set_reachable("controller", false);
        let ctx = context("print('v1')\n");
        let err = syncer(&fake).deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap_err();
        assert!(matches!(err, OutpostError::Connectivity { .. }));
        assert!(fake.non_probe_calls().is_empty());
        assert_eq!(fake.builds(), 0);
    }

    #[test]
    fn two_phase_pulls_base_once_and_ships_only_context() {
        let fake = FakeRemote::new();
        let ctx = context("print('v1')\n");
        let s = syncer(&fake);

        let first = s.deploy(&two_phase(&ctx), &target(), &mut |_| {}).unwrap();
        assert_eq!(first.status, DeployStatus::Deployed);
        assert_eq!(fake.inputs(), vec!["nvapi-123"]);
        assert_eq!(fake.transfers().len(), 1);
        assert_eq!(fake.transfers()[0].remote_path, "/data/deploy/detector");
        assert_eq!(fake.shipments(), 0);

        fs::write(ctx.path().join("main.py"), "print('v2')\n").unwrap();
        let second = s.deploy(&two_phase(&ctx), &target(), &mut |_| {}).unwrap();
        assert_eq!(second.status, DeployStatus::Deployed);
        let pulls = fake.calls().iter().filter(|c| c.starts_with("pull:")).count();
        assert_eq!(pulls, 1);
        assert_eq!(fake.remote_builds(), 2);
    }

    #[test]
    fn two_phase_unchanged_is_skipped() {
        let fake = FakeRemote::new();
        let ctx = context("print('v1')\n");
        let s = syncer(&fake);
        s.deploy(&two_phase(&ctx), &target(), &mut |_| {}).unwrap();
        let again = s.deploy(&two_phase(&ctx), &target(), &mut |_| {}).unwrap();
        assert_eq!(again.status, DeployStatus::Skipped);
        assert_eq!(again.bytes_sent, Some(0));
        assert_eq!(fake.remote_builds(), 1);
        assert_eq!(fake.transfers().len(), 1);
    }

    #[test]
    fn two_phase_ignores_files_the_upload_leaves_out() {
        let fake = FakeRemote::new();
        let ctx = context("print('v1')\n");
        let s = syncer(&fake);
        s.deploy(&two_phase(&ctx), &target(), &mut |_| {}).unwrap();

        fs::create_dir(ctx.path().join("__pycache__")).unwrap();
        fs::write(ctx.path().join("__pycache__/main.cpython-311.pyc"), [0u8, 1, 2]).unwrap();
        let again = s.deploy(&two_phase(&ctx), &target(), &mut |_| {}).unwrap();
        assert_eq!(again.status, DeployStatus::Skipped);
        assert_eq!(fake.remote_builds(), 1);
        assert_eq!(fake.transfers().len(), 1);
        for pattern in ["__pycache__", "*.pyc"] {
            assert!(fake.transfers()[0].exclude_patterns.iter().any(|p| p == pattern));
        }
    }

    #[test]
    fn two_phase_pull_failure_is_transfer_error() {
        let fake = FakeRemote::new();
        fake.fail_pull(true);
        let ctx = context("print('v1')\n");
        let err = syncer(&fake).deploy(&two_phase(&ctx), &target(), &mut |_| {}).unwrap_err();
        assert!(matches!(err, OutpostError::DeploymentTransfer { .. }));
        assert!(fake.transfers().is_empty());
    }

    #[test]
    fn inspect_reports_without_changes() {
        let fake = FakeRemote::new();
        let ctx = context("print('v1')\n");
        let s = syncer(&fake);
        let before = s.inspect(&unit(&ctx), &target()).unwrap();
        assert!(!before.up_to_date);
        assert_eq!(before.remote_identity, Identity::Absent);

        s.deploy(&unit(&ctx), &target(), &mut |_| {}).unwrap();
        let after = s.inspect(&unit(&ctx), &target()).unwrap();
        assert!(after.up_to_date);
        assert_eq!(fake.builds(), 1);
    }
}
