//! Docker command builder and the production `ContainerBackend`.
//!
//! Local image operations run through a `CommandRunner` on the operator's
//! machine; everything on a target goes through its `RemoteShell`.

use std::sync::Arc;

use tracing::debug;

use crate::deploy::identity::{parse_image_id, Identity};
use crate::deploy::unit::DeployUnit;
use crate::error::{OutpostError, Result};
use crate::infrastructure::runner::CommandRunner;
use crate::infrastructure::tmux::shell_escape;
use crate::rig::config::Target;
use crate::rig::remote::{run_checked, RemoteShell};

use super::{ContainerBackend, LocalImage, SOURCE_DIGEST_LABEL};


// ---------------------------------------------------------------------------
// Command builder
// ---------------------------------------------------------------------------

/// Builds docker CLI command strings without executing them.
pub struct DockerCommandBuilder;

impl DockerCommandBuilder {
    pub fn new() -> Self {
        DockerCommandBuilder
    }

    /// Image ID and source-digest label of an image, `|`-separated.
    pub fn image_inspect(&self, image: &str) -> String {
        let format = format!("{{{{.Id}}}}|{}", label_template(SOURCE_DIGEST_LABEL));
        format!(
            "docker image inspect --format {} {}",
            shell_escape(&format),
            shell_escape(image)
        )
    }

    /// Image ID only.
    pub fn image_id(&self, image: &str) -> String {
        format!(
            "docker image inspect --format {} {}",
            shell_escape("{{.Id}}"),
            shell_escape(image)
        )
    }

    /// ID of the image a container was created from.
    pub fn container_image(&self, container: &str) -> String {
        format!(
            "docker inspect --format {} {}",
            shell_escape("{{.Image}}"),
            shell_escape(container)
        )
    }

    pub fn container_label(&self, container: &str, label: &str) -> String {
        format!(
            "docker inspect --format {} {}",
            shell_escape(&label_template(label)),
            shell_escape(container)
        )
    }

    /// Quiet build that prints only the resulting image ID.
    pub fn build(&self, image: &str, dockerfile: &str, context: &str, source_digest: &str) -> String {
        format!(
            "docker build -q -t {} --label {} -f {} {}",
            shell_escape(image),
            shell_escape(&format!("{}={}", SOURCE_DIGEST_LABEL, source_digest)),
            shell_escape(dockerfile),
            shell_escape(context)
        )
    }

    /// Local half of an image shipment. `dd` reports the compressed byte
    /// count on stderr once the stream is done.
    pub fn save_compressed(&self, image: &str) -> String {
        format!("docker save {} | gzip -c | dd bs=1M", shell_escape(image))
    }

    /// Remote half of an image shipment.
    pub fn load_compressed(&self) -> String {
        "gunzip -c | docker load".to_string()
    }

    pub fn login(&self, registry: &str, username: &str) -> String {
        format!(
            "docker login {} -u {} --password-stdin",
            shell_escape(registry),
            shell_escape(username)
        )
    }

    pub fn pull(&self, image: &str) -> String {
        format!("docker pull {}", shell_escape(image))
    }

    pub fn stop(&self, container: &str) -> String {
        format!("docker stop {}", shell_escape(container))
    }

    pub fn remove(&self, container: &str) -> String {
        format!("docker rm {}", shell_escape(container))
    }

    pub fn run(&self, unit: &DeployUnit, image: &str) -> String {
        let mut parts: Vec<String> = vec!["docker".into(), "run".into()];
        parts.extend(unit.run_flags().iter().map(|f| shell_escape(f)));
        parts.push(shell_escape(image));
        parts.join(" ")
    }
}

impl Default for DockerCommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn label_template(label: &str) -> String {
    format!("{{{{index .Config.Labels \"{}\"}}}}", label)
}


// ---------------------------------------------------------------------------
// Output parsers
// ---------------------------------------------------------------------------

/// Whether docker stderr says the container or image does not exist.
pub fn is_not_found(stderr: &str) -> bool {
    let lower = stderr.to_ascii_lowercase();
    lower.contains("no such container")
        || lower.contains("no such object")
        || lower.contains("no such image")
}

/// Byte count from the summary `dd` prints on stderr (`N bytes ...` on both
/// GNU and BSD dd).
pub fn parse_dd_bytes(stderr: &str) -> Option<u64> {
    stderr.lines().rev().find_map(|line| {
        let mut words = line.split_whitespace();
        let count = words.next()?.parse::<u64>().ok()?;
        (words.next() == Some("bytes")).then_some(count)
    })
}

/// Normalise a label value printed by a Go template.
fn label_value(raw: &str) -> Option<String> {
    let value = raw.trim();
    if value.is_empty() || value == "<no value>" {
        None
    } else {
        Some(value.to_string())
    }
}


// ---------------------------------------------------------------------------
// DockerBackend
// ---------------------------------------------------------------------------

/// `ContainerBackend` over the docker CLI, locally and on targets.
pub struct DockerBackend {
    builder: DockerCommandBuilder,
    runner: Arc<dyn CommandRunner>,
    shell: Arc<dyn RemoteShell>,
}

impl DockerBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, shell: Arc<dyn RemoteShell>) -> Self {
        DockerBackend {
            builder: DockerCommandBuilder::new(),
            runner,
            shell,
        }
    }

    fn local(&self, command: &str) -> Result<crate::infrastructure::runner::CommandOutput> {
        debug!(command, "local docker");
        self.runner.run(command).map_err(|e| OutpostError::Local {
            command: command.to_string(),
            message: e,
        })
    }

    /// Run a remote docker command whose only tolerated failure is
    /// "no such container/image". `Ok(None)` in that case.
    fn remote_unless_missing(&self, target: &Target, command: &str) -> Result<Option<String>> {
        let out = self.shell.run(target, command)?;
        if out.success() {
            return Ok(Some(out.stdout));
        }
        if is_not_found(&out.stderr) {
            debug!(remote = %target.name, command, "docker: not found");
            return Ok(None);
        }
        Err(OutpostError::Remote {
            target: target.name.clone(),
            command: command.to_string(),
            exit_code: out.exit_code,
            stderr: out.stderr.trim().to_string(),
        })
    }
}

impl ContainerBackend for DockerBackend {
    fn local_image(&self, image: &str) -> Result<Option<LocalImage>> {
        let command = self.builder.image_inspect(image);
        let out = self.local(&command)?;
        if !out.success() {
            if is_not_found(&out.stderr) {
                return Ok(None);
            }
            return Err(OutpostError::Local {
                command,
                message: out.stderr.trim().to_string(),
            });
        }
        let line = out.stdout.trim();
        let (id_part, label_part) = line.split_once('|').unwrap_or((line, ""));
        Ok(parse_image_id(id_part).map(|id| LocalImage {
            id,
            source_digest: label_value(label_part),
        }))
    }

    fn build_local(&self, unit: &DeployUnit, source_digest: &str) -> Result<String> {
        let dockerfile = format!("{}/{}", unit.context.trim_end_matches('/'), unit.dockerfile);
        let command = self.builder.build(&unit.image, &dockerfile, &unit.context, source_digest);
        let out = self.local(&command)?;
        if !out.success() {
            return Err(OutpostError::DeploymentBuild {
                unit: unit.name.clone(),
                message: last_lines(&out.stderr, 5),
            });
        }
        parse_image_id(&out.stdout).ok_or_else(|| OutpostError::DeploymentBuild {
            unit: unit.name.clone(),
            message: format!("no image ID in build output: {}", out.stdout.trim()),
        })
    }

    fn running_identity(&self, target: &Target, container: &str) -> Result<Identity> {
        let command = self.builder.container_image(container);
        Ok(match self.remote_unless_missing(target, &command)? {
            Some(stdout) => match parse_image_id(&stdout) {
                Some(id) => Identity::Known(id),
                None => Identity::Absent,
            },
            None => Identity::Absent,
        })
    }

    fn running_label(&self, target: &Target, container: &str, label: &str) -> Result<Option<String>> {
        let command = self.builder.container_label(container, label);
        Ok(self
            .remote_unless_missing(target, &command)?
            .and_then(|stdout| label_value(&stdout)))
    }

    fn image_identity(&self, target: &Target, image: &str) -> Result<Identity> {
        let command = self.builder.image_id(image);
        Ok(self
            .remote_unless_missing(target, &command)?
            .and_then(|stdout| parse_image_id(&stdout))
            .map(Identity::Known)
            .unwrap_or(Identity::Absent))
    }

    fn ship(&self, target: &Target, image: &str, progress: &mut dyn FnMut(&str)) -> Result<Option<u64>> {
        let local = self.builder.save_compressed(image);
        let remote = self.builder.load_compressed();
        let out = self.shell.pipe_from_local(&local, target, &remote, progress)?;
        if out.success() {
            Ok(parse_dd_bytes(&out.stderr))
        } else {
            Err(OutpostError::Remote {
                target: target.name.clone(),
                command: format!("{} | ssh ... {}", local, remote),
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    fn registry_login(&self, target: &Target, registry: &str, username: &str, token: &str) -> Result<()> {
        let command = self.builder.login(registry, username);
        let out = self.shell.run_with_input(target, &command, token)?;
        if out.success() {
            Ok(())
        } else {
            Err(OutpostError::Remote {
                target: target.name.clone(),
                command,
                exit_code: out.exit_code,
                stderr: out.stderr.trim().to_string(),
            })
        }
    }

    fn pull_image(&self, target: &Target, image: &str) -> Result<()> {
        run_checked(self.shell.as_ref(), target, &self.builder.pull(image))?;
        Ok(())
    }

    fn build_remote(
        &self,
        target: &Target,
        unit: &DeployUnit,
        context_dir: &str,
        source_digest: &str,
    ) -> Result<Identity> {
        let dockerfile = format!("{}/{}", context_dir.trim_end_matches('/'), unit.dockerfile);
        let command = self.builder.build(&unit.image, &dockerfile, context_dir, source_digest);
        let stdout = run_checked(self.shell.as_ref(), target, &command)?;
        parse_image_id(&stdout)
            .map(Identity::Known)
            .ok_or_else(|| OutpostError::DeploymentBuild {
                unit: unit.name.clone(),
                message: format!("no image ID in remote build output: {}", stdout.trim()),
            })
    }

    fn replace(&self, target: &Target, unit: &DeployUnit, image: &str) -> Result<()> {
        self.remote_unless_missing(target, &self.builder.stop(&unit.name))?;
        self.remote_unless_missing(target, &self.builder.remove(&unit.name))?;
        run_checked(self.shell.as_ref(), target, &self.builder.run(unit, image))?;
        Ok(())
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.trim().lines().collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::runner::{CommandOutput, MockRunner};
    use crate::rig::config::TargetKind;
    use crate::rig::remote::SshExecutor;

    const ID_A: &str = "sha256:1111111111111111111111111111111111111111111111111111111111111111";

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

    fn backend(responses: Vec<std::result::Result<CommandOutput, String>>) -> (DockerBackend, Arc<MockRunner>) {
        let runner = Arc::new(MockRunner::with_responses(responses));
        let shell = Arc::new(SshExecutor::new(runner.clone(), 10));
        (DockerBackend::new(runner.clone(), shell), runner)
    }

    #[test]
    fn run_command_carries_unit_bindings() {
        let mut unit = DeployUnit::new("cam", "apps/cam", "cam:latest");
        unit.network = Some("host".into());
        unit.volumes = vec!["/data/models:/models".into()];
        let cmd = DockerCommandBuilder::new().run(&unit, "cam:latest");
        assert!(cmd.starts_with("docker run -d --name cam --restart unless-stopped"));
        assert!(cmd.contains("--network=host"));
        assert!(cmd.contains("-v /data/models:/models"));
        assert!(cmd.ends_with("cam:latest"));
    }

    #[test]
    fn local_image_reads_id_and_label() {
        let (b, _) = backend(vec![Ok(CommandOutput::ok(&format!("{}|sha256:feed\n", ID_A)))]);
        let image = b.local_image("cam:latest").unwrap().unwrap();
        assert_eq!(image.id, ID_A);
        assert_eq!(image.source_digest.as_deref(), Some("sha256:feed"));
    }

    #[test]
    fn local_image_without_label() {
        let (b, _) = backend(vec![Ok(CommandOutput::ok(&format!("{}|<no value>\n", ID_A)))]);
        let image = b.local_image("cam:latest").unwrap().unwrap();
        assert_eq!(image.source_digest, None);
    }

    #[test]
    fn missing_local_image_is_none() {
        let (b, _) = backend(vec![Ok(CommandOutput::failed(1, "Error: No such image: cam:latest"))]);
        assert!(b.local_image("cam:latest").unwrap().is_none());
    }

    #[test]
    fn build_failure_is_deployment_build() {
        let (b, _) = backend(vec![Ok(CommandOutput::failed(1, "step 3/7 failed"))]);
        let unit = DeployUnit::new("cam", "apps/cam", "cam:latest");
        let err = b.build_local(&unit, "sha256:feed").unwrap_err();
        assert!(matches!(err, OutpostError::DeploymentBuild { .. }));
    }

    #[test]
    fn missing_container_is_absent() {
        let (b, _) = backend(vec![Ok(CommandOutput::failed(1, "Error: No such object: cam"))]);
        assert_eq!(b.running_identity(&target(), "cam").unwrap(), Identity::Absent);
    }

    #[test]
    fn running_identity_parses_full_id() {
        let (b, _) = backend(vec![Ok(CommandOutput::ok(&format!("{}\n", ID_A)))]);
        assert_eq!(
            b.running_identity(&target(), "cam").unwrap(),
            Identity::Known(ID_A.into())
        );
    }

    #[test]
    fn permission_error_is_not_masked() {
        let (b, _) = backend(vec![Ok(CommandOutput::failed(
            1,
            "permission denied while trying to connect to the Docker daemon socket",
        ))]);
        let err = b.running_identity(&target(), "cam").unwrap_err();
        assert!(matches!(err, OutpostError::Remote { .. }));
    }

    #[test]
    fn replace_ignores_missing_container() {
        let (b, runner) = backend(vec![
            Ok(CommandOutput::failed(1, "Error response from daemon: No such container: cam")),
            Ok(CommandOutput::failed(1, "Error: No such container: cam")),
            Ok(CommandOutput::ok("abc\n")),
        ]);
        let unit = DeployUnit::new("cam", "apps/cam", "cam:latest");
        b.replace(&target(), &unit, "cam:latest").unwrap();
        let cmds = runner.executed_commands();
        assert_eq!(cmds.len(), 3);
        assert!(cmds[0].contains("docker stop cam"));
        assert!(cmds[1].contains("docker rm cam"));
        assert!(cmds[2].contains("docker run"));
    }

    #[test]
    fn registry_login_feeds_token_on_stdin() {
        let (b, runner) = backend(vec![Ok(CommandOutput::ok("Login Succeeded"))]);
        b.registry_login(&target(), "nvcr.io", "$oauthtoken", "s3cret").unwrap();
        assert_eq!(runner.inputs(), vec!["s3cret"]);
        assert!(!runner.executed_commands()[0].contains("s3cret"));
    }

    #[test]
    fn ship_pipes_save_into_remote_load() {
        let (b, runner) = backend(vec![Ok(CommandOutput {
            exit_code: 0,
            stdout: "Loaded image: cam:latest\n".into(),
            stderr: "0+3 records in\n0+3 records out\n48213 bytes (48 kB, 47 KiB) copied, 0.2 s, 241 kB/s\n".into(),
        })]);
        let sent = b.ship(&target(), "cam:latest", &mut |_| {}).unwrap();
        assert_eq!(sent, Some(48_213));
        let cmd = &runner.executed_commands()[0];
        assert!(cmd.starts_with("docker save cam:latest | gzip -c | dd bs=1M | ssh "));
        assert!(cmd.contains("docker load"));
    }

    #[test]
    fn parse_dd_bytes_gnu_and_bsd() {
        assert_eq!(
            parse_dd_bytes("1+0 records out\n1048576 bytes (1.0 MB, 1.0 MiB) copied, 0.003 s\n"),
            Some(1_048_576)
        );
        assert_eq!(parse_dd_bytes("512 bytes transferred in 0.000021 secs"), Some(512));
        assert_eq!(parse_dd_bytes("Warning: Permanently added host"), None);
    }
}
