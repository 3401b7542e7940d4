//! Deployment unit definitions.
//!
//! A `DeployUnit` is a named containerized workload as configured in the
//! settings file: where its build context lives, what image it produces, and
//! the runtime bindings the container gets on the target. The replacement
//! container of a deploy is always started from these bindings, so it
//! matches the container it replaces.

use serde::{Deserialize, Serialize};

use crate::error::{OutpostError, Result};
use crate::rig::sync::DEFAULT_EXCLUDES;

fn default_dockerfile() -> String {
    "Dockerfile".to_string()
}

fn default_restart() -> String {
    "unless-stopped".to_string()
}

/// Large, externally hosted base image the application layer builds on.
///
/// When a unit has one, the deploy is two-phase: the target pulls the base
/// from its registry once and builds only the application layer itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BaseLayer {
    /// Full image reference, e.g. `nvcr.io/nvidia/deepstream:7.0-triton`.
    pub image: String,
    /// Registry host to log into before pulling.
    pub registry: String,
    /// Registry user name.
    #[serde(default)]
    pub username: String,
    /// Key of the registry token in the secrets store.
    pub secret_key: String,
}

/// One deployable workload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployUnit {
    /// Logical name; also the container name on the target.
    pub name: String,
    /// Local build context directory.
    pub context: String,
    /// Dockerfile path relative to `context`.
    #[serde(default = "default_dockerfile")]
    pub dockerfile: String,
    /// Image reference (`repo:tag`) the build produces.
    pub image: String,
    /// Target to deploy to when none is given on the command line.
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default = "default_restart")]
    pub restart: String,
    #[serde(default)]
    pub network: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub runtime: Option<String>,
    /// Host devices, `/dev/video0` or `/dev/video0:/dev/video0`.
    #[serde(default)]
    pub devices: Vec<String>,
    /// Bind mounts, `host:container[:mode]`.
    #[serde(default)]
    pub volumes: Vec<String>,
    /// Port mappings, `host:container`.
    #[serde(default)]
    pub ports: Vec<String>,
    /// Environment, `KEY=value`.
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub base: Option<BaseLayer>,
    /// Patterns left out of the source digest and the context upload.
    #[serde(default)]
    pub excludes: Vec<String>,
}

impl DeployUnit {
    /// A unit with default bindings.
    pub fn new(name: &str, context: &str, image: &str) -> Self {
        DeployUnit {
            name: name.to_string(),
            context: context.to_string(),
            dockerfile: default_dockerfile(),
            image: image.to_string(),
            target: None,
            restart: default_restart(),
            network: None,
            privileged: false,
            runtime: None,
            devices: Vec::new(),
            volumes: Vec::new(),
            ports: Vec::new(),
            env: Vec::new(),
            base: None,
            excludes: Vec::new(),
        }
    }

    pub fn is_two_phase(&self) -> bool {
        self.base.is_some()
    }

    /// Patterns left out of both the source digest and the context upload:
    /// the transfer defaults followed by the unit's own.
    pub fn context_excludes(&self) -> Vec<String> {
        let mut patterns: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        for p in &self.excludes {
            if !patterns.contains(p) {
                patterns.push(p.clone());
            }
        }
        patterns
    }

    /// Check the fields a deploy cannot proceed without.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(OutpostError::Config("deploy unit with empty name".into()));
        }
        if self.image.trim().is_empty() {
            return Err(OutpostError::Config(format!(
                "deploy unit '{}' has no image",
                self.name
            )));
        }
        if self.context.trim().is_empty() {
            return Err(OutpostError::Config(format!(
                "deploy unit '{}' has no build context",
                self.name
            )));
        }
        if let Some(base) = &self.base {
            if base.image.trim().is_empty() || base.secret_key.trim().is_empty() {
                return Err(OutpostError::Config(format!(
                    "deploy unit '{}': base layer needs image and secret_key",
                    self.name
                )));
            }
        }
        Ok(())
    }

    /// `docker run` flags reproducing this unit's bindings (without the
    /// image argument).
    pub fn run_flags(&self) -> Vec<String> {
        let mut flags = vec![
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
            "--restart".to_string(),
            self.restart.clone(),
        ];
        if let Some(network) = &self.network {
            flags.push(format!("--network={}", network));
        }
        if let Some(runtime) = &self.runtime {
            flags.push(format!("--runtime={}", runtime));
        }
        if self.privileged {
            flags.push("--privileged".to_string());
        }
        for device in &self.devices {
            flags.push("--device".to_string());
            flags.push(device.clone());
        }
        for volume in &self.volumes {
            flags.push("-v".to_string());
            flags.push(volume.clone());
        }
        for port in &self.ports {
            flags.push("-p".to_string());
            flags.push(port.clone());
        }
        for var in &self.env {
            flags.push("-e".to_string());
            flags.push(var.clone());
        }
        flags
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_defaults_fill_in() {
        let yaml = "name: squirrel-cam\ncontext: apps/squirrel-cam\nimage: squirrel-cam:latest\n";
        let unit: DeployUnit = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(unit.dockerfile, "Dockerfile");
        assert_eq!(unit.restart, "unless-stopped");
        assert!(!unit.is_two_phase());
        unit.validate().unwrap();
    }

    #[test]
    fn context_excludes_start_from_transfer_defaults() {
        let mut unit = DeployUnit::new("cam", "apps/cam", "cam:latest");
        unit.excludes = vec!["*.pyc".into(), "data/".into()];
        let patterns = unit.context_excludes();
        assert_eq!(&patterns[..DEFAULT_EXCLUDES.len()], DEFAULT_EXCLUDES);
        assert_eq!(patterns.iter().filter(|p| *p == "*.pyc").count(), 1);
        assert_eq!(patterns.last().map(String::as_str), Some("data/"));
    }

    #[test]
    fn run_flags_carry_bindings() {
        let mut unit = DeployUnit::new("cam", "apps/cam", "cam:latest");
        unit.network = Some("host".into());
        unit.privileged = true;
        unit.devices = vec!["/dev/video0".into()];
        unit.volumes = vec!["/data:/data".into()];
        unit.env = vec!["MODE=edge".into()];
        let flags = unit.run_flags();
        assert_eq!(&flags[..5], &["-d", "--name", "cam", "--restart", "unless-stopped"]);
        assert!(flags.contains(&"--network=host".to_string()));
        assert!(flags.contains(&"--privileged".to_string()));
        let dev = flags.iter().position(|f| f == "--device").unwrap();
        assert_eq!(flags[dev + 1], "/dev/video0");
        let env = flags.iter().position(|f| f == "-e").unwrap();
        assert_eq!(flags[env + 1], "MODE=edge");
    }

    #[test]
    fn validate_rejects_missing_image() {
        let unit = DeployUnit::new("cam", "apps/cam", " ");
        assert!(matches!(unit.validate(), Err(OutpostError::Config(_))));
    }

    #[test]
    fn validate_rejects_incomplete_base() {
        let mut unit = DeployUnit::new("det", "apps/det", "det:latest");
        unit.base = Some(BaseLayer {
            image: "nvcr.io/nvidia/deepstream:7.0".into(),
            registry: "nvcr.io".into(),
            username: "$oauthtoken".into(),
            secret_key: String::new(),
        });
        assert!(unit.validate().is_err());
    }
}
