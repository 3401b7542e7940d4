//! Target configuration and registry.
//!
//! `TargetConfig` describes one named remote (SSH coordinates, base
//! directory, and whether its host is static or comes from the cloud
//! instance). `TargetRegistry` holds the closed set of configured targets
//! with exactly one default. Names are resolved once, here, into a
//! structured `Target`; nothing downstream handles raw name strings.

use serde::{Deserialize, Serialize};

use crate::error::{OutpostError, Result};


// ---------------------------------------------------------------------------
// TargetKind
// ---------------------------------------------------------------------------

/// Where a target's host address comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// The ephemeral cloud build instance; host is its current public address.
    Instance,
    /// A persistent edge controller with a fixed host.
    Edge,
}


// ---------------------------------------------------------------------------
// TargetConfig
// ---------------------------------------------------------------------------

/// Registry entry for a single target.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetConfig {
    /// Short name used to reference this target (e.g. "builder").
    pub name: String,
    pub kind: TargetKind,
    /// Hostname or IP. Required for `edge`, not allowed for `instance`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    pub user: String,
    /// Working directory on the remote host.
    pub base_dir: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Private key path. When absent, ssh uses its ambient credentials
    /// (agent, short-lived certificates, default keys).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<String>,
    #[serde(default)]
    pub default: bool,
}

fn default_port() -> u16 {
    22
}

impl TargetConfig {
    /// Materialize a `Target` using `host` for instance-backed entries.
    /// Edge entries ignore the argument and use their configured host.
    pub fn with_host(&self, host: Option<&str>) -> Result<Target> {
        let host = match self.kind {
            TargetKind::Edge => self.host.clone(),
            TargetKind::Instance => host.map(|h| h.to_string()),
        }
        .ok_or_else(|| {
            OutpostError::Config(format!("target '{}' has no host to connect to", self.name))
        })?;
        Ok(Target {
            name: self.name.clone(),
            kind: self.kind,
            host,
            port: self.port,
            user: self.user.clone(),
            base_dir: self.base_dir.clone(),
            identity_file: self.identity_file.clone(),
        })
    }
}


// ---------------------------------------------------------------------------
// Target
// ---------------------------------------------------------------------------

/// A resolved remote. Immutable for the rest of the invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub name: String,
    pub kind: TargetKind,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub base_dir: String,
    pub identity_file: Option<String>,
}

impl Target {
    /// Build the `user@host` string used in SSH/rsync commands.
    pub fn user_at_host(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Base SSH arguments (options, key, user@host) without a command.
    ///
    /// `BatchMode` keeps ssh from prompting, so an unusable credential shows
    /// up as a connection failure instead of a hang.
    pub fn ssh_base_args(&self, connect_timeout_secs: u64) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", connect_timeout_secs),
            "-o".to_string(),
            "ServerAliveInterval=30".to_string(),
        ];
        if let Some(ref key) = self.identity_file {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push(self.user_at_host());
        args
    }

    /// Path under the target's base directory.
    pub fn path(&self, relative: &str) -> String {
        if relative.starts_with('/') {
            return relative.to_string();
        }
        format!("{}/{}", self.base_dir.trim_end_matches('/'), relative)
    }
}


// ---------------------------------------------------------------------------
// TargetRegistry
// ---------------------------------------------------------------------------

/// The closed set of configured targets with one default.
#[derive(Debug, Clone)]
pub struct TargetRegistry {
    targets: Vec<TargetConfig>,
    default_index: usize,
}

impl TargetRegistry {
    /// Build a registry from configured entries. Fails on an empty list,
    /// duplicate names, more than one default, or a host that does not fit
    /// the entry's kind. With no entry flagged default, the first one is.
    pub fn from_entries(targets: Vec<TargetConfig>) -> Result<Self> {
        if targets.is_empty() {
            return Err(OutpostError::Config("no targets configured".into()));
        }
        for (i, t) in targets.iter().enumerate() {
            if t.name.trim().is_empty() {
                return Err(OutpostError::Config(format!("target #{} has an empty name", i + 1)));
            }
            if targets[..i].iter().any(|o| o.name == t.name) {
                return Err(OutpostError::Config(format!("target '{}' defined twice", t.name)));
            }
            match (t.kind, &t.host) {
                (TargetKind::Edge, None) => {
                    return Err(OutpostError::Config(format!(
                        "edge target '{}' needs a host",
                        t.name
                    )))
                }
                (TargetKind::Instance, Some(_)) => {
                    return Err(OutpostError::Config(format!(
                        "instance target '{}' must not set a host; it follows the instance address",
                        t.name
                    )))
                }
                _ => {}
            }
        }
        let defaults: Vec<usize> = targets
            .iter()
            .enumerate()
            .filter(|(_, t)| t.default)
            .map(|(i, _)| i)
            .collect();
        let default_index = match defaults.as_slice() {
            [] => 0,
            [one] => *one,
            _ => {
                return Err(OutpostError::Config(
                    "more than one target is marked default".into(),
                ))
            }
        };
        Ok(TargetRegistry {
            targets,
            default_index,
        })
    }

    /// The built-in pair used when no targets are configured: the cloud build
    /// instance (default) and an edge controller.
    pub fn builtin() -> Self {
        TargetRegistry {
            targets: vec![
                TargetConfig {
                    name: "builder".into(),
                    kind: TargetKind::Instance,
                    host: None,
                    user: "ubuntu".into(),
                    base_dir: "/home/ubuntu/work".into(),
                    port: 22,
                    identity_file: None,
                    default: true,
                },
                TargetConfig {
                    name: "controller".into(),
                    kind: TargetKind::Edge,
                    host: Some("edge-controller.local".into()),
                    user: "root".into(),
                    base_dir: "/data".into(),
                    port: 22,
                    identity_file: None,
                    default: false,
                },
            ],
            default_index: 0,
        }
    }

    /// Resolve an optional name. `None` selects the default target.
    pub fn resolve(&self, name: Option<&str>) -> Result<&TargetConfig> {
        match name {
            None => Ok(&self.targets[self.default_index]),
            Some(n) => self
                .targets
                .iter()
                .find(|t| t.name == n)
                .ok_or_else(|| OutpostError::UnknownTarget {
                    name: n.to_string(),
                    known: self.list().join(", "),
                }),
        }
    }

    /// Known names in configuration order.
    pub fn list(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn entries(&self) -> &[TargetConfig] {
        &self.targets
    }

    pub fn default_name(&self) -> &str {
        &self.targets[self.default_index].name
    }
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
