//! Secrets store.
//!
//! Resolves named secrets (registry tokens) as plain text. Values are only
//! held in memory and handed to the remote login over stdin; nothing here
//! writes them to disk.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use crate::error::{OutpostError, Result};
use crate::infrastructure::runner::CommandRunner;
use crate::infrastructure::tmux::shell_escape;

pub trait SecretsStore: Send + Sync {
    fn resolve(&self, key: &str) -> Result<String>;
}

/// Secrets from AWS Secrets Manager via the `aws` CLI.
pub struct AwsSecretsManager {
    runner: Arc<dyn CommandRunner>,
    region: String,
}

impl AwsSecretsManager {
    pub fn new(runner: Arc<dyn CommandRunner>, region: &str) -> Self {
        AwsSecretsManager {
            runner,
            region: region.to_string(),
        }
    }
}

impl SecretsStore for AwsSecretsManager {
    fn resolve(&self, key: &str) -> Result<String> {
        let cmd = format!(
            "aws secretsmanager get-secret-value --region {} --secret-id {} --query SecretString --output text",
            shell_escape(&self.region),
            shell_escape(key)
        );
        debug!(secret = key, "resolving secret");
        let out = self.runner.run(&cmd).map_err(|e| OutpostError::Secret {
            key: key.to_string(),
            message: e,
        })?;
        if !out.success() {
            return Err(OutpostError::Secret {
                key: key.to_string(),
                message: out.stderr.trim().to_string(),
            });
        }
        let value = out.stdout.trim_end_matches(&['\n', '\r'][..]).to_string();
        if value.is_empty() || value == "None" {
            return Err(OutpostError::Secret {
                key: key.to_string(),
                message: "secret has no string value".into(),
            });
        }
        Ok(value)
    }
}

/// Fixed secrets, for tests and local overrides.
#[derive(Default)]
pub struct StaticSecrets {
    values: HashMap<String, String>,
}

impl StaticSecrets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }
}

impl SecretsStore for StaticSecrets {
    fn resolve(&self, key: &str) -> Result<String> {
        self.values.get(key).cloned().ok_or_else(|| OutpostError::Secret {
            key: key.to_string(),
            message: "not found".into(),
        })
    }
}
