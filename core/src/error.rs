//! Error taxonomy for the orchestrator.
//!
//! Every failure category an operator can hit maps to one variant. Messages
//! carry the target name and, where one exists, the host and the command
//! that failed, so the CLI can print them verbatim.

use thiserror::Error;


/// All failures surfaced by `outpost-core`.
#[derive(Debug, Error)]
pub enum OutpostError {
    /// Requested target name is not in the registry. Raised before any
    /// network activity.
    #[error("unknown target '{name}' (known targets: {known})")]
    UnknownTarget { name: String, known: String },

    /// Target did not answer the liveness probe, or the transport dropped.
    #[error("cannot reach target '{target}' ({user}@{host}): {reason}")]
    Connectivity {
        target: String,
        host: String,
        user: String,
        reason: String,
    },

    /// Control-plane call failed or returned something unexpected.
    #[error("cloud API error during {operation}: {message}")]
    CloudApi { operation: String, message: String },

    /// Instance (or its SSH endpoint) did not come up within the budget.
    #[error("instance '{instance}' did not become {expected} within {waited_secs}s (last seen: {last_seen})")]
    StartTimeout {
        instance: String,
        expected: String,
        waited_secs: u64,
        last_seen: String,
    },

    /// Instance is not running, or running without a public address.
    #[error("instance '{instance}' has no public address (state: {state})")]
    NoAddress { instance: String, state: String },

    /// No instance carries the configured name tag.
    #[error("no instance tagged '{name}' in {region}")]
    NoInstance { name: String, region: String },

    /// A session with the same well-known name is already running.
    #[error("session '{session}' is already running on '{target}'; run status, watch or terminate first")]
    AlreadyRunning { session: String, target: String },

    /// An operation needed a session and found none.
    #[error("no session '{session}' on '{target}'")]
    SessionNotFound { session: String, target: String },

    /// Producing the artifact failed; nothing on the target was touched.
    #[error("build of unit '{unit}' failed: {message}")]
    DeploymentBuild { unit: String, message: String },

    /// Shipping the artifact failed; the previous unit is still running.
    #[error("transfer of unit '{unit}' to '{target}' failed: {message}")]
    DeploymentTransfer {
        unit: String,
        target: String,
        message: String,
    },

    /// The artifact did not land in the target's image store; the previous
    /// unit is still running.
    #[error("load of unit '{unit}' on '{target}' failed: {message}")]
    DeploymentLoad {
        unit: String,
        target: String,
        message: String,
    },

    /// A remote command that had to succeed exited non-zero.
    #[error("command failed on '{target}' (exit {exit_code}): {command}: {stderr}")]
    Remote {
        target: String,
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// A local command could not be spawned or exited non-zero.
    #[error("local command failed: {command}: {message}")]
    Local { command: String, message: String },

    #[error("secret '{key}' could not be resolved: {message}")]
    Secret { key: String, message: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    State(String),
}

impl OutpostError {
    /// Process exit code for this category. Distinct per category, but not
    /// promised to stay stable across releases.
    pub fn exit_code(&self) -> i32 {
        match self {
            OutpostError::UnknownTarget { .. } => 2,
            OutpostError::Config(_) => 2,
            OutpostError::Connectivity { .. } => 3,
            OutpostError::CloudApi { .. } => 4,
            OutpostError::NoInstance { .. } => 4,
            OutpostError::StartTimeout { .. } => 5,
            OutpostError::NoAddress { .. } => 5,
            OutpostError::AlreadyRunning { .. } => 6,
            OutpostError::SessionNotFound { .. } => 7,
            OutpostError::DeploymentBuild { .. } => 8,
            OutpostError::DeploymentTransfer { .. } => 9,
            OutpostError::DeploymentLoad { .. } => 10,
            OutpostError::Remote { .. } => 11,
            OutpostError::Local { .. } => 11,
            OutpostError::Secret { .. } => 12,
            OutpostError::State(_) => 13,
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, OutpostError>;
