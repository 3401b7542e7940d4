//! Container deployment: unit definitions, artifact identity, registry
//! secrets, and the syncer that brings a target up to date.

pub mod identity;
pub mod secrets;
pub mod syncer;
pub mod unit;

pub use identity::{source_digest, Identity};
pub use secrets::{AwsSecretsManager, SecretsStore, StaticSecrets};
pub use syncer::{DeployOutcome, DeployStatus, DeploymentSyncer, UnitState};
pub use unit::{BaseLayer, DeployUnit};
