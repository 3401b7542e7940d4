//! Auto-stop: stop the billed instance once its session has ended.
//!
//! The flag is one boolean per environment in the state store, off unless
//! set. Nothing runs in the background: `on_session_ended` is called once
//! after a watch observes the session ending, reads the flag, and stops the
//! instance if it is on.

use std::sync::Arc;

use serde_json::Value;
use tracing::info;

use crate::error::{OutpostError, Result};
use crate::instance::lifecycle::{InstanceManager, StopOutcome};
use crate::rig::config::{Target, TargetKind};

use super::store::StateStore;

/// What `on_session_ended` decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoStopAction {
    /// The flag is off.
    Disabled,
    /// The target is not backed by the instance (an edge device).
    NotInstanceBacked,
    /// `stop` was called on the instance.
    Stopped(StopOutcome),
}

pub struct AutoStopPolicy {
    store: Arc<dyn StateStore>,
    environment: String,
}

impl AutoStopPolicy {
    pub fn new(store: Arc<dyn StateStore>, environment: &str) -> Self {
        AutoStopPolicy {
            store,
            environment: environment.to_string(),
        }
    }

    /// State-store key of this environment's flag.
    pub fn key(&self) -> String {
        format!("auto_stop.{}", self.environment)
    }

    pub fn enable(&self) -> Result<()> {
        self.store.write(&self.key(), Value::Bool(true))?;
        info!(environment = %self.environment, "auto-stop enabled");
        Ok(())
    }

    pub fn disable(&self) -> Result<()> {
        self.store.write(&self.key(), Value::Bool(false))?;
        info!(environment = %self.environment, "auto-stop disabled");
        Ok(())
    }

    pub fn is_enabled(&self) -> Result<bool> {
        match self.store.read(&self.key())? {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(b),
            Some(other) => Err(OutpostError::State(format!(
                "{} holds {} instead of a boolean",
                self.key(),
                other
            ))),
        }
    }

    /// Stop the instance behind `target` if the flag is on.
    pub fn on_session_ended(&self, target: &Target, instance: &InstanceManager) -> Result<AutoStopAction> {
        if !self.is_enabled()? {
            info!(remote = %target.name, "auto-stop off; instance left running");
            return Ok(AutoStopAction::Disabled);
        }
        if target.kind != TargetKind::Instance {
            return Ok(AutoStopAction::NotInstanceBacked);
        }
        let outcome = instance.stop()?;
        info!(remote = %target.name, instance = instance.name(), ?outcome, "auto-stop");
        Ok(AutoStopAction::Stopped(outcome))
    }
}
