//! The ephemeral compute instance behind instance-backed targets.
//!
//! `cloud` is the control-API seam, `lifecycle` the start/stop/poll logic
//! on top of it, and `uptime` the long-running-instance cost alert.

pub mod cloud;
pub mod lifecycle;
pub mod uptime;

pub use cloud::{CloudApi, InstanceDescription, InstanceState};
pub use lifecycle::{InstanceManager, StopOutcome};
