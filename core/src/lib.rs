//! Outpost core: detached remote sessions, instance lifecycle, auto-stop,
//! and content-aware container deployment over SSH.
//!
//! The `Orchestrator` is the entry point. Components below it talk to the
//! outside world only through the backend traits in `infrastructure`,
//! `rig::remote`, `instance::cloud`, `policy::store` and `deploy::secrets`.

pub mod deploy;
pub mod error;
pub mod infrastructure;
pub mod instance;
pub mod orchestrator;
pub mod policy;
pub mod rig;
pub mod session;
pub mod settings;

pub use error::{OutpostError, Result};
pub use orchestrator::{Backends, InstanceReport, Orchestrator, WatchReport};
pub use settings::Settings;
