//! Detached long-running jobs on remote targets.
//!
//! The remote job and the local watcher are separate state machines: the
//! job lives in a named session on the target and runs until it exits or is
//! terminated; a watcher only observes it and may detach at any time.

pub mod controller;
pub mod scan;
pub mod watch;

pub use controller::{Session, SessionController, SessionSpec, SessionStatus, TerminateOutcome};
pub use scan::BuildFailure;
pub use watch::{CancelFlag, WatchConfig, WatchEndReason, WatchOutcome};
