//! Remote targets: the "rig" subsystem.
//!
//! Everything needed to act on a remote host: the static target registry,
//! remote command execution and liveness probes over ssh, file
//! synchronisation via rsync, and a one-shot health snapshot. Every other
//! component reaches a target only through `remote::RemoteShell`.

pub mod config;
pub mod health;
pub mod remote;
pub mod sync;
