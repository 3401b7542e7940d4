//! Cost-control policy and the state store it persists to.

pub mod autostop;
pub mod store;

pub use autostop::{AutoStopAction, AutoStopPolicy};
pub use store::{FileStore, MemoryStore, StateStore};
