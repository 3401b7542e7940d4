//! Infrastructure backends.
//!
//! Two backend traits sit here: `SessionBackend` for detached jobs on a
//! target (tmux in production) and `ContainerBackend` for the image and
//! container operations a deploy needs (docker in production). Both have a
//! production implementation and an in-memory one in `mock` for tests.

pub mod docker;
pub mod mock;
pub mod runner;
pub mod tmux;

use crate::deploy::identity::Identity;
use crate::deploy::unit::DeployUnit;
use crate::error::Result;
use crate::rig::config::Target;

use runner::{LineSink, StreamHandle};


// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// Everything needed to launch one detached job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLaunch {
    /// Well-known session name.
    pub name: String,
    /// Working directory of the job.
    pub cwd: String,
    /// Shell command line to run.
    pub command: String,
    /// Absolute path of the combined stdout/stderr log on the target.
    pub log_path: String,
}

/// Operations on named detached sessions and their log files.
pub trait SessionBackend: Send + Sync {
    /// Whether a session with the given name exists on the target.
    fn session_exists(&self, target: &Target, name: &str) -> Result<bool>;

    /// Create the session. Truncates (or creates) the log first.
    fn create_session(&self, target: &Target, launch: &SessionLaunch) -> Result<()>;

    /// Kill the session. `Ok(false)` when there was nothing to kill.
    fn kill_session(&self, target: &Target, name: &str) -> Result<bool>;

    fn log_exists(&self, target: &Target, path: &str) -> Result<bool>;

    /// The last `lines` lines of the log.
    fn tail_log(&self, target: &Target, path: &str, lines: usize) -> Result<Vec<String>>;

    /// Stream the log from its beginning, then follow appended lines until
    /// the returned handle is stopped.
    fn follow_log(&self, target: &Target, path: &str, sink: LineSink)
        -> Result<Box<dyn StreamHandle>>;

    /// Move the log out of the way so the session reads as never started.
    fn retire_log(&self, target: &Target, path: &str) -> Result<()>;
}


// ---------------------------------------------------------------------------
// Containers
// ---------------------------------------------------------------------------

/// Label stamped on every image this tool builds, holding the digest of the
/// build context it was built from.
pub const SOURCE_DIGEST_LABEL: &str = "outpost.source-digest";

/// An image in the operator machine's local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalImage {
    /// Full image ID (`sha256:<64 hex>`).
    pub id: String,
    /// Value of `SOURCE_DIGEST_LABEL`, when set.
    pub source_digest: Option<String>,
}

/// Image and container operations used by the deployment syncer.
///
/// Local operations act on the operator's machine, the rest on `target`.
/// Stop/remove of the running container ignore "no such container" but
/// surface every other failure.
pub trait ContainerBackend: Send + Sync {
    /// Look up a local image by reference.
    fn local_image(&self, image: &str) -> Result<Option<LocalImage>>;

    /// Build the unit's image locally, labelled with `source_digest`.
    /// Returns the full image ID.
    fn build_local(&self, unit: &DeployUnit, source_digest: &str) -> Result<String>;

    /// Identity of the image behind the running container `container`.
    fn running_identity(&self, target: &Target, container: &str) -> Result<Identity>;

    /// A label of the running container `container`, when both exist.
    fn running_label(&self, target: &Target, container: &str, label: &str)
        -> Result<Option<String>>;

    /// Identity of an image in the target's store.
    fn image_identity(&self, target: &Target, image: &str) -> Result<Identity>;

    /// Stream a compressed local image into the target's image store.
    /// Returns the bytes put on the wire when the transport reports them.
    fn ship(&self, target: &Target, image: &str, progress: &mut dyn FnMut(&str)) -> Result<Option<u64>>;

    /// Log the target into a registry with a token fed over stdin.
    fn registry_login(&self, target: &Target, registry: &str, username: &str, token: &str)
        -> Result<()>;

    /// Have the target pull an image straight from its registry.
    fn pull_image(&self, target: &Target, image: &str) -> Result<()>;

    /// Build the unit's image on the target from a context directory there.
    /// Returns the identity of the built image.
    fn build_remote(
        &self,
        target: &Target,
        unit: &DeployUnit,
        context_dir: &str,
        source_digest: &str,
    ) -> Result<Identity>;

    /// Stop and remove the running container (ignoring not-found), then run
    /// a new one from `image` with the unit's bindings.
    fn replace(&self, target: &Target, unit: &DeployUnit, image: &str) -> Result<()>;
}
