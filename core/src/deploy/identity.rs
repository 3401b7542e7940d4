//! Content identities of deployable artifacts.
//!
//! Image identities are full docker image IDs (`sha256:<64 hex>`) compared
//! whole, never by prefix. A missing container is `Identity::Absent`, which
//! matches nothing, so a first deploy always ships.
//!
//! For units built on the target the image ID is not known before the
//! build, so the build context itself is hashed: `source_digest` walks the
//! context, hashing sorted relative paths and file contents.

use std::fs;
use std::path::Path;

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{OutpostError, Result};


// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

/// Identity of an artifact on some side of a deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Known(String),
    Absent,
}

impl Identity {
    /// True only when both sides are known and equal.
    pub fn matches(&self, other: &Identity) -> bool {
        match (self, other) {
            (Identity::Known(a), Identity::Known(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Identity::Known(id) => Some(id),
            Identity::Absent => None,
        }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Identity::Known(id) => write!(f, "{}", id),
            Identity::Absent => write!(f, "<absent>"),
        }
    }
}

/// Pull a full image ID out of docker output.
///
/// Accepts `sha256:<64 hex>` anywhere in the text (so `docker build -q`,
/// `docker inspect` and `Loaded image ID:` lines all work). Short IDs are
/// rejected.
pub fn parse_image_id(output: &str) -> Option<String> {
    for token in output.split(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
        let token = token.trim();
        if let Some(hex_part) = token.strip_prefix("sha256:") {
            if hex_part.len() == 64 && hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
                return Some(format!("sha256:{}", hex_part.to_ascii_lowercase()));
            }
        }
    }
    None
}


// ---------------------------------------------------------------------------
// Source digest
// ---------------------------------------------------------------------------

/// SHA-256 over a build context directory, as `sha256:<hex>`.
///
/// Each regular file contributes its path relative to `dir` (with `/`
/// separators) followed by its contents. Files are visited in sorted order,
/// so the digest does not depend on directory iteration order. Paths
/// matching any of `excludes` are skipped.
pub fn source_digest(dir: &Path, excludes: &[String]) -> Result<String> {
    if !dir.is_dir() {
        return Err(OutpostError::DeploymentBuild {
            unit: dir.display().to_string(),
            message: "build context is not a directory".into(),
        });
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let rel = relative(dir, e.path());
            rel.is_empty() || !is_excluded(&rel, e.file_type().is_dir(), excludes)
        });
    for entry in walker {
        let entry = entry.map_err(|e| OutpostError::DeploymentBuild {
            unit: dir.display().to_string(),
            message: format!("walk build context: {}", e),
        })?;
        if entry.file_type().is_file() {
            files.push(relative(dir, entry.path()));
        }
    }
    files.sort();

    let mut hasher = Sha256::new();
    for rel in &files {
        let content = fs::read(dir.join(rel)).map_err(|e| OutpostError::DeploymentBuild {
            unit: dir.display().to_string(),
            message: format!("read {}: {}", rel, e),
        })?;
        hasher.update(rel.as_bytes());
        hasher.update([0u8]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(&content);
    }
    Ok(format!("sha256:{}", hex::encode(hasher.finalize())))
}

fn relative(base: &Path, path: &Path) -> String {
    path.strip_prefix(base)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy().to_string())
        .collect::<Vec<_>>()
        .join("/")
}

/// Match a relative path against exclusion patterns.
///
/// `dir/` matches a directory of that name at any depth, `*.ext` matches
/// file names by suffix, anything else matches a whole path component or
/// the whole relative path.
fn is_excluded(rel: &str, is_dir: bool, excludes: &[String]) -> bool {
    let name = rel.rsplit('/').next().unwrap_or(rel);
    excludes.iter().any(|pattern| {
        if let Some(dir_name) = pattern.strip_suffix('/') {
            is_dir && name == dir_name
        } else if let Some(suffix) = pattern.strip_prefix('*') {
            name.ends_with(suffix)
        } else {
            name == pattern || rel == pattern
        }
    })
}
