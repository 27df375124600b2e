//! Library path resolution and per-tunnel staging references.
//!
//! The static server only ever sees the staging root. Each tunnel gets a
//! directory named by its ID holding a single read-only symlink called
//! `file`, so exactly one library file is reachable per tunnel and removing
//! the directory revokes access.

use std::path::{Path, PathBuf};

use crate::{Result, TunnelError};

/// A library file that passed containment checks
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    /// Canonical absolute path
    pub absolute: PathBuf,
    /// Normalized library-relative path, forward slashes
    pub relative: String,
    pub size: u64,
}

/// Resolve `file_path` against the library root.
///
/// The path is canonicalized and must stay under the canonicalized root;
/// anything else (traversal tricks, symlinks pointing out, absolute paths)
/// is a `PathEscape`. Only regular files are shareable.
pub fn resolve_library_file(library_root: &Path, file_path: &str) -> Result<ResolvedFile> {
    let relative = file_path.trim_start_matches('/');
    if relative.is_empty() {
        return Err(TunnelError::FileNotFound {
            path: file_path.to_string(),
        });
    }

    let root = library_root
        .canonicalize()
        .map_err(|_| TunnelError::FileNotFound {
            path: library_root.display().to_string(),
        })?;

    let absolute = match root.join(relative).canonicalize() {
        Ok(path) => path,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(TunnelError::FileNotFound {
                path: relative.to_string(),
            })
        }
        Err(err) => return Err(err.into()),
    };

    if !absolute.starts_with(&root) {
        return Err(TunnelError::PathEscape {
            path: relative.to_string(),
        });
    }

    let metadata = std::fs::metadata(&absolute)?;
    if !metadata.is_file() {
        return Err(TunnelError::NotRegularFile {
            path: relative.to_string(),
        });
    }

    Ok(ResolvedFile {
        absolute,
        relative: relative.to_string(),
        size: metadata.len(),
    })
}

/// Directory holding a tunnel's staging reference
pub(crate) fn staging_dir(staging_root: &Path, tunnel_id: &str) -> PathBuf {
    staging_root.join(tunnel_id)
}

/// Create `<staging_root>/<tunnel_id>/file` pointing at the resolved file.
pub(crate) fn stage(staging_root: &Path, tunnel_id: &str, target: &Path) -> Result<PathBuf> {
    let dir = staging_dir(staging_root, tunnel_id);
    std::fs::create_dir_all(&dir)?;

    let link = dir.join("file");
    if link.symlink_metadata().is_ok() {
        std::fs::remove_file(&link)?;
    }
    std::os::unix::fs::symlink(target, &link)?;
    Ok(link)
}

/// Remove a tunnel's staging directory. Missing directories are fine.
pub(crate) fn unstage(staging_root: &Path, tunnel_id: &str) -> Result<()> {
    let dir = staging_dir(staging_root, tunnel_id);
    match std::fs::remove_dir_all(&dir) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
