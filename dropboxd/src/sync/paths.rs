use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PathError {
    #[error("relative path is empty")]
    Empty,
    #[error("relative path contains unsupported component")]
    UnsupportedComponent,
}

/// Remote path an upload is written to: `/<destination>/<relative>`, keeping
/// the local spelling.
pub fn remote_path_for(destination: &str, relative: &str) -> String {
    let destination = destination.trim_matches('/');
    let relative = relative.trim_start_matches('/');
    if destination.is_empty() {
        format!("/{relative}")
    } else {
        format!("/{destination}/{relative}")
    }
}

/// Index key for a relative path. Dropbox compares paths case-insensitively
/// and reports them lowercased in `path_lower`, so keys are folded the same way.
pub fn remote_key(destination: &str, relative: &str) -> String {
    remote_path_for(destination, relative).to_lowercase()
}

/// Folder listed to seed the index. The Dropbox root is the empty string.
pub fn destination_root(destination: &str) -> String {
    let destination = destination.trim_matches('/');
    if destination.is_empty() {
        String::new()
    } else {
        format!("/{destination}")
    }
}

/// Maps a `/`-separated relative path from the queue back under `root`.
pub fn local_path_for(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    if relative.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for part in relative.split('/') {
        match Path::new(part).components().next() {
            None => continue,
            Some(Component::Normal(_)) => out.push(part),
            Some(Component::CurDir) => continue,
            Some(_) => return Err(PathError::UnsupportedComponent),
        }
    }
    Ok(out)
}

/// Builds the `/`-separated relative path of `path` under `root`.
///
/// Returns `None` when any component is not valid UTF-8.
pub fn relative_string(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => continue,
            _ => return None,
        }
    }
    Some(parts.join("/"))
}
