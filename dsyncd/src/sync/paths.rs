use std::path::{Component, Path, PathBuf};

use thiserror::Error;

pub const PARTIAL_SUFFIX: &str = ".partial";

#[derive(Debug, Error)]
pub enum PathError {
    #[error("remote path is empty")]
    Empty,
    #[error("remote path contains unsupported component")]
    UnsupportedComponent,
    #[error("{0:?} is outside the sync root")]
    OutsideRoot(PathBuf),
    #[error("{0:?} is not valid UTF-8")]
    NonUtf8(PathBuf),
}

/// Maps a remote path such as `/Docs/A.txt` under the local sync root.
pub fn local_path_for(root: &Path, remote_path: &str) -> Result<PathBuf, PathError> {
    if remote_path.is_empty() {
        return Err(PathError::Empty);
    }

    let mut out = root.to_path_buf();
    for component in Path::new(remote_path).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::RootDir | Component::CurDir => continue,
            Component::ParentDir | Component::Prefix(_) => {
                return Err(PathError::UnsupportedComponent);
            }
        }
    }
    Ok(out)
}

/// Inverse of [`local_path_for`]; the root itself maps to the empty path.
pub fn remote_path_for(root: &Path, local: &Path) -> Result<String, PathError> {
    let relative = local
        .strip_prefix(root)
        .map_err(|_| PathError::OutsideRoot(local.to_path_buf()))?;
    let mut out = String::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part
                    .to_str()
                    .ok_or_else(|| PathError::NonUtf8(local.to_path_buf()))?;
                out.push('/');
                out.push_str(part);
            }
            Component::CurDir => continue,
            _ => return Err(PathError::UnsupportedComponent),
        }
    }
    Ok(out)
}

/// Echo-suppression key for a local path.
pub fn tracker_key(root: &Path, local: &Path) -> Result<String, PathError> {
    Ok(remote_path_for(root, local)?.to_lowercase())
}

/// Splits `/A/b.txt` into (`/A`, `b.txt`); top-level entries have an empty parent.
pub fn split_parent(remote_path: &str) -> (&str, &str) {
    match remote_path.rfind('/') {
        Some(index) => (&remote_path[..index], &remote_path[index + 1..]),
        None => ("", remote_path),
    }
}

pub fn partial_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(PARTIAL_SUFFIX);
    target.with_file_name(name)
}

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name.ends_with(PARTIAL_SUFFIX))
}
