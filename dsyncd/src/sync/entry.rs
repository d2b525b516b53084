use std::path::PathBuf;

use dsync_core::Metadata;
use thiserror::Error;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Error)]
pub enum EntryError {
    #[error("remote entry {0:?} has no path")]
    MissingPath(String),
    #[error("time parse error: {0}")]
    Time(#[from] time::error::Parse),
    #[error("timestamp out of range: {0}")]
    TimeRange(#[from] time::error::ComponentRange),
    #[error("time format error: {0}")]
    Format(#[from] time::error::Format),
}

/// One remote object at a point in time. Files always carry a revision,
/// folders never do, and tombstones have neither id nor revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
    File(RemoteFile),
    Folder(RemoteFolder),
    Deleted(RemoteDeleted),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    pub id: String,
    pub path_display: String,
    pub path_lower: String,
    pub rev: String,
    pub size: u64,
    /// Unix milliseconds.
    pub server_modified: i64,
    /// Unix milliseconds.
    pub client_modified: i64,
    pub content_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub id: String,
    pub path_display: String,
    pub path_lower: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDeleted {
    pub path_display: String,
    pub path_lower: String,
}

impl RemoteEntry {
    pub fn id(&self) -> Option<&str> {
        match self {
            RemoteEntry::File(file) => Some(&file.id),
            RemoteEntry::Folder(folder) => Some(&folder.id),
            RemoteEntry::Deleted(_) => None,
        }
    }

    pub fn path_display(&self) -> &str {
        match self {
            RemoteEntry::File(file) => &file.path_display,
            RemoteEntry::Folder(folder) => &folder.path_display,
            RemoteEntry::Deleted(deleted) => &deleted.path_display,
        }
    }

    pub fn path_lower(&self) -> &str {
        match self {
            RemoteEntry::File(file) => &file.path_lower,
            RemoteEntry::Folder(folder) => &folder.path_lower,
            RemoteEntry::Deleted(deleted) => &deleted.path_lower,
        }
    }

    pub fn rev(&self) -> Option<&str> {
        match self {
            RemoteEntry::File(file) => Some(&file.rev),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self, RemoteEntry::File(_))
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, RemoteEntry::Deleted(_))
    }

    pub fn size(&self) -> u64 {
        match self {
            RemoteEntry::File(file) => file.size,
            _ => 0,
        }
    }
}

impl TryFrom<Metadata> for RemoteEntry {
    type Error = EntryError;

    fn try_from(metadata: Metadata) -> Result<Self, Self::Error> {
        match metadata {
            Metadata::File(file) => {
                let (path_display, path_lower) =
                    paths_of(&file.name, file.path_display, file.path_lower)?;
                Ok(RemoteEntry::File(RemoteFile {
                    id: file.id,
                    path_display,
                    path_lower,
                    rev: file.rev,
                    size: file.size,
                    server_modified: parse_millis(&file.server_modified)?,
                    client_modified: parse_millis(&file.client_modified)?,
                    content_hash: file.content_hash,
                }))
            }
            Metadata::Folder(folder) => {
                let (path_display, path_lower) =
                    paths_of(&folder.name, folder.path_display, folder.path_lower)?;
                Ok(RemoteEntry::Folder(RemoteFolder {
                    id: folder.id,
                    path_display,
                    path_lower,
                }))
            }
            Metadata::Deleted(deleted) => {
                let (path_display, path_lower) =
                    paths_of(&deleted.name, deleted.path_display, deleted.path_lower)?;
                Ok(RemoteEntry::Deleted(RemoteDeleted {
                    path_display,
                    path_lower,
                }))
            }
        }
    }
}

fn paths_of(
    name: &str,
    display: Option<String>,
    lower: Option<String>,
) -> Result<(String, String), EntryError> {
    match (display, lower) {
        (Some(display), Some(lower)) => Ok((display, lower)),
        (Some(display), None) => {
            let lower = display.to_lowercase();
            Ok((display, lower))
        }
        (None, Some(lower)) => Ok((lower.clone(), lower)),
        (None, None) => Err(EntryError::MissingPath(name.to_string())),
    }
}

pub fn parse_millis(value: &str) -> Result<i64, EntryError> {
    let parsed = OffsetDateTime::parse(value, &Rfc3339)?;
    Ok((parsed.unix_timestamp_nanos() / 1_000_000) as i64)
}

/// Formats as `2024-01-01T10:00:00Z`; the API rejects fractional seconds.
pub fn format_millis(millis: i64) -> Result<String, EntryError> {
    let seconds = OffsetDateTime::from_unix_timestamp(millis.div_euclid(1000))?;
    Ok(seconds.format(&Rfc3339)?)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalEventKind {
    Create,
    Modify,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalNode {
    Dir,
    File { size: u64 },
}

/// A filesystem notification after debouncing. `node` is `None` when the
/// path no longer existed at the time it was observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEvent {
    pub path: PathBuf,
    pub kind: LocalEventKind,
    pub node: Option<LocalNode>,
}

impl LocalEvent {
    pub fn new(path: impl Into<PathBuf>, kind: LocalEventKind, node: Option<LocalNode>) -> Self {
        Self {
            path: path.into(),
            kind,
            node,
        }
    }

    pub fn is_file(&self) -> bool {
        matches!(self.node, Some(LocalNode::File { .. }))
    }

    pub fn size(&self) -> u64 {
        match self.node {
            Some(LocalNode::File { size }) => size,
            _ => 0,
        }
    }
}
