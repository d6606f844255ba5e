//! Snapshot and file metadata model.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use skp_api_types::Digest;

use crate::Error;

/// Platform-neutral relative path inside a snapshot.
///
/// Forward-slash separated, normalized, never empty and never
/// containing `.` or `..` components. Construction is the only place
/// where platform paths are translated; everything downstream can
/// treat the value as an opaque sort key.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RelativePath(String);

impl RelativePath {
    pub fn new(path: &str) -> Result<Self, Error> {
        if path.is_empty() {
            return Err(Error::InvalidArgument("empty relative path".into()));
        }
        if path.contains('\0') {
            return Err(Error::InvalidArgument("relative path contains NUL".into()));
        }
        for component in path.split('/') {
            match component {
                "" => {
                    return Err(Error::Invariant(format!(
                        "relative path '{path}' has an empty component"
                    )))
                }
                "." | ".." => {
                    return Err(Error::Invariant(format!(
                        "relative path '{path}' escapes its root"
                    )))
                }
                _ => (),
            }
        }
        Ok(RelativePath(path.to_string()))
    }

    /// Translate a scanned filesystem path (already stripped of the
    /// source root) into the snapshot representation.
    pub fn from_fs_path(path: &Path) -> Result<Self, Error> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(part) => match part.to_str() {
                    Some(part) => parts.push(part),
                    None => {
                        return Err(Error::InvalidArgument(format!(
                            "path {path:?} is not valid unicode"
                        )))
                    }
                },
                Component::CurDir => (),
                _ => {
                    return Err(Error::Invariant(format!(
                        "path {path:?} escapes the snapshot root"
                    )))
                }
            }
        }
        RelativePath::new(&parts.join("/"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Final path component.
    pub fn file_name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// Join onto a target directory, component by component.
    pub fn to_fs_path(&self, base: &Path) -> PathBuf {
        let mut result = base.to_path_buf();
        for component in self.0.split('/') {
            result.push(component);
        }
        result
    }
}

impl std::fmt::Display for RelativePath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelativePath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RelativePath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self, Error> {
        RelativePath::new(&value)
    }
}

impl From<RelativePath> for String {
    fn from(path: RelativePath) -> String {
        path.0
    }
}

/// The per-file record within a snapshot.
///
/// Created exclusively during a backup, never mutated, destroyed only
/// with its containing snapshot.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct FileEntry {
    /// Catalog row id; zero until recorded.
    #[serde(default)]
    pub file_id: i64,
    pub snapshot_id: String,
    pub path: RelativePath,
    pub size: u64,
    pub modified_time: i64,
    /// Merkle digest over the ordered chunk digests.
    pub file_digest: Digest,
    /// Ordered chunk addresses; empty for empty files.
    pub chunk_digests: Vec<Digest>,
}

/// An immutable labeled set of file entries captured at one point in
/// time.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    pub snapshot_id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Creation time (Unix epoch).
    pub created_at: i64,
    /// Prior snapshot in the chain, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Absolute source path captured at backup time.
    pub source_root: String,
    /// Fixed chunk size the snapshot was taken with.
    pub chunk_size: u64,
    pub total_files: u64,
    pub total_size: u64,
    /// Merkle root over the file set; missing while the backup is
    /// still running.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_root: Option<Digest>,
    pub finished: bool,
}

impl Snapshot {
    pub fn created_rfc3339(&self) -> Result<String, Error> {
        proxmox_time::epoch_to_rfc3339_utc(self.created_at).map_err(Error::from)
    }

    /// Sort by creation, tie-broken on the monotonic id.
    pub fn sort_list(list: &mut [Snapshot], ascending: bool) {
        if ascending {
            list.sort_unstable_by(|a, b| {
                (a.created_at, &a.snapshot_id).cmp(&(b.created_at, &b.snapshot_id))
            });
        } else {
            list.sort_unstable_by(|a, b| {
                (b.created_at, &b.snapshot_id).cmp(&(a.created_at, &a.snapshot_id))
            });
        }
    }
}

static SNAPSHOT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Generate a time-ordered snapshot id.
///
/// 48 bits of milliseconds plus a 16 bit sequence, rendered as hex:
/// lexicographic order equals creation order for ids from one process,
/// and the catalog rejects duplicates on insert.
pub fn generate_snapshot_id() -> String {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0);
    let seq = SNAPSHOT_SEQ.fetch_add(1, Ordering::Relaxed) & 0xffff;
    format!("{:012x}{:04x}", millis & 0xffff_ffff_ffff, seq)
}
