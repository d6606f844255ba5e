//! Shared value and result types for the snapkeep engines.
//!
//! These types cross the boundary between the storage core, the engines
//! and the (out of tree) front-ends, so everything here is plain data
//! with serde derives.

use serde::{Deserialize, Serialize};

mod digest;
pub use digest::{Digest, DIGEST_HEX_LEN};

mod retention;
pub use retention::RetentionPolicy;

/// Smallest accepted chunk size (4 KiB).
pub const CHUNK_SIZE_MIN: usize = 4 * 1024;
/// Largest accepted chunk size (16 MiB).
pub const CHUNK_SIZE_MAX: usize = 16 * 1024 * 1024;
/// Default chunk size (64 KiB).
pub const CHUNK_SIZE_DEFAULT: usize = 64 * 1024;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// How the scanner treats symbolic links.
pub enum SymlinkStrategy {
    /// Emit the symlink itself as a candidate with its own kind.
    #[default]
    Preserve,
    /// Dereference and scan the target.
    Follow,
    /// Omit symlinks entirely.
    Skip,
}

impl std::str::FromStr for SymlinkStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preserve" => Ok(SymlinkStrategy::Preserve),
            "follow" => Ok(SymlinkStrategy::Follow),
            "skip" => Ok(SymlinkStrategy::Skip),
            other => Err(format!("invalid symlink strategy '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Kind of a scanned directory entry.
pub enum FileKind {
    Regular,
    Symlink,
    Directory,
}

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Scanner configuration.
pub struct ScanOptions {
    pub symlink_strategy: SymlinkStrategy,
    /// Whether dotfiles are emitted.
    pub include_hidden: bool,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Backup configuration.
pub struct BackupOptions {
    /// Label for the new snapshot.
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Fixed chunk size in bytes.
    pub chunk_size: usize,
    /// Run the integrity verifier on the new snapshot before commit.
    pub verify_integrity: bool,
    pub scan: ScanOptions,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            name: String::from("backup"),
            description: None,
            chunk_size: CHUNK_SIZE_DEFAULT,
            verify_integrity: false,
            scan: ScanOptions::default(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Restore configuration.
///
/// When both `overwrite_existing` and `skip_existing` are set, skip wins.
/// With neither set, an existing target file counts as an error.
pub struct RestoreOptions {
    pub overwrite_existing: bool,
    pub skip_existing: bool,
    /// Rename existing files to `<name>.bak-<timestamp>` before writing.
    pub backup_existing: bool,
    /// Re-hash each restored file and compare to the recorded digest.
    pub verify_integrity: bool,
    /// Restore modification time and mode bits.
    pub preserve_attributes: bool,
    /// Glob filter applied to entry paths before `exclude_pattern`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_pattern: Option<String>,
    /// Compute and report what would happen, touch nothing.
    pub dry_run: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// How deep the integrity verifier digs.
pub enum VerifyLevel {
    /// Every referenced chunk exists and decodes to its digest.
    ChunksOnly,
    /// Additionally recompute each file digest from its chunk list.
    FileHashes,
    /// Additionally validate the snapshot parent chain.
    Chain,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Per-file error record surfaced in engine results.
pub struct FileError {
    pub path: String,
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Result record of a backup run.
pub struct BackupStats {
    /// Id of the committed snapshot.
    pub snapshot_id: String,
    /// Number of files recorded in the snapshot.
    pub files_processed: u64,
    /// Number of candidates skipped (non-regular entries).
    pub files_skipped: u64,
    /// Number of files dropped due to read errors.
    pub files_with_errors: u64,
    /// Sum of recorded file sizes.
    pub bytes_processed: u64,
    /// Chunks newly written to the store.
    pub chunks_created: u64,
    /// Chunks already present (deduplicated).
    pub chunks_reused: u64,
    /// Whether post-backup verification ran and passed.
    pub integrity_verified: bool,
    pub errors: Vec<FileError>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Result record of a restore or rollback run.
pub struct RestoreStats {
    pub files_restored: u64,
    pub files_skipped: u64,
    pub files_with_errors: u64,
    /// Sum of bytes written (or planned in a dry run).
    pub bytes_restored: u64,
    /// Whether post-restore verification ran and passed.
    pub integrity_verified: bool,
    /// Extraneous paths removed by rollback (planned in a dry run).
    pub deleted_extraneous: Vec<String>,
    pub errors: Vec<FileError>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// A single verification failure.
pub struct VerifyError {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Digest of the offending chunk, if the failure is chunk-scoped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<Digest>,
    pub message: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Result record of an integrity verification run.
pub struct VerifyStats {
    pub snapshot_id: String,
    /// Number of chunks read and digest-checked.
    pub chunks_verified: u64,
    /// Number of files whose digest was recomputed.
    pub files_verified: u64,
    pub errors: Vec<VerifyError>,
}

impl VerifyStats {
    pub fn ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Result of a chunk store sweep.
pub struct SweepStats {
    /// Number of removed chunks.
    pub removed_chunks: u64,
    /// Sum of removed bytes.
    pub removed_bytes: u64,
    /// Chunks still referenced and kept on disk.
    pub disk_chunks: u64,
    /// Sum of kept bytes.
    pub disk_bytes: u64,
    /// Quarantined `.bad` blobs removed because their digest row is gone.
    pub removed_bad: u64,
    /// Blob files without a catalog row, removed as crash leftovers.
    pub removed_orphans: u64,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// Kind of change between two snapshots for one path.
pub enum DiffKind {
    Added,
    Deleted,
    Modified,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
/// One entry of a snapshot diff.
pub struct DiffEntry {
    pub path: String,
    pub kind: DiffKind,
}
