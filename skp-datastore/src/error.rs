use skp_api_types::Digest;

/// Errors raised by the storage core and the engines built on it.
///
/// The variants map to the failure classes callers branch on: missing
/// digests or snapshots are normal returns for lookups, integrity and
/// invariant violations abort the enclosing operation, and per-file I/O
/// problems are counted and reported without stopping a run.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("chunk {0} not found")]
    ChunkNotFound(Digest),

    #[error("snapshot '{0}' not found")]
    SnapshotNotFound(String),

    #[error("integrity check failed: {0}")]
    Integrity(String),

    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}: {1}")]
    IoPath(String, #[source] std::io::Error),

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error("operation conflicts with an exclusive lock: {0}")]
    Conflict(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("unsupported schema version {found} for table '{table}' (supported: {supported})")]
    SchemaVersion {
        table: String,
        found: u32,
        supported: u32,
    },

    /// Failures bubbled up from the platform helper crates.
    #[error(transparent)]
    Platform(#[from] anyhow::Error),
}

impl Error {
    /// Attach path context to a raw I/O error.
    pub fn io_path(context: impl Into<String>, err: std::io::Error) -> Self {
        Error::IoPath(context.into(), err)
    }

    /// True for per-entry I/O failures that a running engine counts and
    /// skips instead of aborting.
    pub fn is_per_file(&self) -> bool {
        matches!(self, Error::Io(_) | Error::IoPath(..))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::ChunkNotFound(_) | Error::SnapshotNotFound(_))
    }
}
