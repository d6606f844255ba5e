//! The message surface exposed to point-to-point transfer layers.
//!
//! The transport itself lives out of tree; whatever carries the bytes
//! implements [`RemoteEndpoint`] with exactly these four messages.
//! [`LocalEndpoint`] is the loopback implementation backed by a local
//! repository, used by tests and same-host replication.

use std::collections::HashSet;

use skp_api_types::Digest;
use skp_datastore::{hasher, Error, FileEntry, Snapshot};

use crate::engine::Engine;
use crate::task::CancelToken;

pub trait RemoteEndpoint {
    /// Store a chunk. Idempotent: re-sending a digest is a no-op.
    fn put_chunk(&self, digest: &Digest, data: &[u8]) -> Result<(), Error>;

    /// Fetch a chunk's payload.
    fn get_chunk(&self, digest: &Digest) -> Result<Vec<u8>, Error>;

    /// Store a complete snapshot. Idempotent on the snapshot id; all
    /// referenced chunks must have been put first.
    fn put_snapshot(&self, snapshot: &Snapshot, files: &[FileEntry]) -> Result<(), Error>;

    fn list_snapshots(&self) -> Result<Vec<Snapshot>, Error>;
}

/// Loopback endpoint over a local repository.
pub struct LocalEndpoint<'a> {
    engine: &'a Engine,
}

impl<'a> LocalEndpoint<'a> {
    pub fn new(engine: &'a Engine) -> Self {
        Self { engine }
    }
}

impl RemoteEndpoint for LocalEndpoint<'_> {
    fn put_chunk(&self, digest: &Digest, data: &[u8]) -> Result<(), Error> {
        if &hasher::hash(data) != digest {
            return Err(Error::Integrity(format!(
                "chunk payload does not hash to {digest}"
            )));
        }
        self.engine.chunk_store().insert_chunk(data)?;
        Ok(())
    }

    fn get_chunk(&self, digest: &Digest) -> Result<Vec<u8>, Error> {
        self.engine.chunk_store().get(digest)
    }

    fn put_snapshot(&self, snapshot: &Snapshot, files: &[FileEntry]) -> Result<(), Error> {
        let imported = self
            .engine
            .catalog()
            .import_snapshot(self.engine.chunk_store(), snapshot, files)?;
        if !imported {
            log::debug!("snapshot '{}' already present", snapshot.snapshot_id);
        }
        Ok(())
    }

    fn list_snapshots(&self) -> Result<Vec<Snapshot>, Error> {
        self.engine.catalog().list_snapshots()
    }
}

/// Replicate one snapshot to a transfer peer.
///
/// Sends every chunk the snapshot references (once), then the snapshot
/// metadata. Returns the number of chunks sent.
pub fn push_snapshot(
    engine: &Engine,
    snapshot_id: &str,
    remote: &dyn RemoteEndpoint,
    cancel: &CancelToken,
) -> Result<u64, Error> {
    let snapshot = engine
        .catalog()
        .get_snapshot(snapshot_id)?
        .ok_or_else(|| Error::SnapshotNotFound(snapshot_id.to_string()))?;
    let files = engine.catalog().files_of(snapshot_id)?;

    let mut sent = 0;
    let mut seen = HashSet::new();
    for entry in &files {
        for digest in &entry.chunk_digests {
            cancel.check()?;
            if !seen.insert(*digest) {
                continue;
            }
            let data = engine.chunk_store().get(digest)?;
            remote.put_chunk(digest, &data)?;
            sent += 1;
        }
    }

    remote.put_snapshot(&snapshot, &files)?;
    log::info!("pushed snapshot '{snapshot_id}' ({sent} chunks)");
    Ok(sent)
}
