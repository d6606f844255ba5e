use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use proxmox_sys::fs::{create_path, replace_file, CreateOptions};
use rusqlite::{Connection, OptionalExtension};

use skp_api_types::{Digest, SweepStats};

use crate::data_blob::DataBlob;
use crate::schema;
use crate::{hasher, Error};

/// Shared handle to the repository catalog database.
pub type SharedConnection = Arc<Mutex<Connection>>;

const CHUNKS_TABLE_VERSION: u32 = 1;

const CHUNKS_TABLE_SQL: &str = "CREATE TABLE chunks (
        digest TEXT PRIMARY KEY,
        size INTEGER NOT NULL,
        refcount INTEGER NOT NULL DEFAULT 0
    )";

/// Content-addressed chunk repository with reference counting.
///
/// Payloads live as one blob file per digest under a two-level fan-out
/// directory; the `chunks` table in the shared catalog database tracks
/// size and refcount. Refcount updates from the catalog run through
/// [`ChunkStore::reference_in_tx`] so they commit together with the
/// file rows referencing the chunk.
pub struct ChunkStore {
    base: PathBuf,
    chunk_dir: PathBuf,
    conn: SharedConnection,
    mutex: Mutex<()>,
    compress: bool,
}

fn digest_prefix(digest_str: &str) -> PathBuf {
    let mut path = PathBuf::new();
    path.push(&digest_str[0..2]);
    path.push(&digest_str[2..4]);
    path
}

impl ChunkStore {
    fn chunk_dir<P: AsRef<Path>>(path: P) -> PathBuf {
        let mut chunk_dir: PathBuf = PathBuf::from(path.as_ref());
        chunk_dir.push("chunks");

        chunk_dir
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create the chunk directory and table, then open the store.
    pub fn create<P>(path: P, conn: SharedConnection, compress: bool) -> Result<Self, Error>
    where
        P: Into<PathBuf>,
    {
        let base: PathBuf = path.into();

        if !base.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "expected absolute path - got {base:?}"
            )));
        }

        let chunk_dir = Self::chunk_dir(&base);
        create_path(&chunk_dir, None, None)?;

        Self::open(base, conn, compress)
    }

    /// Open an existing chunk store.
    pub fn open<P: Into<PathBuf>>(
        path: P,
        conn: SharedConnection,
        compress: bool,
    ) -> Result<Self, Error> {
        let base: PathBuf = path.into();

        if !base.is_absolute() {
            return Err(Error::InvalidArgument(format!(
                "expected absolute path - got {base:?}"
            )));
        }

        let chunk_dir = Self::chunk_dir(&base);

        if let Err(err) = std::fs::metadata(&chunk_dir) {
            return Err(Error::io_path(
                format!("unable to open chunk store at {chunk_dir:?}"),
                err,
            ));
        }

        {
            let guard = conn.lock().unwrap();
            schema::initialize_table(&guard, "chunks", CHUNKS_TABLE_VERSION, CHUNKS_TABLE_SQL)?;
        }

        Ok(ChunkStore {
            base,
            chunk_dir,
            conn,
            mutex: Mutex::new(()),
            compress,
        })
    }

    /// Blob file location for a digest.
    pub fn chunk_path(&self, digest: &Digest) -> (PathBuf, String) {
        let digest_str = digest.to_hex();
        let mut chunk_path = self.chunk_dir.clone();
        chunk_path.push(digest_prefix(&digest_str));
        chunk_path.push(&digest_str);
        (chunk_path, digest_str)
    }

    /// Store a chunk if absent; the refcount is left untouched.
    ///
    /// Returns the digest, whether the chunk was already present, and
    /// the encoded size on disk. Concurrent inserts of the same digest
    /// collapse to a single blob.
    pub fn insert_chunk(&self, data: &[u8]) -> Result<(Digest, bool, u64), Error> {
        let digest = hasher::hash(data);
        let (chunk_path, digest_str) = self.chunk_path(&digest);

        let _lock = self.mutex.lock().unwrap();

        if let Some(size) = self.stored_size(&digest)? {
            if let Ok(metadata) = std::fs::metadata(&chunk_path) {
                if metadata.is_file() {
                    return Ok((digest, true, metadata.len()));
                }
                return Err(Error::Invariant(format!(
                    "got unexpected file type for chunk {digest_str}"
                )));
            }
            // row without blob file: crash leftover, rewrite below
            log::warn!("chunk {digest_str} has a row ({size} bytes) but no blob, rewriting");
        }

        let blob = DataBlob::encode(data, self.compress)?;
        let encoded_size = blob.raw_size();

        let chunk_dir_path = chunk_path
            .parent()
            .ok_or_else(|| Error::Invariant("unable to get chunk dir".into()))?;
        create_path(chunk_dir_path, None, None)?;

        replace_file(&chunk_path, blob.raw_data(), CreateOptions::new(), true)?;

        let guard = self.conn.lock().unwrap();
        guard.execute(
            "INSERT INTO chunks (digest, size, refcount) VALUES (?1, ?2, 0)
             ON CONFLICT(digest) DO UPDATE SET size = excluded.size",
            rusqlite::params![digest_str, data.len() as u64],
        )?;

        Ok((digest, false, encoded_size))
    }

    /// Store a chunk and take one reference on it.
    ///
    /// The canonical write path for direct store users: dedup happens
    /// here, and each call accounts for exactly one reference.
    pub fn put(&self, data: &[u8]) -> Result<(Digest, bool), Error> {
        let (digest, known, _) = self.insert_chunk(data)?;
        self.reference(&digest, 1)?;
        Ok((digest, known))
    }

    /// Load and decode a chunk, verifying its digest.
    ///
    /// Corrupt blobs are quarantined as `<digest>.bad` and reported as
    /// integrity errors; re-inserting the digest writes a fresh blob.
    pub fn get(&self, digest: &Digest) -> Result<Vec<u8>, Error> {
        let (chunk_path, digest_str) = self.chunk_path(digest);

        if self.stored_size(digest)?.is_none() {
            return Err(Error::ChunkNotFound(*digest));
        }

        let mut file = std::fs::File::open(&chunk_path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                Error::Integrity(format!("chunk {digest_str} has a row but no blob file"))
            } else {
                Error::io_path(format!("unable to open chunk {digest_str}"), err)
            }
        })?;

        let result = DataBlob::load_from_reader(&mut file)
            .and_then(|blob| blob.decode(Some(digest)));

        match result {
            Ok(data) => Ok(data),
            Err(err @ Error::Integrity(_)) => {
                self.quarantine_chunk(digest);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    pub fn exists(&self, digest: &Digest) -> Result<bool, Error> {
        Ok(self.stored_size(digest)?.is_some())
    }

    /// Current refcount, if the chunk is known.
    pub fn refcount(&self, digest: &Digest) -> Result<Option<u64>, Error> {
        let guard = self.conn.lock().unwrap();
        let refcount = guard
            .query_row(
                "SELECT refcount FROM chunks WHERE digest = ?1",
                [digest.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(refcount)
    }

    /// Adjust a chunk's refcount by `delta` in its own transaction.
    pub fn reference(&self, digest: &Digest, delta: i64) -> Result<i64, Error> {
        let guard = self.conn.lock().unwrap();
        let tx = guard.unchecked_transaction()?;
        let refcount = self.reference_in_tx(&tx, digest, delta)?;
        tx.commit()?;
        Ok(refcount)
    }

    /// Refcount adjustment inside a caller-owned transaction.
    ///
    /// The catalog brokers all its refcount updates through here so
    /// they commit or roll back together with file rows. The caller
    /// must hold the shared connection lock; do not call
    /// [`ChunkStore::reference`] while a transaction is open.
    pub fn reference_in_tx(
        &self,
        tx: &rusqlite::Transaction,
        digest: &Digest,
        delta: i64,
    ) -> Result<i64, Error> {
        let digest_str = digest.to_hex();
        let refcount: Option<i64> = tx
            .query_row(
                "SELECT refcount FROM chunks WHERE digest = ?1",
                [&digest_str],
                |row| row.get(0),
            )
            .optional()?;

        let refcount = refcount.ok_or(Error::ChunkNotFound(*digest))?;

        let updated = refcount + delta;
        if updated < 0 {
            return Err(Error::Invariant(format!(
                "refcount underflow for chunk {digest_str} ({refcount} {delta:+})"
            )));
        }

        tx.execute(
            "UPDATE chunks SET refcount = ?2 WHERE digest = ?1",
            rusqlite::params![digest_str, updated],
        )?;

        Ok(updated)
    }

    /// Number of chunk rows.
    pub fn chunk_count(&self) -> Result<u64, Error> {
        let guard = self.conn.lock().unwrap();
        let count = guard.query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Sum of all refcounts (reference conservation checks).
    pub fn total_references(&self) -> Result<u64, Error> {
        let guard = self.conn.lock().unwrap();
        let total = guard.query_row(
            "SELECT COALESCE(SUM(refcount), 0) FROM chunks",
            [],
            |row| row.get(0),
        )?;
        Ok(total)
    }

    /// Delete all chunks with refcount zero.
    ///
    /// Also removes quarantined and orphaned blob files left behind by
    /// crashes. The engine serializes this against backup and restore;
    /// the store mutex additionally excludes concurrent inserts.
    pub fn sweep(&self) -> Result<SweepStats, Error> {
        let _lock = self.mutex.lock().unwrap();

        let mut stats = SweepStats::default();
        let mut victims: Vec<(String, u64)> = Vec::new();
        let mut live = std::collections::HashSet::new();

        {
            let guard = self.conn.lock().unwrap();
            let tx = guard.unchecked_transaction()?;
            {
                let mut query =
                    tx.prepare("SELECT digest, size FROM chunks WHERE refcount = 0")?;
                let rows = query.query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, u64>(1)?))
                })?;
                for row in rows {
                    victims.push(row?);
                }
            }
            tx.execute("DELETE FROM chunks WHERE refcount = 0", [])?;

            let (disk_chunks, disk_bytes) = tx.query_row(
                "SELECT COUNT(*), COALESCE(SUM(size), 0) FROM chunks",
                [],
                |row| Ok((row.get::<_, u64>(0)?, row.get::<_, u64>(1)?)),
            )?;
            stats.disk_chunks = disk_chunks;
            stats.disk_bytes = disk_bytes;

            {
                let mut query = tx.prepare("SELECT digest FROM chunks")?;
                let rows = query.query_map([], |row| row.get::<_, String>(0))?;
                for row in rows {
                    live.insert(row?);
                }
            }
            tx.commit()?;
        }

        for (digest_str, size) in &victims {
            let mut chunk_path = self.chunk_dir.clone();
            chunk_path.push(digest_prefix(digest_str));
            chunk_path.push(digest_str);
            match std::fs::remove_file(&chunk_path) {
                Ok(()) => {
                    stats.removed_chunks += 1;
                    stats.removed_bytes += size;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    stats.removed_chunks += 1;
                }
                Err(err) => {
                    return Err(Error::io_path(
                        format!("unlinking chunk {digest_str} failed"),
                        err,
                    ))
                }
            }
        }

        self.sweep_stray_files(&live, &mut stats)?;

        log::info!(
            "chunk store sweep: removed {} chunks ({} bytes), {} left on disk",
            stats.removed_chunks,
            stats.removed_bytes,
            stats.disk_chunks,
        );

        Ok(stats)
    }

    // Remove blob files with no catalog row: quarantined `.bad` blobs
    // whose digest is gone and partial-put leftovers.
    fn sweep_stray_files(
        &self,
        live: &std::collections::HashSet<String>,
        stats: &mut SweepStats,
    ) -> Result<(), Error> {
        for entry in walkdir::WalkDir::new(&self.chunk_dir)
            .min_depth(3)
            .max_depth(3)
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("sweep: unable to read chunk dir entry - {err}");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let name = match entry.file_name().to_str() {
                Some(name) => name,
                None => continue,
            };

            let (digest_part, bad) = match name.strip_suffix(".bad") {
                Some(digest_part) => (digest_part, true),
                None => (name, false),
            };
            if digest_part.len() != 64 || !digest_part.bytes().all(|b| b.is_ascii_hexdigit()) {
                continue;
            }

            if bad {
                if !live.contains(digest_part) {
                    if std::fs::remove_file(entry.path()).is_ok() {
                        stats.removed_bad += 1;
                    }
                }
            } else if !live.contains(digest_part) {
                if std::fs::remove_file(entry.path()).is_ok() {
                    stats.removed_orphans += 1;
                }
            }
        }
        Ok(())
    }

    fn quarantine_chunk(&self, digest: &Digest) {
        let _lock = self.mutex.lock().unwrap();
        let (chunk_path, digest_str) = self.chunk_path(digest);
        let mut bad_path = chunk_path.clone();
        bad_path.set_extension("bad");
        match std::fs::rename(&chunk_path, &bad_path) {
            Ok(()) => log::warn!("corrupt chunk {digest_str} renamed to {bad_path:?}"),
            Err(err) => log::error!("failed to quarantine corrupt chunk {digest_str} - {err}"),
        }
    }

    fn stored_size(&self, digest: &Digest) -> Result<Option<u64>, Error> {
        let guard = self.conn.lock().unwrap();
        let size = guard
            .query_row(
                "SELECT size FROM chunks WHERE digest = ?1",
                [digest.to_hex()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(size)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Arc::new(Mutex::new(Connection::open_in_memory().unwrap()));
        let store = ChunkStore::create(dir.path().to_path_buf(), conn, true).unwrap();
        (dir, store)
    }

    #[test]
    fn put_deduplicates_and_counts_references() {
        let (_dir, store) = test_store();

        let (digest, known) = store.put(b"identical bytes").unwrap();
        assert!(!known);
        let (again, known) = store.put(b"identical bytes").unwrap();
        assert!(known);
        assert_eq!(digest, again);

        assert_eq!(store.refcount(&digest).unwrap(), Some(2));
        assert_eq!(store.chunk_count().unwrap(), 1);
    }

    #[test]
    fn insert_chunk_leaves_refcount_alone() {
        let (_dir, store) = test_store();
        let (digest, known, _) = store.insert_chunk(b"uncounted").unwrap();
        assert!(!known);
        assert_eq!(store.refcount(&digest).unwrap(), Some(0));
        let (_, known, _) = store.insert_chunk(b"uncounted").unwrap();
        assert!(known);
        assert_eq!(store.refcount(&digest).unwrap(), Some(0));
    }

    #[test]
    fn get_verifies_and_returns_payload() {
        let (_dir, store) = test_store();
        let data = b"some chunk payload".to_vec();
        let (digest, _) = store.put(&data).unwrap();
        assert_eq!(store.get(&digest).unwrap(), data);

        let absent = hasher::hash(b"never stored");
        assert!(matches!(
            store.get(&absent),
            Err(Error::ChunkNotFound(_))
        ));
    }

    #[test]
    fn tampered_blob_is_detected_and_quarantined() {
        let (_dir, store) = test_store();
        let (digest, _) = store.put(b"chunk to corrupt").unwrap();
        let (chunk_path, _) = store.chunk_path(&digest);

        let mut raw = std::fs::read(&chunk_path).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        std::fs::write(&chunk_path, &raw).unwrap();

        assert!(matches!(store.get(&digest), Err(Error::Integrity(_))));
        assert!(!chunk_path.exists());
        let mut bad_path = chunk_path.clone();
        bad_path.set_extension("bad");
        assert!(bad_path.exists());
    }

    #[test]
    fn reference_underflow_is_refused() {
        let (_dir, store) = test_store();
        let (digest, _) = store.put(b"counted once").unwrap();
        assert_eq!(store.reference(&digest, -1).unwrap(), 0);
        assert!(matches!(
            store.reference(&digest, -1),
            Err(Error::Invariant(_))
        ));
    }

    #[test]
    fn sweep_removes_unreferenced_chunks_only() {
        let (_dir, store) = test_store();
        let (kept, _) = store.put(b"still referenced").unwrap();
        let (gone, _, _) = store.insert_chunk(b"never referenced").unwrap();

        let stats = store.sweep().unwrap();
        assert_eq!(stats.removed_chunks, 1);
        assert_eq!(stats.disk_chunks, 1);

        assert!(store.exists(&kept).unwrap());
        assert!(!store.exists(&gone).unwrap());
        let (gone_path, _) = store.chunk_path(&gone);
        assert!(!gone_path.exists());
    }

    #[test]
    fn sweep_collects_quarantined_blobs() {
        let (_dir, store) = test_store();
        let (digest, _) = store.put(b"will go bad").unwrap();
        let (chunk_path, _) = store.chunk_path(&digest);

        std::fs::write(&chunk_path, b"garbage").unwrap();
        assert!(store.get(&digest).is_err());

        // drop the last reference, then sweep away row and .bad file
        store.reference(&digest, -1).unwrap();
        let stats = store.sweep().unwrap();
        assert_eq!(stats.removed_chunks, 1);
        assert_eq!(stats.removed_bad, 1);
    }
}
