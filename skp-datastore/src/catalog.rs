//! Durable catalog of snapshots, files and chunk references.
//!
//! Everything lives in one SQLite database so that file rows and the
//! refcount updates they imply commit or roll back together. Refcount
//! changes are brokered through [`ChunkStore::reference_in_tx`]; the
//! catalog never touches the `chunks` table itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use rusqlite::{Connection, OptionalExtension, Transaction};

use skp_api_types::{Digest, DiffEntry};

use crate::chunk_store::{ChunkStore, SharedConnection};
use crate::snapshot::{generate_snapshot_id, FileEntry, RelativePath, Snapshot};
use crate::{merkle, schema, Error};

const SNAPSHOTS_TABLE_VERSION: u32 = 1;
const FILES_TABLE_VERSION: u32 = 1;
const FILE_CHUNKS_TABLE_VERSION: u32 = 1;

const SNAPSHOTS_TABLE_SQL: &str = "CREATE TABLE snapshots (
        snapshot_id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT,
        created_at INTEGER NOT NULL,
        parent_id TEXT,
        source_root TEXT NOT NULL,
        chunk_size INTEGER NOT NULL,
        total_files INTEGER NOT NULL DEFAULT 0,
        total_size INTEGER NOT NULL DEFAULT 0,
        snapshot_root TEXT,
        finished INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX snapshots_parent_idx ON snapshots(parent_id);
    CREATE INDEX snapshots_source_root_idx ON snapshots(source_root, created_at)";

const FILES_TABLE_SQL: &str = "CREATE TABLE files (
        file_id INTEGER PRIMARY KEY AUTOINCREMENT,
        snapshot_id TEXT NOT NULL,
        path TEXT NOT NULL,
        size INTEGER NOT NULL,
        modified_time INTEGER NOT NULL,
        file_digest TEXT NOT NULL,
        UNIQUE (snapshot_id, path)
    );
    CREATE INDEX files_path_idx ON files(path)";

const FILE_CHUNKS_TABLE_SQL: &str = "CREATE TABLE file_chunks (
        file_id INTEGER NOT NULL,
        chunk_index INTEGER NOT NULL,
        digest TEXT NOT NULL,
        PRIMARY KEY (file_id, chunk_index)
    );
    CREATE INDEX file_chunks_digest_idx ON file_chunks(digest)";

/// Parameters for a new snapshot row.
pub struct NewSnapshot {
    pub name: String,
    pub description: Option<String>,
    pub source_root: String,
    pub parent_id: Option<String>,
    pub chunk_size: u64,
}

/// The snapshot/file metadata store.
pub struct Catalog {
    conn: SharedConnection,
}

fn parse_digest(digest: &str) -> Result<Digest, Error> {
    digest
        .parse()
        .map_err(|_| Error::Invariant(format!("corrupt digest '{digest}' in catalog")))
}

impl Catalog {
    /// Open (or create) the catalog database file and apply the
    /// connection pragmas.
    pub fn open_db(path: &Path) -> Result<SharedConnection, Error> {
        let conn = Connection::open(path)?;
        // journal_mode returns a result row, pragma_update chokes on it
        let _mode: String =
            conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(Arc::new(Mutex::new(conn)))
    }

    /// Initialize the catalog tables on a shared connection.
    pub fn open(conn: SharedConnection) -> Result<Self, Error> {
        {
            let guard = conn.lock().unwrap();
            schema::initialize_table(
                &guard,
                "snapshots",
                SNAPSHOTS_TABLE_VERSION,
                SNAPSHOTS_TABLE_SQL,
            )?;
            schema::initialize_table(&guard, "files", FILES_TABLE_VERSION, FILES_TABLE_SQL)?;
            schema::initialize_table(
                &guard,
                "file_chunks",
                FILE_CHUNKS_TABLE_VERSION,
                FILE_CHUNKS_TABLE_SQL,
            )?;
        }
        Ok(Catalog { conn })
    }

    /// Insert a new, unfinished snapshot row.
    ///
    /// Commits are serialized on the connection; `created_at` is bumped
    /// to stay monotonic so commit order equals creation order.
    pub fn create_snapshot(&self, meta: NewSnapshot) -> Result<Snapshot, Error> {
        let guard = self.conn.lock().unwrap();
        let tx = guard.unchecked_transaction()?;

        if let Some(parent_id) = &meta.parent_id {
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM snapshots WHERE snapshot_id = ?1",
                    [parent_id],
                    |row| row.get(0),
                )
                .optional()?;
            if exists.is_none() {
                return Err(Error::Invariant(format!(
                    "parent snapshot '{parent_id}' does not exist"
                )));
            }
        }

        let mut created_at = proxmox_time::epoch_i64();
        let last: Option<i64> =
            tx.query_row("SELECT MAX(created_at) FROM snapshots", [], |row| {
                row.get(0)
            })?;
        if let Some(last) = last {
            if created_at < last {
                created_at = last;
            }
        }

        let snapshot_id = loop {
            let candidate = generate_snapshot_id();
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO snapshots
                     (snapshot_id, name, description, created_at, parent_id,
                      source_root, chunk_size, finished)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0)",
                rusqlite::params![
                    candidate,
                    meta.name,
                    meta.description,
                    created_at,
                    meta.parent_id,
                    meta.source_root,
                    meta.chunk_size,
                ],
            )?;
            if inserted == 1 {
                break candidate;
            }
        };

        tx.commit()?;

        Ok(Snapshot {
            snapshot_id,
            name: meta.name,
            description: meta.description,
            created_at,
            parent_id: meta.parent_id,
            source_root: meta.source_root,
            chunk_size: meta.chunk_size,
            total_files: 0,
            total_size: 0,
            snapshot_root: None,
            finished: false,
        })
    }

    /// Record one file entry and take a reference on each of its
    /// chunks, all in one transaction.
    pub fn record_file(&self, store: &ChunkStore, entry: &FileEntry) -> Result<i64, Error> {
        let guard = self.conn.lock().unwrap();
        let tx = guard.unchecked_transaction()?;

        let finished: Option<bool> = tx
            .query_row(
                "SELECT finished FROM snapshots WHERE snapshot_id = ?1",
                [&entry.snapshot_id],
                |row| row.get(0),
            )
            .optional()?;
        match finished {
            None => return Err(Error::SnapshotNotFound(entry.snapshot_id.clone())),
            Some(true) => {
                return Err(Error::Invariant(format!(
                    "snapshot '{}' is already finalized",
                    entry.snapshot_id
                )))
            }
            Some(false) => (),
        }

        let file_id = Self::insert_file_in_tx(&tx, store, entry)?;
        tx.commit()?;
        Ok(file_id)
    }

    fn insert_file_in_tx(
        tx: &Transaction,
        store: &ChunkStore,
        entry: &FileEntry,
    ) -> Result<i64, Error> {
        tx.execute(
            "INSERT INTO files (snapshot_id, path, size, modified_time, file_digest)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            rusqlite::params![
                entry.snapshot_id,
                entry.path.as_str(),
                entry.size,
                entry.modified_time,
                entry.file_digest.to_hex(),
            ],
        )?;
        let file_id = tx.last_insert_rowid();

        let mut insert = tx.prepare(
            "INSERT INTO file_chunks (file_id, chunk_index, digest) VALUES (?1, ?2, ?3)",
        )?;
        for (chunk_index, digest) in entry.chunk_digests.iter().enumerate() {
            insert.execute(rusqlite::params![
                file_id,
                chunk_index as i64,
                digest.to_hex()
            ])?;
            store.reference_in_tx(tx, digest, 1)?;
        }

        Ok(file_id)
    }

    /// Seal a snapshot with its Merkle root and final totals.
    pub fn finalize_snapshot(
        &self,
        snapshot_id: &str,
        snapshot_root: &Digest,
        total_files: u64,
        total_size: u64,
    ) -> Result<(), Error> {
        let guard = self.conn.lock().unwrap();
        let updated = guard.execute(
            "UPDATE snapshots
                SET snapshot_root = ?2, total_files = ?3, total_size = ?4, finished = 1
              WHERE snapshot_id = ?1 AND finished = 0",
            rusqlite::params![snapshot_id, snapshot_root.to_hex(), total_files, total_size],
        )?;
        if updated != 1 {
            return Err(Error::Invariant(format!(
                "snapshot '{snapshot_id}' missing or already finalized"
            )));
        }
        Ok(())
    }

    pub fn get_snapshot(&self, snapshot_id: &str) -> Result<Option<Snapshot>, Error> {
        let guard = self.conn.lock().unwrap();
        Self::get_snapshot_on(&guard, snapshot_id)
    }

    fn get_snapshot_on(conn: &Connection, snapshot_id: &str) -> Result<Option<Snapshot>, Error> {
        let row = conn
            .query_row(
                &format!("{SNAPSHOT_SELECT} WHERE snapshot_id = ?1"),
                [snapshot_id],
                Self::row_to_snapshot,
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(row?)),
        }
    }

    /// All finished snapshots, newest first.
    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>, Error> {
        let guard = self.conn.lock().unwrap();
        let mut query = guard.prepare(&format!(
            "{SNAPSHOT_SELECT} WHERE finished = 1
              ORDER BY created_at DESC, snapshot_id DESC"
        ))?;
        let rows = query.query_map([], Self::row_to_snapshot)?;
        let mut list = Vec::new();
        for row in rows {
            list.push(row??);
        }
        Ok(list)
    }

    /// Most recent finished snapshot taken from the given source root;
    /// the parent for the next incremental backup.
    pub fn latest_snapshot_for_root(
        &self,
        source_root: &str,
    ) -> Result<Option<Snapshot>, Error> {
        let guard = self.conn.lock().unwrap();
        let row = guard
            .query_row(
                &format!(
                    "{SNAPSHOT_SELECT} WHERE finished = 1 AND source_root = ?1
                      ORDER BY created_at DESC, snapshot_id DESC LIMIT 1"
                ),
                [source_root],
                Self::row_to_snapshot,
            )
            .optional()?;
        match row {
            None => Ok(None),
            Some(row) => Ok(Some(row?)),
        }
    }

    /// File entries of a snapshot, ordered by path.
    pub fn files_of(&self, snapshot_id: &str) -> Result<Vec<FileEntry>, Error> {
        let guard = self.conn.lock().unwrap();

        if Self::get_snapshot_on(&guard, snapshot_id)?.is_none() {
            return Err(Error::SnapshotNotFound(snapshot_id.to_string()));
        }

        let mut chunk_lists: HashMap<i64, Vec<Digest>> = HashMap::new();
        {
            let mut query = guard.prepare(
                "SELECT fc.file_id, fc.digest
                   FROM file_chunks fc
                   JOIN files f ON f.file_id = fc.file_id
                  WHERE f.snapshot_id = ?1
                  ORDER BY fc.file_id, fc.chunk_index",
            )?;
            let rows = query.query_map([snapshot_id], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?;
            for row in rows {
                let (file_id, digest) = row?;
                chunk_lists
                    .entry(file_id)
                    .or_default()
                    .push(parse_digest(&digest)?);
            }
        }

        let mut query = guard.prepare(
            "SELECT file_id, snapshot_id, path, size, modified_time, file_digest
               FROM files WHERE snapshot_id = ?1 ORDER BY path",
        )?;
        let rows = query.query_map([snapshot_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (file_id, snapshot_id, path, size, modified_time, file_digest) = row?;
            entries.push(FileEntry {
                file_id,
                snapshot_id,
                path: RelativePath::new(&path)?,
                size,
                modified_time,
                file_digest: parse_digest(&file_digest)?,
                chunk_digests: chunk_lists.remove(&file_id).unwrap_or_default(),
            });
        }
        Ok(entries)
    }

    /// Case-insensitive substring search over recorded paths.
    ///
    /// Space-separated terms combine with AND; an empty query matches
    /// nothing.
    pub fn search_files(&self, query: &str) -> Result<Vec<FileEntry>, Error> {
        let terms: Vec<String> = query
            .split_whitespace()
            .map(|term| term.to_lowercase())
            .collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }

        let mut sql = String::from(
            "SELECT file_id, snapshot_id, path, size, modified_time, file_digest FROM files",
        );
        for index in 0..terms.len() {
            sql.push_str(if index == 0 { " WHERE " } else { " AND " });
            sql.push_str(&format!("instr(lower(path), ?{}) > 0", index + 1));
        }
        sql.push_str(" ORDER BY snapshot_id, path");

        let guard = self.conn.lock().unwrap();
        let mut query = guard.prepare(&sql)?;
        let rows = query.query_map(rusqlite::params_from_iter(terms.iter()), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, u64>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut matches = Vec::new();
        for row in rows {
            let (file_id, snapshot_id, path, size, modified_time, file_digest) = row?;
            let chunk_digests = Self::chunk_list_on(&guard, file_id)?;
            matches.push(FileEntry {
                file_id,
                snapshot_id,
                path: RelativePath::new(&path)?,
                size,
                modified_time,
                file_digest: parse_digest(&file_digest)?,
                chunk_digests,
            });
        }
        Ok(matches)
    }

    fn chunk_list_on(conn: &Connection, file_id: i64) -> Result<Vec<Digest>, Error> {
        let mut query = conn.prepare(
            "SELECT digest FROM file_chunks WHERE file_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = query.query_map([file_id], |row| row.get::<_, String>(0))?;
        let mut digests = Vec::new();
        for row in rows {
            digests.push(parse_digest(&row?)?);
        }
        Ok(digests)
    }

    /// Structural diff of two snapshots (see [`merkle::diff`]).
    pub fn compare(&self, snapshot_a: &str, snapshot_b: &str) -> Result<Vec<DiffEntry>, Error> {
        let files_a = self.files_of(snapshot_a)?;
        let files_b = self.files_of(snapshot_b)?;
        Ok(merkle::diff(&files_a, &files_b))
    }

    /// Walk the parent chain back to a root.
    ///
    /// False when a link is missing or the walk revisits a snapshot.
    pub fn validate_chain(&self, snapshot_id: &str) -> Result<bool, Error> {
        let guard = self.conn.lock().unwrap();

        let mut current = match Self::get_snapshot_on(&guard, snapshot_id)? {
            None => return Err(Error::SnapshotNotFound(snapshot_id.to_string())),
            Some(snapshot) => snapshot,
        };

        let mut visited = std::collections::HashSet::new();
        visited.insert(current.snapshot_id.clone());

        while let Some(parent_id) = current.parent_id.clone() {
            if !visited.insert(parent_id.clone()) {
                return Ok(false); // cycle
            }
            match Self::get_snapshot_on(&guard, &parent_id)? {
                None => return Ok(false), // broken link
                Some(parent) => current = parent,
            }
        }

        Ok(true)
    }

    /// Ids of snapshots whose parent is `snapshot_id`.
    pub fn children_of(&self, snapshot_id: &str) -> Result<Vec<String>, Error> {
        let guard = self.conn.lock().unwrap();
        Self::children_on(&guard, snapshot_id)
    }

    fn children_on(conn: &Connection, snapshot_id: &str) -> Result<Vec<String>, Error> {
        let mut query =
            conn.prepare("SELECT snapshot_id FROM snapshots WHERE parent_id = ?1")?;
        let rows = query.query_map([snapshot_id], |row| row.get::<_, String>(0))?;
        let mut children = Vec::new();
        for row in rows {
            children.push(row?);
        }
        Ok(children)
    }

    /// Delete a snapshot, dropping one reference per recorded chunk.
    ///
    /// Refused while other snapshots name this one as parent, unless
    /// `cascade` deletes the whole subtree (leaf-first). Returns the
    /// deleted ids.
    pub fn delete_snapshot(
        &self,
        store: &ChunkStore,
        snapshot_id: &str,
        cascade: bool,
    ) -> Result<Vec<String>, Error> {
        let guard = self.conn.lock().unwrap();
        let tx = guard.unchecked_transaction()?;

        if Self::get_snapshot_on(&tx, snapshot_id)?.is_none() {
            return Err(Error::SnapshotNotFound(snapshot_id.to_string()));
        }

        let children = Self::children_on(&tx, snapshot_id)?;
        if !children.is_empty() && !cascade {
            return Err(Error::Invariant(format!(
                "snapshot '{snapshot_id}' has dependent snapshots ({})",
                children.join(", ")
            )));
        }

        // post-order: children before parents
        let mut order = Vec::new();
        let mut stack = vec![(snapshot_id.to_string(), false)];
        while let Some((id, expanded)) = stack.pop() {
            if expanded {
                order.push(id);
                continue;
            }
            stack.push((id.clone(), true));
            for child in Self::children_on(&tx, &id)? {
                stack.push((child, false));
            }
        }

        for id in &order {
            Self::delete_one_in_tx(&tx, store, id)?;
        }

        tx.commit()?;
        Ok(order)
    }

    /// Delete a snapshot and attach its children to its parent.
    ///
    /// Used by retention pruning, where surviving descendants must keep
    /// a valid chain while ancestors disappear.
    pub fn delete_snapshot_reparent(
        &self,
        store: &ChunkStore,
        snapshot_id: &str,
    ) -> Result<(), Error> {
        let guard = self.conn.lock().unwrap();
        let tx = guard.unchecked_transaction()?;

        let snapshot = match Self::get_snapshot_on(&tx, snapshot_id)? {
            None => return Err(Error::SnapshotNotFound(snapshot_id.to_string())),
            Some(snapshot) => snapshot,
        };

        tx.execute(
            "UPDATE snapshots SET parent_id = ?2 WHERE parent_id = ?1",
            rusqlite::params![snapshot_id, snapshot.parent_id],
        )?;

        Self::delete_one_in_tx(&tx, store, snapshot_id)?;

        tx.commit()?;
        Ok(())
    }

    fn delete_one_in_tx(
        tx: &Transaction,
        store: &ChunkStore,
        snapshot_id: &str,
    ) -> Result<(), Error> {
        let mut digests = Vec::new();
        {
            let mut query = tx.prepare(
                "SELECT fc.digest
                   FROM file_chunks fc
                   JOIN files f ON f.file_id = fc.file_id
                  WHERE f.snapshot_id = ?1",
            )?;
            let rows = query.query_map([snapshot_id], |row| row.get::<_, String>(0))?;
            for row in rows {
                digests.push(parse_digest(&row?)?);
            }
        }

        for digest in &digests {
            store.reference_in_tx(tx, digest, -1)?;
        }

        tx.execute(
            "DELETE FROM file_chunks WHERE file_id IN
                 (SELECT file_id FROM files WHERE snapshot_id = ?1)",
            [snapshot_id],
        )?;
        tx.execute("DELETE FROM files WHERE snapshot_id = ?1", [snapshot_id])?;
        tx.execute(
            "DELETE FROM snapshots WHERE snapshot_id = ?1",
            [snapshot_id],
        )?;

        Ok(())
    }

    /// Drop unfinished snapshots left behind by a crash or cancel.
    ///
    /// Runs at repository open; per-file recording is transactional, so
    /// dropping the rows compensates every reference the partial backup
    /// took.
    pub fn remove_unfinished(&self, store: &ChunkStore) -> Result<u64, Error> {
        let guard = self.conn.lock().unwrap();
        let tx = guard.unchecked_transaction()?;

        let mut stale = Vec::new();
        {
            let mut query =
                tx.prepare("SELECT snapshot_id FROM snapshots WHERE finished = 0")?;
            let rows = query.query_map([], |row| row.get::<_, String>(0))?;
            for row in rows {
                stale.push(row?);
            }
        }

        for snapshot_id in &stale {
            log::warn!("removing unfinished snapshot '{snapshot_id}'");
            Self::delete_one_in_tx(&tx, store, snapshot_id)?;
        }

        tx.commit()?;
        Ok(stale.len() as u64)
    }

    /// Import a complete snapshot received from a transfer peer.
    ///
    /// Idempotent on the snapshot id. All referenced chunks must
    /// already be present in the store.
    pub fn import_snapshot(
        &self,
        store: &ChunkStore,
        snapshot: &Snapshot,
        files: &[FileEntry],
    ) -> Result<bool, Error> {
        let guard = self.conn.lock().unwrap();
        let tx = guard.unchecked_transaction()?;

        if Self::get_snapshot_on(&tx, &snapshot.snapshot_id)?.is_some() {
            return Ok(false);
        }

        tx.execute(
            "INSERT INTO snapshots
                 (snapshot_id, name, description, created_at, parent_id,
                  source_root, chunk_size, total_files, total_size,
                  snapshot_root, finished)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 1)",
            rusqlite::params![
                snapshot.snapshot_id,
                snapshot.name,
                snapshot.description,
                snapshot.created_at,
                snapshot.parent_id,
                snapshot.source_root,
                snapshot.chunk_size,
                snapshot.total_files,
                snapshot.total_size,
                snapshot.snapshot_root.as_ref().map(|root| root.to_hex()),
            ],
        )?;

        for entry in files {
            let entry = FileEntry {
                snapshot_id: snapshot.snapshot_id.clone(),
                ..entry.clone()
            };
            Self::insert_file_in_tx(&tx, store, &entry)?;
        }

        tx.commit()?;
        Ok(true)
    }

    /// Flush the write-ahead log into the database file.
    pub fn checkpoint(&self) -> Result<(), Error> {
        let guard = self.conn.lock().unwrap();
        guard.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }

    fn row_to_snapshot(
        row: &rusqlite::Row,
    ) -> Result<Result<Snapshot, Error>, rusqlite::Error> {
        let snapshot_root: Option<String> = row.get(9)?;
        let snapshot = Snapshot {
            snapshot_id: row.get(0)?,
            name: row.get(1)?,
            description: row.get(2)?,
            created_at: row.get(3)?,
            parent_id: row.get(4)?,
            source_root: row.get(5)?,
            chunk_size: row.get(6)?,
            total_files: row.get(7)?,
            total_size: row.get(8)?,
            snapshot_root: None,
            finished: row.get(10)?,
        };
        Ok(match snapshot_root {
            None => Ok(snapshot),
            Some(root) => parse_digest(&root).map(|root| Snapshot {
                snapshot_root: Some(root),
                ..snapshot
            }),
        })
    }
}

const SNAPSHOT_SELECT: &str = "SELECT snapshot_id, name, description, created_at, parent_id,
        source_root, chunk_size, total_files, total_size, snapshot_root, finished
   FROM snapshots";

#[cfg(test)]
mod test {
    use super::*;
    use crate::hasher;

    fn test_repo() -> (tempfile::TempDir, ChunkStore, Catalog) {
        let dir = tempfile::tempdir().unwrap();
        let conn = Catalog::open_db(&dir.path().join("catalog.db")).unwrap();
        let store = ChunkStore::create(dir.path().to_path_buf(), conn.clone(), true).unwrap();
        let catalog = Catalog::open(conn).unwrap();
        (dir, store, catalog)
    }

    fn new_snapshot(parent_id: Option<String>) -> NewSnapshot {
        NewSnapshot {
            name: "test".into(),
            description: None,
            source_root: "/data".into(),
            parent_id,
            chunk_size: 65536,
        }
    }

    fn record(
        store: &ChunkStore,
        catalog: &Catalog,
        snapshot_id: &str,
        path: &str,
        content: &[u8],
    ) -> FileEntry {
        let (digest, _, _) = store.insert_chunk(content).unwrap();
        let chunk_digests = vec![digest];
        let mut entry = FileEntry {
            file_id: 0,
            snapshot_id: snapshot_id.to_string(),
            path: RelativePath::new(path).unwrap(),
            size: content.len() as u64,
            modified_time: 0,
            file_digest: merkle::file_digest(&chunk_digests),
            chunk_digests,
        };
        entry.file_id = catalog.record_file(store, &entry).unwrap();
        entry
    }

    fn commit(catalog: &Catalog, snapshot_id: &str, entries: &[FileEntry]) {
        let root = merkle::snapshot_root_of(entries);
        let total_size = entries.iter().map(|entry| entry.size).sum();
        catalog
            .finalize_snapshot(snapshot_id, &root, entries.len() as u64, total_size)
            .unwrap();
    }

    #[test]
    fn record_file_references_chunks() {
        let (_dir, store, catalog) = test_repo();
        let snapshot = catalog.create_snapshot(new_snapshot(None)).unwrap();
        let entry = record(&store, &catalog, &snapshot.snapshot_id, "a.txt", b"hello");

        assert_eq!(store.refcount(&entry.chunk_digests[0]).unwrap(), Some(1));
        assert_eq!(store.total_references().unwrap(), 1);

        commit(&catalog, &snapshot.snapshot_id, &[entry.clone()]);

        let files = catalog.files_of(&snapshot.snapshot_id).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].path.as_str(), "a.txt");
        assert_eq!(files[0].chunk_digests, entry.chunk_digests);
    }

    #[test]
    fn record_file_rolls_back_references_on_error() {
        let (_dir, store, catalog) = test_repo();
        let snapshot = catalog.create_snapshot(new_snapshot(None)).unwrap();

        let (known, _, _) = store.insert_chunk(b"known chunk").unwrap();
        let missing = hasher::hash(b"never inserted");
        let chunk_digests = vec![known, missing];
        let entry = FileEntry {
            file_id: 0,
            snapshot_id: snapshot.snapshot_id.clone(),
            path: RelativePath::new("broken.bin").unwrap(),
            size: 2,
            modified_time: 0,
            file_digest: merkle::file_digest(&chunk_digests),
            chunk_digests,
        };

        assert!(matches!(
            catalog.record_file(&store, &entry),
            Err(Error::ChunkNotFound(_))
        ));
        // the reference taken on the known chunk was rolled back
        assert_eq!(store.refcount(&known).unwrap(), Some(0));
        assert!(catalog.files_of(&snapshot.snapshot_id).unwrap().is_empty());
    }

    #[test]
    fn list_snapshots_newest_first() {
        let (_dir, store, catalog) = test_repo();
        let first = catalog.create_snapshot(new_snapshot(None)).unwrap();
        commit(&catalog, &first.snapshot_id, &[]);
        let second = catalog
            .create_snapshot(new_snapshot(Some(first.snapshot_id.clone())))
            .unwrap();
        commit(&catalog, &second.snapshot_id, &[]);
        let _ = store;

        let list = catalog.list_snapshots().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].snapshot_id, second.snapshot_id);
        assert_eq!(list[1].snapshot_id, first.snapshot_id);
        assert_eq!(list[0].parent_id.as_deref(), Some(&*first.snapshot_id));
    }

    #[test]
    fn latest_snapshot_for_root_ignores_other_roots() {
        let (_dir, _store, catalog) = test_repo();
        let snapshot = catalog.create_snapshot(new_snapshot(None)).unwrap();
        commit(&catalog, &snapshot.snapshot_id, &[]);

        let found = catalog.latest_snapshot_for_root("/data").unwrap();
        assert_eq!(found.unwrap().snapshot_id, snapshot.snapshot_id);
        assert!(catalog.latest_snapshot_for_root("/other").unwrap().is_none());
    }

    #[test]
    fn unfinished_snapshots_are_invisible_and_removed() {
        let (_dir, store, catalog) = test_repo();
        let stale = catalog.create_snapshot(new_snapshot(None)).unwrap();
        let entry = record(&store, &catalog, &stale.snapshot_id, "tmp.bin", b"partial");

        assert!(catalog.list_snapshots().unwrap().is_empty());
        assert_eq!(store.refcount(&entry.chunk_digests[0]).unwrap(), Some(1));

        assert_eq!(catalog.remove_unfinished(&store).unwrap(), 1);
        assert_eq!(store.refcount(&entry.chunk_digests[0]).unwrap(), Some(0));
        assert!(catalog.get_snapshot(&stale.snapshot_id).unwrap().is_none());
    }

    #[test]
    fn search_files_substring_and_terms() {
        let (_dir, store, catalog) = test_repo();
        let snapshot = catalog.create_snapshot(new_snapshot(None)).unwrap();
        let entries = vec![
            record(&store, &catalog, &snapshot.snapshot_id, "docs/Report.txt", b"a"),
            record(&store, &catalog, &snapshot.snapshot_id, "docs/notes.md", b"b"),
            record(&store, &catalog, &snapshot.snapshot_id, "src/report_gen.rs", b"c"),
        ];
        commit(&catalog, &snapshot.snapshot_id, &entries);

        let hits = catalog.search_files("report").unwrap();
        assert_eq!(hits.len(), 2);

        let hits = catalog.search_files("report docs").unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path.as_str(), "docs/Report.txt");

        assert!(catalog.search_files("missing").unwrap().is_empty());
        assert!(catalog.search_files("").unwrap().is_empty());
    }

    #[test]
    fn delete_refused_with_children_then_cascades() {
        let (_dir, store, catalog) = test_repo();
        let parent = catalog.create_snapshot(new_snapshot(None)).unwrap();
        let entry = record(&store, &catalog, &parent.snapshot_id, "a.txt", b"shared");
        commit(&catalog, &parent.snapshot_id, &[entry.clone()]);

        let child = catalog
            .create_snapshot(new_snapshot(Some(parent.snapshot_id.clone())))
            .unwrap();
        let child_entry = record(&store, &catalog, &child.snapshot_id, "a.txt", b"shared");
        commit(&catalog, &child.snapshot_id, &[child_entry]);

        assert!(matches!(
            catalog.delete_snapshot(&store, &parent.snapshot_id, false),
            Err(Error::Invariant(_))
        ));

        let deleted = catalog
            .delete_snapshot(&store, &parent.snapshot_id, true)
            .unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(deleted[0], child.snapshot_id); // leaf first
        assert_eq!(store.refcount(&entry.chunk_digests[0]).unwrap(), Some(0));
    }

    #[test]
    fn reparent_keeps_chain_valid() {
        let (_dir, store, catalog) = test_repo();
        let first = catalog.create_snapshot(new_snapshot(None)).unwrap();
        commit(&catalog, &first.snapshot_id, &[]);
        let second = catalog
            .create_snapshot(new_snapshot(Some(first.snapshot_id.clone())))
            .unwrap();
        commit(&catalog, &second.snapshot_id, &[]);
        let third = catalog
            .create_snapshot(new_snapshot(Some(second.snapshot_id.clone())))
            .unwrap();
        commit(&catalog, &third.snapshot_id, &[]);

        catalog
            .delete_snapshot_reparent(&store, &second.snapshot_id)
            .unwrap();

        let third = catalog.get_snapshot(&third.snapshot_id).unwrap().unwrap();
        assert_eq!(third.parent_id.as_deref(), Some(&*first.snapshot_id));
        assert!(catalog.validate_chain(&third.snapshot_id).unwrap());
    }

    #[test]
    fn validate_chain_detects_broken_links() {
        let (_dir, store, catalog) = test_repo();
        let first = catalog.create_snapshot(new_snapshot(None)).unwrap();
        commit(&catalog, &first.snapshot_id, &[]);
        let second = catalog
            .create_snapshot(new_snapshot(Some(first.snapshot_id.clone())))
            .unwrap();
        commit(&catalog, &second.snapshot_id, &[]);

        assert!(catalog.validate_chain(&second.snapshot_id).unwrap());

        // break the chain behind the catalog's back
        {
            let guard = catalog.conn.lock().unwrap();
            guard
                .execute(
                    "DELETE FROM snapshots WHERE snapshot_id = ?1",
                    [&first.snapshot_id],
                )
                .unwrap();
        }
        let _ = store;

        assert!(!catalog.validate_chain(&second.snapshot_id).unwrap());
        assert!(matches!(
            catalog.validate_chain("missing"),
            Err(Error::SnapshotNotFound(_))
        ));
    }

    #[test]
    fn compare_delegates_to_merkle_diff() {
        let (_dir, store, catalog) = test_repo();
        let first = catalog.create_snapshot(new_snapshot(None)).unwrap();
        let entries = vec![
            record(&store, &catalog, &first.snapshot_id, "a.txt", b"one"),
            record(&store, &catalog, &first.snapshot_id, "b.txt", b"two"),
        ];
        commit(&catalog, &first.snapshot_id, &entries);

        let second = catalog
            .create_snapshot(new_snapshot(Some(first.snapshot_id.clone())))
            .unwrap();
        let entries = vec![
            record(&store, &catalog, &second.snapshot_id, "a.txt", b"ONE"),
            record(&store, &catalog, &second.snapshot_id, "b.txt", b"two"),
        ];
        commit(&catalog, &second.snapshot_id, &entries);

        let changes = catalog
            .compare(&first.snapshot_id, &second.snapshot_id)
            .unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "a.txt");
        assert_eq!(changes[0].kind, skp_api_types::DiffKind::Modified);
    }

    #[test]
    fn import_snapshot_is_idempotent() {
        let (_dir, store, catalog) = test_repo();
        let snapshot = catalog.create_snapshot(new_snapshot(None)).unwrap();
        let entries = vec![record(
            &store,
            &catalog,
            &snapshot.snapshot_id,
            "a.txt",
            b"payload",
        )];
        commit(&catalog, &snapshot.snapshot_id, &entries);
        let snapshot = catalog
            .get_snapshot(&snapshot.snapshot_id)
            .unwrap()
            .unwrap();

        // import into a second repository sharing no state
        let (_dir2, store2, catalog2) = test_repo();
        store2.insert_chunk(b"payload").unwrap();

        assert!(catalog2.import_snapshot(&store2, &snapshot, &entries).unwrap());
        assert!(!catalog2.import_snapshot(&store2, &snapshot, &entries).unwrap());

        let imported = catalog2.files_of(&snapshot.snapshot_id).unwrap();
        assert_eq!(imported.len(), 1);
        assert_eq!(store2.refcount(&entries[0].chunk_digests[0]).unwrap(), Some(1));
    }
}
